//! Pool worker control channel (spec.md §4.2 "Control channel").
//!
//! `linkerd-tcp` has no cross-thread control plane to model this on — its
//! reactors only ever talk to themselves — so the rendezvous here is
//! grounded on `driver.rs`'s request/acknowledgment shape (send, then wait
//! for completion) adapted from an in-reactor `Sink`/`Stream` pairing to a
//! `std::sync::mpsc` handshake that can cross an OS thread boundary: the
//! caller blocks on `ack_rx.recv()`, giving exactly the synchronous
//! rendezvous spec.md calls `pool_send_ctl`.

use std::net::SocketAddr;
use std::sync::mpsc;

use pool::conn::ConnRequest;
use pool::stats::Stats;

pub enum CtlMsg {
    AddConn(ConnRequest, mpsc::SyncSender<()>),
    DropDst(SocketAddr, mpsc::SyncSender<()>),
    Stats(mpsc::SyncSender<Stats>),
    Shutdown(mpsc::SyncSender<()>),
}

/// Blocks the calling thread until the worker has processed the message.
pub fn rendezvous_unit() -> (mpsc::SyncSender<()>, mpsc::Receiver<()>) {
    mpsc::sync_channel(0)
}
