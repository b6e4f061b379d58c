//! Per-connection state machine (spec.md §3 "Connection record", §4.2
//! "Worker state machine").
//!
//! The byte-copy loop is `connection/half_duplex.rs`'s poll loop, adapted
//! from its `Connection<Ctx>`/rustls-aware socket type to a plain
//! `tokio_core::net::TcpStream`: read into a shared transfer buffer, try an
//! immediate write, stash unwritten bytes in `pending` on `WouldBlock`, and
//! half-shutdown the peer on EOF. `connection/duplex.rs` is the model for
//! joining the two directions into one future. The `SERVER_INCOMPLETE`
//! connect-then-failover transition has no `linkerd-tcp` analogue (it
//! always resolves a destination before connecting) and is grounded
//! directly on spec.md §4.2 plus `original_source/src/glb_pool.c`'s
//! connect/re-connect handling.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::rc::Rc;

use futures::{Async, Future, Poll};
use futures::sync::oneshot;
use tokio_core::net::{TcpStream, TcpStreamNew};
use tokio_core::reactor::Handle;
use tokio_io::AsyncWrite;

use pool::stats::Stats;
use router::Router;

/// Handed from the Listener to a chosen worker via `ADD_CONN`.
pub struct ConnRequest {
    pub client: StdTcpStream,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub hint: u32,
}

/// Kept in the worker's route map so `DROP_DST` and `SHUTDOWN` can reach
/// a running connection: `addr` tracks whichever server address the
/// connection is currently using (updated across a `SERVER_INCOMPLETE`
/// failover), and dropping `kill` unblocks the connection's `poll` with a
/// forced teardown.
pub struct ConnHandle {
    pub addr: Rc<Cell<SocketAddr>>,
    pub kill: oneshot::Sender<()>,
}

/// Drives one client↔server pipe to completion: asynchronous connect
/// (with failover via `choose_dst_again`) followed by a bidirectional
/// byte copy.
pub struct Connection {
    state: State,
    client_addr: SocketAddr,
    hint: u32,
    router: Router,
    buf: Rc<RefCell<Vec<u8>>>,
    stats: Rc<RefCell<Stats>>,
    handle: Handle,
    current_addr: Rc<Cell<SocketAddr>>,
    kill: oneshot::Receiver<()>,
}

enum State {
    /// SERVER_INCOMPLETE: waiting for the async connect to resolve.
    Connecting { client: TcpStream, fut: TcpStreamNew },
    /// CLIENT / SERVER_COMPLETE: duplex byte copy in progress.
    Duplexing(Duplex),
    Done,
}

impl Connection {
    /// Builds the connection future and the handle its owning worker
    /// keeps in the route map.
    pub fn new(
        req: ConnRequest,
        router: Router,
        buf: Rc<RefCell<Vec<u8>>>,
        stats: Rc<RefCell<Stats>>,
        handle: Handle,
    ) -> io::Result<(Connection, ConnHandle)> {
        let client_addr = req.client_addr;
        let server_addr = req.server_addr;
        let client = TcpStream::from_stream(req.client, &handle)?;
        let fut = TcpStream::connect(&server_addr, &handle);
        stats.borrow_mut().conns_opened += 1;
        stats.borrow_mut().n_conns += 1;

        let current_addr = Rc::new(Cell::new(server_addr));
        let (kill_tx, kill_rx) = oneshot::channel();

        let conn = Connection {
            state: State::Connecting { client, fut },
            client_addr,
            hint: req.hint,
            router,
            buf,
            stats,
            handle,
            current_addr: current_addr.clone(),
            kill: kill_rx,
        };
        Ok((conn, ConnHandle { addr: current_addr, kill: kill_tx }))
    }
}

impl Future for Connection {
    type Item = ();
    type Error = io::Error;

    fn poll(&mut self) -> Poll<(), io::Error> {
        if let Ok(Async::Ready(())) = self.kill.poll() {
            self.router.disconnect(self.current_addr.get(), false);
            self.state = State::Done;
            return Ok(Async::Ready(()));
        }

        loop {
            match ::std::mem::replace(&mut self.state, State::Done) {
                State::Connecting { client, mut fut } => {
                    // A non-blocking connect's failure (e.g. ECONNREFUSED)
                    // surfaces here as a poll error, standing in for the
                    // raw SO_ERROR inspection a manual event loop would do
                    // on the first writable wakeup.
                    match fut.poll() {
                        Ok(Async::NotReady) => {
                            self.state = State::Connecting { client, fut };
                            return Ok(Async::NotReady);
                        }
                        Ok(Async::Ready(server)) => {
                            self.state = State::Duplexing(Duplex::new(
                                client,
                                server,
                                self.buf.clone(),
                                self.stats.clone(),
                            ));
                        }
                        Err(_) => {
                            match self.router.choose_dst_again(self.hint, self.current_addr.get()) {
                                Ok(next_addr) => {
                                    self.current_addr.set(next_addr);
                                    let fut = TcpStream::connect(&next_addr, &self.handle);
                                    self.state = State::Connecting { client, fut };
                                }
                                Err(e) => {
                                    self.state = State::Done;
                                    return Err(e.into());
                                }
                            }
                        }
                    }
                }
                State::Duplexing(mut d) => {
                    match d.poll()? {
                        Async::Ready(()) => {
                            self.router.disconnect(self.current_addr.get(), false);
                            self.state = State::Done;
                            return Ok(Async::Ready(()));
                        }
                        Async::NotReady => {
                            self.state = State::Duplexing(d);
                            return Ok(Async::NotReady);
                        }
                    }
                }
                State::Done => return Ok(Async::Ready(())),
            }
        }
    }
}

/// Joins a client socket and a server socket into one bidirectional copy,
/// mirroring `connection/duplex.rs`.
pub struct Duplex {
    client: Rc<RefCell<TcpStream>>,
    server: Rc<RefCell<TcpStream>>,
    to_server: Option<HalfDuplex>,
    to_client: Option<HalfDuplex>,
}

impl Duplex {
    pub fn new(
        client: TcpStream,
        server: TcpStream,
        buf: Rc<RefCell<Vec<u8>>>,
        stats: Rc<RefCell<Stats>>,
    ) -> Duplex {
        let client = Rc::new(RefCell::new(client));
        let server = Rc::new(RefCell::new(server));
        Duplex {
            to_server: Some(HalfDuplex::new(client.clone(), server.clone(), buf.clone(), stats.clone())),
            to_client: Some(HalfDuplex::new(server.clone(), client.clone(), buf, stats)),
            client,
            server,
        }
    }
}

impl Future for Duplex {
    type Item = ();
    type Error = io::Error;

    fn poll(&mut self) -> Poll<(), io::Error> {
        if let Some(mut half) = self.to_server.take() {
            match half.poll()? {
                Async::Ready(_) => {}
                Async::NotReady => self.to_server = Some(half),
            }
        }
        if let Some(mut half) = self.to_client.take() {
            match half.poll()? {
                Async::Ready(_) => {}
                Async::NotReady => self.to_client = Some(half),
            }
        }
        if self.to_server.is_none() && self.to_client.is_none() {
            Ok(Async::Ready(()))
        } else {
            Ok(Async::NotReady)
        }
    }
}

/// One direction of a `Duplex`: reads from `reader` into a shared transfer
/// buffer, writes into `writer`, retrying unwritten bytes via `pending`.
pub struct HalfDuplex {
    reader: Rc<RefCell<TcpStream>>,
    writer: Rc<RefCell<TcpStream>>,
    buf: Rc<RefCell<Vec<u8>>>,
    stats: Rc<RefCell<Stats>>,
    pending: Option<Vec<u8>>,
    bytes_total: usize,
    should_shutdown: bool,
}

impl HalfDuplex {
    fn new(
        reader: Rc<RefCell<TcpStream>>,
        writer: Rc<RefCell<TcpStream>>,
        buf: Rc<RefCell<Vec<u8>>>,
        stats: Rc<RefCell<Stats>>,
    ) -> HalfDuplex {
        HalfDuplex {
            reader,
            writer,
            buf,
            stats,
            pending: None,
            bytes_total: 0,
            should_shutdown: false,
        }
    }
}

impl Future for HalfDuplex {
    type Item = usize;
    type Error = io::Error;

    fn poll(&mut self) -> Poll<usize, io::Error> {
        let mut writer = self.writer.borrow_mut();
        let mut reader = self.reader.borrow_mut();
        self.stats.borrow_mut().n_polls += 1;

        if self.should_shutdown {
            try_nb!(writer.shutdown());
            writer.shutdown(Shutdown::Write)?;
            return Ok(Async::Ready(self.bytes_total));
        }

        if let Some(mut pending) = self.pending.take() {
            while !pending.is_empty() {
                match writer.write(&pending) {
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.pending = Some(pending);
                        return Ok(Async::NotReady);
                    }
                    Err(e) => return Err(e),
                    Ok(wsz) => {
                        pending.drain(0..wsz);
                        self.bytes_total += wsz;
                        let mut s = self.stats.borrow_mut();
                        s.tx_bytes += wsz as u64;
                        s.send_bytes += wsz as u64;
                        s.n_send += 1;
                        s.poll_writes += 1;
                    }
                }
            }
        }

        loop {
            assert!(self.pending.is_none());

            let mut rbuf = self.buf.borrow_mut();
            let rsz = try_nb!(reader.read(&mut rbuf));
            {
                let mut s = self.stats.borrow_mut();
                s.rx_bytes += rsz as u64;
                s.recv_bytes += rsz as u64;
                s.n_recv += 1;
                s.poll_reads += 1;
            }
            if rsz == 0 {
                self.should_shutdown = true;
                try_nb!(writer.shutdown());
                writer.shutdown(Shutdown::Write)?;
                return Ok(Async::Ready(self.bytes_total));
            }

            let mut wbuf = &rbuf[..rsz];
            while !wbuf.is_empty() {
                match writer.write(wbuf) {
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let mut p = vec![0; wbuf.len()];
                        p.copy_from_slice(wbuf);
                        self.pending = Some(p);
                        return Ok(Async::NotReady);
                    }
                    Err(e) => return Err(e),
                    Ok(wsz) => {
                        self.bytes_total += wsz;
                        {
                            let mut s = self.stats.borrow_mut();
                            s.tx_bytes += wsz as u64;
                            s.send_bytes += wsz as u64;
                            s.n_send += 1;
                            s.poll_writes += 1;
                        }
                        wbuf = &wbuf[wsz..];
                    }
                }
            }
        }
    }
}
