//! One Pool worker thread: a `tokio_core::reactor::Core` (the mio-backed
//! multiplexor) driving the connections assigned to it, fed by a control
//! channel rendezvous (`pool::ctl`).
//!
//! Grounded on `main.rs`'s "one named OS thread per subsystem, each owning
//! its own `Core`" and on `app/mod.rs`'s pattern of constructing reactor-
//! bound state only from inside a closure that already has a `Handle` —
//! here the closure runs once at worker startup and owns the worker's
//! `Rc`-based state for the thread's whole lifetime, fed afterwards
//! through a `Send` channel rather than rebuilt per message.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use futures::{Future, Stream};
use futures::sync::mpsc;
use tokio_core::reactor::Core;

use pool::conn::{ConnHandle, Connection, ConnRequest};
use pool::ctl::CtlMsg;
use pool::stats::Stats;
use router::Router;

/// The Pool's handle to one worker, held in the shared worker registry
/// used for least-loaded selection (spec.md §4.2).
pub struct WorkerHandle {
    ctl: mpsc::UnboundedSender<CtlMsg>,
    conns: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn conn_count(&self) -> usize {
        self.conns.load(Ordering::Relaxed)
    }

    pub fn send(&self, msg: CtlMsg) {
        // The unsync sender only fails if the worker thread died; there is
        // no recovery at this layer beyond logging, since the caller is
        // already blocked on an ack it will now never receive.
        if self.ctl.unbounded_send(msg).is_err() {
            error!("pool worker control channel closed; worker thread is gone");
        }
    }
}

/// Spawns one worker thread running its own reactor and returns a handle
/// usable from any other thread.
pub fn spawn(id: usize, buffer_size: usize, router: Router) -> WorkerHandle {
    let (ctl_tx, ctl_rx) = mpsc::unbounded();
    let conns = Arc::new(AtomicUsize::new(0));
    let conns2 = conns.clone();

    thread::Builder::new()
        .name(format!("pool-worker-{}", id))
        .spawn(move || {
            let mut core = Core::new().expect("failed to start worker reactor");
            let handle = core.handle();
            let buf = Rc::new(RefCell::new(vec![0u8; buffer_size]));
            let stats = Rc::new(RefCell::new(Stats::default()));
            // Flat list rather than a map keyed by server address: a
            // connection's server can change under it after a
            // SERVER_INCOMPLETE failover (`conn.rs`'s `choose_dst_again`
            // path), and `ConnHandle.addr` is the live `Cell` shared with
            // the `Connection` itself, so it always reflects the current
            // server regardless of how it was filed.
            let route_map: Rc<RefCell<Vec<ConnHandle>>> = Rc::new(RefCell::new(Vec::new()));

            let driver = ctl_rx.for_each(move |msg| {
                match msg {
                    CtlMsg::AddConn(req, ack) => {
                        add_conn(req, &router, &handle, &buf, &stats, &conns2, &route_map);
                        let _ = ack.send(());
                    }
                    CtlMsg::DropDst(addr, ack) => {
                        let mut handles = route_map.borrow_mut();
                        let (dead, live): (Vec<_>, Vec<_>) =
                            handles.drain(..).partition(|h| h.addr.get() == addr);
                        *handles = live;
                        for h in dead {
                            let _ = h.kill.send(());
                        }
                        let _ = ack.send(());
                    }
                    CtlMsg::Stats(reply) => {
                        let snapshot = stats.borrow_mut().take();
                        let _ = reply.send(snapshot);
                    }
                    CtlMsg::Shutdown(ack) => {
                        for h in route_map.borrow_mut().drain(..) {
                            let _ = h.kill.send(());
                        }
                        let _ = ack.send(());
                    }
                }
                Ok(())
            });
            let _ = core.run(driver);
        })
        .expect("failed to spawn pool worker thread");

    WorkerHandle { ctl: ctl_tx, conns }
}

fn add_conn(
    req: ConnRequest,
    router: &Router,
    handle: &::tokio_core::reactor::Handle,
    buf: &Rc<RefCell<Vec<u8>>>,
    stats: &Rc<RefCell<Stats>>,
    conns: &Arc<AtomicUsize>,
    route_map: &Rc<RefCell<Vec<ConnHandle>>>,
) {
    match Connection::new(req, router.clone(), buf.clone(), stats.clone(), handle.clone()) {
        Ok((conn, conn_handle)) => {
            route_map.borrow_mut().push(conn_handle);
            conns.fetch_add(1, Ordering::Relaxed);
            let conns2 = conns.clone();
            let route_map2 = route_map.clone();
            let stats2 = stats.clone();
            handle.spawn(conn.then(move |res| {
                if let Err(e) = res {
                    debug!("connection ended with error: {}", e);
                }
                stats2.borrow_mut().conns_closed += 1;
                conns2.fetch_sub(1, Ordering::Relaxed);
                route_map2.borrow_mut().retain(|h| !h.kill.is_canceled());
                Ok(())
            }));
        }
        Err(e) => {
            warn!("failed to register accepted connection with worker reactor: {}", e);
        }
    }
}
