//! The Connection Pool: N worker threads, each an independent reactor,
//! selected by least-active-connection-count for new work (spec.md §4.2).
//!
//! Grounded on `main.rs`'s one-thread-per-subsystem shape for the worker
//! pool itself, and on the Router's own handle/lock split for the "one
//! mutex held only to pick a worker" discipline spec.md §5 calls for.

pub mod conn;
pub mod ctl;
pub mod stats;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Mutex;

use error::{Error, Result};
use pool::conn::ConnRequest;
use pool::ctl::{rendezvous_unit, CtlMsg};
use pool::stats::{Stats, StatsClock};
use pool::worker::WorkerHandle;
use router::Router;

pub struct Pool {
    workers: Mutex<Vec<WorkerHandle>>,
    /// Elapsed-since-last-`getstat` clock, owned by the pool rather than
    /// any one worker since `getstat` reports one figure for the whole
    /// pool (spec.md §6).
    stats_clock: Mutex<StatsClock>,
}

impl Pool {
    pub fn new(n_workers: usize, buffer_size: usize, router: Router) -> Pool {
        let workers = (0..n_workers)
            .map(|id| worker::spawn(id, buffer_size, router.clone()))
            .collect();
        Pool {
            workers: Mutex::new(workers),
            stats_clock: Mutex::new(StatsClock::new()),
        }
    }

    /// Picks the worker with the smallest active-connection count
    /// (ties broken by first worker) and hands it the new connection.
    pub fn add_conn(&self, req: ConnRequest) -> Result<()> {
        let workers = self.workers.lock().unwrap();
        let worker = pick_least_loaded(&workers).ok_or_else(|| Error::config("pool has no workers"))?;
        let (ack_tx, ack_rx) = rendezvous_unit();
        worker.send(CtlMsg::AddConn(req, ack_tx));
        drop(workers);
        ack_rx.recv().map_err(|_| Error::config("pool worker vanished mid-request"))
    }

    /// Closes every connection currently routed to `addr` across all
    /// workers, without notifying the Router (the destination is already
    /// gone by the time this is called).
    pub fn drop_dst(&self, addr: SocketAddr) {
        let workers = self.workers.lock().unwrap();
        let mut acks = Vec::with_capacity(workers.len());
        for w in workers.iter() {
            let (ack_tx, ack_rx) = rendezvous_unit();
            w.send(CtlMsg::DropDst(addr, ack_tx));
            acks.push(ack_rx);
        }
        drop(workers);
        for ack in acks {
            let _ = ack.recv();
        }
    }

    /// Merges each worker's resettable counters and reports the elapsed
    /// time since the previous `getstat` call (spec.md §6).
    pub fn get_stats(&self) -> (Stats, f64) {
        let workers = self.workers.lock().unwrap();
        let mut total = Stats::default();
        let mut replies = Vec::with_capacity(workers.len());
        for w in workers.iter() {
            let (tx, rx) = ::std::sync::mpsc::sync_channel(0);
            w.send(CtlMsg::Stats(tx));
            replies.push(rx);
        }
        drop(workers);
        for rx in replies {
            if let Ok(s) = rx.recv() {
                total.merge(&s);
            }
        }
        let elapsed = self.stats_clock.lock().unwrap().take_elapsed();
        (total, elapsed)
    }

    pub fn shutdown(&self) {
        let workers = self.workers.lock().unwrap();
        let mut acks = Vec::with_capacity(workers.len());
        for w in workers.iter() {
            let (ack_tx, ack_rx) = rendezvous_unit();
            w.send(CtlMsg::Shutdown(ack_tx));
            acks.push(ack_rx);
        }
        drop(workers);
        for ack in acks {
            let _ = ack.recv();
        }
    }
}

fn pick_least_loaded(workers: &[WorkerHandle]) -> Option<&WorkerHandle> {
    workers.iter().min_by_key(|w| w.conn_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::thread;
    use std::time::Duration;

    use addr::Destination;
    use router::{Policy, RouterConfig};

    /// Accepts one connection and echoes whatever it reads until EOF.
    fn spawn_echo_backend() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut sock, _)) = listener.accept() {
                let mut buf = [0u8; 256];
                loop {
                    match sock.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    fn mk_pool(dst: SocketAddr) -> (Pool, Router) {
        let cfg = RouterConfig {
            policy: Policy::Single,
            max_conn: 100,
            ..RouterConfig::default()
        };
        let router = Router::new(cfg, vec![Destination::new(dst, 1.0)]);
        let pool = Pool::new(1, 4096, router.clone());
        (pool, router)
    }

    /// Stands in for the Listener's accept: a connected socket pair, the
    /// `accepted` half handed to the Pool as `ConnRequest.client`.
    fn connected_pair() -> (StdTcpStream, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = StdTcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (dialer, accepted)
    }

    #[test]
    fn add_conn_bridges_client_to_backend() {
        let backend = spawn_echo_backend();
        let (pool, _router) = mk_pool(backend);
        let (mut dialer, accepted) = connected_pair();
        let req = ConnRequest {
            client_addr: dialer.local_addr().unwrap(),
            client: accepted,
            server_addr: backend,
            hint: 0,
        };
        pool.add_conn(req).unwrap();

        dialer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        dialer.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        dialer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        pool.shutdown();
    }

    #[test]
    fn drop_dst_closes_routed_connections() {
        let backend = spawn_echo_backend();
        let (pool, _router) = mk_pool(backend);
        let (mut dialer, accepted) = connected_pair();
        let req = ConnRequest {
            client_addr: dialer.local_addr().unwrap(),
            client: accepted,
            server_addr: backend,
            hint: 0,
        };
        pool.add_conn(req).unwrap();
        thread::sleep(Duration::from_millis(50));

        pool.drop_dst(backend);

        dialer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        let n = dialer.read(&mut buf).unwrap();
        assert_eq!(n, 0, "expected EOF once drop_dst killed the connection");
    }

    #[test]
    fn drop_dst_follows_a_connection_through_failover() {
        // A closed port so the initial async connect is refused and the
        // connection fails over (`SERVER_INCOMPLETE`) to the live backend.
        let closed = {
            let probe = StdTcpListener::bind("127.0.0.1:0").unwrap();
            let addr = probe.local_addr().unwrap();
            drop(probe);
            addr
        };
        let backend = spawn_echo_backend();

        let cfg = RouterConfig {
            policy: Policy::Round,
            max_conn: 100,
            ..RouterConfig::default()
        };
        let router = Router::new(cfg, vec![Destination::new(closed, 1.0), Destination::new(backend, 1.0)]);
        let pool = Pool::new(1, 4096, router);

        let (mut dialer, accepted) = connected_pair();
        let req = ConnRequest {
            client_addr: dialer.local_addr().unwrap(),
            client: accepted,
            server_addr: closed,
            hint: 0,
        };
        pool.add_conn(req).unwrap();

        // Give the worker reactor time to see the refusal and fail over.
        thread::sleep(Duration::from_millis(200));

        // The connection is no longer filed under the address it started
        // on; dropping that stale destination must not touch it.
        pool.drop_dst(closed);
        dialer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        dialer.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        dialer
            .read_exact(&mut buf)
            .expect("connection should have survived drop_dst on its old, pre-failover address");
        assert_eq!(&buf, b"x");

        // Dropping the address it actually ended up on must reach it.
        pool.drop_dst(backend);
        dialer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf2 = [0u8; 1];
        let n = dialer.read(&mut buf2).unwrap();
        assert_eq!(n, 0, "expected EOF once drop_dst reached the connection on its post-failover address");

        pool.shutdown();
    }

    #[test]
    fn get_stats_merges_and_resets_counters() {
        let backend = spawn_echo_backend();
        let (pool, _router) = mk_pool(backend);
        let (mut dialer, accepted) = connected_pair();
        let req = ConnRequest {
            client_addr: dialer.local_addr().unwrap(),
            client: accepted,
            server_addr: backend,
            hint: 0,
        };
        pool.add_conn(req).unwrap();

        dialer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        dialer.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        dialer.read_exact(&mut buf).unwrap();

        let (stats, _elapsed) = pool.get_stats();
        assert!(stats.rx_bytes >= 5);
        assert!(stats.conns_opened >= 1);

        let (stats2, _) = pool.get_stats();
        assert_eq!(stats2.rx_bytes, 0, "getstat should reset the worker's counters");

        pool.shutdown();
    }

    #[test]
    fn add_conn_fails_once_no_worker_available() {
        let pool = Pool {
            workers: Mutex::new(Vec::new()),
            stats_clock: Mutex::new(StatsClock::new()),
        };
        let (_dialer, accepted) = connected_pair();
        let req = ConnRequest {
            client_addr: "127.0.0.1:1".parse().unwrap(),
            client: accepted,
            server_addr: "127.0.0.1:2".parse().unwrap(),
            hint: 0,
        };
        assert!(pool.add_conn(req).is_err());
    }
}
