//! Listener: one dedicated OS thread accepting clients (spec.md §4.3).
//!
//! `linkerd-tcp`'s own accept loop (`server/serving.rs`) is reactor-driven
//! (an `Incoming` stream); this one is a blocking
//! `std::net::TcpListener::accept` loop instead, per spec.md §5's call-out
//! that the listener's accept point is a dedicated thread independent of
//! the Pool's reactors. The accepted socket is handed to the Pool still
//! unregistered with any reactor — `pool::conn::Connection::new` registers
//! it from inside the chosen worker's own thread.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use addr::fnv1a_addr_hash;
use error::Result;
use pool::conn::ConnRequest;
use pool::Pool;
use router::Router;

pub struct Listener {
    listener: TcpListener,
    router: Router,
    pool: Arc<Pool>,
    terminate: Arc<AtomicBool>,
}

impl Listener {
    pub fn bind(addr: ::std::net::SocketAddr, router: Router, pool: Arc<Pool>, terminate: Arc<AtomicBool>) -> Result<Listener> {
        let listener = TcpListener::bind(addr)?;
        // A read timeout on accept() doesn't exist for TcpListener directly;
        // non-blocking mode plus a short sleep gives the same
        // shutdown-within-~1s contract spec.md §5 requires.
        listener.set_nonblocking(true)?;
        Ok(Listener { listener, router, pool, terminate })
    }

    pub fn local_addr(&self) -> ::std::net::SocketAddr {
        self.listener
            .local_addr()
            .expect("a bound TcpListener always has a local address")
    }

    pub fn run(&self) {
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                info!("listener shutting down");
                return;
            }
            match self.listener.accept() {
                Ok((client, client_addr)) => self.handle_client(client, client_addr),
                Err(ref e) if e.kind() == ::std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
    }

    fn handle_client(&self, client: ::std::net::TcpStream, client_addr: ::std::net::SocketAddr) {
        if let Err(e) = client.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY on {}: {}", client_addr, e);
        }
        let hint = fnv1a_addr_hash(&client_addr.ip());
        let server_addr = match self.router.connect(hint) {
            Ok(addr) => addr,
            Err(e) => {
                debug!("no destination available for {}: {}", client_addr, e);
                drop(client);
                return;
            }
        };

        let req = ConnRequest { client, client_addr, server_addr, hint };
        if let Err(e) = self.pool.add_conn(req) {
            warn!("pool rejected connection from {}: {}", client_addr, e);
            self.router.disconnect(server_addr, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    use addr::Destination;
    use router::{Policy, RouterConfig};

    fn spawn_echo_backend() -> ::std::net::SocketAddr {
        let backend = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = backend.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut sock, _)) = backend.accept() {
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

    #[test]
    fn accept_loop_routes_client_to_backend() {
        let backend = spawn_echo_backend();
        let cfg = RouterConfig {
            policy: Policy::Single,
            max_conn: 100,
            ..RouterConfig::default()
        };
        let router = Router::new(cfg, vec![Destination::new(backend, 1.0)]);
        let pool = Arc::new(Pool::new(1, 4096, router.clone()));
        let terminate = Arc::new(AtomicBool::new(false));
        let listener = Arc::new(
            Listener::bind("127.0.0.1:0".parse().unwrap(), router, pool.clone(), terminate.clone()).unwrap(),
        );
        let addr = listener.local_addr();

        let run_handle = {
            let listener = listener.clone();
            thread::spawn(move || listener.run())
        };

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        terminate.store(true, Ordering::Relaxed);
        run_handle.join().unwrap();
        pool.shutdown();
    }

    #[test]
    fn shuts_down_without_accepting_when_terminate_is_already_set() {
        let cfg = RouterConfig::default();
        let router = Router::new(cfg, vec![]);
        let pool = Arc::new(Pool::new(1, 4096, router.clone()));
        let terminate = Arc::new(AtomicBool::new(true));
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), router, pool.clone(), terminate).unwrap();

        listener.run();
        pool.shutdown();
    }
}
