//! TCP control front end: one thread accepting clients (bounded
//! concurrency), one thread per connected client serving request/response
//! lines (spec.md §4.5).
//!
//! The original multiplexes up to `max_clients` fds in a single poll loop;
//! here each accepted client gets its own blocking thread instead, the
//! same accept-thread-plus-worker-thread shape `listener.rs` uses for the
//! data path. `max_clients` is enforced by an atomic counter rather than a
//! shared fd set.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use control::{handle_line, Context};

pub struct TcpControl {
    listener: TcpListener,
    ctx: Context,
    max_clients: usize,
    clients: Arc<AtomicUsize>,
    terminate: Arc<AtomicBool>,
}

impl TcpControl {
    pub fn bind(addr: SocketAddr, ctx: Context, max_clients: usize, terminate: Arc<AtomicBool>) -> ::std::io::Result<TcpControl> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TcpControl {
            listener,
            ctx,
            max_clients,
            clients: Arc::new(AtomicUsize::new(0)),
            terminate,
        })
    }

    pub fn run(&self) {
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                info!("control: tcp thread shutting down");
                return;
            }
            if self.clients.load(Ordering::Relaxed) >= self.max_clients {
                thread::sleep(Duration::from_millis(200));
                continue;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_client(stream, peer),
                Err(ref e) if e.kind() == ::std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => warn!("control: accept failed: {}", e),
            }
        }
    }

    fn spawn_client(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = self.ctx.clone();
        let clients = self.clients.clone();
        clients.fetch_add(1, Ordering::Relaxed);
        thread::spawn(move || {
            serve_client(&ctx, stream, peer);
            clients.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

fn serve_client(ctx: &Context, stream: TcpStream, peer: SocketAddr) {
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("control: failed to clone client socket for {}: {}", peer, e);
            return;
        }
    };
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => return,
        };
        let resp = handle_line(ctx, &line);
        if writer.write_all(resp.as_bytes()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::sync::Arc;
    use std::time::Duration;

    use pool::Pool;
    use router::{Policy, Router, RouterConfig};

    fn ctx() -> Context {
        let cfg = RouterConfig {
            policy: Policy::Least,
            top: false,
            max_conn: 10,
            interval: Duration::from_secs(2),
            extra_interval: None,
        };
        let dst = ::addr::parse_dst_spec("127.0.0.1:4444:1.0", 4444).unwrap();
        let router = Router::new(cfg, vec![dst]);
        let pool = Arc::new(Pool::new(1, 4096, router.clone()));
        Context { router, pool, watchdog: None, default_port: 4444 }
    }

    #[test]
    fn accepts_and_serves_a_client() {
        let control = TcpControl::bind("127.0.0.1:0".parse().unwrap(), ctx(), 8, Arc::new(AtomicBool::new(false))).unwrap();
        let addr = control.listener.local_addr().unwrap();
        let control = Arc::new(control);
        {
            let c = control.clone();
            thread::spawn(move || c.run());
        }
        thread::sleep(Duration::from_millis(50));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"getinfo\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("127.0.0.1:4444"));

        control.terminate.store(true, Ordering::Relaxed);
        control.ctx.pool.shutdown();
    }

    #[test]
    fn starts_with_no_clients_connected() {
        let control = TcpControl::bind("127.0.0.1:0".parse().unwrap(), ctx(), 8, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(control.clients.load(Ordering::Relaxed), 0);
        control.ctx.pool.shutdown();
    }
}
