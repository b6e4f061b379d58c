//! Process wiring: assembles a Router, Pool, Watchdog, Control front ends
//! and a Listener from a `Config`, then runs and joins them (spec.md §5).
//!
//! Grounded on `app/mod.rs`'s `configure`/`Runner` split (one function that
//! turns a parsed config into a small number of named, joinable units) and
//! on `main.rs`'s one-named-OS-thread-per-subsystem idiom. Unlike the
//! teacher, nothing here drives a `tokio_core::reactor::Core` directly —
//! the Pool's reactors live inside `pool::worker`, and the Listener/Control
//! front ends are blocking accept loops, so `App::run` only needs to spawn
//! and join plain `std::thread`s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use config::Config;
use control::fifo::FifoControl;
use control::tcp::TcpControl;
use control::Context;
use error::Result;
use listener::Listener;
use pool::Pool;
use router::{Router, RouterConfig};
use signal;
use watchdog::{Settings as WatchdogSettings, Watchdog};

/// Everything `main` needs to start and cleanly stop one balancer instance.
pub struct App {
    router: Router,
    pool: Arc<Pool>,
    watchdog: Option<Arc<Watchdog>>,
    listener: Arc<Listener>,
    tcp_control: Option<Arc<TcpControl>>,
    fifo_control: Option<FifoControl>,
    terminate: Arc<AtomicBool>,
}

/// Builds every subsystem from `config` but does not start accepting
/// connections yet — callers get a chance to install signal handlers (or
/// not, in tests) before `run` blocks.
pub fn configure(config: Config) -> Result<App> {
    let terminate = Arc::new(AtomicBool::new(false));

    let router_cfg = RouterConfig {
        policy: config.policy.into(),
        top: config.top,
        max_conn: config.max_conn,
        interval: Duration::from_secs(config.interval_secs),
        extra_interval: config
            .watchdog
            .as_ref()
            .map(|wd| Duration::from_secs(wd.extra_interval_secs)),
    };

    let initial: Vec<::addr::Destination> = config
        .destinations
        .iter()
        .cloned()
        .map(Into::into)
        .collect();

    // Watchdog-managed destinations are registered by the Watchdog itself
    // (it owns their probers); a Router without a Watchdog gets them here.
    let router = if config.watchdog.is_some() {
        Router::new(router_cfg, Vec::new())
    } else {
        Router::new(router_cfg, initial.clone())
    };

    let pool = Arc::new(Pool::new(config.threads, config.buffer_size, router.clone()));

    let watchdog = config.watchdog.as_ref().map(|wd| {
        let settings = WatchdogSettings {
            interval: Duration::from_secs(config.interval_secs),
            latency_samples: wd.latency_samples,
            discover_cluster: wd.discover_cluster,
            probe_command: wd.probe_command.clone(),
            default_port: config.listen_addr.port(),
        };
        Arc::new(Watchdog::spawn(settings, router.clone(), pool.clone(), initial))
    });

    let listener = Arc::new(Listener::bind(
        config.listen_addr,
        router.clone(),
        pool.clone(),
        terminate.clone(),
    )?);

    let ctx = Context {
        router: router.clone(),
        pool: pool.clone(),
        watchdog: watchdog.clone(),
        default_port: config.listen_addr.port(),
    };

    let mut tcp_control = None;
    let mut fifo_control = None;
    if let Some(ref ctl) = config.control {
        if let Some(addr) = ctl.tcp_addr {
            let tcp = TcpControl::bind(addr, ctx.clone(), ctl.max_clients, terminate.clone())?;
            tcp_control = Some(Arc::new(tcp));
        }
        if let Some(ref path) = ctl.fifo_path {
            let fifo = FifoControl::open(path, ctx.clone(), terminate.clone())?;
            fifo_control = Some(fifo);
        }
    }

    Ok(App {
        router,
        pool,
        watchdog,
        listener,
        tcp_control,
        fifo_control,
        terminate,
    })
}

impl App {
    /// The address the Listener bound to (useful in tests that bind to
    /// port 0 and need to discover the chosen port).
    pub fn listen_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// The Router handle this instance is running, for introspection (e.g.
    /// a test reading back the destination table `configure` built).
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// A clone of the shared termination flag; shutdown() sets it, but a
    /// caller (e.g. a test, or a future signal handler) may set it directly
    /// to trigger the same cooperative shutdown.
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Runs every subsystem until the termination flag is set (by
    /// `shutdown()`, a caller, or an installed OS signal handler — spec.md
    /// §5), then joins every thread and returns. Blocks the calling thread.
    pub fn run(&mut self) -> Result<()> {
        let mut threads: Vec<JoinHandle<()>> = Vec::new();

        if let Some(ref tcp) = self.tcp_control {
            let tcp = tcp.clone();
            threads.push(
                thread::Builder::new()
                    .name("control-tcp".into())
                    .spawn(move || tcp.run())
                    .expect("failed to spawn control-tcp thread"),
            );
        }
        if let Some(fifo) = self.fifo_control.take() {
            threads.push(
                thread::Builder::new()
                    .name("control-fifo".into())
                    .spawn(move || fifo.run())
                    .expect("failed to spawn control-fifo thread"),
            );
        }

        let listener = self.listener.clone();
        threads.push(
            thread::Builder::new()
                .name("listener".into())
                .spawn(move || listener.run())
                .expect("failed to spawn listener thread"),
        );

        // Polls the process-wide signal flag and mirrors it into this
        // instance's own termination flag, so a caller embedding `App` in
        // a test (which never installs signal handlers) sees the same
        // cooperative shutdown path as the real binary.
        while !self.terminate.load(Ordering::Relaxed) {
            if signal::requested() {
                self.shutdown();
                break;
            }
            thread::sleep(Duration::from_millis(200));
        }

        for t in threads {
            let _ = t.join();
        }
        if let Some(ref wdog) = self.watchdog {
            wdog.shutdown();
        }
        self.pool.shutdown();
        info!("balancer shut down cleanly");
        Ok(())
    }

    /// Sets the termination flag; `run` notices within ~200ms (spec.md §5).
    pub fn shutdown(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    use config::{Config, DestinationConfig, PolicyConfig};

    fn spawn_echo_backend() -> SocketAddr {
        let backend = StdTcpListener::bind("127.0.0.1:0").unwrap();
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

    fn mk_config(backend: SocketAddr) -> Config {
        Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            threads: 1,
            max_conn: usize::max_value(),
            policy: PolicyConfig::Single,
            top: false,
            interval_secs: 2,
            buffer_size: 4096,
            destinations: vec![DestinationConfig { addr: backend, weight: 1.0 }],
            control: None,
            watchdog: None,
        }
    }

    #[test]
    fn configure_builds_router_from_destinations() {
        let backend = spawn_echo_backend();
        let balancer = configure(mk_config(backend)).unwrap();
        assert!(balancer.router().snapshot().iter().any(|d| d.addr == backend));
    }

    #[test]
    fn run_routes_a_client_then_shuts_down_cleanly() {
        let backend = spawn_echo_backend();
        let mut balancer = configure(mk_config(backend)).unwrap();
        let addr = balancer.listen_addr();
        let terminate = balancer.terminate_flag();

        let run_handle = thread::spawn(move || balancer.run().unwrap());

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        terminate.store(true, Ordering::Relaxed);
        run_handle.join().unwrap();
    }
}
