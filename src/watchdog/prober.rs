//! Per-destination prober thread and its shared context (spec.md §3
//! "Prober context", §4.4 "Prober thread contract").
//!
//! No `linkerd-tcp` module probes a destination out of band like this —
//! its closest kin, `resolver/namerd.rs`, polls an HTTP endpoint from the
//! reactor on a `tokio_timer::Interval` rather than a dedicated thread.
//! The state machine here (including the "dummy" and "exec" backends and
//! the `poll\n`/`quit\n` stdin protocol) is grounded directly on
//! `original_source/src/glb_wdog_backend.c` and `glb_wdog_exec.c`.

use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use addr::Destination;
use router::{ProbeState, Prober};

#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub state: ProbeState,
    pub latency: f64,
    pub others: Vec<Destination>,
    pub timestamp: Instant,
}

impl ProbeResult {
    fn not_ready() -> ProbeResult {
        ProbeResult {
            state: ProbeState::NotReady,
            latency: 0.0,
            others: Vec::new(),
            timestamp: Instant::now(),
        }
    }
}

struct Shared {
    result: ProbeResult,
    ready: bool,
    quit: bool,
    joined: bool,
}

/// Guarded by its own mutex + condvar, independent of the Router's and the
/// Watchdog list's locks, per spec.md §5.
pub struct ProberContext {
    shared: Mutex<Shared>,
    cond: Condvar,
    pub host: SocketAddr,
}

impl ProberContext {
    fn new(host: SocketAddr) -> Arc<ProberContext> {
        Arc::new(ProberContext {
            shared: Mutex::new(Shared {
                result: ProbeResult::not_ready(),
                ready: false,
                quit: false,
                joined: false,
            }),
            cond: Condvar::new(),
            host,
        })
    }

    /// Takes the last result and clears `ready`, per the supervisor's
    /// tick (spec.md §4.4 step 1).
    pub fn take_result(&self) -> (ProbeResult, bool) {
        let mut s = self.shared.lock().unwrap();
        let was_ready = s.ready;
        s.ready = false;
        (s.result.clone(), was_ready)
    }

    pub fn has_joined(&self) -> bool {
        self.shared.lock().unwrap().joined
    }

    pub fn signal_quit(&self) {
        let mut s = self.shared.lock().unwrap();
        s.quit = true;
        self.cond.notify_all();
    }

    /// An on-demand probe requested by the Router's "extra poll" feature
    /// (spec.md §4.1): waits up to `deadline` for the next populated
    /// result rather than the prober's regular schedule.
    pub fn poll_now(&self, deadline: Duration) -> Option<ProbeState> {
        let s = self.shared.lock().unwrap();
        let (s, timed_out) = self
            .cond
            .wait_timeout_while(s, deadline, |s| !s.ready && !s.quit)
            .unwrap();
        if timed_out.timed_out() {
            None
        } else {
            Some(s.result.state)
        }
    }

    fn publish(&self, result: ProbeResult) {
        let mut s = self.shared.lock().unwrap();
        s.result = result;
        s.ready = true;
        self.cond.notify_all();
    }

    fn should_quit(&self) -> bool {
        self.shared.lock().unwrap().quit
    }

    fn mark_joined(&self) {
        self.shared.lock().unwrap().joined = true;
    }
}

impl Prober for ProberContext {
    fn poll_now(&self, deadline: Duration) -> Option<ProbeState> {
        ProberContext::poll_now(self, deadline)
    }
}

pub trait ProbeBackend: Send {
    fn probe(&mut self) -> ProbeResult;
}

/// Always reports READY with a fixed latency and no cluster members;
/// useful as the default with no configured probe command, and for
/// exercising the Watchdog in tests without a subprocess.
pub struct DummyBackend;
impl ProbeBackend for DummyBackend {
    fn probe(&mut self) -> ProbeResult {
        ProbeResult {
            state: ProbeState::Ready,
            latency: 1.0,
            others: Vec::new(),
            timestamp: Instant::now(),
        }
    }
}

/// Spawns `command` with `host:port` appended once at construction, then
/// drives it with the `poll\n` / `quit\n` stdin protocol (spec.md §6).
pub struct ExecBackend {
    child: Child,
    stdout: BufReader<::std::process::ChildStdout>,
}

impl ExecBackend {
    pub fn spawn(command: &[String], host: SocketAddr) -> ::std::io::Result<ExecBackend> {
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        cmd.arg(host.to_string());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(ExecBackend { child, stdout })
    }
}

impl ProbeBackend for ExecBackend {
    fn probe(&mut self) -> ProbeResult {
        let start = Instant::now();
        let write_result = self
            .child
            .stdin
            .as_mut()
            .expect("piped stdin")
            .write_all(b"poll\n");
        if write_result.is_err() {
            return ProbeResult {
                state: ProbeState::NotFound,
                latency: 0.0,
                others: Vec::new(),
                timestamp: Instant::now(),
            };
        }

        let mut line = String::new();
        match self.stdout.read_line(&mut line) {
            Ok(0) | Err(_) => ProbeResult {
                state: ProbeState::NotFound,
                latency: 0.0,
                others: Vec::new(),
                timestamp: Instant::now(),
            },
            Ok(_) => {
                // The latency weight adjustment (spec.md §4.4 step 2) wants
                // the round-trip time of the exchange itself, not a
                // placeholder.
                let mut result = parse_probe_line(&line);
                result.latency = secs(start.elapsed());
                result
            }
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs() as f64 + f64::from(d.subsec_nanos()) / 1e9
}

impl Drop for ExecBackend {
    fn drop(&mut self) {
        if let Some(ref mut stdin) = self.child.stdin {
            let _ = stdin.write_all(b"quit\n");
        }
        let _ = self.child.wait();
    }
}

fn parse_probe_line(line: &str) -> ProbeResult {
    let line = line.trim();
    let mut parts = line.splitn(2, char::is_whitespace);
    let state = match parts.next().and_then(|s| s.parse::<u8>().ok()) {
        Some(0) => ProbeState::NotFound,
        Some(1) => ProbeState::NotReady,
        Some(2) => ProbeState::Avoid,
        Some(3) => ProbeState::Ready,
        _ => ProbeState::NotFound,
    };
    let others = parts
        .next()
        .map(|csv| {
            csv.split(',')
                .filter_map(|spec| ::addr::parse_dst_spec(spec.trim(), 0).ok())
                .collect()
        })
        .unwrap_or_default();
    ProbeResult {
        state,
        // Overwritten by `ExecBackend::probe` with the measured round-trip
        // time; left at 0.0 here since this function never talks to a
        // real subprocess itself.
        latency: 0.0,
        others,
        timestamp: Instant::now(),
    }
}

/// Spawns the thread that drives one backend at `interval`, publishing
/// results into `ctx` until told to quit.
pub fn spawn(host: SocketAddr, interval: Duration, mut backend: Box<ProbeBackend>) -> Arc<ProberContext> {
    let ctx = ProberContext::new(host);
    let ctx2 = ctx.clone();
    thread::Builder::new()
        .name(format!("prober-{}", host))
        .spawn(move || {
            while !ctx2.should_quit() {
                let result = backend.probe();
                ctx2.publish(result);

                let guard = ctx2.shared.lock().unwrap();
                let _ = ctx2
                    .cond
                    .wait_timeout_while(guard, interval, |s| !s.quit)
                    .unwrap();
            }
            ctx2.mark_joined();
        })
        .expect("failed to spawn prober thread");
    ctx
}
