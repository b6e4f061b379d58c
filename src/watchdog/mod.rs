//! Watchdog: one supervisor thread reconciling prober results into the
//! Router and Pool, plus one prober thread per destination (spec.md §4.4).
//!
//! Grounded on `resolver/namerd.rs`'s role as the thing that watches an
//! external signal and calls back into the balancing state on change, and
//! on `pool/mod.rs`'s discipline of one registry mutex guarding a list of
//! otherwise-independent per-item threads. The reconciliation arithmetic
//! (latency EMA, the 10% weight-change threshold, `fail_count > 8`
//! auto-removal) is taken verbatim from `original_source/src/glb_wdog.c`.

pub mod prober;

use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use addr::Destination;
use error::Result;
use pool::Pool;
use router::{ProbeState, Router};
use watchdog::prober::{DummyBackend, ExecBackend, ProbeBackend, ProberContext};

/// Watchdog-wide knobs, assembled from `config::WatchdogConfig` plus the
/// top-level polling interval (spec.md §6).
#[derive(Clone)]
pub struct Settings {
    pub interval: Duration,
    pub latency_samples: u32,
    pub discover_cluster: bool,
    pub probe_command: Option<Vec<String>>,
    pub default_port: u16,
}

struct DstRecord {
    /// The operator/control-configured destination: `addr` is fixed for
    /// the record's lifetime, `weight` is the base weight latency
    /// adjustment scales from.
    dst: Destination,
    prober: Arc<ProberContext>,
    latency: f64,
    /// The weight last pushed to the Router, used for the 10% change
    /// threshold (spec.md §4.4 step 3).
    applied_weight: f64,
    fail_count: u32,
    explicit: bool,
}

struct Inner {
    router: Router,
    pool: Arc<Pool>,
    settings: Settings,
    records: Mutex<Vec<DstRecord>>,
    shutdown: Mutex<bool>,
    cond: Condvar,
}

/// Owns the supervisor thread; dropping a `Watchdog` does not stop it —
/// call `shutdown()` and let the caller join the thread it spawned.
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Spawns a prober (and registers it with the Router) for every
    /// `initial` destination, then starts the supervisor thread.
    pub fn spawn(settings: Settings, router: Router, pool: Arc<Pool>, initial: Vec<Destination>) -> Watchdog {
        let inner = Arc::new(Inner {
            router,
            pool,
            settings,
            records: Mutex::new(Vec::new()),
            shutdown: Mutex::new(false),
            cond: Condvar::new(),
        });

        {
            let mut records = inner.records.lock().unwrap();
            for dst in initial {
                let rec = start_destination(&inner, dst, true);
                records.push(rec);
            }
        }

        let supervisor = inner.clone();
        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || run(supervisor))
            .expect("failed to spawn watchdog supervisor thread");

        Watchdog { inner }
    }

    /// Adds or updates an explicit destination (from Control or static
    /// config); `weight < 0` removes it and signals its prober to quit.
    pub fn change_dst(&self, dst: Destination) -> Result<()> {
        let mut records = self.inner.records.lock().unwrap();
        let found = records.iter().position(|r| r.dst.addr == dst.addr);

        if dst.is_removal() {
            if let Some(i) = found {
                let rec = records.remove(i);
                rec.prober.signal_quit();
            }
            self.inner.router.change_dst(dst, None)?;
            self.inner.pool.drop_dst(dst.addr);
            return Ok(());
        }

        match found {
            Some(i) => {
                records[i].dst.weight = dst.weight;
                records[i].explicit = true;
            }
            None => {
                let rec = start_destination(&self.inner, dst, true);
                records.push(rec);
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        *self.inner.shutdown.lock().unwrap() = true;
        self.inner.cond.notify_all();
        let records = self.inner.records.lock().unwrap();
        for r in records.iter() {
            r.prober.signal_quit();
        }
    }
}

fn start_destination(inner: &Arc<Inner>, dst: Destination, explicit: bool) -> DstRecord {
    let backend = make_backend(&inner.settings, dst.addr);
    let ctx = prober::spawn(dst.addr, inner.settings.interval, backend);
    let probe_ref: ::router::ProbeRef = ctx.clone();
    let _ = inner.router.change_dst(dst, Some(probe_ref));
    DstRecord {
        dst,
        prober: ctx,
        latency: 1.0,
        applied_weight: dst.weight,
        fail_count: 0,
        explicit,
    }
}

fn make_backend(settings: &Settings, addr: SocketAddr) -> Box<ProbeBackend> {
    match settings.probe_command {
        Some(ref cmd) => match ExecBackend::spawn(cmd, addr) {
            Ok(b) => Box::new(b),
            Err(e) => {
                error!("failed to spawn prober command for {}: {}; falling back to dummy", addr, e);
                Box::new(DummyBackend)
            }
        },
        None => Box::new(DummyBackend),
    }
}

fn run(inner: Arc<Inner>) {
    // Slightly longer than the prober interval so a fresh result is
    // always waiting by the time this wakes (spec.md §4.4).
    let period = Duration::from_millis((inner.settings.interval.as_secs() * 1000
        + u64::from(inner.settings.interval.subsec_nanos()) / 1_000_000) * 11 / 10);

    loop {
        let guard = inner.shutdown.lock().unwrap();
        if *guard {
            return;
        }
        let (guard, timed_out) = inner.cond.wait_timeout(guard, period).unwrap();
        let should_quit = *guard;
        drop(guard);
        if should_quit {
            return;
        }
        if timed_out.timed_out() {
            tick(&inner);
        }
    }
}

fn tick(inner: &Arc<Inner>) {
    let mut records = inner.records.lock().unwrap();
    if records.is_empty() {
        return;
    }

    let results: Vec<(prober::ProbeResult, bool)> =
        records.iter().map(|r| r.prober.take_result()).collect();

    let mut max_latency = 1.0f64;
    for (i, &(ref result, ready)) in results.iter().enumerate() {
        if ready && result.state == ProbeState::Ready {
            let l = f64::from(inner.settings.latency_samples);
            let rec = &mut records[i];
            rec.latency = if inner.settings.latency_samples > 0 {
                (result.latency + rec.latency * l) / (l + 1.0)
            } else {
                result.latency
            };
            if rec.latency > max_latency {
                max_latency = rec.latency;
            }
        }
    }

    let mut discovered: Vec<Destination> = Vec::new();

    for (i, &(ref result, ready)) in results.iter().enumerate() {
        if !ready {
            continue;
        }

        if result.state == ProbeState::NotFound {
            records[i].fail_count += 1;
        } else {
            records[i].fail_count = 0;
        }

        let new_weight = match result.state {
            ProbeState::NotFound | ProbeState::NotReady => -1.0,
            ProbeState::Avoid => 0.0,
            ProbeState::Ready => {
                let rec = &records[i];
                if inner.settings.latency_samples > 0 && rec.latency > 0.0 {
                    rec.dst.weight * max_latency / rec.latency
                } else {
                    rec.dst.weight
                }
            }
        };

        let old_weight = records[i].applied_weight;
        let sign_changed = old_weight.signum() != new_weight.signum();
        let magnitude_changed = old_weight != 0.0 && (new_weight / old_weight - 1.0).abs() > 0.10;
        if sign_changed || magnitude_changed || (old_weight == 0.0 && new_weight != 0.0) {
            let addr = records[i].dst.addr;
            let _ = inner.router.change_dst(Destination::new(addr, new_weight), None);
            records[i].applied_weight = new_weight;
            if new_weight < 0.0 {
                inner.pool.drop_dst(addr);
            }
        }

        if inner.settings.discover_cluster {
            discovered.extend(result.others.iter().cloned());
        }
    }

    let mut auto_removed = Vec::new();
    records.retain(|r| {
        if !r.explicit && r.fail_count > 8 {
            auto_removed.push((r.dst.addr, r.prober.clone()));
            false
        } else {
            true
        }
    });
    for (addr, prober) in auto_removed {
        prober.signal_quit();
        let _ = inner.router.change_dst(Destination::new(addr, -1.0), None);
        inner.pool.drop_dst(addr);
    }

    if inner.settings.discover_cluster {
        for d in discovered {
            if records.iter().any(|r| r.dst.addr == d.addr) {
                continue;
            }
            let rec = start_destination(inner, d, false);
            records.push(rec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router::RouterConfig;
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            interval: Duration::from_millis(20),
            latency_samples: 0,
            discover_cluster: true,
            probe_command: None,
            default_port: 4444,
        }
    }

    fn cfg() -> RouterConfig {
        RouterConfig {
            policy: ::router::Policy::Least,
            top: false,
            max_conn: 1000,
            interval: Duration::from_millis(20),
            extra_interval: None,
        }
    }

    #[test]
    fn dummy_destination_reaches_ready_weight() {
        let router = Router::new(cfg(), vec![]);
        let dst = ::addr::parse_dst_spec("127.0.0.1:4444:2.0", 4444).unwrap();

        // Exercise only the bookkeeping helper, not the full thread/tick
        // cycle, which needs real wall-clock waits to observe.
        let backend: Box<ProbeBackend> = Box::new(DummyBackend);
        let ctx = prober::spawn(dst.addr, Duration::from_millis(10), backend);
        let probe_ref: ::router::ProbeRef = ctx.clone();
        router.change_dst(dst, Some(probe_ref)).unwrap();
        assert_eq!(router.choose_dst(0).unwrap(), dst.addr);
        ctx.signal_quit();
    }

    #[test]
    fn supervisor_keeps_a_dummy_destination_eligible() {
        let router = Router::new(cfg(), vec![]);
        let pool = Arc::new(Pool::new(1, 4096, router.clone()));
        let dst = ::addr::parse_dst_spec("127.0.0.1:4444:2.0", 4444).unwrap();

        let wdog = Watchdog::spawn(settings(), router.clone(), pool.clone(), vec![dst]);
        thread::sleep(Duration::from_millis(150));

        assert_eq!(router.choose_dst(0).unwrap(), dst.addr);

        wdog.shutdown();
        pool.shutdown();
    }
}
