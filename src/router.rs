//! The Router policy engine (spec.md §4.1).
//!
//! Grounded on `linkerd-tcp`'s `router.rs` / `balancer/endpoints.rs` for the
//! "cheaply-clonable handle around one mutex-guarded table, re-derived on
//! every mutation" shape, and on `original_source/src/glb_router.c` for the
//! exact selection policies, healthy predicate, top-tier election and map
//! construction the distilled spec summarizes.
//!
//! Unlike `linkerd-tcp`'s single-reactor `Rc<RefCell<_>>` state, `Router`
//! here is shared across real OS threads (Listener, N Pool workers,
//! Watchdog, Control), so it is built on `Arc<Mutex<_>>` plus a `Condvar`
//! used to drain in-flight callers before a destination is added or
//! removed (spec.md §5, `busy_count`).

use std::cmp;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use addr::Destination;
use error::{Error, Result};

/// The result of an on-demand probe issued by the Router's "extra poll"
/// feature (spec.md §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    NotFound,
    NotReady,
    Avoid,
    Ready,
}

/// A handle the Router can use to ask a destination's prober for an
/// immediate, synchronous result. Implemented by the Watchdog's prober
/// context; kept as a trait object here so `router` has no dependency on
/// `watchdog`.
pub trait Prober: Send + Sync {
    fn poll_now(&self, deadline: Duration) -> Option<ProbeState>;
}

pub type ProbeRef = Arc<Prober>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Least,
    Round,
    Random,
    Source,
    Single,
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub policy: Policy,
    /// Restrict balancing to the top weight tier.
    pub top: bool,
    pub max_conn: usize,
    /// Watchdog polling interval; `retry = ceil(interval) + 1`.
    pub interval: Duration,
    /// If set, re-probe a candidate destination on demand once its last
    /// check is older than this.
    pub extra_interval: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            policy: Policy::Least,
            top: false,
            max_conn: usize::max_value(),
            interval: Duration::from_secs(2),
            extra_interval: None,
        }
    }
}

struct DstRecord {
    dst: Destination,
    probe_ref: Option<ProbeRef>,
    usage: f64,
    map: f64,
    checked_at: Instant,
    failed_at: Option<Instant>,
    conns: usize,
}

impl DstRecord {
    fn new(dst: Destination, probe_ref: Option<ProbeRef>) -> DstRecord {
        DstRecord {
            dst,
            probe_ref,
            usage: 0.0,
            map: 0.0,
            checked_at: Instant::now(),
            failed_at: None,
            conns: 0,
        }
    }
}

struct State {
    dsts: Vec<DstRecord>,
    top_dst: Option<usize>,
    rrb_next: usize,
    conns: usize,
    busy_count: usize,
    cfg: RouterConfig,
}

struct Inner {
    state: Mutex<State>,
    free: Condvar,
}

/// Cheaply-clonable handle to the shared Router state.
#[derive(Clone)]
pub struct Router(Arc<Inner>);

/// Outcome of a `change_dst` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Added(usize),
    Updated(usize),
    Removed,
}

impl Router {
    pub fn new(cfg: RouterConfig, initial: Vec<Destination>) -> Router {
        let mut state = State {
            dsts: initial
                .into_iter()
                .map(|d| DstRecord::new(d, None))
                .collect(),
            top_dst: None,
            rrb_next: 0,
            conns: 0,
            busy_count: 0,
            cfg,
        };
        recompute(&mut state);
        Router(Arc::new(Inner {
            state: Mutex::new(state),
            free: Condvar::new(),
        }))
    }

    /// `retry = ceil(interval_secs) + 1`, in whole seconds.
    fn retry_window(cfg: &RouterConfig) -> Duration {
        let secs = cfg.interval.as_secs()
            + if cfg.interval.subsec_nanos() > 0 { 1 } else { 0 };
        Duration::from_secs(secs + 1)
    }

    /// Adds, updates, or removes a destination. Blocks until no other
    /// caller holds a reference across an unlocked region
    /// (`busy_count == 0`) before mutating, per spec.md §4.1/§5.
    pub fn change_dst(&self, dst: Destination, probe_ref: Option<ProbeRef>) -> Result<ChangeOutcome> {
        let mut state = self.0.state.lock().unwrap();
        while state.busy_count > 0 {
            state = self.0.free.wait(state).unwrap();
        }

        let found = state.dsts.iter().position(|r| r.dst.addr == dst.addr);

        let outcome = if dst.is_removal() {
            match found {
                Some(i) => {
                    state.dsts.swap_remove(i);
                    ChangeOutcome::Removed
                }
                None => ChangeOutcome::Removed,
            }
        } else {
            match found {
                Some(i) => {
                    state.dsts[i].dst.weight = dst.weight;
                    if let Some(p) = probe_ref {
                        state.dsts[i].probe_ref = Some(p);
                    }
                    if dst.weight > 0.0 {
                        state.dsts[i].failed_at = None;
                    }
                    ChangeOutcome::Updated(i)
                }
                None => {
                    state.dsts.push(DstRecord::new(dst, probe_ref));
                    ChangeOutcome::Added(state.dsts.len() - 1)
                }
            }
        };

        recompute(&mut state);
        if state.rrb_next >= state.dsts.len() && !state.dsts.is_empty() {
            state.rrb_next = 0;
        }
        Ok(outcome)
    }

    /// Picks one destination for a new connection, applying the
    /// configured policy. Increments `conns` on success.
    pub fn choose_dst(&self, hint: u32) -> Result<SocketAddr> {
        let mut state = self.0.state.lock().unwrap();
        choose_locked(&mut state, hint, None, true)
    }

    /// Atomically marks `current` failed (decrementing its `conns`) and
    /// chooses a replacement. Per spec.md §9(c), does not re-validate
    /// `max_conn`: the connection already counted against the limit when
    /// it was first chosen, and failover must not drop it on the floor
    /// just because `current` no longer occupies a slot (e.g. `current`
    /// was already removed from the destination list).
    pub fn choose_dst_again(&self, hint: u32, current: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.0.state.lock().unwrap();
        if let Some(i) = state.dsts.iter().position(|r| r.dst.addr == current) {
            dec_conns(&mut state, i);
            mark_failed(&mut state, i);
        }
        choose_locked(&mut state, hint, Some(current), false)
    }

    /// Decrements `conns` on the matching destination; if `failed`,
    /// applies failure marking.
    pub fn disconnect(&self, addr: SocketAddr, failed: bool) {
        let mut state = self.0.state.lock().unwrap();
        if let Some(i) = state.dsts.iter().position(|r| r.dst.addr == addr) {
            dec_conns(&mut state, i);
            if failed {
                mark_failed(&mut state, i);
            }
        }
    }

    /// Entry point used by the Listener (and, were it built, an
    /// interposed-`connect()` front end) to obtain a destination for a new
    /// client. Pure selection — the caller performs the actual `connect()`.
    pub fn connect(&self, hint: u32) -> Result<SocketAddr> {
        self.choose_dst(hint)
    }

    /// Increments `busy_count` for the caller's destination reference
    /// while it performs a blocking syscall with the lock released.
    pub fn enter_busy(&self) -> BusyGuard {
        let mut state = self.0.state.lock().unwrap();
        state.busy_count += 1;
        BusyGuard(self.0.clone())
    }

    pub fn conns(&self) -> usize {
        self.0.state.lock().unwrap().conns
    }

    pub fn snapshot(&self) -> Vec<DstInfo> {
        let state = self.0.state.lock().unwrap();
        state
            .dsts
            .iter()
            .enumerate()
            .map(|(i, r)| DstInfo {
                addr: r.dst.addr,
                weight: r.dst.weight,
                usage: r.usage,
                map: r.map,
                conns: r.conns,
                is_top: state.top_dst == Some(i),
            })
            .collect()
    }
}

/// Held across a syscall performed with a destination reference but
/// without the Router lock; decrements `busy_count` and signals `free` on
/// drop (spec.md §5).
pub struct BusyGuard(Arc<Inner>);
impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap();
        state.busy_count -= 1;
        if state.busy_count == 0 {
            self.0.free.notify_all();
        }
    }
}

#[derive(Debug, Clone)]
pub struct DstInfo {
    pub addr: SocketAddr,
    pub weight: f64,
    pub usage: f64,
    pub map: f64,
    pub conns: usize,
    pub is_top: bool,
}

fn dec_conns(state: &mut State, i: usize) {
    if state.dsts[i].conns > 0 {
        state.dsts[i].conns -= 1;
        state.conns -= 1;
    }
}

fn mark_failed(state: &mut State, i: usize) {
    let now = Instant::now();
    let was_top_healthy = healthy(state, i, now);
    state.dsts[i].failed_at = Some(now);
    if was_top_healthy {
        recompute(state);
    }
}

/// `dst.weight >= min_weight && (now - failed_at) > retry`.
fn healthy(state: &State, i: usize, now: Instant) -> bool {
    let retry = Router::retry_window(&state.cfg);
    let min_weight = min_weight(state);
    let r = &state.dsts[i];
    if r.dst.weight < min_weight {
        return false;
    }
    match r.failed_at {
        None => true,
        Some(at) => now.duration_since(at) > retry,
    }
}

fn min_weight(state: &State) -> f64 {
    const EPS: f64 = 1e-9;
    if state.cfg.top {
        if let Some(i) = state.top_dst {
            return state.dsts[i].dst.weight;
        }
    }
    EPS
}

/// Rederives `top_dst` and the cumulative map from scratch. Called after
/// every mutation of the destination list.
fn recompute(state: &mut State) {
    recompute_top(state);
    if state.cfg.policy == Policy::Random || state.cfg.policy == Policy::Source {
        recompute_map(state);
    }
}

fn recompute_top(state: &mut State) {
    const TIE_BREAK: f64 = 1.0 + 1e-9;
    let now = Instant::now();
    let retry = Router::retry_window(&state.cfg);

    let mut best: Option<(usize, f64)> = None;
    for (i, r) in state.dsts.iter().enumerate() {
        if r.dst.weight <= 0.0 {
            continue;
        }
        let ok = match r.failed_at {
            None => true,
            Some(at) => now.duration_since(at) > retry,
        };
        if !ok {
            continue;
        }
        match best {
            None => best = Some((i, r.dst.weight)),
            Some((_, w)) if r.dst.weight > w * TIE_BREAK => best = Some((i, r.dst.weight)),
            _ => {}
        }
    }

    // Stable: keep the existing top if it is still healthy and no
    // strictly-higher candidate was found.
    if let Some(cur) = state.top_dst {
        if cur < state.dsts.len() && healthy_ignoring_top(state, cur, now, retry) {
            if let Some((i, _)) = best {
                if i == cur {
                    return;
                }
                // Only replace if strictly higher.
                if state.dsts[i].dst.weight <= state.dsts[cur].dst.weight * TIE_BREAK {
                    return;
                }
            } else {
                return;
            }
        }
    }
    state.top_dst = best.map(|(i, _)| i);
}

fn healthy_ignoring_top(state: &State, i: usize, now: Instant, retry: Duration) -> bool {
    let r = &state.dsts[i];
    if r.dst.weight <= 0.0 {
        return false;
    }
    match r.failed_at {
        None => true,
        Some(at) => now.duration_since(at) > retry,
    }
}

/// Assigns each healthy destination a sub-interval of `[0, 1)`
/// proportional to its weight; skipped entirely if the total healthy
/// weight is zero.
fn recompute_map(state: &mut State) {
    let now = Instant::now();
    let min_weight = min_weight(state);
    let retry = Router::retry_window(&state.cfg);

    let total: f64 = state
        .dsts
        .iter()
        .enumerate()
        .filter(|&(i, _)| healthy(state, i, now))
        .map(|(_, r)| r.dst.weight)
        .sum();

    if total <= 0.0 {
        for r in &mut state.dsts {
            r.map = 0.0;
        }
        return;
    }

    let mut acc = 0.0;
    for i in 0..state.dsts.len() {
        let is_healthy = state.dsts[i].dst.weight >= min_weight
            && match state.dsts[i].failed_at {
                None => true,
                Some(at) => now.duration_since(at) > retry,
            };
        if is_healthy {
            acc += state.dsts[i].dst.weight / total;
            state.dsts[i].map = acc;
        } else {
            state.dsts[i].map = 0.0;
        }
    }
    if let Some(last) = state.dsts.iter_mut().filter(|r| r.map > 0.0).last() {
        last.map = 1.0;
    }
}

fn choose_locked(state: &mut State, hint: u32, skip: Option<SocketAddr>, check_max_conn: bool) -> Result<SocketAddr> {
    if check_max_conn && state.conns >= state.cfg.max_conn {
        return Err(Error::MaxConn);
    }

    let attempts = cmp::max(state.dsts.len(), 1);
    let mut excluded: Vec<SocketAddr> = skip.into_iter().collect();

    for _ in 0..attempts {
        let picked = match state.cfg.policy {
            Policy::Least => pick_least(state, &excluded),
            Policy::Round => pick_round(state, &excluded),
            Policy::Single => pick_single(state, &excluded),
            Policy::Random => {
                let h = rand::thread_rng().next_u32();
                pick_map(state, h, &excluded)
            }
            Policy::Source => pick_map(state, hint, &excluded),
        };

        let i = match picked {
            Some(i) => i,
            None => return Err(Error::HostDown),
        };

        if !extra_poll_ok(state, i) {
            excluded.push(state.dsts[i].dst.addr);
            continue;
        }

        state.dsts[i].conns += 1;
        state.conns += 1;
        let conns = state.dsts[i].conns as f64;
        state.dsts[i].usage = state.dsts[i].dst.weight / conns;
        return Ok(state.dsts[i].dst.addr);
    }

    Err(Error::HostDown)
}

fn is_healthy_excl(state: &State, i: usize, excluded: &[SocketAddr]) -> bool {
    if excluded.contains(&state.dsts[i].dst.addr) {
        return false;
    }
    healthy(state, i, Instant::now())
}

fn pick_least(state: &State, excluded: &[SocketAddr]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for i in 0..state.dsts.len() {
        if !is_healthy_excl(state, i, excluded) {
            continue;
        }
        let usage = state.dsts[i].dst.weight / (state.dsts[i].conns as f64 + 1.0);
        match best {
            None => best = Some((i, usage)),
            Some((_, u)) if usage > u => best = Some((i, usage)),
            _ => {}
        }
    }
    best.map(|(i, _)| i)
}

fn pick_round(state: &mut State, excluded: &[SocketAddr]) -> Option<usize> {
    let n = state.dsts.len();
    if n == 0 {
        return None;
    }
    for step in 0..n {
        let i = (state.rrb_next + step) % n;
        if is_healthy_excl(state, i, excluded) {
            state.rrb_next = (i + 1) % n;
            return Some(i);
        }
    }
    None
}

fn pick_single(state: &State, excluded: &[SocketAddr]) -> Option<usize> {
    match state.top_dst {
        Some(i) if is_healthy_excl(state, i, excluded) => Some(i),
        _ => None,
    }
}

fn pick_map(state: &State, hint: u32, excluded: &[SocketAddr]) -> Option<usize> {
    const EPS: f64 = 1e-9;
    let norm = f64::from(hint) / f64::from(u32::max_value()) - EPS;
    let norm = if norm < 0.0 { 0.0 } else { norm };
    for i in 0..state.dsts.len() {
        if state.dsts[i].map <= 0.0 {
            continue;
        }
        if norm < state.dsts[i].map && !excluded.contains(&state.dsts[i].dst.addr) {
            return Some(i);
        }
    }
    // Fall through to least-loaded among healthy, unexcluded destinations
    // if the map lookup misses (e.g. stale map just after a failure).
    pick_least(state, excluded)
}

fn extra_poll_ok(state: &mut State, i: usize) -> bool {
    let extra = match state.cfg.extra_interval {
        Some(e) => e,
        None => return true,
    };
    let now = Instant::now();
    if now.duration_since(state.dsts[i].checked_at) <= extra {
        return true;
    }
    let prober = match state.dsts[i].probe_ref.clone() {
        Some(p) => p,
        None => return true,
    };
    state.dsts[i].checked_at = now;
    match prober.poll_now(Duration::from_secs(1)) {
        Some(ProbeState::Ready) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn mk_router(policy: Policy, dsts: Vec<(u8, f64)>) -> Router {
        let cfg = RouterConfig {
            policy,
            max_conn: 1000,
            ..RouterConfig::default()
        };
        let initial = dsts
            .into_iter()
            .map(|(last, w)| Destination::new(addr(last, 3306), w))
            .collect();
        Router::new(cfg, initial)
    }

    #[test]
    fn round_robin_cycles() {
        let r = mk_router(Policy::Round, vec![(1, 1.0), (2, 1.0), (3, 1.0)]);
        let picks: Vec<SocketAddr> = (0..5).map(|_| r.choose_dst(0).unwrap()).collect();
        assert_eq!(
            picks,
            vec![
                addr(1, 3306),
                addr(2, 3306),
                addr(3, 3306),
                addr(1, 3306),
                addr(2, 3306),
            ]
        );
    }

    #[test]
    fn source_stickiness() {
        let r = mk_router(Policy::Source, vec![(1, 1.0), (2, 3.0)]);
        let a = r.choose_dst(0x0000_0000).unwrap();
        let b = r.choose_dst(0x0000_0000).unwrap();
        assert_eq!(a, b);

        let upper = r.choose_dst(0xFFFF_FFF0).unwrap();
        assert_eq!(upper, addr(2, 3306));
    }

    #[test]
    fn max_conn_limit() {
        let cfg = RouterConfig {
            policy: Policy::Round,
            max_conn: 2,
            ..RouterConfig::default()
        };
        let r = Router::new(
            cfg,
            vec![Destination::new(addr(1, 3306), 1.0), Destination::new(addr(2, 3306), 1.0)],
        );
        r.choose_dst(0).unwrap();
        r.choose_dst(0).unwrap();
        match r.choose_dst(0) {
            Err(Error::MaxConn) => {}
            other => panic!("expected MaxConn, got {:?}", other.map(|a| a.to_string())),
        }
        assert_eq!(r.conns(), 2);
    }

    #[test]
    fn choose_dst_again_ignores_max_conn() {
        let cfg = RouterConfig {
            policy: Policy::Round,
            max_conn: 1,
            ..RouterConfig::default()
        };
        let r = Router::new(
            cfg,
            vec![Destination::new(addr(1, 3306), 1.0), Destination::new(addr(2, 3306), 1.0)],
        );
        let first = r.choose_dst(0).unwrap();
        assert_eq!(r.conns(), 1);

        // `current` (the connection's own destination) is still in the
        // list, so failover must succeed even though a fresh `choose_dst`
        // would now be rejected for being at `max_conn`.
        let second = r.choose_dst_again(0, first).unwrap();
        assert_ne!(second, first);
        assert_eq!(r.conns(), 1);

        match r.choose_dst(0) {
            Err(Error::MaxConn) => {}
            other => panic!("expected MaxConn, got {:?}", other.map(|a| a.to_string())),
        }
    }

    #[test]
    fn choose_dst_again_succeeds_even_when_current_already_removed() {
        let cfg = RouterConfig {
            policy: Policy::Round,
            max_conn: 1,
            ..RouterConfig::default()
        };
        let r = Router::new(cfg, vec![Destination::new(addr(1, 3306), 1.0)]);
        let first = r.choose_dst(0).unwrap();
        r.change_dst(Destination::new(first, -1.0), None).unwrap();
        r.change_dst(Destination::new(addr(2, 3306), 1.0), None).unwrap();

        // `current` is no longer in the destination list, so `dec_conns`
        // is a no-op and `conns` stays at `max_conn` — `choose_dst_again`
        // must still not reject the failover on that account.
        let second = r.choose_dst_again(0, first).unwrap();
        assert_eq!(second, addr(2, 3306));
    }

    #[test]
    fn drain_excludes_new_connections() {
        let r = mk_router(Policy::Round, vec![(1, 1.0), (2, 1.0)]);
        r.change_dst(Destination::new(addr(1, 3306), 0.0), None)
            .unwrap();
        for _ in 0..4 {
            assert_eq!(r.choose_dst(0).unwrap(), addr(2, 3306));
        }
    }

    #[test]
    fn change_dst_negative_weight_removes() {
        let r = mk_router(Policy::Round, vec![(1, 1.0), (2, 1.0)]);
        let outcome = r
            .change_dst(Destination::new(addr(1, 3306), -1.0), None)
            .unwrap();
        assert_eq!(outcome, ChangeOutcome::Removed);
        for _ in 0..4 {
            assert_eq!(r.choose_dst(0).unwrap(), addr(2, 3306));
        }
    }
}
