//! Resettable `getstat` counters (spec.md §6).
//!
//! One `Stats` lives per worker, updated from inside that worker's own
//! future chain (never touched across threads directly); `STATS` control
//! messages merge a worker's counters into the caller's accumulator and
//! zero the worker's copy, matching `glb_pool_print_stats`'s merge-then-
//! reset contract.

use std::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub recv_bytes: u64,
    pub n_recv: u64,
    pub send_bytes: u64,
    pub n_send: u64,
    pub conns_opened: u64,
    pub conns_closed: u64,
    pub n_conns: u64,
    pub poll_reads: u64,
    pub poll_writes: u64,
    pub n_polls: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;
        self.recv_bytes += other.recv_bytes;
        self.n_recv += other.n_recv;
        self.send_bytes += other.send_bytes;
        self.n_send += other.n_send;
        self.conns_opened += other.conns_opened;
        self.conns_closed += other.conns_closed;
        self.n_conns += other.n_conns;
        self.poll_reads += other.poll_reads;
        self.poll_writes += other.poll_writes;
        self.n_polls += other.n_polls;
    }

    pub fn take(&mut self) -> Stats {
        ::std::mem::replace(self, Stats::default())
    }
}

/// Tracks elapsed time since the last `getstat`, alongside the counters
/// themselves (spec.md §6: "plus elapsed seconds since last `getstat`").
pub struct StatsClock {
    pub since: Instant,
}

impl StatsClock {
    pub fn new() -> StatsClock {
        StatsClock { since: Instant::now() }
    }

    pub fn take_elapsed(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.since);
        self.since = now;
        elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) / 1e9
    }
}
