//! Control plane: a shared line-protocol parser driving both a TCP
//! request/response thread and a fire-and-forget FIFO reader thread
//! (spec.md §4.5, §6).
//!
//! Grounded on `original_source/src/glb_control.c::ctrl_handle_request` for
//! the exact dispatch (`getinfo` / `getstat` / otherwise a destination
//! mutation spec, answered with `Ok\n`/`Error\n`) and its trailing-
//! whitespace trim rule; on `app/config.rs::from_str` for the "one parser
//! shared by two transports" shape.

pub mod fifo;
pub mod tcp;

use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use addr;
use pool::Pool;
use router::Router;
use watchdog::Watchdog;

/// Everything a control request needs to answer itself; shared by the TCP
/// and FIFO front ends.
#[derive(Clone)]
pub struct Context {
    pub router: Router,
    pub pool: Arc<Pool>,
    pub watchdog: Option<Arc<Watchdog>>,
    pub default_port: u16,
}

/// Strips trailing bytes that are neither alphanumeric nor ASCII
/// punctuation (newlines, spaces, control characters), mirroring the
/// original's "cut any trailing crap" loop.
fn trim_request(line: &str) -> &str {
    line.trim_end_matches(|c: char| !(c.is_alphanumeric() || c.is_ascii_punctuation()))
}

fn starts_with_ci(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Handles one request line and returns the text a TCP client should see.
/// FIFO callers discard the result (a FIFO can't be responded to, since
/// the writer would just read its own response back).
pub fn handle_line(ctx: &Context, line: &str) -> String {
    let req = trim_request(line);
    if req.is_empty() {
        return String::new();
    }

    if starts_with_ci(req, "getinfo") {
        format_info(&ctx.router)
    } else if starts_with_ci(req, "getstat") {
        format_stats(&ctx.pool)
    } else {
        match addr::parse_dst_spec(req, ctx.default_port) {
            Ok(dst) => {
                let removal = dst.is_removal();
                let result = match ctx.watchdog {
                    Some(ref wdog) => wdog.change_dst(dst),
                    None => ctx.router.change_dst(dst, None).map(|_| ()),
                };
                match result {
                    Ok(()) => {
                        if removal && ctx.watchdog.is_none() {
                            ctx.pool.drop_dst(dst.addr);
                        }
                        "Ok\n".to_string()
                    }
                    Err(_) => "Error\n".to_string(),
                }
            }
            Err(_) => {
                warn!("ctrl: malformed destination change request: {}", req);
                "Error\n".to_string()
            }
        }
    }
}

fn format_info(router: &Router) -> String {
    let mut out = String::new();
    for d in router.snapshot() {
        let _ = writeln!(
            out,
            "{} weight={:.3} usage={:.3} map={:.3} conns={}{}",
            d.addr,
            d.weight,
            d.usage,
            d.map,
            d.conns,
            if d.is_top { " *" } else { "" }
        );
    }
    out
}

fn format_stats(pool: &Pool) -> String {
    let (s, elapsed) = pool.get_stats();
    let mut out = String::new();
    let _ = writeln!(out, "rx_bytes: {}", s.rx_bytes);
    let _ = writeln!(out, "tx_bytes: {}", s.tx_bytes);
    let _ = writeln!(out, "recv_bytes: {}", s.recv_bytes);
    let _ = writeln!(out, "n_recv: {}", s.n_recv);
    let _ = writeln!(out, "send_bytes: {}", s.send_bytes);
    let _ = writeln!(out, "n_send: {}", s.n_send);
    let _ = writeln!(out, "conns_opened: {}", s.conns_opened);
    let _ = writeln!(out, "conns_closed: {}", s.conns_closed);
    let _ = writeln!(out, "n_conns: {}", s.n_conns);
    let _ = writeln!(out, "poll_reads: {}", s.poll_reads);
    let _ = writeln!(out, "poll_writes: {}", s.poll_writes);
    let _ = writeln!(out, "n_polls: {}", s.n_polls);
    let _ = writeln!(out, "elapsed: {:.3}", elapsed);
    out
}
