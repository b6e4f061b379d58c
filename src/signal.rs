//! Cooperative shutdown signal (spec.md §5 "Cancellation").
//!
//! Grounded on `original_source/src/glb_signal.c`: HUP/TERM/INT/QUIT/PIPE
//! all flip the same flag, a plain signal handler can't capture state so
//! the flag is a process-wide static, and callers poll it instead of
//! blocking in the handler.

use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handler(_signum: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Installs the handler for every signal `glb_signal.c` treats as a
/// shutdown request. Call once, before spawning any worker threads.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGHUP, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, handler as libc::sighandler_t);
    }
}

/// True once a shutdown signal has been received.
pub fn requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        // Other tests in the same process may have raised SIGPIPE et al.
        // via shared test infrastructure; only assert the type compiles
        // and the flag is readable, not a pristine global state.
        let _ = requested();
    }
}
