//! Test harness: progress drivers for in-process fabric pairs.

use memfab_transport::{OpStatus, Submitted, TransportEnv};

/// Iteration bound for every spin loop in the suites. A wedged fabric
/// fails the test instead of hanging it.
pub const SPIN_BOUND: usize = 50_000;

/// Installs the fmt/env-filter subscriber. Safe to call from every test;
/// only the first call in the process wins.
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// One progress sweep on both environments. Returns the total work done.
pub fn progress_both(a: &TransportEnv, b: &TransportEnv) -> usize {
    a.progress() + b.progress()
}

/// Spins both environments until the predicate holds.
pub fn progress_until<F: FnMut() -> bool>(a: &TransportEnv, b: &TransportEnv, mut done: F) {
    for _ in 0..SPIN_BOUND {
        progress_both(a, b);
        if done() {
            return;
        }
        std::thread::yield_now();
    }
    tracing::error!(bound = SPIN_BOUND, "fabric stalled");
    panic!("fabric made no progress within the spin bound");
}

/// Drives both sides until the submission terminates and returns its
/// status. An immediate completion needs no driving at all.
pub fn drive_to_completion(a: &TransportEnv, b: &TransportEnv, submitted: Submitted) -> OpStatus {
    match submitted {
        Submitted::Completed => OpStatus::Success,
        Submitted::Pending(req) => {
            progress_until(a, b, || req.status().is_terminal());
            req.status()
        }
    }
}
