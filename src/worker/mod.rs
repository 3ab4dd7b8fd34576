//! Worker-process side of the supervisor/worker split.
//!
//! Everything in this module runs after fork, inside a worker process. The
//! only channel back to the supervisor is the process exit code: 0 for a
//! normal wind-down, [`EXIT_CHILD_FATAL`] for setup failures that no retry
//! inside this process can fix.

pub mod accept;
pub mod handoff;
pub mod pool;
pub mod router;
pub mod shutdown;

use crate::config::ThreadPoolConfig;
use crate::identity;
use crate::processor::ConnectionProcessor;
use crate::routing::RoutingTable;
use accept::CrossProcessLock;
use pool::{Pool, PoolContext};
use shutdown::ShutdownChannel;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};

/// Exit code for unrecoverable worker setup failures. The supervisor
/// treats it like any other exit for respawn accounting but calls it out
/// in the log so operators can see a child that never served.
pub const EXIT_CHILD_FATAL: i32 = 15;

/// Everything a worker process needs, assembled in the supervisor before
/// the fork so the child only has to pick an entry and serve.
pub struct WorkerEnv {
    pub thread_pool: ThreadPoolConfig,
    pub listeners: Arc<Vec<TcpListener>>,
    pub routing: Arc<RoutingTable>,
    pub shutdown: Arc<ShutdownChannel>,
    pub lock_file: Option<PathBuf>,
    pub processor: Arc<dyn ConnectionProcessor>,
}

/// Worker-process main. Returns the process exit code.
pub fn run(env: &WorkerEnv, slot: usize) -> i32 {
    // Peers hanging up must surface as io errors, not kill the process.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let entry_index = env.routing.slot_entry(slot);

    // The flock owner is the open file description, so each worker must
    // open its own handle rather than inherit the supervisor's.
    let cross_lock = match CrossProcessLock::child_init(env.lock_file.as_deref()) {
        Ok(lock) => Arc::new(lock),
        Err(e) => {
            error!(slot, error = %e, "cannot initialize cross-process accept lock");
            return EXIT_CHILD_FATAL;
        }
    };

    if let Some(identity) = env.routing.entry(entry_index).identity() {
        if let Err(e) = identity::drop_privileges(identity) {
            error!(slot, %identity, error = %e, "privilege drop failed");
            return EXIT_CHILD_FATAL;
        }
    }

    let term_flag = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(sig, term_flag.clone()) {
            error!(slot, signal = sig, error = %e, "cannot install terminate handler");
            return EXIT_CHILD_FATAL;
        }
    }

    let ctx = PoolContext {
        listeners: env.listeners.clone(),
        routing: env.routing.clone(),
        entry_index,
        shutdown: env.shutdown.clone(),
        cross_lock,
        processor: env.processor.clone(),
        term_flag,
    };
    let pool = match Pool::new(env.thread_pool.clone(), ctx) {
        Ok(pool) => pool,
        Err(e) => {
            error!(slot, error = %e, "cannot set up worker thread pool");
            return EXIT_CHILD_FATAL;
        }
    };

    info!(
        slot,
        pid = std::process::id(),
        entry = entry_index,
        "worker process serving"
    );
    match pool.run() {
        Ok(()) => 0,
        Err(e) => {
            error!(slot, error = %e, "worker pool failed");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::processor::DrainProcessor;

    #[test]
    fn test_unopenable_lock_file_is_child_fatal() {
        let cfg = ServerConfig::parse("max_processes = 1").unwrap();
        let env = WorkerEnv {
            thread_pool: cfg.thread_pool.clone(),
            listeners: Arc::new(Vec::new()),
            routing: Arc::new(RoutingTable::build(&cfg).unwrap()),
            shutdown: Arc::new(ShutdownChannel::new().unwrap()),
            lock_file: Some(PathBuf::from("/nonexistent-dir/brood-test.lock")),
            processor: Arc::new(DrainProcessor),
        };
        assert_eq!(run(&env, 0), EXIT_CHILD_FATAL);
    }

    #[test]
    fn test_child_fatal_code_is_distinct_from_success_and_failure() {
        assert_ne!(EXIT_CHILD_FATAL, 0);
        assert_ne!(EXIT_CHILD_FATAL, 1);
    }
}
