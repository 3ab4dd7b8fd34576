//! The supervisor: owns the process table and the shutdown/restart state
//! machine.
//!
//! One long-lived process forks the workers, reaps them, refills empty
//! slots at an adaptively scaled rate, and drives the three-signal state
//! machine (terminate, graceful restart, immediate restart). Workers never
//! write to the table; their exits are observed through wait.

use crate::config::ServerConfig;
use crate::error::{BroodError, Result};
use crate::processor::ConnectionProcessor;
use crate::routing::RoutingTable;
use crate::supervisor::signals::ControlFlags;
use crate::supervisor::spawn::{make_child, reclaim_children};
use crate::supervisor::status::classify_exit;
use crate::supervisor::table::ProcessTable;
use crate::worker::WorkerEnv;
use crate::worker::shutdown::ShutdownChannel;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgrp};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hard cap on processes spawned in one maintenance cycle.
pub const MAX_SPAWN_RATE: usize = 32;

/// Maintenance cycles that suppress spawn-rate doubling after a graceful
/// restart, while the previous generation is still dying off.
const GRACEFUL_HOLD_OFF: u32 = 10;

/// Granularity of the bounded child-exit wait; ten of these make the
/// roughly one-second maintenance interval.
const REAP_POLL: Duration = Duration::from_millis(100);
const REAP_POLLS_PER_CYCLE: u32 = 10;

/// How a supervisor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Terminate requested; everything is reaped and cleaned up.
    Shutdown,
    /// Restart requested; the caller reloads configuration and calls
    /// `run` again after `reconfigure`.
    Restart { graceful: bool },
}

/// The worker-process supervisor.
pub struct Supervisor {
    cfg: ServerConfig,
    table: ProcessTable,
    flags: ControlFlags,
    env: WorkerEnv,
    spawn_rate: usize,
    hold_off: u32,
    /// After a graceful restart the old generation is still serving, so
    /// the next run must not bulk-start a full complement.
    skip_bulk_startup: bool,
}

impl Supervisor {
    /// Bind listeners, build the routing table and shutdown channel, and
    /// prepare (but do not start) the worker fleet.
    pub fn new(cfg: ServerConfig, processor: Arc<dyn ConnectionProcessor>) -> Result<Self> {
        let mut listeners = Vec::new();
        for addr in cfg.socket_addrs()? {
            let listener = TcpListener::bind(addr).map_err(|e| {
                BroodError::Config(format!("cannot bind {}: {}", addr, e))
            })?;
            info!(%addr, "listening");
            listeners.push(listener);
        }

        let routing = Arc::new(RoutingTable::build(&cfg)?);
        info!(
            identity_entries = routing.entry_count() - 1,
            "routing table ready"
        );
        let shutdown = Arc::new(ShutdownChannel::new()?);
        let env = WorkerEnv {
            thread_pool: cfg.thread_pool.clone(),
            listeners: Arc::new(listeners),
            routing,
            shutdown,
            lock_file: cfg.lock_file.clone(),
            processor,
        };
        let table = ProcessTable::new(cfg.max_processes);

        Ok(Self {
            cfg,
            table,
            flags: ControlFlags::new(),
            env,
            spawn_rate: 1,
            hold_off: 0,
            skip_bulk_startup: false,
        })
    }

    /// Install the three-signal handlers. Call once, before the first run.
    pub fn install_signal_handlers(&self) -> Result<()> {
        self.flags.install()
    }

    /// Control flags, for callers that drive shutdown or restart without
    /// a signal.
    pub fn control_flags(&self) -> &ControlFlags {
        &self.flags
    }

    /// Run the supervisor until a shutdown or restart is requested.
    pub fn run(&mut self) -> Result<Outcome> {
        self.write_pid_file();

        let mut remaining = self.cfg.start_processes;
        if self.skip_bulk_startup {
            // Graceful restart: the dying generation is replaced one for
            // one as its processes exit.
            self.skip_bulk_startup = false;
        } else {
            remaining = self.startup_children(remaining);
        }
        info!(
            processes = self.cfg.max_processes,
            "supervisor resuming normal operations"
        );

        while !self.flags.stop_requested() {
            if let Some((pid, status)) = self.wait_or_timeout() {
                self.handle_exit(pid, status, &mut remaining);
                // Maintenance runs only on quiet cycles; a burst of exits
                // is handled one reap at a time.
                continue;
            }
            if self.flags.stop_requested() {
                break;
            }
            if remaining > 0 {
                remaining = self.startup_children(remaining);
                continue;
            }
            self.table.promote_started();
            self.perform_maintenance();
        }

        if self.flags.shutdown_requested() {
            self.shutdown_sequence();
            Ok(Outcome::Shutdown)
        } else if self.flags.graceful_requested() {
            self.graceful_restart_sequence()?;
            Ok(Outcome::Restart { graceful: true })
        } else {
            self.immediate_restart_sequence();
            Ok(Outcome::Restart { graceful: false })
        }
    }

    /// Apply a reloaded configuration between runs.
    ///
    /// Listeners, routing sockets and the shutdown channel are created
    /// exactly once at startup; changes to those sections need a full
    /// stop/start and are reported, not applied.
    pub fn reconfigure(&mut self, cfg: ServerConfig) {
        if cfg.listeners != self.cfg.listeners {
            warn!("listener changes require a full restart, keeping current listeners");
        }
        if cfg.identities != self.cfg.identities {
            warn!("identity binding changes require a full restart, keeping current bindings");
        }
        if cfg.max_processes > self.table.len() {
            self.table.grow(cfg.max_processes);
        } else if cfg.max_processes < self.table.len() {
            warn!(
                configured = cfg.max_processes,
                current = self.table.len(),
                "max_processes lowered; surplus slots retire as their processes exit"
            );
        }
        self.env.thread_pool = cfg.thread_pool.clone();
        self.cfg = cfg;
        self.flags.reset();
        self.spawn_rate = 1;
    }

    /// Fork until `number_to_start` workers are alive, one pass over the
    /// slots. Returns how many are still owed (fork failure stops the
    /// pass).
    fn startup_children(&mut self, mut number_to_start: usize) -> usize {
        for slot in 0..self.cfg.max_processes.min(self.table.len()) {
            if number_to_start == 0 {
                break;
            }
            if self.table.slot(slot).is_live() {
                continue;
            }
            if make_child(&self.env, &mut self.table, slot).is_err() {
                break;
            }
            number_to_start -= 1;
        }
        number_to_start
    }

    /// Bounded wait for any child exit; `None` is the timeout that lets
    /// maintenance run even when nothing is dying.
    fn wait_or_timeout(&mut self) -> Option<(Pid, WaitStatus)> {
        for _ in 0..REAP_POLLS_PER_CYCLE {
            if self.flags.stop_requested() {
                return None;
            }
            loop {
                match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(status) => {
                        if let Some(pid) = status.pid() {
                            return Some((pid, status));
                        }
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => break,
                    Err(e) => {
                        warn!(error = %e, "waitpid failed");
                        break;
                    }
                }
            }
            std::thread::sleep(REAP_POLL);
        }
        None
    }

    fn handle_exit(&mut self, pid: Pid, status: WaitStatus, remaining: &mut usize) {
        let kind = classify_exit(status);
        match self.table.record_exit(pid) {
            Some(slot) => {
                if kind.is_setup_fatal() {
                    warn!(slot, pid = pid.as_raw(), "worker never served: {}", kind);
                } else if kind.is_clean() {
                    debug!(slot, pid = pid.as_raw(), "worker {}", kind);
                } else {
                    warn!(slot, pid = pid.as_raw(), "worker {}", kind);
                }

                // One-for-one replacement while the startup quota is
                // still outstanding.
                if *remaining > 0
                    && slot < self.cfg.max_processes
                    && make_child(&self.env, &mut self.table, slot).is_ok()
                {
                    *remaining -= 1;
                }
            }
            None => {
                warn!(pid = pid.as_raw(), "long lost child came home");
            }
        }
    }

    /// Refill empty slots, at most `spawn_rate` per cycle, then adapt the
    /// rate. The doubling/reset/hold-off arithmetic is load-bearing for
    /// avoiding fork storms; see `adapt_spawn_rate`.
    fn perform_maintenance(&mut self) {
        let quota = self.spawn_rate.min(MAX_SPAWN_RATE);
        let free = self.table.free_slots(self.cfg.max_processes, quota);
        let needed = !free.is_empty();

        if needed {
            let mut spawned = 0;
            for slot in free {
                if make_child(&self.env, &mut self.table, slot).is_err() {
                    break;
                }
                spawned += 1;
            }
            debug!(spawned, rate = self.spawn_rate, "maintenance refilled slots");
        }

        let (rate, hold_off) = adapt_spawn_rate(self.spawn_rate, self.hold_off, needed);
        self.spawn_rate = rate;
        self.hold_off = hold_off;
    }

    fn shutdown_sequence(&mut self) {
        info!("terminate requested, stopping worker processes");
        broadcast_terminate();
        reclaim_children(&mut self.table);
        self.remove_pid_file();
        info!("shutdown complete");
    }

    /// Mark the fleet dying and deliver one poison byte per live process;
    /// the workers finish their in-flight connections and exit on their
    /// own, reaped by the next run.
    fn graceful_restart_sequence(&mut self) -> Result<()> {
        let dying = self.table.mark_all_dying();
        info!(processes = dying, "graceful restart, poisoning worker processes");
        self.env.shutdown.broadcast(dying)?;
        self.hold_off = GRACEFUL_HOLD_OFF;
        self.skip_bulk_startup = true;
        Ok(())
    }

    fn immediate_restart_sequence(&mut self) {
        info!("immediate restart, terminating worker processes");
        broadcast_terminate();
        reclaim_children(&mut self.table);
    }

    fn write_pid_file(&self) {
        if let Some(path) = &self.cfg.pid_file {
            match std::fs::write(path, format!("{}\n", std::process::id())) {
                Ok(()) => info!(path = %path.display(), "wrote pid file"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot write pid file"),
            }
        }
    }

    fn remove_pid_file(&self) {
        if let Some(path) = &self.cfg.pid_file {
            match std::fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "removed pid file"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove pid file"),
            }
        }
    }
}

/// Send terminate to the whole process group. The supervisor receives its
/// own signal too; its handler only latches the already-latched flag.
fn broadcast_terminate() {
    if let Err(e) = killpg(getpgrp(), Signal::SIGTERM) {
        warn!(error = %e, "killpg SIGTERM failed");
    }
}

/// The spawn-rate control law: double (capped) after a cycle that needed
/// spawns, reset to one after an idle cycle, and burn down a hold-off
/// cycle instead of doubling while one is pending.
fn adapt_spawn_rate(rate: usize, hold_off: u32, needed_spawns: bool) -> (usize, u32) {
    if needed_spawns {
        if hold_off > 0 {
            (rate, hold_off - 1)
        } else {
            ((rate * 2).min(MAX_SPAWN_RATE), hold_off)
        }
    } else {
        (1, hold_off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::DrainProcessor;
    use nix::unistd::Pid;

    fn supervisor(toml: &str) -> Supervisor {
        let cfg = ServerConfig::parse(toml).unwrap();
        Supervisor::new(cfg, Arc::new(DrainProcessor)).unwrap()
    }

    #[test]
    fn test_spawn_rate_doubles_to_cap() {
        let mut rate = 1;
        let mut hold_off = 0;
        let expected = [2, 4, 8, 16, 32, 32, 32];
        for want in expected {
            (rate, hold_off) = adapt_spawn_rate(rate, hold_off, true);
            assert_eq!(rate, want);
            assert_eq!(hold_off, 0);
        }
    }

    #[test]
    fn test_idle_cycle_resets_rate() {
        let (rate, hold_off) = adapt_spawn_rate(16, 0, false);
        assert_eq!(rate, 1);
        assert_eq!(hold_off, 0);
    }

    #[test]
    fn test_hold_off_suppresses_doubling_exactly_h_cycles() {
        let mut rate = 1;
        let mut hold_off = 3;
        for remaining in [2, 1, 0] {
            (rate, hold_off) = adapt_spawn_rate(rate, hold_off, true);
            assert_eq!(rate, 1, "rate must not double during hold-off");
            assert_eq!(hold_off, remaining);
        }
        (rate, hold_off) = adapt_spawn_rate(rate, hold_off, true);
        assert_eq!(rate, 2, "doubling resumes after hold-off is spent");
        assert_eq!(hold_off, 0);
    }

    #[test]
    fn test_idle_cycle_does_not_burn_hold_off() {
        let (rate, hold_off) = adapt_spawn_rate(4, 2, false);
        assert_eq!(rate, 1);
        assert_eq!(hold_off, 2);
    }

    #[test]
    fn test_new_supervisor_binds_and_is_idle() {
        let sup = supervisor(
            r#"
            max_processes = 3
            listeners = ["127.0.0.1:0"]
            "#,
        );
        assert_eq!(sup.table.len(), 3);
        assert_eq!(sup.table.live_count(), 0);
        assert_eq!(sup.spawn_rate, 1);
        assert_eq!(sup.env.listeners.len(), 1);
    }

    #[test]
    fn test_graceful_restart_poisons_each_live_process_once() {
        let mut sup = supervisor(
            r#"
            max_processes = 4
            listeners = ["127.0.0.1:0"]
            "#,
        );
        // Three live fake workers; one slot empty.
        sup.table.started(0, Pid::from_raw(50_001));
        sup.table.started(1, Pid::from_raw(50_002));
        sup.table.started(2, Pid::from_raw(50_003));

        sup.flags.request_restart(true);
        sup.graceful_restart_sequence().unwrap();

        // Exactly three poison bytes: one per live process.
        for _ in 0..3 {
            assert!(sup.env.shutdown.try_consume().unwrap());
        }
        assert!(!sup.env.shutdown.try_consume().unwrap());

        // All live slots are winding down, and the next run holds off
        // exponential spawning while they die.
        assert_eq!(
            sup.table.mark_all_dying(),
            3,
            "dying slots remain live until reaped"
        );
        assert_eq!(sup.hold_off, GRACEFUL_HOLD_OFF);
        assert!(sup.skip_bulk_startup);
        assert!(sup.flags.graceful_requested());
        assert!(!sup.flags.shutdown_requested());
    }

    #[test]
    fn test_reconfigure_resets_latches_and_grows_table() {
        let mut sup = supervisor(
            r#"
            max_processes = 2
            listeners = ["127.0.0.1:0"]
            "#,
        );
        sup.flags.request_restart(true);
        sup.spawn_rate = 8;

        let cfg = ServerConfig::parse(
            r#"
            max_processes = 5
            listeners = ["127.0.0.1:0"]
            "#,
        )
        .unwrap();
        sup.reconfigure(cfg);

        assert!(!sup.flags.stop_requested());
        assert_eq!(sup.spawn_rate, 1);
        assert_eq!(sup.table.len(), 5);
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("broodd.pid");
        let sup = supervisor(&format!(
            r#"
            max_processes = 1
            listeners = ["127.0.0.1:0"]
            pid_file = "{}"
            "#,
            pid_path.display()
        ));

        sup.write_pid_file();
        let contents = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        sup.remove_pid_file();
        assert!(!pid_path.exists());
    }
}
