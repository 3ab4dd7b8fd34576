//! Forking workers into slots and reclaiming them at the end.

use crate::error::{BroodError, Result};
use crate::supervisor::table::ProcessTable;
use crate::worker::{self, WorkerEnv};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Back-off after a failed fork so a resource-starved box is not hammered
/// with fork attempts.
const FORK_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Reclaim escalation schedule.
const RECLAIM_POLL: Duration = Duration::from_millis(100);
const RECLAIM_RESEND_TERM_AFTER: Duration = Duration::from_secs(2);
const RECLAIM_KILL_AFTER: Duration = Duration::from_secs(4);
const RECLAIM_GIVE_UP_AFTER: Duration = Duration::from_secs(8);

/// Fork a worker process into `slot`.
///
/// The child never returns from this call; it serves and exits with the
/// code `worker::run` produces.
pub fn make_child(env: &WorkerEnv, table: &mut ProcessTable, slot: usize) -> Result<Pid> {
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = worker::run(env, slot);
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            table.started(slot, child);
            debug!(slot, pid = child.as_raw(), "spawned worker process");
            Ok(child)
        }
        Err(e) => {
            error!(slot, error = %e, "unable to fork worker process");
            std::thread::sleep(FORK_RETRY_BACKOFF);
            Err(BroodError::Spawn(format!("fork: {}", e)))
        }
    }
}

/// Reap every live slot, escalating from the terminate already sent to a
/// repeated terminate and finally a kill. Bounded: gives up rather than
/// hanging the supervisor on an unkillable child.
pub fn reclaim_children(table: &mut ProcessTable) {
    let start = Instant::now();
    let mut term_resent = false;
    let mut kill_sent = false;

    while table.live_count() > 0 {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        if table.record_exit(pid).is_some() {
                            debug!(pid = pid.as_raw(), "reclaimed worker");
                        }
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // No children left at all; whatever the table still
                    // holds is gone.
                    for pid in table.live_pids() {
                        table.record_exit(pid);
                    }
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "waitpid failed during reclaim");
                    break;
                }
            }
        }
        if table.live_count() == 0 {
            break;
        }

        let elapsed = start.elapsed();
        if elapsed >= RECLAIM_GIVE_UP_AFTER {
            error!(
                survivors = table.live_count(),
                "workers survived SIGKILL, abandoning reclaim"
            );
            break;
        } else if elapsed >= RECLAIM_KILL_AFTER && !kill_sent {
            warn!(
                survivors = table.live_count(),
                "workers ignored SIGTERM, sending SIGKILL"
            );
            for pid in table.live_pids() {
                let _ = kill(pid, Signal::SIGKILL);
            }
            kill_sent = true;
        } else if elapsed >= RECLAIM_RESEND_TERM_AFTER && !term_resent {
            for pid in table.live_pids() {
                let _ = kill(pid, Signal::SIGTERM);
            }
            term_resent = true;
        }

        std::thread::sleep(RECLAIM_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sleeper(table: &mut ProcessTable, slot: usize) -> Pid {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);
        table.started(slot, pid);
        pid
    }

    #[test]
    fn test_reclaim_after_terminate() {
        let mut table = ProcessTable::new(2);
        let a = spawn_sleeper(&mut table, 0);
        let b = spawn_sleeper(&mut table, 1);
        assert_eq!(table.live_count(), 2);

        kill(a, Signal::SIGTERM).unwrap();
        kill(b, Signal::SIGTERM).unwrap();
        reclaim_children(&mut table);

        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_reclaim_escalates_to_kill() {
        let mut table = ProcessTable::new(1);
        // A child that shrugs off SIGTERM forces the SIGKILL stage.
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 60"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn stubborn child");
        let pid = Pid::from_raw(child.id() as i32);
        table.started(0, pid);

        // Give the shell a moment to install its trap before the TERM.
        std::thread::sleep(Duration::from_millis(200));
        kill(pid, Signal::SIGTERM).unwrap();
        reclaim_children(&mut table);

        assert_eq!(table.live_count(), 0);
    }
}
