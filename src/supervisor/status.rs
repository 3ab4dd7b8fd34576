//! Classification of worker exit statuses.
//!
//! The supervisor treats every exit the same for respawn accounting, but
//! operators need to see the difference between a worker that served out
//! its budget and one that never got past setup.

use crate::worker::EXIT_CHILD_FATAL;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit: budget exhausted, poison byte, or terminate.
    Clean,
    /// Exited with [`EXIT_CHILD_FATAL`]: setup failed before serving.
    ChildFatal,
    /// Exited with some other nonzero code.
    Failed(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Not actually exited.
    StillAlive,
    /// Anything waitpid reports that has no useful classification.
    Unknown,
}

impl ExitKind {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    /// True for exits that mean the worker never served a connection.
    pub fn is_setup_fatal(&self) -> bool {
        matches!(self, Self::ChildFatal)
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "exited normally"),
            Self::ChildFatal => write!(f, "exited after fatal setup failure"),
            Self::Failed(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "ended for an unknown reason"),
        }
    }
}

/// Classify a `WaitStatus` from the supervisor's reap loop.
pub fn classify_exit(status: WaitStatus) -> ExitKind {
    match status {
        WaitStatus::Exited(_, 0) => ExitKind::Clean,
        WaitStatus::Exited(_, code) if code == EXIT_CHILD_FATAL => ExitKind::ChildFatal,
        WaitStatus::Exited(_, code) => ExitKind::Failed(code),
        WaitStatus::Signaled(_, signal, _) => ExitKind::Signaled(signal),
        WaitStatus::StillAlive => ExitKind::StillAlive,
        _ => ExitKind::Unknown,
    }
}
