//! Server configuration loaded from a TOML file.
//!
//! Values that exceed the compile-time hard limits are clamped with a
//! warning rather than rejected, so an over-ambitious config degrades to a
//! running server instead of a refusal to boot. Inconsistencies that cannot
//! be clamped (identity bindings claiming more slots than exist) are errors.

use crate::error::{BroodError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Upper bound on worker processes, compiled in.
pub const HARD_PROCESS_LIMIT: usize = 64;

/// Upper bound on worker threads per process, compiled in.
pub const HARD_THREAD_LIMIT: usize = 64;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Number of worker process slots.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,

    /// Processes to fork at startup (0 = same as `max_processes`).
    #[serde(default)]
    pub start_processes: usize,

    /// Listening socket addresses.
    #[serde(default = "default_listeners")]
    pub listeners: Vec<String>,

    /// Cross-process accept lock file. When absent the cross-process half
    /// of accept serialization is a no-op (single-process deployments).
    #[serde(default)]
    pub lock_file: Option<PathBuf>,

    /// Pid file written at startup and removed on clean shutdown.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Per-process worker thread pool settings.
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,

    /// Identity bindings, assigned to process slots in declaration order.
    /// Slots left over run unassigned and serve the default routing entry.
    #[serde(default, rename = "identity")]
    pub identities: Vec<IdentityBinding>,
}

/// Worker thread pool settings for one worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadPoolConfig {
    /// Threads created when the process starts.
    #[serde(default = "default_start_threads")]
    pub start_threads: usize,

    /// Below this many idle threads, a thread finishing a connection spawns
    /// a replacement.
    #[serde(default = "default_min_spare")]
    pub min_spare_threads: usize,

    /// Above this many idle threads, a thread finishing a connection
    /// retires instead of going idle.
    #[serde(default = "default_max_spare")]
    pub max_spare_threads: usize,

    /// Hard cap on threads in one process.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Connections a process serves before exiting (0 = unlimited).
    #[serde(default)]
    pub request_budget: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            start_threads: default_start_threads(),
            min_spare_threads: default_min_spare(),
            max_spare_threads: default_max_spare(),
            max_threads: default_max_threads(),
            request_budget: 0,
        }
    }
}

/// Binds a number of process slots to a credential.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityBinding {
    pub uid: u32,
    pub gid: u32,
    /// Number of consecutive process slots bound to this identity.
    #[serde(default = "default_binding_processes")]
    pub processes: usize,
}

fn default_max_processes() -> usize {
    4
}

fn default_listeners() -> Vec<String> {
    vec!["127.0.0.1:8080".to_string()]
}

fn default_start_threads() -> usize {
    5
}

fn default_min_spare() -> usize {
    5
}

fn default_max_spare() -> usize {
    10
}

fn default_max_threads() -> usize {
    HARD_THREAD_LIMIT
}

fn default_binding_processes() -> usize {
    1
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BroodError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut cfg: ServerConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Clamp out-of-range values (warning) and reject inconsistencies.
    pub fn validate(&mut self) -> Result<()> {
        if self.max_processes > HARD_PROCESS_LIMIT {
            warn!(
                requested = self.max_processes,
                limit = HARD_PROCESS_LIMIT,
                "max_processes exceeds compile-time limit, lowering"
            );
            self.max_processes = HARD_PROCESS_LIMIT;
        }
        if self.max_processes < 1 {
            warn!("max_processes must be at least 1, raising");
            self.max_processes = 1;
        }

        if self.start_processes == 0 || self.start_processes > self.max_processes {
            if self.start_processes > self.max_processes {
                warn!(
                    requested = self.start_processes,
                    max = self.max_processes,
                    "start_processes exceeds max_processes, lowering"
                );
            }
            self.start_processes = self.max_processes;
        }

        let tp = &mut self.thread_pool;
        if tp.max_threads > HARD_THREAD_LIMIT {
            warn!(
                requested = tp.max_threads,
                limit = HARD_THREAD_LIMIT,
                "max_threads exceeds compile-time limit, lowering"
            );
            tp.max_threads = HARD_THREAD_LIMIT;
        }
        if tp.start_threads < 1 {
            warn!("start_threads must be at least 1, raising");
            tp.start_threads = 1;
        }
        if tp.start_threads > tp.max_threads {
            warn!(
                requested = tp.start_threads,
                max = tp.max_threads,
                "start_threads exceeds max_threads, lowering"
            );
            tp.start_threads = tp.max_threads;
        }
        if tp.min_spare_threads < 1 {
            warn!("min_spare_threads must be at least 1, raising");
            tp.min_spare_threads = 1;
        }
        if tp.max_spare_threads > tp.max_threads {
            warn!(
                requested = tp.max_spare_threads,
                max = tp.max_threads,
                "max_spare_threads exceeds max_threads, lowering"
            );
            tp.max_spare_threads = tp.max_threads;
        }
        if tp.max_spare_threads < tp.min_spare_threads {
            warn!(
                min = tp.min_spare_threads,
                max = tp.max_spare_threads,
                "max_spare_threads below min_spare_threads, raising"
            );
            tp.max_spare_threads = tp.min_spare_threads;
        }

        if self.listeners.is_empty() {
            return Err(BroodError::Config(
                "no listening sockets configured".to_string(),
            ));
        }
        self.socket_addrs()?;

        let bound: usize = self.identities.iter().map(|b| b.processes).sum();
        if bound > self.max_processes {
            return Err(BroodError::Config(format!(
                "identity bindings claim {} process slots but max_processes is {}",
                bound, self.max_processes
            )));
        }

        Ok(())
    }

    /// Parsed listener addresses.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|s| {
                s.parse().map_err(|_| {
                    BroodError::Config(format!("invalid listener address: {}", s))
                })
            })
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            start_processes: default_max_processes(),
            listeners: default_listeners(),
            lock_file: None,
            pid_file: None,
            thread_pool: ThreadPoolConfig::default(),
            identities: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_gets_defaults() {
        let cfg = ServerConfig::parse("").unwrap();
        assert_eq!(cfg.max_processes, 4);
        assert_eq!(cfg.start_processes, 4);
        assert_eq!(cfg.thread_pool.start_threads, 5);
        assert_eq!(cfg.thread_pool.request_budget, 0);
        assert!(cfg.identities.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let cfg = ServerConfig::parse(
            r#"
            max_processes = 8
            start_processes = 2
            listeners = ["0.0.0.0:8080", "0.0.0.0:8443"]
            lock_file = "/tmp/brood.lock"
            pid_file = "/tmp/brood.pid"

            [thread_pool]
            start_threads = 3
            min_spare_threads = 2
            max_spare_threads = 6
            max_threads = 16
            request_budget = 1000

            [[identity]]
            uid = 1000
            gid = 1000
            processes = 2

            [[identity]]
            uid = 1001
            gid = 1001
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_processes, 8);
        assert_eq!(cfg.start_processes, 2);
        assert_eq!(cfg.listeners.len(), 2);
        assert_eq!(cfg.thread_pool.request_budget, 1000);
        assert_eq!(cfg.identities.len(), 2);
        assert_eq!(cfg.identities[0].processes, 2);
        assert_eq!(cfg.identities[1].processes, 1);
    }

    #[test]
    fn test_limits_are_clamped() {
        let cfg = ServerConfig::parse(
            r#"
            max_processes = 1000
            [thread_pool]
            max_threads = 1000
            start_threads = 500
            max_spare_threads = 999
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_processes, HARD_PROCESS_LIMIT);
        assert_eq!(cfg.thread_pool.max_threads, HARD_THREAD_LIMIT);
        assert_eq!(cfg.thread_pool.start_threads, HARD_THREAD_LIMIT);
        assert_eq!(cfg.thread_pool.max_spare_threads, HARD_THREAD_LIMIT);
    }

    #[test]
    fn test_zero_start_processes_means_all() {
        let cfg = ServerConfig::parse("max_processes = 6").unwrap();
        assert_eq!(cfg.start_processes, 6);
    }

    #[test]
    fn test_max_spare_raised_to_min_spare() {
        let cfg = ServerConfig::parse(
            r#"
            [thread_pool]
            min_spare_threads = 8
            max_spare_threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.thread_pool.max_spare_threads, 8);
    }

    #[test]
    fn test_identity_overflow_is_rejected() {
        let err = ServerConfig::parse(
            r#"
            max_processes = 2
            [[identity]]
            uid = 1000
            gid = 1000
            processes = 3
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("identity bindings"));
    }

    #[test]
    fn test_bad_listener_is_rejected() {
        let err = ServerConfig::parse(r#"listeners = ["not-an-addr"]"#).unwrap_err();
        assert!(err.to_string().contains("invalid listener address"));
    }

    #[test]
    fn test_empty_listeners_rejected() {
        let err = ServerConfig::parse("listeners = []").unwrap_err();
        assert!(err.to_string().contains("no listening sockets"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ServerConfig::parse("no_such_field = 1").is_err());
    }
}
