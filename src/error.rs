//! Error types for brood.

use thiserror::Error;

/// Main error type for brood.
#[derive(Error, Debug)]
pub enum BroodError {
    /// Unrecoverable per-process initialization failure (lock init,
    /// privilege drop). A worker hitting this exits with the child-fatal
    /// code instead of serving.
    #[error("Setup failure: {0}")]
    Setup(String),

    /// Process or thread creation failed; callers back off and degrade
    /// instead of crash-looping.
    #[error("Spawn failure: {0}")]
    Spawn(String),

    /// Malformed descriptor handoff on a routing socket. The connection is
    /// dropped; the sender has already discarded its copy.
    #[error("Handoff protocol violation: {0}")]
    Handoff(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for brood operations.
pub type Result<T> = std::result::Result<T, BroodError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_setup_error_message() {
        let err = BroodError::Setup("could not open accept lock".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Setup failure"));
        assert!(msg.contains("accept lock"));
    }

    #[test]
    fn test_handoff_error_message() {
        let err = BroodError::Handoff("no descriptor in ancillary data".to_string());
        assert!(err.to_string().contains("protocol violation"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no such lock file");
        let err: BroodError = io_err.into();
        assert!(err.to_string().contains("no such lock file"));
    }

    #[test]
    fn test_errno_conversion() {
        let err: BroodError = nix::errno::Errno::EINTR.into();
        assert!(err.to_string().contains("EINTR"));
    }

    #[test]
    fn test_config_parse_conversion() {
        let parse_err = toml::from_str::<toml::Table>("not = = toml").unwrap_err();
        let err: BroodError = parse_err.into();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<()> {
            Err(BroodError::Spawn("fork failed".into()))
        }
        assert!(returns_err().is_err());
    }
}
