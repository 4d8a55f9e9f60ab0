// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printwatch.

use thiserror::Error;

/// Top-level error type for all Printwatch operations.
#[derive(Debug, Error)]
pub enum PrintwatchError {
    // -- Device queries --
    #[error("device query failed: {0}")]
    QueryFailure(String),

    #[error("device protocol unreachable: {0}")]
    ProtocolUnreachable(String),

    #[error("malformed collaborator data: {0}")]
    MalformedData(String),

    // -- Storage / persistence --
    #[error("page store write failed: {0}")]
    Persist(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- Cloud channel --
    #[error("cloud channel fault: {0}")]
    ChannelFault(String),

    // -- Agent surface --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    // -- Platform --
    #[error("feature not available on this platform")]
    PlatformUnavailable,
}

impl PrintwatchError {
    /// Whether the operation is worth retrying on the next cycle.
    ///
    /// Bad input and bad configuration never heal by themselves; everything
    /// that touches a device, the disk or the network might.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::QueryFailure(_)
            | Self::ProtocolUnreachable(_)
            | Self::Persist(_)
            | Self::ChannelFault(_)
            | Self::HttpServer(_) => true,
            Self::Io(io_err) => !matches!(
                io_err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            Self::MalformedData(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::InvalidRequest(_)
            | Self::PlatformUnavailable => false,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintwatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_and_channel_faults_are_recoverable() {
        assert!(PrintwatchError::QueryFailure("spooler down".into()).is_recoverable());
        assert!(PrintwatchError::ChannelFault("reset".into()).is_recoverable());
        assert!(PrintwatchError::Persist("disk full".into()).is_recoverable());
    }

    #[test]
    fn bad_input_is_not_recoverable() {
        assert!(!PrintwatchError::MalformedData("not json".into()).is_recoverable());
        assert!(!PrintwatchError::InvalidRequest("pages".into()).is_recoverable());
        assert!(!PrintwatchError::PlatformUnavailable.is_recoverable());
    }

    #[test]
    fn io_kind_decides_recoverability() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(PrintwatchError::Io(timeout).is_recoverable());
        assert!(!PrintwatchError::Io(missing).is_recoverable());
    }
}
