//! Error types for terrarium
//!
//! Errors are structured with fields to aid debugging. Probe failures are
//! deliberately NOT represented here: an unreachable probe target resolves
//! to a safe default snapshot (see [`crate::probe`]), never an error.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for terrarium operations
#[derive(Debug, Error)]
pub enum Error {
    /// External command failed to spawn or exited nonzero
    #[error("command failed: {command}: {message}")]
    Command {
        /// The command that failed (program name plus subcommand)
        command: String,
        /// Stderr or spawn error detail
        message: String,
    },

    /// Bounded wait exceeded its budget
    #[error("timed out waiting for {label} after {elapsed:?}")]
    Timeout {
        /// Label of the wait that expired
        label: String,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// Initialize response could not be decoded into a credential
    #[error("credential parse failure: {message}")]
    CredentialParse {
        /// What was malformed or missing
        message: String,
    },

    /// Manifest or release rejected after bounded retries
    #[error("apply failed for {name} after {attempts} attempts: {message}")]
    Apply {
        /// Name of the resource or release being applied
        name: String,
        /// Number of attempts made
        attempts: u32,
        /// Last rejection detail
        message: String,
    },

    /// Destructive secret-store reset failed partway
    #[error("reset failed: {message}")]
    Reset {
        /// What failed during the reset
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid environment configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "gate", "lifecycle")
        context: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a command error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a labeled wait
    pub fn timeout(label: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            label: label.into(),
            elapsed,
        }
    }

    /// Create a credential parse error
    pub fn credential_parse(msg: impl Into<String>) -> Self {
        Self::CredentialParse {
            message: msg.into(),
        }
    }

    /// Create an apply error with attempt count
    pub fn apply_for(name: impl Into<String>, attempts: u32, msg: impl Into<String>) -> Self {
        Self::Apply {
            name: name.into(),
            attempts,
            message: msg.into(),
        }
    }

    /// Create a reset error
    pub fn reset(msg: impl Into<String>) -> Self {
        Self::Reset {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Config, serialization, and credential-parse errors require a fix and
    /// are not retryable. Command and apply failures may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Command { .. } => true,
            Error::Timeout { .. } => false,
            Error::CredentialParse { .. } => false,
            Error::Apply { .. } => true,
            Error::Reset { .. } => true,
            Error::Serialization { .. } => false,
            Error::InvalidConfig(_) => false,
            Error::Internal { .. } => true,
            Error::Io(_) => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
