//! Error types for device operations.
//!
//! Every failure a tool call can report falls into one of five kinds. The
//! kind decides how the failure is surfaced: conflicts, unresolvable
//! identifiers, missing sessions and invalid configurations always reach the
//! caller, while transient hardware failures on best-effort paths are logged
//! and skipped by the caller.

use std::fmt;

use thiserror::Error;

/// Result type for device operations.
pub type MokuResult<T> = Result<T, MokuError>;

/// Coarse classification of a [`MokuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device is owned by another client.
    Conflict,
    /// The identifier could not be resolved to an address.
    NotFound,
    /// The operation needs an active session.
    Precondition,
    /// The configuration or routing is malformed.
    Validation,
    /// A network or hardware call failed.
    Transient,
}

impl ErrorKind {
    /// Returns the snake-case name used in tool results.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Precondition => "precondition",
            Self::Validation => "validation",
            Self::Transient => "transient",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while talking to a Moku device.
#[derive(Debug, Error)]
pub enum MokuError {
    /// Another owner holds the device.
    #[error("Device {target} is owned by another client")]
    Conflict {
        /// Address or identifier of the contested device.
        target: String,
    },

    /// Identifier is neither address-shaped nor present in the device cache.
    #[error("Could not resolve device identifier '{identifier}'")]
    NotFound {
        /// The identifier as supplied by the caller.
        identifier: String,
    },

    /// Operation attempted without an active session.
    #[error("{message}")]
    Precondition {
        /// What was missing.
        message: String,
    },

    /// Malformed configuration or routing.
    #[error("Invalid configuration: {message}")]
    Validation {
        /// Summary of the first problem.
        message: String,
        /// Every problem found, one entry per issue.
        details: Vec<String>,
    },

    /// Network or hardware call failed.
    #[error("{operation} failed: {message}")]
    Transient {
        /// The operation that was attempted.
        operation: String,
        /// Description of the failure.
        message: String,
    },
}

impl MokuError {
    /// Creates a conflict error.
    pub fn conflict(target: impl Into<String>) -> Self {
        Self::Conflict {
            target: target.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            identifier: identifier.into(),
        }
    }

    /// Creates the standard "no active session" error.
    #[must_use]
    pub fn not_attached() -> Self {
        Self::Precondition {
            message: "Not connected to any device".to_string(),
        }
    }

    /// Creates a validation error from a single message.
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Validation {
            details: vec![message.clone()],
            message,
        }
    }

    /// Creates a validation error from a list of problems.
    ///
    /// The first problem becomes the summary message.
    #[must_use]
    pub fn validation_many(details: Vec<String>) -> Self {
        let message = match details.as_slice() {
            [] => "configuration rejected".to_string(),
            [only] => only.clone(),
            [first, rest @ ..] => format!("{first} (and {} more)", rest.len()),
        };
        Self::Validation { message, details }
    }

    /// Creates a transient error.
    pub fn transient(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Transient { .. } => ErrorKind::Transient,
        }
    }

    /// Returns a short hint telling the caller how to recover.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => {
                "Release the device from the other client, or retry attach_moku with force=true"
            }
            Self::NotFound { .. } => {
                "Run discover_mokus to refresh the device cache, or pass the device IP address"
            }
            Self::Precondition { .. } => "Call attach_moku first",
            Self::Validation { .. } => "Fix the reported problems and resubmit the configuration",
            Self::Transient { .. } => "Check the device is powered and reachable, then retry",
        }
    }

    /// Returns the per-issue details, if this error carries any.
    #[must_use]
    pub fn details(&self) -> Option<&[String]> {
        match self {
            Self::Validation { details, .. } if !details.is_empty() => Some(details),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MokuError::not_found("lab-moku");
        assert_eq!(
            err.to_string(),
            "Could not resolve device identifier 'lab-moku'"
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn precondition_suggests_attach() {
        let err = MokuError::not_attached();
        assert_eq!(err.kind().as_str(), "precondition");
        assert_eq!(err.suggestion(), "Call attach_moku first");
        assert!(err.details().is_none());
    }

    #[test]
    fn validation_many_summarises() {
        let err = MokuError::validation_many(vec![
            "slot 5 out of range".to_string(),
            "unknown port Foo".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid configuration: slot 5 out of range (and 1 more)"
        );
        assert_eq!(err.details().map(<[String]>::len), Some(2));
    }

    #[test]
    fn transient_display() {
        let err = MokuError::transient("claim ownership", "connection refused");
        assert_eq!(err.to_string(), "claim ownership failed: connection refused");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
