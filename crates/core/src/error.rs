// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error codes shared by every pipe and manager.
//!
//! Command returns bubble up a single call; they are *not* events.
//! Asynchronous failures are raised as [`Event::Error`]/[`Event::Fatal`]
//! through the probe chain and never perturb the return path.
//!
//! [`Event::Error`]: crate::uprobe::Event::Error
//! [`Event::Fatal`]: crate::uprobe::Event::Fatal

use thiserror::Error;

/// Error taxonomy for control commands and allocation paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UbaseError {
    /// The command is not recognized at this level; propagation is expected.
    #[error("unhandled command")]
    Unhandled,

    /// An argument was rejected (flow-def mismatch, malformed option, ...).
    #[error("invalid argument")]
    Invalid,

    /// An allocation failed.
    #[error("allocation failure")]
    Alloc,

    /// The event pump refused the operation.
    #[error("event pump error")]
    Upump,

    /// A wrapped foreign failure (I/O, OS, library).
    #[error("external error: {0}")]
    External(String),

    /// The operation is not valid in the pipe's current state.
    #[error("resource busy")]
    Busy,
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, UbaseError>;

impl From<std::io::Error> for UbaseError {
    fn from(err: std::io::Error) -> Self {
        Self::External(err.to_string())
    }
}

impl UbaseError {
    /// Whether this code means "fall through to the next handler".
    #[must_use]
    pub const fn is_unhandled(&self) -> bool {
        matches!(self, Self::Unhandled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_wrap_as_external() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: UbaseError = io.into();
        assert!(matches!(err, UbaseError::External(_)));
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn unhandled_is_the_only_fallthrough() {
        assert!(UbaseError::Unhandled.is_unhandled());
        assert!(!UbaseError::Invalid.is_unhandled());
        assert!(!UbaseError::Busy.is_unhandled());
    }
}
