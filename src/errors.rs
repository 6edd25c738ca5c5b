//! Recoverable errors returned by process operations
//!
//! Only conditions a caller can reasonably branch on live here. Descriptor
//! table failures and broken preconditions are not errors, see [`crate::utils`].

use nix::unistd::Pid;
use std::fmt;
use thiserror::Error;

/// Lifecycle state reported by [`ProcessError::InvalidState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// The child has not been reaped yet
    Alive,
    /// The child has been reaped and its exit status recorded
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => f.write_str("alive"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Custom error type for process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    /// fork(2) failed, no child was created
    #[error("Unable to fork: {0}")]
    UnableToFork(#[source] nix::Error),

    /// The operation is not valid in the current lifecycle state
    #[error("Invalid process state: process {pid} is {state}")]
    InvalidState { pid: Pid, state: LifecycleState },
}

/// Result type alias for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let error = ProcessError::InvalidState {
            pid: Pid::from_raw(42),
            state: LifecycleState::Terminated,
        };
        assert_eq!(
            error.to_string(),
            "Invalid process state: process 42 is terminated"
        );
    }

    #[test]
    fn test_unable_to_fork_keeps_source() {
        use std::error::Error as _;

        let error = ProcessError::UnableToFork(nix::Error::EAGAIN);
        assert!(error.to_string().starts_with("Unable to fork"));
        assert!(error.source().is_some());
    }
}
