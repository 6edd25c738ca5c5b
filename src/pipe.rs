//! Unidirectional byte channel used to wire one standard stream of a child.

use crate::utils::ensure;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::os::fd::{FromRawFd, OwnedFd};

/// Both ends of a freshly opened pipe.
///
/// Both ends are close-on-exec. dup2 clears the flag on the copy, so the
/// child's rewired stdio still survives an exec.
///
/// Lives only for the duration of a spawn: afterwards each side keeps exactly
/// one end and the other one has been closed.
#[derive(Debug)]
pub(crate) struct Pipe {
    /// Bytes written to `write` come out here
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    /// Open a new pipe, aborting the program if the descriptor table is full.
    pub fn open() -> Self {
        let (read, write) = ensure(pipe2(OFlag::O_CLOEXEC), "Unable to open pipe");
        // SAFETY: pipe(2) just returned both descriptors and nothing else owns them.
        unsafe {
            Self {
                read: OwnedFd::from_raw_fd(read),
                write: OwnedFd::from_raw_fd(write),
            }
        }
    }
}
