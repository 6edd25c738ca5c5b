//! Descriptor helpers and the fatal-error tier
//!
//! Operations on the descriptor table (close, dup2, kill, waitpid) are assumed
//! never to fail under correct usage. When they do, the whole program aborts
//! with a diagnostic instead of returning an error.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{close, dup2};
use std::fmt::Display;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Abort the program after reporting `what` failed because of `cause`.
///
/// Parent side only: it goes through `tracing` and the std stderr handle.
#[cold]
pub(crate) fn fatal(what: &str, cause: impl Display) -> ! {
    tracing::error!("fatal: {}: {}", what, cause);
    let _ = writeln!(io::stderr(), "pipefork: fatal: {}: {}", what, cause);
    std::process::abort()
}

/// Unwrap `result` or abort via [`fatal`].
pub(crate) fn ensure<T, E: Display>(result: Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => fatal(what, e),
    }
}

/// Child-side counterpart of [`ensure`].
///
/// Between fork and exit the child avoids locks it may have inherited in a
/// held state, so the diagnostic is a raw write(2) on whatever fd 2 is.
pub(crate) fn ensure_in_child<T>(result: nix::Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            let message = format!("pipefork: fatal in child: {}: {}\n", what, e);
            let _ = nix::unistd::write(libc::STDERR_FILENO, message.as_bytes());
            std::process::abort()
        }
    }
}

/// Run `op` again for as long as it fails with EINTR.
pub(crate) fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Close `fd`, aborting if close(2) reports an error.
pub(crate) fn close_fd(fd: OwnedFd, what: &str) {
    ensure(close(fd.into_raw_fd()), what);
}

pub(crate) fn close_fd_in_child(fd: OwnedFd) {
    ensure_in_child(close(fd.into_raw_fd()), "close");
}

/// Return `fd` renumbered to 3 or above, closing the original if it was
/// one of the standard stream numbers.
///
/// A parent started with 0, 1 or 2 closed gets pipe ends on those numbers.
pub(crate) fn raise_fd_in_child(fd: OwnedFd) -> OwnedFd {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return fd;
    }
    let raised = ensure_in_child(
        fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(libc::STDERR_FILENO + 1)),
        "fcntl",
    );
    close_fd_in_child(fd);
    // SAFETY: F_DUPFD_CLOEXEC just returned this descriptor.
    unsafe { OwnedFd::from_raw_fd(raised) }
}

/// Move `fd` onto `target`: dup2 it there, then close the original.
///
/// `fd` must not be one of 0-2 (see [`raise_fd_in_child`]). Whatever was
/// open on `target` before is closed by dup2.
pub(crate) fn move_fd_in_child(fd: OwnedFd, target: RawFd) {
    ensure_in_child(retry_eintr(|| dup2(fd.as_raw_fd(), target)), "dup2");
    ensure_in_child(close(fd.into_raw_fd()), "close");
}

/// Terminate the calling process with `code` without running exit handlers
/// or destructors.
pub(crate) fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit(2) only ends the process; nothing it skips is needed in a
    // forked child.
    unsafe { libc::_exit(code) }
}

/// Flush Rust's buffered stdout and stderr.
///
/// Failures are ignored; there is nobody to report them to.
pub(crate) fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}
