//! Run a function in a forked child process wired through pipes
//!
//! [`Process::spawn`] forks, points the child's stdin, stdout and stderr at
//! pipes owned by the returned handle, and runs the supplied function in the
//! child. The parent writes the child's input, reads its output and error
//! streams, waits for it, or cancels it with SIGTERM escalating to SIGKILL.
//!
//! Linux and the BSDs (needs pipe2(2)).

pub mod errors;
mod pipe;
pub mod process;
pub mod signal;
mod utils;

// Re-export commonly used types
pub use errors::{LifecycleState, ProcessError, ProcessResult};
pub use process::{exit, ExitInfo, InputStream, OutputStream, Process, ProcessBuilder};
pub use signal::CancelPolicy;
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
