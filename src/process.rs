//! Process lifecycle: run a function in a forked child wired through pipes
//!
//! The child's stdin, stdout and stderr are pipes whose other ends are owned
//! by the [`Process`] handle in the parent.

use crate::errors::{LifecycleState, ProcessError, ProcessResult};
use crate::pipe::Pipe;
use crate::signal::{terminate, CancelPolicy};
use crate::utils::{
    close_fd, close_fd_in_child, ensure, exit_immediately, fatal, flush_std_streams,
    move_fd_in_child, raise_fd_in_child, retry_eintr,
};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Held from pipe creation until the parent has dropped the child-side ends,
/// so a spawn on another thread never forks while those ends are open.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Exit code of a child whose function panicked
const PANIC_EXIT_CODE: i32 = 101;

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// The child called exit (or returned from its function)
    pub exited_normally: bool,
    /// Exit status when `exited_normally`, otherwise the terminating signal number
    pub exit_code: i32,
}

impl ExitInfo {
    /// Exited normally with status 0
    pub fn success(&self) -> bool {
        self.exited_normally && self.exit_code == 0
    }

    /// The signal that killed the child, if it did not exit normally
    pub fn signal(&self) -> Option<Signal> {
        if self.exited_normally {
            None
        } else {
            Signal::try_from(self.exit_code).ok()
        }
    }

    fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self {
                exited_normally: true,
                exit_code: code,
            },
            WaitStatus::Signaled(_, signal, _) => Self {
                exited_normally: false,
                exit_code: signal as i32,
            },
            other => fatal("waitpid", format!("unexpected wait status {:?}", other)),
        }
    }
}

/// Builder for spawning processes with a non-default configuration
///
/// # Example
///
/// ```
/// use pipefork::{CancelPolicy, ProcessBuilder};
/// use std::time::Duration;
///
/// let mut process = ProcessBuilder::new()
///     .cancel_policy(CancelPolicy {
///         attempts: 5,
///         interval: Duration::from_millis(100),
///     })
///     .spawn(|| std::thread::sleep(Duration::from_secs(30)))?;
/// process.cancel();
/// assert!(!process.is_alive());
/// process.teardown();
/// # Ok::<(), pipefork::ProcessError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProcessBuilder {
    cancel_policy: CancelPolicy,
}

impl ProcessBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the escalation policy used by [`Process::cancel`]
    pub fn cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    /// Fork a child that runs `f` with its standard streams wired to pipes.
    ///
    /// The child never returns from this call: it exits with status 0 once
    /// `f` returns, or 101 if `f` panics. Use [`exit`] inside `f` for any
    /// other status.
    ///
    /// Forking a multi-threaded program copies only the calling thread. Locks
    /// held by other threads at that moment stay locked forever in the child,
    /// so `f` should not rely on them (the std stdout lock included).
    pub fn spawn<F: FnOnce()>(self, f: F) -> ProcessResult<Process> {
        // SAFETY: the child only rewires descriptors and runs `f` before _exit,
        // it never returns into the caller's stack.
        self.spawn_with_fork(|| unsafe { fork() }, f)
    }

    /// [`ProcessBuilder::spawn`] with the fork(2) call supplied by the caller.
    fn spawn_with_fork<F: FnOnce()>(
        self,
        fork_once: impl FnOnce() -> nix::Result<ForkResult>,
        f: F,
    ) -> ProcessResult<Process> {
        flush_std_streams();
        let guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let error = Pipe::open();
        let output = Pipe::open();
        let input = Pipe::open();

        match fork_once() {
            Err(e) => {
                warn!("fork failed: {}", e);
                Err(ProcessError::UnableToFork(e))
            }
            Ok(ForkResult::Child) => run_child(guard, input, output, error, f),
            Ok(ForkResult::Parent { child }) => {
                close_fd(input.read, "close child stdin end");
                close_fd(output.write, "close child stdout end");
                close_fd(error.write, "close child stderr end");
                drop(guard);

                debug!("Spawned process {}", child);
                Ok(Process {
                    lifecycle: Lifecycle {
                        id: child,
                        state: State::Alive,
                        cancel_policy: self.cancel_policy,
                    },
                    streams: Streams {
                        input: Some(input.write),
                        output: output.read,
                        error: error.read,
                    },
                })
            }
        }
    }
}

/// Child side of a spawn: rewire stdio onto the pipes, run `f`, exit.
///
/// `guard` is this process's copy of the spawn lock. Releasing it lets `f`
/// spawn processes of its own.
fn run_child<F: FnOnce()>(
    guard: MutexGuard<'_, ()>,
    input: Pipe,
    output: Pipe,
    error: Pipe,
    f: F,
) -> ! {
    drop(guard);
    flush_std_streams();

    close_fd_in_child(input.write);
    close_fd_in_child(output.read);
    close_fd_in_child(error.read);

    // Nothing may sit on 0-2 while those numbers are being overwritten.
    let input = raise_fd_in_child(input.read);
    let output = raise_fd_in_child(output.write);
    let error = raise_fd_in_child(error.write);

    move_fd_in_child(input, libc::STDIN_FILENO);
    move_fd_in_child(output, libc::STDOUT_FILENO);
    move_fd_in_child(error, libc::STDERR_FILENO);

    flush_std_streams();
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    flush_std_streams();

    exit_immediately(match outcome {
        Ok(()) => 0,
        Err(_) => PANIC_EXIT_CODE,
    })
}

/// Terminate the calling child with `code`.
///
/// Flushes Rust's stdout and stderr first, then calls `_exit(2)`: no
/// destructors or exit handlers inherited from the parent run.
pub fn exit(code: i32) -> ! {
    flush_std_streams();
    exit_immediately(code)
}

#[derive(Debug, Clone, Copy)]
enum State {
    Alive,
    Terminated(ExitInfo),
}

/// Pid plus cached exit state. Reaps the child if dropped while it is alive.
#[derive(Debug)]
struct Lifecycle {
    id: Pid,
    state: State,
    cancel_policy: CancelPolicy,
}

impl Lifecycle {
    fn is_alive(&self) -> bool {
        matches!(self.state, State::Alive)
    }

    fn invalid_state(&self) -> ProcessError {
        let state = if self.is_alive() {
            LifecycleState::Alive
        } else {
            LifecycleState::Terminated
        };
        ProcessError::InvalidState { pid: self.id, state }
    }

    fn record(&mut self, status: WaitStatus) -> ExitInfo {
        let info = ExitInfo::from_wait_status(status);
        debug!("Process {} terminated: {:?}", self.id, info);
        self.state = State::Terminated(info);
        info
    }

    fn wait(&mut self) -> ProcessResult<ExitInfo> {
        if !self.is_alive() {
            return Err(self.invalid_state());
        }
        let id = self.id;
        let status = ensure(retry_eintr(|| waitpid(id, None)), "waitpid");
        Ok(self.record(status))
    }

    fn exit_info(&self) -> ProcessResult<ExitInfo> {
        match self.state {
            State::Alive => Err(self.invalid_state()),
            State::Terminated(info) => Ok(info),
        }
    }

    fn cancel(&mut self) {
        debug_assert!(self.is_alive(), "cancel on terminated process {}", self.id);
        if !self.is_alive() {
            return;
        }
        debug!("Canceling process {}", self.id);
        match terminate(self.id, &self.cancel_policy) {
            Some(status) => {
                self.record(status);
            }
            None => {
                ensure(self.wait(), "wait after SIGKILL");
            }
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!("Process {} dropped while alive, canceling", self.id);
            self.cancel();
        }
    }
}

/// Parent-side pipe ends
#[derive(Debug)]
struct Streams {
    /// `None` once closed through [`Process::close_input`]
    input: Option<OwnedFd>,
    output: OwnedFd,
    error: OwnedFd,
}

/// A forked child running a caller-supplied function
///
/// The handle owns the parent-side ends of the child's stdin, stdout and
/// stderr pipes. They stay open after the child terminates so buffered output
/// can still be drained, and are closed by [`Process::teardown`].
///
/// Reads and writes are plain read(2)/write(2) calls that block when the pipe
/// is empty or full. Writing a lot of input while the child writes a lot of
/// output deadlocks if a single thread does both; drive the input from
/// another thread (the stream methods take `&self`) or keep writes small.
/// [`Process::cancel`] does not unblock a thread stuck in such a read.
///
/// ```
/// use std::io::{Read, Write};
///
/// let mut process = pipefork::Process::spawn(|| {
///     let mut line = String::new();
///     std::io::stdin().read_line(&mut line).unwrap();
///     std::io::stdout().write_all(line.to_uppercase().as_bytes()).unwrap();
/// })?;
///
/// process.input().write_all(b"hello\n").unwrap();
/// let info = process.wait()?;
/// assert!(info.success());
///
/// let mut output = String::new();
/// process.output().read_to_string(&mut output).unwrap();
/// assert_eq!(output, "HELLO\n");
/// process.teardown();
/// # Ok::<(), pipefork::ProcessError>(())
/// ```
///
/// A torn-down process cannot be used again:
///
/// ```compile_fail
/// let mut process = pipefork::Process::spawn(|| {}).unwrap();
/// process.wait().unwrap();
/// process.teardown();
/// process.is_alive();
/// ```
#[derive(Debug)]
pub struct Process {
    lifecycle: Lifecycle,
    streams: Streams,
}

impl Process {
    /// Spawn `f` with the default configuration, see [`ProcessBuilder::spawn`]
    pub fn spawn<F: FnOnce()>(f: F) -> ProcessResult<Self> {
        ProcessBuilder::new().spawn(f)
    }

    /// Pid of the child
    pub fn id(&self) -> Pid {
        self.lifecycle.id
    }

    /// True until the child's termination has been observed
    pub fn is_alive(&self) -> bool {
        self.lifecycle.is_alive()
    }

    /// Block until the child terminates and record its exit status.
    ///
    /// Fails with [`ProcessError::InvalidState`] if the termination was
    /// already observed by `wait` or `cancel`.
    pub fn wait(&mut self) -> ProcessResult<ExitInfo> {
        self.lifecycle.wait()
    }

    /// Exit status recorded by `wait` or `cancel`.
    ///
    /// Fails with [`ProcessError::InvalidState`] while the child is alive.
    pub fn exit_info(&self) -> ProcessResult<ExitInfo> {
        self.lifecycle.exit_info()
    }

    /// Terminate the child: SIGTERM, poll as the [`CancelPolicy`] says, then
    /// SIGKILL, then reap it. The process must be alive.
    pub fn cancel(&mut self) {
        self.lifecycle.cancel();
    }

    /// Single write(2) to the child's stdin
    pub fn write_input(&self, buffer: &[u8]) -> io::Result<usize> {
        self.input().write(buffer)
    }

    /// Single read(2) from the child's stdout
    pub fn read_output(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.output().read(buffer)
    }

    /// Single read(2) from the child's stderr
    pub fn read_error(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.error().read(buffer)
    }

    /// `io::Write` view over the child's stdin
    pub fn input(&self) -> InputStream<'_> {
        InputStream {
            fd: self.streams.input.as_ref().map(|fd| fd.as_fd()),
        }
    }

    /// `io::Read` view over the child's stdout
    pub fn output(&self) -> OutputStream<'_> {
        OutputStream {
            fd: self.streams.output.as_fd(),
        }
    }

    /// `io::Read` view over the child's stderr
    pub fn error(&self) -> OutputStream<'_> {
        OutputStream {
            fd: self.streams.error.as_fd(),
        }
    }

    /// Close the parent's end of the child's stdin so the child reads EOF.
    ///
    /// Later writes fail with [`io::ErrorKind::BrokenPipe`].
    pub fn close_input(&mut self) {
        if let Some(fd) = self.streams.input.take() {
            close_fd(fd, "close input stream");
        }
    }

    /// Close all pipe ends and release the handle.
    ///
    /// The child must have been reaped by `wait` or `cancel` first.
    pub fn teardown(self) {
        debug_assert!(
            !self.is_alive(),
            "teardown of live process {}",
            self.id()
        );
        let Process { lifecycle, streams } = self;
        if let Some(input) = streams.input {
            close_fd(input, "close input stream");
        }
        close_fd(streams.output, "close output stream");
        close_fd(streams.error, "close error stream");
        debug!("Tore down process {}", lifecycle.id);
    }
}

/// Writer for a child's stdin, see [`Process::input`]
#[derive(Debug)]
pub struct InputStream<'a> {
    fd: Option<BorrowedFd<'a>>,
}

impl Write for InputStream<'_> {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        let fd = self.fd.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "input stream already closed")
        })?;
        Ok(nix::unistd::write(fd.as_raw_fd(), buffer)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reader for a child's stdout or stderr, see [`Process::output`]
#[derive(Debug)]
pub struct OutputStream<'a> {
    fd: BorrowedFd<'a>,
}

impl Read for OutputStream<'_> {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        Ok(nix::unistd::read(self.fd.as_raw_fd(), buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_info_from_exited_status() {
        let info = ExitInfo::from_wait_status(WaitStatus::Exited(Pid::from_raw(1), 3));
        assert!(info.exited_normally);
        assert_eq!(info.exit_code, 3);
        assert!(!info.success());
        assert_eq!(info.signal(), None);
    }

    #[test]
    fn test_exit_info_from_signaled_status() {
        let info = ExitInfo::from_wait_status(WaitStatus::Signaled(
            Pid::from_raw(1),
            Signal::SIGKILL,
            false,
        ));
        assert!(!info.exited_normally);
        assert_eq!(info.exit_code, libc::SIGKILL);
        assert_eq!(info.signal(), Some(Signal::SIGKILL));
    }

    #[test]
    fn test_returning_function_exits_with_zero() {
        let mut process = Process::spawn(|| {}).unwrap();
        let info = process.wait().unwrap();
        assert!(info.success());
        process.teardown();
    }

    #[test]
    fn test_panicking_function_exits_with_101() {
        let mut process = Process::spawn(|| panic!("boom")).unwrap();
        let info = process.wait().unwrap();
        assert_eq!(
            info,
            ExitInfo {
                exited_normally: true,
                exit_code: PANIC_EXIT_CODE
            }
        );
        process.teardown();
    }

    #[test]
    fn test_stderr_is_wired_to_error_stream() {
        let mut process = Process::spawn(|| {
            io::stderr().write_all(b"oops").unwrap();
        })
        .unwrap();

        let mut captured = [0u8; 4];
        process.error().read_exact(&mut captured).unwrap();
        assert_eq!(&captured, b"oops");

        process.wait().unwrap();
        process.teardown();
    }

    #[test]
    fn test_rewired_stdio_survives_exec() {
        let mut process = Process::spawn(|| {
            let status = std::process::Command::new("cat").status().unwrap();
            exit(status.code().unwrap_or(1));
        })
        .unwrap();

        process.input().write_all(b"through cat").unwrap();
        process.close_input();

        let mut echoed = [0u8; 11];
        process.output().read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"through cat");

        assert!(process.wait().unwrap().success());
        process.teardown();
    }

    #[test]
    fn test_write_after_close_input_is_broken_pipe() {
        let mut process = Process::spawn(|| {
            let mut sink = Vec::new();
            io::stdin().read_to_end(&mut sink).unwrap();
        })
        .unwrap();

        process.close_input();
        let error = process.write_input(b"late").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);

        process.wait().unwrap();
        process.teardown();
    }

    #[test]
    fn test_dropping_live_process_reaps_child() {
        let process = ProcessBuilder::new()
            .cancel_policy(CancelPolicy {
                attempts: 3,
                interval: Duration::from_millis(20),
            })
            .spawn(|| std::thread::sleep(Duration::from_secs(30)))
            .unwrap();
        let pid = process.id();
        drop(process);

        assert_eq!(waitpid(pid, None), Err(nix::errno::Errno::ECHILD));
    }

    #[test]
    fn test_child_can_spawn_and_wait_on_grandchild() {
        let mut process = Process::spawn(|| {
            let mut grandchild = Process::spawn(|| exit(7)).unwrap();
            let info = grandchild.wait().unwrap();
            grandchild.teardown();
            exit(info.exit_code);
        })
        .unwrap();

        let info = process.wait().unwrap();
        assert_eq!(
            info,
            ExitInfo {
                exited_normally: true,
                exit_code: 7
            }
        );
        process.teardown();
    }

    #[cfg(target_os = "linux")]
    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd")
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    // Checked inside a forked helper: it is single-threaded, so nothing else
    // opens or closes descriptors while it counts them.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_fork_failure_reports_error_and_releases_pipes() {
        let mut helper = Process::spawn(|| {
            let before = open_fd_count();
            let result =
                ProcessBuilder::new().spawn_with_fork(|| Err(nix::errno::Errno::EAGAIN), || {});
            let released = open_fd_count() == before;
            exit(match result {
                Err(ProcessError::UnableToFork(nix::errno::Errno::EAGAIN)) if released => 0,
                Err(ProcessError::UnableToFork(_)) => 2,
                _ => 3,
            });
        })
        .unwrap();

        assert_eq!(helper.wait().unwrap().exit_code, 0);
        helper.teardown();
    }

    #[test]
    fn test_stdio_wiring_survives_closed_standard_streams() {
        let mut helper = Process::spawn(|| {
            for fd in 0..=2 {
                let _ = nix::unistd::close(fd);
            }
            // The next pipes land on 0, 1 and 2.
            let mut process = Process::spawn(|| {
                io::stdout().write_all(b"out").unwrap();
                io::stderr().write_all(b"err").unwrap();
            })
            .unwrap();

            let mut output = [0u8; 3];
            let mut error = [0u8; 3];
            let wired = process.output().read_exact(&mut output).is_ok()
                && process.error().read_exact(&mut error).is_ok()
                && &output == b"out"
                && &error == b"err";
            let info = process.wait().unwrap();
            process.teardown();
            exit(if wired && info.success() { 0 } else { 1 });
        })
        .unwrap();

        assert_eq!(helper.wait().unwrap().exit_code, 0);
        helper.teardown();
    }
}
