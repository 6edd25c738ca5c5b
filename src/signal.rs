//! Escalating termination of a child process
//!
//! SIGTERM first, a bounded number of non-blocking polls, then SIGKILL.

use crate::utils::{ensure, retry_eintr};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

/// How long a canceled child gets to honor SIGTERM before SIGKILL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelPolicy {
    /// Number of non-blocking polls after SIGTERM
    pub attempts: u32,
    /// Sleep after each poll that finds the child still running
    pub interval: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }
}

impl CancelPolicy {
    /// Upper bound on the time spent before escalating to SIGKILL
    pub fn grace_period(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Deliver `signal` to `pid`, aborting if kill(2) fails.
pub(crate) fn send_signal(pid: Pid, signal: Signal) {
    debug!("Sending {} to {}", signal, pid);
    ensure(kill(pid, signal), "kill");
}

/// Ask `pid` to terminate, escalating to SIGKILL once the policy runs out.
///
/// Returns the status when one of the polls already reaped the child. `None`
/// means the child still has to be reaped with a blocking wait.
pub(crate) fn terminate(pid: Pid, policy: &CancelPolicy) -> Option<WaitStatus> {
    send_signal(pid, Signal::SIGTERM);

    for attempt in 1..=policy.attempts {
        let status = ensure(
            retry_eintr(|| waitpid(pid, Some(WaitPidFlag::WNOHANG))),
            "waitpid",
        );
        match status {
            WaitStatus::StillAlive => {
                trace!("{} still running after poll {}", pid, attempt);
                thread::sleep(policy.interval);
            }
            status => return Some(status),
        }
    }

    info!(
        "{} ignored SIGTERM for {:?}, sending SIGKILL",
        pid,
        policy.grace_period()
    );
    send_signal(pid, Signal::SIGKILL);
    None
}
