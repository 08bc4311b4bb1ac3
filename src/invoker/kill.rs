//! Process-tree termination
//!
//! Watch-mode build tools fork long-lived children (file watchers, daemons)
//! that outlive their parent's stdin closing. Every spawned process leads
//! its own process group, so teardown signals the whole group.

use std::time::Duration;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upper bound for reaping after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How a terminated process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Forced,
    /// Did not go away even after SIGKILL within the bound
    Unresponsive,
}

/// Signal the process group of `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, signal) {
        Ok(()) => debug!(pgid = pid, signal = ?signal, "Signalled process group"),
        // group already gone
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

/// SIGKILL whatever is left in the group of an already reaped leader
pub(crate) fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Terminate `child` and everything in its process group
///
/// SIGTERM first, SIGKILL after `grace`. The group is always SIGKILLed at
/// the end so stragglers that ignored SIGTERM do not survive their parent.
pub(crate) async fn terminate_tree(child: &mut Child, pid: Option<u32>, grace: Duration) -> Termination {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let graceful = matches!(timeout(grace, child.wait()).await, Ok(Ok(_)));

    kill_group(pid);

    if graceful {
        return Termination::Graceful;
    }

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill failed, process likely exited");
    }

    match timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(_)) => Termination::Forced,
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to reap killed process");
            Termination::Unresponsive
        }
        Err(_) => {
            warn!(pid = ?pid, "Process still running after SIGKILL");
            Termination::Unresponsive
        }
    }
}
