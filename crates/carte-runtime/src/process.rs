//! Supervision and termination of container processes.
//!
//! [`ExitWatch`] owns a dedicated thread that waits on the child and reports
//! the exit over a one-shot channel. [`terminate`] implements the stop
//! protocol against a recorded PID, which may belong to a process this
//! invocation did not spawn.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::sync::oneshot;

use carte_common::error::{CarteError, Result};
use carte_core::spawn::{self, ContainerProcess, ExitOutcome, SignalOutcome};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Handle to a supervised container process.
#[derive(Debug)]
pub struct ExitWatch {
    pid: u32,
    receiver: oneshot::Receiver<std::result::Result<ExitOutcome, String>>,
    thread: Option<JoinHandle<()>>,
}

impl ExitWatch {
    /// Starts a thread waiting on `process`.
    ///
    /// `on_exit` runs on that thread after the process is reaped and before
    /// the outcome is published.
    ///
    /// # Errors
    ///
    /// Returns a process error if the thread cannot be started.
    pub fn spawn<F>(name: &str, process: Box<dyn ContainerProcess>, on_exit: F) -> Result<Self>
    where
        F: FnOnce(&Result<ExitOutcome>) + Send + 'static,
    {
        let pid = process.pid();
        let (sender, receiver) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name(format!("carte-exit-{name}"))
            .spawn(move || {
                let outcome = process.wait();
                on_exit(&outcome);
                let _ = sender.send(outcome.map_err(|e| e.to_string()));
            })
            .map_err(|e| CarteError::Process {
                message: format!("failed to start exit watcher: {e}"),
            })?;
        tracing::debug!(pid, "exit watcher started");
        Ok(Self {
            pid,
            receiver,
            thread: Some(thread),
        })
    }

    /// PID of the supervised process.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Blocks until the process exits.
    ///
    /// # Errors
    ///
    /// Returns a process error if waiting failed.
    pub fn wait(mut self) -> Result<ExitOutcome> {
        let received = self.receiver.blocking_recv();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        match received {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(message)) => Err(CarteError::Process { message }),
            Err(_) => Err(CarteError::Process {
                message: format!("exit watcher for pid {} stopped without a result", self.pid),
            }),
        }
    }

    /// Returns the outcome if the process has already exited.
    pub fn try_outcome(&mut self) -> Option<ExitOutcome> {
        match self.receiver.try_recv() {
            Ok(Ok(outcome)) => Some(outcome),
            _ => None,
        }
    }
}

/// True while `pid` still names the process that was recorded with
/// `start_time`. A zombie awaiting its reaper still counts.
///
/// Without a recorded start time only liveness can be checked.
#[must_use]
pub fn is_current(pid: u32, start_time: Option<u64>) -> bool {
    match start_time {
        Some(expected) => spawn::start_time(pid) == Some(expected),
        None => spawn::is_alive(pid),
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone.
    AlreadyExited,
    /// The process exited after the given signal.
    Signaled(Signal),
}

impl Termination {
    /// Exit code to record: `128 + signal`.
    #[must_use]
    pub const fn exit_code(self) -> Option<i32> {
        match self {
            Self::AlreadyExited => None,
            Self::Signaled(signal) => Some(128 + signal as i32),
        }
    }
}

/// Sends `SIGTERM`, waits up to `grace`, then sends `SIGKILL`.
///
/// # Errors
///
/// Returns a process error if a signal is refused; the caller must then
/// leave the record untouched.
pub fn terminate(pid: u32, grace: Duration) -> Result<Termination> {
    if !spawn::is_alive(pid) || spawn::send_signal(pid, Signal::SIGTERM)? == SignalOutcome::Gone {
        tracing::info!(pid, "process already exited");
        return Ok(Termination::AlreadyExited);
    }
    tracing::info!(pid, grace_secs = grace.as_secs(), "sent SIGTERM");
    if wait_for_exit(pid, grace) {
        return Ok(Termination::Signaled(Signal::SIGTERM));
    }

    if spawn::send_signal(pid, Signal::SIGKILL)? == SignalOutcome::Gone {
        return Ok(Termination::Signaled(Signal::SIGTERM));
    }
    tracing::warn!(pid, "grace period expired, sent SIGKILL");
    if !wait_for_exit(pid, KILL_WAIT) {
        tracing::warn!(pid, "process still present after SIGKILL");
    }
    Ok(Termination::Signaled(Signal::SIGKILL))
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !spawn::is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};
    use std::sync::{Arc, Mutex};

    use super::*;

    struct ChildProcess(Child);

    impl ContainerProcess for ChildProcess {
        fn pid(&self) -> u32 {
            self.0.id()
        }

        fn wait(mut self: Box<Self>) -> Result<ExitOutcome> {
            let status = self.0.wait().map_err(|e| CarteError::Process { message: e.to_string() })?;
            Ok(status.code().map_or(ExitOutcome::Signaled(9), ExitOutcome::Exited))
        }
    }

    #[test]
    fn exit_watch_reports_outcome_after_callback() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_thread = seen.clone();
        let watch = ExitWatch::spawn("t", Box::new(ChildProcess(child)), move |outcome| {
            *seen_in_thread.lock().unwrap() = outcome.as_ref().ok().copied();
        })
        .unwrap();

        assert_eq!(watch.wait().unwrap(), ExitOutcome::Exited(3));
        assert_eq!(*seen.lock().unwrap(), Some(ExitOutcome::Exited(3)));
    }

    #[test]
    fn terminate_stops_a_sleeping_process() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let watch = ExitWatch::spawn("sleep", Box::new(ChildProcess(child)), |_| {}).unwrap();

        let outcome = terminate(pid, Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Termination::Signaled(Signal::SIGTERM));
        assert_eq!(outcome.exit_code(), Some(143));
        let _ = watch.wait().unwrap();
    }

    #[test]
    fn current_process_requires_matching_start_time() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let started = spawn::start_time(pid);

        assert!(is_current(pid, started));
        assert!(is_current(pid, None));
        assert!(!is_current(pid, started.map(|t| t + 1)));

        child.kill().unwrap();
        let _ = child.wait().unwrap();
        assert!(!is_current(pid, started));
        assert!(!is_current(pid, None));
    }

    #[test]
    fn terminate_on_reaped_pid_is_already_exited() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        let _ = child.wait().unwrap();
        assert_eq!(terminate(pid, Duration::from_secs(1)).unwrap(), Termination::AlreadyExited);
    }
}
