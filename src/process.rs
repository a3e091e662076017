//! Runs an app's process and monitors its completion.

use std::{
    fmt, io, os::unix::process::ExitStatusExt, path::PathBuf, process::Stdio, time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use tokio::{process::Child, sync::watch, time::Instant};
use tracing::Level;

use crate::config::AppConfig;

/// Variables copied from the supervisor's own environment into every
/// process; everything else comes from the app's configured environment
/// (which wins on collision).
pub const INHERITED_ENV: &[&str] = &["PATH"];

/// How often to check whether a process group has emptied.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(10);

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// How and when a process terminated.
#[derive(Clone, Debug, PartialEq)]
pub struct ExitOutcome {
    /// Exit code, if the process exited on its own.
    pub exit_code: Option<i32>,

    /// Name of the signal that terminated the process, if any.
    pub signal: Option<String>,

    /// Wall-clock time of the exit.
    pub timestamp: OffsetDateTime,

    /// Monotonic time of the exit, used for window arithmetic.
    pub at: Instant,

    /// How long the process ran.
    pub uptime: Duration,

    /// True if the supervisor asked the process to terminate.
    pub requested: bool,
}

impl ExitOutcome {
    fn new(exit_code: Option<i32>, signal: Option<String>, started: Instant) -> Self {
        let at = Instant::now();
        Self {
            exit_code,
            signal,
            timestamp: OffsetDateTime::now_utc(),
            at,
            uptime: at.saturating_duration_since(started),
            requested: false,
        }
    }

    /// Outcome recorded when the process could not be created at all.
    pub fn spawn_failed() -> Self {
        Self::new(None, None, Instant::now())
    }

    /// True for an exit with code 0.
    pub fn is_clean(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// True for any exit the supervisor did not ask for, other than a
    /// clean one.
    pub fn is_failure(&self) -> bool {
        !self.requested && !self.is_clean()
    }

    /// True if the exit was clean, or if the process stayed up for at
    /// least `reset_after`.
    pub fn is_healthy(&self, reset_after: Duration) -> bool {
        self.is_clean() || self.uptime >= reset_after
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, &self.signal) {
            (Some(exit_code), _) => write!(f, "exited with code {exit_code}")?,
            (None, Some(signal)) => write!(f, "terminated by {signal}")?,
            (None, None) => write!(f, "ended without an exit status")?,
        }

        let timestamp = self
            .timestamp
            .format(TIMESTAMP_FORMAT)
            .map_err(|_| fmt::Error)?;
        write!(f, " at {timestamp} after {:?}", self.uptime)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Unable to start {script:?}")]
    Io {
        script: PathBuf,

        #[source]
        source: io::Error,
    },

    #[error("Unable to get PID of just-started process")]
    MissingPid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ShutdownError {
    #[error("Process {pid} is still running after SIGKILL")]
    Unresponsive { pid: u32 },
}

/// Handle to one running (or exited) process.
///
/// The process is the leader of its own process group, and every signal
/// is sent to that group so that the app's own children go down with it.
/// Dropping a handle kills whatever is still running in the group.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: Pid,
    requested: bool,
    exited: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    pub fn spawn(config: &AppConfig) -> Result<Self, SpawnError> {
        tracing::event!(Level::DEBUG, app = %config.name, script = ?config.script, args = ?config.args, cwd = ?config.cwd, "Spawning process");

        let mut command = tokio::process::Command::new(&config.script);
        command.args(&config.args).current_dir(&config.cwd);

        // Start from an empty environment so that the process only sees
        // the inherited base set plus its own configured variables.
        command.env_clear();
        for key in INHERITED_ENV {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        command.envs(&config.env);

        if let Some((uid, gid)) = config.user {
            command.uid(uid).gid(gid);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| SpawnError::Io {
            script: config.script.clone(),
            source,
        })?;
        let started = Instant::now();
        let pid = Pid::from_raw(child.id().ok_or(SpawnError::MissingPid)? as i32);

        tracing::event!(Level::DEBUG, app = %config.name, %pid, "Process running");

        let (sender, receiver) = watch::channel(None);
        monitor_process(config.name.clone(), pid, started, child, sender);

        Ok(Self {
            name: config.name.clone(),
            pid,
            requested: false,
            exited: receiver,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Waits for the process to exit. Cancel-safe; once the process has
    /// exited, every call returns immediately.
    pub async fn wait(&mut self) -> ExitOutcome {
        let outcome = match self.exited.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        let mut outcome = outcome.unwrap_or_else(ExitOutcome::spawn_failed);
        outcome.requested = self.requested;
        outcome
    }

    /// Asks the process group to terminate with the given signal.
    pub fn terminate(&mut self, signal: Signal) -> Result<(), Errno> {
        self.requested = true;

        tracing::event!(Level::DEBUG, app = %self.name, pid = %self.pid, ?signal, "Signalling process group");
        self.signal_group(signal)
    }

    /// Forcibly kills the process group.
    pub fn kill(&mut self) -> Result<(), Errno> {
        self.terminate(Signal::SIGKILL)
    }

    /// Kills anything the process left behind in its group. Used after
    /// the process exited on its own; the exit is not marked as requested.
    pub fn kill_remaining(&self) -> Result<(), Errno> {
        if !self.group_alive() {
            return Ok(());
        }

        tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, "Killing processes left behind in the process group");
        self.signal_group(Signal::SIGKILL)
    }

    /// True while any process is left in the group.
    pub fn group_alive(&self) -> bool {
        !matches!(signal::killpg(self.pid, None), Err(Errno::ESRCH))
    }

    /// Sends `signal`, then escalates to SIGKILL if the process is still
    /// running after `grace`. SIGKILL is sent to the process at most
    /// twice. Once the process has exited, the rest of its group gets
    /// until the end of the first `grace` period before it is killed too.
    pub async fn shutdown(
        &mut self,
        signal: Signal,
        grace: Duration,
    ) -> Result<ExitOutcome, ShutdownError> {
        if let Err(err) = self.terminate(signal) {
            tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, ?err, "Error signalling process");
        }

        let deadline = Instant::now() + grace;
        let outcome = match tokio::time::timeout_at(deadline, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, ?grace, "Process ignored graceful shutdown signal; sending SIGKILL");
                self.force_kill(grace).await?
            }
        };

        if !self.wait_for_group(deadline).await {
            tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, "Process group still running after the process exited; sending SIGKILL");
            if let Err(err) = self.signal_group(Signal::SIGKILL) {
                tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, ?err, "Error killing process group");
            }

            // SIGKILL cannot be ignored; whatever is still listed here is
            // already dying.
            if !self.wait_for_group(Instant::now() + grace).await {
                tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, "Process group not yet empty after SIGKILL");
            }
        }

        Ok(outcome)
    }

    async fn force_kill(&mut self, grace: Duration) -> Result<ExitOutcome, ShutdownError> {
        for attempt in 1..=2 {
            if let Err(err) = self.kill() {
                tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, ?err, "Error killing process");
            }

            if let Ok(outcome) = tokio::time::timeout(grace, self.wait()).await {
                return Ok(outcome);
            }

            tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, %attempt, "Process still running after SIGKILL");
        }

        tracing::event!(Level::ERROR, app = %self.name, pid = %self.pid, "Unable to stop process");
        Err(ShutdownError::Unresponsive { pid: self.pid() })
    }

    /// Waits until the group is empty or `deadline` passes. Returns true
    /// if the group is empty.
    async fn wait_for_group(&self, deadline: Instant) -> bool {
        loop {
            if !self.group_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    fn signal_group(&self, signal: Signal) -> Result<(), Errno> {
        match signal::killpg(self.pid, signal) {
            // The group is already gone.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exited.borrow().is_none() {
            tracing::event!(Level::WARN, app = %self.name, pid = %self.pid, "Killing process left running by its handle");
        } else if !self.group_alive() {
            return;
        }

        let _ = self.signal_group(Signal::SIGKILL);
    }
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|signal| signal.as_str().to_owned())
        .unwrap_or_else(|_| format!("signal {signal}"))
}

fn monitor_process(
    name: String,
    pid: Pid,
    started: Instant,
    mut child: Child,
    sender: watch::Sender<Option<ExitOutcome>>,
) {
    tokio::spawn(async move {
        let outcome = match child.wait().await {
            Err(err) => {
                tracing::event!(Level::ERROR, app = %name, %pid, ?err, "Error waiting for process to exit");
                ExitOutcome::new(None, None, started)
            }
            Ok(exit_status) => match exit_status.code() {
                Some(exit_code) => {
                    if exit_code == 0 {
                        tracing::event!(Level::DEBUG, app = %name, %pid, "Process exited cleanly");
                    } else {
                        tracing::event!(Level::DEBUG, app = %name, %pid, %exit_code, "Process exited with non-zero exit code");
                    }

                    ExitOutcome::new(Some(exit_code), None, started)
                }
                None => {
                    let signal = exit_status.signal().map(signal_name);
                    tracing::event!(Level::DEBUG, app = %name, %pid, ?signal, "Process was killed");
                    ExitOutcome::new(None, signal, started)
                }
            },
        };

        sender.send_replace(Some(outcome));
    });
}
