//! Supervises one app: starts its process, watches it exit, and restarts
//! it according to the app's restart policy.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        watch,
    },
    task::JoinHandle,
};

use crate::{
    config::AppConfig,
    policy::{Decision, RestartHistory, RestartPolicy},
    process::{ExitOutcome, ProcessHandle, ShutdownError},
    Error,
};

/// Lifecycle state of a supervised app.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,

    /// The app crashed too often; it stays down until an operator
    /// restarts it.
    FailedPermanently,
}

impl ProcessState {
    /// True while a supervision loop is driving the app towards (or
    /// keeping it in) the running state.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped | Self::FailedPermanently)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
            Self::FailedPermanently => "failed",
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Control {
    Stop,
    RestartNow,
}

/// State shared between a [`Supervisor`] and its supervision loop. Only
/// the loop writes to it.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<ProcessState>,
    pid: AtomicU32,
    history: Mutex<RestartHistory>,
}

impl Shared {
    fn set_state(&self, app: &str, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(%app, from = %previous, to = %state, "State changed");
        }
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::Release);
    }

    fn history(&self) -> MutexGuard<'_, RestartHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: ExitOutcome) {
        self.history().record(outcome);
    }

    /// Asks the policy about `outcome`, then archives it.
    fn decide(&self, policy: &RestartPolicy, outcome: ExitOutcome) -> Decision {
        let mut history = self.history();
        let decision = policy.decide(&outcome, &history);
        history.record(outcome);
        decision
    }
}

#[derive(Debug)]
struct Task {
    control: mpsc::UnboundedSender<Control>,
    join: JoinHandle<Result<(), ShutdownError>>,
}

impl Task {
    /// Stops the supervision loop and waits for it to finish.
    async fn finish(self) -> Result<(), Error> {
        // The loop may already be gone, in which case there is nothing
        // to tell it.
        let _ = self.control.send(Control::Stop);
        Ok(self.join.await??)
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    task: Option<Task>,
    config: Option<AppConfig>,
}

/// Supervisor for a single app.
///
/// Lifecycle operations (`start`, `stop`, `restart_now`) are serialized
/// with each other; `status` never waits for them.
#[derive(Debug)]
pub struct Supervisor {
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            shared: Arc::new(Shared {
                state,
                pid: AtomicU32::new(0),
                history: Mutex::new(RestartPolicy::default().history()),
            }),
            lifecycle: Default::default(),
        }
    }

    /// Starts supervising `config`. The config is validated before
    /// anything is spawned.
    pub async fn start(&self, config: AppConfig) -> Result<(), Error> {
        config.validate()?;

        let mut lifecycle = self.lifecycle.lock().await;

        let state = self.status();
        if state.is_active() {
            return Err(Error::AlreadyActive {
                app: config.name,
                state,
            });
        }

        // A previous loop may still be idling in a terminal state.
        if let Some(task) = lifecycle.task.take() {
            if let Err(err) = task.finish().await {
                tracing::warn!(app = %config.name, %err, "Previous supervision loop ended with an error");
            }
        }

        tracing::info!(app = %config.name, "Starting app");
        lifecycle.task = Some(self.launch(config.clone()));
        lifecycle.config = Some(config);

        Ok(())
    }

    /// Stops the app and waits for its process to exit. A pending
    /// restart is cancelled. A permanently failed app stays failed.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;

        let Some(task) = lifecycle.task.take() else {
            return Ok(());
        };

        if let Some(config) = &lifecycle.config {
            tracing::info!(app = %config.name, "Stopping app");
        }
        task.finish().await
    }

    /// Restarts the app immediately, resetting its backoff. Works from
    /// any state, including `FailedPermanently`.
    pub async fn restart_now(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let config = lifecycle.config.clone().ok_or(Error::NotStarted)?;

        tracing::info!(app = %config.name, "Manual restart requested");

        if let Some(task) = &lifecycle.task {
            if task.control.send(Control::RestartNow).is_ok() {
                return Ok(());
            }
        }

        // No loop left to tell; start a fresh one.
        if let Some(task) = lifecycle.task.take() {
            if let Err(err) = task.finish().await {
                tracing::warn!(app = %config.name, %err, "Previous supervision loop ended with an error");
            }
        }
        lifecycle.task = Some(self.launch(config));

        Ok(())
    }

    pub fn status(&self) -> ProcessState {
        *self.shared.state.borrow()
    }

    /// Receiver that is notified whenever the state changes.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.shared.state.subscribe()
    }

    /// PID of the running process, if there is one.
    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Snapshot of the restart history, oldest first.
    pub fn history(&self) -> Vec<ExitOutcome> {
        self.shared.history().iter().cloned().collect()
    }

    fn launch(&self, config: AppConfig) -> Task {
        *self.shared.history() = config.policy.history();
        self.shared.set_state(&config.name, ProcessState::Starting);

        let (control, control_receiver) = mpsc::unbounded_channel();
        let join = tokio::spawn(supervise(
            config,
            Arc::clone(&self.shared),
            control_receiver,
        ));

        Task { control, join }
    }
}

/// Supervision loop for one app. Returns once a stop is requested (or
/// the [`Supervisor`] is dropped); terminal states wait here for a
/// manual restart.
async fn supervise(
    config: AppConfig,
    shared: Arc<Shared>,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> Result<(), ShutdownError> {
    let app = config.name.as_str();

    loop {
        shared.set_state(app, ProcessState::Starting);

        // Requests may already be queued (`stop` right after `start`, for
        // example); honor them before spawning anything.
        match pending_request(&mut control) {
            Some(Control::Stop) => {
                shared.set_state(app, ProcessState::Stopped);
                return Ok(());
            }
            Some(Control::RestartNow) => shared.history().clear(),
            None => {}
        }

        let outcome = match ProcessHandle::spawn(&config) {
            Err(err) => {
                tracing::error!(%app, ?err, "Unable to start process");
                shared.set_state(app, ProcessState::Crashed);
                ExitOutcome::spawn_failed()
            }
            Ok(mut handle) => {
                shared.set_pid(Some(handle.pid()));
                shared.set_state(app, ProcessState::Running);

                tokio::select! {
                    outcome = handle.wait() => {
                        shared.set_pid(None);
                        tracing::warn!(%app, %outcome, "Process exited unexpectedly");
                        if let Err(err) = handle.kill_remaining() {
                            tracing::warn!(%app, ?err, "Unable to kill leftover processes");
                        }
                        shared.set_state(app, ProcessState::Crashed);
                        outcome
                    }
                    request = control.recv() => {
                        shared.set_state(app, ProcessState::Stopping);
                        let result = handle
                            .shutdown(config.stop_signal.into(), config.grace_period)
                            .await;
                        shared.set_pid(None);

                        let stopped = match result {
                            Ok(outcome) => {
                                tracing::info!(%app, %outcome, "Process stopped");
                                shared.record(outcome);
                                Ok(())
                            }
                            Err(err) => {
                                tracing::error!(%app, %err, "Process did not stop");
                                Err(err)
                            }
                        };

                        match request {
                            Some(Control::RestartNow) => {
                                shared.history().clear();
                                continue;
                            }
                            Some(Control::Stop) | None => {
                                shared.set_state(app, ProcessState::Stopped);
                                return stopped;
                            }
                        }
                    }
                }
            }
        };

        if !recover(app, &config.policy, outcome, &shared, &mut control).await {
            return Ok(());
        }
    }
}

/// Handles an exit the supervisor did not ask for. Returns true if the
/// process should be started again, false if the loop should end.
async fn recover(
    app: &str,
    policy: &RestartPolicy,
    outcome: ExitOutcome,
    shared: &Shared,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> bool {
    // A request that arrived while the process was exiting wins over the
    // restart policy.
    if let Some(request) = pending_request(control) {
        shared.record(outcome);
        return match request {
            Control::RestartNow => {
                shared.history().clear();
                true
            }
            Control::Stop => {
                shared.set_state(app, ProcessState::Stopped);
                false
            }
        };
    }

    match shared.decide(policy, outcome) {
        Decision::Restart { after } => {
            tracing::info!(%app, delay = ?after, "Restarting process after backoff");

            tokio::select! {
                _ = tokio::time::sleep(after) => true,
                request = control.recv() => match request {
                    Some(Control::RestartNow) => {
                        shared.history().clear();
                        true
                    }
                    Some(Control::Stop) | None => {
                        shared.set_state(app, ProcessState::Stopped);
                        false
                    }
                }
            }
        }
        Decision::Stop => {
            tracing::info!(%app, "Restart policy does not restart this exit");
            shared.set_state(app, ProcessState::Stopped);
            wait_for_restart(shared, control).await
        }
        Decision::GiveUp => {
            tracing::error!(
                %app,
                max_failures = policy.max_failures,
                window = ?policy.failure_window,
                "Process keeps crashing; giving up until restarted manually"
            );
            shared.set_state(app, ProcessState::FailedPermanently);
            wait_for_restart(shared, control).await
        }
    }
}

/// Request queued on the control channel, if any. A closed channel counts
/// as a stop request.
fn pending_request(control: &mut mpsc::UnboundedReceiver<Control>) -> Option<Control> {
    match control.try_recv() {
        Ok(request) => Some(request),
        Err(TryRecvError::Disconnected) => Some(Control::Stop),
        Err(TryRecvError::Empty) => None,
    }
}

/// Parks the loop in a terminal state. Returns true if a manual restart
/// was requested, false if the loop should end.
async fn wait_for_restart(
    shared: &Shared,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> bool {
    match control.recv().await {
        Some(Control::RestartNow) => {
            shared.history().clear();
            true
        }
        Some(Control::Stop) | None => false,
    }
}
