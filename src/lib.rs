//! Process supervisor: launches each configured app with its own
//! arguments, working directory and environment, watches it, and
//! restarts it with exponential backoff when it crashes.

#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_debug_implementations,
    nonstandard_style,
    // missing_docs,
    unreachable_pub,
    missing_copy_implementations,
    unused_qualifications,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::{config::ConfigError, process::ShutdownError, supervisor::ProcessState};

pub mod config;
pub mod policy;
pub mod process;
pub mod supervisor;

pub use config::AppConfig;
pub use supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("App {app:?} is already {state}")]
    AlreadyActive { app: String, state: ProcessState },

    #[error("App has never been started")]
    NotStarted,

    #[error("Unable to stop app")]
    Shutdown(#[from] ShutdownError),

    #[error("Supervision task failed")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Supervises every app until a shutdown signal arrives (or the
/// shutdown sender is dropped), then stops them in reverse start order.
pub async fn run(
    apps: Vec<AppConfig>,
    mut shutdown_receiver: mpsc::UnboundedReceiver<()>,
) -> Result<(), Error> {
    let mut supervisors: HashMap<String, Supervisor> = HashMap::new();
    let mut start_order = Vec::with_capacity(apps.len());

    for app in apps {
        let name = app.name.clone();
        if supervisors.contains_key(&name) {
            let _ = stop_all(&mut supervisors, &start_order).await;
            return Err(ConfigError::DuplicateApp(name).into());
        }

        let supervisor = Supervisor::new();
        if let Err(err) = supervisor.start(app).await {
            tracing::error!(app = %name, %err, "Unable to start app");
            let _ = stop_all(&mut supervisors, &start_order).await;
            return Err(err);
        }

        supervisors.insert(name.clone(), supervisor);
        start_order.push(name);
    }

    tracing::info!(apps = supervisors.len(), "All apps started");

    let _ = shutdown_receiver.recv().await;
    tracing::info!("Shutdown requested");

    stop_all(&mut supervisors, &start_order).await
}

async fn stop_all(
    supervisors: &mut HashMap<String, Supervisor>,
    start_order: &[String],
) -> Result<(), Error> {
    let mut result = Ok(());

    for name in start_order.iter().rev() {
        if let Some(supervisor) = supervisors.remove(name) {
            if let Err(err) = supervisor.stop().await {
                tracing::error!(app = %name, %err, "Error stopping app");
                result = Err(err);
            }
        }
    }

    result
}
