//! Configuration file format, and its resolution into [`AppConfig`]s.

use std::collections::HashSet;

use serde::Deserialize;

pub use self::app::{merge_env, AppConfig, AppDefinition, RestartPolicyConfig};
pub use self::args::ArgsConfig;
pub use self::signal::SignalConfig;

pub mod app;
pub mod args;
pub mod signal;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub apps: Vec<AppDefinition>,
}

impl Config {
    /// Resolves every app against the selected environment profile.
    pub fn resolve(&self, profile: Option<&str>) -> Result<Vec<AppConfig>, ConfigError> {
        let mut names = HashSet::new();
        for app in &self.apps {
            if !names.insert(app.name.as_str()) {
                return Err(ConfigError::DuplicateApp(app.name.clone()));
            }
        }

        self.apps.iter().map(|app| app.resolve(profile)).collect()
    }
}

/// Invalid or incomplete app configuration. Always reported before any
/// process is started.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("App {app:?} is missing required field `{field}`")]
    MissingField { app: String, field: &'static str },

    #[error("Duplicate app name {0:?}")]
    DuplicateApp(String),

    #[error("Invalid environment variable {key:?} for app {app:?}")]
    InvalidEnvironment { app: String, key: String },

    #[error("Unknown environment variable {var:?} in arguments of app {app:?}")]
    UnknownTemplateVariable { app: String, var: String },

    #[error("Environment variable {var:?} passed to app {app:?} is not set")]
    MissingPassedVariable { app: String, var: String },

    #[error("Unknown user {user:?} for app {app:?}")]
    UnknownUser { app: String, user: String },

    #[error("Invalid restart policy for app {app:?}: {reason}")]
    InvalidPolicy { app: String, reason: &'static str },
}
