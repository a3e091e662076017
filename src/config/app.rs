//! App configuration.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;

use super::{args::ArgsConfig, signal::SignalConfig, ConfigError};
use crate::policy::{RestartMode, RestartPolicy};

static TEMPLATE_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("Failed to compile regular expression")
});

fn default_grace_period_ms() -> u64 {
    5000
}

/// App as declared in the configuration file, before an environment
/// profile has been applied.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppDefinition {
    pub name: String,

    pub script: PathBuf,

    /// Working directory; defaults to the supervisor's own.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub args: ArgsConfig,

    /// Base environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Named environment overrides, merged onto `env` when the profile
    /// is selected.
    #[serde(default)]
    pub env_profile: BTreeMap<String, BTreeMap<String, String>>,

    /// Variables copied from the supervisor's environment.
    #[serde(default)]
    pub pass_env: Vec<String>,

    /// User to run the app as, otherwise the app runs as the user that
    /// started the supervisor.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub stop_signal: SignalConfig,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default)]
    pub restart: RestartMode,

    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RestartPolicyConfig {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub reset_after_ms: u64,
    pub failure_window_ms: u64,
    pub max_failures: usize,
    pub history_len: usize,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            min_backoff_ms: policy.min_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            reset_after_ms: policy.reset_after.as_millis() as u64,
            failure_window_ms: policy.failure_window.as_millis() as u64,
            max_failures: policy.max_failures,
            history_len: policy.history_len,
        }
    }
}

impl RestartPolicyConfig {
    fn into_policy(self, mode: RestartMode) -> RestartPolicy {
        RestartPolicy {
            mode,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            reset_after: Duration::from_millis(self.reset_after_ms),
            failure_window: Duration::from_millis(self.failure_window_ms),
            max_failures: self.max_failures,
            history_len: self.history_len,
        }
    }
}

/// Fully resolved, immutable description of how to launch one app.
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub name: String,
    pub script: PathBuf,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,

    /// uid and primary gid to run the process as.
    pub user: Option<(u32, u32)>,

    pub stop_signal: SignalConfig,
    pub grace_period: Duration,
    pub policy: RestartPolicy,
}

impl AppConfig {
    /// Creates a config with no arguments, an empty environment and the
    /// default stop and restart behavior.
    pub fn new(
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            cwd: cwd.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            user: None,
            stop_signal: SignalConfig::default(),
            grace_period: Duration::from_millis(default_grace_period_ms()),
            policy: RestartPolicy::default(),
        }
    }

    /// Checks everything that can be checked without spawning the
    /// process. Problems the OS reports at spawn time (a missing script,
    /// a bad working directory) are left to the supervisor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let app = || self.name.clone();

        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                app: app(),
                field: "name",
            });
        }

        if self.script.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                app: app(),
                field: "script",
            });
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(ConfigError::InvalidEnvironment {
                    app: app(),
                    key: key.clone(),
                });
            }
        }

        let policy = &self.policy;
        if policy.min_backoff > policy.max_backoff {
            return Err(ConfigError::InvalidPolicy {
                app: app(),
                reason: "minimum backoff is greater than maximum backoff",
            });
        }
        if policy.failure_window.is_zero() {
            return Err(ConfigError::InvalidPolicy {
                app: app(),
                reason: "failure window must not be empty",
            });
        }
        if policy.history_len <= policy.max_failures {
            return Err(ConfigError::InvalidPolicy {
                app: app(),
                reason: "history must hold more entries than the failure limit",
            });
        }

        Ok(())
    }
}

/// Merges `overrides` onto `base`; overrides win on key collision.
pub fn merge_env(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

impl AppDefinition {
    /// Applies the environment profile (if the app declares it), copies
    /// passed variables, expands argument templates, and looks up the
    /// user, producing a validated [`AppConfig`].
    pub fn resolve(&self, profile: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut passed = BTreeMap::new();
        for var in &self.pass_env {
            let value = std::env::var(var).map_err(|_| ConfigError::MissingPassedVariable {
                app: self.name.clone(),
                var: var.clone(),
            })?;
            passed.insert(var.clone(), value);
        }

        let mut env = merge_env(&passed, &self.env);
        if let Some(overrides) = profile.and_then(|profile| self.env_profile.get(profile)) {
            env = merge_env(&env, overrides);
        }

        let args = self
            .args
            .0
            .iter()
            .map(|arg| expand_templates(&self.name, arg, &env))
            .collect::<Result<Vec<_>, _>>()?;

        let user = match &self.user {
            None => None,
            Some(name) => {
                let user =
                    users::get_user_by_name(name).ok_or_else(|| ConfigError::UnknownUser {
                        app: self.name.clone(),
                        user: name.clone(),
                    })?;
                Some((user.uid(), user.primary_group_id()))
            }
        };

        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().map_err(|_| ConfigError::MissingField {
                app: self.name.clone(),
                field: "cwd",
            })?,
        };

        let config = AppConfig {
            name: self.name.clone(),
            script: self.script.clone(),
            cwd,
            args,
            env,
            user,
            stop_signal: self.stop_signal,
            grace_period: Duration::from_millis(self.grace_period_ms),
            policy: self.restart_policy.into_policy(self.restart),
        };
        config.validate()?;

        Ok(config)
    }
}

/// Replaces every `{{VAR}}` in `arg` with the value of `VAR` from the
/// app's resolved environment.
fn expand_templates(
    app: &str,
    arg: &str,
    env: &BTreeMap<String, String>,
) -> Result<String, ConfigError> {
    if let Some(var) = TEMPLATE_VAR
        .captures_iter(arg)
        .map(|caps| caps[1].to_owned())
        .find(|var| !env.contains_key(var))
    {
        return Err(ConfigError::UnknownTemplateVariable {
            app: app.to_owned(),
            var,
        });
    }

    Ok(TEMPLATE_VAR
        .replace_all(arg, |caps: &Captures| {
            env.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}
