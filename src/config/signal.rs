//! Stop signal configuration.

use serde::Deserialize;

/// Signal sent to an app's process group to ask it to shut down
/// gracefully.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
pub enum SignalConfig {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGTERM,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self::SIGTERM
    }
}

impl From<SignalConfig> for nix::sys::signal::Signal {
    fn from(signal: SignalConfig) -> Self {
        match signal {
            SignalConfig::SIGHUP => Self::SIGHUP,
            SignalConfig::SIGINT => Self::SIGINT,
            SignalConfig::SIGQUIT => Self::SIGQUIT,
            SignalConfig::SIGTERM => Self::SIGTERM,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::SignalConfig;

    #[derive(Debug, Deserialize, PartialEq)]
    struct SignalConfigTest {
        stop: SignalConfig,
    }

    #[test]
    fn supports_signal_names() {
        let toml = r#"stop = "SIGQUIT""#;
        let decoded: SignalConfigTest = toml::from_str(toml).expect("Failed to parse test TOML");
        assert_eq!(SignalConfig::SIGQUIT, decoded.stop);
        assert_eq!(
            nix::sys::signal::Signal::SIGQUIT,
            nix::sys::signal::Signal::from(decoded.stop)
        );
    }

    #[test]
    fn rejects_forced_kill_as_stop_signal() {
        let toml = r#"stop = "SIGKILL""#;
        assert!(toml::from_str::<SignalConfigTest>(toml).is_err());
    }
}
