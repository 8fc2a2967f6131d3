use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

fn config_path() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".sshfwd");
    Ok(dir.join("config.toml"))
}

/// Settings for the ssh transport, read from ~/.sshfwd/config.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ssh client binary
    pub ssh_program: String,
    /// Seconds to wait for the connection and all listeners
    pub connect_timeout_secs: u64,
    /// Extra `-o` options passed to every ssh process
    pub ssh_options: Vec<String>,
    /// Milliseconds between SIGTERM and SIGKILL when stopping a tunnel
    pub stop_grace_millis: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            connect_timeout_secs: 10,
            ssh_options: Vec::new(),
            stop_grace_millis: 2000,
        }
    }
}

impl Settings {
    /// Load settings from ~/.sshfwd/config.toml, falling back to defaults.
    pub fn load() -> Self {
        let path = match config_path() {
            Ok(p) => p,
            Err(_) => return Self::default(),
        };
        if !path.exists() {
            return Self::default();
        }
        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| Self::from_toml(&content));
        match parsed {
            Ok(settings) => settings,
            Err(e) => {
                warn!("ignoring {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse settings")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = Settings::from_toml(
            "connect_timeout_secs = 3\nssh_options = [\"StrictHostKeyChecking=accept-new\"]\n",
        )
        .unwrap();
        assert_eq!(settings.connect_timeout(), Duration::from_secs(3));
        assert_eq!(settings.ssh_options, vec!["StrictHostKeyChecking=accept-new"]);
        assert_eq!(settings.ssh_program, "ssh");
        assert_eq!(settings.stop_grace(), Duration::from_secs(2));
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let settings = Settings::from_toml("connect_timeout_secs = 0").unwrap();
        assert_eq!(settings.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn bad_type_is_an_error() {
        assert!(Settings::from_toml("connect_timeout_secs = \"soon\"").is_err());
    }
}
