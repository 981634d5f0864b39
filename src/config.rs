//! Configuration management for the bridge.
//!
//! This module handles loading the optional configuration file that
//! selects the adapter, discovery window and session runtime limits.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Main configuration structure for the bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// BlueZ adapter to use, e.g. `hci0`. The default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_scan_duration")]
   pub scan_duration_secs: u64,

   #[serde(default = "default_session_queue_depth")]
   pub session_queue_depth: usize,

   #[serde(default = "default_shutdown_grace")]
   pub shutdown_grace_ms: u64,

   /// Log destination. Logs are off unless this or `RUST_LOG` is set, since
   /// stderr carries error reports.
   #[serde(default)]
   pub log_file: Option<PathBuf>,
}

const fn default_scan_duration() -> u64 {
   10
}

const fn default_session_queue_depth() -> usize {
   64
}

const fn default_shutdown_grace() -> u64 {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         scan_duration_secs: default_scan_duration(),
         session_queue_depth: default_session_queue_depth(),
         shutdown_grace_ms: default_shutdown_grace(),
         log_file: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk, falling back to defaults if absent.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from an explicit path.
   pub fn load_from(path: &Path) -> Result<Self> {
      if !path.exists() {
         return Ok(Self::default());
      }
      let contents = fs::read_to_string(path)?;
      Ok(toml::from_str(&contents)?)
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("BLUEBRIDGE_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("bluebridge").join("config.toml"))
   }

   pub const fn scan_duration(&self) -> Duration {
      Duration::from_secs(self.scan_duration_secs)
   }

   pub const fn shutdown_grace(&self) -> Duration {
      Duration::from_millis(self.shutdown_grace_ms)
   }

   /// Queue depth for session inboxes, never zero.
   pub fn session_queue_depth(&self) -> usize {
      self.session_queue_depth.max(1)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn missing_file_yields_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
      assert_eq!(config, Config::default());
      assert_eq!(config.scan_duration(), Duration::from_secs(10));
      assert_eq!(config.shutdown_grace(), Duration::from_millis(1000));
   }

   #[test]
   fn partial_file_keeps_remaining_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "adapter = \"hci1\"\nscan_duration_secs = 4\n").unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.scan_duration_secs, 4);
      assert_eq!(config.session_queue_depth, 64);
      assert!(config.log_file.is_none());
   }

   #[test]
   fn malformed_file_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "scan_duration_secs = \"soon\"").unwrap();

      assert!(matches!(
         Config::load_from(&path),
         Err(BridgeError::TomlParse(_))
      ));
   }

   #[test]
   fn zero_queue_depth_is_clamped() {
      let config = Config {
         session_queue_depth: 0,
         ..Config::default()
      };
      assert_eq!(config.session_queue_depth(), 1);
   }
}
