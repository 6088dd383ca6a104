//! Configuration management for the transport core.
//!
//! This module handles loading and saving the tunables shared by every
//! device and transport: signal queue depth, worker flush polling cadence,
//! teardown join budget and initial volume/gain levels.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Main configuration structure for the transport core.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   #[serde(default = "default_signal_queue_depth")]
   pub signal_queue_depth: usize,

   #[serde(default = "default_io_poll_interval")]
   pub io_poll_interval_ms: u64,

   #[serde(default = "default_join_timeout")]
   pub join_timeout_ms: u64,

   #[serde(default = "default_a2dp_volume")]
   pub a2dp_default_volume: u8,

   #[serde(default = "default_sco_gain")]
   pub sco_default_gain: u8,
}

const fn default_signal_queue_depth() -> usize {
   32
}

const fn default_io_poll_interval() -> u64 {
   5
}

const fn default_join_timeout() -> u64 {
   5000
}

const fn default_a2dp_volume() -> u8 {
   127
}

const fn default_sco_gain() -> u8 {
   15
}

impl Default for Config {
   fn default() -> Self {
      Self {
         signal_queue_depth: default_signal_queue_depth(),
         io_poll_interval_ms: default_io_poll_interval(),
         join_timeout_ms: default_join_timeout(),
         a2dp_default_volume: default_a2dp_volume(),
         sco_default_gain: default_sco_gain(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Self::from_toml_str(&contents)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Parses a configuration document, filling in defaults for missing keys.
   pub fn from_toml_str(contents: &str) -> Result<Self> {
      Ok(toml::from_str(contents)?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTBRIDGE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(TransportError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btbridge").join("config.toml"))
   }

   /// Wait between worker passes while a flush is pending. The worker
   /// otherwise sleeps until a descriptor becomes ready.
   pub fn io_poll_interval(&self) -> Duration {
      Duration::from_millis(self.io_poll_interval_ms.max(1))
   }

   pub fn join_timeout(&self) -> Duration {
      Duration::from_millis(self.join_timeout_ms)
   }

   /// Channel depth, never zero so a wakeup can always be queued.
   pub fn signal_queue_depth(&self) -> usize {
      self.signal_queue_depth.max(1)
   }
}
