//! Configuration for the session host.
//!
//! Loaded from `config.toml` under the `ble-session` config directory. A
//! default file is written on first load.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
   error::{Result, SessionError},
   state::SessionPolicy,
};

/// Main configuration structure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Advertised name of the peripheral to connect to.
   #[serde(default)]
   pub target_name: Option<String>,

   /// Service UUIDs to filter the scan by. Empty scans for everything.
   #[serde(default)]
   pub scan_services: Vec<Uuid>,

   #[serde(default)]
   pub subscribe_characteristics: Vec<Uuid>,

   #[serde(default)]
   pub stop_scan_on_connect: bool,

   #[serde(default = "default_tick_interval")]
   pub tick_interval_ms: u64,
}

const fn default_tick_interval() -> u64 {
   16
}

impl Default for Config {
   fn default() -> Self {
      Self {
         target_name: None,
         scan_services: vec![],
         subscribe_characteristics: vec![],
         stop_scan_on_connect: false,
         tick_interval_ms: default_tick_interval(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLE_SESSION_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(SessionError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("ble-session").join("config.toml"))
   }

   /// Builds the state machine policy described by this configuration.
   pub fn policy(&self) -> SessionPolicy {
      let mut policy = SessionPolicy::new()
         .subscribe_to(self.subscribe_characteristics.iter().copied())
         .stop_scan_on_connect(self.stop_scan_on_connect);
      if let Some(name) = &self.target_name {
         policy = policy.select_by_name(name.as_str());
      }
      policy
   }
}
