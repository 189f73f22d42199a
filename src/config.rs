//! Configuration management for the PrintLink service.
//!
//! This module handles loading and saving configuration from disk,
//! including known printers, timeout ceilings, reconciliation cadence,
//! and runtime permission grants.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_printers: Vec<KnownPrinter>,

   #[serde(default)]
   pub permissions: Permissions,

   /// Unified scan auto-stop window, seconds.
   #[serde(default = "default_scan_window")]
   pub scan_window_sec: u64,

   /// Settle delay between stop and start on a scan restart, milliseconds.
   #[serde(default = "default_scan_settle")]
   pub scan_settle_ms: u64,

   /// Per-attempt connection timeout, seconds.
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   /// Upper bound on waiting for an in-flight bonding handshake, seconds.
   #[serde(default = "default_bond_wait")]
   pub bond_wait_sec: u64,

   /// Profile-proxy resolution ceiling, milliseconds.
   #[serde(default = "default_proxy_resolve")]
   pub proxy_resolve_ms: u64,

   /// Base reconciliation cadence, seconds.
   #[serde(default = "default_reconcile_interval")]
   pub reconcile_interval_sec: u64,

   /// Boosted cadence after a connection attempt starts, seconds.
   #[serde(default = "default_reconcile_boost")]
   pub reconcile_boost_sec: u64,

   /// How long the boosted cadence persists, seconds.
   #[serde(default = "default_reconcile_boost_window")]
   pub reconcile_boost_window_sec: u64,

   /// TTL for profile-confirmed connections that were not reconfirmed.
   #[serde(default = "default_profile_ttl")]
   pub profile_confirm_ttl_sec: u64,

   /// Restart discovery after a connect attempt times out.
   #[serde(default = "default_rescan_after_timeout")]
   pub rescan_after_timeout: bool,
}

/// Represents a known printer with a fixed address.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownPrinter {
   pub address: String,
   pub name: String,
}

/// Runtime permission grants mirrored from the platform authorizer.
///
/// Every radio operation checks the relevant grant first and degrades to
/// a logged no-op when it is absent.
#[derive(Serialize, Deserialize, Clone, Copy)]
pub struct Permissions {
   #[serde(default = "default_true")]
   pub connect: bool,
   #[serde(default = "default_true")]
   pub scan: bool,
   #[serde(default = "default_true")]
   pub location: bool,
}

impl Default for Permissions {
   fn default() -> Self {
      Self {
         connect: true,
         scan: true,
         location: true,
      }
   }
}

const fn default_true() -> bool {
   true
}

const fn default_scan_window() -> u64 {
   60
}

const fn default_scan_settle() -> u64 {
   400
}

const fn default_connect_timeout() -> u64 {
   25
}

const fn default_bond_wait() -> u64 {
   10
}

const fn default_proxy_resolve() -> u64 {
   500
}

const fn default_reconcile_interval() -> u64 {
   5
}

const fn default_reconcile_boost() -> u64 {
   1
}

const fn default_reconcile_boost_window() -> u64 {
   15
}

const fn default_profile_ttl() -> u64 {
   15
}

const fn default_rescan_after_timeout() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_printers: vec![],
         permissions: Permissions::default(),
         scan_window_sec: default_scan_window(),
         scan_settle_ms: default_scan_settle(),
         connect_timeout_sec: default_connect_timeout(),
         bond_wait_sec: default_bond_wait(),
         proxy_resolve_ms: default_proxy_resolve(),
         reconcile_interval_sec: default_reconcile_interval(),
         reconcile_boost_sec: default_reconcile_boost(),
         reconcile_boost_window_sec: default_reconcile_boost_window(),
         profile_confirm_ttl_sec: default_profile_ttl(),
         rescan_after_timeout: default_rescan_after_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   fn load_from(config_path: PathBuf) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(&config_path)?;
         Ok(config)
      }
   }

   fn save_to(&self, config_path: &PathBuf) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }
      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("PRINTLINK_HOME") {
         PathBuf::from(home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("printlink").join("config.toml"))
   }

   /// Checks if the given address is a known printer and returns its name.
   pub fn known_printer(&self, address: &str) -> Option<&str> {
      self
         .known_printers
         .iter()
         .find(|p| p.address == address)
         .map(|p| p.name.as_str())
   }

   pub const fn scan_window(&self) -> Duration {
      Duration::from_secs(self.scan_window_sec)
   }

   pub const fn scan_settle(&self) -> Duration {
      Duration::from_millis(self.scan_settle_ms)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub const fn bond_wait(&self) -> Duration {
      Duration::from_secs(self.bond_wait_sec)
   }

   pub const fn proxy_resolve(&self) -> Duration {
      Duration::from_millis(self.proxy_resolve_ms)
   }

   pub const fn reconcile_interval(&self) -> Duration {
      Duration::from_secs(self.reconcile_interval_sec)
   }

   pub const fn reconcile_boost(&self) -> Duration {
      Duration::from_secs(self.reconcile_boost_sec)
   }

   pub const fn reconcile_boost_window(&self) -> Duration {
      Duration::from_secs(self.reconcile_boost_window_sec)
   }

   pub const fn profile_confirm_ttl(&self) -> Duration {
      Duration::from_secs(self.profile_confirm_ttl_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults_are_bounded() {
      let config = Config::default();
      assert_eq!(config.scan_window_sec, 60);
      assert_eq!(config.connect_timeout_sec, 25);
      assert_eq!(config.bond_wait_sec, 10);
      assert!(config.permissions.connect);
      assert!(config.rescan_after_timeout);
      // Boost window must outlive at least one boosted pass
      assert!(config.reconcile_boost_window_sec > config.reconcile_boost_sec);
   }

   #[test]
   fn round_trip_through_disk() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.known_printers.push(KnownPrinter {
         address: "AA:BB:CC:DD:EE:FF".into(),
         name: "Front Desk".into(),
      });
      config.permissions.scan = false;
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(path).unwrap();
      assert_eq!(loaded.known_printer("AA:BB:CC:DD:EE:FF"), Some("Front Desk"));
      assert!(!loaded.permissions.scan);
      assert!(loaded.permissions.connect);
   }

   #[test]
   fn missing_file_creates_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");
      let config = Config::load_from(path.clone()).unwrap();
      assert!(path.exists());
      assert!(config.known_printers.is_empty());
   }

   #[test]
   fn partial_toml_fills_defaults() {
      let parsed: Config = toml::from_str("scan_window_sec = 10\n").unwrap();
      assert_eq!(parsed.scan_window_sec, 10);
      assert_eq!(parsed.connect_timeout_sec, 25);
      assert!(parsed.permissions.location);
   }
}
