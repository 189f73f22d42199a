//! Error types for the PrintLink service.
//!
//! This module defines all error types that can occur while orchestrating
//! printer connectivity, including Bluetooth, D-Bus, I/O, and transport
//! errors.

use bluer::Address;
use thiserror::Error;

/// Main error type for the PrintLink service.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Address {0} did not resolve to a device handle")]
   ResolveFailed(Address),

   #[error("Bonding with {0} did not complete")]
   BondFailed(Address),

   #[error("Missing runtime permission: {0}")]
   PermissionDenied(&'static str),

   #[error("Feature not supported: {0}")]
   FeatureNotSupported(&'static str),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Orchestrator has been shut down")]
   OrchestratorShutdown,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Scan failed: {0}")]
   ScanFailed(String),
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
