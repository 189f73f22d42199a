//! Attribute-protocol (GATT) transport.
//!
//! Low-energy printers connect through a GATT session that walks a small
//! state machine: connecting, link up, services discovered, ready. A
//! session only counts as connected once service discovery has completed;
//! until then the device stays in the connecting list. Status codes from
//! the stack are classified for diagnostics and retry-policy hints only;
//! no automatic retry happens here.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{Adapter, Address, Device, ErrorKind};
use log::{debug, warn};
use tokio::time;

use crate::error::{LinkError, Result};

/// Timeout for the raw link coming up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Ceiling on waiting for service discovery to resolve.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for service resolution.
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// Handshake phase of an attribute-protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GattPhase {
   Connecting,
   Connected,
   ServicesDiscovered,
   Ready,
}

impl GattPhase {
   /// Whether the service handshake has completed. Only sessions past
   /// this point may be counted as connected.
   pub fn services_known(self) -> bool {
      self >= Self::ServicesDiscovered
   }
}

/// Diagnostic classification of stack status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum GattStatusClass {
   Success,
   /// Busy, stack timeout, command in progress. Worth retrying later.
   Transient,
   /// Insufficient authentication, encryption, or authorization.
   Auth,
   NotSupported,
   LinkError,
   Other,
}

/// Maps a stack error kind into its diagnostic class.
pub fn classify(kind: &ErrorKind) -> GattStatusClass {
   match kind {
      ErrorKind::InProgress | ErrorKind::NotReady | ErrorKind::Failed => GattStatusClass::Transient,
      ErrorKind::AuthenticationFailed
      | ErrorKind::AuthenticationRejected
      | ErrorKind::AuthenticationCanceled
      | ErrorKind::AuthenticationTimeout
      | ErrorKind::NotAuthorized
      | ErrorKind::NotPermitted => GattStatusClass::Auth,
      ErrorKind::NotSupported => GattStatusClass::NotSupported,
      ErrorKind::ConnectionAttemptFailed => GattStatusClass::LinkError,
      _ => GattStatusClass::Other,
   }
}

/// A live attribute-protocol session.
#[async_trait]
pub trait GattSession: Send + Sync {
   /// Runs service discovery, returning the number of services found.
   async fn discover_services(&mut self) -> Result<usize>;
   async fn close(&mut self);
}

/// Capability to establish attribute-protocol sessions.
#[async_trait]
pub trait GattLink: Send + Sync {
   async fn connect(&self, address: Address) -> Result<Box<dyn GattSession>>;
}

/// BlueZ implementation of [`GattLink`].
pub struct BluerGattLink {
   adapter: Adapter,
}

impl BluerGattLink {
   pub const fn new(adapter: Adapter) -> Self {
      Self { adapter }
   }
}

#[async_trait]
impl GattLink for BluerGattLink {
   async fn connect(&self, address: Address) -> Result<Box<dyn GattSession>> {
      let device = self.adapter.device(address)?;
      debug!("Opening GATT session to {address}");

      match time::timeout(CONNECT_TIMEOUT, device.connect()).await {
         Ok(Ok(())) => {},
         Ok(Err(e)) => {
            warn!(
               "GATT connect to {address} failed ({}): {e}",
               classify(&e.kind)
            );
            return Err(e.into());
         },
         Err(_) => return Err(LinkError::RequestTimeout),
      }

      Ok(Box::new(BluerGattSession { address, device }))
   }
}

struct BluerGattSession {
   address: Address,
   device: Device,
}

#[async_trait]
impl GattSession for BluerGattSession {
   async fn discover_services(&mut self) -> Result<usize> {
      let deadline = time::Instant::now() + DISCOVERY_TIMEOUT;
      while !self.device.is_services_resolved().await.unwrap_or(false) {
         if time::Instant::now() >= deadline {
            return Err(LinkError::RequestTimeout);
         }
         time::sleep(DISCOVERY_POLL).await;
      }

      let services = self.device.services().await?;
      debug!(
         "Service discovery for {} found {} services",
         self.address,
         services.len()
      );
      Ok(services.len())
   }

   async fn close(&mut self) {
      if let Err(e) = self.device.disconnect().await {
         warn!("GATT disconnect for {} failed: {e}", self.address);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn phase_ordering_gates_connected() {
      assert!(!GattPhase::Connecting.services_known());
      assert!(!GattPhase::Connected.services_known());
      assert!(GattPhase::ServicesDiscovered.services_known());
      assert!(GattPhase::Ready.services_known());
   }

   #[test]
   fn status_classification_table() {
      assert_eq!(classify(&ErrorKind::InProgress), GattStatusClass::Transient);
      assert_eq!(classify(&ErrorKind::NotReady), GattStatusClass::Transient);
      assert_eq!(
         classify(&ErrorKind::AuthenticationFailed),
         GattStatusClass::Auth
      );
      assert_eq!(classify(&ErrorKind::NotAuthorized), GattStatusClass::Auth);
      assert_eq!(
         classify(&ErrorKind::NotSupported),
         GattStatusClass::NotSupported
      );
      assert_eq!(
         classify(&ErrorKind::ConnectionAttemptFailed),
         GattStatusClass::LinkError
      );
      assert_eq!(classify(&ErrorKind::DoesNotExist), GattStatusClass::Other);
   }
}
