//! Classic profile links (audio sink, hands-free, HID).
//!
//! These profiles are not reachable as direct socket connects; they go
//! through a per-profile capability that resolves the device handle and
//! invokes the stack's profile connect. Handle resolution is bounded by a
//! short wait so a stuck profile service can never wedge a connection
//! attempt.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{Adapter, Address, Device};
use log::debug;
use tokio::time;

use crate::{
   error::{LinkError, Result},
   transport::ProfileKind,
};

/// Capability interface to one classic profile.
///
/// One concrete adapter exists per profile; the orchestrator and the
/// reconciliation loop only ever see this interface.
#[async_trait]
pub trait ProfileLink: Send + Sync {
   fn kind(&self) -> ProfileKind;
   async fn connect(&self, address: Address) -> Result<()>;
   async fn disconnect(&self, address: Address) -> Result<()>;
   /// Addresses this profile currently reports as connected.
   async fn connected_devices(&self) -> Result<Vec<Address>>;
}

/// BlueZ-backed profile link.
pub struct BluerProfileLink {
   kind: ProfileKind,
   adapter: Adapter,
   resolve_timeout: Duration,
}

impl BluerProfileLink {
   pub const fn new(kind: ProfileKind, adapter: Adapter, resolve_timeout: Duration) -> Self {
      Self {
         kind,
         adapter,
         resolve_timeout,
      }
   }

   /// One adapter per supported profile.
   pub fn all(adapter: &Adapter, resolve_timeout: Duration) -> Vec<std::sync::Arc<dyn ProfileLink>> {
      ProfileKind::all()
         .map(|kind| {
            std::sync::Arc::new(Self::new(kind, adapter.clone(), resolve_timeout))
               as std::sync::Arc<dyn ProfileLink>
         })
         .collect()
   }

   /// Resolves the device handle, bounded so a hung profile service
   /// degrades to a timeout instead of blocking the attempt.
   async fn resolve(&self, address: Address) -> Result<Device> {
      time::timeout(self.resolve_timeout, async {
         self.adapter.device(address).map_err(LinkError::from)
      })
      .await
      .map_err(|_| LinkError::RequestTimeout)?
   }
}

#[async_trait]
impl ProfileLink for BluerProfileLink {
   fn kind(&self) -> ProfileKind {
      self.kind
   }

   async fn connect(&self, address: Address) -> Result<()> {
      let device = self.resolve(address).await?;
      debug!("Profile {} connect to {address}", self.kind);
      device.connect_profile(&self.kind.uuid()).await?;
      Ok(())
   }

   async fn disconnect(&self, address: Address) -> Result<()> {
      let device = self.resolve(address).await?;
      debug!("Profile {} disconnect from {address}", self.kind);
      device.disconnect_profile(&self.kind.uuid()).await?;
      Ok(())
   }

   async fn connected_devices(&self) -> Result<Vec<Address>> {
      let uuid = self.kind.uuid();
      let mut connected = Vec::new();

      for addr in self.adapter.device_addresses().await? {
         let Ok(device) = self.adapter.device(addr) else {
            continue;
         };
         if device.is_connected().await.unwrap_or(false)
            && let Ok(Some(uuids)) = device.uuids().await
            && uuids.contains(&uuid)
         {
            connected.push(addr);
         }
      }

      Ok(connected)
   }
}
