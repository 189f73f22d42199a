//! Radio capability seam over the platform Bluetooth stack.
//!
//! The rest of the core talks to the stack through the [`Radio`] trait:
//! address resolution, bonding, discovery, and the standing monitor that
//! pumps raw adapter/device events into the canonical notification queue.
//! [`BluerRadio`] is the BlueZ implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, AddressType, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{
   sync::mpsc,
   task::{JoinHandle, JoinSet},
};
use uuid::Uuid;

use crate::{
   error::{LinkError, Result},
   ingest::{FoundDevice, StackNotification},
   registry::{BondState, DeviceKind},
};

/// Which discovery mechanism to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTransport {
   Classic,
   LowEnergy,
}

/// Optional discovery narrowing passed through to the stack.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
   pub service_uuids: Vec<Uuid>,
}

/// Abortable handle to a background monitor or discovery task.
pub struct ScanHandle(JoinHandle<()>);

impl ScanHandle {
   pub fn new(handle: JoinHandle<()>) -> Self {
      Self(handle)
   }

   pub fn stop(&self) {
      self.0.abort();
   }
}

impl Drop for ScanHandle {
   fn drop(&mut self) {
      self.0.abort();
   }
}

/// Identity and bond info resolved for one address.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub kind: DeviceKind,
   pub bond: BondState,
}

/// Capability interface over the platform radio.
#[async_trait]
pub trait Radio: Send + Sync {
   /// Resolves an address to device identity; failure aborts the caller's
   /// attempt.
   async fn resolve(&self, address: Address) -> Result<ResolvedDevice>;

   /// Requests a bonding handshake.
   async fn pair(&self, address: Address) -> Result<()>;

   /// Drops the long-term key for the address.
   async fn unpair(&self, address: Address) -> Result<()>;

   async fn bond_state(&self, address: Address) -> Result<BondState>;

   /// Probes the baseband link state for one address.
   async fn is_connected(&self, address: Address) -> Result<bool>;

   async fn bonded_devices(&self) -> Result<Vec<ResolvedDevice>>;

   /// Starts one discovery mechanism; the returned handle aborts it.
   async fn start_discovery(
      &self,
      transport: ScanTransport,
      filter: Option<ScanFilter>,
      notify: mpsc::Sender<StackNotification>,
   ) -> Result<ScanHandle>;

   /// Attaches the standing monitor translating raw stack events into
   /// canonical notifications.
   async fn start_monitor(&self, notify: mpsc::Sender<StackNotification>) -> Result<ScanHandle>;
}

/// BlueZ implementation of [`Radio`].
pub struct BluerRadio {
   adapter: Adapter,
}

impl BluerRadio {
   /// Connects to the system Bluetooth daemon and powers the default
   /// adapter on if needed.
   pub async fn new() -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         adapter.set_powered(true).await?;
         info!("Powered on adapter {}", adapter.name());
      }

      Ok(Self { adapter })
   }

   pub fn adapter(&self) -> &Adapter {
      &self.adapter
   }

   fn device(&self, address: Address) -> Result<bluer::Device> {
      self
         .adapter
         .device(address)
         .map_err(|_| LinkError::ResolveFailed(address))
   }

   async fn found_device(device: &bluer::Device) -> FoundDevice {
      let kind = match device.address_type().await {
         Ok(AddressType::BrEdr) => DeviceKind::Classic,
         Ok(_) => DeviceKind::LowEnergy,
         Err(_) => DeviceKind::Unknown,
      };

      let manufacturer_data = device
         .manufacturer_data()
         .await
         .ok()
         .flatten()
         .unwrap_or_default()
         .into_iter()
         .map(|(id, bytes)| (id, SmallVec::from_vec(bytes)))
         .collect();
      let service_data = device
         .service_data()
         .await
         .ok()
         .flatten()
         .unwrap_or_default()
         .into_iter()
         .map(|(uuid, bytes)| (uuid, SmallVec::from_vec(bytes)))
         .collect();

      FoundDevice {
         address: device.address(),
         name: device.name().await.ok().flatten().map(SmolStr::new),
         kind,
         rssi: device.rssi().await.ok().flatten(),
         tx_power: device.tx_power().await.ok().flatten(),
         manufacturer_data,
         service_data,
      }
   }

   /// Watches one device's property stream for link, bond, and
   /// enrichment changes.
   async fn monitor_device(
      adapter: Adapter,
      address: Address,
      notify: mpsc::Sender<StackNotification>,
   ) {
      let Ok(device) = adapter.device(address) else {
         return;
      };
      let Ok(mut events) = device.events().await else {
         return;
      };

      while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
         let notification = match property {
            DeviceProperty::Connected(true) => StackNotification::AclConnected(address),
            DeviceProperty::Connected(false) => StackNotification::AclDisconnected(address),
            DeviceProperty::Paired(paired) => StackNotification::BondStateChanged {
               address,
               state: if paired {
                  BondState::Bonded
               } else {
                  BondState::None
               },
            },
            DeviceProperty::Name(name) => StackNotification::NameChanged {
               address,
               name: SmolStr::new(name),
            },
            DeviceProperty::Uuids(uuids) => StackNotification::UuidsResolved {
               address,
               uuids: uuids.into_iter().collect(),
            },
            _ => continue,
         };
         if notify.send(notification).await.is_err() {
            return;
         }
      }
   }
}

#[async_trait]
impl Radio for BluerRadio {
   async fn resolve(&self, address: Address) -> Result<ResolvedDevice> {
      let device = self.device(address)?;
      let kind = match device.address_type().await {
         Ok(AddressType::BrEdr) => DeviceKind::Classic,
         Ok(_) => DeviceKind::LowEnergy,
         Err(_) => DeviceKind::Unknown,
      };
      Ok(ResolvedDevice {
         address,
         name: device.name().await.ok().flatten().map(SmolStr::new),
         kind,
         bond: if device.is_paired().await.unwrap_or(false) {
            BondState::Bonded
         } else {
            BondState::None
         },
      })
   }

   async fn pair(&self, address: Address) -> Result<()> {
      let device = self.device(address)?;
      device.pair().await?;
      Ok(())
   }

   async fn unpair(&self, address: Address) -> Result<()> {
      self.adapter.remove_device(address).await?;
      Ok(())
   }

   async fn bond_state(&self, address: Address) -> Result<BondState> {
      let device = self.device(address)?;
      Ok(if device.is_paired().await? {
         BondState::Bonded
      } else {
         BondState::None
      })
   }

   async fn is_connected(&self, address: Address) -> Result<bool> {
      let device = self.device(address)?;
      Ok(device.is_connected().await?)
   }

   async fn bonded_devices(&self) -> Result<Vec<ResolvedDevice>> {
      let mut bonded = Vec::new();
      for address in self.adapter.device_addresses().await? {
         let Ok(device) = self.adapter.device(address) else {
            continue;
         };
         if device.is_paired().await.unwrap_or(false) {
            bonded.push(self.resolve(address).await?);
         }
      }
      Ok(bonded)
   }

   async fn start_discovery(
      &self,
      transport: ScanTransport,
      filter: Option<ScanFilter>,
      notify: mpsc::Sender<StackNotification>,
   ) -> Result<ScanHandle> {
      let discovery_filter = DiscoveryFilter {
         transport: match transport {
            ScanTransport::Classic => DiscoveryTransport::BrEdr,
            ScanTransport::LowEnergy => DiscoveryTransport::Le,
         },
         uuids: filter
            .map(|f| f.service_uuids.into_iter().collect())
            .unwrap_or_default(),
         ..Default::default()
      };
      // Best-effort: the daemon may refuse filter changes mid-discovery.
      if let Err(e) = self.adapter.set_discovery_filter(discovery_filter).await {
         warn!("Failed to set discovery filter: {e}");
      }

      let mut events = self
         .adapter
         .discover_devices()
         .await
         .map_err(|e| LinkError::ScanFailed(e.to_string()))?;
      let adapter = self.adapter.clone();

      let handle = tokio::spawn(async move {
         if transport == ScanTransport::Classic {
            let _ = notify.send(StackNotification::InquiryStarted).await;
         }
         let mut monitors = JoinSet::new();

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(address) => {
                  debug!("Discovery hit: {address}");
                  let Ok(device) = adapter.device(address) else {
                     continue;
                  };
                  let found = Self::found_device(&device).await;
                  let notification = match transport {
                     ScanTransport::Classic => StackNotification::InquiryHit(found),
                     ScanTransport::LowEnergy => StackNotification::LeAdvertisement(found),
                  };
                  if notify.send(notification).await.is_err() {
                     break;
                  }
                  monitors.spawn(Self::monitor_device(
                     adapter.clone(),
                     address,
                     notify.clone(),
                  ));
               },
               AdapterEvent::PropertyChanged(AdapterProperty::Discovering(active)) => {
                  if transport == ScanTransport::Classic {
                     let notification = if active {
                        StackNotification::InquiryStarted
                     } else {
                        StackNotification::InquiryFinished
                     };
                     if notify.send(notification).await.is_err() {
                        break;
                     }
                  }
               },
               _ => {},
            }
         }

         if transport == ScanTransport::Classic {
            let _ = notify.send(StackNotification::InquiryFinished).await;
         }
         monitors.abort_all();
      });

      Ok(ScanHandle::new(handle))
   }

   async fn start_monitor(&self, notify: mpsc::Sender<StackNotification>) -> Result<ScanHandle> {
      let mut events = self.adapter.events().await?;
      let adapter = self.adapter.clone();

      // Watch devices the daemon already knows about (bonded printers
      // reconnecting on their own, for instance).
      let initial = self.adapter.device_addresses().await.unwrap_or_default();

      let handle = tokio::spawn(async move {
         let mut monitors = JoinSet::new();
         for address in initial {
            monitors.spawn(Self::monitor_device(
               adapter.clone(),
               address,
               notify.clone(),
            ));
         }

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) => {
                  if notify
                     .send(StackNotification::AdapterPower { on })
                     .await
                     .is_err()
                  {
                     break;
                  }
               },
               AdapterEvent::DeviceAdded(address) => {
                  monitors.spawn(Self::monitor_device(
                     adapter.clone(),
                     address,
                     notify.clone(),
                  ));
               },
               _ => {},
            }
         }

         warn!("Adapter event stream ended");
         monitors.abort_all();
      });

      Ok(ScanHandle::new(handle))
   }
}
