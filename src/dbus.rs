//! External D-Bus interface of the connectivity core.
//!
//! Thin translation layer: string addresses in, JSON snapshots and
//! booleans out, connectivity events re-published as signals. All real
//! work happens in the orchestrator, scanner, and ingestor.

use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::info;
use serde_json::json;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use uuid::Uuid;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   ingest::{Ingestor, StackNotification},
   orchestrator::OrchestratorHandle,
   registry::{DeviceList, PowerState, Registry},
   scanner::Scanner,
   stack::ScanFilter,
   transport::{ProfileKind, profile::ProfileLink},
};

pub struct PrintLinkService {
   orchestrator: OrchestratorHandle,
   scanner: Arc<Scanner>,
   registry: Arc<Registry>,
   ingestor: Arc<Ingestor>,
   profiles: Vec<Arc<dyn ProfileLink>>,
   notify_tx: mpsc::Sender<StackNotification>,
}

impl PrintLinkService {
   pub const fn new(
      orchestrator: OrchestratorHandle,
      scanner: Arc<Scanner>,
      registry: Arc<Registry>,
      ingestor: Arc<Ingestor>,
      profiles: Vec<Arc<dyn ProfileLink>>,
      notify_tx: mpsc::Sender<StackNotification>,
   ) -> Self {
      Self {
         orchestrator,
         scanner,
         registry,
         ingestor,
         profiles,
         notify_tx,
      }
   }

   fn devices_json(&self) -> String {
      let mut lists = serde_json::Map::new();
      for list in DeviceList::iter() {
         let records: Vec<serde_json::Value> = self
            .registry
            .snapshot(list)
            .iter()
            .map(|r| r.to_json())
            .collect();
         lists.insert(list.to_string(), json!(records));
      }
      serde_json::Value::Object(lists).to_string()
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.printlink")]
impl PrintLinkService {
   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .orchestrator
         .connect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .orchestrator
         .disconnect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn disconnect_all(&self) -> zbus::fdo::Result<u32> {
      let count = self
         .orchestrator
         .disconnect_all()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(count as u32)
   }

   async fn create_bond(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .orchestrator
         .create_bond(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn remove_bond(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .orchestrator
         .remove_bond(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   /// Starts unified discovery, optionally narrowed to service UUIDs.
   async fn start_scanning(&self, filter_uuids: Vec<String>) -> zbus::fdo::Result<bool> {
      let filter = if filter_uuids.is_empty() {
         None
      } else {
         let mut service_uuids = Vec::with_capacity(filter_uuids.len());
         for raw in &filter_uuids {
            service_uuids
               .push(Uuid::from_str(raw).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?);
         }
         Some(ScanFilter { service_uuids })
      };

      self
         .scanner
         .start_unified(filter)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(self.scanner.is_discovering())
   }

   async fn stop_scanning(&self) -> zbus::fdo::Result<bool> {
      self.scanner.stop_unified();
      Ok(true)
   }

   /// Connects one classic profile directly. Unsupported profile names
   /// (LE audio, mesh) are rejected here before any radio work.
   async fn connect_profile(&self, address: String, profile: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let kind = ProfileKind::parse(&profile)
         .map_err(|e| zbus::fdo::Error::NotSupported(e.to_string()))?;
      let link = self
         .profiles
         .iter()
         .find(|l| l.kind() == kind)
         .ok_or_else(|| zbus::fdo::Error::NotSupported(format!("No link for {kind}")))?;

      link
         .connect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      info!("Profile {kind} connected to {address}");

      let _ = self
         .notify_tx
         .send(StackNotification::ProfileStateChanged {
            address: addr,
            profile: kind,
            connected: true,
         })
         .await;
      Ok(true)
   }

   async fn disconnect_profile(&self, address: String, profile: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let kind = ProfileKind::parse(&profile)
         .map_err(|e| zbus::fdo::Error::NotSupported(e.to_string()))?;
      let link = self
         .profiles
         .iter()
         .find(|l| l.kind() == kind)
         .ok_or_else(|| zbus::fdo::Error::NotSupported(format!("No link for {kind}")))?;

      link
         .disconnect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      let _ = self
         .notify_tx
         .send(StackNotification::ProfileStateChanged {
            address: addr,
            profile: kind,
            connected: false,
         })
         .await;
      Ok(true)
   }

   /// Attaches the stack event receiver. Idempotent.
   async fn register_receiver(&self) -> zbus::fdo::Result<bool> {
      self
         .ingestor
         .register()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   async fn unregister_receiver(&self) -> zbus::fdo::Result<bool> {
      self.ingestor.unregister();
      Ok(true)
   }

   /// All five device lists as one JSON object keyed by list name.
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      Ok(self.devices_json())
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      // Most specific list wins when the address appears in several.
      for list in [
         DeviceList::Connected,
         DeviceList::Connecting,
         DeviceList::Bonded,
         DeviceList::ClassicDiscovered,
         DeviceList::LeDiscovered,
      ] {
         if let Some(record) = self.registry.get(list, addr) {
            return Ok(record.to_json().to_string());
         }
      }
      Err(zbus::fdo::Error::Failed("Device not found".into()))
   }

   // Signals

   #[zbus(signal)]
   pub async fn device_connecting(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connect_timeout(
      emitter: &SignalEmitter<'_>,
      address: &str,
      reason: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn bond_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_state_changed(emitter: &SignalEmitter<'_>, active: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_power_changed(
      emitter: &SignalEmitter<'_>,
      current: &str,
      previous: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(
      emitter: &SignalEmitter<'_>,
      address: &str,
      message: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates

   #[zbus(property)]
   async fn devices(&self) -> String {
      self.devices_json()
   }

   #[zbus(property)]
   async fn discovering(&self) -> bool {
      self.scanner.is_discovering()
   }

   #[zbus(property)]
   async fn adapter_powered(&self) -> bool {
      self.registry.power().current == PowerState::On
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.registry.snapshot(DeviceList::Connected).len() as u32
   }

   #[zbus(property)]
   async fn receiver_registered(&self) -> bool {
      self.ingestor.is_registered()
   }
}
