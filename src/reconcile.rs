//! Reconciliation loop: re-derives "connected" truth from the stack.
//!
//! Events can race, duplicate, or silently drop, so the connected list is
//! periodically rebuilt from first principles and swapped in wholesale.
//! Four sources are unioned per pass: attribute-protocol sessions known
//! to the stack, bonded devices probed individually, the orchestrator's
//! own sessions with a completed service handshake, and each profile
//! link's connected query. Profile-confirmed entries carry forward until
//! their confirmation goes stale.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, warn};
use tokio::{
   select,
   sync::mpsc,
   time::{self, Instant},
};

use crate::{
   registry::{DeviceKind, DeviceList, DeviceRecord, Registry},
   stack::Radio,
   transport::{HandleTable, profile::ProfileLink},
};

/// Nudge queue depth: a pending nudge already guarantees a pass.
const NUDGE_BUFFER: usize = 1;

/// Stack queries the loop rebuilds connectivity truth from.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
   /// Addresses with an attribute-protocol session known to the stack.
   async fn gatt_session_addresses(&self) -> Vec<Address>;
   /// Addresses of bonded devices, each probed individually.
   async fn bonded_addresses(&self) -> Vec<Address>;
   async fn is_connected(&self, address: Address) -> bool;
}

/// Probe implementation on the radio capability.
pub struct RadioProbe {
   radio: Arc<dyn Radio>,
}

impl RadioProbe {
   pub fn new(radio: Arc<dyn Radio>) -> Arc<Self> {
      Arc::new(Self { radio })
   }
}

#[async_trait]
impl ConnectivityProbe for RadioProbe {
   async fn gatt_session_addresses(&self) -> Vec<Address> {
      // BlueZ does not enumerate sessions directly; a connected
      // low-energy device implies a live attribute session.
      let Ok(devices) = self.radio.bonded_devices().await else {
         return Vec::new();
      };
      let mut sessions = Vec::new();
      for device in devices {
         if matches!(device.kind, DeviceKind::LowEnergy | DeviceKind::Dual)
            && self.radio.is_connected(device.address).await.unwrap_or(false)
         {
            sessions.push(device.address);
         }
      }
      sessions
   }

   async fn bonded_addresses(&self) -> Vec<Address> {
      match self.radio.bonded_devices().await {
         Ok(devices) => devices.into_iter().map(|d| d.address).collect(),
         Err(e) => {
            warn!("Bonded enumeration failed during reconciliation: {e}");
            Vec::new()
         },
      }
   }

   async fn is_connected(&self, address: Address) -> bool {
      self.radio.is_connected(address).await.unwrap_or(false)
   }
}

/// Shared control surface for the loop: immediate nudges and the
/// fast-cadence boost armed when a connection attempt starts.
#[derive(Clone)]
pub struct ReconcileControl {
   nudge_tx: mpsc::Sender<()>,
   boost_until: Arc<AtomicCell<Option<Instant>>>,
   boost_window: Duration,
}

impl ReconcileControl {
   /// Requests an immediate pass. Lossy by design.
   pub fn nudge(&self) {
      let _ = self.nudge_tx.try_send(());
   }

   pub fn nudge_sender(&self) -> mpsc::Sender<()> {
      self.nudge_tx.clone()
   }

   /// Tightens the cadence for the boost window so observers get fast
   /// feedback during active negotiation.
   pub fn note_attempt_started(&self) {
      self
         .boost_until
         .store(Some(Instant::now() + self.boost_window));
      self.nudge();
   }
}

pub struct Reconciler {
   registry: Arc<Registry>,
   probe: Arc<dyn ConnectivityProbe>,
   table: Arc<HandleTable>,
   profiles: Vec<Arc<dyn ProfileLink>>,
   base_interval: Duration,
   boost_interval: Duration,
   confirm_ttl: Duration,
   boost_until: Arc<AtomicCell<Option<Instant>>>,
   nudge_rx: mpsc::Receiver<()>,
}

impl Reconciler {
   #[allow(clippy::too_many_arguments)]
   pub fn new(
      registry: Arc<Registry>,
      probe: Arc<dyn ConnectivityProbe>,
      table: Arc<HandleTable>,
      profiles: Vec<Arc<dyn ProfileLink>>,
      base_interval: Duration,
      boost_interval: Duration,
      boost_window: Duration,
      confirm_ttl: Duration,
   ) -> (Self, ReconcileControl) {
      let (nudge_tx, nudge_rx) = mpsc::channel(NUDGE_BUFFER);
      let boost_until = Arc::new(AtomicCell::new(None));
      let control = ReconcileControl {
         nudge_tx,
         boost_until: boost_until.clone(),
         boost_window,
      };
      (
         Self {
            registry,
            probe,
            table,
            profiles,
            base_interval,
            boost_interval,
            confirm_ttl,
            boost_until,
            nudge_rx,
         },
         control,
      )
   }

   fn cadence(&self) -> Duration {
      match self.boost_until.load() {
         Some(until) if Instant::now() < until => self.boost_interval,
         _ => self.base_interval,
      }
   }

   pub async fn run(mut self) {
      loop {
         let interval = self.cadence();
         select! {
            _ = time::sleep(interval) => {},
            nudge = self.nudge_rx.recv() => {
               if nudge.is_none() {
                  debug!("Reconciliation loop shutting down");
                  return;
               }
            },
         }
         self.pass().await;
      }
   }

   /// One full rebuild of the connected list.
   pub async fn pass(&self) {
      let now = Instant::now();
      let previous = self.registry.snapshot(DeviceList::Connected);
      let mut next: HashMap<Address, DeviceRecord> = HashMap::new();

      // Carry over prior enrichment for addresses we re-confirm, and
      // keep profile-confirmed entries until their TTL lapses.
      let carry = |address: Address, action: &str| -> DeviceRecord {
         let mut record = previous
            .iter()
            .find(|r| r.address == address)
            .cloned()
            .unwrap_or_else(|| DeviceRecord::new(address, action));
         record.action = action.into();
         record.confirmed_at = Some(now);
         record
      };

      // (a) attribute-protocol sessions known to the stack
      for address in self.probe.gatt_session_addresses().await {
         next.insert(address, carry(address, "reconcile-gatt"));
      }

      // (b) bonded devices individually probed
      for address in self.probe.bonded_addresses().await {
         if !next.contains_key(&address) && self.probe.is_connected(address).await {
            next.insert(address, carry(address, "reconcile-bonded"));
         }
      }

      // (c) our own sessions, counted only past service discovery
      for address in self.table.ready_gatt_addresses() {
         next.entry(address)
            .or_insert_with(|| carry(address, "reconcile-session"));
      }
      for address in self.table.serial_addresses() {
         next.entry(address)
            .or_insert_with(|| carry(address, "reconcile-session"));
      }

      // (d) per-profile connected queries
      for link in &self.profiles {
         match link.connected_devices().await {
            Ok(addresses) => {
               for address in addresses {
                  let record = next
                     .entry(address)
                     .or_insert_with(|| carry(address, "reconcile-profile"));
                  record
                     .extra
                     .insert("profile".into(), link.kind().to_string().into());
               }
            },
            Err(e) => warn!("Profile {} query failed: {e}", link.kind()),
         }
      }

      // Unreconfirmed entries survive only within the confirmation TTL.
      for record in previous.iter() {
         if next.contains_key(&record.address) {
            continue;
         }
         if let Some(confirmed) = record.confirmed_at
            && now.saturating_duration_since(confirmed) < self.confirm_ttl
         {
            next.insert(record.address, record.clone());
         }
      }

      let records: Vec<DeviceRecord> = next.into_values().collect();
      debug!("Reconciliation pass: {} connected", records.len());
      self.registry.replace(DeviceList::Connected, records);
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;
   use crate::error::Result;
   use crate::transport::ProfileKind;

   fn addr(last: u8) -> Address {
      Address::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, last])
   }

   #[derive(Default)]
   struct FakeProbe {
      gatt: Mutex<Vec<Address>>,
      bonded: Mutex<Vec<Address>>,
      connected: Mutex<Vec<Address>>,
   }

   #[async_trait]
   impl ConnectivityProbe for FakeProbe {
      async fn gatt_session_addresses(&self) -> Vec<Address> {
         self.gatt.lock().clone()
      }

      async fn bonded_addresses(&self) -> Vec<Address> {
         self.bonded.lock().clone()
      }

      async fn is_connected(&self, address: Address) -> bool {
         self.connected.lock().contains(&address)
      }
   }

   struct FakeProfile {
      kind: ProfileKind,
      connected: Mutex<Vec<Address>>,
   }

   #[async_trait]
   impl ProfileLink for FakeProfile {
      fn kind(&self) -> ProfileKind {
         self.kind
      }

      async fn connect(&self, _address: Address) -> Result<()> {
         Ok(())
      }

      async fn disconnect(&self, _address: Address) -> Result<()> {
         Ok(())
      }

      async fn connected_devices(&self) -> Result<Vec<Address>> {
         Ok(self.connected.lock().clone())
      }
   }

   fn reconciler(
      probe: Arc<FakeProbe>,
      profiles: Vec<Arc<dyn ProfileLink>>,
   ) -> (Reconciler, Arc<Registry>, Arc<HandleTable>) {
      let registry = Registry::new();
      let table = Arc::new(HandleTable::default());
      let (reconciler, _control) = Reconciler::new(
         registry.clone(),
         probe,
         table.clone(),
         profiles,
         Duration::from_secs(5),
         Duration::from_secs(1),
         Duration::from_secs(15),
         Duration::from_secs(15),
      );
      (reconciler, registry, table)
   }

   #[tokio::test(start_paused = true)]
   async fn converges_to_probe_truth_in_one_pass() {
      let probe = Arc::new(FakeProbe::default());
      probe.bonded.lock().push(addr(1));
      probe.connected.lock().push(addr(1));
      let (reconciler, registry, _table) = reconciler(probe, vec![]);

      // Ghost entry from a missed disconnect event, never confirmed.
      registry.upsert(DeviceList::Connected, DeviceRecord::new(addr(9), "acl-connected"));

      reconciler.pass().await;

      let snap = registry.snapshot(DeviceList::Connected);
      assert_eq!(snap.len(), 1);
      assert_eq!(snap[0].address, addr(1));
   }

   #[tokio::test(start_paused = true)]
   async fn profile_confirmation_survives_until_ttl() {
      let probe = Arc::new(FakeProbe::default());
      let (reconciler, registry, _table) = reconciler(probe, vec![]);

      let mut record = DeviceRecord::new(addr(2), "profile-connected");
      record.confirmed_at = Some(Instant::now());
      registry.upsert(DeviceList::Connected, record);

      // Fresh confirmation is carried forward even though no source
      // reports the device right now.
      reconciler.pass().await;
      assert!(registry.contains(DeviceList::Connected, addr(2)));

      // Past the TTL it is pruned.
      time::sleep(Duration::from_secs(16)).await;
      reconciler.pass().await;
      assert!(!registry.contains(DeviceList::Connected, addr(2)));
   }

   #[tokio::test(start_paused = true)]
   async fn union_covers_all_four_sources() {
      let probe = Arc::new(FakeProbe::default());
      probe.gatt.lock().push(addr(1));
      probe.bonded.lock().push(addr(2));
      probe.connected.lock().push(addr(2));

      let profile: Arc<dyn ProfileLink> = Arc::new(FakeProfile {
         kind: ProfileKind::AudioSink,
         connected: Mutex::new(vec![addr(3), addr(1)]),
      });
      let (reconciler, registry, table) = reconciler(probe, vec![profile]);
      table.insert_serial(addr(4), Box::new(NoopSerial));

      reconciler.pass().await;

      let snap = registry.snapshot(DeviceList::Connected);
      let mut addresses: Vec<Address> = snap.iter().map(|r| r.address).collect();
      addresses.sort_unstable_by_key(|a| a.0);
      // De-duplicated: addr(1) appears via both gatt and profile.
      assert_eq!(addresses, vec![addr(1), addr(2), addr(3), addr(4)]);
   }

   #[tokio::test(start_paused = true)]
   async fn raw_gatt_links_do_not_count_as_connected() {
      use crate::transport::gatt::{GattPhase, GattSession};

      struct NoopGatt;
      #[async_trait]
      impl GattSession for NoopGatt {
         async fn discover_services(&mut self) -> Result<usize> {
            Ok(0)
         }
         async fn close(&mut self) {}
      }

      let probe = Arc::new(FakeProbe::default());
      let (reconciler, registry, table) = reconciler(probe, vec![]);
      table.insert_gatt(addr(5), Box::new(NoopGatt), GattPhase::Connected);

      reconciler.pass().await;
      assert!(!registry.contains(DeviceList::Connected, addr(5)));

      table.set_gatt_phase(addr(5), GattPhase::ServicesDiscovered);
      reconciler.pass().await;
      assert!(registry.contains(DeviceList::Connected, addr(5)));
   }

   #[tokio::test(start_paused = true)]
   async fn boost_tightens_cadence_within_window() {
      let probe = Arc::new(FakeProbe::default());
      let registry = Registry::new();
      let table = Arc::new(HandleTable::default());
      let (reconciler, control) = Reconciler::new(
         registry,
         probe,
         table,
         vec![],
         Duration::from_secs(5),
         Duration::from_secs(1),
         Duration::from_secs(15),
         Duration::from_secs(15),
      );

      assert_eq!(reconciler.cadence(), Duration::from_secs(5));
      control.note_attempt_started();
      assert_eq!(reconciler.cadence(), Duration::from_secs(1));

      time::sleep(Duration::from_secs(16)).await;
      assert_eq!(reconciler.cadence(), Duration::from_secs(5));
   }

   struct NoopSerial;

   #[async_trait]
   impl crate::transport::rfcomm::SerialSession for NoopSerial {
      async fn close(&mut self) {}
   }
}
