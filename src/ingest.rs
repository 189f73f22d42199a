//! Event ingestion: normalizes asynchronous stack notifications.
//!
//! The wireless stack reports state through several independent channels
//! (adapter events, per-device property streams, profile outcomes). All of
//! them are funneled into one bounded queue of canonical
//! [`StackNotification`]s consumed by a single loop, which preserves
//! per-address arrival order and keeps one malformed notification from
//! affecting the next.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
   config::Permissions,
   error::Result,
   event::{EventSender, LinkEvent},
   orchestrator::OrchestratorHandle,
   registry::{
      AdvBytes, BondState, DeviceKind, DeviceList, DeviceRecord, NO_PERM, PowerState, Registry,
   },
   scanner::Scanner,
   stack::{Radio, ScanHandle},
   transport::ProfileKind,
};

/// Channel buffer size for the canonical notification queue.
pub const NOTIFY_BUFFER_SIZE: usize = 1000;

/// Device data extracted from a discovery hit or advertisement.
#[derive(Debug, Clone, Default)]
pub struct FoundDevice {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub kind: DeviceKind,
   pub rssi: Option<i16>,
   pub tx_power: Option<i16>,
   pub manufacturer_data: HashMap<u16, AdvBytes>,
   pub service_data: HashMap<Uuid, AdvBytes>,
}

/// Canonical form of every notification the stack can deliver.
#[derive(Debug, Clone)]
pub enum StackNotification {
   AdapterPower { on: bool },
   InquiryStarted,
   InquiryFinished,
   /// Classic inquiry hit.
   InquiryHit(FoundDevice),
   /// Low-energy scan result.
   LeAdvertisement(FoundDevice),
   AclConnected(Address),
   AclDisconnected(Address),
   AclDisconnectRequested(Address),
   BondStateChanged { address: Address, state: BondState },
   /// Recorded only; PIN/passkey interaction happens upstream.
   PairingRequest { address: Address, variant: SmolStr },
   NameChanged { address: Address, name: SmolStr },
   UuidsResolved { address: Address, uuids: Vec<Uuid> },
   /// Outcome of a profile-link connect/disconnect, fed back by the
   /// orchestrator so profile state flows through the same queue.
   ProfileStateChanged {
      address: Address,
      profile: ProfileKind,
      connected: bool,
   },
}

/// Everything the ingestion loop writes into or pokes.
pub struct IngestContext {
   pub registry: Arc<Registry>,
   pub scanner: Arc<Scanner>,
   pub orchestrator: OrchestratorHandle,
   pub radio: Arc<dyn Radio>,
   pub events: EventSender,
   pub reconcile_nudge: mpsc::Sender<()>,
   pub permissions: Permissions,
}

/// Ingestion loop with an idempotent registration lifecycle.
///
/// While unregistered, arriving notifications are dropped; `register`
/// additionally attaches the standing stack monitor so system events are
/// produced at all.
pub struct Ingestor {
   ctx: IngestContext,
   notify_tx: mpsc::Sender<StackNotification>,
   registered: AtomicBool,
   monitor: Mutex<Option<ScanHandle>>,
   consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Ingestor {
   /// Spawns the consuming loop. Returns the shared instance; call
   /// [`Ingestor::register`] to start receiving stack events.
   pub fn spawn(
      ctx: IngestContext,
      notify_tx: mpsc::Sender<StackNotification>,
      mut notify_rx: mpsc::Receiver<StackNotification>,
   ) -> Arc<Self> {
      let this = Arc::new(Self {
         ctx,
         notify_tx,
         registered: AtomicBool::new(false),
         monitor: Mutex::new(None),
         consumer: Mutex::new(None),
      });

      let consumer = tokio::spawn({
         let this = this.clone();
         async move {
            while let Some(notification) = notify_rx.recv().await {
               if !this.registered.load(Ordering::Relaxed) {
                  debug!("Dropping stack notification while unregistered");
                  continue;
               }
               // One bad notification must not take the loop down.
               if let Err(e) = this.handle(notification).await {
                  warn!("Failed to process stack notification: {e}");
               }
            }
            info!("Ingestion queue closed");
         }
      });
      *this.consumer.lock() = Some(consumer);
      this
   }

   /// Starts ingesting system events. Safe to call repeatedly.
   pub async fn register(&self) -> Result<()> {
      if self.registered.swap(true, Ordering::SeqCst) {
         return Ok(());
      }
      let monitor = self.ctx.radio.start_monitor(self.notify_tx.clone()).await?;
      *self.monitor.lock() = Some(monitor);
      info!("Receiver registered");
      Ok(())
   }

   /// Stops ingesting system events. Safe to call repeatedly.
   pub fn unregister(&self) {
      if self.registered.swap(false, Ordering::SeqCst) {
         self.monitor.lock().take();
         info!("Receiver unregistered");
      }
   }

   pub fn is_registered(&self) -> bool {
      self.registered.load(Ordering::Relaxed)
   }

   async fn handle(&self, notification: StackNotification) -> Result<()> {
      match notification {
         StackNotification::AdapterPower { on } => self.on_adapter_power(on),
         StackNotification::InquiryStarted => self.on_inquiry(true),
         StackNotification::InquiryFinished => self.on_inquiry(false),
         StackNotification::InquiryHit(found) => self.on_inquiry_hit(found),
         StackNotification::LeAdvertisement(found) => self.on_le_advertisement(found),
         StackNotification::AclConnected(address) => self.on_acl(address, true),
         StackNotification::AclDisconnected(address) => self.on_acl(address, false),
         StackNotification::AclDisconnectRequested(address) => {
            debug!("ACL disconnect requested for {address}");
            self.nudge_reconcile();
            Ok(())
         },
         StackNotification::BondStateChanged { address, state } => {
            self.on_bond_state(address, state)
         },
         StackNotification::PairingRequest { address, variant } => {
            // No automated PIN/passkey response; the UI layer owns that.
            info!("Pairing request from {address} ({variant})");
            Ok(())
         },
         StackNotification::NameChanged { address, name } => self.on_name_changed(address, name),
         StackNotification::UuidsResolved { address, uuids } => {
            self.on_uuids_resolved(address, uuids)
         },
         StackNotification::ProfileStateChanged {
            address,
            profile,
            connected,
         } => self.on_profile_state(address, profile, connected),
      }
   }

   fn on_adapter_power(&self, on: bool) -> Result<()> {
      let state = self
         .ctx
         .registry
         .set_power(if on { PowerState::On } else { PowerState::Off });
      info!(
         "Adapter power: {} (was {})",
         state.current, state.previous
      );
      self
         .ctx
         .events
         .emit(Address::any(), LinkEvent::AdapterPowerChanged(state));

      // Power going down is a hard stop signal, not a request.
      if state.current.is_down() {
         self.ctx.scanner.hard_stop();
      }
      Ok(())
   }

   fn on_inquiry(&self, started: bool) -> Result<()> {
      self.ctx.scanner.note_classic_discovery(started);
      if started {
         // A fresh inquiry invalidates prior classic results.
         self.ctx.registry.clear(DeviceList::ClassicDiscovered);
      }
      self
         .ctx
         .events
         .emit(Address::any(), LinkEvent::DiscoveryChanged(started));
      Ok(())
   }

   fn on_inquiry_hit(&self, found: FoundDevice) -> Result<()> {
      let mut record = self.sanitize(found, "inquiry");
      if record.kind == DeviceKind::Unknown {
         record.kind = DeviceKind::Classic;
      }
      self.ctx.registry.upsert(DeviceList::ClassicDiscovered, record);
      Ok(())
   }

   fn on_le_advertisement(&self, found: FoundDevice) -> Result<()> {
      let sanitized = self.sanitize(found, "le-scan");
      let record = Scanner::record_from_advertisement(sanitized);
      self.ctx.registry.upsert(DeviceList::LeDiscovered, record);
      Ok(())
   }

   fn on_acl(&self, address: Address, connected: bool) -> Result<()> {
      if connected {
         let mut record = DeviceRecord::new(address, "acl-connected");
         record.confirmed_at = Some(Instant::now());
         self.ctx.registry.upsert(DeviceList::Connected, record);
         self.ctx.events.emit(address, LinkEvent::DeviceConnected);
      } else {
         self.ctx.registry.remove(DeviceList::Connected, address);
         self.ctx.events.emit(address, LinkEvent::DeviceDisconnected);
      }
      // Events alone are not trusted to be complete.
      self.nudge_reconcile();
      Ok(())
   }

   fn on_bond_state(&self, address: Address, state: BondState) -> Result<()> {
      self
         .ctx
         .events
         .emit(address, LinkEvent::BondStateChanged(state));

      match state {
         BondState::Bonded => {
            self.ctx.registry.upsert(
               DeviceList::Bonded,
               DeviceRecord::new(address, "bonded").with_bond(BondState::Bonded),
            );
            // Auto-connect after pairing. A rejection because an attempt
            // is already in flight is expected here.
            self.ctx.orchestrator.request_connect(address);
         },
         BondState::None => {
            self.ctx.registry.remove(DeviceList::Bonded, address);
         },
         BondState::Bonding => {
            debug!("Bonding in progress with {address}");
         },
      }
      Ok(())
   }

   fn on_name_changed(&self, address: Address, name: SmolStr) -> Result<()> {
      let name = if self.ctx.permissions.connect {
         name
      } else {
         SmolStr::new(NO_PERM)
      };
      self.enrich(address, DeviceRecord::new(address, "name-changed").with_name(name));
      Ok(())
   }

   fn on_uuids_resolved(&self, address: Address, uuids: Vec<Uuid>) -> Result<()> {
      let mut record = DeviceRecord::new(address, "uuids-resolved");
      record.uuids = uuids;
      self.enrich(address, record);
      Ok(())
   }

   fn on_profile_state(
      &self,
      address: Address,
      profile: ProfileKind,
      connected: bool,
   ) -> Result<()> {
      if connected {
         let mut record = DeviceRecord::new(address, "profile-connected")
            .with_extra("profile", profile.to_string());
         // Stamp for staleness pruning by the reconciliation loop.
         record.confirmed_at = Some(Instant::now());
         self.ctx.registry.upsert(DeviceList::Connected, record);
         self.ctx.events.emit(address, LinkEvent::DeviceConnected);
      } else {
         self.ctx.registry.remove(DeviceList::Connected, address);
         self.ctx.events.emit(address, LinkEvent::DeviceDisconnected);
      }
      self.nudge_reconcile();
      Ok(())
   }

   /// Enrichment-only upsert: applied to every list that already holds
   /// the address, never creating new rows.
   fn enrich(&self, address: Address, record: DeviceRecord) {
      for list in [
         DeviceList::Bonded,
         DeviceList::ClassicDiscovered,
         DeviceList::LeDiscovered,
         DeviceList::Connecting,
         DeviceList::Connected,
      ] {
         if self.ctx.registry.contains(list, address) {
            self.ctx.registry.upsert(list, record.clone());
         }
      }
   }

   /// Builds a record from raw found-device data, degrading identity
   /// fields to the `<no-perm>` sentinel instead of failing the record.
   fn sanitize(&self, found: FoundDevice, action: &str) -> DeviceRecord {
      let mut record = DeviceRecord::new(found.address, action);
      record.kind = found.kind;
      record.rssi = found.rssi;
      record.tx_power = found.tx_power;
      record.manufacturer_data = found.manufacturer_data;
      record.service_data = found.service_data;
      record.name = if self.ctx.permissions.connect {
         found.name
      } else {
         Some(SmolStr::new(NO_PERM))
      };
      record
   }

   fn nudge_reconcile(&self) {
      // Full queue means a pass is already pending.
      let _ = self.ctx.reconcile_nudge.try_send(());
   }
}

impl Drop for Ingestor {
   fn drop(&mut self) {
      if let Some(consumer) = self.consumer.lock().take() {
         consumer.abort();
      }
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;
   use crate::{
      event::NullBus,
      stack::testing::FakeRadio,
   };

   fn addr(last: u8) -> Address {
      Address::new([0x10, 0x20, 0x30, 0x40, 0x50, last])
   }

   struct Harness {
      ingestor: Arc<Ingestor>,
      registry: Arc<Registry>,
      tx: mpsc::Sender<StackNotification>,
      commands: mpsc::Receiver<crate::orchestrator::Command>,
      nudges: mpsc::Receiver<()>,
   }

   async fn harness() -> Harness {
      harness_with(Permissions::default()).await
   }

   async fn harness_with(permissions: Permissions) -> Harness {
      let registry = Registry::new();
      let radio: Arc<dyn Radio> = Arc::new(FakeRadio::default());
      let events: EventSender = Arc::new(NullBus);
      let (tx, rx) = mpsc::channel(NOTIFY_BUFFER_SIZE);
      let scanner = Scanner::new(
         radio.clone(),
         registry.clone(),
         events.clone(),
         permissions,
         tx.clone(),
         Duration::from_secs(60),
         Duration::from_millis(10),
      );
      let (orchestrator, commands) = OrchestratorHandle::for_tests();
      let (nudge_tx, nudges) = mpsc::channel(1);

      let ingestor = Ingestor::spawn(
         IngestContext {
            registry: registry.clone(),
            scanner,
            orchestrator,
            radio,
            events,
            reconcile_nudge: nudge_tx,
            permissions,
         },
         tx.clone(),
         rx,
      );
      ingestor.register().await.unwrap();

      Harness {
         ingestor,
         registry,
         tx,
         commands,
         nudges,
      }
   }

   async fn settle() {
      time::sleep(Duration::from_millis(20)).await;
   }

   #[tokio::test(start_paused = true)]
   async fn inquiry_start_clears_classic_list() {
      let h = harness().await;
      h.registry.upsert(
         DeviceList::ClassicDiscovered,
         DeviceRecord::new(addr(1), "inquiry"),
      );

      h.tx.send(StackNotification::InquiryStarted).await.unwrap();
      settle().await;

      assert!(h.registry.snapshot(DeviceList::ClassicDiscovered).is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn acl_events_drive_connected_list_and_nudge() {
      let mut h = harness().await;

      h.tx
         .send(StackNotification::AclConnected(addr(2)))
         .await
         .unwrap();
      settle().await;
      assert!(h.registry.contains(DeviceList::Connected, addr(2)));
      assert!(h.nudges.try_recv().is_ok());

      h.tx
         .send(StackNotification::AclDisconnected(addr(2)))
         .await
         .unwrap();
      settle().await;
      assert!(!h.registry.contains(DeviceList::Connected, addr(2)));
   }

   #[tokio::test(start_paused = true)]
   async fn bonded_transition_auto_connects() {
      let mut h = harness().await;

      h.tx
         .send(StackNotification::BondStateChanged {
            address: addr(3),
            state: BondState::Bonded,
         })
         .await
         .unwrap();
      settle().await;

      assert!(h.registry.contains(DeviceList::Bonded, addr(3)));
      let cmd = h.commands.try_recv().expect("auto-connect was not issued");
      assert!(matches!(
         cmd,
         crate::orchestrator::Command::Connect(a, None) if a == addr(3)
      ));

      h.tx
         .send(StackNotification::BondStateChanged {
            address: addr(3),
            state: BondState::None,
         })
         .await
         .unwrap();
      settle().await;
      assert!(!h.registry.contains(DeviceList::Bonded, addr(3)));
   }

   #[tokio::test(start_paused = true)]
   async fn name_change_is_enrichment_only() {
      let h = harness().await;
      h.registry.upsert(
         DeviceList::Bonded,
         DeviceRecord::new(addr(4), "bonded").with_name("TP-210"),
      );

      h.tx
         .send(StackNotification::NameChanged {
            address: addr(4),
            name: SmolStr::new("TP-210 Front"),
         })
         .await
         .unwrap();
      // Name changes for unknown addresses must not create rows.
      h.tx
         .send(StackNotification::NameChanged {
            address: addr(5),
            name: SmolStr::new("Ghost"),
         })
         .await
         .unwrap();
      settle().await;

      let record = h.registry.get(DeviceList::Bonded, addr(4)).unwrap();
      assert_eq!(record.name.as_deref(), Some("TP-210 Front"));
      for list in [
         DeviceList::Bonded,
         DeviceList::ClassicDiscovered,
         DeviceList::LeDiscovered,
      ] {
         assert!(!h.registry.contains(list, addr(5)));
      }
   }

   #[tokio::test(start_paused = true)]
   async fn permission_denial_degrades_name_to_sentinel() {
      let h = harness_with(Permissions {
         connect: false,
         ..Permissions::default()
      })
      .await;

      let found = FoundDevice {
         address: addr(6),
         name: Some(SmolStr::new("Secret Printer")),
         kind: DeviceKind::Classic,
         rssi: Some(-44),
         ..Default::default()
      };
      h.tx.send(StackNotification::InquiryHit(found)).await.unwrap();
      settle().await;

      let record = h
         .registry
         .get(DeviceList::ClassicDiscovered, addr(6))
         .unwrap();
      assert_eq!(record.name.as_deref(), Some(NO_PERM));
      assert_eq!(record.rssi, Some(-44));
   }

   #[tokio::test(start_paused = true)]
   async fn unregistered_loop_drops_notifications() {
      let h = harness().await;
      h.ingestor.unregister();
      h.ingestor.unregister(); // idempotent

      h.tx
         .send(StackNotification::AclConnected(addr(7)))
         .await
         .unwrap();
      settle().await;
      assert!(!h.registry.contains(DeviceList::Connected, addr(7)));

      h.ingestor.register().await.unwrap();
      h.tx
         .send(StackNotification::AclConnected(addr(7)))
         .await
         .unwrap();
      settle().await;
      assert!(h.registry.contains(DeviceList::Connected, addr(7)));
   }

   #[tokio::test(start_paused = true)]
   async fn pairing_request_is_logged_only() {
      let mut h = harness().await;

      h.tx
         .send(StackNotification::PairingRequest {
            address: addr(9),
            variant: SmolStr::new("passkey-confirm"),
         })
         .await
         .unwrap();
      h.tx
         .send(StackNotification::AclDisconnectRequested(addr(9)))
         .await
         .unwrap();
      settle().await;

      // No list mutation from either, but a disconnect request still
      // prompts a reconciliation pass.
      for list in [DeviceList::Bonded, DeviceList::Connected] {
         assert!(!h.registry.contains(list, addr(9)));
      }
      assert!(h.nudges.try_recv().is_ok());
   }

   #[tokio::test(start_paused = true)]
   async fn profile_state_stamps_confirmation() {
      let h = harness().await;

      h.tx
         .send(StackNotification::ProfileStateChanged {
            address: addr(8),
            profile: ProfileKind::Hid,
            connected: true,
         })
         .await
         .unwrap();
      settle().await;

      let record = h.registry.get(DeviceList::Connected, addr(8)).unwrap();
      assert!(record.confirmed_at.is_some());
      assert_eq!(record.extra.get("profile").map(|s| s.as_str()), Some("hid"));
   }
}
