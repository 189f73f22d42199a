//! Unified device discovery.
//!
//! Owns the two independent discovery mechanisms (classic inquiry and
//! low-energy scan), coordinates their start/stop, and enforces the
//! auto-stop window so scanning never runs unbounded. The externally
//! observed "is discovering" flag is the logical OR of the two.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::mpsc,
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   config::Permissions,
   error::Result,
   event::{EventSender, LinkEvent},
   ingest::StackNotification,
   registry::{BondState, DeviceKind, DeviceList, DeviceRecord, Registry},
   stack::{Radio, ScanFilter, ScanHandle, ScanTransport},
};

#[derive(Default)]
struct ScanTasks {
   classic: Option<ScanHandle>,
   le: Option<ScanHandle>,
   auto_stop: Option<JoinHandle<()>>,
}

pub struct Scanner {
   radio: Arc<dyn Radio>,
   registry: Arc<Registry>,
   events: EventSender,
   permissions: Permissions,
   notify_tx: mpsc::Sender<StackNotification>,
   scan_window: Duration,
   settle: Duration,
   classic_discovering: AtomicBool,
   le_discovering: AtomicBool,
   tasks: Mutex<ScanTasks>,
}

impl Scanner {
   pub fn new(
      radio: Arc<dyn Radio>,
      registry: Arc<Registry>,
      events: EventSender,
      permissions: Permissions,
      notify_tx: mpsc::Sender<StackNotification>,
      scan_window: Duration,
      settle: Duration,
   ) -> Arc<Self> {
      Arc::new(Self {
         radio,
         registry,
         events,
         permissions,
         notify_tx,
         scan_window,
         settle,
         classic_discovering: AtomicBool::new(false),
         le_discovering: AtomicBool::new(false),
         tasks: Mutex::new(ScanTasks::default()),
      })
   }

   pub fn is_discovering(&self) -> bool {
      self.classic_discovering.load(Ordering::Relaxed)
         || self.le_discovering.load(Ordering::Relaxed)
   }

   /// Starts both discovery mechanisms and arms the auto-stop window.
   ///
   /// Missing scan permission turns the whole call into a logged no-op;
   /// missing location permission skips only the low-energy scan. Radio
   /// failures are logged, flip the affected flag off, and never
   /// propagate to the caller.
   pub async fn start_unified(self: &Arc<Self>, filter: Option<ScanFilter>) -> Result<()> {
      if !self.permissions.scan {
         info!("Scan permission absent, discovery not started");
         return Ok(());
      }

      self.refresh_known_devices().await;

      if self.permissions.location {
         match self
            .radio
            .start_discovery(ScanTransport::LowEnergy, filter, self.notify_tx.clone())
            .await
         {
            Ok(handle) => {
               self.le_discovering.store(true, Ordering::Relaxed);
               self.tasks.lock().le = Some(handle);
            },
            Err(e) => {
               warn!("Low-energy scan failed to start: {e}");
               self.le_discovering.store(false, Ordering::Relaxed);
            },
         }
      } else {
         info!("Location permission absent, skipping low-energy scan");
      }

      match self
         .radio
         .start_discovery(ScanTransport::Classic, None, self.notify_tx.clone())
         .await
      {
         Ok(handle) => {
            self.classic_discovering.store(true, Ordering::Relaxed);
            self.tasks.lock().classic = Some(handle);
         },
         Err(e) => {
            warn!("Classic inquiry failed to start: {e}");
            self.classic_discovering.store(false, Ordering::Relaxed);
         },
      }

      if self.is_discovering() {
         self
            .events
            .emit(Address::any(), LinkEvent::DiscoveryChanged(true));
         self.arm_auto_stop();
      }
      Ok(())
   }

   /// Stops both mechanisms. Idempotent.
   pub fn stop_unified(&self) {
      self.hard_stop();
   }

   /// Unconditional stop, also used when the adapter powers down.
   pub fn hard_stop(&self) {
      let was_discovering = self.is_discovering();

      let mut tasks = self.tasks.lock();
      tasks.classic.take();
      tasks.le.take();
      if let Some(auto_stop) = tasks.auto_stop.take() {
         auto_stop.abort();
      }
      drop(tasks);

      self.classic_discovering.store(false, Ordering::Relaxed);
      self.le_discovering.store(false, Ordering::Relaxed);

      if was_discovering {
         info!("Discovery stopped");
         self
            .events
            .emit(Address::any(), LinkEvent::DiscoveryChanged(false));
      }
   }

   /// Stop, settle, start. Used when scan state is suspected to have
   /// desynchronized from the stack.
   pub async fn restart(self: &Arc<Self>) -> Result<()> {
      self.stop_unified();
      time::sleep(self.settle).await;
      self.start_unified(None).await
   }

   /// Ingestion feedback for inquiry start/finish observed on the stack.
   pub fn note_classic_discovery(&self, active: bool) {
      self.classic_discovering.store(active, Ordering::Relaxed);
   }

   /// Shapes a sanitized scan-result record for the LE-discovered list,
   /// with the advertisement already decomposed into manufacturer-ID and
   /// service-UUID payload maps.
   pub fn record_from_advertisement(mut record: DeviceRecord) -> DeviceRecord {
      if record.kind == DeviceKind::Unknown {
         record.kind = DeviceKind::LowEnergy;
      }
      for (id, bytes) in &record.manufacturer_data {
         debug!(
            "{} adv manufacturer {:#06x}: {}",
            record.address,
            id,
            hex::encode(bytes)
         );
      }
      for (uuid, bytes) in &record.service_data {
         debug!("{} adv service {uuid}: {}", record.address, hex::encode(bytes));
      }
      record
   }

   /// Refreshes the bonded snapshot and re-probes their link state so a
   /// scan starts from current truth.
   async fn refresh_known_devices(&self) {
      match self.radio.bonded_devices().await {
         Ok(devices) => {
            let mut records = Vec::with_capacity(devices.len());
            for device in devices {
               if self.radio.is_connected(device.address).await.unwrap_or(false) {
                  let mut record = DeviceRecord::new(device.address, "scan-refresh");
                  record.confirmed_at = Some(Instant::now());
                  self.registry.upsert(DeviceList::Connected, record);
               }
               let mut record = DeviceRecord::new(device.address, "bonded")
                  .with_kind(device.kind)
                  .with_bond(BondState::Bonded);
               record.name = device.name;
               records.push(record);
            }
            self.registry.replace(DeviceList::Bonded, records);
         },
         Err(e) => warn!("Failed to refresh bonded devices: {e}"),
      }
   }

   fn arm_auto_stop(self: &Arc<Self>) {
      let this = self.clone();
      let window = self.scan_window;
      let handle = tokio::spawn(async move {
         time::sleep(window).await;
         debug!("Scan auto-stop window elapsed");
         this.hard_stop();
      });

      let mut tasks = self.tasks.lock();
      if let Some(old) = tasks.auto_stop.replace(handle) {
         old.abort();
      }
   }
}
