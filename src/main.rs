//! PrintLink D-Bus service
//!
//! Connectivity daemon for Bluetooth receipt and label printers: unified
//! discovery, a copy-on-write device registry, a multi-transport
//! connection orchestrator, and a reconciliation loop that keeps the
//! connected list honest against the stack.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, sync::mpsc, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use dbus::PrintLinkService;
use event::{EventBus, LinkEvent};

mod config;
mod dbus;
mod error;
mod event;
mod ingest;
mod orchestrator;
mod reconcile;
mod registry;
mod scanner;
mod stack;
mod transport;

use crate::{
   dbus::PrintLinkServiceSignals,
   error::Result,
   ingest::{IngestContext, Ingestor, NOTIFY_BUFFER_SIZE},
   orchestrator::{Orchestrator, OrchestratorDeps},
   reconcile::{RadioProbe, Reconciler},
   registry::Registry,
   scanner::Scanner,
   stack::BluerRadio,
   transport::{HandleTable, gatt::BluerGattLink, profile::BluerProfileLink, rfcomm::RfcommLink},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting PrintLink D-Bus service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known printers",
      config.known_printers.len()
   );

   let radio = Arc::new(BluerRadio::new().await?);
   let adapter = radio.adapter().clone();

   let registry = Registry::new();
   let event_bus = EventProcessor::new();
   let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER_SIZE);

   let scanner = Scanner::new(
      radio.clone(),
      registry.clone(),
      event_bus.clone(),
      config.permissions,
      notify_tx.clone(),
      config.scan_window(),
      config.scan_settle(),
   );

   let table = Arc::new(HandleTable::default());
   let profiles = BluerProfileLink::all(&adapter, config.proxy_resolve());

   let (reconciler, reconcile) = Reconciler::new(
      registry.clone(),
      RadioProbe::new(radio.clone()),
      table.clone(),
      profiles.clone(),
      config.reconcile_interval(),
      config.reconcile_boost(),
      config.reconcile_boost_window(),
      config.profile_confirm_ttl(),
   );

   let orchestrator = Orchestrator::spawn(OrchestratorDeps {
      radio: radio.clone(),
      serial: Arc::new(RfcommLink::new()),
      gatt: Arc::new(BluerGattLink::new(adapter)),
      profiles: profiles.clone(),
      table,
      registry: registry.clone(),
      scanner: scanner.clone(),
      events: event_bus.clone(),
      notify_tx: notify_tx.clone(),
      reconcile: reconcile.clone(),
      config: config.clone(),
   });

   let ingestor = Ingestor::spawn(
      IngestContext {
         registry: registry.clone(),
         scanner: scanner.clone(),
         orchestrator: orchestrator.clone(),
         radio,
         events: event_bus.clone(),
         reconcile_nudge: reconcile.nudge_sender(),
         permissions: config.permissions,
      },
      notify_tx.clone(),
      notify_rx,
   );
   // Attach the stack receiver at startup; clients may detach and
   // re-attach through the external interface.
   ingestor.register().await?;

   tokio::spawn(reconciler.run());

   let service = PrintLinkService::new(
      orchestrator,
      scanner,
      registry,
      ingestor,
      profiles,
      notify_tx,
   );

   let connection = connection::Builder::session()?
      .name("org.printlink")?
      .serve_at("/org/printlink/manager", service)?
      .build()
      .await?;

   info!("PrintLink D-Bus service started at org.printlink");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down PrintLink service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Address, LinkEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(Address, LinkEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<PrintLinkService>,
      (address, event): (Address, LinkEvent),
   ) -> Result<()> {
      let addr_str = address.to_string();
      match event {
         LinkEvent::Connecting => {
            iface.device_connecting(&addr_str).await?;
         },
         LinkEvent::DeviceConnected => {
            iface.device_connected(&addr_str).await?;
         },
         LinkEvent::DeviceDisconnected => {
            iface.device_disconnected(&addr_str).await?;
         },
         LinkEvent::ConnectTimeout { reason } => {
            iface.connect_timeout(&addr_str, &reason).await?;
         },
         LinkEvent::BondStateChanged(state) => {
            iface
               .bond_state_changed(&addr_str, &state.to_string())
               .await?;
         },
         LinkEvent::DiscoveryChanged(active) => {
            iface.scan_state_changed(active).await?;
         },
         LinkEvent::AdapterPowerChanged(power) => {
            iface
               .adapter_power_changed(&power.current.to_string(), &power.previous.to_string())
               .await?;
         },
         LinkEvent::DeviceError(message) => {
            iface.device_error(&addr_str, &message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PrintLinkService>("/org/printlink/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, address: Address, event: LinkEvent) {
      self.queue.push((address, event));
      self.notifier.notify_waiters();
   }
}
