//! Connection orchestrator: the actor that owns every attempt.
//!
//! Connection state is serialized through one command inbox: attempts,
//! disconnects, and bond requests all land here, so the attempt table has
//! a single writer. An attempt cycles addresses through the transports the
//! device class admits (serial socket, attribute protocol, classic
//! profile links), publishes a synthetic "connecting" record up front, and
//! is fenced by a generation counter so late results from a superseded
//! attempt cannot clobber a newer one.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   config::Config,
   error::{LinkError, Result},
   event::{EventSender, LinkEvent},
   ingest::StackNotification,
   reconcile::ReconcileControl,
   registry::{BondState, DeviceKind, DeviceList, DeviceRecord, Registry},
   scanner::Scanner,
   stack::{Radio, ResolvedDevice},
   transport::{
      HandleTable, TransportKind,
      gatt::{GattLink, GattPhase, classify},
      profile::ProfileLink,
      rfcomm::SerialLink,
   },
};

const COMMAND_BUFFER: usize = 32;

/// Poll interval while waiting out a bonding handshake someone else
/// started.
const BOND_POLL: Duration = Duration::from_millis(500);

/// Upper bound on the jitter before a post-timeout rescan.
const RESCAN_JITTER_MS: u64 = 1000;

type ConnectReply = oneshot::Sender<Result<()>>;

pub(crate) enum Command {
   /// Starts an attempt. A `None` reply is fire-and-forget.
   Connect(Address, Option<ConnectReply>),
   Disconnect(Address, ConnectReply),
   DisconnectAll(oneshot::Sender<usize>),
   CreateBond(Address, oneshot::Sender<Result<bool>>),
   RemoveBond(Address, oneshot::Sender<Result<bool>>),
   // Loopback messages from attempt tasks, generation-fenced.
   TransportConnected(Address, u64, TransportKind),
   AttemptFailed(Address, u64, SmolStr),
   AttemptTimedOut(Address, u64),
}

/// Cloneable handle to the orchestrator actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
   inbox: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
   /// Connects and waits for the attempt to conclude.
   pub async fn connect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Connect(address, Some(tx)))
         .await
         .map_err(|_| LinkError::OrchestratorShutdown)?;
      rx.await.map_err(|_| LinkError::OrchestratorShutdown)?
   }

   /// Fire-and-forget connect, used from the ingestion path.
   pub fn request_connect(&self, address: Address) {
      if self
         .inbox
         .try_send(Command::Connect(address, None))
         .is_err()
      {
         warn!("Dropping connect request for {address}: inbox unavailable");
      }
   }

   pub async fn disconnect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Disconnect(address, tx))
         .await
         .map_err(|_| LinkError::OrchestratorShutdown)?;
      rx.await.map_err(|_| LinkError::OrchestratorShutdown)?
   }

   /// Disconnects everything; returns how many addresses were torn down.
   pub async fn disconnect_all(&self) -> Result<usize> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::DisconnectAll(tx))
         .await
         .map_err(|_| LinkError::OrchestratorShutdown)?;
      rx.await.map_err(|_| LinkError::OrchestratorShutdown)
   }

   pub async fn create_bond(&self, address: Address) -> Result<bool> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::CreateBond(address, tx))
         .await
         .map_err(|_| LinkError::OrchestratorShutdown)?;
      rx.await.map_err(|_| LinkError::OrchestratorShutdown)?
   }

   pub async fn remove_bond(&self, address: Address) -> Result<bool> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::RemoveBond(address, tx))
         .await
         .map_err(|_| LinkError::OrchestratorShutdown)?;
      rx.await.map_err(|_| LinkError::OrchestratorShutdown)?
   }

   /// Handle whose inbox is drained by the test instead of an actor.
   #[cfg(test)]
   pub(crate) fn for_tests() -> (Self, mpsc::Receiver<Command>) {
      let (inbox, rx) = mpsc::channel(COMMAND_BUFFER);
      (Self { inbox }, rx)
   }
}

/// Everything the actor needs, wired once at startup.
pub struct OrchestratorDeps {
   pub radio: Arc<dyn Radio>,
   pub serial: Arc<dyn SerialLink>,
   pub gatt: Arc<dyn GattLink>,
   pub profiles: Vec<Arc<dyn ProfileLink>>,
   pub table: Arc<HandleTable>,
   pub registry: Arc<Registry>,
   pub scanner: Arc<Scanner>,
   pub events: EventSender,
   pub notify_tx: mpsc::Sender<StackNotification>,
   pub reconcile: ReconcileControl,
   pub config: Config,
}

struct Attempt {
   generation: u64,
   driver: JoinHandle<()>,
   timeout: JoinHandle<()>,
   reply: Option<ConnectReply>,
}

impl Attempt {
   fn abort(&self) {
      self.driver.abort();
      self.timeout.abort();
   }
}

pub struct Orchestrator;

impl Orchestrator {
   pub fn spawn(deps: OrchestratorDeps) -> OrchestratorHandle {
      let (inbox, rx) = mpsc::channel(COMMAND_BUFFER);
      let actor = Actor {
         deps,
         loopback: inbox.clone(),
         attempts: HashMap::new(),
         next_generation: 0,
      };
      tokio::spawn(actor.run(rx));
      OrchestratorHandle { inbox }
   }
}

struct Actor {
   deps: OrchestratorDeps,
   loopback: mpsc::Sender<Command>,
   attempts: HashMap<Address, Attempt>,
   next_generation: u64,
}

impl Actor {
   async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
      while let Some(command) = rx.recv().await {
         match command {
            Command::Connect(address, reply) => self.handle_connect(address, reply).await,
            Command::Disconnect(address, reply) => {
               let result = self.handle_disconnect(address).await;
               let _ = reply.send(result);
            },
            Command::DisconnectAll(reply) => {
               let count = self.handle_disconnect_all().await;
               let _ = reply.send(count);
            },
            Command::CreateBond(address, reply) => {
               let _ = reply.send(self.handle_create_bond(address).await);
            },
            Command::RemoveBond(address, reply) => {
               let _ = reply.send(self.handle_remove_bond(address).await);
            },
            Command::TransportConnected(address, generation, kind) => {
               self.handle_transport_connected(address, generation, kind);
            },
            Command::AttemptFailed(address, generation, reason) => {
               self.handle_attempt_failed(address, generation, reason).await;
            },
            Command::AttemptTimedOut(address, generation) => {
               self.handle_attempt_timed_out(address, generation).await;
            },
         }
      }
      info!("Orchestrator inbox closed, shutting down");
   }

   async fn handle_connect(&mut self, address: Address, reply: Option<ConnectReply>) {
      let respond = |reply: Option<ConnectReply>, result: Result<()>| {
         if let Some(tx) = reply {
            let _ = tx.send(result);
         }
      };

      if !self.deps.config.permissions.connect {
         warn!("Connect to {address} denied: no connect permission");
         respond(reply, Err(LinkError::PermissionDenied("connect")));
         return;
      }
      if self.attempts.contains_key(&address) {
         debug!("Connect to {address} rejected: attempt already in flight");
         respond(reply, Err(LinkError::AlreadyConnecting));
         return;
      }

      // Discovery competes with paging on the same radio.
      self.deps.scanner.stop_unified();

      let resolved = match self.deps.radio.resolve(address).await {
         Ok(resolved) => resolved,
         Err(e) => {
            warn!("Connect to {address} aborted: {e}");
            respond(reply, Err(e));
            return;
         },
      };

      // Observers see the attempt before any transport work starts.
      let mut record = DeviceRecord::new(address, "connecting").with_kind(resolved.kind);
      if let Some(name) = &resolved.name {
         record = record.with_name(name.clone());
      } else if let Some(name) = self.deps.config.known_printer(&address.to_string()) {
         record = record.with_name(SmolStr::new(name));
      }
      record = record.with_bond(resolved.bond);
      self.deps.registry.upsert(DeviceList::Connecting, record);
      self.deps.events.emit(address, LinkEvent::Connecting);
      self.deps.reconcile.note_attempt_started();

      self.next_generation += 1;
      let generation = self.next_generation;
      info!(
         "Connecting to {address} ({:?}, bond {:?}, attempt {generation})",
         resolved.kind, resolved.bond
      );

      let driver = tokio::spawn(
         Driver {
            radio: self.deps.radio.clone(),
            serial: self.deps.serial.clone(),
            gatt: self.deps.gatt.clone(),
            profiles: self.deps.profiles.clone(),
            table: self.deps.table.clone(),
            notify_tx: self.deps.notify_tx.clone(),
            loopback: self.loopback.clone(),
            bond_wait: self.deps.config.bond_wait(),
         }
         .run(resolved, generation),
      );

      let timeout = self.deps.config.connect_timeout();
      let loopback = self.loopback.clone();
      let timer = tokio::spawn(async move {
         time::sleep(timeout).await;
         let _ = loopback
            .send(Command::AttemptTimedOut(address, generation))
            .await;
      });

      self.attempts.insert(
         address,
         Attempt {
            generation,
            driver,
            timeout: timer,
            reply,
         },
      );
   }

   /// Removes the attempt for `address` if it matches `generation`.
   /// Loopback messages from a superseded attempt are dropped here.
   fn take_attempt(&mut self, address: Address, generation: u64) -> Option<Attempt> {
      match self.attempts.get(&address) {
         Some(attempt) if attempt.generation == generation => self.attempts.remove(&address),
         Some(_) => {
            debug!("Ignoring stale attempt message for {address}");
            None
         }
         None => None,
      }
   }

   fn handle_transport_connected(&mut self, address: Address, generation: u64, kind: TransportKind) {
      let Some(attempt) = self.take_attempt(address, generation) else {
         return;
      };
      attempt.timeout.abort();

      info!("Connected to {address} via {kind}");
      let mut record = self
         .deps
         .registry
         .remove(DeviceList::Connecting, address)
         .unwrap_or_else(|| DeviceRecord::new(address, "connected"));
      record.action = "connected".into();
      record.confirmed_at = Some(Instant::now());
      record.extra.insert("transport".into(), kind.to_string().into());
      self.deps.registry.upsert(DeviceList::Connected, record);

      self.deps.events.emit(address, LinkEvent::DeviceConnected);
      self.deps.reconcile.nudge();
      if let Some(reply) = attempt.reply {
         let _ = reply.send(Ok(()));
      }
   }

   async fn handle_attempt_failed(&mut self, address: Address, generation: u64, reason: SmolStr) {
      let Some(attempt) = self.take_attempt(address, generation) else {
         return;
      };
      attempt.timeout.abort();

      warn!("All transports failed for {address}: {reason}");
      self.close_links(address).await;
      self.deps.registry.remove(DeviceList::Connecting, address);
      self
         .deps
         .events
         .emit(address, LinkEvent::DeviceError(reason));
      if let Some(reply) = attempt.reply {
         let _ = reply.send(Err(LinkError::ConnectionLost));
      }
   }

   async fn handle_attempt_timed_out(&mut self, address: Address, generation: u64) {
      let Some(attempt) = self.take_attempt(address, generation) else {
         return;
      };
      attempt.driver.abort();

      warn!("Connect attempt for {address} timed out");
      self.close_links(address).await;
      self.deps.registry.remove(DeviceList::Connecting, address);
      self.deps.registry.remove(DeviceList::Connected, address);

      // The timeout is published as an event, never surfaced as a list
      // entry a consumer could mistake for a device.
      self.deps.events.emit(
         address,
         LinkEvent::ConnectTimeout {
            reason: "connect timeout".into(),
         },
      );
      if let Some(reply) = attempt.reply {
         let _ = reply.send(Err(LinkError::RequestTimeout));
      }

      if self.deps.config.rescan_after_timeout && self.attempts.is_empty() {
         let jitter = rand::thread_rng().gen_range(0..=RESCAN_JITTER_MS);
         let scanner = self.deps.scanner.clone();
         tokio::spawn(async move {
            time::sleep(Duration::from_millis(jitter)).await;
            if let Err(e) = scanner.restart().await {
               warn!("Post-timeout rescan failed: {e}");
            }
         });
      }
   }

   async fn handle_disconnect(&mut self, address: Address) -> Result<()> {
      if let Some(attempt) = self.attempts.remove(&address) {
         attempt.abort();
         if let Some(reply) = attempt.reply {
            let _ = reply.send(Err(LinkError::ConnectionLost));
         }
      }

      self.close_links(address).await;
      for link in &self.deps.profiles {
         if let Err(e) = link.disconnect(address).await {
            debug!("Profile {} disconnect for {address}: {e}", link.kind());
         }
      }

      // Removal is unconditional: a disconnect must never leave a stale
      // entry behind, whatever state the attempt was in.
      self.deps.registry.remove(DeviceList::Connecting, address);
      self.deps.registry.remove(DeviceList::Connected, address);
      self.deps.events.emit(address, LinkEvent::DeviceDisconnected);
      self.deps.reconcile.nudge();
      Ok(())
   }

   async fn handle_disconnect_all(&mut self) -> usize {
      let mut addresses = self.deps.table.addresses();
      for address in self.attempts.keys() {
         if !addresses.contains(address) {
            addresses.push(*address);
         }
      }
      for record in self.deps.registry.snapshot(DeviceList::Connected).iter() {
         if !addresses.contains(&record.address) {
            addresses.push(record.address);
         }
      }

      info!("Disconnecting all ({} addresses)", addresses.len());
      for address in &addresses {
         let _ = self.handle_disconnect(*address).await;
      }
      addresses.len()
   }

   async fn handle_create_bond(&self, address: Address) -> Result<bool> {
      match self.deps.radio.pair(address).await {
         Ok(()) => Ok(true),
         Err(e) => {
            warn!("Bonding with {address} failed: {e}");
            Ok(false)
         },
      }
   }

   async fn handle_remove_bond(&self, address: Address) -> Result<bool> {
      match self.deps.radio.unpair(address).await {
         Ok(()) => {
            self.deps.registry.remove(DeviceList::Bonded, address);
            Ok(true)
         },
         Err(e) => {
            warn!("Removing bond for {address} failed: {e}");
            Ok(false)
         },
      }
   }

   async fn close_links(&self, address: Address) {
      let (serial, gatt) = self.deps.table.take(address);
      if let Some(mut session) = serial {
         session.close().await;
      }
      if let Some(mut handle) = gatt {
         handle.session.close().await;
      }
   }
}

/// One connection attempt: walks the transports the device class admits
/// and reports the outcome through the loopback inbox.
struct Driver {
   radio: Arc<dyn Radio>,
   serial: Arc<dyn SerialLink>,
   gatt: Arc<dyn GattLink>,
   profiles: Vec<Arc<dyn ProfileLink>>,
   table: Arc<HandleTable>,
   notify_tx: mpsc::Sender<StackNotification>,
   loopback: mpsc::Sender<Command>,
   bond_wait: Duration,
}

impl Driver {
   async fn run(self, resolved: ResolvedDevice, generation: u64) {
      let address = resolved.address;
      let (try_serial, try_gatt) = match resolved.kind {
         DeviceKind::Classic => (true, false),
         DeviceKind::LowEnergy => (false, true),
         DeviceKind::Dual | DeviceKind::Unknown => (true, true),
      };

      let mut last_error = None;

      if try_serial {
         match self.connect_serial(address).await {
            Ok(()) => {
               self.report(address, generation, TransportKind::Serial).await;
               return;
            },
            Err(e) => {
               debug!("Serial transport failed for {address}: {e}");
               last_error = Some(e);
            },
         }
      }

      if try_gatt {
         match self.connect_gatt(address).await {
            Ok(()) => {
               self.report(address, generation, TransportKind::Gatt).await;
               return;
            },
            Err(e) => {
               debug!("Attribute transport failed for {address}: {e}");
               last_error = Some(e);
            },
         }
      }

      if try_serial {
         for link in &self.profiles {
            match link.connect(address).await {
               Ok(()) => {
                  let _ = self
                     .notify_tx
                     .send(StackNotification::ProfileStateChanged {
                        address,
                        profile: link.kind(),
                        connected: true,
                     })
                     .await;
                  self
                     .report(address, generation, TransportKind::Profile(link.kind()))
                     .await;
                  return;
               },
               Err(e) => {
                  debug!("Profile {} failed for {address}: {e}", link.kind());
                  last_error = Some(e);
               },
            }
         }
      }

      let reason = last_error
         .map(|e| SmolStr::new(e.to_string()))
         .unwrap_or_else(|| SmolStr::new_static("no viable transport"));
      let _ = self
         .loopback
         .send(Command::AttemptFailed(address, generation, reason))
         .await;
   }

   async fn report(&self, address: Address, generation: u64, kind: TransportKind) {
      let _ = self
         .loopback
         .send(Command::TransportConnected(address, generation, kind))
         .await;
   }

   async fn connect_serial(&self, address: Address) -> Result<()> {
      let session = self.serial.open(address).await?;
      self.table.insert_serial(address, session);
      if let Err(e) = self.ensure_bonded(address).await {
         let (serial, _) = self.table.take(address);
         if let Some(mut session) = serial {
            session.close().await;
         }
         return Err(e);
      }
      Ok(())
   }

   async fn connect_gatt(&self, address: Address) -> Result<()> {
      let mut session = self.gatt.connect(address).await?;
      match session.discover_services().await {
         Ok(services) => {
            debug!("Discovered {services} services on {address}");
            self
               .table
               .insert_gatt(address, session, GattPhase::ServicesDiscovered);
         },
         Err(e) => {
            if let LinkError::Bluetooth(ref cause) = e {
               debug!(
                  "Service discovery on {address} failed with class {:?}",
                  classify(&cause.kind)
               );
            }
            session.close().await;
            return Err(e);
         },
      }

      if let Err(e) = self.ensure_bonded(address).await {
         let (_, gatt) = self.table.take(address);
         if let Some(mut handle) = gatt {
            handle.session.close().await;
         }
         return Err(e);
      }
      self.table.set_gatt_phase(address, GattPhase::Ready);
      Ok(())
   }

   /// Folds bonding into the attempt: request a bond when there is none,
   /// wait out a handshake someone else started.
   async fn ensure_bonded(&self, address: Address) -> Result<()> {
      match self.radio.bond_state(address).await? {
         BondState::Bonded => Ok(()),
         BondState::None => {
            info!("Requesting bond with {address}");
            self.radio.pair(address).await
         },
         BondState::Bonding => {
            let deadline = Instant::now() + self.bond_wait;
            loop {
               time::sleep(BOND_POLL).await;
               match self.radio.bond_state(address).await? {
                  BondState::Bonded => return Ok(()),
                  BondState::None => return Err(LinkError::BondFailed(address)),
                  BondState::Bonding => {
                     if Instant::now() >= deadline {
                        return Err(LinkError::BondFailed(address));
                     }
                  },
               }
            }
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use async_trait::async_trait;
   use parking_lot::Mutex;

   use super::*;
   use crate::{
      event::EventBus,
      ingest::NOTIFY_BUFFER_SIZE,
      reconcile::{ConnectivityProbe, Reconciler},
      stack::testing::FakeRadio,
      transport::{
         ProfileKind,
         gatt::GattSession,
         rfcomm::SerialSession,
      },
   };

   fn addr(last: u8) -> Address {
      Address::new([0x11, 0x22, 0x33, 0x44, 0x00, last])
   }

   fn device(address: Address, kind: DeviceKind, bond: BondState) -> ResolvedDevice {
      ResolvedDevice {
         address,
         name: Some("QL-820".into()),
         kind,
         bond,
      }
   }

   #[derive(Default)]
   struct TestBus {
      events: Mutex<Vec<(Address, LinkEvent)>>,
   }

   impl TestBus {
      fn has(&self, address: Address, predicate: impl Fn(&LinkEvent) -> bool) -> bool {
         self
            .events
            .lock()
            .iter()
            .any(|(a, e)| *a == address && predicate(e))
      }
   }

   impl EventBus for TestBus {
      fn emit(&self, address: Address, event: LinkEvent) {
         self.events.lock().push((address, event));
      }
   }

   #[derive(Clone, Copy)]
   enum Behavior {
      Succeed,
      Fail,
      Hang,
   }

   struct FakeSerial {
      behavior: Mutex<Behavior>,
      closed: Arc<AtomicUsize>,
   }

   impl FakeSerial {
      fn new(behavior: Behavior) -> Arc<Self> {
         Arc::new(Self {
            behavior: Mutex::new(behavior),
            closed: Arc::new(AtomicUsize::new(0)),
         })
      }
   }

   struct FakeSerialSession {
      closed: Arc<AtomicUsize>,
   }

   #[async_trait]
   impl SerialSession for FakeSerialSession {
      async fn close(&mut self) {
         self.closed.fetch_add(1, Ordering::SeqCst);
      }
   }

   #[async_trait]
   impl SerialLink for FakeSerial {
      async fn open(&self, _address: Address) -> Result<Box<dyn SerialSession>> {
         let behavior = *self.behavior.lock();
         match behavior {
            Behavior::Succeed => Ok(Box::new(FakeSerialSession {
               closed: self.closed.clone(),
            })),
            Behavior::Fail => Err(LinkError::ConnectionLost),
            Behavior::Hang => std::future::pending().await,
         }
      }
   }

   struct FakeGatt {
      behavior: Mutex<Behavior>,
   }

   struct FakeGattSession;

   #[async_trait]
   impl GattSession for FakeGattSession {
      async fn discover_services(&mut self) -> Result<usize> {
         Ok(3)
      }

      async fn close(&mut self) {}
   }

   #[async_trait]
   impl GattLink for FakeGatt {
      async fn connect(&self, _address: Address) -> Result<Box<dyn GattSession>> {
         let behavior = *self.behavior.lock();
         match behavior {
            Behavior::Succeed => Ok(Box::new(FakeGattSession)),
            Behavior::Fail => Err(LinkError::ConnectionLost),
            Behavior::Hang => std::future::pending().await,
         }
      }
   }

   struct AcceptingProfile {
      kind: ProfileKind,
      connected: Mutex<Vec<Address>>,
   }

   #[async_trait]
   impl ProfileLink for AcceptingProfile {
      fn kind(&self) -> ProfileKind {
         self.kind
      }

      async fn connect(&self, address: Address) -> Result<()> {
         self.connected.lock().push(address);
         Ok(())
      }

      async fn disconnect(&self, address: Address) -> Result<()> {
         self.connected.lock().retain(|a| *a != address);
         Ok(())
      }

      async fn connected_devices(&self) -> Result<Vec<Address>> {
         Ok(self.connected.lock().clone())
      }
   }

   struct IdleProbe;

   #[async_trait]
   impl ConnectivityProbe for IdleProbe {
      async fn gatt_session_addresses(&self) -> Vec<Address> {
         Vec::new()
      }

      async fn bonded_addresses(&self) -> Vec<Address> {
         Vec::new()
      }

      async fn is_connected(&self, _address: Address) -> bool {
         false
      }
   }

   struct Harness {
      handle: OrchestratorHandle,
      radio: Arc<FakeRadio>,
      serial: Arc<FakeSerial>,
      registry: Arc<Registry>,
      table: Arc<HandleTable>,
      bus: Arc<TestBus>,
      notify_rx: mpsc::Receiver<StackNotification>,
      _reconciler: Reconciler,
   }

   fn harness(
      config: Config,
      serial_behavior: Behavior,
      gatt_behavior: Behavior,
      profiles: Vec<Arc<dyn ProfileLink>>,
   ) -> Harness {
      let radio = Arc::new(FakeRadio::default());
      let serial = FakeSerial::new(serial_behavior);
      let gatt = Arc::new(FakeGatt {
         behavior: Mutex::new(gatt_behavior),
      });
      let registry = Registry::new();
      let table = Arc::new(HandleTable::default());
      let bus = Arc::new(TestBus::default());

      let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER_SIZE);
      let scanner = Scanner::new(
         radio.clone(),
         registry.clone(),
         bus.clone(),
         config.permissions,
         notify_tx.clone(),
         config.scan_window(),
         config.scan_settle(),
      );
      let (reconciler, reconcile) = Reconciler::new(
         registry.clone(),
         Arc::new(IdleProbe),
         table.clone(),
         profiles.clone(),
         config.reconcile_interval(),
         config.reconcile_boost(),
         config.reconcile_boost_window(),
         config.profile_confirm_ttl(),
      );

      let handle = Orchestrator::spawn(OrchestratorDeps {
         radio: radio.clone(),
         serial: serial.clone(),
         gatt,
         profiles,
         table: table.clone(),
         registry: registry.clone(),
         scanner,
         events: bus.clone(),
         notify_tx,
         reconcile,
         config,
      });

      Harness {
         handle,
         radio,
         serial,
         registry,
         table,
         bus,
         notify_rx,
         _reconciler: reconciler,
      }
   }

   #[tokio::test(start_paused = true)]
   async fn connect_publishes_connecting_then_connected() {
      let h = harness(Config::default(), Behavior::Succeed, Behavior::Fail, vec![]);
      let a = addr(1);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      h.handle.connect(a).await.unwrap();

      assert!(h.bus.has(a, |e| matches!(e, LinkEvent::Connecting)));
      assert!(h.bus.has(a, |e| matches!(e, LinkEvent::DeviceConnected)));
      assert!(!h.registry.contains(DeviceList::Connecting, a));
      let record = h.registry.get(DeviceList::Connected, a).unwrap();
      assert_eq!(record.action, "connected");
      assert_eq!(record.extra.get("transport").unwrap(), "serial");
      assert_eq!(h.table.serial_addresses(), vec![a]);
   }

   #[tokio::test(start_paused = true)]
   async fn timeout_tears_down_attempt() {
      let h = harness(Config::default(), Behavior::Hang, Behavior::Fail, vec![]);
      let a = addr(2);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      h.handle.request_connect(a);
      time::sleep(Duration::from_millis(50)).await;
      assert!(h.registry.contains(DeviceList::Connecting, a));

      time::sleep(Duration::from_secs(26)).await;
      assert!(!h.registry.contains(DeviceList::Connecting, a));
      assert!(!h.registry.contains(DeviceList::Connected, a));
      assert!(!h.table.has_any(a));
      assert!(h.bus.has(a, |e| matches!(e, LinkEvent::ConnectTimeout { .. })));
   }

   #[tokio::test(start_paused = true)]
   async fn concurrent_connect_for_same_address_is_rejected() {
      let h = harness(Config::default(), Behavior::Hang, Behavior::Fail, vec![]);
      let a = addr(3);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      h.handle.request_connect(a);
      time::sleep(Duration::from_millis(50)).await;

      let second = h.handle.connect(a).await;
      assert!(matches!(second, Err(LinkError::AlreadyConnecting)));
   }

   #[tokio::test(start_paused = true)]
   async fn disconnect_closes_every_handle_and_clears_lists() {
      let h = harness(Config::default(), Behavior::Succeed, Behavior::Fail, vec![]);
      let a = addr(4);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      h.handle.connect(a).await.unwrap();
      h.handle.disconnect(a).await.unwrap();

      assert!(!h.registry.contains(DeviceList::Connecting, a));
      assert!(!h.registry.contains(DeviceList::Connected, a));
      assert!(!h.table.has_any(a));
      assert_eq!(h.serial.closed.load(Ordering::SeqCst), 1);
      assert!(h.bus.has(a, |e| matches!(e, LinkEvent::DeviceDisconnected)));
   }

   #[tokio::test(start_paused = true)]
   async fn unbonded_device_is_bonded_during_attempt() {
      let h = harness(Config::default(), Behavior::Succeed, Behavior::Fail, vec![]);
      let a = addr(5);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::None));

      h.handle.connect(a).await.unwrap();
      assert_eq!(h.radio.bond_state(a).await.unwrap(), BondState::Bonded);
   }

   #[tokio::test(start_paused = true)]
   async fn low_energy_device_reaches_ready_phase() {
      let h = harness(Config::default(), Behavior::Fail, Behavior::Succeed, vec![]);
      let a = addr(6);
      h.radio
         .insert_device(device(a, DeviceKind::LowEnergy, BondState::Bonded));

      h.handle.connect(a).await.unwrap();
      assert_eq!(h.table.gatt_phase(a), Some(GattPhase::Ready));
      assert_eq!(h.table.ready_gatt_addresses(), vec![a]);
   }

   #[tokio::test(start_paused = true)]
   async fn profile_link_is_tried_when_serial_fails() {
      let profile = Arc::new(AcceptingProfile {
         kind: ProfileKind::AudioSink,
         connected: Mutex::new(vec![]),
      });
      let profiles: Vec<Arc<dyn ProfileLink>> = vec![profile.clone()];
      let mut h = harness(Config::default(), Behavior::Fail, Behavior::Fail, profiles);
      let a = addr(7);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      h.handle.connect(a).await.unwrap();

      assert_eq!(profile.connected.lock().as_slice(), &[a]);
      let record = h.registry.get(DeviceList::Connected, a).unwrap();
      assert_eq!(record.extra.get("transport").unwrap(), "audio-sink");
      // The outcome flows through the canonical notification queue too.
      let notification = h.notify_rx.try_recv().unwrap();
      assert!(matches!(
         notification,
         StackNotification::ProfileStateChanged {
            address,
            profile: ProfileKind::AudioSink,
            connected: true,
         } if address == a
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn all_transports_failing_clears_connecting_entry() {
      let h = harness(Config::default(), Behavior::Fail, Behavior::Fail, vec![]);
      let a = addr(8);
      h.radio
         .insert_device(device(a, DeviceKind::Dual, BondState::Bonded));

      let result = h.handle.connect(a).await;
      assert!(matches!(result, Err(LinkError::ConnectionLost)));
      assert!(!h.registry.contains(DeviceList::Connecting, a));
      assert!(h.bus.has(a, |e| matches!(e, LinkEvent::DeviceError(_))));
   }

   #[tokio::test(start_paused = true)]
   async fn timeout_restarts_discovery_when_configured() {
      let h = harness(Config::default(), Behavior::Hang, Behavior::Fail, vec![]);
      let a = addr(9);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      h.handle.request_connect(a);
      time::sleep(Duration::from_secs(27)).await;

      assert!(h.radio.discoveries_started.load(Ordering::SeqCst) >= 1);
   }

   #[tokio::test(start_paused = true)]
   async fn connect_without_permission_is_denied() {
      let mut config = Config::default();
      config.permissions.connect = false;
      let h = harness(config, Behavior::Succeed, Behavior::Fail, vec![]);
      let a = addr(10);
      h.radio
         .insert_device(device(a, DeviceKind::Classic, BondState::Bonded));

      let result = h.handle.connect(a).await;
      assert!(matches!(result, Err(LinkError::PermissionDenied("connect"))));
      assert!(!h.registry.contains(DeviceList::Connecting, a));
   }
}
