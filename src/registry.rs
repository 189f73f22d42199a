//! Authoritative device state store.
//!
//! This module provides the `Registry`, the single concurrently-readable
//! snapshot store for every device list the core maintains, plus the
//! `DeviceRecord` data model shared by ingestion, the orchestrator, and
//! the reconciliation loop. All mutation is copy-on-write: a whole list is
//! replaced behind an `Arc`, so readers never block writers.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use serde_json::json;
use smallvec::SmallVec;
use smol_str::SmolStr;
use strum::{Display, EnumIter};
use tokio::time::Instant;
use uuid::Uuid;

/// Name sentinel used when the permission subsystem denies access to
/// identity fields during event extraction.
pub const NO_PERM: &str = "<no-perm>";

/// Advertisement payload bytes. Most manufacturer/service payloads fit
/// inline.
pub type AdvBytes = SmallVec<[u8; 24]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceKind {
   Classic,
   LowEnergy,
   Dual,
   #[default]
   Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BondState {
   None,
   Bonding,
   Bonded,
}

/// Adapter radio power state, with turning-on/off edges preserved so
/// ingestion can distinguish a hard power-down from a transient blip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PowerState {
   Off,
   TurningOn,
   On,
   TurningOff,
   #[default]
   Unknown,
}

impl PowerState {
   /// Both edges count as "going dark" for scan shutdown purposes.
   pub const fn is_down(self) -> bool {
      matches!(self, Self::Off | Self::TurningOff)
   }
}

/// Current and previous adapter power state. Single writer (ingestion),
/// many readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterPowerState {
   pub current: PowerState,
   pub previous: PowerState,
}

/// One entry per physical address.
///
/// `address` is the identity key; everything else is enrichment that may
/// arrive later and is merged field-by-field (explicitly provided values
/// win, absent values never regress what is already known).
#[derive(Debug, Clone, Default)]
pub struct DeviceRecord {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub kind: DeviceKind,
   /// `None` means "not stated by this writer", not "bond removed".
   pub bond: Option<BondState>,
   /// Provenance tag naming the event/operation that produced this record.
   pub action: SmolStr,
   pub rssi: Option<i16>,
   pub tx_power: Option<i16>,
   pub manufacturer_data: HashMap<u16, AdvBytes>,
   pub service_data: HashMap<Uuid, AdvBytes>,
   pub uuids: Vec<Uuid>,
   /// Open key/value bag for protocol-specific detail.
   pub extra: HashMap<SmolStr, SmolStr>,
   /// Last time a profile query reconfirmed this device as connected.
   pub confirmed_at: Option<Instant>,
}

impl DeviceRecord {
   pub fn new(address: Address, action: &str) -> Self {
      Self {
         address,
         action: SmolStr::new(action),
         ..Default::default()
      }
   }

   pub fn with_name(mut self, name: impl Into<SmolStr>) -> Self {
      self.name = Some(name.into());
      self
   }

   pub fn with_kind(mut self, kind: DeviceKind) -> Self {
      self.kind = kind;
      self
   }

   pub fn with_bond(mut self, bond: BondState) -> Self {
      self.bond = Some(bond);
      self
   }

   pub fn with_extra(mut self, key: &str, value: impl Into<SmolStr>) -> Self {
      self.extra.insert(SmolStr::new(key), value.into());
      self
   }

   /// Folds `newer` into `self`. Explicitly provided fields of `newer`
   /// replace ours; unprovided fields keep the existing value.
   fn absorb(&mut self, newer: Self) {
      debug_assert_eq!(self.address, newer.address);
      self.action = newer.action;
      if let Some(name) = newer.name {
         self.name = Some(name);
      }
      if newer.kind != DeviceKind::Unknown {
         self.kind = newer.kind;
      }
      if let Some(bond) = newer.bond {
         self.bond = Some(bond);
      }
      if let Some(rssi) = newer.rssi {
         self.rssi = Some(rssi);
      }
      if let Some(tx_power) = newer.tx_power {
         self.tx_power = Some(tx_power);
      }
      if !newer.manufacturer_data.is_empty() {
         self.manufacturer_data = newer.manufacturer_data;
      }
      if !newer.service_data.is_empty() {
         self.service_data = newer.service_data;
      }
      if !newer.uuids.is_empty() {
         self.uuids = newer.uuids;
      }
      for (k, v) in newer.extra {
         self.extra.insert(k, v);
      }
      if let Some(ts) = newer.confirmed_at {
         self.confirmed_at = Some(ts);
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
         "address": self.address.to_string(),
         "kind": self.kind.to_string(),
         "action": self.action.as_str(),
      });
      if let Some(name) = &self.name {
         info["name"] = json!(name.as_str());
      }
      if let Some(bond) = self.bond {
         info["bond"] = json!(bond.to_string());
      }
      if let Some(rssi) = self.rssi {
         info["rssi"] = json!(rssi);
      }
      if let Some(tx) = self.tx_power {
         info["tx_power"] = json!(tx);
      }
      if !self.uuids.is_empty() {
         info["uuids"] = json!(
            self
               .uuids
               .iter()
               .map(ToString::to_string)
               .collect::<Vec<_>>()
         );
      }
      if !self.extra.is_empty() {
         let extra: HashMap<&str, &str> = self
            .extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
         info["extra"] = json!(extra);
      }
      info
   }
}

/// The five independently addressable device lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceList {
   Bonded,
   ClassicDiscovered,
   LeDiscovered,
   Connecting,
   Connected,
}

type ListSlot = RwLock<Arc<Vec<DeviceRecord>>>;

/// Copy-on-write registry of the five device lists plus adapter power.
///
/// Write operations clone the target list, apply the change, and swap the
/// `Arc` in. Readers take a snapshot `Arc` and are never invalidated.
#[derive(Default)]
pub struct Registry {
   bonded: ListSlot,
   classic_discovered: ListSlot,
   le_discovered: ListSlot,
   connecting: ListSlot,
   connected: ListSlot,
   power: AtomicCell<AdapterPowerState>,
}

impl Registry {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   const fn slot(&self, list: DeviceList) -> &ListSlot {
      match list {
         DeviceList::Bonded => &self.bonded,
         DeviceList::ClassicDiscovered => &self.classic_discovered,
         DeviceList::LeDiscovered => &self.le_discovered,
         DeviceList::Connecting => &self.connecting,
         DeviceList::Connected => &self.connected,
      }
   }

   /// Inserts or replaces the record with the same address. Replacement
   /// merges field-by-field, so enrichment writers cannot regress fields
   /// they did not provide.
   pub fn upsert(&self, list: DeviceList, record: DeviceRecord) {
      let slot = self.slot(list);
      let mut guard = slot.write();
      let mut next: Vec<DeviceRecord> = guard.as_ref().clone();
      match next.iter_mut().find(|r| r.address == record.address) {
         Some(existing) => existing.absorb(record),
         None => next.push(record),
      }
      *guard = Arc::new(next);
   }

   /// Removes the record for `address`, returning it if present.
   pub fn remove(&self, list: DeviceList, address: Address) -> Option<DeviceRecord> {
      let slot = self.slot(list);
      let mut guard = slot.write();
      let pos = guard.iter().position(|r| r.address == address)?;
      let mut next: Vec<DeviceRecord> = guard.as_ref().clone();
      let removed = next.remove(pos);
      *guard = Arc::new(next);
      Some(removed)
   }

   /// Replaces the whole list in one swap. Used by reconciliation to
   /// converge from first principles.
   pub fn replace(&self, list: DeviceList, records: Vec<DeviceRecord>) {
      *self.slot(list).write() = Arc::new(records);
   }

   pub fn clear(&self, list: DeviceList) {
      self.replace(list, Vec::new());
   }

   /// Read-only ordered snapshot of a list.
   pub fn snapshot(&self, list: DeviceList) -> Arc<Vec<DeviceRecord>> {
      self.slot(list).read().clone()
   }

   pub fn contains(&self, list: DeviceList, address: Address) -> bool {
      self.snapshot(list).iter().any(|r| r.address == address)
   }

   pub fn get(&self, list: DeviceList, address: Address) -> Option<DeviceRecord> {
      self
         .snapshot(list)
         .iter()
         .find(|r| r.address == address)
         .cloned()
   }

   pub fn power(&self) -> AdapterPowerState {
      self.power.load()
   }

   /// Records a power transition, shifting the old current into previous.
   pub fn set_power(&self, current: PowerState) -> AdapterPowerState {
      let previous = self.power.load().current;
      let state = AdapterPowerState { current, previous };
      self.power.store(state);
      state
   }
}
