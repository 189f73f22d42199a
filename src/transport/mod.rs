//! Transport layer for printer connectivity.
//!
//! This module provides the per-transport capability interfaces (serial
//! profile, attribute protocol, classic profile links) and the
//! orchestrator-owned table of live transport handles.

pub mod gatt;
pub mod profile;
pub mod rfcomm;

use std::collections::HashMap;

use bluer::Address;
use parking_lot::Mutex;
use strum::{Display, EnumIter, IntoEnumIterator};
use uuid::Uuid;

use crate::{
   error::{LinkError, Result},
   transport::{
      gatt::{GattPhase, GattSession},
      rfcomm::SerialSession,
   },
};

/// Classic profiles reached through a profile-link capability rather than
/// a direct socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum ProfileKind {
   AudioSink,
   HandsFree,
   Hid,
}

impl ProfileKind {
   pub const fn uuid(self) -> Uuid {
      match self {
         // Base-UUID service class identifiers
         Self::AudioSink => Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb),
         Self::HandsFree => Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb),
         Self::Hid => Uuid::from_u128(0x00001124_0000_1000_8000_00805f9b34fb),
      }
   }

   /// Parses a profile name from the external interface. Mesh and LE
   /// audio are deliberately unsupported and rejected here.
   pub fn parse(name: &str) -> Result<Self> {
      match name {
         "audio-sink" => Ok(Self::AudioSink),
         "hands-free" => Ok(Self::HandsFree),
         "hid" => Ok(Self::Hid),
         "le-audio" => Err(LinkError::FeatureNotSupported("LE audio")),
         "mesh" => Err(LinkError::FeatureNotSupported("BLE mesh")),
         _ => Err(LinkError::FeatureNotSupported("unknown profile")),
      }
   }

   pub fn all() -> impl Iterator<Item = Self> {
      Self::iter()
   }
}

/// Transports a connection attempt can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
   Serial,
   Gatt,
   #[strum(transparent)]
   Profile(ProfileKind),
}

/// A live attribute-protocol session together with its handshake phase.
pub struct GattHandle {
   pub session: Box<dyn GattSession>,
   pub phase: GattPhase,
}

/// Table of live transport handles, keyed by address.
///
/// Owned by the connection orchestrator, which is the only writer; the
/// reconciliation loop reads it to count sessions whose service handshake
/// has completed. A raw link with no discovered services is treated as
/// still-connecting, never connected.
#[derive(Default)]
pub struct HandleTable {
   serial: Mutex<HashMap<Address, Box<dyn SerialSession>>>,
   gatt: Mutex<HashMap<Address, GattHandle>>,
}

impl HandleTable {
   pub fn insert_serial(&self, address: Address, session: Box<dyn SerialSession>) {
      self.serial.lock().insert(address, session);
   }

   pub fn insert_gatt(&self, address: Address, session: Box<dyn GattSession>, phase: GattPhase) {
      self
         .gatt
         .lock()
         .insert(address, GattHandle { session, phase });
   }

   pub fn set_gatt_phase(&self, address: Address, phase: GattPhase) {
      if let Some(handle) = self.gatt.lock().get_mut(&address) {
         handle.phase = phase;
      }
   }

   pub fn gatt_phase(&self, address: Address) -> Option<GattPhase> {
      self.gatt.lock().get(&address).map(|h| h.phase)
   }

   /// Takes every handle held for `address` so the caller can close them
   /// outside the lock.
   pub fn take(&self, address: Address) -> (Option<Box<dyn SerialSession>>, Option<GattHandle>) {
      (
         self.serial.lock().remove(&address),
         self.gatt.lock().remove(&address),
      )
   }

   /// Addresses of every live handle, for disconnect-all iteration.
   pub fn addresses(&self) -> Vec<Address> {
      let mut out: Vec<Address> = self.serial.lock().keys().copied().collect();
      for addr in self.gatt.lock().keys() {
         if !out.contains(addr) {
            out.push(*addr);
         }
      }
      out
   }

   pub fn has_any(&self, address: Address) -> bool {
      self.serial.lock().contains_key(&address) || self.gatt.lock().contains_key(&address)
   }

   /// Addresses with an open serial socket.
   pub fn serial_addresses(&self) -> Vec<Address> {
      self.serial.lock().keys().copied().collect()
   }

   /// Addresses whose attribute-protocol handshake has discovered
   /// services. Sessions still in earlier phases are excluded.
   pub fn ready_gatt_addresses(&self) -> Vec<Address> {
      self
         .gatt
         .lock()
         .iter()
         .filter(|(_, h)| h.phase.services_known())
         .map(|(addr, _)| *addr)
         .collect()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn profile_parse_rejects_stubbed_transports() {
      assert!(matches!(
         ProfileKind::parse("le-audio"),
         Err(LinkError::FeatureNotSupported("LE audio"))
      ));
      assert!(matches!(
         ProfileKind::parse("mesh"),
         Err(LinkError::FeatureNotSupported("BLE mesh"))
      ));
      assert!(matches!(
         ProfileKind::parse("hid"),
         Ok(ProfileKind::Hid)
      ));
   }

   #[test]
   fn transport_display_names_the_connected_profile() {
      assert_eq!(TransportKind::Serial.to_string(), "serial");
      assert_eq!(TransportKind::Gatt.to_string(), "gatt");
      assert_eq!(
         TransportKind::Profile(ProfileKind::AudioSink).to_string(),
         "audio-sink"
      );
      assert_eq!(
         TransportKind::Profile(ProfileKind::HandsFree).to_string(),
         "hands-free"
      );
   }

   #[test]
   fn profile_uuids_are_base_uuid_aliases() {
      for kind in ProfileKind::all() {
         let uuid = kind.uuid().to_string();
         assert!(uuid.ends_with("0000-1000-8000-00805f9b34fb"), "{uuid}");
      }
   }
}
