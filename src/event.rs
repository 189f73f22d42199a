//! Event handling system for connectivity state updates.
//!
//! This module provides the event infrastructure for notifying the
//! external application layer about device state changes such as
//! connection progress, bond transitions, and scan state.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::registry::{AdapterPowerState, BondState};

/// Events published by the connectivity core.
#[derive(Debug, Clone)]
pub enum LinkEvent {
   /// A synthetic "connecting" record was published for the address.
   Connecting,
   DeviceConnected,
   DeviceDisconnected,
   /// A connection attempt hit its timeout and was torn down.
   ConnectTimeout { reason: SmolStr },
   BondStateChanged(BondState),
   DiscoveryChanged(bool),
   AdapterPowerChanged(AdapterPowerState),
   DeviceError(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, address: Address, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event sink that drops everything, for contexts without a dispatcher.
pub struct NullBus;

impl EventBus for NullBus {
   fn emit(&self, _address: Address, _event: LinkEvent) {}
}
