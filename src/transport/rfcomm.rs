//! Serial-profile (RFCOMM) transport.
//!
//! The serial profile is the primary path for classic receipt printers:
//! command bytes stream over a virtual serial port once the socket is up.
//! Connection establishment is bounded by an explicit timeout; the socket
//! handle lives in the orchestrator's handle table until disconnect.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{
   Address,
   rfcomm::{Socket, SocketAddr, Stream},
};
use log::{debug, warn};
use tokio::{io::AsyncWriteExt, time};

use crate::error::{LinkError, Result};

/// Default RFCOMM channel for serial-port-profile printers.
const SERIAL_CHANNEL: u8 = 1;
/// Timeout for socket connection attempts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live serial socket. Closing is best-effort; dropping the session
/// releases the socket regardless.
#[async_trait]
pub trait SerialSession: Send + Sync {
   async fn close(&mut self);
}

/// Capability to open serial-profile sockets.
#[async_trait]
pub trait SerialLink: Send + Sync {
   async fn open(&self, address: Address) -> Result<Box<dyn SerialSession>>;
}

/// RFCOMM implementation of [`SerialLink`] on the BlueZ socket layer.
pub struct RfcommLink {
   channel: u8,
}

impl RfcommLink {
   pub const fn new() -> Self {
      Self {
         channel: SERIAL_CHANNEL,
      }
   }
}

impl Default for RfcommLink {
   fn default() -> Self {
      Self::new()
   }
}

#[async_trait]
impl SerialLink for RfcommLink {
   async fn open(&self, address: Address) -> Result<Box<dyn SerialSession>> {
      debug!("Creating RFCOMM socket for {address}");

      let socket = Socket::new()?;
      let addr = SocketAddr::new(address, self.channel);
      debug!("Connecting to {address} channel {}", self.channel);

      let stream = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
         .await
         .map_err(|_| LinkError::RequestTimeout)??;

      Ok(Box::new(RfcommSession {
         address,
         stream: Some(stream),
      }))
   }
}

struct RfcommSession {
   address: Address,
   stream: Option<Stream>,
}

#[async_trait]
impl SerialSession for RfcommSession {
   async fn close(&mut self) {
      if let Some(mut stream) = self.stream.take() {
         if let Err(e) = stream.shutdown().await {
            warn!("Serial shutdown for {} failed: {e}", self.address);
         }
      }
   }
}
