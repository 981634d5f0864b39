//! Transport stack abstraction.
//!
//! The bridge never talks to a radio directly. Everything it needs from the
//! Bluetooth stack goes through [`TransportStack`] and the socket handles it
//! opens, so the session machinery can run against BlueZ or a scripted stack.

use std::{fmt, future::Future};

use bluer::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Largest receive buffer a socket allocates; the maximum L2CAP MTU.
pub const MAX_RECEIVE_SIZE: usize = 65535;

/// Bluetooth base UUID, `00000000-0000-1000-8000-00805f9b34fb`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const BASE_MASK: u128 = (1 << 96) - 1;

/// Socket families supported by the bridge.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum TransportKind {
   /// Stream-oriented, channel-addressed.
   #[serde(rename = "RFCOMM")]
   #[strum(serialize = "RFCOMM")]
   Rfcomm,
   /// Lower layer, PSM-addressed, with a configurable MTU.
   #[serde(rename = "L2CAP")]
   #[strum(serialize = "L2CAP")]
   L2cap,
}

impl TransportKind {
   /// Only L2CAP lets the caller negotiate the MTU.
   pub const fn supports_mtu(self) -> bool {
      matches!(self, Self::L2cap)
   }
}

/// Remote endpoint of a connection or local endpoint of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
   pub address: String,
   pub port: u16,
}

impl fmt::Display for PeerAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}/{}", self.address, self.port)
   }
}

/// Port addressing for an outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPort {
   /// RFCOMM channel.
   Channel(u8),
   /// L2CAP protocol/service multiplexer, conventionally written in hex.
   Psm(u16),
}

impl fmt::Display for SocketPort {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Channel(channel) => write!(f, "channel {channel}"),
         Self::Psm(psm) => write!(f, "psm {psm:#06x}"),
      }
   }
}

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
   pub address: String,
   pub name: Option<String>,
   #[serde(rename = "classCode")]
   pub class_code: Option<u32>,
}

/// A service record found by a service search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ServiceRecord {
   pub host: String,
   pub name: Option<String>,
   pub description: Option<String>,
   pub provider: Option<String>,
   pub protocol: Option<String>,
   pub port: Option<u16>,
   #[serde(rename = "service-classes")]
   pub service_classes: Vec<String>,
   pub profiles: Vec<(String, u16)>,
   #[serde(rename = "service-id")]
   pub service_id: Option<String>,
}

/// Filters for a service search. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
   pub name: Option<String>,
   pub service_id: Option<Uuid>,
   pub address: Option<Address>,
}

/// Parses a service id: a full UUID or a 16/32-bit short form in hex.
pub fn parse_service_id(raw: &str) -> Result<Uuid> {
   let trimmed = raw.trim();
   let short = trimmed
      .strip_prefix("0x")
      .or_else(|| trimmed.strip_prefix("0X"))
      .unwrap_or(trimmed);
   if matches!(short.len(), 4 | 8)
      && let Ok(value) = u32::from_str_radix(short, 16)
   {
      return Ok(Uuid::from_u128(BASE_UUID | (u128::from(value) << 96)));
   }
   Uuid::parse_str(trimmed).map_err(|e| BridgeError::InvalidServiceId(format!("{raw}: {e}")))
}

/// The 16-bit short form of a UUID on the base UUID, if it has one.
pub fn short_service_class(uuid: Uuid) -> Option<u16> {
   let value = uuid.as_u128();
   if value & BASE_MASK != BASE_UUID {
      return None;
   }
   u16::try_from(value >> 96).ok()
}

/// Device and service discovery plus socket creation.
pub trait TransportStack: Send + Sync + 'static {
   type Socket: SocketHandle;

   /// Opens a fresh, unbound socket.
   fn open(&self, kind: TransportKind) -> Result<Self::Socket>;

   /// Finds nearby discoverable devices, resolving names and classes.
   fn discover(&self) -> impl Future<Output = Result<Vec<DiscoveredDevice>>> + Send;

   /// Resolves the human-readable name of a device. `None` when the device
   /// is known but has not reported a name.
   fn lookup_name(&self, address: Address) -> impl Future<Output = Result<Option<String>>> + Send;

   /// Searches for service records matching `filter`.
   fn find_services(
      &self,
      filter: &ServiceFilter,
   ) -> impl Future<Output = Result<Vec<ServiceRecord>>> + Send;
}

/// One socket owned by the stack.
///
/// Operations on a closed handle fail; the caller does not track state.
pub trait SocketHandle: Send + Sized + 'static {
   fn local_address(&self) -> Result<PeerAddress>;

   fn remote_address(&self) -> Result<PeerAddress>;

   /// Binds to the wildcard address. `None` lets the stack pick a port.
   fn bind(&mut self, port: Option<u16>) -> Result<()>;

   /// `None` uses the stack's default backlog.
   fn listen(&mut self, backlog: Option<u32>) -> Result<()>;

   /// Waits for a peer and returns its connected socket.
   fn accept(&mut self) -> impl Future<Output = Result<(Self, PeerAddress)>> + Send;

   fn connect(
      &mut self,
      address: Address,
      port: SocketPort,
   ) -> impl Future<Output = Result<()>> + Send;

   fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<usize>> + Send;

   /// Reads at most `buffer_size` bytes.
   fn receive(&mut self, buffer_size: usize) -> impl Future<Output = Result<Vec<u8>>> + Send;

   fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;

   fn close(&mut self) -> Result<()>;

   fn set_mtu(&mut self, mtu: u16) -> Result<()>;

   fn advertise_service(
      &mut self,
      name: &str,
      service_id: Uuid,
   ) -> impl Future<Output = Result<()>> + Send;

   fn stop_advertising(&mut self) -> Result<()>;
}
