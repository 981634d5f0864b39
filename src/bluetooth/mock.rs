//! Scripted in-memory transport stack for tests.
//!
//! Every call is appended to a shared [`Journal`] as `"<who> <op> [args]"`,
//! where `<who>` is `stack` or the socket's serial number. Sent bytes loop
//! back into the same socket's receive buffer.

use std::{
   collections::HashMap,
   future, io,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use bluer::Address;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use uuid::Uuid;

use crate::{
   bluetooth::stack::{
      DiscoveredDevice, PeerAddress, ServiceFilter, ServiceRecord, SocketHandle, SocketPort,
      TransportKind, TransportStack,
   },
   error::{BridgeError, Result},
};

pub const LOCAL_ADDRESS: &str = "00:1A:7D:DA:71:13";

/// Ordered record of stack calls.
#[derive(Default)]
pub struct Journal {
   entries: Mutex<Vec<String>>,
}

impl Journal {
   fn record(&self, who: impl std::fmt::Display, op: &str, args: impl std::fmt::Display) {
      let entry = format!("{who} {op} {args}");
      self.entries.lock().push(entry.trim_end().to_owned());
   }

   pub fn entries(&self) -> Vec<String> {
      self.entries.lock().clone()
   }

   /// Number of recorded calls of `op`, failed ones included.
   pub fn count(&self, op: &str) -> usize {
      self
         .entries
         .lock()
         .iter()
         .filter(|e| e.split_whitespace().nth(1) == Some(op))
         .count()
   }
}

struct Shared {
   journal: Arc<Journal>,
   serial: AtomicUsize,
   peers_tx: mpsc::UnboundedSender<PeerAddress>,
   peers_rx: AsyncMutex<mpsc::UnboundedReceiver<PeerAddress>>,
}

impl Shared {
   fn socket(self: &Arc<Self>, kind: TransportKind, remote: Option<PeerAddress>) -> MockSocket {
      let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
      self.journal.record(serial, "open", kind);
      MockSocket {
         serial,
         kind,
         shared: self.clone(),
         open: true,
         listening: false,
         advertising: false,
         local_port: 0,
         remote,
         buffer: Vec::new(),
      }
   }
}

pub struct MockStack {
   shared: Arc<Shared>,
   devices: Vec<DiscoveredDevice>,
   names: HashMap<Address, String>,
   services: Vec<ServiceRecord>,
}

impl MockStack {
   pub fn new() -> Self {
      let (peers_tx, peers_rx) = mpsc::unbounded_channel();
      Self {
         shared: Arc::new(Shared {
            journal: Arc::default(),
            serial: AtomicUsize::new(0),
            peers_tx,
            peers_rx: AsyncMutex::new(peers_rx),
         }),
         devices: Vec::new(),
         names: HashMap::new(),
         services: Vec::new(),
      }
   }

   pub fn with_device(mut self, address: Address, name: Option<&str>, class_code: u32) -> Self {
      if let Some(name) = name {
         self.names.insert(address, name.to_owned());
      }
      self.devices.push(DiscoveredDevice {
         address: address.to_string(),
         name: name.map(str::to_owned),
         class_code: Some(class_code),
      });
      self
   }

   pub fn with_service(mut self, record: ServiceRecord) -> Self {
      self.services.push(record);
      self
   }

   pub fn journal(&self) -> Arc<Journal> {
      self.shared.journal.clone()
   }

   /// Queues a peer for the next `accept` on any listening socket.
   pub fn incoming(&self, peer: PeerAddress) {
      let _ = self.shared.peers_tx.send(peer);
   }
}

impl TransportStack for MockStack {
   type Socket = MockSocket;

   fn open(&self, kind: TransportKind) -> Result<MockSocket> {
      Ok(self.shared.socket(kind, None))
   }

   async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
      self.shared.journal.record("stack", "discover", "");
      Ok(self.devices.clone())
   }

   async fn lookup_name(&self, address: Address) -> Result<Option<String>> {
      self.shared.journal.record("stack", "lookup", address);
      self
         .names
         .get(&address)
         .map(|name| Some(name.clone()))
         .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "page timeout").into())
   }

   async fn find_services(&self, filter: &ServiceFilter) -> Result<Vec<ServiceRecord>> {
      self.shared.journal.record("stack", "find_services", "");
      let service_id = filter.service_id.map(|id| id.to_string());
      let host = filter.address.map(|a| a.to_string());
      Ok(self
         .services
         .iter()
         .filter(|r| filter.name.is_none() || r.name == filter.name)
         .filter(|r| service_id.is_none() || r.service_id == service_id)
         .filter(|r| host.as_ref().is_none_or(|h| &r.host == h))
         .cloned()
         .collect())
   }
}

pub struct MockSocket {
   serial: usize,
   kind: TransportKind,
   shared: Arc<Shared>,
   open: bool,
   listening: bool,
   advertising: bool,
   local_port: u16,
   remote: Option<PeerAddress>,
   buffer: Vec<u8>,
}

impl MockSocket {
   fn record(&self, op: &str, args: impl std::fmt::Display) {
      self.shared.journal.record(self.serial, op, args);
   }

   fn ensure_open(&self) -> Result<()> {
      if self.open {
         Ok(())
      } else {
         Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed").into())
      }
   }
}

impl SocketHandle for MockSocket {
   fn local_address(&self) -> Result<PeerAddress> {
      self.record("local_address", "");
      self.ensure_open()?;
      Ok(PeerAddress {
         address: LOCAL_ADDRESS.into(),
         port: self.local_port,
      })
   }

   fn remote_address(&self) -> Result<PeerAddress> {
      self.record("remote_address", "");
      self.ensure_open()?;
      self
         .remote
         .clone()
         .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected").into())
   }

   fn bind(&mut self, port: Option<u16>) -> Result<()> {
      match port {
         Some(port) => self.record("bind", port),
         None => self.record("bind", "any"),
      }
      self.ensure_open()?;
      self.local_port = port.unwrap_or(match self.kind {
         TransportKind::Rfcomm => 1,
         TransportKind::L2cap => 0x1001,
      });
      Ok(())
   }

   fn listen(&mut self, backlog: Option<u32>) -> Result<()> {
      self.record("listen", backlog.unwrap_or(128));
      self.ensure_open()?;
      self.listening = true;
      Ok(())
   }

   async fn accept(&mut self) -> Result<(Self, PeerAddress)> {
      self.record("accept", "");
      self.ensure_open()?;
      if !self.listening {
         return Err(io::Error::new(io::ErrorKind::InvalidInput, "not listening").into());
      }
      let peer = self
         .shared
         .peers_rx
         .lock()
         .await
         .recv()
         .await
         .ok_or_else(|| BridgeError::from(io::Error::from(io::ErrorKind::BrokenPipe)))?;
      let socket = self.shared.socket(self.kind, Some(peer.clone()));
      Ok((socket, peer))
   }

   async fn connect(&mut self, address: Address, port: SocketPort) -> Result<()> {
      self.record("connect", format!("{address} {port}"));
      self.ensure_open()?;
      let port = match port {
         SocketPort::Channel(channel) => u16::from(channel),
         SocketPort::Psm(psm) => psm,
      };
      self.remote = Some(PeerAddress {
         address: address.to_string(),
         port,
      });
      Ok(())
   }

   async fn send(&mut self, data: &[u8]) -> Result<usize> {
      self.record("send", data.len());
      self.ensure_open()?;
      self.buffer.extend_from_slice(data);
      Ok(data.len())
   }

   async fn receive(&mut self, buffer_size: usize) -> Result<Vec<u8>> {
      self.record("receive", buffer_size);
      self.ensure_open()?;
      if self.buffer.is_empty() {
         return future::pending().await;
      }
      let take = buffer_size.min(self.buffer.len());
      Ok(self.buffer.drain(..take).collect())
   }

   async fn shutdown(&mut self) -> Result<()> {
      self.record("shutdown", "");
      self.ensure_open()
   }

   fn close(&mut self) -> Result<()> {
      self.record("close", "");
      self.ensure_open()?;
      self.open = false;
      self.advertising = false;
      Ok(())
   }

   fn set_mtu(&mut self, mtu: u16) -> Result<()> {
      self.record("set_mtu", mtu);
      self.ensure_open()
   }

   async fn advertise_service(&mut self, name: &str, service_id: Uuid) -> Result<()> {
      self.record("advertise", format!("{name} {service_id}"));
      self.ensure_open()?;
      self.advertising = true;
      Ok(())
   }

   fn stop_advertising(&mut self) -> Result<()> {
      self.record("stop_advertising", "");
      if !self.advertising {
         return Err(io::Error::new(io::ErrorKind::NotFound, "no service advertised").into());
      }
      self.advertising = false;
      Ok(())
   }
}
