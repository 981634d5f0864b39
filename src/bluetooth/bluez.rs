//! BlueZ transport stack.
//!
//! Implements [`TransportStack`] on `bluer`: discovery and service search go
//! through the adapter's D-Bus objects, sockets are kernel RFCOMM and L2CAP
//! stream sockets, and advertising registers a BlueZ profile.

use std::{io, mem, pin::pin, time::Duration};

use bluer::{
   Adapter, AdapterEvent, Address, AddressType, Session, l2cap,
   rfcomm::{self, Profile, ProfileHandle, Role},
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   select, time,
};
use uuid::Uuid;

use crate::{
   bluetooth::stack::{
      DiscoveredDevice, MAX_RECEIVE_SIZE, PeerAddress, ServiceFilter, ServiceRecord, SocketHandle,
      SocketPort, TransportKind, TransportStack, short_service_class,
   },
   config::Config,
   error::{BridgeError, Result},
};

/// Backlog used when the caller does not ask for one.
const DEFAULT_BACKLOG: u32 = 128;

/// Service classes BlueZ commonly resolves, with the transport they run on.
const WELL_KNOWN_SERVICES: &[(u16, &str, TransportKind)] = &[
   (0x1101, "Serial Port", TransportKind::Rfcomm),
   (0x1103, "Dial-up Networking", TransportKind::Rfcomm),
   (0x1105, "OBEX Object Push", TransportKind::Rfcomm),
   (0x1106, "OBEX File Transfer", TransportKind::Rfcomm),
   (0x1108, "Headset", TransportKind::Rfcomm),
   (0x110a, "Audio Source", TransportKind::L2cap),
   (0x110b, "Audio Sink", TransportKind::L2cap),
   (0x110e, "A/V Remote Control", TransportKind::L2cap),
   (0x111e, "Handsfree", TransportKind::Rfcomm),
   (0x1124, "Human Interface Device", TransportKind::L2cap),
   (0x1200, "PnP Information", TransportKind::L2cap),
];

pub struct BluezStack {
   session: Session,
   adapter: Adapter,
   scan_duration: Duration,
}

impl BluezStack {
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!("Using adapter {} ({})", adapter.name(), adapter.address().await?);

      Ok(Self {
         session,
         adapter,
         scan_duration: config.scan_duration(),
      })
   }
}

impl TransportStack for BluezStack {
   type Socket = BluezSocket;

   fn open(&self, kind: TransportKind) -> Result<BluezSocket> {
      let handle = match kind {
         TransportKind::Rfcomm => Handle::Rfcomm(rfcomm::Socket::new()?),
         TransportKind::L2cap => Handle::L2cap(l2cap::Socket::new_stream()?),
      };
      Ok(BluezSocket {
         kind,
         handle,
         session: self.session.clone(),
         profile: None,
      })
   }

   async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
      info!("Scanning on {} for {:?}", self.adapter.name(), self.scan_duration);
      let mut found: Vec<Address> = Vec::new();
      {
         let mut events = pin!(self.adapter.discover_devices().await?);
         let mut window = pin!(time::sleep(self.scan_duration));
         loop {
            select! {
               () = &mut window => break,
               event = events.next() => match event {
                  Some(AdapterEvent::DeviceAdded(addr)) => {
                     if !found.contains(&addr) {
                        debug!("Discovered {addr}");
                        found.push(addr);
                     }
                  },
                  Some(_) => {},
                  None => break,
               },
            }
         }
      }

      let mut devices = Vec::with_capacity(found.len());
      for addr in found {
         let device = self.adapter.device(addr)?;
         devices.push(DiscoveredDevice {
            address: addr.to_string(),
            name: device.name().await.ok().flatten(),
            class_code: device.class().await.ok().flatten(),
         });
      }
      Ok(devices)
   }

   async fn lookup_name(&self, address: Address) -> Result<Option<String>> {
      Ok(self.adapter.device(address)?.name().await?)
   }

   async fn find_services(&self, filter: &ServiceFilter) -> Result<Vec<ServiceRecord>> {
      let addresses = match filter.address {
         Some(address) => vec![address],
         None => self.adapter.device_addresses().await?,
      };

      let mut records = Vec::new();
      for address in addresses {
         let device = self.adapter.device(address)?;
         let Some(uuids) = device.uuids().await? else {
            continue;
         };
         let mut uuids: Vec<Uuid> = uuids.into_iter().collect();
         uuids.sort_unstable();

         for uuid in uuids {
            if filter.service_id.is_some_and(|id| id != uuid) {
               continue;
            }
            let record = service_record(address, uuid);
            if let Some(name) = &filter.name
               && record.name.as_ref() != Some(name)
            {
               continue;
            }
            records.push(record);
         }
      }
      Ok(records)
   }
}

fn service_record(host: Address, uuid: Uuid) -> ServiceRecord {
   let known = short_service_class(uuid)
      .and_then(|short| WELL_KNOWN_SERVICES.iter().find(|(id, ..)| *id == short));
   ServiceRecord {
      host: host.to_string(),
      name: known.map(|(_, name, _)| (*name).to_owned()),
      protocol: known.map(|(.., kind)| kind.to_string()),
      service_classes: vec![uuid.to_string()],
      service_id: Some(uuid.to_string()),
      ..ServiceRecord::default()
   }
}

/// Socket lifecycle: fresh → listener or stream → closed.
enum Handle {
   Rfcomm(rfcomm::Socket),
   RfcommListener(rfcomm::Listener),
   RfcommStream(rfcomm::Stream),
   L2cap(l2cap::Socket<l2cap::Stream>),
   L2capListener(l2cap::StreamListener),
   L2capStream(l2cap::Stream),
   Closed,
}

impl Handle {
   const fn state(&self) -> &'static str {
      match self {
         Self::Rfcomm(_) | Self::L2cap(_) => "unconnected",
         Self::RfcommListener(_) | Self::L2capListener(_) => "listening",
         Self::RfcommStream(_) | Self::L2capStream(_) => "connected",
         Self::Closed => "closed",
      }
   }

   /// Listeners and streams expose their address through the underlying socket.
   fn local_address(&self) -> Result<PeerAddress> {
      let address = match self {
         Self::Rfcomm(s) => rfcomm_peer(s.local_addr()?),
         Self::RfcommListener(l) => rfcomm_peer(l.as_ref().local_addr()?),
         Self::RfcommStream(s) => rfcomm_peer(s.as_ref().local_addr()?),
         Self::L2cap(s) => l2cap_peer(s.local_addr()?),
         Self::L2capListener(l) => l2cap_peer(l.as_ref().local_addr()?),
         Self::L2capStream(s) => l2cap_peer(s.as_ref().local_addr()?),
         Self::Closed => return Err(invalid_state("get local address", self)),
      };
      Ok(address)
   }

   fn remote_address(&self) -> Result<PeerAddress> {
      match self {
         Self::RfcommStream(s) => Ok(rfcomm_peer(s.peer_addr()?)),
         Self::L2capStream(s) => Ok(l2cap_peer(s.peer_addr()?)),
         other => Err(invalid_state("get remote address", other)),
      }
   }
}

fn invalid_state(op: &str, handle: &Handle) -> BridgeError {
   let kind = match handle {
      Handle::Closed => io::ErrorKind::NotConnected,
      _ => io::ErrorKind::InvalidInput,
   };
   io::Error::new(kind, format!("cannot {op} on a {} socket", handle.state())).into()
}

fn rfcomm_peer(addr: rfcomm::SocketAddr) -> PeerAddress {
   PeerAddress {
      address: addr.addr.to_string(),
      port: u16::from(addr.channel),
   }
}

fn l2cap_peer(addr: l2cap::SocketAddr) -> PeerAddress {
   PeerAddress {
      address: addr.addr.to_string(),
      port: addr.psm,
   }
}

pub struct BluezSocket {
   kind: TransportKind,
   handle: Handle,
   session: Session,
   profile: Option<ProfileHandle>,
}

impl BluezSocket {
   fn connected(&self, handle: Handle) -> Self {
      Self {
         kind: self.kind,
         handle,
         session: self.session.clone(),
         profile: None,
      }
   }
}

impl SocketHandle for BluezSocket {
   fn local_address(&self) -> Result<PeerAddress> {
      self.handle.local_address()
   }

   fn remote_address(&self) -> Result<PeerAddress> {
      self.handle.remote_address()
   }

   fn bind(&mut self, port: Option<u16>) -> Result<()> {
      match &self.handle {
         Handle::Rfcomm(s) => {
            let channel = u8::try_from(port.unwrap_or(0)).map_err(|_| {
               BridgeError::Configuration(format!("RFCOMM channel {port:?} out of range"))
            })?;
            s.bind(rfcomm::SocketAddr::new(Address::any(), channel))?;
         },
         Handle::L2cap(s) => {
            s.bind(l2cap::SocketAddr::new(
               Address::any(),
               AddressType::BrEdr,
               port.unwrap_or(0),
            ))?;
         },
         other => return Err(invalid_state("bind", other)),
      }
      Ok(())
   }

   fn listen(&mut self, backlog: Option<u32>) -> Result<()> {
      let backlog = backlog.unwrap_or(DEFAULT_BACKLOG);
      self.handle = match mem::replace(&mut self.handle, Handle::Closed) {
         Handle::Rfcomm(s) => Handle::RfcommListener(s.listen(backlog)?),
         Handle::L2cap(s) => Handle::L2capListener(s.listen(backlog)?),
         other => {
            let err = invalid_state("listen", &other);
            self.handle = other;
            return Err(err);
         },
      };
      Ok(())
   }

   async fn accept(&mut self) -> Result<(Self, PeerAddress)> {
      match &self.handle {
         Handle::RfcommListener(l) => {
            let (stream, addr) = l.accept().await?;
            Ok((self.connected(Handle::RfcommStream(stream)), rfcomm_peer(addr)))
         },
         Handle::L2capListener(l) => {
            let (stream, addr) = l.accept().await?;
            Ok((self.connected(Handle::L2capStream(stream)), l2cap_peer(addr)))
         },
         other => Err(invalid_state("accept", other)),
      }
   }

   async fn connect(&mut self, address: Address, port: SocketPort) -> Result<()> {
      self.handle = match (mem::replace(&mut self.handle, Handle::Closed), port) {
         (Handle::Rfcomm(s), SocketPort::Channel(channel)) => {
            Handle::RfcommStream(s.connect(rfcomm::SocketAddr::new(address, channel)).await?)
         },
         (Handle::L2cap(s), SocketPort::Psm(psm)) => Handle::L2capStream(
            s.connect(l2cap::SocketAddr::new(address, AddressType::BrEdr, psm))
               .await?,
         ),
         (other, _) => {
            let err = invalid_state("connect", &other);
            self.handle = other;
            return Err(err);
         },
      };
      Ok(())
   }

   async fn send(&mut self, data: &[u8]) -> Result<usize> {
      match &mut self.handle {
         Handle::RfcommStream(s) => s.write_all(data).await?,
         Handle::L2capStream(s) => s.write_all(data).await?,
         other => return Err(invalid_state("send", other)),
      }
      Ok(data.len())
   }

   async fn receive(&mut self, buffer_size: usize) -> Result<Vec<u8>> {
      let mut buf = vec![0u8; buffer_size.min(MAX_RECEIVE_SIZE)];
      let n = match &mut self.handle {
         Handle::RfcommStream(s) => s.read(&mut buf).await?,
         Handle::L2capStream(s) => s.read(&mut buf).await?,
         other => return Err(invalid_state("receive", other)),
      };
      if n == 0 {
         warn!("Connection lost");
      }
      buf.truncate(n);
      Ok(buf)
   }

   async fn shutdown(&mut self) -> Result<()> {
      match &mut self.handle {
         Handle::RfcommStream(s) => AsyncWriteExt::shutdown(s).await?,
         Handle::L2capStream(s) => AsyncWriteExt::shutdown(s).await?,
         other => return Err(invalid_state("shutdown", other)),
      }
      Ok(())
   }

   fn close(&mut self) -> Result<()> {
      if let Handle::Closed = self.handle {
         return Err(invalid_state("close", &self.handle));
      }
      self.profile = None;
      self.handle = Handle::Closed;
      Ok(())
   }

   fn set_mtu(&mut self, mtu: u16) -> Result<()> {
      match &self.handle {
         Handle::L2cap(s) => s.set_recv_mtu(mtu)?,
         Handle::L2capListener(l) => l.as_ref().set_recv_mtu(mtu)?,
         Handle::L2capStream(s) => s.as_ref().set_recv_mtu(mtu)?,
         Handle::Closed => return Err(invalid_state("set MTU", &self.handle)),
         _ => {
            return Err(BridgeError::Configuration(format!(
               "unable to set L2CAP MTU on a {} socket",
               self.kind
            )));
         },
      }
      Ok(())
   }

   async fn advertise_service(&mut self, name: &str, service_id: Uuid) -> Result<()> {
      let local = self.local_address()?;
      let mut profile = Profile {
         uuid: service_id,
         name: Some(name.to_owned()),
         role: Some(Role::Server),
         require_authentication: Some(false),
         require_authorization: Some(false),
         ..Default::default()
      };
      match self.kind {
         TransportKind::Rfcomm => profile.channel = Some(local.port),
         TransportKind::L2cap => profile.psm = Some(local.port),
      }
      self.profile = Some(self.session.register_profile(profile).await?);
      debug!("Registered profile {service_id} on port {}", local.port);
      Ok(())
   }

   fn stop_advertising(&mut self) -> Result<()> {
      match self.profile.take() {
         Some(_) => Ok(()),
         None => {
            Err(io::Error::new(io::ErrorKind::NotFound, "no service is being advertised").into())
         },
      }
   }
}
