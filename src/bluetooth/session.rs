//! Per-socket session actor.
//!
//! A session owns exactly one socket handle and runs in its own task. The
//! dispatcher only ever enqueues commands; results and failures go straight
//! to the output channels from the session task, so a blocking `accept` or
//! `receive` never holds up other sessions or the dispatcher.

use std::{fmt, str::FromStr};

use bluer::Address;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   select,
   sync::{mpsc, watch},
};
use uuid::Uuid;

use crate::{
   bluetooth::{
      registry::SessionRegistry,
      stack::{MAX_RECEIVE_SIZE, SocketHandle, SocketPort, TransportKind, parse_service_id},
   },
   bridge::protocol::{Ack, ErrorSource, Response},
   error::{BridgeError, Result},
   output::Outputs,
};

/// Opaque, never reused session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(SmolStr);

impl SessionId {
   pub fn generate() -> Self {
      Self(Uuid::new_v4().to_smolstr())
   }
}

impl fmt::Display for SessionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for SessionId {
   fn from(id: &str) -> Self {
      Self(id.into())
   }
}

impl From<String> for SessionId {
   fn from(id: String) -> Self {
      Self(id.into())
   }
}

/// Operations a session performs on its socket.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SessionCommand {
   GetLocalAddress,
   GetRemoteAddress,
   Bind { port: Option<u16> },
   Listen { backlog: Option<u32> },
   Accept,
   Connect { address: String, port: u16 },
   Send { data: String },
   Receive { buffer_size: usize },
   Close,
   Shutdown,
   SetMtu { mtu: u16 },
   AdvertiseService { name: String, service_id: String },
   StopAdvertising,
}

impl SessionCommand {
   pub fn name(&self) -> &'static str {
      self.into()
   }
}

/// Handle used by the dispatcher to reach a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
   id: SessionId,
   inbox: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
   pub const fn id(&self) -> &SessionId {
      &self.id
   }

   /// Queues a command without waiting for it to run.
   pub fn submit(&self, command: SessionCommand) -> Result<()> {
      self.inbox.try_send(command).map_err(|e| match e {
         mpsc::error::TrySendError::Full(_) => BridgeError::SessionBusy(self.id.clone()),
         mpsc::error::TrySendError::Closed(_) => BridgeError::SessionStopped(self.id.clone()),
      })
   }
}

/// A live socket and the context it runs in.
pub struct Session<S: SocketHandle> {
   id: SessionId,
   kind: TransportKind,
   socket: S,
   open: bool,
   registry: SessionRegistry<S>,
   outputs: Outputs,
}

impl<S: SocketHandle> Session<S> {
   /// Builds a session and the handle that feeds it.
   pub fn new(
      id: SessionId,
      kind: TransportKind,
      socket: S,
      registry: SessionRegistry<S>,
      outputs: Outputs,
      queue_depth: usize,
   ) -> (Self, SessionHandle, mpsc::Receiver<SessionCommand>) {
      let (tx, rx) = mpsc::channel(queue_depth);
      let handle = SessionHandle {
         id: id.clone(),
         inbox: tx,
      };
      let session = Self {
         id,
         kind,
         socket,
         open: true,
         registry,
         outputs,
      };
      (session, handle, rx)
   }

   /// Runs commands one at a time until the inbox closes or shutdown is
   /// signalled, then closes the socket if it is still open.
   pub async fn run(
      mut self,
      mut inbox: mpsc::Receiver<SessionCommand>,
      mut shutdown: watch::Receiver<bool>,
   ) {
      debug!("{}: session started ({})", self.id, self.kind);
      loop {
         let command = select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            command = inbox.recv() => match command {
               Some(command) => command,
               None => break,
            },
         };

         let op = command.name();
         select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
               self.interrupted(op);
               break;
            },
            result = self.execute(command) => match result {
               Ok(response) => self.outputs.respond(response),
               Err(e) => {
                  warn!("{}: {e}", self.id);
                  self.outputs.report(&ErrorSource::Session(self.id.clone()), &e);
               },
            },
         }
      }

      inbox.close();
      while let Ok(command) = inbox.try_recv() {
         self.interrupted(command.name());
      }

      if self.open
         && let Err(e) = self.socket.close()
      {
         warn!("{}: failed to close socket on exit: {e}", self.id);
      }
      self.open = false;
      info!("{}: session ended", self.id);
   }

   /// Reports a command that never got to finish.
   fn interrupted(&self, op: &'static str) {
      let err = BridgeError::SocketOperation {
         op,
         source: Box::new(BridgeError::SessionStopped(self.id.clone())),
      };
      self.outputs.report(&ErrorSource::Session(self.id.clone()), &err);
   }

   async fn execute(&mut self, command: SessionCommand) -> Result<Response> {
      let op = command.name();
      match command {
         SessionCommand::GetLocalAddress => {
            let address = self.socket.local_address().map_err(|e| e.during(op))?;
            Ok(Response::LocalAddress {
               sock: self.id.clone(),
               address,
            })
         },
         SessionCommand::GetRemoteAddress => {
            let address = self.socket.remote_address().map_err(|e| e.during(op))?;
            Ok(Response::RemoteAddress {
               sock: self.id.clone(),
               address,
            })
         },
         SessionCommand::Bind { port } => {
            self.socket.bind(port).map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::Bind))
         },
         SessionCommand::Listen { backlog } => {
            self.socket.listen(backlog).map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::Listen))
         },
         SessionCommand::Accept => {
            let (socket, peer) = self.socket.accept().await.map_err(|e| e.during(op))?;
            info!("{}: accepted connection from {peer}", self.id);
            let accepted = self
               .registry
               .create(socket, self.kind)
               .await
               .map_err(|e| e.during(op))?;
            Ok(Response::Accepted {
               sock: self.id.clone(),
               accepted,
               peer,
            })
         },
         SessionCommand::Connect { address, port } => {
            let address = Address::from_str(&address)
               .map_err(|e| BridgeError::InvalidAddress(format!("{address}: {e}")).during(op))?;
            let port = self.socket_port(port).map_err(|e| e.during(op))?;
            debug!("{}: connecting to {address} on {port}", self.id);
            self
               .socket
               .connect(address, port)
               .await
               .map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::Connect))
         },
         SessionCommand::Send { data } => {
            debug!("→ {}: {}", self.id, hex::encode(data.as_bytes()));
            self
               .socket
               .send(data.as_bytes())
               .await
               .map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::Sent))
         },
         SessionCommand::Receive { buffer_size } => {
            if buffer_size == 0 || buffer_size > MAX_RECEIVE_SIZE {
               return Err(BridgeError::Configuration(format!(
                  "receive buffer size must be between 1 and {MAX_RECEIVE_SIZE}, got {buffer_size}"
               )));
            }
            let bytes = self
               .socket
               .receive(buffer_size)
               .await
               .map_err(|e| e.during(op))?;
            debug!("← {}: {}", self.id, hex::encode(&bytes));
            let size = bytes.len();
            let data = String::from_utf8(bytes).map_err(|e| {
               BridgeError::SocketOperation {
                  op,
                  source: Box::new(BridgeError::Protocol(format!(
                     "received payload is not valid UTF-8: {e}"
                  ))),
               }
            })?;
            Ok(Response::Received {
               sock: self.id.clone(),
               data,
               size,
            })
         },
         SessionCommand::Close => {
            self.socket.close().map_err(|e| e.during(op))?;
            self.open = false;
            Ok(self.executed(Ack::Close))
         },
         SessionCommand::Shutdown => {
            self.socket.shutdown().await.map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::Shutdown))
         },
         SessionCommand::SetMtu { mtu } => {
            if !self.kind.supports_mtu() {
               return Err(BridgeError::Configuration(format!(
                  "unable to set L2CAP MTU on a {} socket",
                  self.kind
               )));
            }
            self.socket.set_mtu(mtu).map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::SetMtu))
         },
         SessionCommand::AdvertiseService { name, service_id } => {
            let service_id = parse_service_id(&service_id).map_err(|e| e.during(op))?;
            self
               .socket
               .advertise_service(&name, service_id)
               .await
               .map_err(|e| e.during(op))?;
            info!("{}: advertising \"{name}\" as {service_id}", self.id);
            Ok(self.executed(Ack::AdvertiseService))
         },
         SessionCommand::StopAdvertising => {
            self.socket.stop_advertising().map_err(|e| e.during(op))?;
            Ok(self.executed(Ack::StopAdvertising))
         },
      }
   }

   fn executed(&self, ack: Ack) -> Response {
      Response::Executed {
         sock: self.id.clone(),
         ack,
      }
   }

   /// Maps a numeric port to the addressing of this session's transport.
   fn socket_port(&self, port: u16) -> Result<SocketPort> {
      match self.kind {
         TransportKind::L2cap => Ok(SocketPort::Psm(port)),
         TransportKind::Rfcomm => u8::try_from(port)
            .map(SocketPort::Channel)
            .map_err(|_| BridgeError::Configuration(format!("RFCOMM channel {port} out of range"))),
      }
   }
}
