//! Messages written by the bridge.
//!
//! Responses go to stdout and error reports to stderr, one JSON object per
//! line. Session responses always echo the acting session's id.

use serde::{Serialize, Serializer};
use serde_json::json;

use crate::{
   bluetooth::{
      session::SessionId,
      stack::{DiscoveredDevice, PeerAddress, ServiceRecord},
   },
   error::BridgeError,
};

/// Coarse states announced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
   Idle,
   Scanning,
   LookingUp,
   FindingServices,
   CreatingSocket,
   Terminated,
}

/// Socket operations acknowledged with an `"executed"` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Ack {
   Bind,
   Listen,
   Connect,
   Sent,
   Close,
   Shutdown,
   SetMtu,
   AdvertiseService,
   StopAdvertising,
}

impl Ack {
   fn key(self) -> String {
      format!("{self}_res")
   }
}

/// Stack failure embedded in a lookup response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
   pub name: String,
   pub args: Vec<String>,
}

impl From<&BridgeError> for LookupFailure {
   fn from(err: &BridgeError) -> Self {
      Self {
         name: err.kind_name(),
         args: vec![err.to_string()],
      }
   }
}

/// A successful result, emitted once per command or event.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
   State(BridgeState),
   Scan(Vec<DiscoveredDevice>),
   Lookup {
      name: Option<String>,
      failure: Option<LookupFailure>,
   },
   Services(Vec<ServiceRecord>),
   NewSocket(SessionId),
   Executed {
      sock: SessionId,
      ack: Ack,
   },
   LocalAddress {
      sock: SessionId,
      address: PeerAddress,
   },
   RemoteAddress {
      sock: SessionId,
      address: PeerAddress,
   },
   Accepted {
      sock: SessionId,
      accepted: SessionId,
      peer: PeerAddress,
   },
   Received {
      sock: SessionId,
      data: String,
      size: usize,
   },
}

impl Response {
   /// Converts the response to its wire representation.
   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::State(state) => json!({ "state": <&'static str>::from(state) }),
         Self::Scan(devices) => json!({ "scan_res": devices }),
         Self::Lookup { name, failure } => {
            let mut value = json!({ "lookup_res": name });
            if let Some(failure) = failure {
               value["errName"] = json!(failure.name);
               value["errArgs"] = json!(failure.args);
            }
            value
         },
         Self::Services(records) => json!({ "find_services_res": records }),
         Self::NewSocket(id) => json!({ "new_socket_uuid": id }),
         Self::Executed { sock, ack } => {
            let mut value = json!({ "sock_uuid": sock });
            value[ack.key()] = json!("executed");
            value
         },
         Self::LocalAddress { sock, address } => json!({
            "sock_uuid": sock,
            "sock_local_address": address.address,
            "sock_local_port": address.port,
         }),
         Self::RemoteAddress { sock, address } => json!({
            "sock_uuid": sock,
            "sock_remote_address": address.address,
            "sock_remote_port": address.port,
         }),
         Self::Accepted {
            sock,
            accepted,
            peer,
         } => json!({
            "sock_uuid": sock,
            "accept_res": accepted,
            "accept_res_address": [peer.address, peer.port],
         }),
         Self::Received { sock, data, size } => json!({
            "sock_uuid": sock,
            "receive_res": data,
            "size": size,
         }),
      }
   }
}

impl Serialize for Response {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      self.to_json().serialize(serializer)
   }
}

/// Where an error report comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
   /// The dispatcher or anything outside a session.
   Main,
   Session(SessionId),
}

impl ErrorSource {
   /// Attributes an error raised outside a session's own task.
   pub fn of(err: &BridgeError) -> Self {
      err.session().cloned().map_or(Self::Main, Self::Session)
   }

   fn tag(&self) -> String {
      match self {
         Self::Main => "main".to_owned(),
         Self::Session(id) => format!("sock_uuid_{id}"),
      }
   }
}

/// A diagnostic record written to the error stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
   pub source: String,
   #[serde(rename = "err")]
   pub description: String,
}

impl ErrorReport {
   pub fn new(source: &ErrorSource, err: &BridgeError) -> Self {
      Self {
         source: source.tag(),
         description: err.to_string(),
      }
   }

   /// Last-resort report for an error that ends the process.
   pub fn fatal(err: &BridgeError) -> Self {
      Self {
         source: ErrorSource::Main.tag(),
         description: format!("fatal: {err}"),
      }
   }
}
