//! Command decoding.
//!
//! Each input line is one JSON object whose `cmd` field names the operation.
//! The name is checked against [`Op`] before the body is decoded, so an
//! unknown operation and a malformed body are reported differently.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
   bluetooth::{
      session::{SessionCommand, SessionId},
      stack::TransportKind,
   },
   error::{BridgeError, Result},
};

/// A decoded input line.
///
/// [`Op`] is the fieldless mirror of this enum and names every operation the
/// bridge understands.
#[derive(
   Debug, Clone, PartialEq, Eq, Deserialize, strum::IntoStaticStr, strum::EnumDiscriminants,
)]
#[serde(tag = "cmd", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum_discriminants(
   name(Op),
   derive(strum::EnumString, strum::IntoStaticStr, strum::EnumIter),
   strum(serialize_all = "snake_case")
)]
pub enum Command {
   Scan,
   Lookup {
      address: String,
   },
   FindServices {
      #[serde(default)]
      name: Option<String>,
      #[serde(default, alias = "uuid", alias = "service-id")]
      service_id: Option<String>,
      #[serde(default)]
      address: Option<String>,
   },
   EnsureIdle,
   Terminate,
   SockNew {
      protocol: TransportKind,
   },
   SockBind {
      sock_uuid: SessionId,
      #[serde(default, deserialize_with = "optional_number")]
      port: Option<u16>,
   },
   SockListen {
      sock_uuid: SessionId,
      #[serde(default, deserialize_with = "optional_number")]
      backlog: Option<u32>,
   },
   SockAccept {
      sock_uuid: SessionId,
   },
   SockReceive {
      sock_uuid: SessionId,
      #[serde(deserialize_with = "number")]
      bufsize: usize,
   },
   SockClose {
      sock_uuid: SessionId,
   },
   SockConnect {
      sock_uuid: SessionId,
      address: String,
      #[serde(deserialize_with = "number")]
      port: u16,
   },
   SockSend {
      sock_uuid: SessionId,
      data: String,
   },
   SockShutdown {
      sock_uuid: SessionId,
   },
   #[serde(alias = "sock_set_l2cap_mtu")]
   #[strum_discriminants(strum(serialize = "sock_set_mtu", serialize = "sock_set_l2cap_mtu"))]
   SockSetMtu {
      sock_uuid: SessionId,
      #[serde(deserialize_with = "number")]
      mtu: u16,
   },
   SockAdvertiseService {
      sock_uuid: SessionId,
      service_name: String,
      #[serde(alias = "service_uuid")]
      service_id: String,
   },
   SockStopAdvertising {
      sock_uuid: SessionId,
   },
   SockGetLocalAddress {
      sock_uuid: SessionId,
   },
   SockGetRemoteAddress {
      sock_uuid: SessionId,
   },
}

impl Command {
   /// Decodes one input line.
   pub fn decode(line: &str) -> Result<Self> {
      let value: Value = serde_json::from_str(line)
         .map_err(|e| BridgeError::Protocol(format!("not a JSON object: {e}")))?;
      let name = match value.get("cmd") {
         Some(Value::String(name)) => name.as_str(),
         Some(_) => return Err(BridgeError::Protocol("\"cmd\" must be a string".into())),
         None => return Err(BridgeError::Protocol("missing \"cmd\" field".into())),
      };
      if Op::from_str(name).is_err() {
         return Err(BridgeError::UnsupportedOperation(name.to_owned()));
      }
      let name = name.to_owned();
      serde_json::from_value(value).map_err(|e| BridgeError::Protocol(format!("{name}: {e}")))
   }

   pub fn name(&self) -> &'static str {
      self.into()
   }

   /// Splits a socket command into its target session and the operation
   /// the session runs. Other commands are handed back unchanged.
   pub fn into_session_command(self) -> std::result::Result<(SessionId, SessionCommand), Self> {
      let routed = match self {
         Self::SockBind { sock_uuid, port } => (sock_uuid, SessionCommand::Bind { port }),
         Self::SockListen { sock_uuid, backlog } => (sock_uuid, SessionCommand::Listen { backlog }),
         Self::SockAccept { sock_uuid } => (sock_uuid, SessionCommand::Accept),
         Self::SockReceive { sock_uuid, bufsize } => (
            sock_uuid,
            SessionCommand::Receive {
               buffer_size: bufsize,
            },
         ),
         Self::SockClose { sock_uuid } => (sock_uuid, SessionCommand::Close),
         Self::SockConnect {
            sock_uuid,
            address,
            port,
         } => (sock_uuid, SessionCommand::Connect { address, port }),
         Self::SockSend { sock_uuid, data } => (sock_uuid, SessionCommand::Send { data }),
         Self::SockShutdown { sock_uuid } => (sock_uuid, SessionCommand::Shutdown),
         Self::SockSetMtu { sock_uuid, mtu } => (sock_uuid, SessionCommand::SetMtu { mtu }),
         Self::SockAdvertiseService {
            sock_uuid,
            service_name,
            service_id,
         } => (
            sock_uuid,
            SessionCommand::AdvertiseService {
               name: service_name,
               service_id,
            },
         ),
         Self::SockStopAdvertising { sock_uuid } => (sock_uuid, SessionCommand::StopAdvertising),
         Self::SockGetLocalAddress { sock_uuid } => (sock_uuid, SessionCommand::GetLocalAddress),
         Self::SockGetRemoteAddress { sock_uuid } => (sock_uuid, SessionCommand::GetRemoteAddress),
         other => return Err(other),
      };
      Ok(routed)
   }
}

/// Numbers arrive either as JSON integers or as decimal strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
   Int(u64),
   Text(String),
}

impl Lenient {
   fn into_number<T, E>(self) -> std::result::Result<T, E>
   where
      T: TryFrom<u64>,
      E: serde::de::Error,
   {
      let value = match self {
         Self::Int(value) => value,
         Self::Text(text) => text.trim().parse::<u64>().map_err(E::custom)?,
      };
      T::try_from(value).map_err(|_| E::custom(format_args!("{value} is out of range")))
   }
}

fn number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
   D: Deserializer<'de>,
   T: TryFrom<u64>,
{
   Lenient::deserialize(deserializer)?.into_number()
}

fn optional_number<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
   D: Deserializer<'de>,
   T: TryFrom<u64>,
{
   Option::<Lenient>::deserialize(deserializer)?
      .map(Lenient::into_number::<T, D::Error>)
      .transpose()
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use strum::IntoEnumIterator;

   use super::*;

   fn decode(line: &str) -> Command {
      Command::decode(line).unwrap()
   }

   #[test]
   fn discovery_commands() {
      assert_eq!(decode(r#"{"cmd":"scan"}"#), Command::Scan);
      assert_eq!(decode(r#"{"cmd":"ensure_idle","extra":1}"#), Command::EnsureIdle);
      assert_eq!(
         decode(r#"{"cmd":"lookup","address":"00:11:22:33:44:55"}"#),
         Command::Lookup {
            address: "00:11:22:33:44:55".into()
         }
      );
      assert_eq!(
         decode(r#"{"cmd":"find_services","uuid":"1101"}"#),
         Command::FindServices {
            name: None,
            service_id: Some("1101".into()),
            address: None,
         }
      );
   }

   #[test]
   fn numbers_accept_strings_and_nulls() {
      assert_eq!(
         decode(r#"{"cmd":"sock_receive","sock_uuid":"a","bufsize":"64"}"#),
         Command::SockReceive {
            sock_uuid: "a".into(),
            bufsize: 64,
         }
      );
      assert_eq!(
         decode(r#"{"cmd":"sock_bind","sock_uuid":"a","port":null}"#),
         Command::SockBind {
            sock_uuid: "a".into(),
            port: None,
         }
      );
      assert_eq!(
         decode(r#"{"cmd":"sock_listen","sock_uuid":"a"}"#),
         Command::SockListen {
            sock_uuid: "a".into(),
            backlog: None,
         }
      );
      assert_eq!(
         decode(r#"{"cmd":"sock_connect","sock_uuid":"a","address":"x","port":4097}"#),
         Command::SockConnect {
            sock_uuid: "a".into(),
            address: "x".into(),
            port: 4097,
         }
      );
   }

   #[test]
   fn aliases_are_accepted() {
      assert_eq!(
         decode(r#"{"cmd":"sock_set_l2cap_mtu","sock_uuid":"a","mtu":"672"}"#),
         Command::SockSetMtu {
            sock_uuid: "a".into(),
            mtu: 672,
         }
      );
      assert_eq!(
         decode(
            r#"{"cmd":"sock_advertise_service","sock_uuid":"a","service_name":"Echo","service_uuid":"1101"}"#
         ),
         Command::SockAdvertiseService {
            sock_uuid: "a".into(),
            service_name: "Echo".into(),
            service_id: "1101".into(),
         }
      );
   }

   #[test]
   fn unknown_operation_is_unsupported() {
      assert!(matches!(
         Command::decode(r#"{"cmd":"fly"}"#),
         Err(BridgeError::UnsupportedOperation(name)) if name == "fly"
      ));
   }

   #[test]
   fn malformed_lines_are_protocol_errors() {
      for line in [
         "",
         "not json",
         "[1,2]",
         r#"{"address":"x"}"#,
         r#"{"cmd":7}"#,
         r#"{"cmd":"sock_receive","sock_uuid":"a"}"#,
         r#"{"cmd":"sock_receive","sock_uuid":"a","bufsize":"lots"}"#,
         r#"{"cmd":"sock_set_mtu","sock_uuid":"a","mtu":70000}"#,
         r#"{"cmd":"sock_new","protocol":"SCO"}"#,
      ] {
         assert!(
            matches!(Command::decode(line), Err(BridgeError::Protocol(_))),
            "{line}"
         );
      }
   }

   #[test]
   fn socket_commands_route_to_sessions() {
      let (id, command) = decode(r#"{"cmd":"sock_receive","sock_uuid":"a","bufsize":8}"#)
         .into_session_command()
         .unwrap();
      assert_eq!(id, SessionId::from("a"));
      assert_eq!(command, SessionCommand::Receive { buffer_size: 8 });

      assert_eq!(
         decode(r#"{"cmd":"terminate"}"#).into_session_command(),
         Err(Command::Terminate)
      );
   }

   #[test]
   fn every_operation_decodes_as_a_command() {
      for op in Op::iter() {
         let name: &'static str = op.into();
         match Command::decode(&json!({ "cmd": name }).to_string()) {
            Ok(command) => assert_eq!(Op::from(&command), op),
            Err(BridgeError::Protocol(message)) => {
               assert!(!message.contains("unknown variant"), "{message}");
            },
            Err(other) => panic!("{name}: {other}"),
         }
      }
      assert_eq!(Op::from_str("sock_set_l2cap_mtu"), Ok(Op::SockSetMtu));
   }

   #[test]
   fn every_operation_name_is_in_the_table() {
      for name in [
         "scan",
         "lookup",
         "find_services",
         "ensure_idle",
         "terminate",
         "sock_new",
         "sock_bind",
         "sock_listen",
         "sock_accept",
         "sock_receive",
         "sock_close",
         "sock_connect",
         "sock_send",
         "sock_shutdown",
         "sock_set_mtu",
         "sock_advertise_service",
         "sock_stop_advertising",
         "sock_get_local_address",
         "sock_get_remote_address",
      ] {
         assert!(Op::from_str(name).is_ok(), "{name}");
      }
      assert_eq!(decode(r#"{"cmd":"sock_close","sock_uuid":"a"}"#).name(), "sock_close");
   }
}
