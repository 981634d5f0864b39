//! Error types for the bridge.
//!
//! This module defines every failure the bridge can report: protocol
//! errors on the input stream, registry and session lookups, configuration
//! mistakes, and failures surfaced by the Bluetooth stack.

use thiserror::Error;

use crate::bluetooth::session::SessionId;

/// Main error type for the bridge.
#[derive(Error, Debug, strum::IntoStaticStr)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Malformed command: {0}")]
   Protocol(String),

   #[error("unsupported operation")]
   UnsupportedOperation(String),

   #[error("Session not found: {0}")]
   SessionNotFound(SessionId),

   #[error("Configuration error: {0}")]
   Configuration(String),

   #[error("{op} failed: {source}")]
   SocketOperation {
      op: &'static str,
      source: Box<BridgeError>,
   },

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Invalid service id: {0}")]
   InvalidServiceId(String),

   #[error("Session {0} has too many pending commands")]
   SessionBusy(SessionId),

   #[error("Session {0} is no longer running")]
   SessionStopped(SessionId),

   #[error("Session registry has been shut down")]
   RegistryShutdown,

   #[error("Handler panicked: {0}")]
   HandlerPanicked(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),
}

impl BridgeError {
   /// Wraps a stack failure as the failure of a named socket operation.
   pub fn during(self, op: &'static str) -> Self {
      match self {
         Self::Configuration(_) | Self::SocketOperation { .. } => self,
         other => Self::SocketOperation {
            op,
            source: Box::new(other),
         },
      }
   }

   /// The session an error should be attributed to, if any.
   pub fn session(&self) -> Option<&SessionId> {
      match self {
         Self::SessionNotFound(id) | Self::SessionBusy(id) | Self::SessionStopped(id) => Some(id),
         _ => None,
      }
   }

   /// Short error name, used where a failure is embedded in a response.
   pub fn kind_name(&self) -> String {
      match self {
         Self::Bluetooth(e) => format!("{:?}", e.kind),
         Self::Io(e) => format!("{:?}", e.kind()),
         Self::SocketOperation { source, .. } => source.kind_name(),
         other => <&'static str>::from(other).to_owned(),
      }
   }
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
   use std::io;

   use super::*;

   #[test]
   fn unsupported_operation_has_fixed_description() {
      let err = BridgeError::UnsupportedOperation("fly".into());
      assert_eq!(err.to_string(), "unsupported operation");
   }

   #[test]
   fn during_wraps_stack_failures_once() {
      let err = BridgeError::Io(io::Error::from(io::ErrorKind::NotConnected)).during("send");
      assert!(matches!(err, BridgeError::SocketOperation { op: "send", .. }));
      assert!(err.to_string().starts_with("send failed: I/O error"));

      let err = err.during("receive");
      assert!(matches!(err, BridgeError::SocketOperation { op: "send", .. }));
   }

   #[test]
   fn configuration_errors_are_not_wrapped() {
      let err = BridgeError::Configuration("nope".into()).during("set_mtu");
      assert!(matches!(err, BridgeError::Configuration(_)));
   }

   #[test]
   fn kind_name_prefers_inner_kind() {
      let err = BridgeError::Io(io::Error::from(io::ErrorKind::TimedOut));
      assert_eq!(err.kind_name(), "TimedOut");
      assert_eq!(err.during("lookup").kind_name(), "TimedOut");
      assert_eq!(BridgeError::RegistryShutdown.kind_name(), "RegistryShutdown");
   }

   #[test]
   fn session_errors_carry_their_session() {
      let id = SessionId::from("abc");
      assert_eq!(BridgeError::SessionNotFound(id.clone()).session(), Some(&id));
      assert_eq!(BridgeError::Protocol("x".into()).session(), None);
   }
}
