//! Device and service discovery.

use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::{debug, info};

use crate::{
   bluetooth::stack::{ServiceFilter, TransportStack, parse_service_id},
   bridge::protocol::{BridgeState, LookupFailure, Response},
   error::{BridgeError, Result},
   output::Outputs,
};

fn parse_address(raw: &str) -> Result<Address> {
   Address::from_str(raw.trim()).map_err(|e| BridgeError::InvalidAddress(format!("{raw}: {e}")))
}

/// Stateless façade over the stack's discovery primitives.
pub struct Discovery<S> {
   stack: Arc<S>,
   outputs: Outputs,
}

impl<S: TransportStack> Discovery<S> {
   pub const fn new(stack: Arc<S>, outputs: Outputs) -> Self {
      Self { stack, outputs }
   }

   pub async fn scan(&self) -> Result<()> {
      self.outputs.state(BridgeState::Scanning);
      let devices = self.stack.discover().await?;
      info!("Scan found {} device(s)", devices.len());
      self.outputs.respond(Response::Scan(devices));
      Ok(())
   }

   /// Failures are part of the response, never an error report.
   pub async fn lookup(&self, address: &str) -> Result<()> {
      self.outputs.state(BridgeState::LookingUp);
      let looked_up = match parse_address(address) {
         Ok(address) => self.stack.lookup_name(address).await,
         Err(e) => Err(e),
      };
      let response = match looked_up {
         Ok(name) => Response::Lookup {
            name,
            failure: None,
         },
         Err(e) => {
            debug!("Lookup of {address} failed: {e}");
            Response::Lookup {
               name: None,
               failure: Some(LookupFailure::from(&e)),
            }
         },
      };
      self.outputs.respond(response);
      Ok(())
   }

   pub async fn find_services(
      &self,
      name: Option<String>,
      service_id: Option<&str>,
      address: Option<&str>,
   ) -> Result<()> {
      self.outputs.state(BridgeState::FindingServices);
      let filter = ServiceFilter {
         name,
         service_id: service_id.map(parse_service_id).transpose()?,
         address: address.map(parse_address).transpose()?,
      };
      let records = self.stack.find_services(&filter).await?;
      info!("Service search matched {} record(s)", records.len());
      self.outputs.respond(Response::Services(records));
      Ok(())
   }
}
