//! Command dispatcher.
//!
//! Reads one line at a time, decodes it, and either runs it (discovery,
//! socket creation, teardown) or hands it to the addressed session without
//! waiting for the session to finish.

use std::{any::Any, io, panic::AssertUnwindSafe, pin::pin, sync::Arc};

use futures::{FutureExt, Stream, StreamExt, stream};
use log::{debug, info, warn};
use tokio::{select, sync::mpsc};

use crate::{
   bluetooth::{
      registry::SessionRegistry,
      session::SessionCommand,
      stack::{TransportKind, TransportStack},
   },
   bridge::{
      command::Command,
      discovery::Discovery,
      protocol::{BridgeState, ErrorSource, Response},
   },
   error::{BridgeError, Result},
   output::Outputs,
};

enum Flow {
   Continue,
   Terminate,
}

/// Adapts a channel of input lines to the stream [`Dispatcher::run`] reads.
pub fn channel_lines(
   mut rx: mpsc::UnboundedReceiver<io::Result<String>>,
) -> impl Stream<Item = io::Result<String>> + Unpin {
   stream::poll_fn(move |cx| rx.poll_recv(cx))
}

pub struct Dispatcher<S: TransportStack> {
   stack: Arc<S>,
   discovery: Discovery<S>,
   registry: SessionRegistry<S::Socket>,
   outputs: Outputs,
}

impl<S: TransportStack> Dispatcher<S> {
   pub fn new(stack: Arc<S>, registry: SessionRegistry<S::Socket>, outputs: Outputs) -> Self {
      Self {
         discovery: Discovery::new(stack.clone(), outputs.clone()),
         stack,
         registry,
         outputs,
      }
   }

   /// Serves commands until `terminate`, end of input or Ctrl-C, then tears
   /// every session down and announces `TERMINATED`.
   pub async fn run<L>(&self, mut lines: L)
   where
      L: Stream<Item = io::Result<String>> + Unpin,
   {
      let mut interrupt = pin!(tokio::signal::ctrl_c());
      loop {
         self.outputs.state(BridgeState::Idle);

         let line = select! {
            _ = &mut interrupt => {
               info!("Interrupted");
               break;
            }
            line = lines.next() => match line {
               Some(Ok(line)) => line,
               Some(Err(e)) => {
                  warn!("Failed to read input: {e}");
                  self.outputs.report(&ErrorSource::Main, &BridgeError::Io(e));
                  break;
               },
               None => {
                  info!("End of input");
                  break;
               },
            },
         };

         match AssertUnwindSafe(self.dispatch(&line)).catch_unwind().await {
            Ok(Ok(Flow::Continue)) => {},
            Ok(Ok(Flow::Terminate)) => break,
            Ok(Err(e)) => self.outputs.report(&ErrorSource::of(&e), &e),
            Err(panic) => {
               let err = BridgeError::HandlerPanicked(panic_message(panic.as_ref()));
               self.outputs.report(&ErrorSource::Main, &err);
            },
         }
      }

      if let Err(e) = self.teardown().await {
         self.outputs.report(&ErrorSource::Main, &e);
      }
      self.outputs.state(BridgeState::Terminated);
   }

   async fn dispatch(&self, line: &str) -> Result<Flow> {
      let command = Command::decode(line)?;
      debug!("Dispatching {}", command.name());

      match command {
         Command::Scan => self.discovery.scan().await?,
         Command::Lookup { address } => self.discovery.lookup(&address).await?,
         Command::FindServices {
            name,
            service_id,
            address,
         } => {
            self
               .discovery
               .find_services(name, service_id.as_deref(), address.as_deref())
               .await?;
         },
         Command::EnsureIdle => {},
         Command::Terminate => return Ok(Flow::Terminate),
         Command::SockNew { protocol } => self.open_session(protocol).await?,
         Command::SockClose { sock_uuid } => {
            let session = self.registry.resolve(&sock_uuid).await?;
            // A session that cannot take the close is still forgotten.
            let submitted = session.submit(SessionCommand::Close);
            self.registry.destroy(&sock_uuid).await?;
            submitted?;
         },
         other => match other.into_session_command() {
            Ok((id, command)) => {
               let session = self.registry.resolve(&id).await?;
               debug!("{}: queueing {}", session.id(), command.name());
               session.submit(command)?;
            },
            Err(unrouted) => {
               return Err(BridgeError::UnsupportedOperation(unrouted.name().to_owned()));
            },
         },
      }
      Ok(Flow::Continue)
   }

   async fn open_session(&self, kind: TransportKind) -> Result<()> {
      self.outputs.state(BridgeState::CreatingSocket);
      let socket = self.stack.open(kind)?;
      let id = self.registry.create(socket, kind).await?;
      info!("{id}: new {kind} socket");
      self.outputs.respond(Response::NewSocket(id));
      Ok(())
   }

   async fn teardown(&self) -> Result<()> {
      let open = self.registry.close_all().await?;
      info!("Shutting down with {open} open session(s)");
      self.registry.stop_all().await
   }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
   if let Some(message) = panic.downcast_ref::<&str>() {
      (*message).to_owned()
   } else if let Some(message) = panic.downcast_ref::<String>() {
      message.clone()
   } else {
      "unknown panic".to_owned()
   }
}
