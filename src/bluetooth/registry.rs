//! Session registry.
//!
//! The registry is an actor: it alone owns the id → session map and the set
//! of running session tasks. Every insertion, lookup and removal is a request
//! over its inbox, so concurrent creation from the dispatcher and from
//! sessions accepting peers is serialised without a shared lock.

use std::{collections::HashMap, time::Duration};

use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinSet,
   time,
};

use crate::{
   bluetooth::{
      session::{Session, SessionHandle, SessionId},
      stack::{SocketHandle, TransportKind},
   },
   error::{BridgeError, Result},
   output::Outputs,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

enum RegistryCommand<S> {
   Create {
      socket: S,
      kind: TransportKind,
      reply: oneshot::Sender<Result<SessionId>>,
   },
   Resolve {
      id: SessionId,
      reply: oneshot::Sender<Option<SessionHandle>>,
   },
   Destroy {
      id: SessionId,
      reply: oneshot::Sender<Option<SessionHandle>>,
   },
   CloseAll(oneshot::Sender<usize>),
   StopAll(oneshot::Sender<()>),
}

/// Handle to the registry actor. Cheap to clone.
pub struct SessionRegistry<S> {
   inbox: mpsc::Sender<RegistryCommand<S>>,
}

impl<S> Clone for SessionRegistry<S> {
   fn clone(&self) -> Self {
      Self {
         inbox: self.inbox.clone(),
      }
   }
}

impl<S: SocketHandle> SessionRegistry<S> {
   /// Starts the registry actor.
   pub fn spawn(outputs: Outputs, queue_depth: usize, grace: Duration) -> Self {
      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (shutdown_tx, _) = watch::channel(false);
      let actor = RegistryActor {
         inbox: rx,
         loopback: tx.downgrade(),
         outputs,
         queue_depth: queue_depth.max(1),
         grace,
         sessions: HashMap::new(),
         tasks: JoinSet::new(),
         shutdown: shutdown_tx,
      };
      tokio::spawn(actor.run());
      Self { inbox: tx }
   }

   async fn request<T>(
      &self,
      command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand<S>,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| BridgeError::RegistryShutdown)?;
      rx.await.map_err(|_| BridgeError::RegistryShutdown)
   }

   /// Wraps `socket` in a new session and returns its fresh identifier.
   pub async fn create(&self, socket: S, kind: TransportKind) -> Result<SessionId> {
      self
         .request(|reply| RegistryCommand::Create {
            socket,
            kind,
            reply,
         })
         .await?
   }

   pub async fn resolve(&self, id: &SessionId) -> Result<SessionHandle> {
      self
         .request(|reply| RegistryCommand::Resolve {
            id: id.clone(),
            reply,
         })
         .await?
         .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
   }

   /// Removes the mapping. The session finishes its queued commands, then
   /// closes its socket if still open.
   pub async fn destroy(&self, id: &SessionId) -> Result<()> {
      self
         .request(|reply| RegistryCommand::Destroy {
            id: id.clone(),
            reply,
         })
         .await?
         .map(|_| ())
         .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
   }

   /// Signals every session to abandon its work and close its socket.
   /// Returns the number of live sessions signalled.
   pub async fn close_all(&self) -> Result<usize> {
      self.request(RegistryCommand::CloseAll).await
   }

   /// Waits for every session task to finish, aborting those that outlive
   /// the grace period, and forgets all mappings.
   pub async fn stop_all(&self) -> Result<()> {
      self.request(RegistryCommand::StopAll).await
   }
}

struct RegistryActor<S> {
   inbox: mpsc::Receiver<RegistryCommand<S>>,
   loopback: mpsc::WeakSender<RegistryCommand<S>>,
   outputs: Outputs,
   queue_depth: usize,
   grace: Duration,

   // State
   sessions: HashMap<SessionId, SessionHandle>,
   tasks: JoinSet<()>,
   shutdown: watch::Sender<bool>,
}

impl<S: SocketHandle> RegistryActor<S> {
   async fn run(mut self) {
      debug!("Session registry starting up");
      loop {
         select! {
            cmd = self.inbox.recv() => {
               let Some(cmd) = cmd else {
                  debug!("Session registry shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            }
            Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
               if let Err(e) = joined
                  && e.is_panic()
               {
                  error!("Session task panicked: {e}");
               }
            }
         }
      }
      self.stop_all().await;
   }

   async fn handle_command(&mut self, cmd: RegistryCommand<S>) {
      match cmd {
         RegistryCommand::Create {
            socket,
            kind,
            reply,
         } => {
            let result = self.create(socket, kind);
            let _ = reply.send(result);
         },
         RegistryCommand::Resolve { id, reply } => {
            let _ = reply.send(self.sessions.get(&id).cloned());
         },
         RegistryCommand::Destroy { id, reply } => {
            let removed = self.sessions.remove(&id);
            if removed.is_some() {
               debug!("{id}: removed from registry");
            }
            let _ = reply.send(removed);
         },
         RegistryCommand::CloseAll(reply) => {
            info!("Closing {} session(s)", self.sessions.len());
            self.shutdown.send_replace(true);
            let _ = reply.send(self.sessions.len());
         },
         RegistryCommand::StopAll(reply) => {
            self.stop_all().await;
            let _ = reply.send(());
         },
      }
   }

   fn create(&mut self, socket: S, kind: TransportKind) -> Result<SessionId> {
      let Some(registry) = self.loopback.upgrade() else {
         return Err(BridgeError::RegistryShutdown);
      };

      let mut id = SessionId::generate();
      while self.sessions.contains_key(&id) {
         warn!("Session id collision on {id}, regenerating");
         id = SessionId::generate();
      }

      let (session, handle, inbox) = Session::new(
         id.clone(),
         kind,
         socket,
         SessionRegistry { inbox: registry },
         self.outputs.clone(),
         self.queue_depth,
      );
      self.tasks.spawn(session.run(inbox, self.shutdown.subscribe()));
      self.sessions.insert(id.clone(), handle);
      debug!("{id}: registered {kind} session");
      Ok(id)
   }

   async fn stop_all(&mut self) {
      self.shutdown.send_replace(true);
      self.sessions.clear();

      let tasks = &mut self.tasks;
      let drained = time::timeout(self.grace, async {
         while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined
               && e.is_panic()
            {
               error!("Session task panicked: {e}");
            }
         }
      })
      .await;

      if drained.is_err() {
         warn!(
            "{} session(s) still running after {:?}, aborting",
            self.tasks.len(),
            self.grace
         );
         self.tasks.abort_all();
         while self.tasks.join_next().await.is_some() {}
      }
   }
}
