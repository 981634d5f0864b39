//! Output and error channels.
//!
//! Every producer (dispatcher, discovery, sessions) writes through an
//! [`Outputs`] bundle. The production sinks serialise each message into a
//! complete line before queueing it, and a single writer task owns the
//! underlying stream, so concurrently produced lines never interleave.

use std::{
   io,
   marker::PhantomData,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use crossbeam::queue::SegQueue;
use log::{debug, warn};
use serde::Serialize;
use tokio::{
   io::{AsyncWrite, AsyncWriteExt},
   sync::Notify,
   task::JoinHandle,
};

use crate::{
   bridge::protocol::{BridgeState, ErrorReport, ErrorSource, Response},
   error::{BridgeError, Result},
};

/// Destination for one kind of message.
pub trait Sink<T>: Send + Sync {
   /// Queues a message. Never blocks and never fails the caller.
   fn emit(&self, message: T);
}

/// Type alias for a shared response sink.
pub type ResponseSink = Arc<dyn Sink<Response>>;

/// Type alias for a shared error sink.
pub type ErrorSink = Arc<dyn Sink<ErrorReport>>;

/// The pair of sinks handed to every component that reports results.
#[derive(Clone)]
pub struct Outputs {
   responses: ResponseSink,
   errors: ErrorSink,
}

impl Outputs {
   pub fn new(responses: ResponseSink, errors: ErrorSink) -> Self {
      Self { responses, errors }
   }

   pub fn respond(&self, response: Response) {
      self.responses.emit(response);
   }

   pub fn state(&self, state: BridgeState) {
      self.respond(Response::State(state));
   }

   pub fn report(&self, source: &ErrorSource, err: &BridgeError) {
      debug!("Reporting error from {source:?}: {err}");
      self.errors.emit(ErrorReport::new(source, err));
   }
}

struct LineQueue {
   lines: SegQueue<String>,
   notifier: Notify,
   closed: AtomicBool,
}

impl LineQueue {
   async fn drain<W>(&self, mut out: W) -> io::Result<()>
   where
      W: AsyncWrite + Unpin,
   {
      loop {
         while let Some(line) = self.lines.pop() {
            out.write_all(line.as_bytes()).await?;
            out.flush().await?;
         }
         if self.closed.load(Ordering::Acquire) {
            // Lines pushed between the last pop and the close flag.
            while let Some(line) = self.lines.pop() {
               out.write_all(line.as_bytes()).await?;
            }
            return out.flush().await;
         }
         self.notifier.notified().await;
      }
   }
}

/// Sink writing one JSON document per line to an async stream.
pub struct JsonLines<T> {
   queue: Arc<LineQueue>,
   _message: PhantomData<fn(T)>,
}

impl<T: Serialize> Sink<T> for JsonLines<T> {
   fn emit(&self, message: T) {
      if self.queue.closed.load(Ordering::Acquire) {
         debug!("Dropping message emitted after close");
         return;
      }
      match serde_json::to_string(&message) {
         Ok(mut line) => {
            line.push('\n');
            self.queue.lines.push(line);
            self.queue.notifier.notify_one();
         },
         Err(e) => warn!("Failed to serialize message: {e}"),
      }
   }
}

/// A [`JsonLines`] sink together with the task writing it out.
pub struct JsonLinesChannel<T> {
   sink: Arc<JsonLines<T>>,
   writer: JoinHandle<io::Result<()>>,
}

impl<T: Serialize + 'static> JsonLinesChannel<T> {
   /// Starts the writer task for `out`.
   pub fn spawn<W>(out: W) -> Self
   where
      W: AsyncWrite + Unpin + Send + 'static,
   {
      let queue = Arc::new(LineQueue {
         lines: SegQueue::new(),
         notifier: Notify::new(),
         closed: AtomicBool::new(false),
      });
      let writer = tokio::spawn({
         let queue = queue.clone();
         async move { queue.drain(out).await }
      });
      Self {
         sink: Arc::new(JsonLines {
            queue,
            _message: PhantomData,
         }),
         writer,
      }
   }

   pub fn sink(&self) -> Arc<dyn Sink<T>> {
      self.sink.clone()
   }

   /// Flushes every queued line and stops the writer.
   pub async fn close(self) -> Result<()> {
      self.sink.queue.closed.store(true, Ordering::Release);
      self.sink.queue.notifier.notify_one();
      match self.writer.await {
         Ok(result) => Ok(result?),
         Err(e) => Err(BridgeError::HandlerPanicked(e.to_string())),
      }
   }
}
