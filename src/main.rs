//! Bluetooth socket bridge.
//!
//! Exposes RFCOMM and L2CAP sockets and device discovery to a host process
//! through a line protocol: one JSON command per line on stdin, responses on
//! stdout, error reports on stderr.

use std::{
   fs::OpenOptions,
   io::{self, BufRead, Write},
   process::ExitCode,
   sync::Arc,
   thread,
};

use log::{error, info};
use tokio::sync::mpsc;

mod bluetooth;
mod bridge;
mod config;
mod error;
mod output;

use crate::{
   bluetooth::{bluez::BluezStack, registry::SessionRegistry},
   bridge::{
      dispatcher::{Dispatcher, channel_lines},
      protocol::{ErrorReport, Response},
   },
   config::Config,
   error::Result,
   output::{JsonLinesChannel, Outputs},
};

#[tokio::main]
async fn main() -> ExitCode {
   match run().await {
      Ok(()) => ExitCode::SUCCESS,
      Err(e) => {
         error!("Fatal: {e}");
         if let Ok(line) = serde_json::to_string(&ErrorReport::fatal(&e)) {
            let _ = writeln!(io::stderr().lock(), "{line}");
         }
         ExitCode::FAILURE
      },
   }
}

async fn run() -> Result<()> {
   let config = Config::load()?;
   init_logging(&config)?;
   info!("Starting bluebridge {}", env!("CARGO_PKG_VERSION"));

   let responses = JsonLinesChannel::<Response>::spawn(tokio::io::stdout());
   let errors = JsonLinesChannel::<ErrorReport>::spawn(tokio::io::stderr());
   let outputs = Outputs::new(responses.sink(), errors.sink());

   let served = serve(&config, outputs).await;

   // Flush both streams before any fatal report goes to stderr.
   responses.close().await?;
   errors.close().await?;
   served
}

async fn serve(config: &Config, outputs: Outputs) -> Result<()> {
   let stack = Arc::new(BluezStack::new(config).await?);
   let registry = SessionRegistry::spawn(
      outputs.clone(),
      config.session_queue_depth(),
      config.shutdown_grace(),
   );
   let lines = channel_lines(spawn_stdin_reader()?);

   Dispatcher::new(stack, registry, outputs).run(lines).await;
   info!("Bridge terminated");
   Ok(())
}

/// Logging is off unless `RUST_LOG` or a log file is configured, since
/// stderr carries error reports.
fn init_logging(config: &Config) -> Result<()> {
   let default_filter = if config.log_file.is_some() { "info" } else { "off" };
   let mut builder =
      env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
   if let Some(path) = &config.log_file {
      let file = OpenOptions::new().create(true).append(true).open(path)?;
      builder.target(env_logger::Target::Pipe(Box::new(file)));
   }
   builder.init();
   Ok(())
}

/// Reads stdin on a plain thread so shutdown never waits on a blocked read.
fn spawn_stdin_reader() -> Result<mpsc::UnboundedReceiver<io::Result<String>>> {
   let (tx, rx) = mpsc::unbounded_channel();
   thread::Builder::new()
      .name("stdin-reader".into())
      .spawn(move || {
         for line in io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
               break;
            }
         }
      })?;
   Ok(rx)
}
