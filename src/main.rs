mod cache;
mod config;
mod control;
mod error;
mod event;
mod fetch;
mod http;
mod logging;
mod notify;
mod queue;
mod strategy;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::cache::{CacheStorage, NoopStorage, SqliteStorage};
use crate::control::{ControlEnvelope, ControlMessage};
use crate::event::{Event, EventHandler};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::http::{Method, Request};
use crate::queue::{OfflineQueue, ReplayHandler};
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "qrworker")]
#[command(about = "Request-intercepting cache worker with an offline action queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/qrworker/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install, activate, then serve JSON control messages from stdin
  Serve,
  /// Pre-cache assets and activate this version, then exit
  Install,
  /// Send one request through the interceptor
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    document: bool,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// Defer a QR generation until connectivity returns
  Enqueue {
    text: String,
    #[arg(long, default_value_t = 300)]
    size: u32,
  },
  /// Replay every pending queued action
  Drain,
  /// List pending queued actions
  Queue,
  /// Report total cached bytes
  Size,
  /// Delete every cache generation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let worker = Arc::new(build_worker(&config)?);

  match args.command {
    Command::Serve => serve(worker, &config).await?,
    Command::Install => {
      let report = worker.install().await?;
      worker.activate()?;
      println!(
        "cached {} static and {} dynamic assets ({} skipped)",
        report.static_assets.cached,
        report.dynamic_assets.cached,
        report.static_assets.skipped.len() + report.dynamic_assets.skipped.len()
      );
    }
    Command::Fetch {
      url,
      document,
      method,
    } => {
      let url = config.resolve(&url)?;
      let request = if document {
        Request::document(url)
      } else {
        Request::get(url)
      }
      .with_method(Method::parse(&method));

      worker.resume();
      let served = worker.intercept(&request).await?;
      println!(
        "{} {:?} {} bytes",
        served.response.status,
        served.source,
        served.response.body.len()
      );
      worker.settle().await;
    }
    Command::Enqueue { text, size } => {
      let id = worker.queue().enqueue(json!({
        "type": "generate",
        "text": text,
        "width": size,
        "height": size,
      }))?;
      println!("{}", id);
    }
    Command::Drain => {
      let report = worker.drain().await?;
      println!(
        "{} completed, {} still pending",
        report.completed.len(),
        report.failed.len()
      );
    }
    Command::Queue => {
      for item in worker.queue().pending()? {
        print_json(&item);
      }
    }
    Command::Size => {
      if let Some(reply) = worker.handle_message(ControlMessage::GetCacheSize) {
        print_json(&reply);
      }
    }
    Command::Clear => {
      if let Some(reply) = worker.handle_message(ControlMessage::ClearCache) {
        print_json(&reply);
      }
    }
  }

  Ok(())
}

fn build_worker(config: &config::Config) -> Result<Worker> {
  let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
    Arc::new(SqliteStorage::open_at(&config.cache_db_path()?)?)
  } else {
    Arc::new(NoopStorage)
  };
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout())?);
  let queue = OfflineQueue::open(&config.queue_db_path()?)?;
  let replayer = ReplayHandler::new(Arc::clone(&fetcher), config.replay_url()?);

  Ok(Worker::new(
    config.worker_options()?,
    storage,
    fetcher,
    queue,
    Box::new(replayer),
  ))
}

/// Run the worker as a long-lived service.
///
/// Each stdin line is a JSON message: the control types, plus `{"type": "ONLINE"}`
/// for a connectivity signal and `{"type": "PUSH", "data": ...}` for a push wake.
/// Replies and broadcast notifications are written to stdout, one JSON per line.
async fn serve(worker: Arc<Worker>, config: &config::Config) -> Result<()> {
  let notifications = worker.broadcaster().subscribe();
  tokio::spawn(print_notifications(notifications));

  worker.install().await?;
  if worker.is_waiting_skipped() {
    worker.activate()?;
  }

  let events = EventHandler::new(config.drain_interval());
  let tx = events.sender();

  tokio::spawn(read_control_lines(tx.clone()));

  let shutdown_tx = tx.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      let _ = shutdown_tx.send(Event::Shutdown);
    }
  });

  // Replay anything left over from the previous run
  let _ = tx.send(Event::Online);

  worker.run(events).await;
  Ok(())
}

async fn read_control_lines(tx: mpsc::UnboundedSender<Event>) {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  loop {
    let line = match lines.next_line().await {
      Ok(Some(line)) => line,
      Ok(None) => break,
      Err(e) => {
        warn!(error = %e, "Failed to read control channel");
        break;
      }
    };
    if line.trim().is_empty() {
      continue;
    }

    let value: Value = match serde_json::from_str(&line) {
      Ok(v) => v,
      Err(e) => {
        warn!(error = %e, "Ignoring malformed control line");
        continue;
      }
    };

    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    let event = match kind.as_deref() {
      Some("ONLINE") => Event::Online,
      Some("PUSH") => Event::Push(value.get("data").cloned().unwrap_or(Value::Null)),
      _ => match ControlMessage::from_value(value) {
        Some(message) => {
          let (envelope, reply) = ControlEnvelope::request(message);
          tokio::spawn(async move {
            if let Ok(reply) = reply.await {
              print_json(&reply);
            }
          });
          Event::Control(envelope)
        }
        None => {
          debug!("Ignoring unknown control message");
          continue;
        }
      },
    };

    if tx.send(event).is_err() {
      return;
    }
  }

  // stdin closed
  let _ = tx.send(Event::Shutdown);
}

async fn print_notifications(mut rx: broadcast::Receiver<notify::ClientNotification>) {
  loop {
    match rx.recv().await {
      Ok(notification) => print_json(&notification),
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!(skipped, "Notification consumer lagged");
      }
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
}

fn print_json<T: Serialize>(value: &T) {
  match serde_json::to_string(value) {
    Ok(line) => println!("{}", line),
    Err(e) => warn!(error = %e, "Failed to encode output"),
  }
}
