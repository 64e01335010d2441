//! Lifecycle controller: install, activate, intercept, and the event loop.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Generations, RequestKey, ServedResponse};
use crate::control::{ControlEnvelope, ControlMessage, ControlReply};
use crate::error::Result;
use crate::event::{Event, EventHandler};
use crate::fetch::Fetcher;
use crate::http::Request;
use crate::notify::{Broadcaster, ClientNotification};
use crate::queue::{ActionHandler, DrainReport, OfflineQueue};
use crate::strategy::{Executor, Strategy, StrategyRules};

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  /// Controlling consumers; requests are intercepted
  Active,
}

/// Resolved settings for one worker version.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub generations: Generations,
  pub static_assets: Vec<Url>,
  pub dynamic_assets: Vec<Url>,
  pub offline_page: Url,
  pub rules: StrategyRules,
}

/// Result of pre-populating one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
  pub cached: usize,
  pub skipped: Vec<Url>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub static_assets: PrefetchReport,
  pub dynamic_assets: PrefetchReport,
}

/// Notification shown in response to a push wake signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushNotification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub data: Value,
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Long-lived interception service.
///
/// Owns the cache registry and the offline queue; consumers talk to it through
/// [`Event`]s and hear back through the [`Broadcaster`].
pub struct Worker {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  executor: Executor,
  queue: OfflineQueue,
  replayer: Box<dyn ActionHandler>,
  broadcaster: Broadcaster,
  options: WorkerOptions,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
  draining: AtomicBool,
}

impl Worker {
  pub fn new(
    options: WorkerOptions,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    queue: OfflineQueue,
    replayer: Box<dyn ActionHandler>,
  ) -> Self {
    let executor = Executor::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      options.generations.clone(),
    )
    .with_offline_page(&Request::document(options.offline_page.clone()));

    Self {
      storage,
      fetcher,
      executor,
      queue,
      replayer,
      broadcaster: Broadcaster::default(),
      options,
      state: Mutex::new(LifecycleState::Installing),
      skip_waiting: AtomicBool::new(false),
      draining: AtomicBool::new(false),
    }
  }

  pub fn broadcaster(&self) -> &Broadcaster {
    &self.broadcaster
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Installing)
  }

  /// Whether this version may activate without waiting for old consumers.
  pub fn is_waiting_skipped(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  fn set_state(&self, next: LifecycleState) {
    if let Ok(mut state) = self.state.lock() {
      let from = *state;
      info!(?from, to = ?next, "Lifecycle transition");
      *state = next;
    }
  }

  /// Pre-populate the static and dynamic generations.
  ///
  /// Every asset is best-effort: a failed fetch is logged and skipped.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_state(LifecycleState::Installing);
    info!(version = %self.options.generations.static_name, "Installing worker");

    let generations = &self.options.generations;
    self.storage.open(&generations.static_name)?;
    self.storage.open(&generations.dynamic_name)?;

    let (static_assets, dynamic_assets) = futures::join!(
      self.prefetch(&generations.static_name, &self.options.static_assets),
      self.prefetch(&generations.dynamic_name, &self.options.dynamic_assets),
    );

    self.set_state(LifecycleState::Installed);
    self.skip_waiting.store(true, Ordering::SeqCst);
    info!(
      static_cached = static_assets.cached,
      dynamic_cached = dynamic_assets.cached,
      "Installation completed"
    );

    Ok(InstallReport {
      static_assets,
      dynamic_assets,
    })
  }

  async fn prefetch(&self, generation: &str, assets: &[Url]) -> PrefetchReport {
    let results = join_all(assets.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let outcome = match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => match RequestKey::for_request(&request) {
          Some(key) => self.storage.put(generation, &key, &response).map_err(|e| e.to_string()),
          None => Ok(()),
        },
        Ok(response) => Err(format!("status {}", response.status)),
        Err(e) => Err(e.to_string()),
      };
      (url, outcome)
    }))
    .await;

    let mut report = PrefetchReport::default();
    for (url, outcome) in results {
      match outcome {
        Ok(()) => report.cached += 1,
        Err(e) => {
          warn!(%url, %generation, error = %e, "Failed to pre-cache asset");
          report.skipped.push(url.clone());
        }
      }
    }
    report
  }

  /// Drop stale generations, take control, and announce the new version.
  ///
  /// Returns the names of the generations that were deleted.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.set_state(LifecycleState::Activating);

    let deleted = self
      .storage
      .delete_all_except(&self.options.generations.current())?;
    for name in &deleted {
      info!(generation = %name, "Deleted old cache generation");
    }

    self.set_state(LifecycleState::Active);
    info!(consumers = self.broadcaster.consumers(), "Claimed consumers");
    self.broadcaster.send(ClientNotification::Activated {
      message: "Service worker updated".to_string(),
    });
    Ok(deleted)
  }

  /// Take control again after a process restart, without re-installing or
  /// cleaning up. Only meaningful for a version that was activated before.
  pub fn resume(&self) {
    self.set_state(LifecycleState::Active);
  }

  /// Handle an outbound request. Until activation nothing is intercepted.
  pub async fn intercept(&self, request: &Request) -> Result<ServedResponse> {
    let strategy = if self.state() == LifecycleState::Active {
      self.options.rules.classify(&request.url, &request.method)
    } else {
      Strategy::Skip
    };
    debug!(url = %request.url, ?strategy, "intercept");
    self.executor.execute(strategy, request).await
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) {
    self.executor.settle().await;
  }

  /// Dispatch a control message. Unknown messages never reach here.
  pub fn handle_message(&self, message: ControlMessage) -> Option<ControlReply> {
    match message {
      ControlMessage::SkipWaiting => {
        self.skip_waiting.store(true, Ordering::SeqCst);
        None
      }
      ControlMessage::GetCacheSize => match self.storage.total_size() {
        Ok(size) => Some(ControlReply::Size { size }),
        Err(e) => {
          warn!(error = %e, "Failed to compute cache size");
          None
        }
      },
      ControlMessage::ClearCache => {
        let success = match self.storage.clear_all() {
          Ok(removed) => {
            info!(removed, "Cleared all cache generations");
            true
          }
          Err(e) => {
            warn!(error = %e, "Failed to clear caches");
            false
          }
        };
        Some(ControlReply::Success { success })
      }
      ControlMessage::AddToQrQueue { data } => {
        let success = match self.queue.enqueue(data) {
          Ok(_) => true,
          Err(e) => {
            warn!(error = %e, "Failed to queue action");
            false
          }
        };
        Some(ControlReply::Success { success })
      }
    }
  }

  /// Replay every pending queued action once.
  pub async fn drain(&self) -> Result<DrainReport> {
    self.queue.drain_all(self.replayer.as_ref(), &self.broadcaster).await
  }

  /// Build and show the notification for a push wake signal. Queue state is untouched.
  pub fn on_push(&self, data: Value) -> PushNotification {
    let notification = PushNotification {
      title: "QR Generator Pro".to_string(),
      body: "Your QR code is ready!".to_string(),
      icon: "/favicon.svg".to_string(),
      badge: "/favicon.svg".to_string(),
      tag: "qr-notification".to_string(),
      data,
      actions: vec![
        NotificationAction {
          action: "view".to_string(),
          title: "View".to_string(),
        },
        NotificationAction {
          action: "dismiss".to_string(),
          title: "Close".to_string(),
        },
      ],
    };
    info!(title = %notification.title, tag = %notification.tag, "Push notification");
    notification
  }

  /// Process events until `Shutdown`.
  ///
  /// Drains run as background tasks so control messages (including new
  /// enqueues) are served while a replay is in flight. A drain requested while
  /// another is running is skipped.
  pub async fn run(self: Arc<Self>, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      match event {
        Event::Control(envelope) => self.dispatch(envelope),
        Event::Online | Event::Tick => self.spawn_drain(),
        Event::Push(data) => {
          self.on_push(data);
        }
        Event::Shutdown => break,
      }
    }
    self.settle().await;
    info!("Worker stopped");
  }

  fn dispatch(&self, envelope: ControlEnvelope) {
    if let Some(reply) = self.handle_message(envelope.message.clone()) {
      envelope.respond(reply);
    }
  }

  fn spawn_drain(self: &Arc<Self>) {
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("Drain already in progress");
      return;
    }
    let worker = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = worker.drain().await {
        warn!(error = %e, "Failed to drain offline queue");
      }
      worker.draining.store(false, Ordering::SeqCst);
    });
  }
}
