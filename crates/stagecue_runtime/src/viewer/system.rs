#![forbid(unsafe_code)]

//! Per-platform viewer-count polling with observer fan-out.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use stagecue_domain::Platform;
use stagecue_platform::ViewerCountSource;
use stagecue_platform::youtube::MAX_VIEWER_COUNT;
use stagecue_util::time::duration_ms;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, trace, warn};

use crate::config::ConfigManager;

/// Resolves the current viewer-count capabilities; called on every use.
pub type PlatformProvider = Arc<dyn Fn() -> HashMap<Platform, Arc<dyn ViewerCountSource>> + Send + Sync>;

pub fn platform_provider<F>(f: F) -> PlatformProvider
where
	F: Fn() -> HashMap<Platform, Arc<dyn ViewerCountSource>> + Send + Sync + 'static,
{
	Arc::new(f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerCountUpdate {
	pub platform: Platform,
	pub count: u64,
	pub previous_count: u64,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatusChange {
	pub platform: Platform,
	pub is_live: bool,
	pub was_live: bool,
	/// Count held when the transition happened.
	pub previous_count: u64,
	pub timestamp: DateTime<Utc>,
}

/// Receives viewer-count updates. Identified by `id`; a second registration
/// with the same id replaces the first.
#[async_trait::async_trait]
pub trait ViewerCountObserver: Send + Sync {
	fn id(&self) -> &str;

	async fn initialize(&self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn on_viewer_count_update(&self, update: &ViewerCountUpdate) -> anyhow::Result<()>;

	async fn on_stream_status_change(&self, _change: &StreamStatusChange) -> anyhow::Result<()> {
		Ok(())
	}

	async fn cleanup(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserverError {
	#[error("observer id must not be empty")]
	EmptyId,
}

/// Result of re-reading the provider for one platform.
#[derive(Clone)]
pub struct PlatformValidation {
	pub valid: bool,
	pub platform: Option<Arc<dyn ViewerCountSource>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerSystemConfig {
	/// `None` disables polling.
	pub polling_interval: Option<Duration>,
	/// Treat a `None` reading as "no update" instead of zero viewers.
	pub null_is_error: bool,
}

impl ViewerSystemConfig {
	pub fn from_config(config: &ConfigManager) -> Self {
		let polling_interval = match config.viewer_count_polling_interval() {
			Ok(interval) => interval,
			Err(e) => {
				error!(error = %e, "viewer count polling refused");
				None
			}
		};
		Self {
			polling_interval,
			null_is_error: config.general().viewer_count_null_is_error,
		}
	}
}

#[derive(Debug, Default, Clone, Copy)]
struct PlatformState {
	count: u64,
	live: bool,
}

struct PollHandle {
	generation: u64,
	stop: watch::Sender<bool>,
	task: JoinHandle<()>,
}

struct Inner {
	provider: PlatformProvider,
	config: ViewerSystemConfig,
	state: Mutex<HashMap<Platform, PlatformState>>,
	observers: Mutex<Vec<Arc<dyn ViewerCountObserver>>>,
	handles: Mutex<HashMap<Platform, PollHandle>>,
	polling: AtomicBool,
	next_generation: AtomicU64,
}

/// Cloneable handle; clones share state.
#[derive(Clone)]
pub struct ViewerCountSystem {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for ViewerCountSystem {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ViewerCountSystem")
			.field("config", &self.inner.config)
			.field("polling", &self.is_polling())
			.field("counts", &self.counts())
			.finish()
	}
}

impl ViewerCountSystem {
	pub fn new(provider: PlatformProvider, config: ViewerSystemConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				provider,
				config,
				state: Mutex::new(HashMap::new()),
				observers: Mutex::new(Vec::new()),
				handles: Mutex::new(HashMap::new()),
				polling: AtomicBool::new(false),
				next_generation: AtomicU64::new(0),
			}),
		}
	}

	/// Run every observer's `initialize`; failures are logged.
	pub async fn initialize(&self) {
		let observers = self.inner.observers.lock().clone();
		for obs in observers {
			guarded(obs.id(), "initialize", obs.initialize()).await;
		}
		debug!("viewer count system initialized");
	}

	pub fn add_observer(&self, observer: Arc<dyn ViewerCountObserver>) -> Result<(), ObserverError> {
		let id = observer.id().trim().to_string();
		if id.is_empty() {
			return Err(ObserverError::EmptyId);
		}

		let mut observers = self.inner.observers.lock();
		match observers.iter_mut().find(|o| o.id() == observer.id()) {
			Some(slot) => {
				*slot = observer;
				debug!(observer = %id, "viewer count observer replaced");
			}
			None => {
				observers.push(observer);
				debug!(observer = %id, "viewer count observer added");
			}
		}
		Ok(())
	}

	pub fn remove_observer(&self, id: &str) -> bool {
		let mut observers = self.inner.observers.lock();
		let before = observers.len();
		observers.retain(|o| o.id() != id);
		before != observers.len()
	}

	pub fn observer_ids(&self) -> Vec<String> {
		self.inner.observers.lock().iter().map(|o| o.id().to_string()).collect()
	}

	/// Record a live/offline transition. Repeating the current state is a no-op.
	pub async fn update_stream_status(&self, platform: Platform, is_live: bool) {
		let transition = {
			let mut state = self.inner.state.lock();
			let entry = state.entry(platform).or_default();
			if entry.live == is_live {
				None
			} else {
				let previous = entry.count;
				entry.live = is_live;
				if !is_live {
					entry.count = 0;
				}
				Some((!is_live, previous))
			}
		};
		let Some((was_live, previous_count)) = transition else {
			trace!(%platform, is_live, "stream status unchanged");
			return;
		};

		info!(%platform, is_live, "stream status changed");
		if is_live {
			if self.is_polling() {
				Inner::spawn_handle(&self.inner, platform);
			}
		} else {
			self.inner.stop_handle(platform);
			metrics::gauge!("stagecue_viewer_count", "platform" => platform.as_str()).set(0.0);
		}

		let change = StreamStatusChange {
			platform,
			is_live,
			was_live,
			previous_count,
			timestamp: Utc::now(),
		};
		let observers = self.inner.observers.lock().clone();
		for obs in observers {
			guarded(obs.id(), "status change", obs.on_stream_status_change(&change)).await;
		}
	}

	/// Start ticking every live platform. Idempotent; a no-op when disabled.
	pub fn start_polling(&self) {
		let Some(period) = self.inner.config.polling_interval else {
			info!("viewer count polling disabled");
			return;
		};
		if self.inner.polling.swap(true, Ordering::SeqCst) {
			debug!("viewer count polling already running");
			return;
		}

		let live: Vec<Platform> = {
			let state = self.inner.state.lock();
			let mut live: Vec<Platform> = state.iter().filter(|(_, s)| s.live).map(|(p, _)| *p).collect();
			live.sort();
			live
		};
		info!(interval_ms = duration_ms(period), live = live.len(), "viewer count polling started");
		for platform in live {
			if !self.validate_platform_for_polling(platform).valid {
				debug!(%platform, "live platform has no viewer count source yet");
			}
			Inner::spawn_handle(&self.inner, platform);
		}
	}

	/// Stop every handle. Ticks already fetching will not notify observers.
	pub fn stop_polling(&self) {
		if !self.inner.polling.swap(false, Ordering::SeqCst) {
			return;
		}
		let handles: Vec<(Platform, PollHandle)> = self.inner.handles.lock().drain().collect();
		for (platform, handle) in handles {
			let _ = handle.stop.send(true);
			trace!(%platform, "viewer count polling handle stopped");
		}
		info!("viewer count polling stopped");
	}

	/// Stop polling and release every observer. Idempotent.
	pub async fn cleanup(&self) {
		self.stop_polling();
		let observers = std::mem::take(&mut *self.inner.observers.lock());
		for obs in observers {
			guarded(obs.id(), "cleanup", obs.cleanup()).await;
		}
	}

	pub fn counts(&self) -> HashMap<Platform, u64> {
		self.inner.state.lock().iter().map(|(p, s)| (*p, s.count)).collect()
	}

	pub fn count(&self, platform: Platform) -> u64 {
		self.inner.state.lock().get(&platform).map_or(0, |s| s.count)
	}

	pub fn total_count(&self) -> u64 {
		self.inner.state.lock().values().map(|s| s.count).sum()
	}

	pub fn is_stream_live(&self, platform: Platform) -> bool {
		self.inner.is_live(platform)
	}

	pub fn is_polling(&self) -> bool {
		self.inner.polling.load(Ordering::SeqCst)
	}

	pub fn polling_interval(&self) -> Option<Duration> {
		self.inner.config.polling_interval
	}

	pub fn has_polling_handle(&self, platform: Platform) -> bool {
		self.inner
			.handles
			.lock()
			.get(&platform)
			.is_some_and(|h| !h.task.is_finished())
	}

	/// Re-reads the provider.
	pub fn validate_platform_for_polling(&self, platform: Platform) -> PlatformValidation {
		self.inner.validate(platform)
	}
}

impl Inner {
	fn is_live(&self, platform: Platform) -> bool {
		self.state.lock().get(&platform).is_some_and(|s| s.live)
	}

	fn is_current(&self, platform: Platform, generation: u64) -> bool {
		self.polling.load(Ordering::SeqCst)
			&& self
				.handles
				.lock()
				.get(&platform)
				.is_some_and(|h| h.generation == generation)
	}

	fn validate(&self, platform: Platform) -> PlatformValidation {
		let source = (self.provider)().remove(&platform);
		PlatformValidation {
			valid: source.is_some(),
			platform: source,
		}
	}

	fn stop_handle(&self, platform: Platform) -> bool {
		let Some(handle) = self.handles.lock().remove(&platform) else {
			return false;
		};
		let _ = handle.stop.send(true);
		debug!(%platform, "viewer count polling handle removed");
		true
	}

	fn spawn_handle(inner: &Arc<Inner>, platform: Platform) {
		let Some(period) = inner.config.polling_interval else {
			return;
		};

		let mut handles = inner.handles.lock();
		if handles.contains_key(&platform) {
			return;
		}

		let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
		let (stop, mut stop_rx) = watch::channel(false);
		let weak: Weak<Inner> = Arc::downgrade(inner);

		let task = tokio::spawn(async move {
			let mut ticker = interval(period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = stop_rx.changed() => break,
					_ = ticker.tick() => {
						let Some(inner) = weak.upgrade() else { break };
						Inner::poll_once(&inner, platform, generation).await;
					}
				}
			}
			trace!(%platform, generation, "viewer count polling task exited");
		});

		handles.insert(
			platform,
			PollHandle {
				generation,
				stop,
				task,
			},
		);
		debug!(%platform, generation, "viewer count polling handle spawned");
	}

	async fn poll_once(inner: &Arc<Inner>, platform: Platform, generation: u64) {
		if !inner.is_current(platform, generation) || !inner.is_live(platform) {
			return;
		}

		let Some(source) = inner.validate(platform).platform else {
			trace!(%platform, "no viewer count source; tick skipped");
			return;
		};

		let reading = match AssertUnwindSafe(source.get_viewer_count()).catch_unwind().await {
			Ok(Ok(reading)) => reading,
			Ok(Err(e)) => {
				debug!(%platform, error = %e, "viewer count fetch failed");
				return;
			}
			Err(_) => {
				warn!(%platform, "viewer count source panicked");
				return;
			}
		};

		let count = match reading {
			Some(n) => match u64::try_from(n) {
				Ok(valid) if valid <= MAX_VIEWER_COUNT => valid,
				_ => {
					debug!(%platform, value = n, "viewer count rejected");
					return;
				}
			},
			None if inner.config.null_is_error => {
				trace!(%platform, "no viewer count this tick");
				return;
			}
			None => 0,
		};

		if !inner.is_current(platform, generation) {
			return;
		}
		let update = {
			let mut state = inner.state.lock();
			let entry = state.entry(platform).or_default();
			if !entry.live {
				return;
			}
			let previous_count = entry.count;
			entry.count = count;
			ViewerCountUpdate {
				platform,
				count,
				previous_count,
				timestamp: Utc::now(),
			}
		};

		metrics::gauge!("stagecue_viewer_count", "platform" => platform.as_str()).set(count as f64);
		metrics::counter!("stagecue_viewer_count_updates_total", "platform" => platform.as_str()).increment(1);
		trace!(%platform, count, previous = update.previous_count, "viewer count updated");

		let observers = inner.observers.lock().clone();
		for obs in observers {
			if !inner.is_current(platform, generation) {
				debug!(%platform, "polling stopped; remaining observers skipped");
				break;
			}
			guarded(obs.id(), "update", obs.on_viewer_count_update(&update)).await;
		}
	}
}

async fn guarded<F>(observer: &str, what: &'static str, fut: F)
where
	F: Future<Output = anyhow::Result<()>>,
{
	match AssertUnwindSafe(fut).catch_unwind().await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => warn!(observer, error = %e, "observer {what} failed"),
		Err(_) => warn!(observer, "observer {what} panicked"),
	}
}
