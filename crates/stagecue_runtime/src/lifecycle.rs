#![forbid(unsafe_code)]

//! Platform adapter lifecycle: concurrent startup, health tracking, bounded
//! retries and reverse-order shutdown.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use stagecue_domain::Platform;
use stagecue_platform::bus::{BusEvent, CONNECTION_ERROR, EventBus, PLATFORM_HEALTH};
use stagecue_platform::retry::RetryEngine;
use stagecue_platform::{AdapterEventTx, PlatformAdapter, PlatformHandlers, ViewerCountSource, async_action};
use tracing::{debug, info, warn};

use crate::config::ConfigManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformHealth {
	Starting,
	Healthy,
	Retrying,
	Failed,
}

impl PlatformHealth {
	pub fn as_str(self) -> &'static str {
		match self {
			PlatformHealth::Starting => "starting",
			PlatformHealth::Healthy => "healthy",
			PlatformHealth::Retrying => "retrying",
			PlatformHealth::Failed => "failed",
		}
	}
}

impl fmt::Display for PlatformHealth {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformStatus {
	pub platform: Platform,
	pub health: PlatformHealth,
	pub started_at: DateTime<Utc>,
	pub connected_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	/// Initialization attempts so far, including the first one.
	pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
	pub max_init_attempts: u32,
	pub startup_wait: Duration,
}

impl LifecycleConfig {
	pub fn from_config(config: &ConfigManager) -> Self {
		let general = config.general();
		Self {
			max_init_attempts: general.max_platform_init_attempts.max(1),
			startup_wait: general.platform_startup_wait,
		}
	}
}

enum Attempt {
	Connected,
	Retry(anyhow::Error),
	GaveUp(anyhow::Error),
}

struct Inner {
	config: LifecycleConfig,
	retry: RetryEngine,
	bus: EventBus,
	events_tx: AdapterEventTx,
	adapters: Mutex<Vec<Arc<dyn PlatformAdapter>>>,
	status: Mutex<HashMap<Platform, PlatformStatus>>,
	shut_down: AtomicBool,
}

#[derive(Clone)]
pub struct PlatformLifecycleService {
	inner: Arc<Inner>,
}

fn retry_key(platform: Platform) -> String {
	format!("platform:{platform}")
}

impl PlatformLifecycleService {
	pub fn new(config: LifecycleConfig, retry: RetryEngine, bus: EventBus, events_tx: AdapterEventTx) -> Self {
		Self {
			inner: Arc::new(Inner {
				config,
				retry,
				bus,
				events_tx,
				adapters: Mutex::new(Vec::new()),
				status: Mutex::new(HashMap::new()),
				shut_down: AtomicBool::new(false),
			}),
		}
	}

	/// Start every enabled adapter concurrently.
	///
	/// Returns once all first attempts finished or `startup_wait` elapsed,
	/// whichever comes first; slow adapters keep starting in the background.
	/// The result is the number of adapters registered by this call.
	pub async fn initialize_all_platforms(&self, adapters: Vec<Arc<dyn PlatformAdapter>>) -> usize {
		let mut tasks = Vec::new();
		for adapter in adapters {
			let platform = adapter.platform();
			if !adapter.is_enabled() {
				debug!(%platform, "adapter disabled; skipping");
				continue;
			}
			{
				let mut registered = self.inner.adapters.lock();
				if registered.iter().any(|a| a.platform() == platform) {
					warn!(%platform, "adapter already registered; skipping duplicate");
					continue;
				}
				registered.push(adapter.clone());
			}

			self.inner.status.lock().insert(
				platform,
				PlatformStatus {
					platform,
					health: PlatformHealth::Starting,
					started_at: Utc::now(),
					connected_at: None,
					last_error: None,
					attempts: 0,
				},
			);
			self.inner.publish(platform, PlatformHealth::Starting, None);

			let inner = self.inner.clone();
			tasks.push(tokio::spawn(async move { inner.start(adapter).await }));
		}

		let started = tasks.len();
		if started == 0 {
			info!("no enabled platform adapters");
			return 0;
		}
		match tokio::time::timeout(self.inner.config.startup_wait, join_all(tasks)).await {
			Ok(_) => info!(started, "platform startup finished"),
			Err(_) => info!(
				started,
				wait_ms = self.inner.config.startup_wait.as_millis() as u64,
				"platform startup wait elapsed; remaining adapters continue in background"
			),
		}
		started
	}

	pub fn get_status(&self) -> Vec<PlatformStatus> {
		let status = self.inner.status.lock();
		let mut all: Vec<PlatformStatus> = status.values().cloned().collect();
		all.sort_by_key(|s| s.platform);
		all
	}

	pub fn platform_status(&self, platform: Platform) -> Option<PlatformStatus> {
		self.inner.status.lock().get(&platform).cloned()
	}

	pub fn is_platform_available(&self, platform: Platform) -> bool {
		self.inner
			.status
			.lock()
			.get(&platform)
			.is_some_and(|s| s.health == PlatformHealth::Healthy)
	}

	pub fn get_platform_connection_time(&self, platform: Platform) -> Option<DateTime<Utc>> {
		self.inner.status.lock().get(&platform).and_then(|s| s.connected_at)
	}

	/// Viewer-count capabilities of the currently healthy adapters.
	pub fn viewer_count_sources(&self) -> Vec<(Platform, Arc<dyn ViewerCountSource>)> {
		let adapters = self.inner.adapters.lock().clone();
		adapters
			.into_iter()
			.filter(|a| self.is_platform_available(a.platform()))
			.filter_map(|a| a.viewer_count_source().map(|s| (a.platform(), s)))
			.collect()
	}

	/// Clean up every adapter in reverse registration order. Idempotent.
	pub async fn shutdown(&self) {
		if self.inner.shut_down.swap(true, Ordering::SeqCst) {
			return;
		}
		let adapters: Vec<Arc<dyn PlatformAdapter>> = std::mem::take(&mut *self.inner.adapters.lock());
		for adapter in adapters.into_iter().rev() {
			let platform = adapter.platform();
			self.inner.retry.reset_retry_count(&retry_key(platform));
			match guarded_cleanup(&adapter).await {
				Ok(()) => debug!(%platform, "adapter cleaned up"),
				Err(e) => warn!(%platform, error = %e, "adapter cleanup failed during shutdown"),
			}
		}
		info!("platform lifecycle stopped");
	}
}

async fn guarded_cleanup(adapter: &Arc<dyn PlatformAdapter>) -> anyhow::Result<()> {
	match AssertUnwindSafe(adapter.cleanup()).catch_unwind().await {
		Ok(res) => res,
		Err(_) => anyhow::bail!("cleanup panicked"),
	}
}

impl Inner {
	async fn start(self: Arc<Self>, adapter: Arc<dyn PlatformAdapter>) {
		let platform = adapter.platform();
		let Attempt::Retry(error) = self.attempt(&adapter).await else {
			return;
		};

		let weak = Arc::downgrade(&self);
		let reconnect = {
			let weak: Weak<Inner> = weak.clone();
			let adapter = adapter.clone();
			async_action(move || {
				let weak = weak.clone();
				let adapter = adapter.clone();
				async move {
					let Some(inner) = weak.upgrade() else {
						return Ok(());
					};
					if inner.shut_down.load(Ordering::SeqCst) {
						return Ok(());
					}
					match inner.attempt(&adapter).await {
						Attempt::Connected => Ok(()),
						Attempt::Retry(e) => {
							if let Err(ce) = guarded_cleanup(&adapter).await {
								warn!(platform = %adapter.platform(), error = %ce, "cleanup before retry failed");
							}
							Err(e)
						}
						Attempt::GaveUp(e) => {
							inner.retry.reset_retry_count(&retry_key(adapter.platform()));
							Err(e)
						}
					}
				}
			})
		};
		let cleanup = {
			let adapter = adapter.clone();
			async_action(move || {
				let adapter = adapter.clone();
				async move { guarded_cleanup(&adapter).await }
			})
		};

		self.retry
			.handle_connection_error(&retry_key(platform), format!("{error:#}"), reconnect, Some(cleanup))
			.await;
	}

	async fn attempt(&self, adapter: &Arc<dyn PlatformAdapter>) -> Attempt {
		let platform = adapter.platform();
		let attempt = {
			let mut status = self.status.lock();
			match status.get_mut(&platform) {
				Some(s) => {
					s.attempts += 1;
					s.attempts
				}
				None => return Attempt::GaveUp(anyhow::anyhow!("platform {platform} is not registered")),
			}
		};
		debug!(%platform, attempt, "initializing adapter");

		let handlers = PlatformHandlers::new(platform, self.events_tx.clone());
		let result = match AssertUnwindSafe(adapter.initialize(handlers)).catch_unwind().await {
			Ok(res) => res,
			Err(_) => Err(anyhow::anyhow!("adapter initialize panicked")),
		};

		match result {
			Ok(()) => {
				self.update(platform, |s| {
					s.health = PlatformHealth::Healthy;
					s.connected_at = Some(Utc::now());
					s.last_error = None;
				});
				self.retry.reset_retry_count(&retry_key(platform));
				info!(%platform, attempt, "platform connected");
				self.publish(platform, PlatformHealth::Healthy, None);
				Attempt::Connected
			}
			Err(e) => {
				let message = format!("{e:#}");
				self.bus.emit(
					CONNECTION_ERROR,
					BusEvent::ConnectionError {
						platform,
						key: retry_key(platform),
						error: message.clone(),
					},
				);

				let health = if attempt >= self.config.max_init_attempts {
					PlatformHealth::Failed
				} else {
					PlatformHealth::Retrying
				};
				self.update(platform, |s| {
					s.health = health;
					s.last_error = Some(message.clone());
				});
				self.publish(platform, health, Some(message));

				if health == PlatformHealth::Failed {
					warn!(%platform, attempts = attempt, error = %e, "platform failed to start; giving up");
					if let Err(ce) = guarded_cleanup(adapter).await {
						warn!(%platform, error = %ce, "cleanup after failed start failed");
					}
					Attempt::GaveUp(e)
				} else {
					Attempt::Retry(e)
				}
			}
		}
	}

	fn update(&self, platform: Platform, f: impl FnOnce(&mut PlatformStatus)) {
		if let Some(s) = self.status.lock().get_mut(&platform) {
			f(s);
		}
	}

	fn publish(&self, platform: Platform, health: PlatformHealth, detail: Option<String>) {
		metrics::gauge!("stagecue_platform_healthy", "platform" => platform.as_str()).set(
			if health == PlatformHealth::Healthy { 1.0 } else { 0.0 },
		);
		self.bus.emit(
			PLATFORM_HEALTH,
			BusEvent::PlatformHealth {
				platform,
				health: health.as_str().to_string(),
				detail,
			},
		);
	}
}
