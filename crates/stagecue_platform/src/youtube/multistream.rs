#![forbid(unsafe_code)]

//! YouTube multi-stream lifecycle: detect live videos, keep one chat connection
//! per selected stream, drop streams that ended.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use parking_lot::Mutex;
use stagecue_domain::Platform;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::connection::{ChatConnection, ConnectionManager, ConnectionStatus, YouTubeChatConnector};
use super::detector::StreamDetector;
use super::innertube::InnertubeClient;
use super::viewer_count::YouTubeViewerCountSource;
use crate::async_action;
use crate::bus::{self, BusEvent, EventBus};
use crate::retry::RetryEngine;

pub const DISCONNECT_REASON_ENDED: &str = "stream no longer live";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiStreamConfig {
	pub channel_handle: String,
	/// Concurrent stream cap; 0 means unlimited.
	pub max_streams: usize,
	pub stream_polling_interval: Duration,
	pub full_check_interval: Duration,
}

impl MultiStreamConfig {
	pub fn new(channel_handle: impl Into<String>) -> Self {
		Self {
			channel_handle: channel_handle.into(),
			max_streams: 2,
			stream_polling_interval: Duration::from_secs(60),
			full_check_interval: Duration::from_secs(300),
		}
	}
}

/// Retry key for a YouTube stream.
pub fn retry_key(video_id: &str) -> String {
	format!("youtube:{video_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortageState {
	pub is_in_shortage: bool,
	pub last_warning_time: Option<Instant>,
	pub last_known_available: usize,
	pub last_known_required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSkip {
	/// Another tick was still running.
	InFlight,
	/// At capacity and the full check is not due yet.
	Throttled,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
	pub skipped: Option<TickSkip>,
	pub candidates: Vec<String>,
	pub connected: Vec<String>,
	pub failed: Vec<String>,
	pub disconnected: Vec<String>,
	pub shortage_warning: bool,
	pub shortage_resolved: bool,
	/// Empty scan while connected; existing connections were kept.
	pub preserved: bool,
	pub detection_error: Option<String>,
}

impl TickReport {
	fn skipped(reason: TickSkip) -> Self {
		Self {
			skipped: Some(reason),
			..Self::default()
		}
	}
}

#[derive(Default)]
struct MonitorState {
	last_full_stream_check: Option<Instant>,
	latest_candidates: Vec<String>,
	shortage: ShortageState,
	monitoring: Option<JoinHandle<()>>,
}

struct Inner {
	config: MultiStreamConfig,
	detector: StreamDetector,
	client: Arc<dyn InnertubeClient>,
	connections: ConnectionManager,
	connector: Arc<dyn YouTubeChatConnector>,
	retry: RetryEngine,
	bus: EventBus,
	tick_lock: tokio::sync::Mutex<()>,
	state: Mutex<MonitorState>,
}

/// Cloneable handle; clones share state.
#[derive(Clone)]
pub struct MultiStreamManager {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for MultiStreamManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MultiStreamManager")
			.field("config", &self.inner.config)
			.field("connections", &self.inner.connections)
			.finish()
	}
}

impl MultiStreamManager {
	pub fn new(
		config: MultiStreamConfig,
		client: Arc<dyn InnertubeClient>,
		connector: Arc<dyn YouTubeChatConnector>,
		retry: RetryEngine,
		bus: EventBus,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				detector: StreamDetector::new(client.clone()),
				client,
				config,
				connections: ConnectionManager::new(),
				connector,
				retry,
				bus,
				tick_lock: tokio::sync::Mutex::new(()),
				state: Mutex::new(MonitorState::default()),
			}),
		}
	}

	pub fn config(&self) -> &MultiStreamConfig {
		&self.inner.config
	}

	pub fn connections(&self) -> &ConnectionManager {
		&self.inner.connections
	}

	pub fn shortage_state(&self) -> ShortageState {
		self.inner.state.lock().shortage.clone()
	}

	pub fn latest_candidates(&self) -> Vec<String> {
		self.inner.state.lock().latest_candidates.clone()
	}

	pub fn last_full_stream_check(&self) -> Option<Instant> {
		self.inner.state.lock().last_full_stream_check
	}

	pub fn is_monitoring(&self) -> bool {
		self.inner
			.state
			.lock()
			.monitoring
			.as_ref()
			.is_some_and(|h| !h.is_finished())
	}

	/// Viewer-count capability summing over active streams.
	pub fn viewer_count_source(&self) -> YouTubeViewerCountSource {
		YouTubeViewerCountSource::new(self.inner.client.clone(), self.inner.connections.clone())
	}

	/// Run one detection cycle.
	///
	/// With `throw_on_error` a detection failure is returned; otherwise it is
	/// logged and recorded in the report.
	pub async fn tick(&self, throw_on_error: bool) -> anyhow::Result<TickReport> {
		Inner::tick(&self.inner, throw_on_error).await
	}

	/// Initial tick (errors surface) then periodic ticks.
	pub async fn start_monitoring(&self) -> anyhow::Result<()> {
		if self.is_monitoring() {
			debug!("youtube monitoring already running");
			return Ok(());
		}

		self.tick(true).await.context("initial youtube stream detection")?;

		let period = self.inner.config.stream_polling_interval.max(Duration::from_millis(1));
		let weak: Weak<Inner> = Arc::downgrade(&self.inner);
		let task = tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				let Some(inner) = weak.upgrade() else {
					break;
				};
				if let Err(e) = Inner::tick(&inner, false).await {
					warn!(error = %e, "youtube monitoring tick failed");
				}
			}
		});

		let mut state = self.inner.state.lock();
		if let Some(prev) = state.monitoring.replace(task) {
			prev.abort();
		}
		info!(
			channel = %self.inner.config.channel_handle,
			interval_ms = period.as_millis() as u64,
			"youtube monitoring started"
		);
		Ok(())
	}

	pub fn stop_monitoring(&self) {
		if let Some(task) = self.inner.state.lock().monitoring.take() {
			task.abort();
			info!("youtube monitoring stopped");
		}
	}

	/// Terminate every connection and forget its retry state.
	pub async fn disconnect_all(&self, reason: &str) -> usize {
		let ids = self.inner.connections.get_all_video_ids();
		let mut n = 0;
		for id in ids {
			self.inner.retry.reset_retry_count(&retry_key(&id));
			if self.inner.connections.terminate(&id, reason).await {
				n += 1;
			}
		}
		n
	}

	pub async fn shutdown(&self) {
		self.stop_monitoring();
		let n = self.disconnect_all("shutdown").await;
		self.inner.state.lock().latest_candidates.clear();
		info!(disconnected = n, "youtube multi-stream manager shut down");
	}
}

/// Keep existing ids first, then fill with new ids in candidate order.
///
/// Existing connections are never dropped to make room; `max == 0` disables
/// truncation.
pub(crate) fn select_streams(candidates: &[String], existing: &HashSet<String>, max: usize) -> Vec<String> {
	let kept: Vec<String> = candidates.iter().filter(|id| existing.contains(*id)).cloned().collect();
	let room = if max == 0 {
		usize::MAX
	} else {
		max.saturating_sub(kept.len())
	};
	let fresh = candidates.iter().filter(|id| !existing.contains(*id)).take(room).cloned();
	kept.into_iter().chain(fresh).collect()
}

impl Inner {
	async fn tick(self: &Arc<Self>, throw_on_error: bool) -> anyhow::Result<TickReport> {
		let Ok(_guard) = self.tick_lock.try_lock() else {
			debug!("youtube tick already in flight; skipping");
			return Ok(TickReport::skipped(TickSkip::InFlight));
		};

		let cfg = &self.config;
		let now = Instant::now();
		let connection_count = self.connections.get_connection_count();
		let throttled =
			cfg.max_streams > 0 && connection_count >= cfg.max_streams && !self.connections.get_active_video_ids().is_empty();

		if throttled {
			let due = self
				.state
				.lock()
				.last_full_stream_check
				.is_none_or(|t| now.saturating_duration_since(t) >= cfg.full_check_interval);
			if !due {
				debug!(connection_count, max_streams = cfg.max_streams, "at capacity; full scan not due");
				return Ok(TickReport::skipped(TickSkip::Throttled));
			}
		}

		let mut report = TickReport::default();
		let candidates = match self.detector.get_live_video_ids(&cfg.channel_handle).await {
			Ok(ids) => ids,
			Err(e) => {
				if throw_on_error {
					return Err(e.context("youtube stream detection failed"));
				}
				warn!(channel = %cfg.channel_handle, error = %e, "youtube stream detection failed");
				report.detection_error = Some(format!("{e:#}"));
				return Ok(report);
			}
		};

		{
			let mut state = self.state.lock();
			state.last_full_stream_check = Some(now);
		}
		report.candidates = candidates.clone();

		let known: HashSet<String> = self.connections.get_all_video_ids().into_iter().collect();
		if candidates.is_empty() && !known.is_empty() {
			warn!(
				connections = known.len(),
				"detection returned no live streams; keeping existing connections"
			);
			report.preserved = true;
			return Ok(report);
		}

		self.update_shortage(&candidates, now, &mut report);

		let selected = select_streams(&candidates, &known, cfg.max_streams);
		self.state.lock().latest_candidates = selected.clone();

		let candidate_set: HashSet<&String> = candidates.iter().collect();
		for id in known.iter().filter(|id| !candidate_set.contains(id)) {
			self.retry.reset_retry_count(&retry_key(id));
			if self.connections.terminate(id, DISCONNECT_REASON_ENDED).await {
				report.disconnected.push(id.clone());
			}
		}

		let new_ids: Vec<String> = selected.iter().filter(|id| !known.contains(*id)).cloned().collect();
		for id in &new_ids {
			match self.connect_stream(id).await {
				Ok(()) => report.connected.push(id.clone()),
				Err(e) => {
					report.failed.push(id.clone());
					self.handle_connect_failure(id, e).await;
				}
			}
		}

		// only streams whose chat actually connected count as detected
		if !report.connected.is_empty() {
			let connection_count = self.connections.get_connection_count();
			info!(
				new = ?report.connected,
				all = ?selected,
				connection_count,
				"youtube streams detected"
			);
			self.bus.emit(
				bus::STREAM_DETECTED,
				BusEvent::StreamDetected {
					platform: Platform::YouTube,
					new_stream_ids: report.connected.clone(),
					all_stream_ids: selected,
					detection_time: Utc::now(),
					connection_count,
				},
			);
		}

		Ok(report)
	}

	fn update_shortage(&self, candidates: &[String], now: Instant, report: &mut TickReport) {
		let required = self.config.max_streams;
		if required == 0 {
			return;
		}
		let available = candidates.len();
		let mut state = self.state.lock();
		let shortage = &mut state.shortage;

		if available < required {
			let due = shortage
				.last_warning_time
				.is_none_or(|t| now.saturating_duration_since(t) >= self.config.full_check_interval);
			if !shortage.is_in_shortage || due {
				warn!(available, required, "fewer live youtube streams than max_streams");
				shortage.last_warning_time = Some(now);
				report.shortage_warning = true;
			}
			shortage.is_in_shortage = true;
			shortage.last_known_available = available;
			shortage.last_known_required = required;
		} else if shortage.is_in_shortage {
			info!(available, required, "youtube stream shortage resolved");
			*shortage = ShortageState {
				last_known_available: available,
				last_known_required: required,
				..ShortageState::default()
			};
			report.shortage_resolved = true;
		}
	}

	fn is_desired(&self, video_id: &str) -> bool {
		self.state.lock().latest_candidates.iter().any(|id| id == video_id)
	}

	async fn connect_stream(&self, video_id: &str) -> anyhow::Result<()> {
		if self.connections.status_of(video_id) == Some(ConnectionStatus::Broken) {
			self.connections.terminate(video_id, "reconnecting").await;
		}

		let attempt = self.connections.register_pending(video_id);
		let reporter = self.connections.reporter(video_id, attempt);
		match self.connector.connect(video_id, reporter.clone()).await {
			Ok(conn) => {
				let conn: Arc<dyn ChatConnection> = Arc::from(conn);
				if let Err(conn) = self.connections.attach(video_id, attempt, conn) {
					debug!(video_id, "connection superseded before attach; closing");
					if let Err(e) = conn.disconnect("superseded").await {
						warn!(video_id, error = %e, "closing superseded chat failed");
					}
					return Ok(());
				}
				self.retry.reset_retry_count(&retry_key(video_id));
				info!(video_id, "youtube chat connected");
				Ok(())
			}
			Err(e) => {
				reporter.broken(format!("{e:#}"));
				Err(e.context(format!("connect youtube chat {video_id}")))
			}
		}
	}

	async fn handle_connect_failure(self: &Arc<Self>, video_id: &str, error: anyhow::Error) {
		let key = retry_key(video_id);
		warn!(video_id, error = %format!("{error:#}"), "youtube chat connection failed");
		self.bus.emit(
			bus::CONNECTION_ERROR,
			BusEvent::ConnectionError {
				platform: Platform::YouTube,
				key: key.clone(),
				error: format!("{error:#}"),
			},
		);

		let weak = Arc::downgrade(self);
		let id = video_id.to_string();
		let reconnect = async_action(move || {
			let weak = weak.clone();
			let id = id.clone();
			async move {
				let Some(inner) = weak.upgrade() else {
					return Ok(());
				};
				if !inner.is_desired(&id) {
					debug!(video_id = %id, "stream no longer selected; dropping reconnect");
					return Ok(());
				}
				inner.connect_stream(&id).await
			}
		});

		self.retry
			.handle_connection_error(&key, format!("{error:#}"), reconnect, None)
			.await;
	}
}
