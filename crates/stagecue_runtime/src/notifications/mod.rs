#![forbid(unsafe_code)]

//! Notification pipeline: type check, feature gates, validation, suppression,
//! low-value gift aggregation, enqueue and side effects.

pub mod spam;
pub mod suppression;


use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use stagecue_domain::{DisplayItem, EventType, EventValidationError, NormalizedEvent, Platform, Priority};
use stagecue_platform::bus::{BusEvent, EventBus, NOTIFICATION_ENQUEUED};
use stagecue_platform::{DisplayQueue, NotificationPayload, TtsService, VfxCommandService, VfxContext};
use stagecue_util::sanitize::{sanitize_tts, user_key};
use stagecue_util::time::duration_ms;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use self::spam::{GiftDecision, PendingAggregate, SpamDetector};
use self::suppression::{SuppressionConfig, SuppressionDecision, SuppressionTracker};
use crate::config::{ConfigManager, Feature};
use crate::effects::spawn_guarded;
use crate::messages::{aggregated_gift_event, notification_event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
	Disabled,
	Suppressed,
	Aggregated,
	Duplicate,
}

impl SkipReason {
	pub fn as_str(self) -> &'static str {
		match self {
			SkipReason::Disabled => "disabled",
			SkipReason::Suppressed => "suppressed",
			SkipReason::Aggregated => "aggregated",
			SkipReason::Duplicate => "duplicate",
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NotificationError {
	#[error("Unknown notification type")]
	UnknownType { key: String },
	#[error(transparent)]
	Validation(#[from] EventValidationError),
	#[error("display queue rejected item: {0}")]
	Queue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
	Enqueued { priority: Priority },
	Skipped(SkipReason),
	Failed(NotificationError),
}

impl NotificationOutcome {
	/// Enqueued and deliberately skipped both count as success.
	pub fn is_success(&self) -> bool {
		!matches!(self, NotificationOutcome::Failed(_))
	}

	pub fn error_message(&self) -> Option<String> {
		match self {
			NotificationOutcome::Failed(e) => Some(e.to_string()),
			_ => None,
		}
	}

	fn label(&self) -> &'static str {
		match self {
			NotificationOutcome::Enqueued { .. } => "enqueued",
			NotificationOutcome::Skipped(reason) => reason.as_str(),
			NotificationOutcome::Failed(_) => "failed",
		}
	}
}

/// Collaborators of the manager. TTS and VFX are optional.
#[derive(Clone)]
pub struct NotificationDeps {
	pub config: ConfigManager,
	pub display: Arc<dyn DisplayQueue>,
	pub tts: Option<Arc<dyn TtsService>>,
	pub vfx: Option<Arc<dyn VfxCommandService>>,
	pub bus: EventBus,
}

struct Inner {
	config: ConfigManager,
	display: Arc<dyn DisplayQueue>,
	tts: Option<Arc<dyn TtsService>>,
	vfx: Option<Arc<dyn VfxCommandService>>,
	bus: EventBus,
	suppression: SuppressionTracker,
	spam: SpamDetector,
	origin: Instant,
	flusher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NotificationManager {
	inner: Arc<Inner>,
}

impl NotificationManager {
	pub fn new(deps: NotificationDeps) -> Self {
		let general = deps.config.general();
		let suppression = SuppressionTracker::new(SuppressionConfig {
			enabled: general.user_suppression_enabled,
			max_per_user: general.max_notifications_per_user,
			window: general.suppression_window,
			duration: general.suppression_duration,
			cleanup_interval: general.suppression_cleanup_interval,
		});
		let spam = SpamDetector::new(deps.config.spam());

		Self {
			inner: Arc::new(Inner {
				config: deps.config,
				display: deps.display,
				tts: deps.tts,
				vfx: deps.vfx,
				bus: deps.bus,
				suppression,
				spam,
				origin: Instant::now(),
				flusher: Mutex::new(None),
			}),
		}
	}

	/// Start the suppression sweeper and the aggregate flush timer.
	pub fn start(&self) {
		self.inner.suppression.start_sweeper();

		let spam = self.inner.spam.config();
		if !spam.enabled {
			return;
		}
		let period = (spam.detection_window / 2).max(Duration::from_millis(100));
		let weak: Weak<Inner> = Arc::downgrade(&self.inner);
		let task = tokio::spawn(async move {
			let mut tick = interval(period);
			tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
			loop {
				tick.tick().await;
				let Some(inner) = weak.upgrade() else { break };
				let due = inner.spam.take_due(Instant::now());
				inner.flush(due).await;
			}
		});
		if let Some(old) = self.inner.flusher.lock().replace(task) {
			old.abort();
		}
		debug!(flush_every_ms = duration_ms(period), "notification timers started");
	}

	/// Stop timers and flush every pending aggregate.
	pub async fn shutdown(&self) {
		self.inner.suppression.stop_sweeper();
		if let Some(task) = self.inner.flusher.lock().take() {
			task.abort();
		}
		let pending = self.inner.spam.drain();
		let flushed = self.inner.flush(pending).await;
		info!(flushed, "notification manager stopped");
	}

	pub fn suppressed_count(&self) -> u64 {
		self.inner.suppression.suppressed_count()
	}

	pub fn is_user_suppressed(&self, platform: Platform, username: &str) -> bool {
		self.inner
			.suppression
			.is_suppressed(&user_key(platform.as_str(), username), Instant::now())
	}

	pub fn pending_aggregates(&self) -> usize {
		self.inner.spam.pending_count()
	}

	pub async fn handle_notification(
		&self,
		type_key: &str,
		platform: Platform,
		payload: NotificationPayload,
	) -> NotificationOutcome {
		let outcome = self.inner.process(type_key, platform, &payload).await;
		metrics::counter!(
			"stagecue_notifications_total",
			"platform" => platform.as_str(),
			"outcome" => outcome.label()
		)
		.increment(1);
		match &outcome {
			NotificationOutcome::Failed(e) => warn!(%platform, type_key, error = %e, "notification rejected"),
			NotificationOutcome::Skipped(reason) => {
				debug!(%platform, type_key, reason = reason.as_str(), "notification skipped")
			}
			NotificationOutcome::Enqueued { priority } => debug!(%platform, type_key, ?priority, "notification enqueued"),
		}
		outcome
	}
}

fn resolve_type(type_key: &str, payload: &NotificationPayload) -> Result<EventType, NotificationError> {
	let unknown = || NotificationError::UnknownType {
		key: type_key.to_string(),
	};
	let event_type = EventType::parse_notification_key(type_key).map_err(|_| unknown())?;
	if let Some(embedded) = payload.type_key.as_deref()
		&& embedded.trim() != type_key.trim()
	{
		return Err(unknown());
	}
	Ok(event_type)
}

fn fingerprint(platform: Platform, event_type: EventType, payload: &NotificationPayload) -> String {
	let user = user_key(platform.as_str(), payload.username.as_deref().unwrap_or_default());
	let content = match payload.id.as_deref().filter(|s| !s.trim().is_empty()) {
		Some(id) => format!("id:{id}"),
		None => {
			let mut body = payload.clone();
			body.timestamp = None;
			serde_json::to_string(&body).unwrap_or_default()
		}
	};
	format!("{event_type}|{user}|{content}")
}

impl Inner {
	fn monotonic_ms(&self) -> u64 {
		duration_ms(Instant::now().duration_since(self.origin))
	}

	async fn process(&self, type_key: &str, platform: Platform, payload: &NotificationPayload) -> NotificationOutcome {
		let event_type = match resolve_type(type_key, payload) {
			Ok(t) => t,
			Err(e) => return NotificationOutcome::Failed(e),
		};

		if !self.config.is_enabled(Feature::for_event(event_type)) || !self.config.are_notifications_enabled(platform) {
			return NotificationOutcome::Skipped(SkipReason::Disabled);
		}

		let event = match notification_event(platform, event_type, payload, self.monotonic_ms()) {
			Ok(ev) => ev,
			Err(e) => return NotificationOutcome::Failed(e.into()),
		};

		let now = Instant::now();
		if self.spam.is_duplicate(&fingerprint(platform, event_type, payload), now) {
			return NotificationOutcome::Skipped(SkipReason::Duplicate);
		}

		let key = user_key(platform.as_str(), &event.username);
		if let SuppressionDecision::Suppressed { .. } = self.suppression.check(&key, now) {
			metrics::counter!("stagecue_notifications_suppressed_total", "platform" => platform.as_str()).increment(1);
			return NotificationOutcome::Skipped(SkipReason::Suppressed);
		}

		if self.spam.classify_gift(&event, now) == GiftDecision::Aggregated {
			return NotificationOutcome::Skipped(SkipReason::Aggregated);
		}

		match self.enqueue(event).await {
			Ok(priority) => NotificationOutcome::Enqueued { priority },
			Err(e) => NotificationOutcome::Failed(e),
		}
	}

	async fn enqueue(&self, event: NormalizedEvent) -> Result<Priority, NotificationError> {
		let item = DisplayItem::from_event(event.clone());
		let priority = item.priority;
		self.display
			.add_item(item)
			.map_err(|e| NotificationError::Queue(format!("{e:#}")))?;
		info!("{}", event.log_message);

		self.side_effects(&event);
		self.bus.emit(
			NOTIFICATION_ENQUEUED,
			BusEvent::NotificationEnqueued {
				platform: event.platform,
				event_type: event.event_type(),
				priority,
				username: event.username.clone(),
			},
		);
		Ok(priority)
	}

	/// TTS and VFX run on their own tasks so a stalled service never blocks dispatch.
	fn side_effects(&self, event: &NormalizedEvent) {
		let platform = event.platform;
		let tts_cfg = self.config.tts();
		if tts_cfg.enabled
			&& let Some(tts) = self.tts.clone()
			&& let Some(text) = sanitize_tts(&event.tts_message, tts_cfg.max_chars)
		{
			spawn_guarded("tts", platform, async move { tts.speak(platform, &text).await });
		}

		let event_type = event.event_type();
		if let Some(vfx) = self.vfx.clone()
			&& let Some(command) = self.config.vfx_command(event_type)
		{
			let command = command.to_string();
			let ctx = VfxContext {
				platform,
				username: event.username.clone(),
				event_type: Some(event_type),
			};
			spawn_guarded("vfx", platform, async move { vfx.execute(&command, &ctx).await });
		}
	}

	async fn flush(&self, due: Vec<PendingAggregate>) -> usize {
		let mut flushed = 0;
		for agg in due {
			let event = match aggregated_gift_event(&agg, self.monotonic_ms()) {
				Ok(ev) => ev,
				Err(e) => {
					warn!(platform = %agg.platform, user = %agg.username, error = %e, "dropping invalid gift aggregate");
					continue;
				}
			};
			match self.enqueue(event).await {
				Ok(_) => {
					flushed += 1;
					debug!(platform = %agg.platform, user = %agg.username, merged = agg.merged, "gift aggregate flushed");
				}
				Err(e) => warn!(platform = %agg.platform, error = %e, "gift aggregate not enqueued"),
			}
		}
		flushed
	}
}
