#![forbid(unsafe_code)]

pub mod bus;
pub mod retry;
pub mod youtube;


use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use stagecue_domain::{DisplayItem, EventType, Platform};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Shareable async callback (reconnect, cleanup, connect-on-live).
pub type AsyncAction = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into an `AsyncAction`.
pub fn async_action<F, Fut>(f: F) -> AsyncAction
where
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f()) })
}

/// Raw notification payload as produced by a platform adapter.
///
/// Every field is optional here; the notification manager validates it into a
/// `NormalizedEvent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
	/// Embedded type key (`platform:gift`); must agree with the dispatch key when set.
	#[serde(rename = "type", default)]
	pub type_key: Option<String>,
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(default)]
	pub message: Option<String>,
	#[serde(default)]
	pub gift_type: Option<String>,
	#[serde(default)]
	pub gift_count: Option<f64>,
	#[serde(default)]
	pub amount: Option<f64>,
	#[serde(default)]
	pub currency: Option<String>,
	#[serde(default)]
	pub gift_id: Option<String>,
	#[serde(default)]
	pub tier: Option<String>,
	#[serde(default)]
	pub months: Option<u32>,
	#[serde(default)]
	pub level: Option<u32>,
	#[serde(default)]
	pub viewer_count: Option<u64>,
	#[serde(default)]
	pub timestamp: Option<DateTime<Utc>>,
}

impl NotificationPayload {
	pub fn for_user(username: impl Into<String>) -> Self {
		Self {
			username: Some(username.into()),
			..Self::default()
		}
	}

	/// Gift payload with the required monetary fields.
	pub fn gift(username: impl Into<String>, gift_type: impl Into<String>, count: f64, amount: f64, currency: &str) -> Self {
		Self {
			username: Some(username.into()),
			gift_type: Some(gift_type.into()),
			gift_count: Some(count),
			amount: Some(amount),
			currency: Some(currency.to_string()),
			..Self::default()
		}
	}
}

/// Raw chat message from a platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
	pub username: String,
	#[serde(default)]
	pub user_id: Option<String>,
	pub message: String,
	#[serde(default)]
	pub id: Option<String>,
	/// First message from this user in the current stream (decided by the adapter).
	#[serde(default)]
	pub is_first_message: bool,
	#[serde(default)]
	pub timestamp: Option<DateTime<Utc>>,
}

impl ChatPayload {
	pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			user_id: None,
			message: message.into(),
			id: None,
			is_first_message: false,
			timestamp: None,
		}
	}
}

/// Adapter → runtime event message.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
	/// Normalized ingest event.
	Ingest(Box<IngestEvent>),

	/// Adapter status update.
	Status(AdapterStatus),
}

/// Platform-agnostic ingest envelope.
#[derive(Debug, Clone)]
pub struct IngestEvent {
	pub platform: Platform,

	/// Runtime receipt timestamp (not for ordering).
	pub ingest_time: SystemTime,

	pub payload: IngestPayload,
}

impl IngestEvent {
	pub fn new(platform: Platform, payload: IngestPayload) -> Self {
		Self {
			platform,
			ingest_time: SystemTime::now(),
			payload,
		}
	}
}

/// Normalized ingest payloads.
#[derive(Debug, Clone)]
pub enum IngestPayload {
	Chat(ChatPayload),

	Notification {
		event_type: EventType,
		payload: NotificationPayload,
	},

	/// Viewer count pushed by the platform (e.g. room-user updates).
	ViewerCount {
		count: i64,
	},

	StreamStatus {
		is_live: bool,
	},
}

/// Adapter status event.
#[derive(Debug, Clone)]
pub struct AdapterStatus {
	pub platform: Platform,
	pub connected: bool,
	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

pub type AdapterEventTx = mpsc::Sender<AdapterEvent>;
pub type AdapterEventRx = mpsc::Receiver<AdapterEvent>;

/// Build a status event.
pub fn status(platform: Platform, connected: bool, detail: impl Into<String>) -> AdapterEvent {
	AdapterEvent::Status(AdapterStatus {
		platform,
		connected,
		detail: detail.into(),
		last_error: None,
		time: SystemTime::now(),
	})
}

/// Build an error status event.
pub fn status_error(platform: Platform, detail: impl Into<String>, err: impl fmt::Display) -> AdapterEvent {
	AdapterEvent::Status(AdapterStatus {
		platform,
		connected: false,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		time: SystemTime::now(),
	})
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Uniform callback surface handed to every adapter on `initialize`.
#[derive(Debug, Clone)]
pub struct PlatformHandlers {
	platform: Platform,
	events_tx: AdapterEventTx,
}

impl PlatformHandlers {
	pub fn new(platform: Platform, events_tx: AdapterEventTx) -> Self {
		Self { platform, events_tx }
	}

	pub fn platform(&self) -> Platform {
		self.platform
	}

	pub async fn on_chat(&self, chat: ChatPayload) -> bool {
		self.send(IngestPayload::Chat(chat)).await
	}

	pub async fn on_gift(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Gift, payload).await
	}

	pub async fn on_follow(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Follow, payload).await
	}

	pub async fn on_raid(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Raid, payload).await
	}

	pub async fn on_paypiggy(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Paypiggy, payload).await
	}

	pub async fn on_share(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Share, payload).await
	}

	pub async fn on_envelope(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Envelope, payload).await
	}

	pub async fn on_subscriber(&self, payload: NotificationPayload) -> bool {
		self.notify(EventType::Subscriber, payload).await
	}

	pub async fn on_viewer_count(&self, count: i64) -> bool {
		self.send(IngestPayload::ViewerCount { count }).await
	}

	pub async fn on_stream_status(&self, is_live: bool) -> bool {
		self.send(IngestPayload::StreamStatus { is_live }).await
	}

	/// Report adapter connectivity (best-effort, never blocks).
	pub fn report_status(&self, connected: bool, detail: impl Into<String>) {
		let _ = self.events_tx.try_send(status(self.platform, connected, detail));
	}

	async fn notify(&self, event_type: EventType, payload: NotificationPayload) -> bool {
		self.send(IngestPayload::Notification { event_type, payload }).await
	}

	async fn send(&self, payload: IngestPayload) -> bool {
		let ev = IngestEvent::new(self.platform, payload);
		if self.events_tx.send(AdapterEvent::Ingest(Box::new(ev))).await.is_err() {
			warn!(platform = %self.platform, "runtime event channel closed; dropping platform event");
			return false;
		}
		true
	}
}

/// Viewer-count capability.
#[async_trait::async_trait]
pub trait ViewerCountSource: Send + Sync {
	/// `Ok(None)`, a negative value or an error all mean "no update this tick".
	async fn get_viewer_count(&self) -> anyhow::Result<Option<i64>>;
}

/// Trait implemented by every platform adapter.
#[async_trait::async_trait]
pub trait PlatformAdapter: Send + Sync + 'static {
	/// Which platform this adapter implements.
	fn platform(&self) -> Platform;

	/// Static enable switch of the adapter itself.
	fn is_enabled(&self) -> bool {
		true
	}

	/// Connect and start delivering events through `handlers`.
	async fn initialize(&self, handlers: PlatformHandlers) -> anyhow::Result<()>;

	/// Release connections; called once on shutdown or before a retry.
	async fn cleanup(&self) -> anyhow::Result<()>;

	/// Viewer-count capability, when the platform has one.
	fn viewer_count_source(&self) -> Option<Arc<dyn ViewerCountSource>> {
		None
	}
}

/// Minimal OBS WebSocket surface used by the pipeline.
#[async_trait::async_trait]
pub trait ObsClient: Send + Sync {
	fn is_connected(&self) -> bool;

	async fn call(&self, method: &str, params: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Method name for updating a text source.
pub const OBS_SET_INPUT_SETTINGS: &str = "SetInputSettings";

/// `SetInputSettings` parameters replacing the text of `input_name`.
pub fn set_input_text_params(input_name: &str, text: &str) -> serde_json::Value {
	serde_json::json!({
		"inputName": input_name,
		"inputSettings": { "text": text },
		"overlay": true,
	})
}

/// External display queue. Must not block the caller.
pub trait DisplayQueue: Send + Sync {
	fn add_item(&self, item: DisplayItem) -> anyhow::Result<()>;
}

/// Text-to-speech engine.
#[async_trait::async_trait]
pub trait TtsService: Send + Sync {
	async fn speak(&self, platform: Platform, text: &str) -> anyhow::Result<()>;
}

/// Context passed along with a VFX command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfxContext {
	pub platform: Platform,
	pub username: String,
	pub event_type: Option<EventType>,
}

/// Visual-effect command runner.
#[async_trait::async_trait]
pub trait VfxCommandService: Send + Sync {
	async fn execute(&self, command: &str, ctx: &VfxContext) -> anyhow::Result<()>;
}

/// Build the standard adapter event channel pair.
pub fn adapter_event_channel(capacity: usize) -> (AdapterEventTx, AdapterEventRx) {
	mpsc::channel(capacity)
}
