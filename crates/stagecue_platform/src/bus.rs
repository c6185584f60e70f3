#![forbid(unsafe_code)]

//! In-process publish/subscribe bus shared by the pipeline components.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stagecue_domain::{EventType, Platform, Priority};
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub const STREAM_DETECTED: &str = "stream:detected";
pub const CONNECTION_ERROR: &str = "connection:error";
pub const NOTIFICATION_ENQUEUED: &str = "notification:enqueued";
pub const PLATFORM_HEALTH: &str = "platform:health";

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
	StreamDetected {
		platform: Platform,
		new_stream_ids: Vec<String>,
		all_stream_ids: Vec<String>,
		detection_time: DateTime<Utc>,
		connection_count: usize,
	},
	ConnectionError {
		platform: Platform,
		key: String,
		error: String,
	},
	NotificationEnqueued {
		platform: Platform,
		event_type: EventType,
		priority: Priority,
		username: String,
	},
	PlatformHealth {
		platform: Platform,
		health: String,
		detail: Option<String>,
	},
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct Entry {
	id: u64,
	handler: Handler,
}

#[derive(Default)]
struct Inner {
	next_id: u64,
	topics: HashMap<String, Vec<Entry>>,
}

/// Cheaply cloneable bus handle.
#[derive(Clone, Default)]
pub struct EventBus {
	inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for EventBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.lock();
		f.debug_struct("EventBus")
			.field("topics", &inner.topics.keys().collect::<Vec<_>>())
			.finish()
	}
}

/// Returned by `subscribe`. Dropping it keeps the handler registered; call `unsubscribe` to detach.
#[must_use = "dropping the subscription handle keeps the handler registered; call unsubscribe() to detach"]
pub struct Subscription {
	bus: EventBus,
	topic: String,
	id: u64,
}

impl Subscription {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn unsubscribe(self) -> bool {
		self.bus.unsubscribe(&self.topic, self.id)
	}
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
	where
		F: Fn(&BusEvent) + Send + Sync + 'static,
	{
		let mut inner = self.inner.lock();
		inner.next_id += 1;
		let id = inner.next_id;
		inner.topics.entry(topic.to_string()).or_default().push(Entry {
			id,
			handler: Arc::new(handler),
		});
		Subscription {
			bus: self.clone(),
			topic: topic.to_string(),
			id,
		}
	}

	/// Forward every event on `topic` into an unbounded channel.
	pub fn subscribe_channel(&self, topic: &str) -> (Subscription, mpsc::UnboundedReceiver<BusEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let sub = self.subscribe(topic, move |ev| {
			let _ = tx.send(ev.clone());
		});
		(sub, rx)
	}

	pub fn unsubscribe(&self, topic: &str, id: u64) -> bool {
		let mut inner = self.inner.lock();
		let Some(entries) = inner.topics.get_mut(topic) else {
			return false;
		};
		let before = entries.len();
		entries.retain(|e| e.id != id);
		let removed = entries.len() != before;
		if entries.is_empty() {
			inner.topics.remove(topic);
		}
		removed
	}

	pub fn subscriber_count(&self, topic: &str) -> usize {
		self.inner.lock().topics.get(topic).map(Vec::len).unwrap_or(0)
	}

	/// Deliver `event` to every handler of `topic`. Handler panics are contained.
	pub fn emit(&self, topic: &str, event: BusEvent) {
		let handlers: Vec<Handler> = {
			let inner = self.inner.lock();
			match inner.topics.get(topic) {
				Some(entries) => entries.iter().map(|e| e.handler.clone()).collect(),
				None => return,
			}
		};

		trace!(topic, handlers = handlers.len(), "bus emit");
		for handler in handlers {
			if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
				warn!(topic, "bus handler panicked");
			}
		}
	}
}
