#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EventType, NormalizedEvent, Platform, Priority};

/// Record handed to the external display queue.
///
/// Carries no duration: presentation timing is owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayItem {
	pub id: Uuid,
	#[serde(rename = "type")]
	pub kind: EventType,
	pub platform: Platform,
	pub priority: Priority,
	pub data: NormalizedEvent,
	pub created_at: DateTime<Utc>,
}

impl DisplayItem {
	/// Item for `event`, typed and prioritized by its own kind.
	pub fn from_event(event: NormalizedEvent) -> Self {
		let kind = event.event_type();
		Self::with_kind(kind, event)
	}

	/// Item displayed as `kind` (e.g. a greeting carrying a chat event).
	pub fn with_kind(kind: EventType, event: NormalizedEvent) -> Self {
		Self {
			id: Uuid::new_v4(),
			kind,
			platform: event.platform,
			priority: kind.priority(),
			data: event,
			created_at: Utc::now(),
		}
	}
}
