#![forbid(unsafe_code)]

mod display;
mod event;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use display::DisplayItem;
pub use event::{
	EventKind, EventTimestamp, EventValidationError, GiftDetails, NormalizedEvent, NormalizedEventBuilder, PaypiggyDetails,
};

/// Supported streaming platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
	YouTube,
	Twitch,
	TikTok,
	StreamElements,
}

impl Platform {
	/// Every platform, in registration order.
	pub const ALL: [Platform; 4] = [
		Platform::YouTube,
		Platform::Twitch,
		Platform::TikTok,
		Platform::StreamElements,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::YouTube => "youtube",
			Platform::Twitch => "twitch",
			Platform::TikTok => "tiktok",
			Platform::StreamElements => "streamelements",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("unknown event type: {0}")]
	UnknownEventType(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			"twitch" => Ok(Platform::Twitch),
			"tiktok" | "tik_tok" => Ok(Platform::TikTok),
			"streamelements" | "stream_elements" | "se" => Ok(Platform::StreamElements),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Display priority band. Higher bands win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Chat,
	Follow,
	Gift,
	Member,
	Raid,
}

impl Priority {
	/// Numeric weight handed to the display queue.
	pub const fn value(self) -> u8 {
		match self {
			Priority::Chat => 1,
			Priority::Follow => 2,
			Priority::Gift => 3,
			Priority::Member => 4,
			Priority::Raid => 5,
		}
	}
}

/// Classified event type shared by notifications and chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	Chat,
	Follow,
	Gift,
	Paypiggy,
	Raid,
	Share,
	Envelope,
	Subscriber,
	Greeting,
	Farewell,
}

impl EventType {
	/// Event types routed through the notification manager.
	pub const NOTIFICATIONS: [EventType; 7] = [
		EventType::Follow,
		EventType::Gift,
		EventType::Paypiggy,
		EventType::Raid,
		EventType::Share,
		EventType::Envelope,
		EventType::Subscriber,
	];

	pub const fn as_str(self) -> &'static str {
		match self {
			EventType::Chat => "chat",
			EventType::Follow => "follow",
			EventType::Gift => "gift",
			EventType::Paypiggy => "paypiggy",
			EventType::Raid => "raid",
			EventType::Share => "share",
			EventType::Envelope => "envelope",
			EventType::Subscriber => "subscriber",
			EventType::Greeting => "greeting",
			EventType::Farewell => "farewell",
		}
	}

	/// Canonical platform-scoped key (`platform:follow`), for notification types only.
	pub const fn notification_key(self) -> Option<&'static str> {
		match self {
			EventType::Follow => Some("platform:follow"),
			EventType::Gift => Some("platform:gift"),
			EventType::Paypiggy => Some("platform:paypiggy"),
			EventType::Raid => Some("platform:raid"),
			EventType::Share => Some("platform:share"),
			EventType::Envelope => Some("platform:envelope"),
			EventType::Subscriber => Some("platform:subscriber"),
			EventType::Chat | EventType::Greeting | EventType::Farewell => None,
		}
	}

	/// Parse a canonical `platform:<type>` notification key.
	pub fn parse_notification_key(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		Self::NOTIFICATIONS
			.into_iter()
			.find(|t| t.notification_key() == Some(s))
			.ok_or_else(|| ParseIdError::UnknownEventType(s.to_string()))
	}

	pub const fn priority(self) -> Priority {
		match self {
			EventType::Raid => Priority::Raid,
			EventType::Paypiggy | EventType::Subscriber => Priority::Member,
			EventType::Gift | EventType::Envelope => Priority::Gift,
			EventType::Follow | EventType::Share => Priority::Follow,
			EventType::Chat | EventType::Greeting | EventType::Farewell => Priority::Chat,
		}
	}
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
