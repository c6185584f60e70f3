#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EventType, Platform};

/// Errors raised while building a `NormalizedEvent`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventValidationError {
	#[error("missing required field `{field}`")]
	MissingField { field: &'static str },
	#[error("invalid field `{field}`: {reason}")]
	InvalidField { field: &'static str, reason: String },
}

/// Event time: monotonic milliseconds plus the wall-clock ISO-8601 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTimestamp {
	pub monotonic_ms: u64,
	pub iso: String,
}

impl EventTimestamp {
	pub fn new(monotonic_ms: u64, at: DateTime<Utc>) -> Self {
		Self {
			monotonic_ms,
			iso: at.to_rfc3339_opts(SecondsFormat::Millis, true),
		}
	}

	/// Parse the ISO string back into a UTC instant.
	pub fn parse_iso(&self) -> Result<DateTime<Utc>, EventValidationError> {
		DateTime::parse_from_rfc3339(&self.iso)
			.map(|d| d.with_timezone(&Utc))
			.map_err(|e| EventValidationError::InvalidField {
				field: "timestamp",
				reason: e.to_string(),
			})
	}
}

/// Monetary details shared by gifts and envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftDetails {
	pub gift_type: String,
	pub gift_count: u32,
	pub amount: f64,
	pub currency: String,
	#[serde(default)]
	pub gift_id: Option<String>,
	/// Number of low-value gifts merged into this one, when aggregated.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub aggregated_from: Option<u32>,
}

/// Membership/subscription details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaypiggyDetails {
	pub tier: String,
	#[serde(default)]
	pub months: Option<u32>,
	#[serde(default)]
	pub level: Option<u32>,
}

/// Variant-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
	Chat { message: String },
	Follow,
	Gift(GiftDetails),
	Paypiggy(PaypiggyDetails),
	Raid { viewer_count: u64 },
	Share,
	Envelope(GiftDetails),
	Subscriber(PaypiggyDetails),
}

impl EventKind {
	pub fn event_type(&self) -> EventType {
		match self {
			EventKind::Chat { .. } => EventType::Chat,
			EventKind::Follow => EventType::Follow,
			EventKind::Gift(_) => EventType::Gift,
			EventKind::Paypiggy(_) => EventType::Paypiggy,
			EventKind::Raid { .. } => EventType::Raid,
			EventKind::Share => EventType::Share,
			EventKind::Envelope(_) => EventType::Envelope,
			EventKind::Subscriber(_) => EventType::Subscriber,
		}
	}

	/// Gift details, for the monetary variants.
	pub fn gift(&self) -> Option<&GiftDetails> {
		match self {
			EventKind::Gift(g) | EventKind::Envelope(g) => Some(g),
			_ => None,
		}
	}

	fn validate(&self) -> Result<(), EventValidationError> {
		match self {
			EventKind::Chat { message } => {
				if message.trim().is_empty() {
					return Err(EventValidationError::MissingField { field: "message" });
				}
			}
			EventKind::Gift(g) | EventKind::Envelope(g) => validate_gift(g)?,
			EventKind::Paypiggy(p) | EventKind::Subscriber(p) => {
				if p.tier.trim().is_empty() {
					return Err(EventValidationError::MissingField { field: "tier" });
				}
			}
			EventKind::Follow | EventKind::Raid { .. } | EventKind::Share => {}
		}
		Ok(())
	}
}

fn validate_gift(g: &GiftDetails) -> Result<(), EventValidationError> {
	if g.gift_type.trim().is_empty() {
		return Err(EventValidationError::MissingField { field: "giftType" });
	}
	if g.gift_count < 1 {
		return Err(EventValidationError::InvalidField {
			field: "giftCount",
			reason: "must be at least 1".to_string(),
		});
	}
	if !g.amount.is_finite() || g.amount < 0.0 {
		return Err(EventValidationError::InvalidField {
			field: "amount",
			reason: format!("must be a finite non-negative number, got {}", g.amount),
		});
	}
	if g.currency.trim().is_empty() {
		return Err(EventValidationError::MissingField { field: "currency" });
	}
	Ok(())
}

/// Platform-agnostic event after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
	/// Platform-assigned stable id (a random id when the platform has none).
	pub id: String,
	pub platform: Platform,
	pub username: String,
	#[serde(default)]
	pub user_id: Option<String>,
	pub timestamp: EventTimestamp,
	pub processed_at: DateTime<Utc>,
	pub display_message: String,
	pub tts_message: String,
	pub log_message: String,
	#[serde(flatten)]
	pub kind: EventKind,
}

impl NormalizedEvent {
	pub fn builder(platform: Platform, username: impl Into<String>, kind: EventKind) -> NormalizedEventBuilder {
		NormalizedEventBuilder {
			platform,
			username: username.into(),
			kind,
			id: None,
			user_id: None,
			monotonic_ms: 0,
			at: None,
			display_message: None,
			tts_message: None,
			log_message: None,
		}
	}

	pub fn event_type(&self) -> EventType {
		self.kind.event_type()
	}
}

/// Validating builder; required fields are checked in `build`.
#[derive(Debug, Clone)]
pub struct NormalizedEventBuilder {
	platform: Platform,
	username: String,
	kind: EventKind,
	id: Option<String>,
	user_id: Option<String>,
	monotonic_ms: u64,
	at: Option<DateTime<Utc>>,
	display_message: Option<String>,
	tts_message: Option<String>,
	log_message: Option<String>,
}

impl NormalizedEventBuilder {
	pub fn id(mut self, id: impl Into<String>) -> Self {
		let id = id.into();
		if !id.trim().is_empty() {
			self.id = Some(id);
		}
		self
	}

	pub fn user_id(mut self, user_id: Option<String>) -> Self {
		self.user_id = user_id.filter(|s| !s.trim().is_empty());
		self
	}

	pub fn timestamp(mut self, monotonic_ms: u64, at: DateTime<Utc>) -> Self {
		self.monotonic_ms = monotonic_ms;
		self.at = Some(at);
		self
	}

	pub fn messages(mut self, display: impl Into<String>, tts: impl Into<String>, log: impl Into<String>) -> Self {
		self.display_message = Some(display.into());
		self.tts_message = Some(tts.into());
		self.log_message = Some(log.into());
		self
	}

	pub fn build(self) -> Result<NormalizedEvent, EventValidationError> {
		let username = self.username.trim().to_string();
		if username.is_empty() {
			return Err(EventValidationError::MissingField { field: "username" });
		}

		self.kind.validate()?;

		let now = Utc::now();
		let at = self.at.unwrap_or(now);
		let timestamp = EventTimestamp::new(self.monotonic_ms, at);
		timestamp.parse_iso()?;

		let display_message = self.display_message.unwrap_or_default();
		let tts_message = self.tts_message.unwrap_or_default();
		let log_message = self
			.log_message
			.unwrap_or_else(|| format!("[{}] {}: {}", self.platform, self.kind.event_type(), username));

		Ok(NormalizedEvent {
			id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
			platform: self.platform,
			username,
			user_id: self.user_id,
			timestamp,
			processed_at: now,
			display_message,
			tts_message,
			log_message,
			kind: self.kind,
		})
	}
}
