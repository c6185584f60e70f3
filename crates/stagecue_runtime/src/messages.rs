#![forbid(unsafe_code)]

//! Builds `NormalizedEvent`s (and their display/TTS/log texts) from raw
//! adapter payloads.

use chrono::Utc;
use stagecue_domain::{
	EventKind, EventType, EventValidationError, GiftDetails, NormalizedEvent, PaypiggyDetails, Platform,
};
use stagecue_platform::{ChatPayload, NotificationPayload};

use crate::notifications::spam::PendingAggregate;

fn required(value: &Option<String>, field: &'static str) -> Result<String, EventValidationError> {
	value
		.as_deref()
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.ok_or(EventValidationError::MissingField { field })
}

fn gift_count(value: Option<f64>) -> Result<u32, EventValidationError> {
	let v = value.ok_or(EventValidationError::MissingField { field: "giftCount" })?;
	if !v.is_finite() || v < 1.0 || v.fract() != 0.0 || v > f64::from(u32::MAX) {
		return Err(EventValidationError::InvalidField {
			field: "giftCount",
			reason: format!("must be a positive integer, got {v}"),
		});
	}
	Ok(v as u32)
}

fn gift_details(payload: &NotificationPayload) -> Result<GiftDetails, EventValidationError> {
	Ok(GiftDetails {
		gift_type: required(&payload.gift_type, "giftType")?,
		gift_count: gift_count(payload.gift_count)?,
		amount: payload.amount.ok_or(EventValidationError::MissingField { field: "amount" })?,
		currency: required(&payload.currency, "currency")?,
		gift_id: payload.gift_id.clone().filter(|s| !s.trim().is_empty()),
		aggregated_from: None,
	})
}

fn paypiggy_details(payload: &NotificationPayload) -> Result<PaypiggyDetails, EventValidationError> {
	Ok(PaypiggyDetails {
		tier: required(&payload.tier, "tier")?,
		months: payload.months,
		level: payload.level,
	})
}

/// Variant payload for a notification type.
pub fn notification_kind(event_type: EventType, payload: &NotificationPayload) -> Result<EventKind, EventValidationError> {
	Ok(match event_type {
		EventType::Follow => EventKind::Follow,
		EventType::Share => EventKind::Share,
		EventType::Raid => EventKind::Raid {
			viewer_count: payload
				.viewer_count
				.ok_or(EventValidationError::MissingField { field: "viewerCount" })?,
		},
		EventType::Gift => EventKind::Gift(gift_details(payload)?),
		EventType::Envelope => EventKind::Envelope(gift_details(payload)?),
		EventType::Paypiggy => EventKind::Paypiggy(paypiggy_details(payload)?),
		EventType::Subscriber => EventKind::Subscriber(paypiggy_details(payload)?),
		EventType::Chat | EventType::Greeting | EventType::Farewell => {
			return Err(EventValidationError::InvalidField {
				field: "type",
				reason: format!("{event_type} is not a notification"),
			});
		}
	})
}

fn membership_verb(platform: Platform) -> &'static str {
	match platform {
		Platform::YouTube => "became a member",
		Platform::TikTok => "joined the team",
		Platform::Twitch | Platform::StreamElements => "subscribed",
	}
}

fn plural(n: u64, one: &str, many: &str) -> String {
	if n == 1 { format!("{n} {one}") } else { format!("{n} {many}") }
}

/// `(display, tts, log)` texts for a notification.
fn notification_texts(platform: Platform, username: &str, kind: &EventKind) -> (String, String, String) {
	match kind {
		EventKind::Follow => (
			format!("{username} followed!"),
			format!("{username} followed"),
			format!("[{platform}] follow: {username}"),
		),
		EventKind::Share => (
			format!("{username} shared the stream!"),
			format!("{username} shared the stream"),
			format!("[{platform}] share: {username}"),
		),
		EventKind::Raid { viewer_count } => (
			format!("{username} is raiding with {}!", plural(*viewer_count, "viewer", "viewers")),
			format!("{username} is raiding with {}", plural(*viewer_count, "viewer", "viewers")),
			format!("[{platform}] raid: {username} ({viewer_count} viewers)"),
		),
		EventKind::Gift(g) | EventKind::Envelope(g) => {
			let what = if matches!(kind, EventKind::Envelope(_)) {
				"a treasure chest".to_string()
			} else if let Some(merged) = g.aggregated_from {
				format!("{} across {merged} small gifts", plural(u64::from(g.gift_count), "gift", "gifts"))
			} else {
				format!("{}x {}", g.gift_count, g.gift_type)
			};
			(
				format!("{username} sent {what}!"),
				format!("{username} sent {what}"),
				format!(
					"[{platform}] {}: {username} {}x {} ({:.2} {})",
					kind.event_type(),
					g.gift_count,
					g.gift_type,
					g.amount,
					g.currency
				),
			)
		}
		EventKind::Paypiggy(p) | EventKind::Subscriber(p) => {
			let verb = membership_verb(platform);
			let months = p
				.months
				.filter(|m| *m > 1)
				.map(|m| format!(" for {m} months"))
				.unwrap_or_default();
			(
				format!("{username} {verb}{months}! ({})", p.tier),
				format!("{username} {verb}{months}"),
				format!("[{platform}] {}: {username} tier={}{months}", kind.event_type(), p.tier),
			)
		}
		EventKind::Chat { message } => (
			message.clone(),
			format!("{username} says {message}"),
			format!("[{platform}] chat: {username}: {message}"),
		),
	}
}

/// Validated notification event.
pub fn notification_event(
	platform: Platform,
	event_type: EventType,
	payload: &NotificationPayload,
	monotonic_ms: u64,
) -> Result<NormalizedEvent, EventValidationError> {
	let kind = notification_kind(event_type, payload)?;
	let username = payload.username.clone().unwrap_or_default();
	let (display, tts, log) = notification_texts(platform, username.trim(), &kind);

	let mut builder = NormalizedEvent::builder(platform, username, kind)
		.user_id(payload.user_id.clone())
		.timestamp(monotonic_ms, payload.timestamp.unwrap_or_else(Utc::now))
		.messages(display, tts, log);
	if let Some(id) = &payload.id {
		builder = builder.id(id.clone());
	}
	builder.build()
}

/// One gift item standing for a window of merged low-value gifts.
pub fn aggregated_gift_event(agg: &PendingAggregate, monotonic_ms: u64) -> Result<NormalizedEvent, EventValidationError> {
	let kind = EventKind::Gift(GiftDetails {
		gift_type: "gifts".to_string(),
		gift_count: agg.total_count.max(1),
		amount: agg.total_amount,
		currency: agg.currency.clone(),
		gift_id: None,
		aggregated_from: Some(agg.merged),
	});
	let (display, tts, log) = notification_texts(agg.platform, &agg.username, &kind);
	NormalizedEvent::builder(agg.platform, agg.username.clone(), kind)
		.user_id(agg.user_id.clone())
		.timestamp(monotonic_ms, Utc::now())
		.messages(display, tts, log)
		.build()
}

/// Chat event for a raw message.
pub fn chat_event(platform: Platform, chat: &ChatPayload, monotonic_ms: u64) -> Result<NormalizedEvent, EventValidationError> {
	let kind = EventKind::Chat {
		message: chat.message.trim().to_string(),
	};
	let (display, tts, log) = notification_texts(platform, chat.username.trim(), &kind);
	let mut builder = NormalizedEvent::builder(platform, chat.username.clone(), kind)
		.user_id(chat.user_id.clone())
		.timestamp(monotonic_ms, chat.timestamp.unwrap_or_else(Utc::now))
		.messages(display, tts, log);
	if let Some(id) = &chat.id {
		builder = builder.id(id.clone());
	}
	builder.build()
}

/// Greeting or farewell built on top of a chat event.
pub fn salutation_event(kind: EventType, chat_event: &NormalizedEvent) -> NormalizedEvent {
	let username = &chat_event.username;
	let (display, tts) = match kind {
		EventType::Farewell => (format!("Goodbye, {username}!"), format!("Goodbye {username}")),
		_ => (format!("Welcome, {username}!"), format!("Welcome {username}")),
	};
	let mut event = chat_event.clone();
	event.id = format!("{}:{}", chat_event.id, kind.as_str());
	event.log_message = format!("[{}] {kind}: {username}", chat_event.platform);
	event.display_message = display;
	event.tts_message = tts;
	event
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn follow_texts() {
		let ev = notification_event(Platform::TikTok, EventType::Follow, &NotificationPayload::for_user("alice"), 7).unwrap();
		assert_eq!(ev.display_message, "alice followed!");
		assert_eq!(ev.tts_message, "alice followed");
		assert_eq!(ev.log_message, "[tiktok] follow: alice");
		assert_eq!(ev.timestamp.monotonic_ms, 7);
	}

	#[test]
	fn missing_fields_are_reported_by_name() {
		let no_user = notification_event(Platform::Twitch, EventType::Follow, &NotificationPayload::default(), 0);
		assert_eq!(no_user.unwrap_err(), EventValidationError::MissingField { field: "username" });

		let mut gift = NotificationPayload::gift("bob", "Rose", 1.0, 1.0, "coins");
		gift.currency = None;
		let err = notification_event(Platform::TikTok, EventType::Gift, &gift, 0).unwrap_err();
		assert_eq!(err, EventValidationError::MissingField { field: "currency" });

		let no_tier = notification_event(Platform::YouTube, EventType::Paypiggy, &NotificationPayload::for_user("c"), 0);
		assert_eq!(no_tier.unwrap_err(), EventValidationError::MissingField { field: "tier" });
	}

	#[test]
	fn fractional_gift_count_is_invalid() {
		let gift = NotificationPayload::gift("bob", "Rose", 1.5, 1.0, "coins");
		let err = notification_event(Platform::TikTok, EventType::Gift, &gift, 0).unwrap_err();
		assert!(matches!(err, EventValidationError::InvalidField { field: "giftCount", .. }));
	}

	#[test]
	fn membership_wording_follows_platform() {
		let mut payload = NotificationPayload::for_user("dana");
		payload.tier = Some("Gold".to_string());
		payload.months = Some(6);
		let yt = notification_event(Platform::YouTube, EventType::Paypiggy, &payload, 0).unwrap();
		assert_eq!(yt.display_message, "dana became a member for 6 months! (Gold)");
		let tw = notification_event(Platform::Twitch, EventType::Subscriber, &payload, 0).unwrap();
		assert_eq!(tw.tts_message, "dana subscribed for 6 months");
	}

	#[test]
	fn aggregate_mentions_merged_count() {
		let agg = PendingAggregate {
			platform: Platform::TikTok,
			username: "erin".to_string(),
			user_id: None,
			currency: "coins".to_string(),
			total_amount: 3.0,
			total_count: 5,
			merged: 3,
		};
		let ev = aggregated_gift_event(&agg, 0).unwrap();
		assert_eq!(ev.display_message, "erin sent 5 gifts across 3 small gifts!");
		assert_eq!(ev.kind.gift().and_then(|g| g.aggregated_from), Some(3));
	}

	#[test]
	fn salutations_reuse_the_chat_event() {
		let chat = chat_event(Platform::Twitch, &ChatPayload::new("frank", " hi all "), 1).unwrap();
		assert_eq!(chat.display_message, "hi all");
		let hello = salutation_event(EventType::Greeting, &chat);
		assert_eq!(hello.display_message, "Welcome, frank!");
		assert_ne!(hello.id, chat.id);
		let bye = salutation_event(EventType::Farewell, &chat);
		assert_eq!(bye.tts_message, "Goodbye frank");
	}
}
