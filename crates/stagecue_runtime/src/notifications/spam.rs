#![forbid(unsafe_code)]

//! Low-value gift aggregation and duplicate payload detection.

use std::collections::HashMap;

use parking_lot::Mutex;
use stagecue_domain::{NormalizedEvent, Platform};
use stagecue_util::sanitize::user_key;
use tokio::time::Instant;

use crate::config::SpamSettings;

/// Merged low-value gifts of one user and currency within one window.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAggregate {
	pub platform: Platform,
	pub username: String,
	pub user_id: Option<String>,
	pub currency: String,
	pub total_amount: f64,
	pub total_count: u32,
	/// Number of gift events merged.
	pub merged: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftDecision {
	Individual,
	Aggregated,
}

#[derive(Debug)]
struct Window {
	started: Instant,
	individual: u32,
	/// One aggregate per currency, in arrival order.
	pending: Vec<PendingAggregate>,
}

impl Window {
	fn new(started: Instant) -> Self {
		Self {
			started,
			individual: 0,
			pending: Vec::new(),
		}
	}
}

#[derive(Debug)]
pub struct SpamDetector {
	config: SpamSettings,
	windows: Mutex<HashMap<String, Window>>,
	ready: Mutex<Vec<PendingAggregate>>,
	recent: Mutex<HashMap<String, Instant>>,
}

impl SpamDetector {
	pub fn new(config: SpamSettings) -> Self {
		Self {
			config,
			windows: Mutex::new(HashMap::new()),
			ready: Mutex::new(Vec::new()),
			recent: Mutex::new(HashMap::new()),
		}
	}

	pub fn config(&self) -> SpamSettings {
		self.config
	}

	/// Let the first `max_individual_notifications` low-value gifts of a window
	/// through and fold the rest into one pending aggregate.
	pub fn classify_gift(&self, event: &NormalizedEvent, now: Instant) -> GiftDecision {
		let Some(gift) = event.kind.gift() else {
			return GiftDecision::Individual;
		};
		if !self.config.enabled || gift.amount >= self.config.low_value_threshold {
			return GiftDecision::Individual;
		}

		let key = user_key(event.platform.as_str(), &event.username);
		let mut windows = self.windows.lock();
		let window = windows.entry(key).or_insert_with(|| Window::new(now));
		if now.duration_since(window.started) >= self.config.detection_window {
			self.ready.lock().append(&mut window.pending);
			*window = Window::new(now);
		}

		if window.individual < self.config.max_individual_notifications {
			window.individual += 1;
			return GiftDecision::Individual;
		}

		let slot = match window.pending.iter().position(|p| p.currency == gift.currency) {
			Some(i) => i,
			None => {
				window.pending.push(PendingAggregate {
					platform: event.platform,
					username: event.username.clone(),
					user_id: event.user_id.clone(),
					currency: gift.currency.clone(),
					total_amount: 0.0,
					total_count: 0,
					merged: 0,
				});
				window.pending.len() - 1
			}
		};
		let pending = &mut window.pending[slot];
		pending.total_amount += gift.amount;
		pending.total_count = pending.total_count.saturating_add(gift.gift_count);
		pending.merged += 1;
		GiftDecision::Aggregated
	}

	/// Aggregates whose window closed by `now`; closed windows are forgotten.
	pub fn take_due(&self, now: Instant) -> Vec<PendingAggregate> {
		let mut due = std::mem::take(&mut *self.ready.lock());
		let window_len = self.config.detection_window;
		self.windows.lock().retain(|_, w| {
			if now.duration_since(w.started) < window_len {
				return true;
			}
			due.append(&mut w.pending);
			false
		});
		due
	}

	/// Every pending aggregate regardless of window.
	pub fn drain(&self) -> Vec<PendingAggregate> {
		let mut all = std::mem::take(&mut *self.ready.lock());
		all.extend(self.windows.lock().drain().flat_map(|(_, w)| w.pending));
		all
	}

	pub fn pending_count(&self) -> usize {
		self.ready.lock().len() + self.windows.lock().values().map(|w| w.pending.len()).sum::<usize>()
	}

	/// `true` when `fingerprint` was already seen within the duplicate window.
	pub fn is_duplicate(&self, fingerprint: &str, now: Instant) -> bool {
		let window = self.config.duplicate_window;
		if window.is_zero() {
			return false;
		}
		let mut recent = self.recent.lock();
		recent.retain(|_, seen| now.duration_since(*seen) < window);
		if recent.contains_key(fingerprint) {
			return true;
		}
		recent.insert(fingerprint.to_string(), now);
		false
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use stagecue_domain::{EventKind, GiftDetails};

	use super::*;

	fn settings() -> SpamSettings {
		SpamSettings {
			enabled: true,
			detection_window: Duration::from_secs(5),
			max_individual_notifications: 2,
			low_value_threshold: 10.0,
			duplicate_window: Duration::ZERO,
		}
	}

	fn gift(user: &str, amount: f64, count: u32) -> NormalizedEvent {
		gift_in(user, amount, count, "coins")
	}

	fn gift_in(user: &str, amount: f64, count: u32, currency: &str) -> NormalizedEvent {
		NormalizedEvent::builder(
			Platform::TikTok,
			user,
			EventKind::Gift(GiftDetails {
				gift_type: "Rose".to_string(),
				gift_count: count,
				amount,
				currency: currency.to_string(),
				gift_id: None,
				aggregated_from: None,
			}),
		)
		.build()
		.unwrap()
	}

	#[test]
	fn low_value_gifts_aggregate_after_allowance() {
		let spam = SpamDetector::new(settings());
		let t0 = Instant::now();

		assert_eq!(spam.classify_gift(&gift("a", 1.0, 1), t0), GiftDecision::Individual);
		assert_eq!(spam.classify_gift(&gift("a", 1.0, 1), t0), GiftDecision::Individual);
		assert_eq!(spam.classify_gift(&gift("a", 1.0, 2), t0), GiftDecision::Aggregated);
		assert_eq!(spam.classify_gift(&gift("A", 2.0, 3), t0), GiftDecision::Aggregated);
		assert_eq!(spam.classify_gift(&gift("a", 50.0, 1), t0), GiftDecision::Individual);
		assert_eq!(spam.classify_gift(&gift("b", 1.0, 1), t0), GiftDecision::Individual);

		assert!(spam.take_due(t0 + Duration::from_secs(4)).is_empty());
		let due = spam.take_due(t0 + Duration::from_secs(5));
		assert_eq!(due.len(), 1);
		assert_eq!(due[0].merged, 2);
		assert_eq!(due[0].total_count, 5);
		assert_eq!(due[0].total_amount, 3.0);

		assert_eq!(
			spam.classify_gift(&gift("a", 1.0, 1), t0 + Duration::from_secs(6)),
			GiftDecision::Individual
		);
	}

	#[test]
	fn currencies_are_aggregated_separately() {
		let spam = SpamDetector::new(settings());
		let t0 = Instant::now();
		spam.classify_gift(&gift_in("a", 1.0, 1, "coins"), t0);
		spam.classify_gift(&gift_in("a", 1.0, 1, "coins"), t0);

		assert_eq!(spam.classify_gift(&gift_in("a", 2.0, 1, "coins"), t0), GiftDecision::Aggregated);
		assert_eq!(spam.classify_gift(&gift_in("a", 5.0, 1, "USD"), t0), GiftDecision::Aggregated);
		assert_eq!(spam.classify_gift(&gift_in("a", 3.0, 2, "coins"), t0), GiftDecision::Aggregated);
		assert_eq!(spam.pending_count(), 2);

		let due = spam.take_due(t0 + Duration::from_secs(5));
		assert_eq!(due.len(), 2);
		assert_eq!((due[0].currency.as_str(), due[0].total_amount, due[0].total_count), ("coins", 5.0, 3));
		assert_eq!((due[1].currency.as_str(), due[1].total_amount, due[1].merged), ("USD", 5.0, 1));
	}

	#[test]
	fn disabled_detection_passes_everything() {
		let spam = SpamDetector::new(SpamSettings {
			enabled: false,
			..settings()
		});
		let t0 = Instant::now();
		for _ in 0..10 {
			assert_eq!(spam.classify_gift(&gift("a", 0.1, 1), t0), GiftDecision::Individual);
		}
		assert_eq!(spam.pending_count(), 0);
	}

	#[test]
	fn window_rollover_keeps_previous_aggregate() {
		let spam = SpamDetector::new(settings());
		let t0 = Instant::now();
		for _ in 0..3 {
			spam.classify_gift(&gift("a", 1.0, 1), t0);
		}
		spam.classify_gift(&gift("a", 1.0, 1), t0 + Duration::from_secs(7));
		assert_eq!(spam.pending_count(), 1);
		assert_eq!(spam.drain().len(), 1);
		assert_eq!(spam.pending_count(), 0);
	}

	#[test]
	fn duplicates_within_window() {
		let spam = SpamDetector::new(SpamSettings {
			duplicate_window: Duration::from_millis(1000),
			..settings()
		});
		let t0 = Instant::now();
		assert!(!spam.is_duplicate("x", t0));
		assert!(spam.is_duplicate("x", t0 + Duration::from_millis(999)));
		assert!(!spam.is_duplicate("x", t0 + Duration::from_millis(2000)));
		assert!(!spam.is_duplicate("y", t0 + Duration::from_millis(2000)));

		let off = SpamDetector::new(settings());
		assert!(!off.is_duplicate("x", t0));
		assert!(!off.is_duplicate("x", t0));
	}
}
