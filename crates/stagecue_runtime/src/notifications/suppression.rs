#![forbid(unsafe_code)]

//! Sliding-window per-user notification suppression.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppressionConfig {
	pub enabled: bool,
	pub max_per_user: u32,
	pub window: Duration,
	pub duration: Duration,
	pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionDecision {
	Allowed,
	/// `newly` is set on the notification that tripped the limit.
	Suppressed { until: Instant, newly: bool },
}

#[derive(Debug, Default)]
struct UserRecord {
	hits: VecDeque<Instant>,
	suppressed_until: Option<Instant>,
}

impl UserRecord {
	fn prune(&mut self, now: Instant, window: Duration) {
		while self.hits.front().is_some_and(|t| now.duration_since(*t) >= window) {
			self.hits.pop_front();
		}
		if self.suppressed_until.is_some_and(|until| until <= now) {
			self.suppressed_until = None;
		}
	}

	fn is_idle(&self) -> bool {
		self.hits.is_empty() && self.suppressed_until.is_none()
	}
}

#[derive(Debug)]
struct Inner {
	config: SuppressionConfig,
	users: Mutex<HashMap<String, UserRecord>>,
	suppressed_total: AtomicU64,
	sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
pub struct SuppressionTracker {
	inner: Arc<Inner>,
}

impl SuppressionTracker {
	pub fn new(config: SuppressionConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				config,
				users: Mutex::new(HashMap::new()),
				suppressed_total: AtomicU64::new(0),
				sweeper: Mutex::new(None),
			}),
		}
	}

	/// Record a notification for `user` and decide whether it may be shown.
	pub fn check(&self, user: &str, now: Instant) -> SuppressionDecision {
		let cfg = self.inner.config;
		if !cfg.enabled {
			return SuppressionDecision::Allowed;
		}

		let mut users = self.inner.users.lock();
		let record = users.entry(user.to_string()).or_default();
		record.prune(now, cfg.window);

		let decision = if let Some(until) = record.suppressed_until {
			SuppressionDecision::Suppressed { until, newly: false }
		} else if record.hits.len() >= cfg.max_per_user as usize {
			let until = now + cfg.duration;
			record.suppressed_until = Some(until);
			record.hits.clear();
			SuppressionDecision::Suppressed { until, newly: true }
		} else {
			record.hits.push_back(now);
			SuppressionDecision::Allowed
		};
		drop(users);

		if let SuppressionDecision::Suppressed { newly, .. } = decision {
			self.inner.suppressed_total.fetch_add(1, Ordering::Relaxed);
			if newly {
				info!(user, duration_ms = cfg.duration.as_millis() as u64, "user suppressed");
			}
		}
		decision
	}

	pub fn is_suppressed(&self, user: &str, now: Instant) -> bool {
		self.inner
			.users
			.lock()
			.get(user)
			.and_then(|r| r.suppressed_until)
			.is_some_and(|until| until > now)
	}

	pub fn suppressed_count(&self) -> u64 {
		self.inner.suppressed_total.load(Ordering::Relaxed)
	}

	pub fn tracked_users(&self) -> usize {
		self.inner.users.lock().len()
	}

	/// Forget users with no live hits and no active suppression.
	pub fn sweep(&self, now: Instant) -> usize {
		let window = self.inner.config.window;
		let mut users = self.inner.users.lock();
		let before = users.len();
		users.retain(|_, r| {
			r.prune(now, window);
			!r.is_idle()
		});
		before - users.len()
	}

	/// Periodic `sweep` on `cleanup_interval`. Replaces a running sweeper.
	pub fn start_sweeper(&self) {
		let period = self.inner.config.cleanup_interval.max(Duration::from_millis(1));
		let weak = Arc::downgrade(&self.inner);
		let task = tokio::spawn(async move {
			let mut tick = interval(period);
			tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
			tick.tick().await;
			loop {
				tick.tick().await;
				let Some(inner) = weak.upgrade() else { break };
				let removed = SuppressionTracker { inner }.sweep(Instant::now());
				if removed > 0 {
					debug!(removed, "suppression records swept");
				}
			}
		});
		if let Some(old) = self.inner.sweeper.lock().replace(task) {
			old.abort();
		}
	}

	pub fn stop_sweeper(&self) {
		if let Some(task) = self.inner.sweeper.lock().take() {
			task.abort();
		}
	}
}
