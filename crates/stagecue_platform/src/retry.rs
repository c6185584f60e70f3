#![forbid(unsafe_code)]

//! Shared reconnect scheduler.
//!
//! One record per connection key (`youtube:<video_id>`, `tiktok`, ...). A new
//! error for a key replaces any pending timer, so the most recent reconnect and
//! cleanup closures always win.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::AsyncAction;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub exponent_cap: u32,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
			exponent_cap: 16,
		}
	}
}

impl RetryConfig {
	/// `base * 2^min(attempt, cap)`, clamped to `[base, max]`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let pow = attempt.min(self.exponent_cap).min(63);
		let ms = self.base_delay.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(self.max_delay).max(self.base_delay)
	}
}

#[derive(Default)]
struct RetryEntry {
	attempt: u32,
	generation: u64,
	timer: Option<JoinHandle<()>>,
}

struct Inner {
	config: RetryConfig,
	entries: Mutex<HashMap<String, RetryEntry>>,
	shut_down: AtomicBool,
}

/// Cloneable handle to the retry table.
#[derive(Clone)]
pub struct RetryEngine {
	inner: Arc<Inner>,
}

impl fmt::Debug for RetryEngine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RetryEngine")
			.field("config", &self.inner.config)
			.field("keys", &self.inner.entries.lock().len())
			.finish()
	}
}

impl Default for RetryEngine {
	fn default() -> Self {
		Self::new(RetryConfig::default())
	}
}

impl RetryEngine {
	pub fn new(config: RetryConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				config,
				entries: Mutex::new(HashMap::new()),
				shut_down: AtomicBool::new(false),
			}),
		}
	}

	pub fn config(&self) -> RetryConfig {
		self.inner.config
	}

	/// Record a connection failure for `key` and schedule `reconnect`.
	///
	/// `cleanup` runs to completion first; its failure is logged and does not
	/// prevent scheduling.
	pub async fn handle_connection_error(
		&self,
		key: &str,
		error: impl fmt::Display,
		reconnect: AsyncAction,
		cleanup: Option<AsyncAction>,
	) {
		warn!(key, error = %error, "connection error; scheduling reconnect");

		if let Some(cleanup) = cleanup {
			if let Err(e) = run_guarded(&cleanup).await {
				warn!(key, error = %e, "cleanup before reconnect failed");
			}
		}

		schedule(&self.inner, key.to_string(), reconnect);
	}

	/// Forget the attempt counter and cancel any pending timer.
	pub fn reset_retry_count(&self, key: &str) {
		if let Some(entry) = self.inner.entries.lock().remove(key) {
			if let Some(timer) = entry.timer {
				timer.abort();
			}
			if entry.attempt > 0 {
				debug!(key, attempts = entry.attempt, "retry counter reset");
			}
		}
	}

	pub fn get_retry_count(&self, key: &str) -> u32 {
		self.inner.entries.lock().get(key).map(|e| e.attempt).unwrap_or(0)
	}

	/// Whether a reconnect timer is armed for `key`.
	pub fn has_pending(&self, key: &str) -> bool {
		self.inner
			.entries
			.lock()
			.get(key)
			.and_then(|e| e.timer.as_ref())
			.is_some_and(|t| !t.is_finished())
	}

	/// Cancel every timer; later errors are ignored.
	pub fn shutdown(&self) {
		self.inner.shut_down.store(true, Ordering::SeqCst);
		let drained: Vec<(String, RetryEntry)> = self.inner.entries.lock().drain().collect();
		let mut cancelled = 0usize;
		for (_, entry) in drained {
			if let Some(timer) = entry.timer {
				timer.abort();
				cancelled += 1;
			}
		}
		info!(cancelled, "retry engine shut down");
	}
}

fn schedule(inner: &Arc<Inner>, key: String, reconnect: AsyncAction) {
	if inner.shut_down.load(Ordering::SeqCst) {
		debug!(key = %key, "retry engine shut down; not scheduling");
		return;
	}

	let mut entries = inner.entries.lock();
	let entry = entries.entry(key.clone()).or_default();
	if let Some(prev) = entry.timer.take() {
		prev.abort();
	}

	let delay = inner.config.delay_for(entry.attempt);
	let deadline = Instant::now() + delay;
	entry.attempt = entry.attempt.saturating_add(1);
	entry.generation = entry.generation.wrapping_add(1);
	let generation = entry.generation;
	let attempt = entry.attempt;

	metrics::counter!("stagecue_retry_attempts_total").increment(1);
	info!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

	let weak = Arc::downgrade(inner);
	entry.timer = Some(tokio::spawn(async move {
		sleep_until(deadline).await;

		let Some(inner) = weak.upgrade() else {
			return;
		};
		{
			let mut entries = inner.entries.lock();
			match entries.get_mut(&key) {
				Some(e) if e.generation == generation => e.timer = None,
				_ => return,
			}
		}

		match run_guarded(&reconnect).await {
			Ok(()) => debug!(key = %key, attempt, "reconnect succeeded"),
			Err(e) => {
				warn!(key = %key, attempt, error = %e, "reconnect failed");
				let still_current = inner
					.entries
					.lock()
					.get(&key)
					.is_some_and(|e| e.generation == generation);
				if still_current {
					schedule(&inner, key, reconnect);
				}
			}
		}
	}));
}

/// Run an action, turning panics into errors.
async fn run_guarded(action: &AsyncAction) -> anyhow::Result<()> {
	let fut = match catch_unwind(AssertUnwindSafe(|| action())) {
		Ok(fut) => fut,
		Err(_) => anyhow::bail!("action panicked"),
	};
	match AssertUnwindSafe(fut).catch_unwind().await {
		Ok(res) => res,
		Err(_) => anyhow::bail!("action panicked"),
	}
}
