#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stagecue_domain::Platform;
use stagecue_platform::{ChatPayload, NotificationPayload, PlatformAdapter, PlatformHandlers, new_session_id};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, info};

const DEMO_USERS: [&str; 3] = ["demo_alice", "demo_bob", "demo_carol"];

/// Dev adapter producing a scripted stream of chat and notifications.
pub struct DemoAdapter {
	platform: Platform,
	emit_interval: Duration,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl DemoAdapter {
	pub fn new(platform: Platform) -> Self {
		Self {
			platform,
			emit_interval: Duration::from_secs(2),
			task: Mutex::new(None),
		}
	}

	/// Customize emit interval (useful for tests).
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}

	/// Emit the `tick`-th scripted event. Returns `false` once the runtime is gone.
	async fn emit_one_tick(handlers: &PlatformHandlers, tick: u64) -> bool {
		let user = DEMO_USERS[(tick as usize / 6) % DEMO_USERS.len()];
		match tick % 6 {
			0 => {
				let mut chat = ChatPayload::new(user, format!("demo message #{tick}"));
				chat.is_first_message = tick < 18;
				handlers.on_chat(chat).await
			}
			1 => handlers.on_follow(NotificationPayload::for_user(user)).await,
			2 => handlers.on_gift(NotificationPayload::gift(user, "Rose", 1.0, 1.0, "coins")).await,
			3 => handlers.on_chat(ChatPayload::new(user, "!confetti")).await,
			4 => handlers.on_viewer_count(100 + (tick as i64 * 37) % 900).await,
			_ => {
				let mut raid = NotificationPayload::for_user(user);
				raid.viewer_count = Some(tick * 3);
				handlers.on_raid(raid).await
			}
		}
	}
}

#[async_trait]
impl PlatformAdapter for DemoAdapter {
	fn platform(&self) -> Platform {
		self.platform
	}

	async fn initialize(&self, handlers: PlatformHandlers) -> anyhow::Result<()> {
		let platform = self.platform;
		let session_id = new_session_id();
		handlers.report_status(true, format!("demo adapter online (session_id={session_id})"));
		handlers.on_stream_status(true).await;

		let period = self.emit_interval;
		let task = tokio::spawn(async move {
			let mut interval: Interval = tokio::time::interval(period);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			interval.tick().await;

			let mut tick: u64 = 0;
			loop {
				interval.tick().await;
				if !Self::emit_one_tick(&handlers, tick).await {
					info!(%platform, "runtime gone; demo adapter stopping");
					break;
				}
				tick += 1;
			}
		});

		if let Some(prev) = self.task.lock().replace(task) {
			prev.abort();
		}
		info!(%platform, %session_id, "demo adapter started");
		debug!(%platform, interval_ms = period.as_millis() as u64, "demo adapter tick interval configured");
		Ok(())
	}

	async fn cleanup(&self) -> anyhow::Result<()> {
		if let Some(task) = self.task.lock().take() {
			task.abort();
			info!(platform = %self.platform, "demo adapter stopped");
		}
		Ok(())
	}
}
