#![forbid(unsafe_code)]

//! Live stream discovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use stagecue_domain::Platform;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::innertube::InnertubeClient;
use crate::AsyncAction;

/// Answers "is this channel live right now" for scheduled-check platforms.
#[async_trait::async_trait]
pub trait LiveStatusProbe: Send + Sync {
	async fn is_live(&self, channel: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionConfig {
	pub channel: String,
	pub check_interval: Duration,
	/// Give up after this many checks; `None` polls until cancelled.
	pub max_checks: Option<u32>,
}

impl DetectionConfig {
	pub fn new(channel: impl Into<String>) -> Self {
		Self {
			channel: channel.into(),
			check_interval: Duration::from_secs(60),
			max_checks: None,
		}
	}
}

/// Cancellable background detection.
#[derive(Debug)]
pub struct DetectionHandle {
	platform: Platform,
	task: Option<JoinHandle<()>>,
}

impl DetectionHandle {
	pub fn platform(&self) -> Platform {
		self.platform
	}

	pub fn is_finished(&self) -> bool {
		self.task.as_ref().is_none_or(JoinHandle::is_finished)
	}

	pub fn cancel(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}

	/// Wait for detection to finish (callback fired, gave up or cancelled).
	pub async fn join(mut self) {
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}

impl Drop for DetectionHandle {
	fn drop(&mut self) {
		self.cancel();
	}
}

/// Candidate discovery. Never touches connection state.
#[derive(Clone)]
pub struct StreamDetector {
	client: Arc<dyn InnertubeClient>,
	probes: HashMap<Platform, Arc<dyn LiveStatusProbe>>,
}

impl std::fmt::Debug for StreamDetector {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamDetector")
			.field("probes", &self.probes.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl StreamDetector {
	pub fn new(client: Arc<dyn InnertubeClient>) -> Self {
		Self {
			client,
			probes: HashMap::new(),
		}
	}

	pub fn with_probe(mut self, platform: Platform, probe: Arc<dyn LiveStatusProbe>) -> Self {
		self.probes.insert(platform, probe);
		self
	}

	/// Live video ids of `channel_handle` in upstream order, deduplicated.
	pub async fn get_live_video_ids(&self, channel_handle: &str) -> anyhow::Result<Vec<String>> {
		let raw = self.client.live_video_ids(channel_handle).await?;
		let mut seen = HashSet::with_capacity(raw.len());
		let ids: Vec<String> = raw
			.into_iter()
			.map(|id| id.trim().to_string())
			.filter(|id| !id.is_empty() && seen.insert(id.clone()))
			.collect();
		debug!(channel = channel_handle, count = ids.len(), "live video ids fetched");
		Ok(ids)
	}

	/// Invoke `connect` once `config.channel` goes live on `platform`.
	///
	/// Platforms without a registered probe are push-based and connect right away.
	pub fn start_stream_detection(&self, platform: Platform, config: DetectionConfig, connect: AsyncAction) -> DetectionHandle {
		let probe = self.probes.get(&platform).cloned();
		let task = tokio::spawn(async move {
			let Some(probe) = probe else {
				debug!(%platform, "no live probe; connecting immediately");
				if let Err(e) = connect().await {
					warn!(%platform, error = %e, "connect after detection failed");
				}
				return;
			};

			let mut tick = interval(config.check_interval.max(Duration::from_millis(1)));
			tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
			let mut checks = 0u32;
			loop {
				tick.tick().await;
				checks += 1;
				match probe.is_live(&config.channel).await {
					Ok(true) => {
						info!(%platform, channel = %config.channel, checks, "stream detected");
						if let Err(e) = connect().await {
							warn!(%platform, error = %e, "connect after detection failed");
						}
						return;
					}
					Ok(false) => debug!(%platform, channel = %config.channel, checks, "not live yet"),
					Err(e) => warn!(%platform, channel = %config.channel, error = %e, "live check failed"),
				}
				if config.max_checks.is_some_and(|max| checks >= max) {
					info!(%platform, channel = %config.channel, checks, "stream detection gave up");
					return;
				}
			}
		});

		DetectionHandle {
			platform,
			task: Some(task),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use parking_lot::Mutex;
	use serde_json::Value;

	use super::*;
	use crate::async_action;

	struct ListClient(Vec<&'static str>);

	#[async_trait::async_trait]
	impl InnertubeClient for ListClient {
		async fn get_info(&self, _video_id: &str) -> anyhow::Result<Value> {
			Ok(Value::Null)
		}

		async fn live_video_ids(&self, _channel_handle: &str) -> anyhow::Result<Vec<String>> {
			Ok(self.0.iter().map(|s| s.to_string()).collect())
		}
	}

	struct ScriptedProbe {
		answers: Mutex<Vec<bool>>,
		calls: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl LiveStatusProbe for ScriptedProbe {
		async fn is_live(&self, _channel: &str) -> anyhow::Result<bool> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let mut answers = self.answers.lock();
			if answers.is_empty() {
				return Ok(false);
			}
			Ok(answers.remove(0))
		}
	}

	fn counting_action(n: Arc<AtomicUsize>) -> AsyncAction {
		async_action(move || {
			let n = n.clone();
			async move {
				n.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		})
	}

	#[tokio::test]
	async fn ids_keep_upstream_order_without_duplicates() {
		let detector = StreamDetector::new(Arc::new(ListClient(vec!["b", "a", " ", "b", "c"])));
		let ids = detector.get_live_video_ids("@chan").await.unwrap();
		assert_eq!(ids, vec!["b", "a", "c"]);
	}

	#[tokio::test]
	async fn push_platforms_connect_immediately() {
		let detector = StreamDetector::new(Arc::new(ListClient(vec![])));
		let hits = Arc::new(AtomicUsize::new(0));
		let handle = detector.start_stream_detection(
			Platform::TikTok,
			DetectionConfig::new("someone"),
			counting_action(hits.clone()),
		);
		handle.join().await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn scheduled_platform_connects_once_when_live() {
		let probe = Arc::new(ScriptedProbe {
			answers: Mutex::new(vec![false, false, true]),
			calls: AtomicUsize::new(0),
		});
		let detector = StreamDetector::new(Arc::new(ListClient(vec![]))).with_probe(Platform::Twitch, probe.clone());
		let hits = Arc::new(AtomicUsize::new(0));
		let mut cfg = DetectionConfig::new("streamer");
		cfg.check_interval = Duration::from_secs(10);

		let handle = detector.start_stream_detection(Platform::Twitch, cfg, counting_action(hits.clone()));
		handle.join().await;
		assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn detection_gives_up_after_max_checks() {
		let probe = Arc::new(ScriptedProbe {
			answers: Mutex::new(vec![]),
			calls: AtomicUsize::new(0),
		});
		let detector = StreamDetector::new(Arc::new(ListClient(vec![]))).with_probe(Platform::Twitch, probe.clone());
		let hits = Arc::new(AtomicUsize::new(0));
		let cfg = DetectionConfig {
			channel: "streamer".to_string(),
			check_interval: Duration::from_secs(1),
			max_checks: Some(4),
		};
		detector
			.start_stream_detection(Platform::Twitch, cfg, counting_action(hits.clone()))
			.join()
			.await;
		assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}
}
