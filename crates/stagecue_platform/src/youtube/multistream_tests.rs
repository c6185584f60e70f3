#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::time::advance;

use crate::ViewerCountSource;
use crate::bus::{self, BusEvent, EventBus};
use crate::retry::RetryEngine;
use crate::youtube::connection::{ChatConnection, ConnectionReporter, ConnectionStatus, YouTubeChatConnector};
use crate::youtube::innertube::InnertubeClient;
use crate::youtube::multistream::{MultiStreamConfig, MultiStreamManager, TickSkip, retry_key, select_streams};

struct ScriptedClient {
	ids: Mutex<Result<Vec<String>, String>>,
}

impl ScriptedClient {
	fn new() -> Self {
		Self {
			ids: Mutex::new(Ok(Vec::new())),
		}
	}

	fn set(&self, ids: &[&str]) {
		*self.ids.lock() = Ok(ids.iter().map(|s| s.to_string()).collect());
	}

	fn fail(&self, msg: &str) {
		*self.ids.lock() = Err(msg.to_string());
	}
}

#[async_trait::async_trait]
impl InnertubeClient for ScriptedClient {
	async fn get_info(&self, video_id: &str) -> anyhow::Result<Value> {
		Ok(json!({ "video_details": { "viewer_count": video_id.len() * 100 } }))
	}

	async fn live_video_ids(&self, _channel_handle: &str) -> anyhow::Result<Vec<String>> {
		self.ids.lock().clone().map_err(anyhow::Error::msg)
	}
}

struct MockConnection {
	video_id: String,
	disconnects: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait::async_trait]
impl ChatConnection for MockConnection {
	async fn disconnect(&self, reason: &str) -> anyhow::Result<()> {
		self.disconnects.lock().push((self.video_id.clone(), reason.to_string()));
		Ok(())
	}
}

#[derive(Default)]
struct MockConnector {
	failing: Mutex<HashSet<String>>,
	attempts: Mutex<Vec<String>>,
	disconnects: Arc<Mutex<Vec<(String, String)>>>,
	gate: Option<Arc<Notify>>,
}

#[async_trait::async_trait]
impl YouTubeChatConnector for MockConnector {
	async fn connect(&self, video_id: &str, reporter: ConnectionReporter) -> anyhow::Result<Box<dyn ChatConnection>> {
		self.attempts.lock().push(video_id.to_string());
		if let Some(gate) = &self.gate {
			gate.notified().await;
		}
		if self.failing.lock().contains(video_id) {
			anyhow::bail!("chat handshake refused");
		}
		reporter.ready();
		Ok(Box::new(MockConnection {
			video_id: video_id.to_string(),
			disconnects: self.disconnects.clone(),
		}))
	}
}

struct Fixture {
	client: Arc<ScriptedClient>,
	connector: Arc<MockConnector>,
	retry: RetryEngine,
	bus: EventBus,
	manager: MultiStreamManager,
}

fn fixture(max_streams: usize) -> Fixture {
	fixture_with(max_streams, MockConnector::default())
}

fn fixture_with(max_streams: usize, connector: MockConnector) -> Fixture {
	let client = Arc::new(ScriptedClient::new());
	let connector = Arc::new(connector);
	let retry = RetryEngine::default();
	let bus = EventBus::new();
	let mut cfg = MultiStreamConfig::new("@channel");
	cfg.max_streams = max_streams;
	let manager = MultiStreamManager::new(cfg, client.clone(), connector.clone(), retry.clone(), bus.clone());
	Fixture {
		client,
		connector,
		retry,
		bus,
		manager,
	}
}

fn ids(v: &[&str]) -> Vec<String> {
	v.iter().map(|s| s.to_string()).collect()
}

async fn settle() {
	for _ in 0..16 {
		tokio::task::yield_now().await;
	}
}

#[test]
fn selection_keeps_existing_first() {
	let existing: HashSet<String> = ids(&["c"]).into_iter().collect();
	assert_eq!(select_streams(&ids(&["a", "b", "c"]), &existing, 2), ids(&["c", "a"]));
	assert_eq!(select_streams(&ids(&["a", "b", "c"]), &HashSet::new(), 0), ids(&["a", "b", "c"]));
	assert_eq!(select_streams(&ids(&["a", "b"]), &HashSet::new(), 5), ids(&["a", "b"]));

	let over: HashSet<String> = ids(&["a", "b", "c"]).into_iter().collect();
	assert_eq!(select_streams(&ids(&["a", "b", "c", "d"]), &over, 2), ids(&["a", "b", "c"]));
}

#[tokio::test]
async fn connects_up_to_max_and_emits_stream_detected() {
	let fx = fixture(2);
	let (_sub, mut detected) = fx.bus.subscribe_channel(bus::STREAM_DETECTED);
	fx.client.set(&["a", "b", "c"]);

	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.connected, ids(&["a", "b"]));
	assert!(!report.shortage_warning);
	assert_eq!(fx.manager.connections().get_all_video_ids(), ids(&["a", "b"]));
	assert!(fx.manager.connections().is_connection_ready("a"));

	match detected.try_recv() {
		Ok(BusEvent::StreamDetected {
			new_stream_ids,
			all_stream_ids,
			connection_count,
			..
		}) => {
			assert_eq!(new_stream_ids, ids(&["a", "b"]));
			assert_eq!(all_stream_ids, ids(&["a", "b"]));
			assert_eq!(connection_count, 2);
		}
		other => panic!("expected STREAM_DETECTED, got {other:?}"),
	}
}

#[tokio::test]
async fn max_streams_zero_disables_truncation() {
	let fx = fixture(0);
	fx.client.set(&["a", "b", "c", "d"]);
	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.connected.len(), 4);
	assert_eq!(fx.manager.connections().get_connection_count(), 4);
	assert!(!report.shortage_warning);
}

#[tokio::test(start_paused = true)]
async fn throttled_until_full_check_is_due() {
	let fx = fixture(1);
	fx.client.set(&["a"]);
	fx.manager.tick(false).await.unwrap();

	fx.client.set(&["b", "a"]);
	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.skipped, Some(TickSkip::Throttled));

	advance(Duration::from_secs(300)).await;
	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.skipped, None);
	assert!(report.connected.is_empty(), "existing stream keeps its slot");
	assert!(report.disconnected.is_empty());
	assert_eq!(fx.manager.connections().get_all_video_ids(), ids(&["a"]));
}

#[tokio::test(start_paused = true)]
async fn throttled_full_check_still_drops_ended_streams() {
	let fx = fixture(1);
	fx.client.set(&["a"]);
	fx.manager.tick(false).await.unwrap();

	fx.client.set(&["b"]);
	advance(Duration::from_secs(300)).await;
	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.disconnected, ids(&["a"]));
	assert_eq!(report.connected, ids(&["b"]));
}

#[tokio::test]
async fn ended_streams_are_disconnected_with_reason() {
	let fx = fixture(0);
	fx.client.set(&["a", "b"]);
	fx.manager.tick(false).await.unwrap();

	fx.client.set(&["b"]);
	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.disconnected, ids(&["a"]));
	assert!(!fx.manager.connections().has_connection("a"));
	assert_eq!(
		fx.connector.disconnects.lock().as_slice(),
		&[("a".to_string(), "stream no longer live".to_string())]
	);
}

#[tokio::test]
async fn empty_scan_preserves_existing_connections() {
	let fx = fixture(2);
	fx.client.set(&["a"]);
	fx.manager.tick(false).await.unwrap();

	fx.client.set(&[]);
	let report = fx.manager.tick(false).await.unwrap();
	assert!(report.preserved);
	assert!(report.disconnected.is_empty());
	assert!(fx.manager.connections().has_connection("a"));
}

#[tokio::test(start_paused = true)]
async fn shortage_warns_once_per_interval_and_resolves_once() {
	let fx = fixture(5);
	fx.client.set(&["a", "b", "c"]);

	let first = fx.manager.tick(false).await.unwrap();
	assert!(first.shortage_warning);
	let shortage = fx.manager.shortage_state();
	assert!(shortage.is_in_shortage);
	assert_eq!((shortage.last_known_available, shortage.last_known_required), (3, 5));

	advance(Duration::from_secs(60)).await;
	let second = fx.manager.tick(false).await.unwrap();
	assert!(!second.shortage_warning);

	fx.client.set(&["a", "b", "c", "d", "e"]);
	advance(Duration::from_secs(60)).await;
	let third = fx.manager.tick(false).await.unwrap();
	assert!(third.shortage_resolved);
	assert!(!fx.manager.shortage_state().is_in_shortage);

	advance(Duration::from_secs(300)).await;
	let fourth = fx.manager.tick(false).await.unwrap();
	assert!(!fourth.shortage_resolved);
	assert!(!fourth.shortage_warning);
}

#[tokio::test(start_paused = true)]
async fn shortage_warning_repeats_after_full_check_interval() {
	let fx = fixture(3);
	fx.client.set(&["a"]);
	assert!(fx.manager.tick(false).await.unwrap().shortage_warning);

	advance(Duration::from_secs(299)).await;
	assert!(!fx.manager.tick(false).await.unwrap().shortage_warning);

	advance(Duration::from_secs(1)).await;
	assert!(fx.manager.tick(false).await.unwrap().shortage_warning);
}

#[tokio::test(start_paused = true)]
async fn failed_connection_is_marked_broken_and_retried() {
	let connector = MockConnector::default();
	connector.failing.lock().insert("a".to_string());
	let fx = fixture_with(2, connector);
	let (_sub, mut errors) = fx.bus.subscribe_channel(bus::CONNECTION_ERROR);
	let (_detected_sub, mut detected) = fx.bus.subscribe_channel(bus::STREAM_DETECTED);
	fx.client.set(&["a"]);

	let report = fx.manager.tick(false).await.unwrap();
	assert_eq!(report.failed, ids(&["a"]));
	assert!(report.connected.is_empty());
	assert!(detected.try_recv().is_err(), "failed connects must not announce a stream");
	assert_eq!(fx.manager.connections().status_of("a"), Some(ConnectionStatus::Broken));
	assert!(fx.retry.has_pending(&retry_key("a")));
	match errors.try_recv() {
		Ok(BusEvent::ConnectionError { key, .. }) => assert_eq!(key, "youtube:a"),
		other => panic!("expected CONNECTION_ERROR, got {other:?}"),
	}

	// still live and still failing: the next tick leaves reconnection to the retry timer
	let again = fx.manager.tick(false).await.unwrap();
	assert!(again.connected.is_empty() && again.failed.is_empty());

	fx.connector.failing.lock().clear();
	advance(Duration::from_millis(600)).await;
	settle().await;

	assert!(fx.manager.connections().is_connection_ready("a"));
	assert_eq!(fx.retry.get_retry_count(&retry_key("a")), 0);
	assert_eq!(fx.connector.attempts.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_is_dropped_once_stream_ends() {
	let connector = MockConnector::default();
	connector.failing.lock().insert("a".to_string());
	let fx = fixture_with(2, connector);
	fx.client.set(&["a"]);
	fx.manager.tick(false).await.unwrap();

	fx.client.set(&["b"]);
	fx.manager.tick(false).await.unwrap();
	assert!(!fx.retry.has_pending(&retry_key("a")));

	advance(Duration::from_secs(5)).await;
	settle().await;
	assert!(!fx.manager.connections().has_connection("a"));
	assert_eq!(
		fx.connector.attempts.lock().iter().filter(|id| id.as_str() == "a").count(),
		1
	);
}

#[tokio::test]
async fn detection_failure_surfaces_only_when_requested() {
	let fx = fixture(2);
	fx.client.fail("innertube unavailable");

	let report = fx.manager.tick(false).await.unwrap();
	assert!(report.detection_error.as_deref().is_some_and(|e| e.contains("innertube unavailable")));
	assert!(fx.manager.tick(true).await.is_err());

	assert!(fx.manager.start_monitoring().await.is_err());
	assert!(!fx.manager.is_monitoring());
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
	let gate = Arc::new(Notify::new());
	let fx = fixture_with(
		2,
		MockConnector {
			gate: Some(gate.clone()),
			..MockConnector::default()
		},
	);
	fx.client.set(&["a"]);

	let manager = fx.manager.clone();
	let first = tokio::spawn(async move { manager.tick(false).await });
	while fx.connector.attempts.lock().is_empty() {
		tokio::task::yield_now().await;
	}

	let second = fx.manager.tick(false).await.unwrap();
	assert_eq!(second.skipped, Some(TickSkip::InFlight));

	gate.notify_one();
	let first = first.await.unwrap().unwrap();
	assert_eq!(first.connected, ids(&["a"]));
}

#[tokio::test(start_paused = true)]
async fn monitoring_ticks_periodically_until_stopped() {
	let fx = fixture(0);
	fx.client.set(&["a"]);
	fx.manager.start_monitoring().await.unwrap();
	assert!(fx.manager.is_monitoring());
	assert!(fx.manager.connections().has_connection("a"));

	fx.client.set(&["b"]);
	advance(Duration::from_secs(60)).await;
	settle().await;
	assert!(!fx.manager.connections().has_connection("a"));
	assert!(fx.manager.connections().has_connection("b"));

	fx.manager.stop_monitoring();
	assert!(!fx.manager.is_monitoring());

	fx.client.set(&["c"]);
	advance(Duration::from_secs(120)).await;
	settle().await;
	assert!(!fx.manager.connections().has_connection("c"));

	fx.manager.shutdown().await;
	assert_eq!(fx.manager.connections().get_connection_count(), 0);
}

#[tokio::test]
async fn viewer_source_sums_active_streams() {
	let connector = MockConnector::default();
	connector.failing.lock().insert("bbb".to_string());
	let fx = fixture_with(0, connector);
	fx.client.set(&["a", "bbb"]);
	fx.manager.tick(false).await.unwrap();

	// "bbb" is broken, so only "a" counts
	let source = fx.manager.viewer_count_source();
	assert_eq!(source.get_viewer_count().await.unwrap(), Some(100));
}
