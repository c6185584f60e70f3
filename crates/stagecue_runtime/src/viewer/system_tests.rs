#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use stagecue_domain::Platform;
use stagecue_platform::ViewerCountSource;
use tokio::sync::Notify;

use crate::viewer::system::{
	ObserverError, StreamStatusChange, ViewerCountObserver, ViewerCountSystem, ViewerCountUpdate, ViewerSystemConfig,
	platform_provider,
};

const PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum Reading {
	Count(i64),
	Null,
	Fail,
	Panic,
}

struct MockSource {
	reading: Mutex<Reading>,
	calls: AtomicUsize,
}

impl MockSource {
	fn new(reading: Reading) -> Arc<Self> {
		Arc::new(Self {
			reading: Mutex::new(reading),
			calls: AtomicUsize::new(0),
		})
	}

	fn set(&self, reading: Reading) {
		*self.reading.lock() = reading;
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl ViewerCountSource for MockSource {
	async fn get_viewer_count(&self) -> anyhow::Result<Option<i64>> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let reading = *self.reading.lock();
		match reading {
			Reading::Count(n) => Ok(Some(n)),
			Reading::Null => Ok(None),
			Reading::Fail => anyhow::bail!("upstream unavailable"),
			Reading::Panic => panic!("source exploded"),
		}
	}
}

#[derive(Default)]
struct RecordingObserver {
	id: String,
	fail: bool,
	panic: bool,
	fail_cleanup: bool,
	gate: Option<Arc<Notify>>,
	updates: Mutex<Vec<ViewerCountUpdate>>,
	changes: Mutex<Vec<StreamStatusChange>>,
	update_calls: AtomicUsize,
	cleanups: AtomicUsize,
}

impl RecordingObserver {
	fn named(id: &str) -> Self {
		Self {
			id: id.to_string(),
			..Default::default()
		}
	}

	fn update_calls(&self) -> usize {
		self.update_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl ViewerCountObserver for RecordingObserver {
	fn id(&self) -> &str {
		&self.id
	}

	async fn on_viewer_count_update(&self, update: &ViewerCountUpdate) -> anyhow::Result<()> {
		self.update_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(gate) = &self.gate {
			gate.notified().await;
		}
		if self.panic {
			panic!("observer exploded");
		}
		if self.fail {
			anyhow::bail!("observer failed");
		}
		self.updates.lock().push(update.clone());
		Ok(())
	}

	async fn on_stream_status_change(&self, change: &StreamStatusChange) -> anyhow::Result<()> {
		self.changes.lock().push(change.clone());
		Ok(())
	}

	async fn cleanup(&self) -> anyhow::Result<()> {
		self.cleanups.fetch_add(1, Ordering::SeqCst);
		if self.fail_cleanup {
			anyhow::bail!("cleanup failed");
		}
		Ok(())
	}
}

fn config() -> ViewerSystemConfig {
	ViewerSystemConfig {
		polling_interval: Some(PERIOD),
		null_is_error: true,
	}
}

fn system_with(sources: Vec<(Platform, Arc<MockSource>)>, config: ViewerSystemConfig) -> ViewerCountSystem {
	let map: HashMap<Platform, Arc<dyn ViewerCountSource>> = sources
		.into_iter()
		.map(|(p, s)| (p, s as Arc<dyn ViewerCountSource>))
		.collect();
	ViewerCountSystem::new(platform_provider(move || map.clone()), config)
}

async fn settle() {
	for _ in 0..16 {
		tokio::task::yield_now().await;
	}
}

async fn next_tick() {
	tokio::time::advance(PERIOD).await;
	settle().await;
}

#[tokio::test(start_paused = true)]
async fn polling_handle_follows_live_transitions() {
	let source = MockSource::new(Reading::Count(1500));
	let sys = system_with(vec![(Platform::YouTube, source.clone())], config());

	sys.update_stream_status(Platform::YouTube, true).await;
	sys.start_polling();
	settle().await;

	assert!(sys.has_polling_handle(Platform::YouTube));
	assert!(source.calls() >= 1);
	assert_eq!(sys.counts().get(&Platform::YouTube), Some(&1500));

	sys.update_stream_status(Platform::YouTube, false).await;
	assert!(!sys.has_polling_handle(Platform::YouTube));
	assert_eq!(sys.counts().get(&Platform::YouTube), Some(&0));

	let calls = source.calls();
	next_tick().await;
	assert_eq!(source.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn offline_platforms_are_never_polled() {
	let twitch = MockSource::new(Reading::Count(10));
	let sys = system_with(vec![(Platform::Twitch, twitch.clone())], config());

	sys.start_polling();
	for _ in 0..5 {
		next_tick().await;
	}

	assert!(sys.is_polling());
	assert!(!sys.has_polling_handle(Platform::Twitch));
	assert_eq!(twitch.calls(), 0);
	assert_eq!(sys.count(Platform::Twitch), 0);
}

#[tokio::test(start_paused = true)]
async fn disabled_interval_makes_start_a_noop() {
	let source = MockSource::new(Reading::Count(10));
	let sys = system_with(
		vec![(Platform::YouTube, source.clone())],
		ViewerSystemConfig {
			polling_interval: None,
			null_is_error: true,
		},
	);

	sys.update_stream_status(Platform::YouTube, true).await;
	sys.start_polling();
	next_tick().await;

	assert!(!sys.is_polling());
	assert!(!sys.has_polling_handle(Platform::YouTube));
	assert_eq!(source.calls(), 0);
	assert_eq!(sys.polling_interval(), None);
}

#[tokio::test(start_paused = true)]
async fn start_polling_twice_behaves_like_once() {
	let source = MockSource::new(Reading::Count(5));
	let sys = system_with(vec![(Platform::YouTube, source.clone())], config());
	sys.update_stream_status(Platform::YouTube, true).await;

	sys.start_polling();
	sys.start_polling();
	settle().await;
	assert_eq!(source.calls(), 1);

	next_tick().await;
	assert_eq!(source.calls(), 2);
	assert!(sys.is_polling());
}

#[tokio::test(start_paused = true)]
async fn failing_observers_do_not_block_others() {
	let source = MockSource::new(Reading::Count(300));
	let sys = system_with(vec![(Platform::TikTok, source.clone())], config());

	let failing = Arc::new(RecordingObserver {
		fail: true,
		..RecordingObserver::named("failing")
	});
	let panicking = Arc::new(RecordingObserver {
		panic: true,
		..RecordingObserver::named("panicking")
	});
	let healthy = Arc::new(RecordingObserver::named("healthy"));
	sys.add_observer(failing.clone()).unwrap();
	sys.add_observer(panicking.clone()).unwrap();
	sys.add_observer(healthy.clone()).unwrap();

	sys.update_stream_status(Platform::TikTok, true).await;
	sys.start_polling();
	settle().await;

	assert_eq!(failing.update_calls(), 1);
	assert_eq!(panicking.update_calls(), 1);
	assert_eq!(healthy.update_calls(), 1);
	assert_eq!(sys.count(Platform::TikTok), 300);

	source.set(Reading::Count(320));
	next_tick().await;
	assert_eq!(failing.update_calls(), 2);
	assert_eq!(healthy.update_calls(), 2);

	let updates = healthy.updates.lock();
	assert_eq!(updates[1].count, 320);
	assert_eq!(updates[1].previous_count, 300);
}

#[tokio::test(start_paused = true)]
async fn rejected_readings_leave_count_unchanged() {
	let source = MockSource::new(Reading::Count(100));
	let sys = system_with(vec![(Platform::YouTube, source.clone())], config());
	let observer = Arc::new(RecordingObserver::named("rec"));
	sys.add_observer(observer.clone()).unwrap();

	sys.update_stream_status(Platform::YouTube, true).await;
	sys.start_polling();
	settle().await;
	assert_eq!(sys.count(Platform::YouTube), 100);

	for reading in [
		Reading::Count(-5),
		Reading::Count(10_000_001),
		Reading::Fail,
		Reading::Null,
		Reading::Panic,
	] {
		source.set(reading);
		next_tick().await;
		assert_eq!(sys.count(Platform::YouTube), 100, "{reading:?}");
	}
	assert_eq!(observer.update_calls(), 1);
	assert!(sys.has_polling_handle(Platform::YouTube));

	source.set(Reading::Count(10_000_000));
	next_tick().await;
	assert_eq!(sys.count(Platform::YouTube), 10_000_000);
}

#[tokio::test(start_paused = true)]
async fn null_counts_as_zero_when_configured() {
	let source = MockSource::new(Reading::Count(40));
	let sys = system_with(
		vec![(Platform::Twitch, source.clone())],
		ViewerSystemConfig {
			polling_interval: Some(PERIOD),
			null_is_error: false,
		},
	);
	sys.update_stream_status(Platform::Twitch, true).await;
	sys.start_polling();
	settle().await;
	assert_eq!(sys.count(Platform::Twitch), 40);

	source.set(Reading::Null);
	next_tick().await;
	assert_eq!(sys.count(Platform::Twitch), 0);
}

#[tokio::test(start_paused = true)]
async fn status_transitions_reach_observers_once() {
	let source = MockSource::new(Reading::Count(1500));
	let sys = system_with(vec![(Platform::YouTube, source)], config());
	let observer = Arc::new(RecordingObserver::named("rec"));
	sys.add_observer(observer.clone()).unwrap();

	sys.update_stream_status(Platform::YouTube, true).await;
	sys.update_stream_status(Platform::YouTube, true).await;
	sys.start_polling();
	settle().await;
	sys.update_stream_status(Platform::YouTube, false).await;
	sys.update_stream_status(Platform::YouTube, false).await;

	let changes = observer.changes.lock();
	assert_eq!(changes.len(), 2);
	assert!(changes[0].is_live && !changes[0].was_live);
	assert!(!changes[1].is_live && changes[1].was_live);
	assert_eq!(changes[1].previous_count, 1500);
	assert!(!sys.is_stream_live(Platform::YouTube));
}

#[tokio::test(start_paused = true)]
async fn stop_polling_cancels_pending_observer_calls() {
	let source = MockSource::new(Reading::Count(7));
	let sys = system_with(vec![(Platform::YouTube, source)], config());

	let gate = Arc::new(Notify::new());
	let slow = Arc::new(RecordingObserver {
		gate: Some(gate.clone()),
		..RecordingObserver::named("slow")
	});
	let after = Arc::new(RecordingObserver::named("after"));
	sys.add_observer(slow.clone()).unwrap();
	sys.add_observer(after.clone()).unwrap();

	sys.update_stream_status(Platform::YouTube, true).await;
	sys.start_polling();
	settle().await;
	assert_eq!(slow.update_calls(), 1);

	sys.stop_polling();
	gate.notify_one();
	settle().await;

	assert_eq!(slow.updates.lock().len(), 1);
	assert_eq!(after.update_calls(), 0);
	assert!(!sys.is_polling());
	assert!(!sys.has_polling_handle(Platform::YouTube));
}

#[tokio::test(start_paused = true)]
async fn cleanup_empties_observers_despite_failures() {
	let sys = system_with(vec![], config());
	let bad = Arc::new(RecordingObserver {
		fail_cleanup: true,
		..RecordingObserver::named("bad")
	});
	let good = Arc::new(RecordingObserver::named("good"));
	sys.add_observer(bad.clone()).unwrap();
	sys.add_observer(good.clone()).unwrap();

	sys.start_polling();
	sys.stop_polling();
	sys.cleanup().await;
	sys.cleanup().await;

	assert!(sys.observer_ids().is_empty());
	assert!(!sys.is_polling());
	assert_eq!(bad.cleanups.load(Ordering::SeqCst), 1);
	assert_eq!(good.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn provider_is_reread_every_tick() {
	let sources: Arc<Mutex<HashMap<Platform, Arc<dyn ViewerCountSource>>>> = Arc::default();
	let provider_sources = sources.clone();
	let sys = ViewerCountSystem::new(platform_provider(move || provider_sources.lock().clone()), config());

	sys.update_stream_status(Platform::StreamElements, true).await;
	sys.start_polling();
	settle().await;
	assert!(!sys.validate_platform_for_polling(Platform::StreamElements).valid);
	assert_eq!(sys.count(Platform::StreamElements), 0);

	let late = MockSource::new(Reading::Count(55));
	sources
		.lock()
		.insert(Platform::StreamElements, late.clone() as Arc<dyn ViewerCountSource>);
	assert!(sys.validate_platform_for_polling(Platform::StreamElements).valid);

	next_tick().await;
	assert_eq!(late.calls(), 1);
	assert_eq!(sys.count(Platform::StreamElements), 55);
}

#[test]
fn observers_are_keyed_by_id() {
	let sys = system_with(vec![], config());
	sys.add_observer(Arc::new(RecordingObserver::named("a"))).unwrap();
	sys.add_observer(Arc::new(RecordingObserver::named("b"))).unwrap();
	sys.add_observer(Arc::new(RecordingObserver::named("a"))).unwrap();
	assert_eq!(sys.observer_ids(), vec!["a", "b"]);

	assert_eq!(
		sys.add_observer(Arc::new(RecordingObserver::named("  "))),
		Err(ObserverError::EmptyId)
	);
	assert!(sys.remove_observer("a"));
	assert!(!sys.remove_observer("a"));
	assert_eq!(sys.observer_ids(), vec!["b"]);
}
