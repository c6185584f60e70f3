#![forbid(unsafe_code)]

//! Process-level wiring of the pipeline and the single adapter event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use stagecue_domain::Platform;
use stagecue_platform::bus::{BusEvent, EventBus, STREAM_DETECTED, Subscription};
use stagecue_platform::retry::RetryEngine;
use stagecue_platform::youtube::{InnertubeClient, MultiStreamConfig, MultiStreamManager, YouTubeChatConnector};
use stagecue_platform::{
	AdapterEvent, AdapterEventRx, DisplayQueue, IngestEvent, IngestPayload, ObsClient, PlatformAdapter, TtsService,
	VfxCommandService, ViewerCountSource, adapter_event_channel,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::{ChatDeps, ChatRouter};
use crate::config::ConfigManager;
use crate::lifecycle::{LifecycleConfig, PlatformLifecycleService};
use crate::notifications::{NotificationDeps, NotificationManager};
use crate::viewer::{ObsViewerCountObserver, ViewerCountSystem, ViewerSystemConfig, platform_provider};

/// Capacity of the adapter → runtime channel.
pub const ADAPTER_EVENTS_CAPACITY: usize = 8_192;

/// Collaborators needed for YouTube multi-stream monitoring.
#[derive(Clone)]
pub struct YouTubeDeps {
	pub client: Arc<dyn InnertubeClient>,
	pub connector: Arc<dyn YouTubeChatConnector>,
}

#[derive(Clone)]
pub struct RuntimeDeps {
	pub config: ConfigManager,
	pub display: Arc<dyn DisplayQueue>,
	pub tts: Option<Arc<dyn TtsService>>,
	pub vfx: Option<Arc<dyn VfxCommandService>>,
	pub obs: Option<Arc<dyn ObsClient>>,
	pub youtube: Option<YouTubeDeps>,
}

/// Latest viewer counts pushed by adapters (e.g. room-user updates).
#[derive(Debug, Clone, Default)]
pub struct PushedViewerCounts {
	counts: Arc<Mutex<HashMap<Platform, i64>>>,
}

impl PushedViewerCounts {
	pub fn set(&self, platform: Platform, count: i64) {
		self.counts.lock().insert(platform, count);
	}

	pub fn get(&self, platform: Platform) -> Option<i64> {
		self.counts.lock().get(&platform).copied()
	}

	pub fn clear(&self, platform: Platform) {
		self.counts.lock().remove(&platform);
	}

	/// One source per platform that has pushed at least once.
	pub fn sources(&self) -> Vec<(Platform, Arc<dyn ViewerCountSource>)> {
		let platforms: Vec<Platform> = self.counts.lock().keys().copied().collect();
		platforms
			.into_iter()
			.map(|platform| {
				let source: Arc<dyn ViewerCountSource> = Arc::new(PushedCountSource {
					counts: self.clone(),
					platform,
				});
				(platform, source)
			})
			.collect()
	}
}

struct PushedCountSource {
	counts: PushedViewerCounts,
	platform: Platform,
}

#[async_trait::async_trait]
impl ViewerCountSource for PushedCountSource {
	async fn get_viewer_count(&self) -> anyhow::Result<Option<i64>> {
		Ok(self.counts.get(self.platform))
	}
}

/// Everything the event loop needs to dispatch one adapter event.
#[derive(Clone)]
struct Dispatcher {
	chat: ChatRouter,
	notifications: NotificationManager,
	viewers: ViewerCountSystem,
	pushed: PushedViewerCounts,
}

impl Dispatcher {
	async fn dispatch(&self, event: AdapterEvent) {
		match event {
			AdapterEvent::Ingest(ingest) => self.ingest(*ingest).await,
			AdapterEvent::Status(st) => {
				let platform = st.platform;
				metrics::counter!("stagecue_adapter_status_total", "platform" => platform.as_str()).increment(1);
				if st.last_error.is_some() {
					metrics::counter!("stagecue_adapter_status_errors_total", "platform" => platform.as_str()).increment(1);
				}
				debug!(
					%platform,
					connected = st.connected,
					detail = %st.detail,
					last_error = ?st.last_error,
					"adapter status"
				);
			}
		}
	}

	async fn ingest(&self, ev: IngestEvent) {
		let platform = ev.platform;
		match ev.payload {
			IngestPayload::Chat(chat) => {
				self.chat.route_chat(platform, chat).await;
			}
			IngestPayload::Notification { event_type, payload } => match event_type.notification_key() {
				Some(key) => {
					self.notifications.handle_notification(key, platform, payload).await;
				}
				None => warn!(%platform, %event_type, "adapter sent a non-notification event type; dropping"),
			},
			IngestPayload::ViewerCount { count } => {
				if count < 0 {
					debug!(%platform, count, "ignoring negative pushed viewer count");
				} else {
					self.pushed.set(platform, count);
				}
			}
			IngestPayload::StreamStatus { is_live } => {
				if !is_live {
					self.pushed.clear(platform);
				}
				self.viewers.update_stream_status(platform, is_live).await;
			}
		}
	}
}

/// Owns every pipeline component; `shutdown` tears them down in reverse.
pub struct StagecueRuntime {
	config: ConfigManager,
	bus: EventBus,
	retry: RetryEngine,
	notifications: NotificationManager,
	chat: ChatRouter,
	viewers: ViewerCountSystem,
	lifecycle: PlatformLifecycleService,
	youtube: Option<MultiStreamManager>,
	pushed: PushedViewerCounts,
	obs: Option<Arc<dyn ObsClient>>,
	events_rx: Mutex<Option<AdapterEventRx>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	stream_sub: Mutex<Option<Subscription>>,
	started: AtomicBool,
	shut_down: AtomicBool,
}

impl StagecueRuntime {
	pub fn new(deps: RuntimeDeps) -> Self {
		let config = deps.config;
		let bus = EventBus::new();
		let retry = RetryEngine::new(config.retry());
		let (events_tx, events_rx) = adapter_event_channel(ADAPTER_EVENTS_CAPACITY);

		let notifications = NotificationManager::new(NotificationDeps {
			config: config.clone(),
			display: deps.display.clone(),
			tts: deps.tts.clone(),
			vfx: deps.vfx.clone(),
			bus: bus.clone(),
		});
		let chat = ChatRouter::new(ChatDeps {
			config: config.clone(),
			display: deps.display,
			tts: deps.tts,
			vfx: deps.vfx,
		});
		let lifecycle =
			PlatformLifecycleService::new(LifecycleConfig::from_config(&config), retry.clone(), bus.clone(), events_tx);

		let youtube = deps.youtube.and_then(|yt| {
			let section = config.platform_section(Platform::YouTube);
			if !section.enabled {
				debug!("youtube disabled; multi-stream monitoring off");
				return None;
			}
			let Some(handle) = section.username.filter(|h| !h.trim().is_empty()) else {
				warn!("youtube monitoring needs youtube.username; not starting it");
				return None;
			};
			let general = config.general();
			let ms_config = MultiStreamConfig {
				max_streams: general.max_streams,
				stream_polling_interval: general.stream_polling_interval,
				full_check_interval: general.full_check_interval,
				..MultiStreamConfig::new(handle)
			};
			Some(MultiStreamManager::new(ms_config, yt.client, yt.connector, retry.clone(), bus.clone()))
		});

		let pushed = PushedViewerCounts::default();
		let provider = {
			let lifecycle = lifecycle.clone();
			let pushed = pushed.clone();
			let youtube_source: Option<Arc<dyn ViewerCountSource>> = youtube
				.as_ref()
				.map(|m| Arc::new(m.viewer_count_source()) as Arc<dyn ViewerCountSource>);
			platform_provider(move || {
				let mut sources: HashMap<Platform, Arc<dyn ViewerCountSource>> = pushed.sources().into_iter().collect();
				sources.extend(lifecycle.viewer_count_sources());
				if let Some(yt) = &youtube_source {
					sources.insert(Platform::YouTube, yt.clone());
				}
				sources
			})
		};
		let viewers = ViewerCountSystem::new(provider, ViewerSystemConfig::from_config(&config));

		Self {
			config,
			bus,
			retry,
			notifications,
			chat,
			viewers,
			lifecycle,
			youtube,
			pushed,
			obs: deps.obs,
			events_rx: Mutex::new(Some(events_rx)),
			tasks: Mutex::new(Vec::new()),
			stream_sub: Mutex::new(None),
			started: AtomicBool::new(false),
			shut_down: AtomicBool::new(false),
		}
	}

	pub fn config(&self) -> &ConfigManager {
		&self.config
	}

	pub fn bus(&self) -> &EventBus {
		&self.bus
	}

	pub fn notifications(&self) -> &NotificationManager {
		&self.notifications
	}

	pub fn chat(&self) -> &ChatRouter {
		&self.chat
	}

	pub fn viewers(&self) -> &ViewerCountSystem {
		&self.viewers
	}

	pub fn lifecycle(&self) -> &PlatformLifecycleService {
		&self.lifecycle
	}

	pub fn youtube(&self) -> Option<&MultiStreamManager> {
		self.youtube.as_ref()
	}

	pub fn pushed_viewer_counts(&self) -> &PushedViewerCounts {
		&self.pushed
	}

	/// Start timers, the event loop and every enabled adapter. Runs once.
	pub async fn start(&self, adapters: Vec<Arc<dyn PlatformAdapter>>) {
		if self.started.swap(true, Ordering::SeqCst) {
			debug!("runtime already started");
			return;
		}

		self.notifications.start();
		self.spawn_event_loop();
		self.spawn_stream_listener();

		if let Some(obs) = &self.obs {
			if self.config.obs().enabled {
				let observer = Arc::new(ObsViewerCountObserver::new(obs.clone(), self.config.clone()));
				if let Err(e) = self.viewers.add_observer(observer) {
					warn!(error = %e, "failed to register OBS viewer count observer");
				}
			} else {
				debug!("OBS disabled; viewer counts will not be mirrored");
			}
		}
		self.viewers.initialize().await;

		let started = self.lifecycle.initialize_all_platforms(adapters).await;

		if let Some(youtube) = &self.youtube
			&& let Err(e) = youtube.start_monitoring().await
		{
			warn!(error = %format!("{e:#}"), "youtube monitoring failed to start");
		}

		self.viewers.start_polling();
		info!(platforms = started, "stagecue runtime started");
	}

	fn spawn_event_loop(&self) {
		let Some(mut rx) = self.events_rx.lock().take() else {
			return;
		};
		let dispatcher = Dispatcher {
			chat: self.chat.clone(),
			notifications: self.notifications.clone(),
			viewers: self.viewers.clone(),
			pushed: self.pushed.clone(),
		};
		let task = tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				dispatcher.dispatch(event).await;
			}
			debug!("adapter event channel closed; event loop exiting");
		});
		self.tasks.lock().push(task);
	}

	fn spawn_stream_listener(&self) {
		let (sub, mut rx) = self.bus.subscribe_channel(STREAM_DETECTED);
		let viewers = self.viewers.clone();
		let chat = self.chat.clone();
		let task = tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				if let BusEvent::StreamDetected {
					platform,
					new_stream_ids,
					connection_count,
					..
				} = event
				{
					debug!(%platform, new = new_stream_ids.len(), connection_count, "stream detected");
					if !viewers.is_stream_live(platform) {
						chat.reset_session();
					}
					viewers.update_stream_status(platform, true).await;
				}
			}
		});
		*self.stream_sub.lock() = Some(sub);
		self.tasks.lock().push(task);
	}

	/// Tear down in reverse start order. Idempotent.
	pub async fn shutdown(&self) {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("stagecue runtime shutting down");

		if let Some(youtube) = &self.youtube {
			youtube.shutdown().await;
		}
		self.viewers.stop_polling();
		self.viewers.cleanup().await;
		self.lifecycle.shutdown().await;
		self.retry.shutdown();
		self.notifications.shutdown().await;

		if let Some(sub) = self.stream_sub.lock().take() {
			sub.unsubscribe();
		}
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
		info!("stagecue runtime stopped");
	}
}
