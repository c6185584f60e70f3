#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use stagecue_domain::{DisplayItem, EventType, Platform, Priority};
use stagecue_platform::{ChatPayload, DisplayQueue, TtsService, VfxCommandService, VfxContext};

use crate::chat::{ChatDeps, ChatRouter, CommandOutcome, is_farewell};
use crate::config::AppConfig;
use crate::config::ConfigManager;

#[derive(Default)]
struct Queue {
	items: Mutex<Vec<DisplayItem>>,
}

impl Queue {
	fn kinds(&self) -> Vec<EventType> {
		self.items.lock().iter().map(|i| i.kind).collect()
	}
}

impl DisplayQueue for Queue {
	fn add_item(&self, item: DisplayItem) -> anyhow::Result<()> {
		self.items.lock().push(item);
		Ok(())
	}
}

#[derive(Default)]
struct Tts {
	spoken: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl TtsService for Tts {
	async fn speak(&self, _platform: Platform, text: &str) -> anyhow::Result<()> {
		self.spoken.lock().push(text.to_string());
		Ok(())
	}
}

#[derive(Default)]
struct Vfx {
	fail: bool,
	hang: bool,
	executed: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl VfxCommandService for Vfx {
	async fn execute(&self, command: &str, ctx: &VfxContext) -> anyhow::Result<()> {
		if self.hang {
			std::future::pending::<()>().await;
		}
		if self.fail {
			anyhow::bail!("effect crashed");
		}
		self.executed.lock().push((command.to_string(), ctx.username.clone()));
		Ok(())
	}
}

struct Harness {
	router: ChatRouter,
	queue: Arc<Queue>,
	tts: Arc<Tts>,
	vfx: Arc<Vfx>,
}

fn harness_with(cfg: AppConfig, vfx: Vfx) -> Harness {
	let queue = Arc::new(Queue::default());
	let tts = Arc::new(Tts::default());
	let vfx = Arc::new(vfx);
	let router = ChatRouter::new(ChatDeps {
		config: ConfigManager::new(cfg),
		display: queue.clone(),
		tts: Some(tts.clone()),
		vfx: Some(vfx.clone()),
	});
	Harness { router, queue, tts, vfx }
}

fn harness(cfg: AppConfig) -> Harness {
	harness_with(cfg, Vfx::default())
}

async fn settle() {
	for _ in 0..16 {
		tokio::task::yield_now().await;
	}
}

fn first(user: &str, message: &str) -> ChatPayload {
	let mut chat = ChatPayload::new(user, message);
	chat.is_first_message = true;
	chat
}

#[tokio::test]
async fn chat_items_have_chat_priority() {
	let h = harness(AppConfig::default());
	let outcome = h.router.route_chat(Platform::Twitch, ChatPayload::new("amy", "hello there")).await;
	assert!(outcome.displayed);
	assert!(!outcome.greeted);

	let items = h.queue.items.lock();
	assert_eq!(items.len(), 1);
	assert_eq!(items[0].priority, Priority::Chat);
	assert_eq!(items[0].data.display_message, "hello there");
}

#[tokio::test]
async fn greets_first_message_once_per_session() {
	let h = harness(AppConfig::default());

	assert!(h.router.route_chat(Platform::YouTube, first("ben", "hi")).await.greeted);
	assert!(!h.router.route_chat(Platform::YouTube, first("BEN", "hi again")).await.greeted);
	assert!(!h.router.route_chat(Platform::YouTube, ChatPayload::new("cat", "hi")).await.greeted);
	assert_eq!(
		h.queue.kinds(),
		vec![EventType::Chat, EventType::Greeting, EventType::Chat, EventType::Chat]
	);

	h.router.reset_session();
	assert!(h.router.route_chat(Platform::YouTube, first("ben", "back")).await.greeted);
}

#[tokio::test]
async fn greetings_respect_the_switch() {
	let mut cfg = AppConfig::default();
	cfg.general.greetings_enabled = false;
	cfg.general.messages_enabled = false;
	let h = harness(cfg);

	let outcome = h.router.route_chat(Platform::TikTok, first("dan", "hey")).await;
	assert!(!outcome.displayed);
	assert!(!outcome.greeted);
	assert!(h.queue.items.lock().is_empty());
}

#[tokio::test]
async fn farewells_match_phrases_once() {
	let h = harness(AppConfig::default());
	assert!(h.router.route_chat(Platform::Twitch, ChatPayload::new("eve", "Goodnight all")).await.farewelled);
	assert!(!h.router.route_chat(Platform::Twitch, ChatPayload::new("eve", "bye")).await.farewelled);
	assert!(!h.router.route_chat(Platform::Twitch, ChatPayload::new("fin", "byte me")).await.farewelled);

	let items = h.queue.items.lock();
	let farewell = items.iter().find(|i| i.kind == EventType::Farewell).unwrap();
	assert_eq!(farewell.data.display_message, "Goodbye, eve!");
}

#[test]
fn farewell_phrases() {
	for yes in ["bye", "Byeee", "good night!", "gn everyone", "see ya", "later folks", "peace out"] {
		assert!(is_farewell(yes), "{yes}");
	}
	for no in ["goodbyes are hard", "byte", "i'll see", "gnome", "collateral"] {
		assert!(!is_farewell(no), "{no}");
	}
}

#[tokio::test]
async fn commands_run_under_cooldown() {
	let h = harness(AppConfig::default());

	let first = h.router.route_chat(Platform::Twitch, ChatPayload::new("gus", "!Confetti now")).await;
	assert_eq!(
		first.command,
		Some(CommandOutcome::Executed {
			command: "!confetti".to_string()
		})
	);
	let second = h.router.route_chat(Platform::Twitch, ChatPayload::new("gus", "!confetti")).await;
	assert!(matches!(second.command, Some(CommandOutcome::CoolingDown { .. })));

	let other = h.router.route_chat(Platform::Twitch, ChatPayload::new("hal", "!confetti")).await;
	assert!(matches!(other.command, Some(CommandOutcome::Executed { .. })));
	assert_eq!(
		*h.vfx.executed.lock(),
		vec![
			("!confetti".to_string(), "gus".to_string()),
			("!confetti".to_string(), "hal".to_string())
		]
	);
}

#[tokio::test]
async fn malformed_and_disabled_commands_are_ignored() {
	let h = harness(AppConfig::default());
	let outcome = h.router.route_chat(Platform::Twitch, ChatPayload::new("ivy", "!no/pe")).await;
	assert_eq!(outcome.command, None);

	let mut cfg = AppConfig::default();
	cfg.general.commands_enabled = false;
	let off = harness(cfg);
	let outcome = off.router.route_chat(Platform::Twitch, ChatPayload::new("ivy", "!boom")).await;
	assert_eq!(outcome.command, None);
	assert!(off.vfx.executed.lock().is_empty());
}

#[tokio::test]
async fn vfx_failures_are_reported_not_raised() {
	let h = harness_with(
		AppConfig::default(),
		Vfx {
			fail: true,
			..Vfx::default()
		},
	);
	let outcome = h.router.route_chat(Platform::Twitch, ChatPayload::new("jay", "!boom")).await;
	assert!(outcome.displayed);
	assert!(matches!(outcome.command, Some(CommandOutcome::Failed { .. })));
}

#[tokio::test(start_paused = true)]
async fn stalled_vfx_commands_time_out() {
	let h = harness_with(
		AppConfig::default(),
		Vfx {
			hang: true,
			..Vfx::default()
		},
	);
	let outcome = h.router.route_chat(Platform::Twitch, ChatPayload::new("jay", "!boom")).await;
	match outcome.command {
		Some(CommandOutcome::Failed { command, error }) => {
			assert_eq!(command, "!boom");
			assert!(error.contains("timed out"), "{error}");
		}
		other => panic!("expected a failed command, got {other:?}"),
	}
	let next = h.router.route_chat(Platform::Twitch, ChatPayload::new("kay", "still here")).await;
	assert!(next.displayed);
}

#[tokio::test]
async fn chat_is_spoken_only_when_asked() {
	let mut cfg = AppConfig::default();
	cfg.tts.enabled = true;
	let quiet = harness(cfg.clone());
	quiet.router.route_chat(Platform::Twitch, ChatPayload::new("kim", "hello")).await;
	settle().await;
	assert!(quiet.tts.spoken.lock().is_empty());

	cfg.tts.speak_chat = true;
	let loud = harness(cfg);
	loud.router.route_chat(Platform::Twitch, ChatPayload::new("kim", "hello")).await;
	settle().await;
	assert_eq!(*loud.tts.spoken.lock(), vec!["kim says hello".to_string()]);
}

#[tokio::test]
async fn empty_messages_are_rejected() {
	let h = harness(AppConfig::default());
	let outcome = h.router.route_chat(Platform::Twitch, ChatPayload::new("lee", "   ")).await;
	assert!(outcome.rejected.is_some());
	assert!(h.queue.items.lock().is_empty());
}
