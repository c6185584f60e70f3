#![forbid(unsafe_code)]

//! Chat routing: display, greetings, farewells and `!commands`.

pub mod cooldown;

#[cfg(test)]
mod router_tests;

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use stagecue_domain::{DisplayItem, EventType, NormalizedEvent, Platform};
use stagecue_platform::{ChatPayload, DisplayQueue, TtsService, VfxCommandService, VfxContext};
use stagecue_util::sanitize::{sanitize_command, sanitize_tts, user_key};
use stagecue_util::time::duration_ms;
use tokio::time::Instant;
use tracing::{debug, warn};

use self::cooldown::{CommandCooldowns, CooldownDecision};
use crate::config::{ConfigManager, Feature};
use crate::effects::{guarded, spawn_guarded};
use crate::messages::{chat_event, salutation_event};

static FAREWELL: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)^\s*(bye+|goodbye|good\s*night|gn|cya|see\s+(you|ya)|peace\s+out|later)\b")
		.expect("farewell pattern is valid")
});

pub fn is_farewell(message: &str) -> bool {
	FAREWELL.is_match(message)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
	Executed { command: String },
	CoolingDown { command: String, remaining: Duration },
	/// No VFX service wired.
	Unhandled { command: String },
	Failed { command: String, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatOutcome {
	pub displayed: bool,
	pub greeted: bool,
	pub farewelled: bool,
	pub command: Option<CommandOutcome>,
	/// Validation error when the message could not be turned into an event.
	pub rejected: Option<String>,
}

#[derive(Clone)]
pub struct ChatDeps {
	pub config: ConfigManager,
	pub display: Arc<dyn DisplayQueue>,
	pub tts: Option<Arc<dyn TtsService>>,
	pub vfx: Option<Arc<dyn VfxCommandService>>,
}

struct Inner {
	deps: ChatDeps,
	cooldowns: CommandCooldowns,
	greeted: Mutex<HashSet<String>>,
	farewelled: Mutex<HashSet<String>>,
	origin: Instant,
}

#[derive(Clone)]
pub struct ChatRouter {
	inner: Arc<Inner>,
}

impl ChatRouter {
	pub fn new(deps: ChatDeps) -> Self {
		let cooldowns = CommandCooldowns::new(deps.config.cooldowns());
		Self {
			inner: Arc::new(Inner {
				deps,
				cooldowns,
				greeted: Mutex::new(HashSet::new()),
				farewelled: Mutex::new(HashSet::new()),
				origin: Instant::now(),
			}),
		}
	}

	/// Forget greetings and farewells; the next session starts fresh.
	pub fn reset_session(&self) {
		self.inner.greeted.lock().clear();
		self.inner.farewelled.lock().clear();
		debug!("chat session reset");
	}

	pub fn cooldowns(&self) -> &CommandCooldowns {
		&self.inner.cooldowns
	}

	pub async fn route_chat(&self, platform: Platform, chat: ChatPayload) -> ChatOutcome {
		let inner = &self.inner;
		let config = &inner.deps.config;
		let mut outcome = ChatOutcome::default();

		let now = Instant::now();
		let event = match chat_event(platform, &chat, duration_ms(now.duration_since(inner.origin))) {
			Ok(ev) => ev,
			Err(e) => {
				debug!(%platform, error = %e, "chat message rejected");
				outcome.rejected = Some(e.to_string());
				return outcome;
			}
		};
		metrics::counter!("stagecue_chat_messages_total", "platform" => platform.as_str()).increment(1);
		let key = user_key(platform.as_str(), &event.username);

		if config.is_enabled(Feature::Messages) {
			outcome.displayed = inner.display(DisplayItem::from_event(event.clone()));
			if outcome.displayed && config.tts().speak_chat {
				inner.speak(platform, &event.tts_message);
			}
		}

		if config.is_enabled(Feature::Greetings) && chat.is_first_message && inner.greeted.lock().insert(key.clone()) {
			outcome.greeted = inner.salute(EventType::Greeting, &event);
		}

		if config.is_enabled(Feature::Farewells) && is_farewell(&chat.message) && inner.farewelled.lock().insert(key.clone())
		{
			outcome.farewelled = inner.salute(EventType::Farewell, &event);
		}

		if config.is_enabled(Feature::Commands)
			&& let Some(command) = sanitize_command(&chat.message)
		{
			outcome.command = Some(inner.run_command(&key, command, &event, now).await);
		}

		outcome
	}
}

impl Inner {
	fn display(&self, item: DisplayItem) -> bool {
		let platform = item.platform;
		match self.deps.display.add_item(item) {
			Ok(()) => true,
			Err(e) => {
				warn!(%platform, error = %e, "display queue rejected chat item");
				false
			}
		}
	}

	fn speak(&self, platform: Platform, text: &str) {
		let tts_cfg = self.deps.config.tts();
		if !tts_cfg.enabled {
			return;
		}
		if let Some(tts) = self.deps.tts.clone()
			&& let Some(text) = sanitize_tts(text, tts_cfg.max_chars)
		{
			spawn_guarded("tts", platform, async move { tts.speak(platform, &text).await });
		}
	}

	fn salute(&self, kind: EventType, chat: &NormalizedEvent) -> bool {
		let event = salutation_event(kind, chat);
		let tts = event.tts_message.clone();
		let platform = event.platform;
		if !self.display(DisplayItem::with_kind(kind, event)) {
			return false;
		}
		debug!(%platform, user = %chat.username, %kind, "salutation enqueued");
		self.speak(platform, &tts);
		true
	}

	async fn run_command(&self, key: &str, command: String, event: &NormalizedEvent, now: Instant) -> CommandOutcome {
		let platform = event.platform;
		let result = match self.deps.vfx.as_ref() {
			None => CommandOutcome::Unhandled { command },
			Some(vfx) => match self.cooldowns.check_and_record(key, &command, now) {
				CooldownDecision::CoolingDown { remaining } => {
					debug!(%platform, user = %event.username, command, remaining_ms = duration_ms(remaining), "command on cooldown");
					CommandOutcome::CoolingDown { command, remaining }
				}
				CooldownDecision::Allowed => {
					let ctx = VfxContext {
						platform,
						username: event.username.clone(),
						event_type: None,
					};
					match guarded("vfx", vfx.execute(&command, &ctx)).await {
						Ok(()) => CommandOutcome::Executed { command },
						Err(e) => {
							warn!(%platform, command, error = %e, "vfx command failed");
							CommandOutcome::Failed {
								command,
								error: format!("{e:#}"),
							}
						}
					}
				}
			},
		};

		let label = match &result {
			CommandOutcome::Executed { .. } => "executed",
			CommandOutcome::CoolingDown { .. } => "cooldown",
			CommandOutcome::Unhandled { .. } => "unhandled",
			CommandOutcome::Failed { .. } => "failed",
		};
		metrics::counter!("stagecue_chat_commands_total", "outcome" => label).increment(1);
		result
	}
}
