#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use stagecue_domain::{EventType, Platform};
use stagecue_platform::retry::RetryConfig;
use thiserror::Error;
use tracing::{debug, info, warn};


/// Default config path: `~/.stagecue/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".stagecue").join("config.toml"))
}

/// Load the config from TOML at `path` and apply `STAGECUE_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<AppConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = AppConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Configuration problems that refuse a single subsystem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("invalid viewer count polling interval: {0}ms")]
	InvalidPollingInterval(i64),
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
	pub general: GeneralSettings,
	pub cooldowns: CooldownSettings,
	pub spam: SpamSettings,
	pub tts: TtsSettings,
	/// Event name (`follow`, `gift`, ...) to VFX command.
	pub vfx: BTreeMap<String, String>,
	pub obs: ObsSettings,
	pub retry: RetrySettings,
	pub platforms: BTreeMap<Platform, PlatformSettings>,
}

#[derive(Debug, Clone)]
pub struct GeneralSettings {
	/// Raw tick period; validated by `ConfigManager::viewer_count_polling_interval`.
	pub viewer_count_polling_interval_ms: i64,
	pub viewer_count_null_is_error: bool,

	pub user_suppression_enabled: bool,
	pub max_notifications_per_user: u32,
	pub suppression_window: Duration,
	pub suppression_duration: Duration,
	pub suppression_cleanup_interval: Duration,

	pub messages_enabled: bool,
	pub commands_enabled: bool,
	pub greetings_enabled: bool,
	pub farewells_enabled: bool,
	pub follows_enabled: bool,
	pub gifts_enabled: bool,
	pub raids_enabled: bool,
	pub paypiggies_enabled: bool,
	pub shares_enabled: bool,

	pub stream_polling_interval: Duration,
	pub full_check_interval: Duration,
	pub max_streams: usize,

	pub max_platform_init_attempts: u32,
	pub platform_startup_wait: Duration,

	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for GeneralSettings {
	fn default() -> Self {
		AppConfig::default().general
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownSettings {
	pub default_cooldown: Duration,
	pub heavy_command_cooldown: Duration,
	pub heavy_command_threshold: u32,
	pub heavy_command_window: Duration,
	pub max_entries: usize,
}

impl Default for CooldownSettings {
	fn default() -> Self {
		AppConfig::default().cooldowns
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpamSettings {
	pub enabled: bool,
	pub detection_window: Duration,
	pub max_individual_notifications: u32,
	pub low_value_threshold: f64,
	/// Zero disables duplicate detection.
	pub duplicate_window: Duration,
}

impl Default for SpamSettings {
	fn default() -> Self {
		AppConfig::default().spam
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtsSettings {
	pub enabled: bool,
	pub max_chars: usize,
	pub speak_chat: bool,
}

impl Default for TtsSettings {
	fn default() -> Self {
		AppConfig::default().tts
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObsSettings {
	pub enabled: bool,
	pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub exponent_cap: u32,
}

impl Default for RetrySettings {
	fn default() -> Self {
		let d = RetryConfig::default();
		Self {
			base_delay: d.base_delay,
			max_delay: d.max_delay,
			exponent_cap: d.exponent_cap,
		}
	}
}

impl From<RetrySettings> for RetryConfig {
	fn from(s: RetrySettings) -> Self {
		RetryConfig {
			base_delay: s.base_delay,
			max_delay: s.max_delay,
			exponent_cap: s.exponent_cap,
		}
	}
}

/// Per-platform table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSettings {
	pub enabled: bool,
	/// Channel or account name; the YouTube channel handle for multi-stream.
	pub username: Option<String>,
	pub notifications_enabled: bool,
	pub viewer_count_enabled: bool,
	/// OBS input name receiving the formatted viewer count.
	pub viewer_count_source: Option<String>,
}

/// Feature switches under `general`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
	Messages,
	Commands,
	Greetings,
	Farewells,
	Follows,
	Gifts,
	Raids,
	Paypiggies,
	Shares,
}

impl Feature {
	/// Switch gating an event type.
	pub fn for_event(event_type: EventType) -> Feature {
		match event_type {
			EventType::Follow => Feature::Follows,
			EventType::Gift | EventType::Envelope => Feature::Gifts,
			EventType::Paypiggy | EventType::Subscriber => Feature::Paypiggies,
			EventType::Raid => Feature::Raids,
			EventType::Share => Feature::Shares,
			EventType::Chat => Feature::Messages,
			EventType::Greeting => Feature::Greetings,
			EventType::Farewell => Feature::Farewells,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	general: FileGeneral,
	#[serde(default)]
	cooldowns: FileCooldowns,
	#[serde(default)]
	spam: FileSpam,
	#[serde(default)]
	tts: FileTts,
	#[serde(default)]
	vfx: BTreeMap<String, String>,
	#[serde(default)]
	obs: FileObs,
	#[serde(default)]
	retry: FileRetry,

	#[serde(default)]
	youtube: FilePlatform,
	#[serde(default)]
	twitch: FilePlatform,
	#[serde(default)]
	tiktok: FilePlatform,
	#[serde(default)]
	streamelements: FilePlatform,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileGeneral {
	viewer_count_polling_interval_ms: Option<i64>,
	viewer_count_null_is_error: Option<bool>,

	user_suppression_enabled: Option<bool>,
	max_notifications_per_user: Option<u32>,
	suppression_window_ms: Option<u64>,
	suppression_duration_ms: Option<u64>,
	suppression_cleanup_interval_ms: Option<u64>,

	messages_enabled: Option<bool>,
	commands_enabled: Option<bool>,
	greetings_enabled: Option<bool>,
	farewells_enabled: Option<bool>,
	follows_enabled: Option<bool>,
	gifts_enabled: Option<bool>,
	raids_enabled: Option<bool>,
	paypiggies_enabled: Option<bool>,
	shares_enabled: Option<bool>,

	/// Seconds.
	stream_polling_interval: Option<u64>,
	/// Milliseconds.
	full_check_interval: Option<u64>,
	max_streams: Option<usize>,

	max_platform_init_attempts: Option<u32>,
	platform_startup_wait_ms: Option<u64>,

	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCooldowns {
	default_cooldown_ms: Option<u64>,
	heavy_command_cooldown_ms: Option<u64>,
	heavy_command_threshold: Option<u32>,
	heavy_command_window_ms: Option<u64>,
	max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSpam {
	enabled: Option<bool>,
	/// Seconds.
	detection_window: Option<u64>,
	max_individual_notifications: Option<u32>,
	low_value_threshold: Option<f64>,
	duplicate_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileTts {
	enabled: Option<bool>,
	max_chars: Option<usize>,
	speak_chat: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileObs {
	enabled: Option<bool>,
	address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRetry {
	base_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
	exponent_cap: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePlatform {
	enabled: Option<bool>,
	username: Option<String>,
	notifications_enabled: Option<bool>,
	viewer_count_enabled: Option<bool>,
	viewer_count_source: Option<String>,
}

impl FilePlatform {
	fn resolve(self) -> PlatformSettings {
		PlatformSettings {
			enabled: self.enabled.unwrap_or(false),
			username: self.username.filter(|s| !s.trim().is_empty()),
			notifications_enabled: self.notifications_enabled.unwrap_or(true),
			viewer_count_enabled: self.viewer_count_enabled.unwrap_or(false),
			viewer_count_source: self.viewer_count_source.filter(|s| !s.trim().is_empty()),
		}
	}
}

impl Default for AppConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl AppConfig {
	/// Parse TOML text without touching the environment.
	pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
		let file: FileConfig = toml::from_str(s).context("parse TOML")?;
		Ok(Self::from_file(file))
	}

	fn from_file(file: FileConfig) -> Self {
		let g = file.general;
		let general = GeneralSettings {
			viewer_count_polling_interval_ms: g.viewer_count_polling_interval_ms.unwrap_or(60_000),
			viewer_count_null_is_error: g.viewer_count_null_is_error.unwrap_or(true),

			user_suppression_enabled: g.user_suppression_enabled.unwrap_or(true),
			max_notifications_per_user: g.max_notifications_per_user.unwrap_or(5),
			suppression_window: Duration::from_millis(g.suppression_window_ms.unwrap_or(60_000)),
			suppression_duration: Duration::from_millis(g.suppression_duration_ms.unwrap_or(300_000)),
			suppression_cleanup_interval: Duration::from_millis(g.suppression_cleanup_interval_ms.unwrap_or(300_000)),

			messages_enabled: g.messages_enabled.unwrap_or(true),
			commands_enabled: g.commands_enabled.unwrap_or(true),
			greetings_enabled: g.greetings_enabled.unwrap_or(true),
			farewells_enabled: g.farewells_enabled.unwrap_or(true),
			follows_enabled: g.follows_enabled.unwrap_or(true),
			gifts_enabled: g.gifts_enabled.unwrap_or(true),
			raids_enabled: g.raids_enabled.unwrap_or(true),
			paypiggies_enabled: g.paypiggies_enabled.unwrap_or(true),
			shares_enabled: g.shares_enabled.unwrap_or(true),

			stream_polling_interval: Duration::from_secs(g.stream_polling_interval.unwrap_or(60)),
			full_check_interval: Duration::from_millis(g.full_check_interval.unwrap_or(300_000)),
			max_streams: g.max_streams.unwrap_or(2),

			max_platform_init_attempts: g.max_platform_init_attempts.unwrap_or(5).max(1),
			platform_startup_wait: Duration::from_millis(g.platform_startup_wait_ms.unwrap_or(10_000)),

			metrics_bind: g.metrics_bind.filter(|s| !s.trim().is_empty()),
		};

		let c = file.cooldowns;
		let cooldowns = CooldownSettings {
			default_cooldown: Duration::from_millis(c.default_cooldown_ms.unwrap_or(60_000)),
			heavy_command_cooldown: Duration::from_millis(c.heavy_command_cooldown_ms.unwrap_or(300_000)),
			heavy_command_threshold: c.heavy_command_threshold.unwrap_or(4),
			heavy_command_window: Duration::from_millis(c.heavy_command_window_ms.unwrap_or(360_000)),
			max_entries: c.max_entries.unwrap_or(1000).max(1),
		};

		let s = file.spam;
		let spam = SpamSettings {
			enabled: s.enabled.unwrap_or(true),
			detection_window: Duration::from_secs(s.detection_window.unwrap_or(5)),
			max_individual_notifications: s.max_individual_notifications.unwrap_or(2),
			low_value_threshold: s.low_value_threshold.filter(|v| v.is_finite()).unwrap_or(10.0),
			duplicate_window: Duration::from_millis(s.duplicate_window_ms.unwrap_or(0)),
		};

		let tts = TtsSettings {
			enabled: file.tts.enabled.unwrap_or(false),
			max_chars: file.tts.max_chars.unwrap_or(200).max(1),
			speak_chat: file.tts.speak_chat.unwrap_or(false),
		};

		let vfx = file
			.vfx
			.into_iter()
			.map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
			.filter(|(k, v)| !k.is_empty() && !v.is_empty())
			.collect();

		let retry_default = RetrySettings::default();
		let retry = RetrySettings {
			base_delay: file
				.retry
				.base_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(retry_default.base_delay),
			max_delay: file
				.retry
				.max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(retry_default.max_delay),
			exponent_cap: file.retry.exponent_cap.unwrap_or(retry_default.exponent_cap),
		};

		let platforms = BTreeMap::from([
			(Platform::YouTube, file.youtube.resolve()),
			(Platform::Twitch, file.twitch.resolve()),
			(Platform::TikTok, file.tiktok.resolve()),
			(Platform::StreamElements, file.streamelements.resolve()),
		]);

		Self {
			general,
			cooldowns,
			spam,
			tts,
			vfx,
			obs: ObsSettings {
				enabled: file.obs.enabled.unwrap_or(false),
				address: file.obs.address.filter(|s| !s.trim().is_empty()),
			},
			retry,
			platforms,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			debug!(path = %path.display(), "config file not found; using defaults");
			Ok(None)
		}
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_key(platform: Platform, suffix: &str) -> String {
	format!("STAGECUE_{}_{suffix}", platform.as_str().to_ascii_uppercase())
}

/// Apply `STAGECUE_*` overrides read through `var`.
fn apply_env_overrides(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
	if let Some(v) = var("STAGECUE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.general.metrics_bind = Some(v);
			info!("general config: metrics_bind overridden by env");
		}
	}

	if let Some(v) = var("STAGECUE_VIEWER_COUNT_POLLING_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<i64>()
	{
		cfg.general.viewer_count_polling_interval_ms = ms;
		info!(ms, "general config: viewer_count_polling_interval_ms overridden by env");
	}

	if let Some(v) = var("STAGECUE_MAX_STREAMS")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.general.max_streams = max;
		info!(max, "general config: max_streams overridden by env");
	}

	if let Some(v) = var("STAGECUE_TTS_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.tts.enabled = enabled;
		info!(enabled, "tts config: enabled overridden by env");
	}

	if let Some(v) = var("STAGECUE_SPAM_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.spam.enabled = enabled;
		info!(enabled, "spam config: enabled overridden by env");
	}

	if let Some(v) = var("STAGECUE_OBS_ADDRESS") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.obs.address = Some(v);
			cfg.obs.enabled = true;
			info!("obs config: address overridden by env");
		}
	}

	for (platform, section) in cfg.platforms.iter_mut() {
		let platform = *platform;
		if let Some(v) = var(&env_key(platform, "ENABLED")) {
			match parse_env_bool(&v) {
				Some(enabled) => {
					section.enabled = enabled;
					info!(%platform, enabled, "platform config: enabled overridden by env");
				}
				None => warn!(%platform, value = %v, "ignoring unparsable enabled override"),
			}
		}

		if let Some(v) = var(&env_key(platform, "USERNAME")) {
			let v = v.trim().to_string();
			if !v.is_empty() {
				section.username = Some(v);
				info!(%platform, "platform config: username overridden by env");
			}
		}
	}
}

/// Shared read-only view over the resolved configuration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
	inner: Arc<AppConfig>,
}

impl Default for ConfigManager {
	fn default() -> Self {
		Self::new(AppConfig::default())
	}
}

impl ConfigManager {
	pub fn new(config: AppConfig) -> Self {
		Self { inner: Arc::new(config) }
	}

	pub fn config(&self) -> &AppConfig {
		&self.inner
	}

	pub fn general(&self) -> &GeneralSettings {
		&self.inner.general
	}

	pub fn cooldowns(&self) -> CooldownSettings {
		self.inner.cooldowns
	}

	pub fn spam(&self) -> SpamSettings {
		self.inner.spam
	}

	pub fn tts(&self) -> TtsSettings {
		self.inner.tts
	}

	pub fn obs(&self) -> &ObsSettings {
		&self.inner.obs
	}

	pub fn retry(&self) -> RetryConfig {
		self.inner.retry.into()
	}

	/// Per-platform section; absent tables resolve to disabled defaults.
	pub fn platform_section(&self, platform: Platform) -> PlatformSettings {
		self.inner.platforms.get(&platform).cloned().unwrap_or_default()
	}

	pub fn are_notifications_enabled(&self, platform: Platform) -> bool {
		self.inner
			.platforms
			.get(&platform)
			.is_none_or(|s| s.notifications_enabled)
	}

	pub fn is_enabled(&self, feature: Feature) -> bool {
		let g = &self.inner.general;
		match feature {
			Feature::Messages => g.messages_enabled,
			Feature::Commands => g.commands_enabled,
			Feature::Greetings => g.greetings_enabled,
			Feature::Farewells => g.farewells_enabled,
			Feature::Follows => g.follows_enabled,
			Feature::Gifts => g.gifts_enabled,
			Feature::Raids => g.raids_enabled,
			Feature::Paypiggies => g.paypiggies_enabled,
			Feature::Shares => g.shares_enabled,
		}
	}

	/// Enabled platforms in registration order.
	pub fn platforms(&self) -> Vec<Platform> {
		Platform::ALL
			.into_iter()
			.filter(|p| self.inner.platforms.get(p).is_some_and(|s| s.enabled))
			.collect()
	}

	/// VFX command mapped to an event, if any.
	pub fn vfx_command(&self, event_type: EventType) -> Option<&str> {
		self.inner.vfx.get(event_type.as_str()).map(String::as_str)
	}

	/// `None` when polling is disabled (zero); negative values are refused.
	pub fn viewer_count_polling_interval(&self) -> Result<Option<Duration>, ConfigError> {
		match self.inner.general.viewer_count_polling_interval_ms {
			ms if ms < 0 => Err(ConfigError::InvalidPollingInterval(ms)),
			0 => Ok(None),
			ms => Ok(Some(Duration::from_millis(ms as u64))),
		}
	}
}
