#![forbid(unsafe_code)]

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Saturating millisecond count of a duration.
	#[inline]
	pub fn duration_ms(d: Duration) -> u64 {
		u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
	}
}

pub mod sanitize {
	/// Maximum length of a chat command name (without the `!`).
	pub const MAX_COMMAND_LEN: usize = 32;

	/// Clean text before it reaches a speech engine.
	///
	/// Drops control characters and links, collapses whitespace and truncates to
	/// `max_chars`. Returns `None` when nothing speakable remains.
	pub fn sanitize_tts(text: &str, max_chars: usize) -> Option<String> {
		let mut words: Vec<String> = Vec::new();
		for word in text.split_whitespace() {
			if is_link(word) {
				continue;
			}
			let cleaned: String = word
				.chars()
				.filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '{' | '}' | '\\' | '`'))
				.collect();
			if !cleaned.is_empty() {
				words.push(cleaned);
			}
		}

		let joined = words.join(" ");
		let truncated: String = joined.chars().take(max_chars).collect();
		let truncated = truncated.trim().to_string();
		if truncated.chars().any(|c| c.is_alphanumeric()) {
			Some(truncated)
		} else {
			None
		}
	}

	/// Normalize a `!command` message to `!name` (lowercase).
	///
	/// The name must be 1..=32 ASCII alphanumerics, `_` or `-`.
	pub fn sanitize_command(message: &str) -> Option<String> {
		let rest = message.trim_start().strip_prefix('!')?;
		let name = rest.split_whitespace().next()?;
		if name.is_empty() || name.len() > MAX_COMMAND_LEN {
			return None;
		}
		if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
			return None;
		}
		Some(format!("!{}", name.to_ascii_lowercase()))
	}

	/// Case-insensitive key for per-user bookkeeping.
	pub fn user_key(platform: &str, username: &str) -> String {
		format!("{}:{}", platform, username.trim().to_lowercase())
	}

	fn is_link(word: &str) -> bool {
		let lower = word.to_ascii_lowercase();
		lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("www.")
	}

}
