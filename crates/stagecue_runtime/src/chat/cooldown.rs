#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CooldownSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
	Allowed,
	CoolingDown { remaining: Duration },
}

#[derive(Debug, Default)]
struct State {
	/// `(user, command)` → last accepted use.
	last_use: HashMap<(String, String), Instant>,
	/// command → accepted uses inside the heavy window, all users.
	usage: HashMap<String, VecDeque<Instant>>,
}

/// Per-user, per-command cooldowns with a heavier cooldown for commands that
/// are popular across the whole chat.
#[derive(Debug)]
pub struct CommandCooldowns {
	config: CooldownSettings,
	state: Mutex<State>,
}

impl CommandCooldowns {
	pub fn new(config: CooldownSettings) -> Self {
		Self {
			config,
			state: Mutex::new(State::default()),
		}
	}

	/// Cooldown currently applied to `command`.
	pub fn cooldown_for(&self, command: &str, now: Instant) -> Duration {
		let mut state = self.state.lock();
		self.active_cooldown(&mut state, command, now)
	}

	fn active_cooldown(&self, state: &mut State, command: &str, now: Instant) -> Duration {
		let window = self.config.heavy_command_window;
		let Some(uses) = state.usage.get_mut(command) else {
			return self.config.default_cooldown;
		};
		while uses.front().is_some_and(|t| now.duration_since(*t) >= window) {
			uses.pop_front();
		}
		if uses.len() > self.config.heavy_command_threshold as usize {
			self.config.heavy_command_cooldown
		} else {
			self.config.default_cooldown
		}
	}

	/// Accept and record the use, or report how long `user` still has to wait.
	pub fn check_and_record(&self, user: &str, command: &str, now: Instant) -> CooldownDecision {
		let mut state = self.state.lock();
		let cooldown = self.active_cooldown(&mut state, command, now);
		let key = (user.to_string(), command.to_string());

		if let Some(last) = state.last_use.get(&key) {
			let elapsed = now.duration_since(*last);
			if elapsed < cooldown {
				return CooldownDecision::CoolingDown {
					remaining: cooldown - elapsed,
				};
			}
		}

		state.last_use.insert(key, now);
		state.usage.entry(command.to_string()).or_default().push_back(now);

		while state.last_use.len() > self.config.max_entries {
			let Some(oldest) = state.last_use.iter().min_by_key(|(_, t)| **t).map(|(k, _)| k.clone()) else {
				break;
			};
			state.last_use.remove(&oldest);
		}
		self.prune_usage(&mut state, now);
		CooldownDecision::Allowed
	}

	/// Drop uses outside the heavy window for every command and keep at most
	/// `max_entries` commands, evicting the least recently used.
	fn prune_usage(&self, state: &mut State, now: Instant) {
		let window = self.config.heavy_command_window;
		state.usage.retain(|_, uses| {
			while uses.front().is_some_and(|t| now.duration_since(*t) >= window) {
				uses.pop_front();
			}
			!uses.is_empty()
		});

		while state.usage.len() > self.config.max_entries {
			let Some(stalest) = state
				.usage
				.iter()
				.filter_map(|(cmd, uses)| uses.back().map(|t| (cmd, *t)))
				.min_by_key(|(_, t)| *t)
				.map(|(cmd, _)| cmd.clone())
			else {
				break;
			};
			state.usage.remove(&stalest);
		}
	}

	pub fn tracked_entries(&self) -> usize {
		self.state.lock().last_use.len()
	}

	pub fn tracked_commands(&self) -> usize {
		self.state.lock().usage.len()
	}

	pub fn clear(&self) {
		*self.state.lock() = State::default();
	}
}
