#![forbid(unsafe_code)]

//! Per-stream connection state for YouTube live chat.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
	/// Attempt made, chat handshake not complete.
	Pending,
	/// Chat can receive messages now.
	Ready,
	Broken,
	Terminated,
}

impl ConnectionStatus {
	/// Pending or ready.
	pub fn is_active(self) -> bool {
		matches!(self, Self::Pending | Self::Ready)
	}
}

impl fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Pending => "pending",
			Self::Ready => "ready",
			Self::Broken => "broken",
			Self::Terminated => "terminated",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
	pub video_id: String,
	pub status: ConnectionStatus,
	pub created_at: Instant,
	pub last_ready_at: Option<Instant>,
	pub last_error: Option<String>,
}

/// A live chat session for one video.
#[async_trait::async_trait]
pub trait ChatConnection: Send + Sync {
	async fn disconnect(&self, reason: &str) -> anyhow::Result<()>;
}

/// Opens chat sessions; implemented by the YouTube chat client.
#[async_trait::async_trait]
pub trait YouTubeChatConnector: Send + Sync {
	/// Start a chat session. Readiness and later breakage are reported through `reporter`.
	async fn connect(&self, video_id: &str, reporter: ConnectionReporter) -> anyhow::Result<Box<dyn ChatConnection>>;
}

struct Entry {
	state: ConnectionState,
	attempt_id: u64,
	connection: Option<Arc<dyn ChatConnection>>,
}

#[derive(Default)]
struct Inner {
	next_attempt: u64,
	entries: Vec<Entry>,
}

/// Ordered map `video_id -> state`. Insertion order is preserved.
#[derive(Clone, Default)]
pub struct ConnectionManager {
	inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for ConnectionManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list().entries(self.snapshot()).finish()
	}
}

impl ConnectionManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a new attempt, replacing any previous record for `video_id`.
	///
	/// Returns the attempt id reporters are bound to.
	pub fn register_pending(&self, video_id: &str) -> u64 {
		let mut inner = self.inner.lock();
		inner.next_attempt += 1;
		let attempt_id = inner.next_attempt;
		let state = ConnectionState {
			video_id: video_id.to_string(),
			status: ConnectionStatus::Pending,
			created_at: Instant::now(),
			last_ready_at: None,
			last_error: None,
		};
		match inner.entries.iter_mut().find(|e| e.state.video_id == video_id) {
			Some(entry) => {
				entry.state = state;
				entry.attempt_id = attempt_id;
				entry.connection = None;
			}
			None => inner.entries.push(Entry {
				state,
				attempt_id,
				connection: None,
			}),
		}
		debug!(video_id, attempt_id, "connection pending");
		attempt_id
	}

	/// Attach the live session to its pending record.
	///
	/// Returns `false` (and hands the session back) when the record is gone or
	/// belongs to a newer attempt.
	pub fn attach(
		&self,
		video_id: &str,
		attempt_id: u64,
		connection: Arc<dyn ChatConnection>,
	) -> Result<(), Arc<dyn ChatConnection>> {
		let mut inner = self.inner.lock();
		match inner
			.entries
			.iter_mut()
			.find(|e| e.state.video_id == video_id && e.attempt_id == attempt_id)
		{
			Some(entry) if entry.state.status.is_active() => {
				entry.connection = Some(connection);
				Ok(())
			}
			_ => Err(connection),
		}
	}

	pub fn mark_ready(&self, video_id: &str) -> bool {
		self.transition(video_id, None, |state| {
			if !state.status.is_active() {
				return false;
			}
			state.status = ConnectionStatus::Ready;
			state.last_ready_at = Some(Instant::now());
			true
		})
	}

	pub fn mark_broken(&self, video_id: &str, error: impl fmt::Display) -> bool {
		let error = error.to_string();
		self.transition(video_id, None, |state| {
			state.status = ConnectionStatus::Broken;
			state.last_error = Some(error);
			true
		})
	}

	fn transition(&self, video_id: &str, attempt_id: Option<u64>, f: impl FnOnce(&mut ConnectionState) -> bool) -> bool {
		let mut inner = self.inner.lock();
		let Some(entry) = inner
			.entries
			.iter_mut()
			.find(|e| e.state.video_id == video_id && attempt_id.is_none_or(|a| a == e.attempt_id))
		else {
			return false;
		};
		let before = entry.state.status;
		let changed = f(&mut entry.state);
		if changed && before != entry.state.status {
			debug!(video_id, from = %before, to = %entry.state.status, "connection status changed");
		}
		changed
	}

	/// Disconnect and remove the record. Returns whether one existed.
	pub async fn terminate(&self, video_id: &str, reason: &str) -> bool {
		let removed = {
			let mut inner = self.inner.lock();
			inner
				.entries
				.iter()
				.position(|e| e.state.video_id == video_id)
				.map(|idx| inner.entries.remove(idx))
		};

		let Some(mut entry) = removed else {
			return false;
		};
		entry.state.status = ConnectionStatus::Terminated;

		if let Some(conn) = entry.connection.take() {
			if let Err(e) = conn.disconnect(reason).await {
				warn!(video_id, reason, error = %e, "chat disconnect failed");
			}
		}
		info!(video_id, reason, "connection terminated");
		true
	}

	pub fn has_connection(&self, video_id: &str) -> bool {
		self.inner.lock().entries.iter().any(|e| e.state.video_id == video_id)
	}

	pub fn get_connection_count(&self) -> usize {
		self.inner.lock().entries.len()
	}

	pub fn get_all_video_ids(&self) -> Vec<String> {
		self.ids_where(|_| true)
	}

	/// Pending or ready; a superset of the chat-ready ids.
	pub fn get_active_video_ids(&self) -> Vec<String> {
		self.ids_where(ConnectionStatus::is_active)
	}

	pub fn get_ready_video_ids(&self) -> Vec<String> {
		self.ids_where(|s| s == ConnectionStatus::Ready)
	}

	pub fn is_connection_ready(&self, video_id: &str) -> bool {
		self.status_of(video_id) == Some(ConnectionStatus::Ready)
	}

	pub fn status_of(&self, video_id: &str) -> Option<ConnectionStatus> {
		self.inner
			.lock()
			.entries
			.iter()
			.find(|e| e.state.video_id == video_id)
			.map(|e| e.state.status)
	}

	pub fn snapshot(&self) -> Vec<ConnectionState> {
		self.inner.lock().entries.iter().map(|e| e.state.clone()).collect()
	}

	/// Reporter bound to one attempt of `video_id`.
	pub fn reporter(&self, video_id: &str, attempt_id: u64) -> ConnectionReporter {
		ConnectionReporter {
			manager: self.clone(),
			video_id: video_id.to_string(),
			attempt_id,
		}
	}

	fn ids_where(&self, pred: impl Fn(ConnectionStatus) -> bool) -> Vec<String> {
		self.inner
			.lock()
			.entries
			.iter()
			.filter(|e| pred(e.state.status))
			.map(|e| e.state.video_id.clone())
			.collect()
	}
}

/// Status callbacks handed to a chat connector.
///
/// Reports from a superseded attempt are ignored.
#[derive(Clone)]
pub struct ConnectionReporter {
	manager: ConnectionManager,
	video_id: String,
	attempt_id: u64,
}

impl fmt::Debug for ConnectionReporter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionReporter")
			.field("video_id", &self.video_id)
			.field("attempt_id", &self.attempt_id)
			.finish()
	}
}

impl ConnectionReporter {
	pub fn video_id(&self) -> &str {
		&self.video_id
	}

	pub fn ready(&self) -> bool {
		self.manager.transition(&self.video_id, Some(self.attempt_id), |state| {
			if !state.status.is_active() {
				return false;
			}
			state.status = ConnectionStatus::Ready;
			state.last_ready_at = Some(Instant::now());
			true
		})
	}

	pub fn broken(&self, error: impl fmt::Display) -> bool {
		let error = error.to_string();
		self.manager.transition(&self.video_id, Some(self.attempt_id), |state| {
			state.status = ConnectionStatus::Broken;
			state.last_error = Some(error);
			true
		})
	}
}
