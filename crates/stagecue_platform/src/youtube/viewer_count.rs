#![forbid(unsafe_code)]

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, trace};

use super::connection::ConnectionManager;
use super::extractor::{ExtractOptions, extract_concurrent_viewers};
use super::innertube::InnertubeClient;
use crate::ViewerCountSource;

/// Sums concurrent viewers over every active stream (pending or ready).
///
/// Chat readiness is irrelevant here: a stream whose chat handshake failed
/// still has viewers.
#[derive(Clone)]
pub struct YouTubeViewerCountSource {
	client: Arc<dyn InnertubeClient>,
	connections: ConnectionManager,
	options: ExtractOptions,
}

impl YouTubeViewerCountSource {
	pub fn new(client: Arc<dyn InnertubeClient>, connections: ConnectionManager) -> Self {
		Self {
			client,
			connections,
			options: ExtractOptions::default(),
		}
	}

	pub fn with_options(mut self, options: ExtractOptions) -> Self {
		self.options = options;
		self
	}

	async fn count_for(&self, video_id: &str) -> Option<u64> {
		let info = match self.client.get_info(video_id).await {
			Ok(info) => info,
			Err(e) => {
				debug!(video_id, error = %e, "get_info failed; stream skipped in total");
				return None;
			}
		};
		let result = extract_concurrent_viewers(&info, &self.options);
		if !result.success {
			debug!(video_id, attempted = ?result.metadata.attempted, "no viewer count extracted");
			return None;
		}
		trace!(video_id, count = result.count, strategy = ?result.strategy, "viewer count extracted");
		Some(result.count)
	}
}

#[async_trait::async_trait]
impl ViewerCountSource for YouTubeViewerCountSource {
	async fn get_viewer_count(&self) -> anyhow::Result<Option<i64>> {
		let ids = self.connections.get_active_video_ids();
		if ids.is_empty() {
			return Ok(None);
		}

		let counts = join_all(ids.iter().map(|id| self.count_for(id))).await;
		let mut total: Option<u64> = None;
		for c in counts.into_iter().flatten() {
			total = Some(total.unwrap_or(0).saturating_add(c));
		}
		Ok(total.map(|t| i64::try_from(t).unwrap_or(i64::MAX)))
	}
}
