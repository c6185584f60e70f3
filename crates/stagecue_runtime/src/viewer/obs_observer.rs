#![forbid(unsafe_code)]

use std::sync::Arc;

use stagecue_domain::Platform;
use stagecue_platform::{OBS_SET_INPUT_SETTINGS, ObsClient, set_input_text_params};
use tracing::{debug, trace, warn};

use super::format::format_viewer_count;
use super::system::{StreamStatusChange, ViewerCountObserver, ViewerCountUpdate};
use crate::config::ConfigManager;

pub const OBS_VIEWER_COUNT_OBSERVER_ID: &str = "obs-viewer-count-observer";

/// Mirrors viewer counts into the OBS text input named by each platform's
/// `viewerCountSource`.
pub struct ObsViewerCountObserver {
	obs: Arc<dyn ObsClient>,
	config: ConfigManager,
}

impl ObsViewerCountObserver {
	pub fn new(obs: Arc<dyn ObsClient>, config: ConfigManager) -> Self {
		Self { obs, config }
	}

	fn target(&self, platform: Platform) -> Option<String> {
		let section = self.config.platform_section(platform);
		if !section.viewer_count_enabled {
			return None;
		}
		section.viewer_count_source
	}

	async fn set_text(&self, platform: Platform, input: &str, text: &str) {
		if !self.obs.is_connected() {
			debug!(%platform, input, "OBS not connected; viewer count text skipped");
			return;
		}

		match self
			.obs
			.call(OBS_SET_INPUT_SETTINGS, set_input_text_params(input, text))
			.await
		{
			Ok(_) => trace!(%platform, input, text, "viewer count text set"),
			Err(e) => {
				metrics::counter!("stagecue_obs_errors_total").increment(1);
				warn!(%platform, input, error = %e, "OBS viewer count update failed");
			}
		}
	}
}

#[async_trait::async_trait]
impl ViewerCountObserver for ObsViewerCountObserver {
	fn id(&self) -> &str {
		OBS_VIEWER_COUNT_OBSERVER_ID
	}

	async fn initialize(&self) -> anyhow::Result<()> {
		for platform in self.config.platforms() {
			if let Some(input) = self.target(platform) {
				self.set_text(platform, &input, "0").await;
			}
		}
		Ok(())
	}

	async fn on_viewer_count_update(&self, update: &ViewerCountUpdate) -> anyhow::Result<()> {
		if let Some(input) = self.target(update.platform) {
			self.set_text(update.platform, &input, &format_viewer_count(update.count))
				.await;
		}
		Ok(())
	}

	async fn on_stream_status_change(&self, change: &StreamStatusChange) -> anyhow::Result<()> {
		if !change.is_live
			&& change.was_live
			&& let Some(input) = self.target(change.platform)
		{
			self.set_text(change.platform, &input, "0").await;
		}
		Ok(())
	}
}
