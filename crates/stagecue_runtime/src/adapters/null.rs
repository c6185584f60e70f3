#![forbid(unsafe_code)]

use async_trait::async_trait;
use stagecue_domain::Platform;
use stagecue_platform::{PlatformAdapter, PlatformHandlers, new_session_id};
use tracing::info;

/// Null adapter for enabled platforms without an integration in this build.
pub struct NullAdapter {
	platform: Platform,
}

impl NullAdapter {
	pub fn new(platform: Platform) -> Self {
		Self { platform }
	}
}

#[async_trait]
impl PlatformAdapter for NullAdapter {
	fn platform(&self) -> Platform {
		self.platform
	}

	async fn initialize(&self, handlers: PlatformHandlers) -> anyhow::Result<()> {
		let platform = self.platform;
		let session_id = new_session_id();
		handlers.report_status(true, format!("null adapter online (session_id={session_id})"));
		info!(%platform, %session_id, "null adapter started; no events will be produced");
		Ok(())
	}

	async fn cleanup(&self) -> anyhow::Result<()> {
		info!(platform = %self.platform, "null adapter stopped");
		Ok(())
	}
}
