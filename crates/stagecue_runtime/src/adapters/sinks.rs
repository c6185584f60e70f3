#![forbid(unsafe_code)]

//! Log-only implementations of the output services, used when the binary runs
//! without a real overlay, speech engine or OBS connection.

use stagecue_domain::{DisplayItem, Platform};
use stagecue_platform::{DisplayQueue, ObsClient, TtsService, VfxCommandService, VfxContext};
use tracing::{debug, info};

pub struct TracingDisplayQueue;

impl DisplayQueue for TracingDisplayQueue {
	fn add_item(&self, item: DisplayItem) -> anyhow::Result<()> {
		metrics::counter!("stagecue_display_items_total", "type" => item.kind.as_str()).increment(1);
		info!(
			platform = %item.platform,
			kind = %item.kind,
			priority = item.priority.value(),
			user = %item.data.username,
			"display: {}",
			item.data.display_message
		);
		Ok(())
	}
}

pub struct TracingTts;

#[async_trait::async_trait]
impl TtsService for TracingTts {
	async fn speak(&self, platform: Platform, text: &str) -> anyhow::Result<()> {
		info!(%platform, "tts: {text}");
		Ok(())
	}
}

pub struct TracingVfx;

#[async_trait::async_trait]
impl VfxCommandService for TracingVfx {
	async fn execute(&self, command: &str, ctx: &VfxContext) -> anyhow::Result<()> {
		info!(platform = %ctx.platform, user = %ctx.username, event = ?ctx.event_type, command, "vfx");
		Ok(())
	}
}

/// Pretends to be connected and logs every request.
pub struct TracingObs;

#[async_trait::async_trait]
impl ObsClient for TracingObs {
	fn is_connected(&self) -> bool {
		true
	}

	async fn call(&self, method: &str, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
		debug!(method, %params, "obs call");
		Ok(serde_json::Value::Null)
	}
}

#[cfg(test)]
mod tests {
	use stagecue_domain::{EventKind, EventType, NormalizedEvent};

	use super::*;

	#[tokio::test]
	async fn sinks_accept_everything() {
		let ev = NormalizedEvent::builder(Platform::Twitch, "amy", EventKind::Follow)
			.build()
			.unwrap();
		assert!(TracingDisplayQueue.add_item(DisplayItem::from_event(ev)).is_ok());
		assert!(TracingTts.speak(Platform::Twitch, "hello").await.is_ok());
		let ctx = VfxContext {
			platform: Platform::Twitch,
			username: "amy".to_string(),
			event_type: Some(EventType::Follow),
		};
		assert!(TracingVfx.execute("!hearts", &ctx).await.is_ok());
		assert!(TracingObs.is_connected());
		assert!(
			TracingObs
				.call("SetInputSettings", serde_json::json!({"inputName": "x"}))
				.await
				.is_ok()
		);
	}
}
