#![forbid(unsafe_code)]

//! TTS and VFX calls made on behalf of the dispatcher.
//!
//! Both services are external and may stall or panic. Nothing here may hold up the
//! event loop for longer than [`SIDE_EFFECT_TIMEOUT`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use stagecue_domain::Platform;
use tracing::warn;

pub const SIDE_EFFECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one side effect with a timeout, turning panics into errors.
pub async fn guarded<F>(what: &'static str, fut: F) -> anyhow::Result<()>
where
	F: Future<Output = anyhow::Result<()>>,
{
	match tokio::time::timeout(SIDE_EFFECT_TIMEOUT, AssertUnwindSafe(fut).catch_unwind()).await {
		Ok(Ok(result)) => result,
		Ok(Err(_)) => Err(anyhow::anyhow!("{what} panicked")),
		Err(_) => Err(anyhow::anyhow!(
			"{what} timed out after {}ms",
			SIDE_EFFECT_TIMEOUT.as_millis()
		)),
	}
}

/// Fire-and-forget variant of [`guarded`]; failures are only logged.
pub fn spawn_guarded<F>(what: &'static str, platform: Platform, fut: F)
where
	F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	tokio::spawn(async move {
		if let Err(e) = guarded(what, fut).await {
			metrics::counter!("stagecue_side_effect_failures_total", "kind" => what).increment(1);
			warn!(%platform, error = %format!("{e:#}"), "{what} failed");
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn stalled_effects_time_out() {
		let err = guarded("tts", std::future::pending::<anyhow::Result<()>>()).await.unwrap_err();
		assert!(err.to_string().contains("timed out"), "{err}");
	}

	#[tokio::test]
	async fn panics_become_errors() {
		let err = guarded("vfx", async {
			if true {
				panic!("boom");
			}
			Ok::<(), anyhow::Error>(())
		})
		.await
		.unwrap_err();
		assert_eq!(err.to_string(), "vfx panicked");
	}

	#[tokio::test]
	async fn results_pass_through() {
		assert!(guarded("tts", async { Ok::<(), anyhow::Error>(()) }).await.is_ok());
		let err = guarded("tts", async { Err::<(), _>(anyhow::anyhow!("offline")) }).await.unwrap_err();
		assert_eq!(err.to_string(), "offline");
	}
}
