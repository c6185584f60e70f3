#![forbid(unsafe_code)]

mod adapters;
mod chat;
mod config;
mod effects;
mod lifecycle;
mod messages;
mod notifications;
mod runtime;
mod viewer;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stagecue_domain::Platform;
use stagecue_platform::{ObsClient, PlatformAdapter, TtsService, VfxCommandService};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::adapters::sinks::{TracingDisplayQueue, TracingObs, TracingTts, TracingVfx};
use crate::adapters::{DemoAdapter, NullAdapter};
use crate::config::ConfigManager;
use crate::runtime::{RuntimeDeps, StagecueRuntime};

/// Used when `RUST_LOG` is unset; covers every workspace crate.
const DEFAULT_LOG_FILTER: &str =
	"info,stagecue=debug,stagecue_platform=debug,stagecue_domain=debug,stagecue_util=debug";

/// Dev-only demo adapter enable flag.
const STAGECUE_ENABLE_DEMO_ADAPTER_ENV: &str = "STAGECUE_ENABLE_DEMO_ADAPTER";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: stagecue [--config path/to/config.toml]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.stagecue/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("stagecue");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn demo_enabled() -> bool {
	cfg!(debug_assertions)
		&& std::env::var(STAGECUE_ENABLE_DEMO_ADAPTER_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false)
}

/// One adapter per enabled platform. YouTube is driven by multi-stream monitoring instead.
fn build_adapters(config: &ConfigManager) -> Vec<Arc<dyn PlatformAdapter>> {
	let demo = demo_enabled();
	if demo {
		info!(
			env = STAGECUE_ENABLE_DEMO_ADAPTER_ENV,
			"starting dev-only demo adapters (enabled by env)"
		);
	}

	let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
	for platform in config.platforms() {
		if demo {
			adapters.push(Arc::new(DemoAdapter::new(platform).with_emit_interval(Duration::from_secs(2))));
		} else if platform != Platform::YouTube {
			adapters.push(Arc::new(NullAdapter::new(platform)));
		}
	}
	adapters
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let app_cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(app_cfg.general.metrics_bind.as_deref());

	let config = ConfigManager::new(app_cfg);
	let tts: Arc<dyn TtsService> = Arc::new(TracingTts);
	let vfx: Arc<dyn VfxCommandService> = Arc::new(TracingVfx);
	let obs: Option<Arc<dyn ObsClient>> = config.obs().enabled.then(|| Arc::new(TracingObs) as Arc<dyn ObsClient>);

	if config.platform_section(Platform::YouTube).enabled {
		warn!("no youtube innertube client in this build; multi-stream monitoring stays off");
	}

	let adapters = build_adapters(&config);
	let runtime = StagecueRuntime::new(RuntimeDeps {
		config,
		display: Arc::new(TracingDisplayQueue),
		tts: Some(tts),
		vfx: Some(vfx),
		obs,
		youtube: None,
	});

	runtime.start(adapters).await;
	info!("stagecue running; press ctrl-c to stop");

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
	}

	info!("shutting down");
	runtime.shutdown().await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_filter_enables_debug_for_workspace_crates() {
		assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
		for krate in ["stagecue", "stagecue_platform", "stagecue_domain", "stagecue_util"] {
			assert!(DEFAULT_LOG_FILTER.contains(&format!("{krate}=debug")), "{krate}");
		}
	}
}
