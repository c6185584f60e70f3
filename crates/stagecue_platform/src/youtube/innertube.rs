#![forbid(unsafe_code)]

//! Lazily constructed YouTube metadata client.
//!
//! The factory is owned by the runtime and injected where needed. The builder
//! import is memoized so concurrent callers share one initialization.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Metadata operations used by the pipeline.
#[async_trait::async_trait]
pub trait InnertubeClient: Send + Sync {
	/// Raw `get_info` payload for a video.
	async fn get_info(&self, video_id: &str) -> anyhow::Result<Value>;

	/// Currently live video ids of a channel, in upstream order.
	async fn live_video_ids(&self, channel_handle: &str) -> anyhow::Result<Vec<String>>;
}

/// Client construction options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InnertubeConfig {
	pub lang: Option<String>,
	pub location: Option<String>,
	pub retrieve_player: bool,
}

/// Constructs clients; obtained once through the importer.
#[async_trait::async_trait]
pub trait InnertubeBuilder: Send + Sync {
	async fn create(&self, config: &InnertubeConfig) -> anyhow::Result<Arc<dyn InnertubeClient>>;
}

/// Resolves the builder (the expensive, once-per-process step).
pub type InnertubeImporter = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn InnertubeBuilder>>> + Send + Sync>;

/// Wrap an async closure into an `InnertubeImporter`.
pub fn innertube_importer<F, Fut>(f: F) -> InnertubeImporter
where
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<Arc<dyn InnertubeBuilder>>> + Send + 'static,
{
	Arc::new(move || -> BoxFuture<'static, anyhow::Result<Arc<dyn InnertubeBuilder>>> { Box::pin(f()) })
}

#[derive(Debug, Error)]
pub enum InnertubeError {
	#[error("Innertube creation failed: {source}")]
	Creation {
		#[source]
		source: anyhow::Error,
	},
	#[error("Innertube creation timeout ({ms}ms)")]
	Timeout { ms: u64 },
}

impl InnertubeError {
	fn creation(source: anyhow::Error) -> Self {
		Self::Creation { source }
	}
}

#[derive(Default)]
struct Cells {
	builder: OnceCell<Arc<dyn InnertubeBuilder>>,
	instance: OnceCell<Arc<dyn InnertubeClient>>,
}

/// Process-scoped factory with a cached builder and a cached default instance.
#[derive(Clone)]
pub struct InnertubeFactory {
	importer: Arc<Mutex<InnertubeImporter>>,
	cells: Arc<Mutex<Arc<Cells>>>,
}

impl std::fmt::Debug for InnertubeFactory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let cells = self.cells.lock().clone();
		f.debug_struct("InnertubeFactory")
			.field("builder_loaded", &cells.builder.initialized())
			.field("instance_ready", &cells.instance.initialized())
			.finish()
	}
}

impl InnertubeFactory {
	pub fn new(importer: InnertubeImporter) -> Self {
		Self {
			importer: Arc::new(Mutex::new(importer)),
			cells: Arc::new(Mutex::new(Arc::new(Cells::default()))),
		}
	}

	/// Swap the importer and drop every cached value.
	pub fn configure(&self, importer: InnertubeImporter) {
		*self.importer.lock() = importer;
		*self.cells.lock() = Arc::new(Cells::default());
		debug!("innertube factory reconfigured");
	}

	fn current_cells(&self) -> Arc<Cells> {
		self.cells.lock().clone()
	}

	async fn builder(&self, cells: &Cells) -> Result<Arc<dyn InnertubeBuilder>, InnertubeError> {
		let importer = self.importer.lock().clone();
		cells
			.builder
			.get_or_try_init(|| async move { importer().await })
			.await
			.cloned()
			.map_err(InnertubeError::creation)
	}

	/// Shared default instance; concurrent first calls share one construction.
	pub async fn create_instance(&self) -> Result<Arc<dyn InnertubeClient>, InnertubeError> {
		let cells = self.current_cells();
		cells
			.instance
			.get_or_try_init(|| async {
				let builder = self.builder(&cells).await?;
				let client = builder
					.create(&InnertubeConfig::default())
					.await
					.map_err(InnertubeError::creation)?;
				info!("innertube client created");
				Ok::<_, InnertubeError>(client)
			})
			.await
			.cloned()
	}

	/// Fresh, uncached client built with `config`.
	pub async fn create_with_config(&self, config: &InnertubeConfig) -> Result<Arc<dyn InnertubeClient>, InnertubeError> {
		let cells = self.current_cells();
		let builder = self.builder(&cells).await?;
		builder.create(config).await.map_err(InnertubeError::creation)
	}

	/// Like `create_instance` / `create_with_config`, abandoned after `ms`.
	pub async fn create_with_timeout(
		&self,
		ms: u64,
		config: Option<&InnertubeConfig>,
	) -> Result<Arc<dyn InnertubeClient>, InnertubeError> {
		let fut = async {
			match config {
				Some(cfg) => self.create_with_config(cfg).await,
				None => self.create_instance().await,
			}
		};
		match tokio::time::timeout(Duration::from_millis(ms), fut).await {
			Ok(res) => res,
			Err(_) => Err(InnertubeError::Timeout { ms }),
		}
	}

	/// Handle that resolves the shared instance on first use.
	pub fn create_lazy_reference(&self) -> LazyInnertube {
		LazyInnertube {
			factory: self.clone(),
			resolved: Arc::new(OnceCell::new()),
		}
	}
}

/// Deferred client handle.
#[derive(Clone)]
pub struct LazyInnertube {
	factory: InnertubeFactory,
	resolved: Arc<OnceCell<Arc<dyn InnertubeClient>>>,
}

impl LazyInnertube {
	pub fn is_resolved(&self) -> bool {
		self.resolved.initialized()
	}

	pub async fn get(&self) -> Result<Arc<dyn InnertubeClient>, InnertubeError> {
		self.resolved
			.get_or_try_init(|| self.factory.create_instance())
			.await
			.cloned()
	}
}

#[async_trait::async_trait]
impl InnertubeClient for LazyInnertube {
	async fn get_info(&self, video_id: &str) -> anyhow::Result<Value> {
		let client = self.get().await?;
		client.get_info(video_id).await
	}

	async fn live_video_ids(&self, channel_handle: &str) -> anyhow::Result<Vec<String>> {
		let client = self.get().await?;
		client.live_video_ids(channel_handle).await
	}
}
