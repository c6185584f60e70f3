#![forbid(unsafe_code)]

//! YouTube live pipeline: stream discovery, per-stream chat connections and
//! viewer aggregation.

pub mod connection;
pub mod detector;
pub mod extractor;
pub mod innertube;
pub mod multistream;
pub mod viewer_count;

#[cfg(test)]
mod multistream_tests;

pub use connection::{ChatConnection, ConnectionManager, ConnectionReporter, ConnectionState, ConnectionStatus, YouTubeChatConnector};
pub use detector::{DetectionConfig, DetectionHandle, LiveStatusProbe, StreamDetector};
pub use extractor::{
	ExtractOptions, ExtractionResult, ExtractionStrategy, MAX_VIEWER_COUNT, extract_concurrent_viewers, is_valid_viewer_count,
};
pub use innertube::{
	InnertubeBuilder, InnertubeClient, InnertubeConfig, InnertubeError, InnertubeFactory, InnertubeImporter, LazyInnertube,
	innertube_importer,
};
pub use multistream::{MultiStreamConfig, MultiStreamManager, ShortageState, TickReport, TickSkip};
pub use viewer_count::YouTubeViewerCountSource;
