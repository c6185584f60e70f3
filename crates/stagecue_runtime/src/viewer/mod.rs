#![forbid(unsafe_code)]

pub mod format;
pub mod obs_observer;
pub mod system;

#[cfg(test)]
mod system_tests;

pub use format::format_viewer_count;
pub use obs_observer::{OBS_VIEWER_COUNT_OBSERVER_ID, ObsViewerCountObserver};
pub use system::{
	ObserverError, PlatformProvider, PlatformValidation, StreamStatusChange, ViewerCountObserver, ViewerCountSystem,
	ViewerCountUpdate, ViewerSystemConfig, platform_provider,
};
