#![forbid(unsafe_code)]

mod demo;
mod null;
pub mod sinks;

pub use demo::DemoAdapter;
pub use null::NullAdapter;
