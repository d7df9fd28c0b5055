//! Outbound media sink

use async_trait::async_trait;

use crate::error::Result;
use crate::video::frame::EncodedSample;

/// Anything that accepts encoded samples for one viewer
///
/// Implemented by the WebRTC track adapter; tests use recording sinks.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Write one sample. An error marks the viewer's delivery as broken.
    async fn write_sample(&self, sample: &EncodedSample) -> Result<()>;
}
