//! Viewer delivery
//!
//! # Components
//!
//! - `StreamFanout` - encodes each frame once and writes it to every viewer
//! - `ViewerSession` - one negotiated viewer and its lifecycle
//! - `SampleSink` - destination of a viewer's encoded samples

pub mod fanout;
pub mod session;
pub mod sink;

pub use fanout::{FanoutConfig, FanoutStats, StreamFanout};
pub use session::{SessionState, TransceiverDirection, ViewerSession};
pub use sink::SampleSink;
