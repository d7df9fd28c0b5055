//! Video capture and encoding
//!
//! This module provides paced frame capture (V4L2 or a synthetic test
//! pattern), pixel conversion and the H.264 encoder.

pub mod capture;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod synthetic;

pub use capture::{CaptureSource, CaptureState, CaptureStats, FrameReader, Frames};
pub use device::{DeviceConfig, V4lReader};
pub use encoder::{EncoderConfig, EncoderService, FrameEncoder, VideoCodec};
pub use format::{PixelFormat, Resolution};
pub use frame::{EncodedSample, Frame};
pub use synthetic::SyntheticReader;
