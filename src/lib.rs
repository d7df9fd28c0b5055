//! camstream - live camera streaming to WebRTC viewers
//!
//! Frames captured from a camera are encoded once per frame interval and
//! fanned out to every connected viewer. Viewers negotiate through a shared
//! websocket signaling channel carrying base64(JSON) session descriptions.

pub mod config;
pub mod error;
pub mod stream;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
