use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Video device lost [{device}]: {reason}")]
    VideoDeviceLost { device: String, reason: String },

    #[error("Encoder error: {0}")]
    EncoderError(String),

    #[error("Encoder already closed")]
    EncoderClosed,

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Unsupported encoder profile: {0}")]
    UnsupportedProfile(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Sample write failed [{session}]: {reason}")]
    SinkWrite { session: String, reason: String },

    #[error("Stream fan-out is stopped")]
    FanoutStopped,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
