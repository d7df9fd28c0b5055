use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::config::{self, AppConfig, ConfigOverrides};
use camstream::stream::StreamFanout;
use camstream::video::capture::{CaptureSource, CaptureState, FrameReader};
use camstream::video::encoder::EncoderService;
use camstream::video::format::PixelFormat;
use camstream::video::{SyntheticReader, V4lReader};
use camstream::webrtc::{NegotiatorConfig, RtcPeerFactory, SessionNegotiator, SignalingChannel};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(version, about = "Stream a camera to WebRTC viewers", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signaling websocket URL (overrides WEBSOCKET_URL)
    #[arg(short = 's', long, value_name = "URL")]
    signaling_url: Option<String>,

    /// STUN server URL, empty for none (overrides STUN_URL)
    #[arg(long, value_name = "URL")]
    stun_url: Option<String>,

    /// Video device path, or "synthetic" for a test pattern
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// Capture width
    #[arg(long)]
    width: Option<u32>,

    /// Capture height
    #[arg(long)]
    height: Option<u32>,

    /// Capture frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Capture pixel format (MJPEG, YUYV)
    #[arg(long, value_name = "FORMAT")]
    format: Option<PixelFormat>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl CliArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            signaling_url: self.signaling_url.clone(),
            stun_url: self.stun_url.clone(),
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            format: self.format,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    // Install default crypto provider (required by rustls 0.23+ for wss://)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting camstream v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load(args.config.as_deref(), &args.overrides())
        .context("Invalid configuration")?;

    run(config).await
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let pipeline = info_span!("pipeline", device = %config.capture.device);

    // Camera
    let reader = open_reader(&config).await?;
    let capture = CaptureSource::new(
        reader,
        config.capture.fps,
        config.fanout.frame_queue,
        info_span!(parent: &pipeline, "capture"),
    );
    let frames = capture
        .frames()
        .context("Capture frame sequence already taken")?;

    // Encoder
    let encoder = EncoderService::create(&config.encoder_config())
        .context("Failed to create video encoder")?;
    info!(
        "Encoding {} at {} ({} requested)",
        encoder.codec(),
        encoder.resolution(),
        capture.size()
    );

    // Signaling
    let mut channel = SignalingChannel::connect(
        &config.signaling.url,
        info_span!(parent: &pipeline, "signaling"),
    )
    .await
    .context("Signaling server unreachable")?;

    // Fan-out, then capture
    let fanout = StreamFanout::new(
        encoder,
        config.fanout_config(),
        info_span!(parent: &pipeline, "fanout"),
    );
    fanout.start(frames).await?;
    capture.start().await?;

    let mut capture_state = capture.state_watch();
    tokio::spawn(
        async move {
            while capture_state.changed().await.is_ok() {
                let state = *capture_state.borrow();
                match state {
                    CaptureState::DeviceLost => warn!("Camera lost, viewers stay connected without video"),
                    CaptureState::Error => warn!("Capture stopped after a read error"),
                    _ => {}
                }
            }
        }
        .instrument(pipeline.clone()),
    );

    // Negotiation
    let factory = RtcPeerFactory::new(
        config.webrtc.clone(),
        info_span!(parent: &pipeline, "transport"),
    )?;
    let negotiator_config = NegotiatorConfig {
        send_connected: config.signaling.send_connected,
        double_streamer: config.signaling.double_streamer,
        ..NegotiatorConfig::from_webrtc(&config.webrtc)
    };
    let negotiator = SessionNegotiator::new(
        Arc::new(factory),
        fanout.clone(),
        channel.sender(),
        negotiator_config,
        info_span!(parent: &pipeline, "negotiator"),
    );

    info!("Waiting for viewers on {}", config.signaling.url);
    tokio::select! {
        result = negotiator.run(&mut channel) => {
            if let Err(e) = result {
                warn!("Signaling ended with error: {}", e);
            }
        }
        _ = shutdown_signal() => {}
    }

    // Shutdown in reverse dependency order
    negotiator.shutdown().await;
    fanout.stop().await;
    capture.stop().await;
    channel.close().await;

    let fanout_stats = fanout.stats();
    let capture_stats = capture.stats();
    info!(
        "Stopped: {} frames captured ({} dropped), {} samples encoded",
        capture_stats.frames_produced, capture_stats.frames_dropped, fanout_stats.samples_produced
    );
    Ok(())
}

/// Open the configured frame source; a missing camera is fatal
async fn open_reader(config: &AppConfig) -> anyhow::Result<Box<dyn FrameReader>> {
    if config.capture.is_synthetic() {
        info!("Using synthetic test pattern");
        return Ok(Box::new(SyntheticReader::new(config.capture.resolution())));
    }

    let device = config.capture.device_config();
    let reader = tokio::task::spawn_blocking(move || V4lReader::open(&device))
        .await?
        .with_context(|| format!("Camera {} unavailable", config.capture.device))?;
    Ok(Box::new(reader))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camstream=error,webrtc=error",
        LogLevel::Warn => "camstream=warn,webrtc=warn",
        LogLevel::Info => "camstream=info,webrtc=warn",
        LogLevel::Verbose => "camstream=debug,webrtc=warn",
        LogLevel::Debug => "camstream=debug,webrtc=info",
        LogLevel::Trace => "camstream=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let (text_layer, json_layer) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
