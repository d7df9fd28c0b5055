//! V4L2 camera reader
//!
//! The device is opened and streamed from a dedicated thread (mmap buffers,
//! blocking dequeue). Decoded RGB24 frames are forwarded over a one-slot
//! queue, so the reader always hands out a recent frame and a slow consumer
//! never makes the driver run out of buffers.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use super::capture::FrameReader;
use super::convert;
use super::format::{PixelFormat, Resolution};
use super::frame::Frame;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Minimum valid frame size (bytes)
const MIN_FRAME_SIZE: usize = 128;

/// Camera device settings
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device path
    pub path: PathBuf,
    /// Requested resolution
    pub resolution: Resolution,
    /// Requested pixel format
    pub format: PixelFormat,
    /// Requested frame rate
    pub fps: u32,
    /// Number of mmap buffers
    pub buffer_count: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            resolution: Resolution::HD720,
            format: PixelFormat::Mjpeg,
            fps: 30,
            buffer_count: 4,
        }
    }
}

impl DeviceConfig {
    pub fn for_device(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Reads frames from a V4L2 capture device
pub struct V4lReader {
    path: PathBuf,
    resolution: Resolution,
    format: PixelFormat,
    frame_rx: mpsc::Receiver<Result<Frame>>,
    stop: Arc<AtomicBool>,
}

impl V4lReader {
    /// Open the device and start streaming
    ///
    /// Fails when the device cannot be opened or configured.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(Resolution, PixelFormat)>>();
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_config = config.clone();
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("v4l-capture".to_string())
            .spawn(move || {
                let opened = open_stream(&thread_config);
                match opened {
                    Ok((_device, stream, resolution, format)) => {
                        let _ = ready_tx.send(Ok((resolution, format)));
                        stream_frames(
                            &thread_config.path,
                            stream,
                            resolution,
                            format,
                            frame_tx,
                            &thread_stop,
                        );
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let (resolution, format) = ready_rx.recv().map_err(|_| {
            AppError::VideoError(format!("Capture thread for {:?} exited", config.path))
        })??;

        info!(
            "Opened {:?}: {} {} (requested {} {})",
            config.path, resolution, format, config.resolution, config.format
        );

        Ok(Self {
            path: config.path.clone(),
            resolution,
            format,
            frame_rx,
            stop,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

#[async_trait]
impl FrameReader for V4lReader {
    fn describe(&self) -> String {
        format!("{} ({})", self.path.display(), self.format)
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        match self.frame_rx.recv().await {
            Some(result) => result,
            None => Err(AppError::VideoError(format!(
                "Capture thread for {} stopped",
                self.path.display()
            ))),
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.frame_rx.close();
    }
}

impl Drop for V4lReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn open_stream(
    config: &DeviceConfig,
) -> Result<(Device, MmapStream<'static>, Resolution, PixelFormat)> {
    let device = Device::with_path(&config.path).map_err(|e| {
        AppError::VideoError(format!("Failed to open device {:?}: {}", config.path, e))
    })?;

    let mut fmt = device
        .format()
        .map_err(|e| AppError::VideoError(format!("Failed to get format: {}", e)))?;
    fmt.width = config.resolution.width;
    fmt.height = config.resolution.height;
    fmt.fourcc = config.format.to_fourcc();
    let actual = device
        .set_format(&fmt)
        .map_err(|e| AppError::VideoError(format!("Failed to set format: {}", e)))?;

    let format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
        AppError::VideoError(format!("Device chose unsupported format {}", actual.fourcc))
    })?;
    let resolution = Resolution::new(actual.width, actual.height);

    if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
        warn!("Failed to set {} fps on {:?}: {}", config.fps, config.path, e);
    }

    let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count.max(1))
        .map_err(|e| AppError::VideoError(format!("Failed to create capture stream: {}", e)))?;

    Ok((device, stream, resolution, format))
}

/// Blocking dequeue loop, runs on the capture thread
fn stream_frames(
    path: &Path,
    mut stream: MmapStream<'static>,
    resolution: Resolution,
    format: PixelFormat,
    frame_tx: mpsc::Sender<Result<Frame>>,
    stop: &AtomicBool,
) {
    let throttler = LogThrottler::with_secs(5);
    let mut sequence = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                let err = classify_read_error(path, e);
                error!("{}", err);
                let _ = frame_tx.blocking_send(Err(err));
                return;
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        if used < MIN_FRAME_SIZE {
            debug!("Dropping small frame: {} bytes", used);
            continue;
        }

        let frame = match convert::to_rgb24(&buf[..used], format, resolution) {
            Ok((rgb, actual)) => Frame::from_vec(rgb, actual, sequence),
            Err(e) => {
                if let Some(suppressed) = throttler.admit("decode") {
                    warn!("Dropping undecodable frame: {} (suppressed {})", e, suppressed);
                }
                continue;
            }
        };
        sequence += 1;

        match frame_tx.try_send(Ok(frame)) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    debug!("Capture thread for {:?} exiting", path);
}

/// Map a dequeue failure to a device-lost or generic video error
fn classify_read_error(path: &Path, e: io::Error) -> AppError {
    let lost = matches!(
        e.raw_os_error(),
        Some(libc::ENXIO) | Some(libc::ENODEV) | Some(libc::EIO) | Some(libc::EPIPE) | Some(libc::ESHUTDOWN)
    );
    if lost {
        AppError::VideoDeviceLost {
            device: path.display().to_string(),
            reason: e.to_string(),
        }
    } else {
        AppError::VideoError(format!("Capture read failed on {:?}: {}", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_classification() {
        let path = Path::new("/dev/video9");
        assert!(matches!(
            classify_read_error(path, io::Error::from_raw_os_error(libc::ENODEV)),
            AppError::VideoDeviceLost { .. }
        ));
        assert!(matches!(
            classify_read_error(path, io::Error::from_raw_os_error(libc::EINVAL)),
            AppError::VideoError(_)
        ));
    }

    #[test]
    fn test_missing_device_fails_to_open() {
        let config = DeviceConfig::for_device("/dev/does-not-exist-video");
        assert!(V4lReader::open(&config).is_err());
    }
}
