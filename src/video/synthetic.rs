//! Test-pattern frame reader
//!
//! Produces moving color bars without any hardware. Used for
//! `capture.device = "synthetic"` and throughout the tests.

use async_trait::async_trait;

use super::capture::FrameReader;
use super::format::Resolution;
use super::frame::Frame;
use crate::error::{AppError, Result};

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Generates color bars that scroll one column per frame
pub struct SyntheticReader {
    resolution: Resolution,
    frame_index: u64,
    fail_after: Option<u64>,
}

impl SyntheticReader {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            frame_index: 0,
            fail_after: None,
        }
    }

    /// Return a read error once `frames` frames were produced
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    fn render(&self) -> Vec<u8> {
        let w = self.resolution.width as usize;
        let h = self.resolution.height as usize;
        let bar_width = (w / BARS.len()).max(1);
        let shift = self.frame_index as usize;

        let row: Vec<u8> = (0..w)
            .flat_map(|x| BARS[((x + shift) / bar_width) % BARS.len()])
            .collect();

        let mut data = Vec::with_capacity(w * h * 3);
        for _ in 0..h {
            data.extend_from_slice(&row);
        }
        data
    }
}

#[async_trait]
impl FrameReader for SyntheticReader {
    fn describe(&self) -> String {
        format!("synthetic color bars {}", self.resolution)
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        if self.fail_after.is_some_and(|limit| self.frame_index >= limit) {
            return Err(AppError::VideoError("synthetic read failure".to_string()));
        }
        let frame = Frame::from_vec(self.render(), self.resolution, self.frame_index);
        self.frame_index += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_are_complete_and_move() {
        let mut reader = SyntheticReader::new(Resolution::new(64, 8));
        let first = reader.read_frame().await.unwrap();
        let second = reader.read_frame().await.unwrap();

        assert!(first.is_complete());
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_ne!(first.data(), second.data());
    }

    #[tokio::test]
    async fn test_failing_after() {
        let mut reader = SyntheticReader::new(Resolution::new(8, 8)).failing_after(1);
        assert!(reader.read_frame().await.is_ok());
        assert!(reader.read_frame().await.is_err());
    }
}
