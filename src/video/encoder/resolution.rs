//! Encoder target size selection
//!
//! Codec profiles only accept a fixed set of frame sizes. A requested size is
//! snapped onto that table before the encoder is built, and callers read the
//! effective size back from the encoder afterwards.

use crate::error::{AppError, Result};
use crate::video::format::Resolution;

/// Two aspect ratios closer than this are considered equal
pub const ASPECT_TOLERANCE: f64 = 1e-4;

/// Supported sizes for H.264 level 3.1, largest first
const H264_LEVEL_3_1: &[Resolution] = &[
    Resolution::new(1920, 1920),
    Resolution::new(1920, 1440),
    Resolution::new(1920, 1080),
    Resolution::new(1280, 720),
    Resolution::new(720, 576),
    Resolution::new(720, 480),
    Resolution::new(320, 240),
];

/// Look up the size table for an H.264 profile/level string such as `"3.1"`
pub fn h264_profile_sizes(profile: &str) -> Result<&'static [Resolution]> {
    match profile.trim() {
        "3.1" => Ok(H264_LEVEL_3_1),
        other => Err(AppError::UnsupportedProfile(other.to_string())),
    }
}

/// Pick the table entry to encode at for a requested size
///
/// An exact match wins. Otherwise the first (largest) entry that fits inside
/// the request with the same aspect ratio is used. If no entry has a matching
/// aspect ratio, the entry with the closest ratio is returned even when it is
/// larger than the request.
pub fn snap_resolution(requested: Resolution, table: &[Resolution]) -> Option<Resolution> {
    if table.contains(&requested) {
        return Some(requested);
    }

    let wanted = requested.aspect_ratio();
    let ratio_diff = |candidate: &Resolution| (candidate.aspect_ratio() - wanted).abs();

    table
        .iter()
        .copied()
        .find(|candidate| candidate.fits_within(requested) && ratio_diff(candidate) < ASPECT_TOLERANCE)
        .or_else(|| {
            table.iter().copied().fold(None, |best: Option<Resolution>, candidate| match best {
                Some(b) if ratio_diff(&b) <= ratio_diff(&candidate) => Some(b),
                _ => Some(candidate),
            })
        })
}

/// Snap a size for the given H.264 profile
pub fn snap_h264(requested: Resolution, profile: &str) -> Result<Resolution> {
    let table = h264_profile_sizes(profile)?;
    snap_resolution(requested, table)
        .ok_or_else(|| AppError::UnsupportedProfile(format!("{} has no sizes", profile)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        for entry in H264_LEVEL_3_1 {
            assert_eq!(snap_h264(*entry, "3.1").unwrap(), *entry);
        }
    }

    #[test]
    fn test_same_aspect_smaller_entry() {
        // 16:9 request above 720p but below 1080p
        assert_eq!(
            snap_h264(Resolution::new(1600, 900), "3.1").unwrap(),
            Resolution::HD720
        );
        // 4:3 request: 720x576 is 5:4 and 720x480 is 3:2, so only 320x240 matches
        assert_eq!(
            snap_h264(Resolution::VGA, "3.1").unwrap(),
            Resolution::new(320, 240)
        );
    }

    #[test]
    fn test_never_larger_when_monotone_match_exists() {
        for entry in H264_LEVEL_3_1 {
            for scale in [1u32, 2, 3] {
                let request = Resolution::new(entry.width * scale, entry.height * scale);
                let snapped = snap_h264(request, "3.1").unwrap();
                assert!(snapped.fits_within(request), "{} -> {}", request, snapped);
                assert!(
                    (snapped.aspect_ratio() - request.aspect_ratio()).abs() < ASPECT_TOLERANCE
                );
            }
        }
    }

    #[test]
    fn test_fallback_closest_ratio() {
        // 16:9 but smaller than every 16:9 entry: nearest ratio is 1920x1080
        assert_eq!(
            snap_h264(Resolution::new(640, 360), "3.1").unwrap(),
            Resolution::HD1080
        );
        // Square request smaller than 1920x1920
        assert_eq!(
            snap_h264(Resolution::new(500, 500), "3.1").unwrap(),
            Resolution::new(1920, 1920)
        );
    }

    #[test]
    fn test_unknown_profile() {
        assert!(matches!(
            snap_h264(Resolution::HD720, "5.1"),
            Err(AppError::UnsupportedProfile(_))
        ));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(snap_resolution(Resolution::HD720, &[]), None);
    }
}
