use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

// --- Encode options ---------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub audio_channels: u8,
    /// `WIDTHxHEIGHT`, e.g. `1280x720`.
    pub resolution: String,
    /// Fill the frame ignoring source aspect instead of letterboxing.
    pub stretch: bool,
    /// Seek offset as typed by the operator; normalized at start time.
    pub seek: Option<String>,
    /// Loop a single file forever. Ignored for playlists and seamless jobs.
    pub loop_file: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            audio_channels: 2,
            resolution: "1280x720".into(),
            stretch: false,
            seek: None,
            loop_file: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl EncodeOptions {
    /// Checks ranges and returns the parsed frame size.
    pub fn validate(&self) -> EngineResult<Resolution> {
        if !(100..=50_000).contains(&self.video_bitrate_kbps) {
            return Err(EngineError::validation(format!(
                "video bitrate {} kbps out of range (100..=50000)",
                self.video_bitrate_kbps
            )));
        }
        if !(32..=512).contains(&self.audio_bitrate_kbps) {
            return Err(EngineError::validation(format!(
                "audio bitrate {} kbps out of range (32..=512)",
                self.audio_bitrate_kbps
            )));
        }
        if !(1..=8).contains(&self.audio_channels) {
            return Err(EngineError::validation(format!(
                "audio channel count {} out of range (1..=8)",
                self.audio_channels
            )));
        }
        parse_resolution(&self.resolution).ok_or_else(|| {
            EngineError::validation(format!("invalid resolution {:?}, expected WIDTHxHEIGHT", self.resolution))
        })
    }

    /// Same options without a seek offset (used for jobs after the first one).
    pub fn without_seek(&self) -> Self {
        Self {
            seek: None,
            ..self.clone()
        }
    }
}

pub fn parse_resolution(s: &str) -> Option<Resolution> {
    let lower = s.trim().to_ascii_lowercase();
    let (w, h) = lower.split_once('x')?;
    let width: u32 = w.trim().parse().ok()?;
    let height: u32 = h.trim().parse().ok()?;
    // libx264 + yuv420p needs even dimensions.
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 || width > 7680 || height > 4320 {
        return None;
    }
    Some(Resolution { width, height })
}

// --- Seek offsets -------------------------------------------------------------

/// Normalizes an operator-entered offset to `HH:MM:SS`.
///
/// Accepts plain seconds (`90`), `MM:SS` and `HH:MM:SS`. Anything else is `None`.
pub fn normalize_timestamp(input: &str) -> Option<String> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let parts: Vec<&str> = s.split(':').collect();
    if parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }

    match parts.as_slice() {
        [secs] => {
            let total: u64 = secs.parse().ok()?;
            Some(format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60))
        }
        [m, s] => Some(format!("00:{}:{}", pad2(m), pad2(s))),
        [h, m, s] => Some(format!("{}:{}:{}", pad2(h), pad2(m), pad2(s))),
        _ => None,
    }
}

fn pad2(field: &str) -> String {
    format!("{field:0>2}")
}

/// Seek offset to hand to ffmpeg. An unusable offset is logged and dropped;
/// it never fails the start.
pub fn resolve_seek(seek: Option<&str>) -> Option<String> {
    let raw = seek?.trim();
    if raw.is_empty() {
        return None;
    }
    let normalized = normalize_timestamp(raw);
    if normalized.is_none() {
        warn!("ignoring unrecognized seek offset {raw:?}");
    }
    normalized
}

// --- Misc input helpers ---------------------------------------------------------

pub fn validate_destination(uri: &str) -> EngineResult<String> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(EngineError::validation("destination URI is required"));
    }
    match uri.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(uri.to_string()),
        _ => Err(EngineError::validation(format!("destination {uri:?} is not a URI"))),
    }
}

/// Human-friendly label for a media path (file stem, underscores as spaces).
pub fn display_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .replace('_', " ")
}
