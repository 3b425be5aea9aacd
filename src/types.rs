use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    pub trips: TripConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_dir: "videos".to_string(),
            output_dir: "out".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Process every Nth frame to bound cost.
    pub step_frames: i64,
    /// Binarization threshold for the frame difference, 15..40 typical.
    pub diff_threshold: u8,
    /// EMA level that opens an event (threshold_high).
    pub event_ratio: f64,
    /// Minimum frames between events.
    pub cooldown_frames: i64,
    /// Changed-pixel counts below this are treated as background.
    pub min_changed_pixels: i64,
    pub morph_w: u32,
    pub morph_h: u32,
    /// Events closer than this collapse into one.
    pub merge_window_ms: i64,
    pub ema_alpha: f64,
    /// threshold_low = event_ratio * threshold_low_factor (hysteresis gap).
    pub threshold_low_factor: f64,
    /// Minimum dwell time in the Active state for an interval to count.
    pub min_active_ms: i64,
    /// Spike-suppression window: only the first event in it survives.
    pub nms_window_ms: i64,
    pub trace_enabled: bool,
    /// Wall-clock budget per video; 0 disables the checkpoint.
    pub max_processing_time_ms: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            step_frames: 5,
            diff_threshold: 25,
            event_ratio: 0.02,
            cooldown_frames: 50,
            min_changed_pixels: 5_000,
            morph_w: 3,
            morph_h: 3,
            merge_window_ms: 4_000,
            ema_alpha: 0.20,
            threshold_low_factor: 0.60,
            min_active_ms: 1_200,
            nms_window_ms: 2_000,
            trace_enabled: false,
            max_processing_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    /// Directory with Tesseract traineddata; TESSDATA_PREFIX used when empty.
    pub datapath: String,
    pub languages: String,
    /// Base page segmentation mode for primary recognition.
    pub psm: i32,
    /// Latin + Cyrillic look-alikes + digits.
    pub whitelist: String,
    /// Audit mode sweeps more segmentation variants per fallback call.
    pub audit_mode: bool,
    /// Hard ceiling on engine invocations per event (all offsets combined).
    pub call_budget_per_event: u32,
    pub max_regions_per_scan: u32,
    /// Identical normalized reads needed for an early voting stop.
    pub vote_threshold: u32,
    /// Seconds around the event midpoint to retry when the midpoint read fails.
    pub event_offsets_seconds: Vec<f64>,
    /// Append the 2-3 digit region suffix to regional plates.
    pub include_region: bool,
    pub min_contrast: f64,
    pub fill_min: f64,
    pub fill_max: f64,
    /// Adaptive binarization window; escalated to the fallback size when the
    /// fill ratio or contrast gate rejects the primary result.
    pub adaptive_block: u32,
    pub adaptive_block_fallback: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            datapath: "tessdata".to_string(),
            languages: "eng".to_string(),
            psm: 7,
            whitelist: "ABEKMHOPCTYXАВЕКМНОРСТУХ0123456789".to_string(),
            audit_mode: false,
            call_budget_per_event: 64,
            max_regions_per_scan: 48,
            vote_threshold: 3,
            event_offsets_seconds: vec![-1.0, 1.0],
            include_region: false,
            min_contrast: 0.10,
            fill_min: 0.01,
            fill_max: 0.90,
            adaptive_block: 31,
            adaptive_block_fallback: 41,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TripConfig {
    /// Gap between consecutive events that closes a trip.
    pub gap_timeout_ms: i64,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            gap_timeout_ms: crate::detection::DEFAULT_TRIP_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One finalized loading event inside a video, video-relative milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEvent {
    pub t_ms: i64,
    pub plate: Option<String>,
}

/// Detector output for one video. `events` is sorted ascending by `t_ms` and,
/// post-merge, no two consecutive events are closer than the merge window.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub video: PathBuf,
    pub fps: f64,
    pub frames: i64,
    pub events: Vec<BucketEvent>,
}

impl DetectionResult {
    pub fn empty(video: &std::path::Path, fps: f64, frames: i64) -> Self {
        Self {
            video: video.to_path_buf(),
            fps,
            frames,
            events: Vec::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// One trip: a contiguous run of events attributed to one truck visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TripSegment {
    pub detection_id: i32,
    /// Dominant normalized plate, None for an undefined trip.
    pub plate: Option<String>,
    pub from_index: usize,
    pub to_index: usize,
    pub t_start_ms: i64,
    pub t_end_ms: i64,
}

impl TripSegment {
    pub fn events_count(&self) -> usize {
        self.to_index - self.from_index + 1
    }
}
