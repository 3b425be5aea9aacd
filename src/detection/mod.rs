// src/detection/mod.rs

mod detector;
mod segmenter;
mod trace;

// Re-export public APIs
pub use detector::{merge_close, suppress_spikes, BucketDetector};
pub use segmenter::{segment, segment_result, DEFAULT_TRIP_TIMEOUT_MS};
pub use trace::DetectorTrace;
