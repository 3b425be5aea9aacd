// src/detection/segmenter.rs
//
// Groups a time-ordered event stream into trips: a gap above the timeout
// closes the current trip, and each trip's plate is decided by vote.

use std::collections::HashMap;

use anyhow::Result;

use crate::types::{DetectionResult, TripSegment};

pub const DEFAULT_TRIP_TIMEOUT_MS: i64 = 60_000;

/// Matching reads required before a plate is attributed to a trip.
const MIN_PLATE_VOTES: u32 = 2;

/// Segments `times_ms` (ascending, not re-sorted here) into trips.
///
/// `plates`, when given, must have the same length as `times_ms` — a mismatch
/// is a caller bug and fails hard. Empty input yields an empty list.
pub fn segment(
    detection_id: i32,
    times_ms: &[i64],
    plates: Option<&[Option<String>]>,
    trip_timeout_ms: i64,
) -> Result<Vec<TripSegment>> {
    if times_ms.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(p) = plates {
        if p.len() != times_ms.len() {
            anyhow::bail!(
                "plates length {} must match timestamps length {}",
                p.len(),
                times_ms.len()
            );
        }
    }

    let n = times_ms.len();
    let mut segments = Vec::new();
    let mut start_idx = 0usize;
    let mut plate_counts: HashMap<&str, u32> = HashMap::new();

    for i in 0..n {
        if i > 0 && times_ms[i] - times_ms[i - 1] > trip_timeout_ms {
            segments.push(close_trip(
                detection_id,
                times_ms,
                start_idx,
                i - 1,
                &plate_counts,
            ));
            start_idx = i;
            plate_counts.clear();
        }
        if let Some(p) = plates {
            if let Some(plate) = p[i].as_deref() {
                if !plate.is_empty() {
                    *plate_counts.entry(plate).or_insert(0) += 1;
                }
            }
        }
    }
    segments.push(close_trip(
        detection_id,
        times_ms,
        start_idx,
        n - 1,
        &plate_counts,
    ));

    Ok(segments)
}

/// Segments a detection result with the event plates it carries.
pub fn segment_result(
    detection_id: i32,
    detection: &DetectionResult,
    trip_timeout_ms: i64,
) -> Result<Vec<TripSegment>> {
    let times: Vec<i64> = detection.events.iter().map(|e| e.t_ms).collect();
    let plates: Vec<Option<String>> =
        detection.events.iter().map(|e| e.plate.clone()).collect();
    segment(detection_id, &times, Some(&plates), trip_timeout_ms)
}

fn close_trip(
    detection_id: i32,
    times_ms: &[i64],
    from_index: usize,
    to_index: usize,
    plate_counts: &HashMap<&str, u32>,
) -> TripSegment {
    TripSegment {
        detection_id,
        plate: dominant_plate(plate_counts),
        from_index,
        to_index,
        t_start_ms: times_ms[from_index],
        t_end_ms: times_ms[to_index],
    }
}

/// Most frequent plate, requiring at least `MIN_PLATE_VOTES` matching reads;
/// equal counts resolve to the lexicographically smallest plate so the
/// outcome never depends on hash order.
fn dominant_plate(plate_counts: &HashMap<&str, u32>) -> Option<String> {
    plate_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .filter(|(_, count)| **count >= MIN_PLATE_VOTES)
        .map(|(plate, _)| (*plate).to_string())
}
