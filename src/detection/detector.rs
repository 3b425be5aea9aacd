// src/detection/detector.rs
//
// Motion-based loading-event detector: a hysteresis state machine over a
// smoothed frame-difference signal. One invocation owns all of its buffers;
// nothing here is shared across runs.

use std::path::Path;
use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::contrast::threshold;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::map::map_colors2;
use imageproc::morphology::{dilate, erode};
use tracing::{debug, error, info, warn};

use crate::detection::trace::DetectorTrace;
use crate::ocr::PlateReader;
use crate::types::{BucketEvent, DetectionConfig, DetectionResult};
use crate::video::FrameSource;

/// Matches the 5x5 Gaussian smoothing applied to every working frame.
const BLUR_SIGMA: f32 = 1.1;

const TRACE_DIR: &str = "trace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    Active { start_frame: i64 },
}

impl DetectorState {
    fn name(&self) -> &'static str {
        match self {
            DetectorState::Idle => "IDLE",
            DetectorState::Active { .. } => "ACTIVE",
        }
    }
}

pub struct BucketDetector {
    cfg: DetectionConfig,
}

impl BucketDetector {
    /// Clamps every tuning parameter into its sane range.
    pub fn new(cfg: DetectionConfig) -> Self {
        let mut cfg = cfg;
        cfg.step_frames = cfg.step_frames.max(1);
        cfg.diff_threshold = cfg.diff_threshold.max(1);
        cfg.event_ratio = cfg.event_ratio.max(1e-4);
        cfg.cooldown_frames = cfg.cooldown_frames.max(0);
        cfg.min_changed_pixels = cfg.min_changed_pixels.max(0);
        cfg.morph_w = cfg.morph_w.max(1);
        cfg.morph_h = cfg.morph_h.max(1);
        cfg.merge_window_ms = cfg.merge_window_ms.max(0);
        cfg.ema_alpha = cfg.ema_alpha.clamp(0.0, 1.0);
        cfg.threshold_low_factor = cfg.threshold_low_factor.max(1e-6);
        cfg.min_active_ms = cfg.min_active_ms.max(0);
        cfg.nms_window_ms = cfg.nms_window_ms.max(0);
        Self { cfg }
    }

    /// Opens `video` and runs detection. A missing, unreadable or zero-byte
    /// file yields an empty result, never an error.
    #[cfg(feature = "video-opencv")]
    pub fn detect_file(
        &self,
        video: &Path,
        reader: Option<&mut PlateReader>,
    ) -> DetectionResult {
        match std::fs::metadata(video) {
            Ok(m) if m.is_file() && m.len() > 0 => {}
            _ => {
                error!("Video file invalid or empty: {}", video.display());
                return DetectionResult::empty(video, 0.0, 0);
            }
        }
        let mut src = match crate::video::VideoFileSource::open(video) {
            Ok(s) => s,
            Err(e) => {
                error!("{e:#}");
                return DetectionResult::empty(video, 0.0, 0);
            }
        };
        self.detect(&mut src, video, reader)
    }

    /// Runs detection over an already-open frame source. Any mid-stream read
    /// failure is treated as end-of-stream; whatever was accumulated so far
    /// is returned.
    pub fn detect(
        &self,
        src: &mut dyn FrameSource,
        video: &Path,
        mut reader: Option<&mut PlateReader>,
    ) -> DetectionResult {
        let c = &self.cfg;
        let mut fps = src.frame_rate();
        if !(fps > 1e-3) {
            fps = 25.0;
        }
        let frame_count = src.frame_count();

        info!(
            "Detect params: step_frames={}, diff_threshold={}, event_ratio={}, cooldown_frames={}, \
             min_changed_pixels={}, merge_window_ms={}, ema_alpha={}, threshold_low_factor={}, \
             min_active_ms={}, nms_window_ms={}",
            c.step_frames,
            c.diff_threshold,
            c.event_ratio,
            c.cooldown_frames,
            c.min_changed_pixels,
            c.merge_window_ms,
            c.ema_alpha,
            c.threshold_low_factor,
            c.min_active_ms,
            c.nms_window_ms
        );

        let started = Instant::now();
        let mut trace = if c.trace_enabled {
            let stem = video
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "video".to_string());
            match DetectorTrace::create(Path::new(TRACE_DIR), &stem) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("trace init failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let Some(first) = src.read_next() else {
            error!("First frame is empty: {}", video.display());
            return DetectionResult::empty(video, fps, frame_count);
        };
        let mut baseline = gaussian_blur_f32(&first.image, BLUR_SIGMA);

        let morph_k = (c.morph_w.max(c.morph_h) / 2).max(1) as u8;
        let thr_high = c.event_ratio;
        let thr_low = (c.event_ratio * c.threshold_low_factor).max(1e-6);
        let min_active_frames = (((c.min_active_ms as f64 / 1000.0) * fps).round() as i64).max(1);

        let mut events: Vec<BucketEvent> = Vec::new();
        let mut state = DetectorState::Idle;
        let mut ema = 0.0f64;
        let mut last_event_frame: i64 = -c.cooldown_frames - 1;
        let mut idx: i64 = 1;

        'frames: loop {
            if c.max_processing_time_ms > 0
                && started.elapsed().as_millis() as i64 >= c.max_processing_time_ms
            {
                info!(
                    "max processing time reached after {} frames, stopping early",
                    idx
                );
                break;
            }

            let Some(mut frame) = src.read_next() else {
                break;
            };
            for _ in 1..c.step_frames {
                match src.read_next() {
                    Some(f) => {
                        frame = f;
                        idx += 1;
                    }
                    None => break 'frames,
                }
            }

            let gray = gaussian_blur_f32(&frame.image, BLUR_SIGMA);
            if gray.dimensions() != baseline.dimensions() {
                warn!("frame {} changed size mid-stream, resetting baseline", frame.index);
                baseline = gray;
                idx += 1;
                continue;
            }

            let (changed, total) = changed_pixels(&gray, &baseline, c.diff_threshold, morph_k);
            if (changed as i64) < c.min_changed_pixels {
                baseline = gray;
                idx += 1;
                continue;
            }

            let ratio = changed as f64 / total as f64;
            ema = c.ema_alpha * ratio + (1.0 - c.ema_alpha) * ema;
            let ms_now = (idx as f64 / fps * 1000.0) as i64;
            let mut state_name = state.name();
            let mut event_mark = false;

            match state {
                DetectorState::Idle => {
                    if idx - last_event_frame > c.cooldown_frames && ema >= thr_high {
                        state = DetectorState::Active { start_frame: idx };
                    }
                }
                DetectorState::Active { start_frame } => {
                    if ema < thr_low {
                        let dur = idx - start_frame;
                        if dur >= min_active_frames {
                            let mid = start_frame + dur / 2;
                            let t_ms = (mid as f64 / fps * 1000.0) as i64;
                            let plate = read_event_plate(reader.as_mut(), src, mid, fps);
                            events.push(BucketEvent { t_ms, plate });
                            last_event_frame = idx;
                            event_mark = true;
                        }
                        state = DetectorState::Idle;
                        state_name = state.name();
                    }
                }
            }

            if let Some(t) = trace.as_mut() {
                t.row(ms_now, idx, ratio, ema, state_name, event_mark);
            }

            baseline = gray;
            idx += 1;
        }

        // Stream ended (or the run was stopped) while Active: the same
        // minimum-dwell check applies to the final interval.
        if let DetectorState::Active { start_frame } = state {
            let dur = idx - start_frame;
            if dur >= min_active_frames {
                let mid = start_frame + dur / 2;
                let t_ms = (mid as f64 / fps * 1000.0) as i64;
                let start_ms = (start_frame as f64 / fps * 1000.0) as i64;
                let dur_ms = (dur as f64 / fps * 1000.0) as i64;
                info!("evt interval at EOF: start_ms={start_ms} dur_ms={dur_ms} mid_ms={t_ms}");
                let plate = read_event_plate(reader.as_mut(), src, mid, fps);
                events.push(BucketEvent { t_ms, plate });
            }
        }

        let events = suppress_spikes(events, c.nms_window_ms);
        let events = merge_close(events, c.merge_window_ms);
        debug!("{} event(s) after NMS+merge", events.len());

        DetectionResult {
            video: video.to_path_buf(),
            fps,
            frames: frame_count,
            events,
        }
    }
}

fn read_event_plate(
    reader: Option<&mut &mut PlateReader>,
    src: &mut dyn FrameSource,
    mid_frame: i64,
    fps: f64,
) -> Option<String> {
    let reader = reader?;
    let plate = reader.read_event(src, mid_frame, fps);
    match &plate {
        Some(p) => info!("OCR plate@frame {mid_frame}: {p}"),
        None => debug!("OCR no plate @frame {mid_frame}"),
    }
    plate
}

/// Frame-difference pipeline: absolute difference against the baseline,
/// binarize, erode then dilate to drop isolated noise, count survivors.
fn changed_pixels(gray: &GrayImage, baseline: &GrayImage, thr: u8, morph_k: u8) -> (u64, u64) {
    let diff = map_colors2(gray, baseline, |p, q| Luma([p.0[0].abs_diff(q.0[0])]));
    let bin = threshold(&diff, thr);
    let bin = dilate(&erode(&bin, Norm::LInf, morph_k), Norm::LInf, morph_k);
    let total = bin.width() as u64 * bin.height() as u64;
    let changed = bin.pixels().filter(|p| p.0[0] > 0).count() as u64;
    (changed, total)
}

/// Time-windowed spike suppression: only the first event inside any
/// `window_ms` window survives.
pub fn suppress_spikes(events: Vec<BucketEvent>, window_ms: i64) -> Vec<BucketEvent> {
    let mut out: Vec<BucketEvent> = Vec::with_capacity(events.len());
    for e in events {
        match out.last() {
            Some(last) if e.t_ms - last.t_ms <= window_ms => {}
            _ => out.push(e),
        }
    }
    out
}

/// Collapses consecutive events closer than `window_ms` into one, keeping
/// the earliest timestamp. The first non-empty plate of the collapsed group
/// wins; a later non-empty plate only fills a still-empty slot.
pub fn merge_close(events: Vec<BucketEvent>, window_ms: i64) -> Vec<BucketEvent> {
    let mut out: Vec<BucketEvent> = Vec::with_capacity(events.len());
    for e in events {
        match out.last_mut() {
            Some(last) if e.t_ms - last.t_ms <= window_ms => {
                if last.plate.is_none() && e.plate.is_some() {
                    last.plate = e.plate;
                }
            }
            _ => out.push(e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Frame;

    fn ev(t_ms: i64, plate: Option<&str>) -> BucketEvent {
        BucketEvent {
            t_ms,
            plate: plate.map(str::to_string),
        }
    }

    #[test]
    fn nms_keeps_first_event_per_window() {
        let events = vec![ev(0, None), ev(500, None), ev(1500, None), ev(4000, None)];
        let out = suppress_spikes(events, 2000);
        assert_eq!(
            out.iter().map(|e| e.t_ms).collect::<Vec<_>>(),
            vec![0, 4000]
        );
    }

    #[test]
    fn merge_collapses_and_keeps_earliest() {
        let events = vec![ev(0, None), ev(3000, None), ev(10_000, None)];
        let out = merge_close(events, 4000);
        assert_eq!(
            out.iter().map(|e| e.t_ms).collect::<Vec<_>>(),
            vec![0, 10_000]
        );
    }

    #[test]
    fn merge_first_plate_wins_and_fills_empty_slots() {
        let events = vec![
            ev(0, None),
            ev(1000, Some("AB1234CD")),
            ev(2000, Some("XY5678ZW")),
        ];
        let out = merge_close(events, 4000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].t_ms, 0);
        assert_eq!(out[0].plate.as_deref(), Some("AB1234CD"));
    }

    #[test]
    fn merged_events_respect_minimum_gap() {
        let events: Vec<BucketEvent> = (0..20).map(|i| ev(i * 900, None)).collect();
        let out = merge_close(suppress_spikes(events, 1000), 2000);
        for pair in out.windows(2) {
            assert!(pair[1].t_ms - pair[0].t_ms > 2000);
        }
        assert!(out.windows(2).all(|p| p[0].t_ms < p[1].t_ms));
    }

    struct SyntheticSource {
        frames: Vec<GrayImage>,
        pos: usize,
        fps: f64,
    }

    impl FrameSource for SyntheticSource {
        fn frame_rate(&self) -> f64 {
            self.fps
        }
        fn frame_count(&self) -> i64 {
            self.frames.len() as i64
        }
        fn read_next(&mut self) -> Option<Frame> {
            let index = self.pos;
            let image = self.frames.get(index)?.clone();
            self.pos += 1;
            Some(Frame {
                index: index as i64,
                image,
            })
        }
        fn read_at(&mut self, index: i64) -> Option<Frame> {
            Some(Frame {
                index,
                image: self.frames.get(index as usize)?.clone(),
            })
        }
    }

    const BURST_START: usize = 40;
    const BURST_END: usize = 80; // exclusive

    /// 64x64 frames: a small wandering dot as background noise, plus one
    /// alternating half-field burst that models a bucket dump.
    fn synth_frame(i: usize) -> GrayImage {
        let mut img = GrayImage::new(64, 64);
        if (BURST_START..BURST_END).contains(&i) {
            let x0 = if i % 2 == 0 { 0 } else { 32 };
            for y in 0..64 {
                for x in x0..x0 + 32 {
                    img.put_pixel(x, y, Luma([255]));
                }
            }
        } else {
            let (dx, dy) = if i % 2 == 0 { (4, 4) } else { (20, 20) };
            for y in dy..dy + 4 {
                for x in dx..dx + 4 {
                    img.put_pixel(x, y, Luma([255]));
                }
            }
        }
        img
    }

    fn burst_config() -> DetectionConfig {
        DetectionConfig {
            step_frames: 1,
            diff_threshold: 25,
            event_ratio: 0.2,
            cooldown_frames: 10,
            min_changed_pixels: 32,
            morph_w: 3,
            morph_h: 3,
            merge_window_ms: 2000,
            ema_alpha: 0.9,
            threshold_low_factor: 0.5,
            min_active_ms: 800,
            nms_window_ms: 1000,
            trace_enabled: false,
            max_processing_time_ms: 0,
        }
    }

    #[test]
    fn single_burst_yields_one_event_at_midpoint() {
        let fps = 25.0;
        let mut src = SyntheticSource {
            frames: (0..120).map(synth_frame).collect(),
            pos: 0,
            fps,
        };
        let detector = BucketDetector::new(burst_config());
        let res = detector.detect(&mut src, Path::new("synthetic"), None);

        assert_eq!(res.events.len(), 1, "events: {:?}", res.events);
        let expected_ms =
            ((BURST_START + BURST_END - 1) as f64 / 2.0 / fps * 1000.0) as i64;
        let frame_period_ms = (1000.0 / fps) as i64;
        let got = res.events[0].t_ms;
        assert!(
            (got - expected_ms).abs() <= frame_period_ms,
            "event at {got} ms, expected within {frame_period_ms} ms of {expected_ms} ms"
        );
        assert_eq!(res.events[0].plate, None);
    }

    #[test]
    fn burst_shorter_than_min_dwell_is_noise() {
        let fps = 25.0;
        // 4-frame burst, far below the 800 ms dwell requirement
        let frames: Vec<GrayImage> = (0..120)
            .map(|i| {
                if (40..44).contains(&i) {
                    synth_frame(if i % 2 == 0 { 40 } else { 41 })
                } else {
                    synth_frame(if i % 2 == 0 { 0 } else { 1 })
                }
            })
            .collect();
        let mut src = SyntheticSource {
            frames,
            pos: 0,
            fps,
        };
        let detector = BucketDetector::new(burst_config());
        let res = detector.detect(&mut src, Path::new("synthetic"), None);
        assert!(res.events.is_empty(), "events: {:?}", res.events);
    }

    #[test]
    fn empty_source_yields_empty_result() {
        let mut src = SyntheticSource {
            frames: Vec::new(),
            pos: 0,
            fps: 25.0,
        };
        let detector = BucketDetector::new(DetectionConfig::default());
        let res = detector.detect(&mut src, Path::new("missing"), None);
        assert_eq!(res.event_count(), 0);
        assert_eq!(res.frames, 0);
    }

    #[test]
    fn events_are_sorted_and_respect_merge_window() {
        let fps = 25.0;
        // two bursts separated by a long quiet stretch
        let frames: Vec<GrayImage> = (0..400)
            .map(|i| {
                if (40..80).contains(&i) || (300..340).contains(&i) {
                    synth_frame(if i % 2 == 0 { 40 } else { 41 })
                } else {
                    synth_frame(if i % 2 == 0 { 0 } else { 1 })
                }
            })
            .collect();
        let mut src = SyntheticSource {
            frames,
            pos: 0,
            fps,
        };
        let detector = BucketDetector::new(burst_config());
        let res = detector.detect(&mut src, Path::new("synthetic"), None);

        assert_eq!(res.events.len(), 2, "events: {:?}", res.events);
        for pair in res.events.windows(2) {
            assert!(pair[0].t_ms < pair[1].t_ms);
            assert!(pair[1].t_ms - pair[0].t_ms > 2000);
        }
    }
}
