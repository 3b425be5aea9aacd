// src/ocr/plate_reader.rs
//
// Budget-bounded orchestration of plate recognition for one event: scan a
// grid of candidate regions near the bottom of the frame, canonicalize every
// read, vote, and keep an explicit best-candidate ranking. Only canonical
// plates are ever returned.

use std::collections::HashMap;

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contrast::{adaptive_threshold, equalize_histogram, otsu_level, threshold};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::ocr::engine::{RecognitionMode, TextRecognizer};
use crate::ocr::normalize::{clean_text, normalize_plate};
use crate::types::OcrConfig;
use crate::video::FrameSource;

// Candidate region grid: horizontal positions/widths and vertical
// positions/heights as fractions of the frame, bottom strip.
const ROI_FX: [f64; 9] = [0.25, 0.30, 0.35, 0.40, 0.45, 0.50, 0.55, 0.60, 0.65];
const ROI_FW: [f64; 3] = [0.14, 0.18, 0.22];
const ROI_FY: [f64; 4] = [0.88, 0.90, 0.92, 0.93];
const ROI_FH: [f64; 3] = [0.05, 0.06, 0.07];

/// Minimum normalized length that may win by vote.
const MIN_PLATE_LEN: usize = 6;
/// Regions narrower than this are upscaled before binarization.
const MIN_OCR_WIDTH: u32 = 420;

static GENERIC_PLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}\d{4}[A-Z]{2}$").unwrap());
static REGIONAL_PLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]\d{3}[A-Z]{2}(\d{2,3})?$").unwrap());

/// One scored recognition read.
#[derive(Debug, Clone)]
pub(crate) struct PlateCandidate {
    pub raw: String,
    pub cleaned: String,
    pub normalized: Option<String>,
    pub shape_score: i32,
}

impl PlateCandidate {
    pub(crate) fn new(raw: String, cleaned: String, normalized: Option<String>) -> Self {
        let shape_score = plate_shape_score(normalized.as_deref().unwrap_or(&cleaned));
        Self {
            raw,
            cleaned,
            normalized,
            shape_score,
        }
    }

    /// Canonical candidates score a flat maximum; raw ones score their length.
    fn score(&self) -> i32 {
        if self.normalized.is_some() {
            100
        } else {
            self.cleaned.chars().count() as i32
        }
    }

    /// Ranking key. Tie-break order: score, then template shape (a full
    /// 8-char template outranks the shorter regional form), then length.
    pub(crate) fn rank(&self) -> (i32, i32, usize) {
        (self.score(), self.shape_score, self.cleaned.chars().count())
    }

    /// A full 8-char generic canonical plate ends the scan unconditionally.
    fn is_full_generic(&self) -> bool {
        self.normalized
            .as_deref()
            .map_or(false, |p| GENERIC_PLATE.is_match(p))
    }
}

/// Shape priority used by the ranking: both canonical templates score high,
/// with a small bonus for the ideal 8-char form.
fn plate_shape_score(s: &str) -> i32 {
    let mut score = 0;
    if GENERIC_PLATE.is_match(s) {
        score += 200;
    }
    if REGIONAL_PLATE.is_match(s) {
        score += 200;
    }
    if s.chars().count() == 8 {
        score += 10;
    }
    score
}

pub struct PlateReader {
    engine: Box<dyn TextRecognizer>,
    cfg: OcrConfig,
    calls_total: u64,
}

impl PlateReader {
    pub fn new(engine: Box<dyn TextRecognizer>, cfg: OcrConfig) -> Self {
        Self {
            engine,
            cfg,
            calls_total: 0,
        }
    }

    /// Engine invocations across the reader's lifetime.
    pub fn total_engine_calls(&self) -> u64 {
        self.calls_total
    }

    /// Reads a plate for one event: the midpoint frame first, then the
    /// configured offsets around it (clamped to stream bounds), under one
    /// shared per-event call budget. Stops at the first canonical plate.
    pub fn read_event(
        &mut self,
        src: &mut dyn FrameSource,
        mid_frame: i64,
        fps: f64,
    ) -> Option<String> {
        let mut budget = self.cfg.call_budget_per_event;
        let frames = src.frame_count();
        let offsets: Vec<f64> = std::iter::once(0.0)
            .chain(self.cfg.event_offsets_seconds.iter().copied())
            .collect();

        let mut tried: Vec<i64> = Vec::with_capacity(offsets.len());
        for off in offsets {
            if budget == 0 {
                break;
            }
            let mut idx = mid_frame + (off * fps).round() as i64;
            idx = idx.max(0);
            if frames > 0 {
                idx = idx.min(frames - 1);
            }
            if tried.contains(&idx) {
                continue;
            }
            tried.push(idx);

            let Some(frame) = src.read_at(idx) else {
                continue;
            };
            if let Some(plate) = self.scan_frame(&frame.image, &mut budget) {
                debug!("plate at offset {off:+.1}s (frame {idx}): {plate}");
                return Some(plate);
            }
        }
        None
    }

    /// Scans the region grid of one frame. Early exits: a normalized plate
    /// reaching the vote threshold, a full 8-char canonical, region cap, or
    /// budget exhaustion. Returns a canonical plate or nothing.
    pub fn scan_frame(&mut self, image: &GrayImage, budget: &mut u32) -> Option<String> {
        let max_regions = self.cfg.max_regions_per_scan;
        let vote_threshold = self.cfg.vote_threshold.max(1);
        let include_region = self.cfg.include_region;

        let mut votes: HashMap<String, u32> = HashMap::new();
        let mut best: Option<PlateCandidate> = None;
        let mut regions = 0u32;

        'grid: for fy in ROI_FY {
            for fh in ROI_FH {
                for fx in ROI_FX {
                    for fw in ROI_FW {
                        if regions >= max_regions || *budget == 0 {
                            break 'grid;
                        }
                        regions += 1;

                        let rect = roi_rect(image.width(), image.height(), fx, fy, fw, fh);
                        let Some(bin) = prepare_region(image, rect, &self.cfg) else {
                            continue;
                        };
                        let Some(raw) = self.recognize(&bin, budget) else {
                            continue;
                        };
                        let Some(cleaned) = clean_token(&raw) else {
                            continue;
                        };
                        let normalized = normalize_plate(&cleaned, include_region);
                        let cand = PlateCandidate::new(raw, cleaned, normalized);
                        debug!(
                            "OCR roi#{} rect=({},{},{},{}): raw='{}' cleaned='{}' norm={:?}",
                            regions - 1,
                            rect.0,
                            rect.1,
                            rect.2,
                            rect.3,
                            cand.raw,
                            cand.cleaned,
                            cand.normalized
                        );

                        if let Some(norm) = &cand.normalized {
                            if norm.chars().count() >= MIN_PLATE_LEN {
                                let n = votes.entry(norm.clone()).or_insert(0);
                                *n += 1;
                                if *n >= vote_threshold {
                                    return Some(norm.clone());
                                }
                            }
                        }

                        let better = best.as_ref().map_or(true, |b| cand.rank() > b.rank());
                        if better {
                            let stop = cand.is_full_generic();
                            best = Some(cand);
                            if stop {
                                break 'grid;
                            }
                        }
                    }
                }
            }
        }

        best.and_then(|b| b.normalized)
    }

    /// One recognition attempt: primary mode, then one segmentation-sweep
    /// retry when the primary read is empty or digits-only. Every engine
    /// submission costs one unit of budget.
    fn recognize(&mut self, bin: &GrayImage, budget: &mut u32) -> Option<String> {
        if *budget == 0 {
            return None;
        }
        *budget -= 1;
        self.calls_total += 1;
        let first = self
            .engine
            .recognize_best_token(bin, RecognitionMode::Primary);

        let usable = first
            .as_deref()
            .map_or(false, |t| !t.chars().all(|c| c.is_ascii_digit()));
        if usable {
            return first;
        }
        if *budget == 0 {
            return first;
        }
        *budget -= 1;
        self.calls_total += 1;
        self.engine
            .recognize_best_token(bin, RecognitionMode::SegmentationSweep)
            .or(first)
    }
}

/// Cleaned token gate: uppercase alphanumeric, at least 3 chars with at
/// least one digit and one letter.
fn clean_token(raw: &str) -> Option<String> {
    let cleaned = clean_text(raw);
    if cleaned.chars().count() < 3 {
        return None;
    }
    let has_digit = cleaned.chars().any(|c| c.is_ascii_digit());
    let has_letter = cleaned.chars().any(|c| c.is_ascii_alphabetic());
    (has_digit && has_letter).then_some(cleaned)
}

type Rect = (u32, u32, u32, u32);

fn roi_rect(w: u32, h: u32, fx: f64, fy: f64, fw: f64, fh: f64) -> Rect {
    let rx = ((w as f64 * fx).round() as u32).min(w.saturating_sub(1));
    let ry = ((h as f64 * fy).round() as u32).min(h.saturating_sub(1));
    let rw = ((w as f64 * fw).round() as u32).clamp(1, w - rx);
    let rh = ((h as f64 * fh).round() as u32).clamp(1, h - ry);
    (rx, ry, rw, rh)
}

/// Prepares one candidate region for recognition: crop, contrast
/// normalization, upscale, adaptive binarization with escalation to a larger
/// adaptive window and then a global Otsu threshold when the foreground fill
/// ratio or contrast gate rejects the result. Returns nothing when every
/// strategy fails.
fn prepare_region(image: &GrayImage, rect: Rect, cfg: &OcrConfig) -> Option<GrayImage> {
    let (rx, ry, rw, rh) = rect;
    let roi = imageops::crop_imm(image, rx, ry, rw, rh).to_image();

    let contrast = contrast_of(&roi);
    let eq = equalize_histogram(&roi);
    let up = if eq.width() < MIN_OCR_WIDTH {
        let nw = MIN_OCR_WIDTH;
        let nh = ((eq.height() as u64 * nw as u64) / eq.width().max(1) as u64).max(1) as u32;
        imageops::resize(&eq, nw, nh, FilterType::CatmullRom)
    } else {
        eq
    };

    // Primary: adaptive window + close to bridge broken strokes.
    let bin = adaptive_threshold(&up, block_radius(cfg.adaptive_block));
    let bin = erode(&dilate(&bin, Norm::LInf, 1), Norm::LInf, 1);
    let fill = fill_ratio(&bin);
    if (cfg.fill_min..=cfg.fill_max).contains(&fill) && contrast >= cfg.min_contrast {
        return Some(bin);
    }

    // Fallback 1: larger adaptive window.
    let bin2 = adaptive_threshold(&up, block_radius(cfg.adaptive_block_fallback));
    let fill2 = fill_ratio(&bin2);
    if (cfg.fill_min..=cfg.fill_max).contains(&fill2) {
        debug!("binarization fallback#1 ok (fill={fill2:.3})");
        return Some(bin2);
    }

    // Fallback 2: global Otsu.
    let bin3 = threshold(&up, otsu_level(&up));
    let fill3 = fill_ratio(&bin3);
    if (cfg.fill_min..=cfg.fill_max).contains(&fill3) {
        debug!("binarization fallback#2 otsu ok (fill={fill3:.3})");
        return Some(bin3);
    }

    debug!("region skipped after fallbacks (fill={fill:.3}, contrast={contrast:.3})");
    None
}

fn block_radius(block: u32) -> u32 {
    (block.max(3) / 2).max(1)
}

fn fill_ratio(img: &GrayImage) -> f64 {
    let total = (img.width() as u64 * img.height() as u64).max(1);
    let lit = img.pixels().filter(|p| p.0[0] > 0).count() as u64;
    lit as f64 / total as f64
}

/// Standard deviation of brightness, scaled to [0, 1].
fn contrast_of(img: &GrayImage) -> f64 {
    let n = (img.width() as u64 * img.height() as u64) as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut sq = 0.0;
    for p in img.pixels() {
        let v = p.0[0] as f64;
        sum += v;
        sq += v * v;
    }
    let mean = sum / n;
    (sq / n - mean * mean).max(0.0).sqrt() / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Frame;
    use image::Luma;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FakeEngine {
        reply: Option<String>,
        calls: Rc<Cell<u32>>,
    }

    impl TextRecognizer for FakeEngine {
        fn recognize_best_token(
            &mut self,
            _region: &GrayImage,
            _mode: RecognitionMode,
        ) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            self.reply.clone()
        }
    }

    struct OneFrameSource {
        image: GrayImage,
    }

    impl FrameSource for OneFrameSource {
        fn frame_rate(&self) -> f64 {
            25.0
        }
        fn frame_count(&self) -> i64 {
            100
        }
        fn read_next(&mut self) -> Option<Frame> {
            None
        }
        fn read_at(&mut self, index: i64) -> Option<Frame> {
            Some(Frame {
                index,
                image: self.image.clone(),
            })
        }
    }

    /// High-contrast checkerboard: every region passes the binarization gates.
    fn checkerboard(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if (x / 2 + y / 2) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        })
    }

    fn reader_with(
        reply: Option<&str>,
        cfg: OcrConfig,
    ) -> (PlateReader, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        let engine = FakeEngine {
            reply: reply.map(str::to_string),
            calls: Rc::clone(&calls),
        };
        (PlateReader::new(Box::new(engine), cfg), calls)
    }

    #[test]
    fn vote_threshold_stops_early() {
        let cfg = OcrConfig {
            vote_threshold: 2,
            ..OcrConfig::default()
        };
        let (mut reader, calls) = reader_with(Some("A123BC"), cfg);
        let frame = checkerboard(320, 240);
        let mut budget = 64;
        let got = reader.scan_frame(&frame, &mut budget);
        assert_eq!(got.as_deref(), Some("A123BC"));
        // regional plate is not a full 8-char generic: two agreeing reads
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn full_generic_stops_after_first_read() {
        let cfg = OcrConfig {
            vote_threshold: 10,
            ..OcrConfig::default()
        };
        let (mut reader, calls) = reader_with(Some("AB1234CD"), cfg);
        let frame = checkerboard(320, 240);
        let mut budget = 64;
        let got = reader.scan_frame(&frame, &mut budget);
        assert_eq!(got.as_deref(), Some("AB1234CD"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn call_budget_is_a_hard_ceiling() {
        let (mut reader, calls) = reader_with(None, OcrConfig::default());
        let frame = checkerboard(320, 240);
        let mut budget = 5;
        // empty reads trigger the sweep retry: two calls per region
        let got = reader.scan_frame(&frame, &mut budget);
        assert_eq!(got, None);
        assert_eq!(calls.get(), 5);
        assert_eq!(budget, 0);
    }

    #[test]
    fn raw_text_is_never_surfaced() {
        // recognizable text that fits no template
        let (mut reader, calls) = reader_with(Some("Q1W2E3R4T5"), OcrConfig::default());
        let frame = checkerboard(320, 240);
        let mut budget = 64;
        let got = reader.scan_frame(&frame, &mut budget);
        assert_eq!(got, None);
        assert!(calls.get() > 0);
    }

    #[test]
    fn read_event_scans_midpoint_first() {
        let cfg = OcrConfig {
            vote_threshold: 1,
            ..OcrConfig::default()
        };
        let (mut reader, _calls) = reader_with(Some("AB1234CD"), cfg);
        let mut src = OneFrameSource {
            image: checkerboard(320, 240),
        };
        let got = reader.read_event(&mut src, 50, 25.0);
        assert_eq!(got.as_deref(), Some("AB1234CD"));
        assert!(reader.total_engine_calls() >= 1);
    }

    #[test]
    fn ranking_prefers_canonical_then_shape_then_length() {
        let canonical8 = PlateCandidate::new(
            "AB1234CD".into(),
            "AB1234CD".into(),
            Some("AB1234CD".into()),
        );
        let regional6 =
            PlateCandidate::new("A123BC".into(), "A123BC".into(), Some("A123BC".into()));
        let raw_long =
            PlateCandidate::new("Q1W2E3R4T5".into(), "Q1W2E3R4T5".into(), None);
        let raw_short = PlateCandidate::new("AB12".into(), "AB12".into(), None);

        assert!(canonical8.rank() > regional6.rank());
        assert!(regional6.rank() > raw_long.rank());
        assert!(raw_long.rank() > raw_short.rank());
    }

    #[test]
    fn cleaning_gate_requires_mixed_alnum() {
        assert_eq!(clean_token("12345"), None);
        assert_eq!(clean_token("ABCDE"), None);
        assert_eq!(clean_token("ab"), None);
        assert_eq!(clean_token("a1 2b!").as_deref(), Some("A12B"));
    }
}
