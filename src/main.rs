// src/main.rs

use anyhow::Result;
use bucketwatch::detection::BucketDetector;
use bucketwatch::ocr::PlateReader;
use bucketwatch::types::Config;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use walkdir::WalkDir;

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(Path::new(&config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Quarry loading-event detection starting");
    info!("✓ Configuration loaded from {config_path}");
    info!(
        "Detection thresholds: event_ratio={:.3}, low_factor={:.2}, min_active_ms={}, merge_window_ms={}",
        config.detection.event_ratio,
        config.detection.threshold_low_factor,
        config.detection.min_active_ms,
        config.detection.merge_window_ms
    );

    let videos = find_video_files(&config.video.input_dir);
    if videos.is_empty() {
        error!("No video files found in {}", config.video.input_dir);
        return Ok(());
    }
    info!("Found {} video file(s) to process", videos.len());

    std::fs::create_dir_all(&config.video.output_dir)?;

    let detector = BucketDetector::new(config.detection.clone());
    let mut reader = build_plate_reader(&config);

    let mut total_events = 0usize;
    let mut total_trips = 0usize;
    for (idx, video) in videos.iter().enumerate() {
        info!(
            "Processing video {}/{}: {}",
            idx + 1,
            videos.len(),
            video.display()
        );
        match process_video(&detector, video, &config, reader.as_mut()) {
            Ok((events, trips)) => {
                total_events += events;
                total_trips += trips;
            }
            Err(e) => error!("Failed to process {}: {e:#}", video.display()),
        }
    }

    info!("Done: {total_events} event(s), {total_trips} trip(s)");
    if let Some(r) = &reader {
        info!("OCR engine calls total: {}", r.total_engine_calls());
    }
    Ok(())
}

fn find_video_files(input_dir: &str) -> Vec<PathBuf> {
    let video_extensions = ["mp4", "avi", "mov", "mkv", "MP4", "AVI", "MOV", "MKV"];

    let mut videos = Vec::new();
    for entry in WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if let Some(ext) = path.extension() {
            if video_extensions.contains(&ext.to_str().unwrap_or("")) {
                videos.push(path.to_path_buf());
            }
        }
    }
    videos.sort();
    videos
}

#[cfg(feature = "ocr-tesseract")]
fn build_plate_reader(config: &Config) -> Option<PlateReader> {
    use tracing::warn;

    if !config.ocr.enabled {
        info!("⚪ OCR disabled in config");
        return None;
    }
    match bucketwatch::ocr::TesseractEngine::new(&config.ocr) {
        Ok(engine) => {
            info!("✓ OCR engine ready");
            Some(PlateReader::new(Box::new(engine), config.ocr.clone()))
        }
        Err(e) => {
            warn!("OCR init failed: {e:#}. Continuing without plate recognition.");
            None
        }
    }
}

#[cfg(not(feature = "ocr-tesseract"))]
fn build_plate_reader(config: &Config) -> Option<PlateReader> {
    if config.ocr.enabled {
        tracing::warn!(
            "ocr.enabled is set but the binary was built without the ocr-tesseract feature"
        );
    }
    None
}

/// Runs detection + trip segmentation for one video and writes the
/// per-video JSONL artifacts. Returns (events, trips) counts.
#[cfg(feature = "video-opencv")]
fn process_video(
    detector: &BucketDetector,
    video: &Path,
    config: &Config,
    reader: Option<&mut PlateReader>,
) -> Result<(usize, usize)> {
    use std::io::Write;
    use std::time::Instant;

    let started = Instant::now();
    let res = detector.detect_file(video, reader);
    info!(
        "✓ {}: {} event(s) @ {:.1} FPS, {} frames in {:.1}s",
        video.display(),
        res.event_count(),
        res.fps,
        res.frames,
        started.elapsed().as_secs_f64()
    );

    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let out_dir = Path::new(&config.video.output_dir);

    let events_path = out_dir.join(format!("{stem}_events.jsonl"));
    let mut events_file = std::fs::File::create(&events_path)?;
    for event in &res.events {
        writeln!(events_file, "{}", serde_json::to_string(event)?)?;
    }
    events_file.flush()?;

    let trips = bucketwatch::detection::segment_result(0, &res, config.trips.gap_timeout_ms)?;
    for trip in &trips {
        info!(
            "  trip events #{}..#{}: {} event(s), plate={}, {:.1}s..{:.1}s",
            trip.from_index,
            trip.to_index,
            trip.events_count(),
            trip.plate.as_deref().unwrap_or("undefined"),
            trip.t_start_ms as f64 / 1000.0,
            trip.t_end_ms as f64 / 1000.0
        );
    }

    let trips_path = out_dir.join(format!("{stem}_trips.jsonl"));
    let mut trips_file = std::fs::File::create(&trips_path)?;
    for trip in &trips {
        writeln!(trips_file, "{}", serde_json::to_string(trip)?)?;
    }
    trips_file.flush()?;
    info!(
        "💾 Results written to {} and {}",
        events_path.display(),
        trips_path.display()
    );

    Ok((res.event_count(), trips.len()))
}

#[cfg(not(feature = "video-opencv"))]
fn process_video(
    _detector: &BucketDetector,
    _video: &Path,
    _config: &Config,
    _reader: Option<&mut PlateReader>,
) -> Result<(usize, usize)> {
    anyhow::bail!("built without video support; rebuild with --features video-opencv")
}
