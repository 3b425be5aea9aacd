// src/video.rs

use image::GrayImage;

/// One decoded grayscale frame. `index` is the absolute frame number in the
/// stream; the timestamp is derived as `index / fps * 1000`, rounded down.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: i64,
    pub image: GrayImage,
}

/// Sequential frame supplier with random access for recognition snapshots.
///
/// Implementations must treat read failures as end-of-stream: truncated and
/// corrupt recordings are expected in the field and must not abort a run.
pub trait FrameSource {
    fn frame_rate(&self) -> f64;

    /// Total frame count as reported by the container; may be 0 when unknown.
    fn frame_count(&self) -> i64;

    fn read_next(&mut self) -> Option<Frame>;

    /// Reads the frame at `index` without disturbing the sequential position.
    fn read_at(&mut self, index: i64) -> Option<Frame>;
}

#[cfg(feature = "video-opencv")]
pub use capture::VideoFileSource;

#[cfg(feature = "video-opencv")]
mod capture {
    use super::{Frame, FrameSource};
    use anyhow::Result;
    use image::GrayImage;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
    };
    use std::path::Path;
    use tracing::info;

    /// OpenCV-backed video file source.
    pub struct VideoFileSource {
        cap: VideoCapture,
        fps: f64,
        frames: i64,
        next_index: i64,
    }

    impl VideoFileSource {
        pub fn open(path: &Path) -> Result<Self> {
            let cap = VideoCapture::from_file(
                path.to_str().unwrap_or_default(),
                videoio::CAP_ANY,
            )?;
            if !cap.is_opened()? {
                anyhow::bail!("VideoCapture cannot open: {}", path.display());
            }

            let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
            let frames =
                VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i64;
            info!(
                "Opened {}: {:.1} FPS, {} frames",
                path.display(),
                fps,
                frames
            );

            Ok(Self {
                cap,
                fps,
                frames,
                next_index: 0,
            })
        }

        fn read_gray(&mut self) -> Option<GrayImage> {
            let mut mat = Mat::default();
            let ok = VideoCaptureTrait::read(&mut self.cap, &mut mat).ok()?;
            if !ok || mat.empty() {
                return None;
            }
            let mut gray = Mat::default();
            imgproc::cvt_color(&mat, &mut gray, imgproc::COLOR_BGR2GRAY, 0).ok()?;
            let data = gray.data_bytes().ok()?.to_vec();
            GrayImage::from_raw(gray.cols() as u32, gray.rows() as u32, data)
        }
    }

    impl FrameSource for VideoFileSource {
        fn frame_rate(&self) -> f64 {
            self.fps
        }

        fn frame_count(&self) -> i64 {
            self.frames
        }

        fn read_next(&mut self) -> Option<Frame> {
            let image = self.read_gray()?;
            let index = self.next_index;
            self.next_index += 1;
            Some(Frame { index, image })
        }

        fn read_at(&mut self, index: i64) -> Option<Frame> {
            // Back up the sequential position, seek, read, restore. Restore
            // must happen on the failure paths too.
            let backup =
                VideoCaptureTraitConst::get(&self.cap, videoio::CAP_PROP_POS_FRAMES).ok()?;
            let _ = VideoCaptureTrait::set(
                &mut self.cap,
                videoio::CAP_PROP_POS_FRAMES,
                index as f64,
            );
            let image = self.read_gray();
            let _ = VideoCaptureTrait::set(&mut self.cap, videoio::CAP_PROP_POS_FRAMES, backup);
            Some(Frame {
                index,
                image: image?,
            })
        }
    }
}
