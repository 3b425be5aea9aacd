// src/ocr/engine.rs

use image::GrayImage;

/// Recognition strategy requested per call.
///
/// `Primary` runs the engine as configured; `SegmentationSweep` retries the
/// same region across alternate page-segmentation variants and is the
/// orchestrator's fallback when the primary pass returns nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    Primary,
    SegmentationSweep,
}

/// Opaque text-recognition capability: a prepared (binarized, upscaled)
/// image region in, at most one best-guess token out.
///
/// Engine tuning (character whitelist, DPI hint, segmentation variants) is
/// construction-time configuration, not a per-call concern.
pub trait TextRecognizer {
    fn recognize_best_token(&mut self, region: &GrayImage, mode: RecognitionMode)
        -> Option<String>;
}

#[cfg(feature = "ocr-tesseract")]
pub use tesseract::TesseractEngine;

#[cfg(feature = "ocr-tesseract")]
mod tesseract {
    use super::{RecognitionMode, TextRecognizer};
    use crate::types::OcrConfig;
    use anyhow::{Context, Result};
    use image::GrayImage;
    use leptess::{LepTess, Variable};
    use std::io::Cursor;
    use std::path::Path;
    use tracing::{debug, info};

    /// Page-segmentation sweeps: word -> line (-> block -> raw line in audit
    /// mode).
    const SWEEP_FAST: &[i32] = &[8, 7];
    const SWEEP_AUDIT: &[i32] = &[8, 7, 6, 13];

    /// Tesseract-backed recognizer (leptess).
    pub struct TesseractEngine {
        lt: LepTess,
        base_psm: i32,
        audit: bool,
    }

    impl TesseractEngine {
        pub fn new(cfg: &OcrConfig) -> Result<Self> {
            let datapath = if cfg.datapath.is_empty() {
                std::env::var("TESSDATA_PREFIX").unwrap_or_default()
            } else {
                cfg.datapath.clone()
            };
            if !Path::new(&datapath).is_dir() {
                anyhow::bail!("tessdata directory not found: {datapath}");
            }

            let mut lt = LepTess::new(Some(datapath.as_str()), &cfg.languages)
                .with_context(|| format!("tesseract init failed for {datapath}"))?;
            if !cfg.whitelist.is_empty() {
                lt.set_variable(Variable::TesseditCharWhitelist, &cfg.whitelist)?;
            }
            // Narrow alphabet, no dictionaries, fixed DPI for stability.
            lt.set_variable(Variable::LoadSystemDawg, "F")?;
            lt.set_variable(Variable::LoadFreqDawg, "F")?;
            lt.set_variable(Variable::UserDefinedDpi, "300")?;
            lt.set_variable(Variable::PreserveInterwordSpaces, "1")?;
            lt.set_variable(Variable::TesseditPagesegMode, &cfg.psm.to_string())?;

            info!(
                "OCR: init datapath={} languages={} psm={} mode={}",
                datapath,
                cfg.languages,
                cfg.psm,
                if cfg.audit_mode { "audit" } else { "fast" }
            );
            Ok(Self {
                lt,
                base_psm: cfg.psm,
                audit: cfg.audit_mode,
            })
        }

        fn set_psm(&mut self, psm: i32) {
            let _ = self
                .lt
                .set_variable(Variable::TesseditPagesegMode, &psm.to_string());
        }

        fn ocr_once(&mut self, png: &[u8]) -> Option<String> {
            self.lt.set_image_from_mem(png).ok()?;
            self.lt.set_source_resolution(300);
            let text = self.lt.get_utf8_text().ok()?;
            best_token(&text)
        }
    }

    impl TextRecognizer for TesseractEngine {
        fn recognize_best_token(
            &mut self,
            region: &GrayImage,
            mode: RecognitionMode,
        ) -> Option<String> {
            let png = encode_png(region)?;
            match mode {
                RecognitionMode::Primary => {
                    self.set_psm(self.base_psm);
                    self.ocr_once(&png)
                }
                RecognitionMode::SegmentationSweep => {
                    let sweep = if self.audit { SWEEP_AUDIT } else { SWEEP_FAST };
                    let mut found = None;
                    for &psm in sweep {
                        self.set_psm(psm);
                        if let Some(token) = self.ocr_once(&png) {
                            debug!("OCR sweep hit at psm={psm}: {token}");
                            found = Some(token);
                            break;
                        }
                    }
                    self.set_psm(self.base_psm);
                    found
                }
            }
        }
    }

    fn encode_png(img: &GrayImage) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageLuma8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .ok()?;
        Some(buf)
    }

    /// Longest alphanumeric token of plausible plate length. Word-level
    /// confidences are not exposed here, so token length stands in for them.
    fn best_token(text: &str) -> Option<String> {
        text.split_whitespace()
            .map(|t| {
                t.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
            })
            .filter(|t| (3..=10).contains(&t.chars().count()))
            .max_by_key(|t| t.chars().count())
    }
}
