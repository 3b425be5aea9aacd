// src/ocr/mod.rs

mod engine;
mod normalize;
mod plate_reader;

// Re-export public APIs
pub use engine::{RecognitionMode, TextRecognizer};
pub use normalize::normalize_plate;
pub use plate_reader::PlateReader;

#[cfg(feature = "ocr-tesseract")]
pub use engine::TesseractEngine;
