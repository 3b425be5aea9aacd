// src/detection/trace.rs

use anyhow::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Per-run diagnostic table: one row per sampled frame. Consumed by humans
/// only; never required for correctness.
pub struct DetectorTrace {
    out: BufWriter<File>,
}

impl DetectorTrace {
    pub fn create(dir: &Path, stem: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("trace_{stem}.csv"));
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "ms,frame,ratio,ema,state,event")?;
        info!("trace enabled -> {}", path.display());
        Ok(Self { out })
    }

    pub fn row(&mut self, ms: i64, frame: i64, ratio: f64, ema: f64, state: &str, event: bool) {
        let _ = writeln!(
            self.out,
            "{ms},{frame},{ratio:.6},{ema:.6},{state},{}",
            event as u8
        );
    }
}

impl Drop for DetectorTrace {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = DetectorTrace::create(dir.path(), "clip").unwrap();
        trace.row(40, 1, 0.1, 0.05, "IDLE", false);
        trace.row(80, 2, 0.5, 0.41, "ACTIVE", true);
        drop(trace);

        let text = std::fs::read_to_string(dir.path().join("trace_clip.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ms,frame,ratio,ema,state,event");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("40,1,"));
        assert!(lines[2].ends_with(",ACTIVE,1"));
    }
}
