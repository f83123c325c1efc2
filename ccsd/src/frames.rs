//! Frame spool for the data-reduction pipeline
//!
//! Frames read off the controller are spooled to disk and handed to the
//! pipeline by path. FITS keyword semantics live in the pipeline; this is
//! only the local sink.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use ccslib::CcsResult;
use log::debug;

use crate::hardware::FrameData;

/// Writes frames into the spool directory with sequential names
pub struct FrameWriter {
    dir: PathBuf,
    serial: AtomicU64,
}

impl FrameWriter {
    pub fn new(dir: &Path) -> CcsResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            serial: AtomicU64::new(1),
        })
    }

    /// Write one frame; returns the spooled path
    pub fn write(&self, frame: &FrameData) -> CcsResult<PathBuf> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("frame-{:06}.raw", serial));
        fs::write(&path, &frame.pixels)?;
        debug!(
            "spooled frame {} ({}x{}, {} ms)",
            path.display(),
            frame.width,
            frame.height,
            frame.exposure_ms
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccslib::{AmpSelect, Binning};

    fn test_frame() -> FrameData {
        FrameData {
            width: 4,
            height: 4,
            bin: Binning(1),
            amp: AmpSelect::Primary,
            exposure_ms: 100,
            pixels: vec![7u8; 16],
        }
    }

    #[test]
    fn test_sequential_spool_names() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FrameWriter::new(dir.path()).unwrap();

        let first = writer.write(&test_frame()).unwrap();
        let second = writer.write(&test_frame()).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap().len(), 16);
    }
}
