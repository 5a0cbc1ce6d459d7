//! Output directory handling and still-photo output.
//!
//! All artifacts land in one user-chosen directory as
//! `<prefix>_<YYYYMMDD_HHMMSS>.<ext>`. Timestamps are second-granular, so
//! two captures inside the same wall-clock second collide; acceptable for a
//! single-operator tool and documented as such.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::camera::Frame;

/// Scratch file name used for the writability probe.
const PROBE_FILE: &str = ".redisca_write_test";

/// Check that `dir` is a directory we can actually write to by creating and
/// deleting a scratch file in it.
///
/// # Errors
/// The underlying I/O error if `dir` is missing, not a directory, or not
/// writable.
pub fn validate_writable(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("'{}' is not a directory", dir.display()),
        ));
    }
    let probe = dir.join(PROBE_FILE);
    {
        let mut file = fs::File::create(&probe)?;
        file.write_all(b"test")?;
    }
    fs::remove_file(&probe)?;
    Ok(())
}

/// Build `<dir>/<prefix>_<timestamp>.<ext>` stamped with the current local
/// time at second granularity.
pub fn timestamped_path(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}.{}", prefix, stamp, ext))
}

/// Write a frame as a compressed still image; the format follows the path's
/// extension (`.jpg` in normal operation).
///
/// # Errors
/// Fails on a malformed frame buffer or on encoder/file errors.
pub fn save_photo(frame: &Frame, path: &Path) -> io::Result<()> {
    let image: image::RgbImage =
        image::ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(
            || io::Error::new(io::ErrorKind::InvalidInput, "frame buffer size mismatch"),
        )?;
    image
        .save(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}
