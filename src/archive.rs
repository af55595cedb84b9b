//! Reproducible `sourcedata/` archives of converted input files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{PhysioError, Result};
use crate::types::ScanEntry;

/// Where the archive of `source` goes:
/// `<output_root>/sourcedata/<scan dir>/<prefix>_physio.<ext>.tgz`.
pub fn archive_path(output_root: &Path, scan: &ScanEntry, source: &Path) -> PathBuf {
    let name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_physio.{}.tgz", scan.prefix, ext),
        None => format!("{}_physio.tgz", scan.prefix),
    };
    output_root.join("sourcedata").join(&scan.relative_dir).join(name)
}

/// Stores a recording's source file as a single-entry `.tgz`.
///
/// The tar entry's mtime is `recorded_at`, the start of the recording as
/// parsed (before any trimming or clock correction). The gzip header carries
/// no timestamp, so archiving the same file twice gives identical bytes.
///
/// # Errors
///
/// * `PhysioError::FileExists` - the archive exists and `overwrite` is off
/// * `PhysioError::Write` - the source can't be read or the archive written
pub fn archive_source(
    output_root: &Path,
    scan: &ScanEntry,
    source: &Path,
    recorded_at: NaiveDateTime,
    overwrite: bool,
) -> Result<PathBuf> {
    let target = archive_path(output_root, scan, source);
    if target.exists() && !overwrite {
        return Err(PhysioError::FileExists(target.display().to_string()));
    }

    let entry_name = source.file_name().ok_or_else(|| {
        PhysioError::write(&target, format!("source {} has no file name", source.display()))
    })?;

    let mtime = recorded_at.and_utc().timestamp().max(0) as u64;

    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut input = File::open(source)?;
        let size = input.metadata()?.len();

        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();

        let file = BufWriter::new(File::create(&target)?);
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_data(&mut header, entry_name, &mut input)?;
        builder.into_inner()?.finish()?.flush()
    })();

    result.map_err(|e| PhysioError::write(&target, e.to_string()))?;
    log::debug!("Archived {} to {}", source.display(), target.display());
    Ok(target)
}
