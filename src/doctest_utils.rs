// Internal utilities for documentation and integration tests
// Builds small synthetic BIDS datasets and recordings on disk

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use crate::{Channel, ChannelSet, Result};

/// One functional run to create with [`create_bids_session`].
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub task: String,
    /// `acq-` entity
    pub acq: Option<String>,
    pub run: Option<u32>,
    pub echo: Option<u32>,
    pub acq_time: NaiveDateTime,
    pub volumes: i16,
    pub tr: f64,
}

impl RunSpec {
    pub fn new(
        task: &str,
        run: Option<u32>,
        acq_time: NaiveDateTime,
        volumes: i16,
        tr: f64,
    ) -> Self {
        RunSpec {
            task: task.to_string(),
            acq: None,
            run,
            echo: None,
            acq_time,
            volumes,
            tr,
        }
    }
}

/// A minimal little-endian NIfTI-1 header (plus the 4-byte extension flag)
/// for a 64×64×30×`volumes` image with `pixdim[4] = tr` seconds.
pub fn nifti1_header(volumes: i16, tr: f64) -> Vec<u8> {
    let mut bytes = vec![0u8; 352];
    bytes[0..4].copy_from_slice(&348i32.to_le_bytes());

    let dims: [i16; 8] = [4, 64, 64, 30, volumes, 1, 1, 1];
    for (i, d) in dims.iter().enumerate() {
        bytes[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    let pixdims: [f32; 8] = [1.0, 3.0, 3.0, 3.0, tr as f32, 0.0, 0.0, 0.0];
    for (i, p) in pixdims.iter().enumerate() {
        bytes[76 + 4 * i..80 + 4 * i].copy_from_slice(&p.to_le_bytes());
    }
    // vox_offset, xyzt_units (mm + s), magic
    bytes[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    bytes[123] = 2 | 8;
    bytes[344..348].copy_from_slice(b"n+1\0");
    bytes
}

/// Creates `sub-<subject>[/ses-<session>]/func` with one gzipped NIfTI
/// header, one JSON sidecar (`RepetitionTime`, `AcquisitionTime`) per run
/// and a `_scans.tsv` carrying the full acquisition timestamps.
///
/// Returns the `func` directory.
pub fn create_bids_session<P: AsRef<Path>>(
    root: P,
    subject: &str,
    session: Option<&str>,
    runs: &[RunSpec],
) -> Result<PathBuf> {
    let mut session_dir = root.as_ref().join(format!("sub-{}", subject));
    let mut base = format!("sub-{}", subject);
    if let Some(ses) = session {
        session_dir = session_dir.join(format!("ses-{}", ses));
        base = format!("{}_ses-{}", base, ses);
    }
    let func_dir = session_dir.join("func");
    fs::create_dir_all(&func_dir)?;

    let mut scans_tsv = String::from("filename\tacq_time\n");
    for spec in runs {
        let mut name = format!("{}_task-{}", base, spec.task);
        if let Some(acq) = &spec.acq {
            name = format!("{}_acq-{}", name, acq);
        }
        if let Some(run) = spec.run {
            name = format!("{}_run-{}", name, run);
        }
        if let Some(echo) = spec.echo {
            name = format!("{}_echo-{}", name, echo);
        }

        let nii = func_dir.join(format!("{}_bold.nii.gz", name));
        let mut enc = GzEncoder::new(File::create(&nii)?, Compression::default());
        enc.write_all(&nifti1_header(spec.volumes, spec.tr))?;
        enc.finish()?;

        let sidecar = json!({
            "RepetitionTime": spec.tr,
            "AcquisitionTime": spec.acq_time.format("%H:%M:%S%.6f").to_string(),
        });
        fs::write(
            func_dir.join(format!("{}_bold.json", name)),
            serde_json::to_string_pretty(&sidecar)?,
        )?;

        scans_tsv.push_str(&format!(
            "func/{}_bold.nii.gz\t{}\n",
            name,
            spec.acq_time.format("%Y-%m-%dT%H:%M:%S%.6f")
        ));
    }
    fs::write(session_dir.join(format!("{}_scans.tsv", base)), scans_tsv)?;

    Ok(func_dir)
}

/// A single-channel recording of `span_secs` seconds of a ramp signal.
pub fn ramp_channel_set(
    start: NaiveDateTime,
    span_secs: f64,
    sampling_frequency: f64,
    label: &str,
    source: &str,
) -> Result<ChannelSet> {
    let n = (span_secs * sampling_frequency).round() as usize;
    let samples = (0..n).map(|i| i as f64 / sampling_frequency).collect();
    ChannelSet::new(start, vec![Channel::new(label, sampling_frequency, samples)], source)
}
