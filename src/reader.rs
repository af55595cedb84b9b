use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use serde_json::{Map, Value};

use crate::error::{PhysioError, Result};
use crate::utils::parse_datetime;

const NIFTI1_HEADER_SIZE: i32 = 348;
const NIFTI2_HEADER_SIZE: i32 = 540;

/// The parts of a NIfTI-1/NIfTI-2 header needed to time a functional run.
///
/// Only the header is read; the image data is never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// `dim[0..8]`: `dim[0]` is the number of dimensions in use.
    pub dims: [i64; 8],
    /// `pixdim[0..8]`: `pixdim[4]` is the volume spacing.
    pub pixdims: [f64; 8],
    /// Units of `pixdim[4]` per second (from `xyzt_units`); `None` if unknown.
    pub time_units_per_sec: Option<f64>,
}

impl NiftiHeader {
    /// Reads the header of a `.nii` or `.nii.gz` file.
    ///
    /// NIfTI-1 headers go through the `nifti` crate; NIfTI-2 headers, which
    /// it does not parse, are decoded here.
    ///
    /// # Errors
    ///
    /// * `PhysioError::Io` - the file can't be opened
    /// * `PhysioError::Parse` - the header is truncated or not NIfTI
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut stream = open_maybe_gz(path)?;

        let mut size_field = [0u8; 4];
        stream
            .read_exact(&mut size_field)
            .map_err(|e| PhysioError::parse(path, e.to_string()))?;

        let le_size = i32::from_le_bytes(size_field);
        let be_size = i32::from_be_bytes(size_field);
        let nifti2_endian = match (le_size, be_size) {
            (NIFTI2_HEADER_SIZE, _) => Some(true),
            (_, NIFTI2_HEADER_SIZE) => Some(false),
            _ => None,
        };

        match nifti2_endian {
            Some(little_endian) => {
                let mut header = vec![0u8; NIFTI2_HEADER_SIZE as usize];
                header[..4].copy_from_slice(&size_field);
                stream
                    .read_exact(&mut header[4..])
                    .map_err(|e| PhysioError::parse(path, e.to_string()))?;
                Ok(Self::from_nifti2(&header, little_endian))
            }
            None => {
                drop(stream);
                let header = nifti::NiftiHeader::from_file(path)
                    .map_err(|e| PhysioError::parse(path, format!("not a NIfTI header: {}", e)))?;
                if header.sizeof_hdr != NIFTI1_HEADER_SIZE {
                    return Err(PhysioError::parse(
                        path,
                        format!("not a NIfTI header (sizeof_hdr = {})", header.sizeof_hdr),
                    ));
                }

                let mut dims = [0i64; 8];
                let mut pixdims = [0f64; 8];
                for i in 0..8 {
                    dims[i] = header.dim[i] as i64;
                    pixdims[i] = header.pixdim[i] as f64;
                }
                Ok(NiftiHeader {
                    dims,
                    pixdims,
                    time_units_per_sec: time_units_per_sec(header.xyzt_units as i32),
                })
            }
        }
    }

    /// NIfTI-2: `dim` at byte 16 (8 × i64), `pixdim` at 104 (8 × f64),
    /// `xyzt_units` at 500 (i32).
    fn from_nifti2(bytes: &[u8], little_endian: bool) -> Self {
        let field = FieldReader { bytes, little_endian };
        let mut dims = [0i64; 8];
        let mut pixdims = [0f64; 8];
        for i in 0..8 {
            dims[i] = field.i64_at(16 + 8 * i);
            pixdims[i] = field.f64_at(104 + 8 * i);
        }
        NiftiHeader {
            dims,
            pixdims,
            time_units_per_sec: time_units_per_sec(field.i32_at(500)),
        }
    }

    /// Number of volumes in the run (1 for 3-D images).
    pub fn volume_count(&self) -> usize {
        if self.dims[0] >= 4 && self.dims[4] > 0 {
            self.dims[4] as usize
        } else {
            1
        }
    }

    /// Repetition time from `pixdim[4]`, in seconds, when the units are known.
    pub fn repetition_time(&self) -> Option<f64> {
        let tr = self.pixdims[4] / self.time_units_per_sec?;
        if tr.is_finite() && tr > 0.0 {
            Some(tr)
        } else {
            None
        }
    }
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

// xyzt_units 的时间位：8 = 秒, 16 = 毫秒, 24 = 微秒
fn time_units_per_sec(xyzt_units: i32) -> Option<f64> {
    match xyzt_units & 0x38 {
        8 => Some(1.0),
        16 => Some(1e3),
        24 => Some(1e6),
        _ => None,
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl FieldReader<'_> {
    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[offset..offset + N]);
        out
    }

    fn i32_at(&self, offset: usize) -> i32 {
        let b = self.array::<4>(offset);
        if self.little_endian {
            i32::from_le_bytes(b)
        } else {
            i32::from_be_bytes(b)
        }
    }

    fn i64_at(&self, offset: usize) -> i64 {
        let b = self.array::<8>(offset);
        if self.little_endian {
            i64::from_le_bytes(b)
        } else {
            i64::from_be_bytes(b)
        }
    }

    fn f64_at(&self, offset: usize) -> f64 {
        let b = self.array::<8>(offset);
        if self.little_endian {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        }
    }
}

/// Reads a JSON sidecar as a key/value map.
///
/// A missing file yields an empty map; a malformed one is an error.
pub fn read_sidecar<P: AsRef<Path>>(path: P) -> Result<Map<String, Value>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Map::new());
    }
    let text = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(PhysioError::parse(path, "sidecar is not a JSON object")),
    }
}

/// Reads the `filename` → `acq_time` columns of a BIDS `_scans.tsv`.
///
/// Rows whose `acq_time` is `n/a` or unparsable are left out.
pub fn read_scans_tsv<P: AsRef<Path>>(path: P) -> Result<HashMap<String, NaiveDateTime>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => line?,
        None => return Ok(HashMap::new()),
    };
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let (filename_col, time_col) = match (
        columns.iter().position(|c| *c == "filename"),
        columns.iter().position(|c| *c == "acq_time"),
    ) {
        (Some(f), Some(t)) => (f, t),
        _ => {
            return Err(PhysioError::parse(path, "missing 'filename' or 'acq_time' column"));
        }
    };

    let mut times = HashMap::new();
    for line in lines {
        let line = line?;
        let fields: Vec<&str> = line.split('\t').collect();
        if let (Some(name), Some(time)) = (fields.get(filename_col), fields.get(time_col)) {
            if let Some(t) = parse_datetime(time) {
                times.insert(name.trim().to_string(), t);
            }
        }
    }
    Ok(times)
}
