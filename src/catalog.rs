//! Scan catalog: the functional runs of one subject/session and their timing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde_json::{Map, Value};

use crate::config::CatalogOptions;
use crate::error::{PhysioError, Result};
use crate::reader::{read_scans_tsv, read_sidecar, NiftiHeader};
use crate::types::{BidsEntities, ScanEntry};
use crate::utils::{
    default_reference_date, parse_datetime, parse_time_of_day, remove_echo_entity,
    strip_bids_suffix,
};

/// Anything that can list the functional runs of a session.
///
/// [`BidsCatalog`] reads them from a BIDS dataset on disk; tests and callers
/// with their own bookkeeping can provide entries directly.
pub trait ScanSource {
    /// Returns the runs sorted by start time.
    ///
    /// # Errors
    ///
    /// * `PhysioError::Catalog` - the subject/session does not exist or has
    ///   no usable functional run
    fn scan_entries(&self, subject: &str, session: Option<&str>) -> Result<Vec<ScanEntry>>;
}

impl ScanSource for Vec<ScanEntry> {
    fn scan_entries(&self, _subject: &str, _session: Option<&str>) -> Result<Vec<ScanEntry>> {
        if self.is_empty() {
            return Err(PhysioError::Catalog("no functional runs".to_string()));
        }
        let mut entries = self.clone();
        entries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.prefix.cmp(&b.prefix)));
        Ok(entries)
    }
}

/// Scan catalog backed by a BIDS dataset directory.
///
/// # Examples
///
/// ```rust
/// use bidsphysio::{BidsCatalog, ScanSource};
/// use bidsphysio::doctest_utils::{create_bids_session, RunSpec};
/// use chrono::NaiveDate;
///
/// let root = tempfile::tempdir()?;
/// let t = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(10, 0, 0).unwrap();
/// create_bids_session(root.path(), "01", Some("pre"), &[
///     RunSpec::new("rest", Some(1), t, 150, 2.0),
/// ])?;
///
/// let catalog = BidsCatalog::new(root.path());
/// let scans = catalog.scan_entries("01", Some("pre"))?;
/// assert_eq!(scans.len(), 1);
/// assert_eq!(scans[0].prefix, "sub-01_ses-pre_task-rest_run-1");
/// assert_eq!(scans[0].duration, 300.0);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct BidsCatalog {
    root: PathBuf,
    options: CatalogOptions,
}

impl BidsCatalog {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_options(root, CatalogOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(root: P, options: CatalogOptions) -> Self {
        BidsCatalog {
            root: root.as_ref().to_path_buf(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Times one `*_bold.nii[.gz]` file. Returns `Ok(None)` when the run
    /// lacks the metadata needed to place it in time.
    fn scan_entry(
        &self,
        nii_path: &Path,
        relative_dir: &Path,
        scans_times: &HashMap<String, NaiveDateTime>,
    ) -> Result<Option<ScanEntry>> {
        let file_name = match nii_path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => return Ok(None),
        };
        let stem = strip_bids_suffix(file_name);
        let entities = match BidsEntities::from_filename(file_name) {
            Some(e) => e,
            None => {
                log::warn!("Skipping {}: no subject entity in filename", nii_path.display());
                return Ok(None);
            }
        };

        let sidecar = read_sidecar(nii_path.with_file_name(format!("{}_bold.json", stem)))?;
        let header = NiftiHeader::open(nii_path)?;

        let tr = match number_field(&sidecar, "RepetitionTime")
            .or_else(|| self.inherited_repetition_time(&entities))
            .or_else(|| header.repetition_time())
        {
            Some(tr) => tr,
            None => {
                log::warn!("Skipping {}: no RepetitionTime", nii_path.display());
                return Ok(None);
            }
        };
        let duration = header.volume_count() as f64 * tr;

        // 开始时间优先级：AcquisitionDateTime > scans.tsv > AcquisitionTime
        let scans_key = format!("func/{}", file_name);
        let start = string_field(&sidecar, "AcquisitionDateTime")
            .and_then(parse_datetime)
            .or_else(|| scans_times.get(&scans_key).copied())
            .or_else(|| {
                string_field(&sidecar, "AcquisitionTime")
                    .and_then(parse_time_of_day)
                    .map(|t| {
                        self.options
                            .reference_date
                            .unwrap_or_else(default_reference_date)
                            .and_time(t)
                    })
            });
        let start = match start {
            Some(s) => s,
            None => {
                log::warn!("Skipping {}: no acquisition time", nii_path.display());
                return Ok(None);
            }
        };

        Ok(Some(ScanEntry {
            entities,
            start,
            duration,
            relative_dir: relative_dir.to_path_buf(),
            prefix: stem.to_string(),
        }))
    }

    /// `RepetitionTime` from `task-<label>_bold.json` at the dataset root
    /// or subject level (BIDS inheritance).
    fn inherited_repetition_time(&self, entities: &BidsEntities) -> Option<f64> {
        let task = entities.task.as_ref()?;
        let candidates = [
            self.root
                .join(format!("sub-{}", entities.subject))
                .join(format!("sub-{}_task-{}_bold.json", entities.subject, task)),
            self.root.join(format!("task-{}_bold.json", task)),
        ];
        candidates
            .iter()
            .filter_map(|p| read_sidecar(p).ok())
            .find_map(|map| number_field(&map, "RepetitionTime"))
    }
}

impl ScanSource for BidsCatalog {
    fn scan_entries(&self, subject: &str, session: Option<&str>) -> Result<Vec<ScanEntry>> {
        let subject = subject.trim_start_matches("sub-");
        let session = session.map(|s| s.trim_start_matches("ses-"));

        let mut relative_dir = PathBuf::from(format!("sub-{}", subject));
        let mut scans_name = format!("sub-{}", subject);
        if let Some(ses) = session {
            relative_dir.push(format!("ses-{}", ses));
            scans_name = format!("{}_ses-{}", scans_name, ses);
        }

        let session_dir = self.root.join(&relative_dir);
        if !session_dir.is_dir() {
            return Err(PhysioError::Catalog(format!("{} not found", session_dir.display())));
        }
        let func_dir = session_dir.join("func");
        if !func_dir.is_dir() {
            return Err(PhysioError::Catalog(format!(
                "no functional runs: {} not found",
                func_dir.display()
            )));
        }
        relative_dir.push("func");

        let scans_tsv = session_dir.join(format!("{}_scans.tsv", scans_name));
        let scans_times = if scans_tsv.exists() {
            read_scans_tsv(&scans_tsv).unwrap_or_else(|e| {
                log::warn!("Ignoring {}: {}", scans_tsv.display(), e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        let mut bold_files: Vec<PathBuf> = fs::read_dir(&func_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.ends_with("_bold.nii") || n.ends_with("_bold.nii.gz"))
            })
            .collect();
        bold_files.sort();

        let mut entries = Vec::new();
        for path in &bold_files {
            match self.scan_entry(path, &relative_dir, &scans_times) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
            }
        }

        let entries = collapse_echoes(entries);
        if entries.is_empty() {
            return Err(PhysioError::Catalog(format!(
                "no usable functional runs in {}",
                func_dir.display()
            )));
        }

        log::info!("Found {} functional runs in {}", entries.len(), func_dir.display());
        Ok(entries)
    }
}

/// Multi-echo runs become a single entry: the earliest start among the
/// echoes, with the `echo-` entity dropped from the prefix. Runs left with
/// exactly the same start (other multi-contrast images of one acquisition)
/// are kept once, the first by prefix. Output is sorted by start.
fn collapse_echoes(entries: Vec<ScanEntry>) -> Vec<ScanEntry> {
    let mut by_prefix: Vec<ScanEntry> = Vec::new();

    for mut entry in entries {
        if entry.entities.echo.is_some() {
            entry.prefix = remove_echo_entity(&entry.prefix);
            entry.entities.echo = None;
        }
        match by_prefix.iter_mut().find(|e| e.prefix == entry.prefix) {
            Some(existing) => {
                if entry.start < existing.start {
                    *existing = entry;
                }
            }
            None => by_prefix.push(entry),
        }
    }

    by_prefix.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.prefix.cmp(&b.prefix)));
    by_prefix.dedup_by(|later, kept| {
        let duplicate = later.start == kept.start;
        if duplicate {
            log::debug!("{} has the same start as {}; dropped", later.prefix, kept.prefix);
        }
        duplicate
    });
    by_prefix
}

fn number_field(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64).filter(|v| v.is_finite() && *v > 0.0)
}

fn string_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}
