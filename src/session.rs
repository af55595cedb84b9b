//! Session driver: catalog, adapters, matcher and writer for one session.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::adapter::AdapterSet;
use crate::archive::archive_source;
use crate::catalog::{BidsCatalog, ScanSource};
use crate::config::{CandidacyMode, MatchConfig, SessionConfig};
use crate::error::{PhysioError, Result};
use crate::matcher::match_session;
use crate::types::{ChannelSet, MatchResult, UnmatchedReason};
use crate::writer::PhysioWriter;

/// What happened to a matched pair when it was written out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WriteOutcome {
    Written(Vec<PathBuf>),
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedEntry {
    pub scan_prefix: String,
    pub source: PathBuf,
    pub outcome: WriteOutcome,
    /// `sourcedata/` archive, when archiving is on and succeeded.
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedPhysioEntry {
    pub source: PathBuf,
    pub reason: UnmatchedReason,
}

/// An input file that produced no recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub message: String,
}

/// Summary of one converted session.
///
/// Every input file ends up in exactly one of `matched`, `unmatched_physio`
/// or `skipped`; every catalog scan in exactly one of `matched` or
/// `unmatched_scans`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub subject: String,
    pub session: Option<String>,
    pub mode: CandidacyMode,
    /// Files looked at in the input folder.
    pub input_files: usize,
    /// Scans in the catalog.
    pub catalog_size: usize,
    pub matched: Vec<MatchedEntry>,
    pub unmatched_physio: Vec<UnmatchedPhysioEntry>,
    pub unmatched_scans: Vec<String>,
    pub skipped: Vec<SkippedFile>,
}

impl SessionReport {
    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }

    pub fn unmatched_physio_count(&self) -> usize {
        self.unmatched_physio.len()
    }

    pub fn unmatched_scan_count(&self) -> usize {
        self.unmatched_scans.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Matched pairs whose files were all written.
    pub fn written_count(&self) -> usize {
        self.matched
            .iter()
            .filter(|m| matches!(m.outcome, WriteOutcome::Written(_)))
            .count()
    }

    /// Whether the report accounts for every input file and every scan
    /// exactly once.
    pub fn is_complete(&self) -> bool {
        self.matched.len() + self.unmatched_physio.len() + self.skipped.len() == self.input_files
            && self.matched.len() + self.unmatched_scans.len() == self.catalog_size
    }
}

/// Converts the physio recordings of one imaging session.
///
/// # Pipeline
///
/// 1. List the session's scans (a failure here aborts the session)
/// 2. Parse every file of the input folder with the first adapter that
///    accepts it; unsupported or unparsable files are reported as skipped
/// 3. Match recordings to scans
/// 4. Write every match, optionally archiving its source under `sourcedata/`
///
/// # Examples
///
/// ```rust
/// use bidsphysio::{AdapterSet, SessionDriver};
/// use bidsphysio::doctest_utils::{create_bids_session, RunSpec};
/// use chrono::NaiveDate;
///
/// # let root = tempfile::tempdir()?;
/// # let input = tempfile::tempdir()?;
/// let t = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(10, 0, 0).unwrap();
/// create_bids_session(root.path(), "01", None, &[
///     RunSpec::new("rest", None, t, 100, 2.0),
/// ])?;
///
/// // No adapters registered: the stray file is reported, not fatal
/// std::fs::write(input.path().join("notes.txt"), "hello")?;
///
/// let driver = SessionDriver::new(AdapterSet::new());
/// let report = driver.convert(input.path(), root.path(), "01", None)?;
///
/// assert_eq!(report.matched_count(), 0);
/// assert_eq!(report.unmatched_scans, vec!["sub-01_task-rest".to_string()]);
/// assert_eq!(report.skipped_count(), 1);
/// assert!(report.is_complete());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SessionDriver {
    adapters: AdapterSet,
    config: SessionConfig,
}

impl SessionDriver {
    pub fn new(adapters: AdapterSet) -> Self {
        Self::with_config(adapters, SessionConfig::default())
    }

    pub fn with_config(adapters: AdapterSet, config: SessionConfig) -> Self {
        SessionDriver { adapters, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Converts `input_dir` against the BIDS dataset at `bids_root`.
    ///
    /// Output goes to `config.output_root`, or into the dataset itself.
    pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_dir: P,
        bids_root: Q,
        subject: &str,
        session: Option<&str>,
    ) -> Result<SessionReport> {
        let bids_root = bids_root.as_ref();
        let catalog = BidsCatalog::with_options(bids_root, self.config.catalog.clone());
        let output_root = self
            .config
            .output_root
            .clone()
            .unwrap_or_else(|| bids_root.to_path_buf());
        self.run(input_dir.as_ref(), &catalog, subject, session, &output_root)
    }

    /// Runs the pipeline with an arbitrary scan source.
    ///
    /// # Errors
    ///
    /// * `PhysioError::Catalog` - the scan source failed; nothing was written
    /// * `PhysioError::InvalidConfig` - the session configuration is invalid
    /// * `PhysioError::Io` - the input folder can't be listed
    ///
    /// Per-file failures never surface here; they are in the report.
    pub fn run(
        &self,
        input_dir: &Path,
        scans: &dyn ScanSource,
        subject: &str,
        session: Option<&str>,
        output_root: &Path,
    ) -> Result<SessionReport> {
        self.config.validate()?;

        let catalog = scans.scan_entries(subject, session).map_err(|e| {
            if e.is_session_fatal() {
                e
            } else {
                PhysioError::Catalog(e.to_string())
            }
        })?;
        log::info!("sub-{}: {} scans in catalog", subject, catalog.len());

        let inputs = list_input_files(input_dir)?;
        let mut recordings: Vec<ChannelSet> = Vec::new();
        let mut skipped = Vec::new();
        let mut untrusted_clock = false;

        for path in &inputs {
            let adapter = match self.adapters.find(path) {
                Some(a) => a,
                None => {
                    log::warn!("Skipping {}: unsupported file type", path.display());
                    skipped.push(SkippedFile {
                        path: path.clone(),
                        message: "unsupported file type".to_string(),
                    });
                    continue;
                }
            };
            match adapter.parse(path) {
                Ok(channels) => {
                    log::debug!(
                        "{}: parsed {} with {} channels",
                        adapter.name(),
                        path.display(),
                        channels.channels().len()
                    );
                    // 事件读取失败不影响生理信号
                    let channels = match adapter.parse_events(path) {
                        Ok(Some(events)) => channels.with_events(events),
                        Ok(None) => channels,
                        Err(e) => {
                            log::warn!("Ignoring events of {}: {}", path.display(), e);
                            channels
                        }
                    };
                    untrusted_clock |= !adapter.clock_trusted();
                    recordings.push(channels);
                }
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    skipped.push(SkippedFile {
                        path: path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mode = match self.config.mode_override {
            Some(mode) => mode,
            None if untrusted_clock => CandidacyMode::Positional,
            None => self.config.matching.mode,
        };
        let match_config = MatchConfig {
            mode,
            ..self.config.matching.clone()
        };

        let writer = PhysioWriter::with_options(output_root, self.config.writer.clone());
        let mut report = SessionReport {
            subject: subject.to_string(),
            session: session.map(str::to_string),
            mode,
            input_files: inputs.len(),
            catalog_size: catalog.len(),
            matched: Vec::new(),
            unmatched_physio: Vec::new(),
            unmatched_scans: Vec::new(),
            skipped,
        };

        for result in match_session(&recordings, &catalog, &match_config) {
            match result {
                MatchResult::Matched { scan, channels } => {
                    let mut archive = None;
                    let outcome = match writer.write(&scan, &channels) {
                        Ok(paths) => {
                            log::info!(
                                "{} -> {} ({} files)",
                                channels.source().display(),
                                scan.prefix,
                                paths.len()
                            );
                            if self.config.archive_sources {
                                // tar 的 mtime 用原始记录的开始时间
                                let recorded_at = recordings
                                    .iter()
                                    .find(|r| r.source() == channels.source())
                                    .map_or(channels.start(), ChannelSet::start);
                                match archive_source(
                                    output_root,
                                    &scan,
                                    channels.source(),
                                    recorded_at,
                                    self.config.writer.overwrite,
                                ) {
                                    Ok(path) => {
                                        archive = Some(path);
                                        WriteOutcome::Written(paths)
                                    }
                                    Err(e) => {
                                        log::warn!(
                                            "Archiving {} failed: {}",
                                            channels.source().display(),
                                            e
                                        );
                                        WriteOutcome::WriteFailed(e.to_string())
                                    }
                                }
                            } else {
                                WriteOutcome::Written(paths)
                            }
                        }
                        Err(e) => {
                            log::warn!("Writing {} failed: {}", scan.prefix, e);
                            WriteOutcome::WriteFailed(e.to_string())
                        }
                    };
                    report.matched.push(MatchedEntry {
                        scan_prefix: scan.prefix,
                        source: channels.source().to_path_buf(),
                        outcome,
                        archive,
                    });
                }
                MatchResult::UnmatchedPhysio { channels, reason } => {
                    log::warn!("{} not matched: {}", channels.source().display(), reason);
                    report.unmatched_physio.push(UnmatchedPhysioEntry {
                        source: channels.source().to_path_buf(),
                        reason,
                    });
                }
                MatchResult::UnmatchedScan { scan } => {
                    log::info!("No physio for {}", scan.prefix);
                    report.unmatched_scans.push(scan.prefix);
                }
            }
        }

        log::info!(
            "sub-{}: {} matched, {} unmatched physio, {} unmatched scans, {} skipped",
            subject,
            report.matched_count(),
            report.unmatched_physio_count(),
            report.unmatched_scan_count(),
            report.skipped_count()
        );
        Ok(report)
    }
}

/// Regular, non-hidden files of `dir`, sorted by path.
///
/// Names that are not valid UTF-8 are kept, so they get reported as skipped
/// instead of disappearing.
fn list_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .map_or(false, |n| n.to_string_lossy().starts_with('.'));
        if !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
