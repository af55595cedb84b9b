//! # BIDS physio conversion for Rust
//!
//! Matches the physiological recordings of an MRI session (cardiac,
//! respiratory, eye tracking, scanner triggers) to the functional runs they
//! were recorded with, and writes them as BIDS `_physio.tsv.gz` /
//! `_physio.json` pairs next to the imaging data.
//!
//! Decoding a vendor format is the job of a [`DeviceAdapter`]; this crate
//! takes care of everything after that.
//!
//! ## Quick Start
//!
//! ```rust
//! use bidsphysio::{
//!     AdapterSet, Channel, ChannelSet, DeviceAdapter, PhysioError, Result, SessionDriver,
//! };
//! use bidsphysio::doctest_utils::{create_bids_session, RunSpec};
//! use chrono::{NaiveDate, NaiveDateTime};
//! use std::path::Path;
//!
//! /// First line: start time; then one cardiac sample per line at 10 Hz.
//! struct TextAdapter;
//!
//! impl DeviceAdapter for TextAdapter {
//!     fn name(&self) -> &str { "text" }
//!
//!     fn extensions(&self) -> &[&str] { &["txt"] }
//!
//!     fn parse(&self, path: &Path) -> Result<ChannelSet> {
//!         let text = std::fs::read_to_string(path)?;
//!         let mut lines = text.lines();
//!         let start = lines.next()
//!             .and_then(|l| NaiveDateTime::parse_from_str(l, "%Y-%m-%dT%H:%M:%S").ok())
//!             .ok_or_else(|| PhysioError::parse(path, "missing start time"))?;
//!         let samples = lines.filter_map(|l| l.parse().ok()).collect();
//!         ChannelSet::new(start, vec![Channel::new("cardiac", 10.0, samples)], path)
//!     }
//! }
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! # let bids = tempfile::tempdir()?;
//! # let input = tempfile::tempdir()?;
//! let t = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(10, 0, 0).unwrap();
//! create_bids_session(bids.path(), "01", None, &[RunSpec::new("rest", None, t, 5, 2.0)])?;
//!
//! let mut recording = String::from("2024-05-06T09:59:58\n");
//! for i in 0..150 {
//!     recording.push_str(&format!("{}\n", i));
//! }
//! std::fs::write(input.path().join("run1.txt"), recording)?;
//!
//! let driver = SessionDriver::new(AdapterSet::new().with(TextAdapter));
//! let report = driver.convert(input.path(), bids.path(), "01", None)?;
//!
//! assert_eq!(report.matched_count(), 1);
//! assert!(report.is_complete());
//! assert!(bids.path().join("sub-01/func/sub-01_task-rest_physio.tsv.gz").exists());
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! * [`BidsCatalog`] lists the functional runs of a subject/session with
//!   their start time and duration ([`ScanEntry`])
//! * [`AdapterSet`] turns input files into [`ChannelSet`]s
//! * [`match_session`] pairs recordings with scans and trims each
//!   recording to its scan
//! * [`PhysioWriter`] writes the BIDS files, plus an `_events` pair when a
//!   recording carries an [`EventTable`]
//! * [`SessionDriver`] runs all of the above and returns a [`SessionReport`]
//!
//! Only a catalog failure aborts a session. Unparsable inputs, unmatched
//! recordings and write conflicts are entries of the report.

pub mod error;
pub mod types;
pub mod events;
pub mod utils;
pub mod config;
pub mod reader;
pub mod catalog;
pub mod adapter;
pub mod matcher;
pub mod writer;
pub mod archive;
pub mod session;

#[doc(hidden)]
pub mod doctest_utils; // For internal doctest support

// Re-export main types for convenience
pub use error::{PhysioError, Result};
pub use types::{BidsEntities, Channel, ChannelSet, MatchResult, ScanEntry, UnmatchedReason};
pub use events::{EventColumn, EventTable, EventValues};
pub use config::{CandidacyMode, CatalogOptions, MatchConfig, SessionConfig, WriterOptions};
pub use catalog::{BidsCatalog, ScanSource};
pub use adapter::{AdapterSet, DeviceAdapter};
pub use matcher::{estimate_clock_offset, match_session};
pub use writer::{PhysioWriter, RecordingGroup};
pub use session::{SessionDriver, SessionReport, WriteOutcome};

/// Library version
///
/// Returns the current version of the bidsphysio library.
///
/// # Examples
///
/// ```rust
/// let version = bidsphysio::version();
/// assert!(!version.is_empty());
/// assert!(version.contains('.'));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
