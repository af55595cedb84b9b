//! Session configuration.
//!
//! Every struct here has a `Default` matching the behavior of the command
//! line tools, and public fields so you can override single values with
//! struct-update syntax:
//!
//! ```
//! use bidsphysio::{MatchConfig, SessionConfig};
//!
//! let cfg = SessionConfig {
//!     matching: MatchConfig {
//!         tolerance_secs: 10.0,   // scanner and physio clocks drift a lot here
//!         ..MatchConfig::default()
//!     },
//!     ..SessionConfig::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PhysioError, Result};

/// How a recording becomes a candidate for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidacyMode {
    /// Compare the recording span with the scan interval.
    Overlap,
    /// Ignore timestamps: the Nth recording goes with the Nth scan.
    Positional,
}

/// Parameters of the session matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Default: [`CandidacyMode::Overlap`].
    pub mode: CandidacyMode,

    /// Slack, in seconds, allowed on both the scan start and the scan end
    /// when deciding whether a recording covers a scan.
    ///
    /// Device clocks are not synchronized to the scanner clock, so a
    /// recording that starts up to this many seconds after the first volume,
    /// or stops up to this many seconds before the last one, still counts.
    ///
    /// Default: `5.0` s.
    pub tolerance_secs: f64,

    /// Minimum fraction of the scan duration that must be overlapped.
    ///
    /// `None` selects the covering rule described for `tolerance_secs`.
    /// `Some(f)` replaces it: any recording overlapping at least
    /// `f × duration` seconds of the scan is a candidate.
    ///
    /// Default: `None`.
    pub min_overlap_fraction: Option<f64>,

    /// Estimate a constant offset between the physio and scanner clocks
    /// before scoring overlaps. Needs at least two recordings.
    ///
    /// Default: `false`.
    pub estimate_clock_offset: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            mode: CandidacyMode::Overlap,
            tolerance_secs: 5.0,
            min_overlap_fraction: None,
            estimate_clock_offset: false,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance_secs.is_finite() && self.tolerance_secs >= 0.0) {
            return Err(PhysioError::InvalidConfig(format!(
                "tolerance_secs must be a non-negative number, got {}",
                self.tolerance_secs
            )));
        }
        if let Some(f) = self.min_overlap_fraction {
            if !(f > 0.0 && f <= 1.0) {
                return Err(PhysioError::InvalidConfig(format!(
                    "min_overlap_fraction must be in (0, 1], got {}",
                    f
                )));
            }
        }
        Ok(())
    }
}

/// Options of the BIDS physio writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Replace existing `_physio` files instead of failing.
    ///
    /// Default: `false`.
    pub overwrite: bool,

    /// Add a `trigger` column to every recording group whose timing differs
    /// from the trigger channel's.
    ///
    /// Default: `true`.
    pub embed_trigger: bool,

    /// Decimal places for non-trigger columns.
    ///
    /// Default: `4`.
    pub decimals: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            embed_trigger: true,
            decimals: 4,
        }
    }
}

/// Options of the scan catalog builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogOptions {
    /// Date attached to `AcquisitionTime` values that carry no date.
    ///
    /// Only needed when physio timestamps carry real dates but the imaging
    /// sidecars do not. Default: `None` (1970-01-01).
    pub reference_date: Option<NaiveDate>,
}

/// Everything the session driver needs besides the input paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub matching: MatchConfig,
    pub writer: WriterOptions,
    pub catalog: CatalogOptions,

    /// Force a candidacy mode. `None` lets the driver decide from the
    /// adapters: positional as soon as one recording comes from an adapter
    /// whose clock is not trusted, overlap otherwise.
    pub mode_override: Option<CandidacyMode>,

    /// Keep a reproducible `.tgz` of every converted source file under
    /// `sourcedata/`.
    pub archive_sources: bool,

    /// Where to write the physio files. Default: the BIDS dataset root.
    pub output_root: Option<PathBuf>,
}

impl SessionConfig {
    /// Loads a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        if self.writer.decimals > 17 {
            return Err(PhysioError::InvalidConfig(format!(
                "decimals must be at most 17, got {}",
                self.writer.decimals
            )));
        }
        Ok(())
    }
}
