use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{PhysioError, Result};
use crate::events::EventTable;
use crate::utils::{add_seconds, seconds_between};

/// Tolerance, in units of samples, used when converting times to sample indices.
const SAMPLE_EPSILON: f64 = 1e-6;

/// One physiological signal (cardiac, respiratory, gaze, trigger, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub label: String,
    /// 物理单位，可为空
    pub units: String,
    /// 采样率（Hz）
    pub sampling_frequency: f64,
    /// 相对于所属 ChannelSet 开始时间的偏移（秒）
    pub offset: f64,
    pub samples: Vec<f64>,
    /// 每个样本的附加标志（例如眼动的有效性），长度与 samples 一致
    pub flags: Option<Vec<u8>>,
}

impl Channel {
    pub fn new(label: &str, sampling_frequency: f64, samples: Vec<f64>) -> Self {
        Channel {
            label: label.to_string(),
            units: String::new(),
            sampling_frequency,
            offset: 0.0,
            samples,
            flags: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_flags(mut self, flags: Vec<u8>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time covered by the samples, in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sampling_frequency
    }

    /// End of the covered span, relative to the ChannelSet start.
    pub fn end_offset(&self) -> f64 {
        self.offset + self.duration()
    }

    pub fn is_trigger(&self) -> bool {
        self.label.eq_ignore_ascii_case("trigger")
    }

    /// Two channels are co-recorded when they share frequency and start.
    pub fn is_co_recorded_with(&self, other: &Channel) -> bool {
        self.sampling_frequency == other.sampling_frequency
            && (self.offset - other.offset).abs() < 1e-9
    }

    /// Keeps the samples whose time falls in `[from, to)` (seconds relative
    /// to the ChannelSet start). The returned channel's offset is expressed
    /// relative to `from`.
    fn window(&self, from: f64, to: f64) -> Channel {
        let n = self.samples.len();
        let first = Self::index_at(from - self.offset, self.sampling_frequency, n);
        let end = Self::index_at(to - self.offset, self.sampling_frequency, n).max(first);

        Channel {
            label: self.label.clone(),
            units: self.units.clone(),
            sampling_frequency: self.sampling_frequency,
            offset: (self.offset + first as f64 / self.sampling_frequency - from).max(0.0),
            samples: self.samples[first..end].to_vec(),
            flags: self.flags.as_ref().map(|f| f[first..end].to_vec()),
        }
    }

    /// 第一个时间 >= t 的样本索引，限制在 [0, n] 范围内
    fn index_at(t: f64, sampling_frequency: f64, n: usize) -> usize {
        let idx = (t * sampling_frequency - SAMPLE_EPSILON).ceil();
        if idx <= 0.0 {
            0
        } else {
            (idx as usize).min(n)
        }
    }
}

/// One or more synchronized channels extracted from a single source file.
///
/// A `ChannelSet` is immutable once built: trimming produces a new value.
///
/// # Examples
///
/// ```rust
/// use bidsphysio::{Channel, ChannelSet};
/// use chrono::NaiveDate;
///
/// let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
///     .and_hms_opt(10, 0, 0).unwrap();
/// let set = ChannelSet::new(
///     start,
///     vec![
///         Channel::new("cardiac", 100.0, vec![0.0; 3000]),
///         Channel::new("respiratory", 25.0, vec![0.0; 750]),
///     ],
///     "run1.acq",
/// )?;
///
/// assert_eq!(set.channels().len(), 2);
/// assert!((set.span_secs() - 30.0).abs() < 1e-9);
/// # Ok::<(), bidsphysio::PhysioError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSet {
    start: NaiveDateTime,
    channels: Vec<Channel>,
    source: PathBuf,
    events: Option<EventTable>,
}

impl ChannelSet {
    /// Builds a channel set, validating the data-model invariants.
    ///
    /// # Errors
    ///
    /// * `PhysioError::InvalidChannelSet` - no channels, a non-positive
    ///   sampling frequency, a negative or non-finite offset, flags of the
    ///   wrong length, or co-recorded channels with different sample counts
    pub fn new<P: AsRef<Path>>(
        start: NaiveDateTime,
        channels: Vec<Channel>,
        source: P,
    ) -> Result<Self> {
        let source = source.as_ref().to_path_buf();

        if channels.is_empty() {
            return Err(PhysioError::InvalidChannelSet(format!(
                "{}: no channels", source.display()
            )));
        }

        for (i, ch) in channels.iter().enumerate() {
            if !(ch.sampling_frequency.is_finite() && ch.sampling_frequency > 0.0) {
                return Err(PhysioError::InvalidChannelSet(format!(
                    "{}: channel '{}' has invalid sampling frequency {}",
                    source.display(), ch.label, ch.sampling_frequency
                )));
            }
            // 偏移相对于记录开始，不能早于开始时间
            if !(ch.offset.is_finite() && ch.offset >= 0.0) {
                return Err(PhysioError::InvalidChannelSet(format!(
                    "{}: channel '{}' has invalid offset {}",
                    source.display(), ch.label, ch.offset
                )));
            }
            if let Some(flags) = &ch.flags {
                if flags.len() != ch.samples.len() {
                    return Err(PhysioError::InvalidChannelSet(format!(
                        "{}: channel '{}' has {} flags for {} samples",
                        source.display(), ch.label, flags.len(), ch.samples.len()
                    )));
                }
            }
            // 同一记录块中的通道样本数必须一致
            for other in &channels[..i] {
                if ch.is_co_recorded_with(other) && ch.len() != other.len() {
                    return Err(PhysioError::InvalidChannelSet(format!(
                        "{}: co-recorded channels '{}' and '{}' differ in length ({} vs {})",
                        source.display(), other.label, ch.label, other.len(), ch.len()
                    )));
                }
            }
        }

        Ok(ChannelSet {
            start,
            channels,
            source,
            events: None,
        })
    }

    /// Attaches the events recorded with these channels.
    pub fn with_events(mut self, events: EventTable) -> Self {
        self.events = Some(events);
        self
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn events(&self) -> Option<&EventTable> {
        self.events.as_ref()
    }

    pub fn channel(&self, label: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.label == label)
    }

    /// Seconds from the set start to the end of the longest channel.
    pub fn span_secs(&self) -> f64 {
        self.channels
            .iter()
            .map(Channel::end_offset)
            .fold(0.0, f64::max)
    }

    pub fn end(&self) -> NaiveDateTime {
        add_seconds(self.start, self.span_secs())
    }

    /// Same recording with every timestamp moved by `secs`.
    ///
    /// Channel offsets and event onsets are relative to the start, so only
    /// the start moves.
    pub fn shifted(&self, secs: f64) -> ChannelSet {
        ChannelSet {
            start: add_seconds(self.start, secs),
            ..self.clone()
        }
    }

    /// Drops the leading and trailing samples that fall outside
    /// `[start, start + duration)`.
    ///
    /// Whole samples are dropped, never interpolated. Events outside the
    /// window are dropped too. Trimming an already trimmed set to the same
    /// window returns an equal value.
    ///
    /// ```rust
    /// use bidsphysio::{Channel, ChannelSet};
    /// use chrono::{Duration, NaiveDate};
    ///
    /// let t0 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    ///     .and_hms_opt(10, 0, 0).unwrap();
    /// let cardiac = Channel::new("cardiac", 10.0, vec![1.0; 3000]);
    /// let set = ChannelSet::new(t0, vec![cardiac], "a.acq")?;
    ///
    /// let trimmed = set.trimmed_to(t0 + Duration::seconds(5), 290.0);
    /// assert_eq!(trimmed.start(), t0 + Duration::seconds(5));
    /// assert_eq!(trimmed.channels()[0].len(), 2900);
    /// assert_eq!(trimmed.trimmed_to(t0 + Duration::seconds(5), 290.0), trimmed);
    /// # Ok::<(), bidsphysio::PhysioError>(())
    /// ```
    pub fn trimmed_to(&self, start: NaiveDateTime, duration: f64) -> ChannelSet {
        let from = seconds_between(self.start, start).max(0.0);
        let to = seconds_between(self.start, start) + duration;

        let channels = self.channels.iter().map(|c| c.window(from, to)).collect();

        ChannelSet {
            start: add_seconds(self.start, from),
            channels,
            source: self.source.clone(),
            events: self.events.as_ref().map(|e| e.window(from, to)),
        }
    }

    /// Seconds of overlap between this recording and `[start, start + duration)`.
    pub fn overlap_secs(&self, start: NaiveDateTime, duration: f64) -> f64 {
        let scan_from = seconds_between(self.start, start);
        let scan_to = scan_from + duration;
        (scan_to.min(self.span_secs()) - scan_from.max(0.0)).max(0.0)
    }
}

/// BIDS entities of a functional run, parsed from its filename.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BidsEntities {
    pub subject: String,
    pub session: Option<String>,
    pub task: Option<String>,
    pub acquisition: Option<String>,
    pub run: Option<String>,
    pub echo: Option<String>,
}

impl BidsEntities {
    /// Parses `sub-01_ses-1_task-rest_run-2_bold.nii.gz` style names.
    ///
    /// Returns `None` when the name has no `sub-` entity.
    pub fn from_filename(name: &str) -> Option<Self> {
        let stem = crate::utils::strip_bids_suffix(name);
        let mut entities = BidsEntities::default();

        for part in stem.split('_') {
            let (key, value) = match part.split_once('-') {
                Some(kv) => kv,
                None => continue,
            };
            let value = value.to_string();
            match key {
                "sub" => entities.subject = value,
                "ses" => entities.session = Some(value),
                "task" => entities.task = Some(value),
                "acq" => entities.acquisition = Some(value),
                "run" => entities.run = Some(value),
                "echo" => entities.echo = Some(value),
                _ => {}
            }
        }

        if entities.subject.is_empty() {
            None
        } else {
            Some(entities)
        }
    }
}

/// One functional run of the imaging session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanEntry {
    pub entities: BidsEntities,
    /// 第一个体积的采集时间
    pub start: NaiveDateTime,
    /// 秒（体积数 × TR）
    pub duration: f64,
    /// Directory of the run relative to the dataset root, e.g. `sub-01/ses-1/func`.
    pub relative_dir: PathBuf,
    /// Canonical filename prefix, e.g. `sub-01_ses-1_task-rest_run-1`.
    pub prefix: String,
}

impl ScanEntry {
    pub fn end(&self) -> NaiveDateTime {
        add_seconds(self.start, self.duration)
    }
}

/// Why a physio recording was left without a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnmatchedReason {
    NoOverlappingScan,
    AmbiguousCount,
    LostTieBreak,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnmatchedReason::NoOverlappingScan => "no overlapping scan",
            UnmatchedReason::AmbiguousCount => "physio and scan counts differ in positional mode",
            UnmatchedReason::LostTieBreak => "lost tie-break to another recording",
        };
        f.write_str(text)
    }
}

/// Outcome of one matching run for a single recording or scan.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched { scan: ScanEntry, channels: ChannelSet },
    UnmatchedPhysio { channels: ChannelSet, reason: UnmatchedReason },
    UnmatchedScan { scan: ScanEntry },
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}
