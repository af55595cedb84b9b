use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::WriterOptions;
use crate::error::{PhysioError, Result};
use crate::events::EventTable;
use crate::types::{Channel, ChannelSet, ScanEntry};
use crate::utils::{sanitize_label, seconds_between, truncate_to_millis};

/// Label given to synthesized trigger columns.
const TRIGGER_LABEL: &str = "trigger";

/// One column of a BIDS physio TSV.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysioColumn {
    pub label: String,
    pub units: String,
    pub values: Vec<f64>,
    /// 触发列以整数写出
    pub is_trigger: bool,
}

/// Channels sharing one sampling frequency and start time, written as one
/// `_physio.tsv.gz` / `_physio.json` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingGroup {
    /// `recording-<label>` entity; `None` when the recording is the only group.
    pub label: Option<String>,
    pub sampling_frequency: f64,
    /// Seconds from the scan's first volume to the first sample, truncated
    /// to milliseconds. Negative when the recording started first.
    pub start_time: f64,
    pub columns: Vec<PhysioColumn>,
}

impl RecordingGroup {
    /// Number of TSV rows; columns of unequal length are cut to the shortest.
    pub fn row_count(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).min().unwrap_or(0)
    }

    /// `<prefix>[_recording-<label>]_physio`
    pub fn file_stem(&self, prefix: &str) -> String {
        match &self.label {
            Some(label) => format!("{}_recording-{}_physio", prefix, label),
            None => format!("{}_physio", prefix),
        }
    }
}

/// BIDS physio writer
///
/// The `PhysioWriter` turns a matched (scan, recording) pair into BIDS
/// `_physio` files next to the scan's imaging data:
///
/// * `<dir>/<prefix>[_recording-<label>]_physio.tsv.gz`: one row per
///   sample, one tab-separated column per channel, no header row
/// * `<dir>/<prefix>[_recording-<label>]_physio.json`: `SamplingFrequency`,
///   `StartTime`, `Columns` and the units of every channel that has them
/// * `<dir>/<prefix>_events.tsv` / `.json`: only when the recording carries
///   a non-empty [`EventTable`], onsets relative to the scan's first volume
///
/// # Grouping
///
/// Channels are grouped by (sampling frequency, start time). A recording
/// with a single group gets no `recording-` entity; otherwise every group is
/// labelled with the name of its first channel.
///
/// When `embed_trigger` is set and the recording has a `trigger` channel,
/// the trigger is not a group of its own: the group sharing its timing gets
/// it as a column, every other group gets a resampled copy (1 at the first
/// sample at or after each trigger pulse, 0 elsewhere).
///
/// # Examples
///
/// ```rust
/// use bidsphysio::{Channel, ChannelSet, PhysioWriter, ScanEntry, BidsEntities};
/// use chrono::{Duration, NaiveDate};
/// use std::path::PathBuf;
///
/// # let dir = tempfile::tempdir()?;
/// let t0 = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(10, 0, 0).unwrap();
/// let scan = ScanEntry {
///     entities: BidsEntities::from_filename("sub-01_task-rest").unwrap(),
///     start: t0 + Duration::seconds(2),
///     duration: 10.0,
///     relative_dir: PathBuf::from("sub-01/func"),
///     prefix: "sub-01_task-rest".to_string(),
/// };
/// let recording = ChannelSet::new(
///     t0,
///     vec![
///         Channel::new("cardiac", 100.0, vec![0.5; 1200]).with_units("mV"),
///         Channel::new("respiratory", 100.0, vec![1.0; 1200]),
///     ],
///     "run1.acq",
/// )?;
///
/// let writer = PhysioWriter::new(dir.path());
/// let written = writer.write(&scan, &recording)?;
///
/// assert_eq!(written.len(), 2);
/// assert!(written[0].ends_with("sub-01/func/sub-01_task-rest_physio.tsv.gz"));
/// assert!(written[1].ends_with("sub-01/func/sub-01_task-rest_physio.json"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct PhysioWriter {
    output_root: PathBuf,
    options: WriterOptions,
}

impl PhysioWriter {
    /// Writer with default options rooted at `output_root` (normally the
    /// BIDS dataset root).
    pub fn new<P: AsRef<Path>>(output_root: P) -> Self {
        Self::with_options(output_root, WriterOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(output_root: P, options: WriterOptions) -> Self {
        PhysioWriter {
            output_root: output_root.as_ref().to_path_buf(),
            options,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Splits a recording into the groups that become file pairs.
    pub fn recording_groups(&self, scan: &ScanEntry, channels: &ChannelSet) -> Vec<RecordingGroup> {
        let lead = seconds_between(scan.start, channels.start());
        let start_of = |c: &Channel| truncate_to_millis(lead + c.offset);

        let trigger = if self.options.embed_trigger {
            channels.channels().iter().find(|c| c.is_trigger())
        } else {
            None
        };

        // 只有触发通道时，按普通通道处理
        let trigger = trigger.filter(|_| channels.channels().iter().any(|c| !c.is_trigger()));

        let mut grouped: Vec<(f64, f64, Vec<&Channel>)> = Vec::new();
        for channel in channels.channels() {
            if trigger.is_some() && channel.is_trigger() {
                continue;
            }
            let start = start_of(channel);
            match grouped
                .iter_mut()
                .find(|(freq, t, _)| *freq == channel.sampling_frequency && *t == start)
            {
                Some((_, _, members)) => members.push(channel),
                None => grouped.push((channel.sampling_frequency, start, vec![channel])),
            }
        }

        let single = grouped.len() == 1;
        let mut used_labels: Vec<String> = Vec::new();
        let mut groups = Vec::with_capacity(grouped.len());

        for (freq, start, members) in grouped {
            let mut columns: Vec<PhysioColumn> = members.iter().map(|c| column_from(c)).collect();

            if let Some(trig) = trigger {
                if trig.sampling_frequency == freq && start_of(trig) == start {
                    columns.push(column_from(trig));
                } else {
                    columns.push(PhysioColumn {
                        label: TRIGGER_LABEL.to_string(),
                        units: String::new(),
                        values: resample_trigger(trig, members[0]),
                        is_trigger: true,
                    });
                }
            }

            let label = if single {
                None
            } else {
                let base = sanitize_label(&members[0].label);
                let mut label = base.clone();
                let mut n = 2;
                while used_labels.contains(&label) {
                    label = format!("{}{}", base, n);
                    n += 1;
                }
                used_labels.push(label.clone());
                Some(label)
            };

            groups.push(RecordingGroup {
                label,
                sampling_frequency: freq,
                start_time: start,
                columns,
            });
        }
        groups
    }

    /// Target paths (`.tsv.gz`, `.json`, per group, then the events pair
    /// if any) for a matched pair.
    pub fn target_paths(&self, scan: &ScanEntry, channels: &ChannelSet) -> Vec<PathBuf> {
        let dir = self.output_root.join(&scan.relative_dir);
        let mut paths: Vec<PathBuf> = self
            .recording_groups(scan, channels)
            .iter()
            .flat_map(|g| {
                let stem = g.file_stem(&scan.prefix);
                [dir.join(format!("{}.tsv.gz", stem)), dir.join(format!("{}.json", stem))]
            })
            .collect();
        if events_to_write(channels).is_some() {
            let (tsv, json) = events_paths(&dir, &scan.prefix);
            paths.push(tsv);
            paths.push(json);
        }
        paths
    }

    /// Writes every group of `channels` next to `scan`.
    ///
    /// Existing targets are checked before anything is written, so a
    /// conflict leaves the output directory untouched.
    ///
    /// # Errors
    ///
    /// * `PhysioError::FileExists` - a target exists and `overwrite` is off
    /// * `PhysioError::Write` - the directory or a file cannot be written
    pub fn write(&self, scan: &ScanEntry, channels: &ChannelSet) -> Result<Vec<PathBuf>> {
        let dir = self.output_root.join(&scan.relative_dir);
        let groups = self.recording_groups(scan, channels);

        if !self.options.overwrite {
            if let Some(path) = self.target_paths(scan, channels).into_iter().find(|p| p.exists()) {
                return Err(PhysioError::FileExists(path.display().to_string()));
            }
        }

        fs::create_dir_all(&dir).map_err(|e| PhysioError::write(&dir, e.to_string()))?;

        let mut written = Vec::with_capacity(groups.len() * 2);
        for group in &groups {
            let stem = group.file_stem(&scan.prefix);

            let tsv_path = dir.join(format!("{}.tsv.gz", stem));
            self.write_tsv(&tsv_path, group)
                .map_err(|e| PhysioError::write(&tsv_path, e.to_string()))?;
            written.push(tsv_path);

            let json_path = dir.join(format!("{}.json", stem));
            fs::write(&json_path, sidecar_json(group)?)
                .map_err(|e| PhysioError::write(&json_path, e.to_string()))?;
            written.push(json_path);

            log::debug!(
                "Wrote {} ({} columns, {} rows)",
                stem,
                group.columns.len(),
                group.row_count()
            );
        }

        if let Some(events) = events_to_write(channels) {
            let lead = seconds_between(scan.start, channels.start());
            let (tsv_path, json_path) = events_paths(&dir, &scan.prefix);
            events
                .write_tsv(&tsv_path, lead, self.options.decimals)
                .map_err(|e| PhysioError::write(&tsv_path, e.to_string()))?;
            written.push(tsv_path);
            fs::write(&json_path, events.sidecar_json()?)
                .map_err(|e| PhysioError::write(&json_path, e.to_string()))?;
            written.push(json_path);
            log::debug!("Wrote {}_events ({} events)", scan.prefix, events.len());
        }
        Ok(written)
    }

    fn write_tsv(&self, path: &Path, group: &RecordingGroup) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        let decimals = self.options.decimals;
        let mut line = String::new();
        for row in 0..group.row_count() {
            line.clear();
            for (i, column) in group.columns.iter().enumerate() {
                if i > 0 {
                    line.push('\t');
                }
                let value = column.values[row];
                if !value.is_finite() {
                    line.push_str("n/a");
                } else if column.is_trigger {
                    line.push_str(&(value.round() as i64).to_string());
                } else {
                    line.push_str(&format!("{:.*}", decimals, value));
                }
            }
            line.push('\n');
            encoder.write_all(line.as_bytes())?;
        }

        encoder.finish()?.flush()
    }
}

fn events_to_write(channels: &ChannelSet) -> Option<&EventTable> {
    channels.events().filter(|e| !e.is_empty())
}

fn events_paths(dir: &Path, prefix: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}_events.tsv", prefix)),
        dir.join(format!("{}_events.json", prefix)),
    )
}

fn column_from(channel: &Channel) -> PhysioColumn {
    PhysioColumn {
        label: channel.label.clone(),
        units: channel.units.clone(),
        values: channel.samples.clone(),
        is_trigger: channel.is_trigger(),
    }
}

/// Trigger pulses of `trigger` moved onto the sample grid of `target`.
fn resample_trigger(trigger: &Channel, target: &Channel) -> Vec<f64> {
    let n = target.len();
    let mut values = vec![0.0; n];
    if n == 0 {
        return values;
    }

    let freq = target.sampling_frequency;
    let first = target.offset;
    let last = target.offset + (n - 1) as f64 / freq;

    for (i, sample) in trigger.samples.iter().enumerate() {
        if *sample <= 0.0 {
            continue;
        }
        let t = trigger.offset + i as f64 / trigger.sampling_frequency;
        if t < first || t > last {
            continue;
        }
        // 第一个时间 >= t 的样本
        let idx = ((t - first) * freq - 1e-6).ceil().max(0.0) as usize;
        values[idx.min(n - 1)] = 1.0;
    }
    values
}

/// Sidecar contents: sorted keys, 4-space indent, trailing newline.
fn sidecar_json(group: &RecordingGroup) -> Result<Vec<u8>> {
    let mut map = Map::new();
    map.insert("SamplingFrequency".to_string(), Value::from(group.sampling_frequency));
    map.insert("StartTime".to_string(), Value::from(group.start_time));
    map.insert(
        "Columns".to_string(),
        Value::from(group.columns.iter().map(|c| c.label.clone()).collect::<Vec<_>>()),
    );
    for column in group.columns.iter().filter(|c| !c.units.is_empty()) {
        let mut units = Map::new();
        units.insert("Units".to_string(), Value::from(column.units.clone()));
        map.insert(column.label.clone(), Value::Object(units));
    }
    pretty_json(&Value::Object(map))
}

/// `value` with a 4-space indent and a trailing newline. Keys come out
/// sorted because `serde_json::Map` is ordered.
pub(crate) fn pretty_json(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}
