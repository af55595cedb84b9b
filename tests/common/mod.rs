// Shared helpers for the integration tests: a small JSON "device format"
// and an adapter for it.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use bidsphysio::{
    BidsEntities, Channel, ChannelSet, DeviceAdapter, EventColumn, EventTable, EventValues,
    PhysioError, Result, ScanEntry,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct RecordingFile {
    start: String,
    channels: Vec<ChannelSpec>,
    #[serde(default)]
    events: Option<Vec<EventSpec>>,
}

#[derive(Deserialize)]
struct EventSpec {
    onset: f64,
    duration: f64,
    trial_type: String,
}

#[derive(Deserialize)]
struct ChannelSpec {
    label: String,
    frequency: f64,
    seconds: f64,
    #[serde(default)]
    units: String,
}

/// Reads `*.phys` files written by [`write_recording`].
pub struct JsonAdapter {
    pub trusted: bool,
    pub extensions: Vec<&'static str>,
}

impl JsonAdapter {
    pub fn trusted() -> Self {
        JsonAdapter { trusted: true, extensions: vec!["phys"] }
    }

    /// Same format under `.log`, with a clock that can't be compared to
    /// the scanner's.
    pub fn untrusted() -> Self {
        JsonAdapter { trusted: false, extensions: vec!["log"] }
    }
}

impl DeviceAdapter for JsonAdapter {
    fn name(&self) -> &str {
        "json"
    }

    fn extensions(&self) -> &[&str] {
        &self.extensions
    }

    fn clock_trusted(&self) -> bool {
        self.trusted
    }

    fn parse(&self, path: &Path) -> Result<ChannelSet> {
        let file = read_file(path)?;
        let start = NaiveDateTime::parse_from_str(&file.start, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| PhysioError::parse(path, e.to_string()))?;

        let channels = file
            .channels
            .iter()
            .map(|c| {
                let n = (c.seconds * c.frequency).round() as usize;
                let samples = (0..n).map(|i| (i as f64 / c.frequency).sin()).collect();
                Channel::new(&c.label, c.frequency, samples).with_units(&c.units)
            })
            .collect();
        ChannelSet::new(start, channels, path)
    }

    fn parse_events(&self, path: &Path) -> Result<Option<EventTable>> {
        let specs = match read_file(path)?.events {
            Some(specs) => specs,
            None => return Ok(None),
        };
        let table = EventTable::new(
            specs.iter().map(|e| e.onset).collect(),
            specs.iter().map(|e| e.duration).collect(),
        )?
        .with_column(EventColumn::new(
            "trial_type",
            EventValues::Text(specs.iter().map(|e| e.trial_type.clone()).collect()),
        ))?;
        Ok(Some(table))
    }
}

fn read_file(path: &Path) -> Result<RecordingFile> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| PhysioError::parse(path, e.to_string()))
}

/// Writes a recording of `(label, frequency, seconds)` channels to `dir/name`.
pub fn write_recording(
    dir: &Path,
    name: &str,
    start: NaiveDateTime,
    channels: &[(&str, f64, f64)],
) -> PathBuf {
    write_recording_with_events(dir, name, start, channels, &[])
}

/// Same as [`write_recording`], plus `(onset, duration, trial_type)` events
/// when `events` is not empty.
pub fn write_recording_with_events(
    dir: &Path,
    name: &str,
    start: NaiveDateTime,
    channels: &[(&str, f64, f64)],
    events: &[(f64, f64, &str)],
) -> PathBuf {
    let channels: Vec<_> = channels
        .iter()
        .map(|(label, frequency, seconds)| {
            json!({"label": label, "frequency": frequency, "seconds": seconds})
        })
        .collect();
    let mut body = json!({
        "start": start.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        "channels": channels,
    });
    if !events.is_empty() {
        body["events"] = events
            .iter()
            .map(|(onset, duration, trial_type)| {
                json!({"onset": onset, "duration": duration, "trial_type": trial_type})
            })
            .collect();
    }
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
    path
}

pub fn session_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(10, 0, 0).unwrap()
}

/// `session_start()` plus `secs` seconds.
pub fn at(secs: i64) -> NaiveDateTime {
    session_start() + Duration::seconds(secs)
}

pub fn scan_entry(task: &str, start_secs: i64, duration: f64) -> ScanEntry {
    let prefix = format!("sub-01_task-{}", task);
    ScanEntry {
        entities: BidsEntities::from_filename(&prefix).unwrap(),
        start: at(start_secs),
        duration,
        relative_dir: PathBuf::from("sub-01/func"),
        prefix,
    }
}
