//! Discrete events (button presses, stimulus markers, annotations) recorded
//! alongside the physio signals, written as a BIDS `_events.tsv` /
//! `_events.json` pair next to the `_physio` files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{PhysioError, Result};
use crate::writer::pretty_json;

/// Values of one extra events column.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValues {
    /// 非有限值写为 `n/a`
    Float(Vec<f64>),
    Integer(Vec<i64>),
    /// 空字符串写为 `n/a`
    Text(Vec<String>),
}

impl EventValues {
    pub fn len(&self) -> usize {
        match self {
            EventValues::Float(v) => v.len(),
            EventValues::Integer(v) => v.len(),
            EventValues::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, row: usize, decimals: usize) -> String {
        match self {
            EventValues::Float(v) => format_seconds(v[row], decimals),
            EventValues::Integer(v) => v[row].to_string(),
            EventValues::Text(v) => {
                // TSV 单元格内不能有制表符或换行
                let text: String = v[row]
                    .chars()
                    .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
                    .collect();
                if text.trim().is_empty() {
                    "n/a".to_string()
                } else {
                    text
                }
            }
        }
    }
}

/// An events column beyond `onset` and `duration`, e.g. `trial_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventColumn {
    pub label: String,
    pub units: String,
    pub description: String,
    pub values: EventValues,
}

impl EventColumn {
    pub fn new(label: &str, values: EventValues) -> Self {
        EventColumn {
            label: label.to_string(),
            units: String::new(),
            description: String::new(),
            values,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Events of one recording.
///
/// Onsets are seconds relative to the start of the owning
/// [`ChannelSet`](crate::ChannelSet); the writer re-expresses them relative
/// to the scan's first volume.
///
/// # Examples
///
/// ```rust
/// use bidsphysio::{EventColumn, EventTable, EventValues};
///
/// let events = EventTable::new(vec![1.5, 12.0], vec![0.0, 0.5])?
///     .with_column(EventColumn::new(
///         "trial_type",
///         EventValues::Text(vec!["button".to_string(), "stimulus".to_string()]),
///     ))?;
///
/// assert_eq!(events.len(), 2);
/// assert_eq!(events.labels(), vec!["onset", "duration", "trial_type"]);
/// # Ok::<(), bidsphysio::PhysioError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    onset: Vec<f64>,
    duration: Vec<f64>,
    columns: Vec<EventColumn>,
}

impl EventTable {
    /// Builds a table from onsets and durations (seconds).
    ///
    /// A non-finite duration is written as `n/a`.
    ///
    /// # Errors
    ///
    /// * `PhysioError::InvalidEvents` - lengths differ, an onset is not
    ///   finite or a duration is negative
    pub fn new(onset: Vec<f64>, duration: Vec<f64>) -> Result<Self> {
        if onset.len() != duration.len() {
            return Err(PhysioError::InvalidEvents(format!(
                "{} onsets for {} durations",
                onset.len(),
                duration.len()
            )));
        }
        if let Some(t) = onset.iter().find(|t| !t.is_finite()) {
            return Err(PhysioError::InvalidEvents(format!("invalid onset {}", t)));
        }
        if let Some(d) = duration.iter().find(|d| **d < 0.0) {
            return Err(PhysioError::InvalidEvents(format!("negative duration {}", d)));
        }
        Ok(EventTable {
            onset,
            duration,
            columns: Vec::new(),
        })
    }

    /// Adds an extra column.
    ///
    /// # Errors
    ///
    /// * `PhysioError::InvalidEvents` - wrong length, or a label that is
    ///   empty or already used
    pub fn with_column(mut self, column: EventColumn) -> Result<Self> {
        if column.values.len() != self.onset.len() {
            return Err(PhysioError::InvalidEvents(format!(
                "column '{}' has {} values for {} events",
                column.label,
                column.values.len(),
                self.onset.len()
            )));
        }
        if column.label.is_empty() || self.labels().contains(&column.label.as_str()) {
            return Err(PhysioError::InvalidEvents(format!(
                "duplicate or empty column label '{}'",
                column.label
            )));
        }
        self.columns.push(column);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.onset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.onset.is_empty()
    }

    pub fn onset(&self) -> &[f64] {
        &self.onset
    }

    pub fn duration(&self) -> &[f64] {
        &self.duration
    }

    pub fn columns(&self) -> &[EventColumn] {
        &self.columns
    }

    /// `onset`, `duration`, then the extra columns in insertion order.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels = vec!["onset", "duration"];
        labels.extend(self.columns.iter().map(|c| c.label.as_str()));
        labels
    }

    /// Keeps the events with onset in `[from, to)` and re-expresses their
    /// onsets relative to `from`.
    pub(crate) fn window(&self, from: f64, to: f64) -> EventTable {
        let keep: Vec<usize> = (0..self.onset.len())
            .filter(|&i| self.onset[i] >= from && self.onset[i] < to)
            .collect();

        let pick = |values: &EventValues| match values {
            EventValues::Float(v) => EventValues::Float(keep.iter().map(|&i| v[i]).collect()),
            EventValues::Integer(v) => EventValues::Integer(keep.iter().map(|&i| v[i]).collect()),
            EventValues::Text(v) => EventValues::Text(keep.iter().map(|&i| v[i].clone()).collect()),
        };
        let columns = self
            .columns
            .iter()
            .map(|c| EventColumn {
                label: c.label.clone(),
                units: c.units.clone(),
                description: c.description.clone(),
                values: pick(&c.values),
            })
            .collect();

        EventTable {
            onset: keep.iter().map(|&i| self.onset[i] - from).collect(),
            duration: keep.iter().map(|&i| self.duration[i]).collect(),
            columns,
        }
    }

    /// Writes the uncompressed TSV, header row first, with onsets shifted
    /// by `lead_secs`.
    pub(crate) fn write_tsv(
        &self,
        path: &Path,
        lead_secs: f64,
        decimals: usize,
    ) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", self.labels().join("\t"))?;

        for row in 0..self.len() {
            let mut cells = vec![
                format_seconds(self.onset[row] + lead_secs, decimals),
                format_seconds(self.duration[row], decimals),
            ];
            cells.extend(self.columns.iter().map(|c| c.values.cell(row, decimals)));
            writeln!(out, "{}", cells.join("\t"))?;
        }
        out.flush()
    }

    /// Sidecar: `Columns`, then units/description per column, sorted keys,
    /// 4-space indent, trailing newline.
    pub(crate) fn sidecar_json(&self) -> Result<Vec<u8>> {
        let mut map = Map::new();
        map.insert("Columns".to_string(), Value::from(self.labels()));
        map.insert(
            "onset".to_string(),
            describe("seconds", "Onset of the event relative to the first volume"),
        );
        map.insert("duration".to_string(), describe("seconds", "Duration of the event"));
        for column in &self.columns {
            if !column.units.is_empty() || !column.description.is_empty() {
                map.insert(column.label.clone(), describe(&column.units, &column.description));
            }
        }
        pretty_json(&Value::Object(map))
    }
}

fn describe(units: &str, description: &str) -> Value {
    let mut entry = Map::new();
    if !description.is_empty() {
        entry.insert("Description".to_string(), Value::from(description));
    }
    if !units.is_empty() {
        entry.insert("Units".to_string(), Value::from(units));
    }
    Value::Object(entry)
}

fn format_seconds(value: f64, decimals: usize) -> String {
    if value.is_finite() {
        format!("{:.*}", decimals, value)
    } else {
        "n/a".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn table() -> EventTable {
        EventTable::new(vec![1.0, 5.0, 9.0], vec![0.0, f64::NAN, 0.25])
            .unwrap()
            .with_column(EventColumn::new("buttons", EventValues::Integer(vec![1, 2, 4])))
            .unwrap()
            .with_column(
                EventColumn::new(
                    "trial_type",
                    EventValues::Text(vec!["a\tb".to_string(), String::new(), "c".to_string()]),
                )
                .with_description("Marker text"),
            )
            .unwrap()
    }

    #[test]
    fn test_rejects_inconsistent_tables() {
        assert!(matches!(EventTable::new(vec![1.0], vec![]), Err(PhysioError::InvalidEvents(_))));
        assert!(EventTable::new(vec![f64::NAN], vec![0.0]).is_err());
        assert!(EventTable::new(vec![1.0], vec![-1.0]).is_err());

        let events = EventTable::new(vec![1.0], vec![0.0]).unwrap();
        assert!(events
            .clone()
            .with_column(EventColumn::new("x", EventValues::Float(vec![1.0, 2.0])))
            .is_err());
        assert!(events
            .with_column(EventColumn::new("onset", EventValues::Float(vec![1.0])))
            .is_err());
    }

    #[test]
    fn test_window_keeps_events_inside_and_rebases_onsets() {
        let trimmed = table().window(4.0, 9.0);
        assert_eq!(trimmed.onset(), &[1.0]);
        assert_eq!(trimmed.columns()[0].values, EventValues::Integer(vec![2]));
        assert_eq!(trimmed.columns()[1].values, EventValues::Text(vec![String::new()]));
    }

    #[test]
    fn test_tsv_has_header_and_na_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_events.tsv");
        table().write_tsv(&path, -2.0, 4).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "onset\tduration\tbuttons\ttrial_type");
        assert_eq!(lines[1], "-1.0000\t0.0000\t1\ta b");
        assert_eq!(lines[2], "3.0000\tn/a\t2\tn/a");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_sidecar_lists_columns() {
        let json: Value = serde_json::from_slice(&table().sidecar_json().unwrap()).unwrap();
        assert_eq!(
            json["Columns"],
            serde_json::json!(["onset", "duration", "buttons", "trial_type"])
        );
        assert_eq!(json["onset"]["Units"], "seconds");
        assert_eq!(json["trial_type"]["Description"], "Marker text");
        assert!(json.get("buttons").is_none());
    }
}
