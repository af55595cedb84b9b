use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// 从 a 到 b 的秒数（b 晚于 a 时为正）
pub fn seconds_between(a: NaiveDateTime, b: NaiveDateTime) -> f64 {
    let delta = b - a;
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        // 超过 ~292 年的差值只需要毫秒精度
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// Adds a (possibly negative, possibly fractional) number of seconds.
pub fn add_seconds(t: NaiveDateTime, secs: f64) -> NaiveDateTime {
    t + Duration::nanoseconds((secs * 1e9).round() as i64)
}

/// Parses a DICOM/BIDS time of day such as `13:45:02.527500`.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H%M%S%.f"))
        .ok()
}

/// Parses `2024-03-01T13:45:02.5` style timestamps (`T` or space separator).
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Date used to anchor time-of-day-only acquisition times.
pub fn default_reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Removes a trailing `.gz`, `.nii`, `_bold` and `_physio`, in that order.
///
/// Only suffixes at the very end are removed, so an entity value that
/// happens to contain `_bold` in the middle survives.
pub fn strip_bids_suffix(name: &str) -> &str {
    let mut name = name;
    for suffix in [".gz", ".nii", "_bold", "_physio"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
        }
    }
    name
}

/// Drops the `echo-<n>` entity from a filename prefix.
pub fn remove_echo_entity(prefix: &str) -> String {
    prefix
        .split('_')
        .filter(|part| !part.starts_with("echo-"))
        .collect::<Vec<_>>()
        .join("_")
}

/// BIDS labels are alphanumeric; anything else in a channel name is dropped.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// 截断到毫秒（向零取整）
pub fn truncate_to_millis(secs: f64) -> f64 {
    (secs * 1000.0).trunc() / 1000.0
}
