mod common;

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use bidsphysio::doctest_utils::{create_bids_session, RunSpec};
use bidsphysio::{
    AdapterSet, CandidacyMode, PhysioError, SessionConfig, SessionDriver, UnmatchedReason,
    WriteOutcome, WriterOptions,
};
use common::{at, write_recording, write_recording_with_events, JsonAdapter};
use flate2::read::GzDecoder;
use serde_json::Value;

fn adapters() -> AdapterSet {
    AdapterSet::new()
        .with(JsonAdapter::trusted())
        .with(JsonAdapter::untrusted())
}

fn two_run_dataset(root: &Path) {
    create_bids_session(
        root,
        "01",
        Some("1"),
        &[
            RunSpec::new("rest", Some(1), at(0), 150, 2.0),
            RunSpec::new("rest", Some(2), at(600), 150, 2.0),
        ],
    )
    .unwrap();
}

fn gz_line_count(path: &Path) -> usize {
    let mut text = String::new();
    GzDecoder::new(File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text.lines().count()
}

#[test]
fn test_empty_input_folder() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());

    let report = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();

    assert_eq!(report.matched_count(), 0);
    assert_eq!(report.skipped_count(), 0);
    assert_eq!(
        report.unmatched_scans,
        vec!["sub-01_ses-1_task-rest_run-1", "sub-01_ses-1_task-rest_run-2"]
    );
    assert!(report.is_complete());
}

#[test]
fn test_two_frequencies_give_two_recordings() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let runs = [RunSpec::new("rest", None, at(0), 150, 2.0)];
    create_bids_session(bids.path(), "01", None, &runs).unwrap();
    write_recording(
        input.path(),
        "run1.phys",
        at(-5),
        &[("cardiac", 100.0, 310.0), ("respiratory", 25.0, 310.0)],
    );

    let report = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "01", None)
        .unwrap();
    assert_eq!(report.matched_count(), 1);
    assert_eq!(report.written_count(), 1);

    let func = bids.path().join("sub-01/func");
    let cardiac = func.join("sub-01_task-rest_recording-cardiac_physio.tsv.gz");
    let respiratory = func.join("sub-01_task-rest_recording-respiratory_physio.tsv.gz");
    assert!(!func.join("sub-01_task-rest_physio.tsv.gz").exists());

    // 裁剪到 300s 的扫描
    assert_eq!(gz_line_count(&cardiac), 30000);
    assert_eq!(gz_line_count(&respiratory), 7500);

    let sidecar_path = func.join("sub-01_task-rest_recording-respiratory_physio.json");
    let sidecar: Value = serde_json::from_str(&fs::read_to_string(sidecar_path).unwrap()).unwrap();
    assert_eq!(sidecar["SamplingFrequency"], 25.0);
    assert_eq!(sidecar["StartTime"], 0.0);
    assert_eq!(sidecar["Columns"], serde_json::json!(["respiratory"]));

    match &report.matched[0].outcome {
        WriteOutcome::Written(paths) => assert_eq!(paths.len(), 4),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_bad_and_unsupported_files_are_skipped() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());

    write_recording(input.path(), "a.phys", at(-2), &[("cardiac", 50.0, 304.0)]);
    fs::write(input.path().join("broken.phys"), "{ not json").unwrap();
    fs::write(input.path().join("notes.txt"), "operator notes").unwrap();
    fs::write(input.path().join(".hidden.phys"), "ignored").unwrap();

    let report = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();

    assert_eq!(report.input_files, 3);
    assert_eq!(report.matched_count(), 1);
    assert_eq!(report.unmatched_scans, vec!["sub-01_ses-1_task-rest_run-2"]);
    assert_eq!(report.skipped_count(), 2);
    assert!(report.skipped.iter().any(|s| s.message == "unsupported file type"));
    assert!(report.skipped.iter().any(|s| s.path.ends_with("broken.phys")));
    assert!(report.is_complete());
}

#[test]
fn test_unmatched_recording_is_reported_with_reason() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());

    write_recording(input.path(), "a.phys", at(0), &[("cardiac", 10.0, 300.0)]);
    write_recording(input.path(), "b.phys", at(600), &[("cardiac", 10.0, 300.0)]);
    write_recording(input.path(), "c.phys", at(3600), &[("cardiac", 10.0, 300.0)]);

    let report = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();

    assert_eq!(report.matched_count(), 2);
    assert_eq!(report.unmatched_physio.len(), 1);
    assert!(report.unmatched_physio[0].source.ends_with("c.phys"));
    assert_eq!(report.unmatched_physio[0].reason, UnmatchedReason::NoOverlappingScan);
    assert!(report.is_complete());
}

#[test]
fn test_existing_files_fail_per_pair_unless_overwrite() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());
    write_recording(input.path(), "a.phys", at(0), &[("cardiac", 10.0, 300.0)]);
    write_recording(input.path(), "b.phys", at(600), &[("cardiac", 10.0, 300.0)]);

    let driver = SessionDriver::new(adapters());
    let first = driver.convert(input.path(), bids.path(), "01", Some("1")).unwrap();
    assert_eq!(first.written_count(), 2);

    // 删除第二对的文件，只有第一对冲突
    let func = bids.path().join("sub-01/ses-1/func");
    fs::remove_file(func.join("sub-01_ses-1_task-rest_run-2_physio.json")).unwrap();
    fs::remove_file(func.join("sub-01_ses-1_task-rest_run-2_physio.tsv.gz")).unwrap();

    let report = driver.convert(input.path(), bids.path(), "01", Some("1")).unwrap();
    assert_eq!(report.matched_count(), 2);
    assert_eq!(report.written_count(), 1);
    assert!(matches!(report.matched[0].outcome, WriteOutcome::WriteFailed(_)));
    assert!(report.is_complete());

    let config = SessionConfig {
        writer: WriterOptions {
            overwrite: true,
            ..WriterOptions::default()
        },
        ..SessionConfig::default()
    };
    let report = SessionDriver::with_config(adapters(), config)
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();
    assert_eq!(report.written_count(), 2);
}

#[test]
fn test_untrusted_clock_switches_to_positional() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());

    // 设备时钟完全不对，只能按顺序匹配
    write_recording(input.path(), "first.log", at(-86400), &[("gaze", 10.0, 320.0)]);
    write_recording(input.path(), "second.log", at(-80000), &[("gaze", 10.0, 320.0)]);

    let report = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();

    assert_eq!(report.mode, CandidacyMode::Positional);
    assert_eq!(report.matched_count(), 2);
    assert!(report.matched[0].source.ends_with("first.log"));
    assert_eq!(report.matched[0].scan_prefix, "sub-01_ses-1_task-rest_run-1");
    assert!(report.matched[1].source.ends_with("second.log"));

    // 320s 的记录移到扫描开始处并裁剪到 300s
    let func = bids.path().join("sub-01/ses-1/func");
    for run in ["run-1", "run-2"] {
        let stem = format!("sub-01_ses-1_task-rest_{}_physio", run);
        let text = fs::read_to_string(func.join(format!("{}.json", stem))).unwrap();
        let sidecar: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(sidecar["StartTime"], 0.0);
        assert_eq!(gz_line_count(&func.join(format!("{}.tsv.gz", stem))), 3000);
    }
}

#[test]
fn test_events_written_with_physio() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());

    // 记录比扫描早 10s 开始；315s 的事件在扫描结束之后
    write_recording_with_events(
        input.path(),
        "a.phys",
        at(-10),
        &[("cardiac", 10.0, 320.0)],
        &[(12.0, 0.0, "button"), (315.0, 0.0, "late")],
    );
    // 事件无效：生理数据照常写出，不写事件文件
    write_recording_with_events(
        input.path(),
        "b.phys",
        at(600),
        &[("cardiac", 10.0, 300.0)],
        &[(5.0, -1.0, "broken")],
    );

    let report = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();
    assert_eq!(report.written_count(), 2);
    assert!(report.is_complete());

    let func = bids.path().join("sub-01/ses-1/func");
    let events = fs::read_to_string(func.join("sub-01_ses-1_task-rest_run-1_events.tsv")).unwrap();
    assert_eq!(events, "onset\tduration\ttrial_type\n2.0000\t0.0000\tbutton\n");
    let sidecar: Value = serde_json::from_str(
        &fs::read_to_string(func.join("sub-01_ses-1_task-rest_run-1_events.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["Columns"], serde_json::json!(["onset", "duration", "trial_type"]));

    assert!(!func.join("sub-01_ses-1_task-rest_run-2_events.tsv").exists());
    assert!(func.join("sub-01_ses-1_task-rest_run-2_physio.tsv.gz").exists());
}

#[test]
fn test_mode_override_wins_over_adapters() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());
    write_recording(input.path(), "first.log", at(-86400), &[("gaze", 10.0, 320.0)]);
    write_recording(input.path(), "second.log", at(-80000), &[("gaze", 10.0, 320.0)]);

    let config = SessionConfig {
        mode_override: Some(CandidacyMode::Overlap),
        ..SessionConfig::default()
    };
    let report = SessionDriver::with_config(adapters(), config)
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();

    assert_eq!(report.mode, CandidacyMode::Overlap);
    assert_eq!(report.matched_count(), 0);
    assert_eq!(report.unmatched_physio.len(), 2);
}

#[test]
fn test_archive_sources_and_output_root() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());
    write_recording(input.path(), "a.phys", at(0), &[("cardiac", 10.0, 300.0)]);

    let config = SessionConfig {
        archive_sources: true,
        output_root: Some(out.path().to_path_buf()),
        ..SessionConfig::default()
    };
    let report = SessionDriver::with_config(adapters(), config)
        .convert(input.path(), bids.path(), "01", Some("1"))
        .unwrap();

    let archive = out
        .path()
        .join("sourcedata/sub-01/ses-1/func/sub-01_ses-1_task-rest_run-1_physio.phys.tgz");
    assert_eq!(report.matched[0].archive.as_deref(), Some(archive.as_path()));
    assert!(archive.exists());
    assert!(out
        .path()
        .join("sub-01/ses-1/func/sub-01_ses-1_task-rest_run-1_physio.tsv.gz")
        .exists());
    assert!(!bids
        .path()
        .join("sub-01/ses-1/func/sub-01_ses-1_task-rest_run-1_physio.tsv.gz")
        .exists());
}

#[test]
fn test_archive_keeps_original_recording_time() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let runs = [RunSpec::new("rest", None, at(0), 150, 2.0)];
    create_bids_session(bids.path(), "01", None, &runs).unwrap();
    // 输出时被移到扫描开始处，归档时间仍是设备记录的时间
    write_recording(input.path(), "eyes.log", at(-86400), &[("gaze", 10.0, 320.0)]);

    let config = SessionConfig {
        archive_sources: true,
        ..SessionConfig::default()
    };
    let report = SessionDriver::with_config(adapters(), config)
        .convert(input.path(), bids.path(), "01", None)
        .unwrap();

    let archive = report.matched[0].archive.clone().unwrap();
    let mut tgz = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
    let entry = tgz.entries().unwrap().next().unwrap().unwrap();
    assert_eq!(entry.header().mtime().unwrap(), at(-86400).and_utc().timestamp() as u64);
}

#[test]
fn test_missing_subject_aborts_session() {
    let bids = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    two_run_dataset(bids.path());
    write_recording(input.path(), "a.phys", at(0), &[("cardiac", 10.0, 300.0)]);

    let err = SessionDriver::new(adapters())
        .convert(input.path(), bids.path(), "02", None)
        .unwrap_err();
    assert!(matches!(err, PhysioError::Catalog(_)));
    assert!(err.is_session_fatal());
}

#[test]
fn test_config_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    fs::write(
        &path,
        r#"{"matching": {"mode": "positional", "tolerance_secs": 2.5}, "writer": {"decimals": 6}}"#,
    )
    .unwrap();

    let config = SessionConfig::from_json_file(&path).unwrap();
    assert_eq!(config.matching.mode, CandidacyMode::Positional);
    assert_eq!(config.matching.tolerance_secs, 2.5);
    assert_eq!(config.writer.decimals, 6);
    assert!(config.writer.embed_trigger);

    fs::write(&path, r#"{"matching": {"tolerance_secs": -1.0}}"#).unwrap();
    assert!(matches!(SessionConfig::from_json_file(&path), Err(PhysioError::InvalidConfig(_))));
}
