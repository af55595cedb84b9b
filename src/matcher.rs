//! Session matcher: decides which physio recording belongs to which scan.
//!
//! Device clocks are not synchronized with the scanner clock, so recordings
//! are matched to scans either by time overlap (with a tolerance) or, for
//! devices whose timestamps cannot be trusted at all, by position.
//!
//! Matching is a pure function of its inputs: the same recordings and
//! catalog always produce the same [`MatchResult`] sequence.

use std::cmp::Ordering;

use crate::config::{CandidacyMode, MatchConfig};
use crate::types::{ChannelSet, MatchResult, ScanEntry, UnmatchedReason};
use crate::utils::seconds_between;

/// One edge of the candidacy graph.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    physio: usize,
    scan: usize,
    score: f64,
}

/// Matches recordings against the scans of a session.
///
/// Results are ordered as follows: one entry per scan in start-time order
/// (`Matched` or `UnmatchedScan`), then the leftover recordings in input
/// order (`UnmatchedPhysio`).
///
/// Matched recordings that extend beyond their scan are trimmed to the scan
/// interval. In positional mode the recording's own clock is meaningless, so
/// a matched recording is first re-anchored to start at its scan's start and
/// then trimmed.
///
/// # Examples
///
/// ```rust
/// use bidsphysio::{match_session, MatchConfig, MatchResult, ScanEntry, BidsEntities};
/// use bidsphysio::doctest_utils::ramp_channel_set;
/// use chrono::{Duration, NaiveDate};
/// use std::path::PathBuf;
///
/// let t0 = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(10, 0, 0).unwrap();
/// let recording = ramp_channel_set(t0, 300.0, 50.0, "cardiac", "run1.acq")?;
/// let scan = ScanEntry {
///     entities: BidsEntities::from_filename("sub-01_task-rest").unwrap(),
///     start: t0 + Duration::seconds(5),
///     duration: 290.0,
///     relative_dir: PathBuf::from("sub-01/func"),
///     prefix: "sub-01_task-rest".to_string(),
/// };
///
/// let results = match_session(&[recording], &[scan], &MatchConfig::default());
/// match &results[0] {
///     MatchResult::Matched { channels, .. } => {
///         assert_eq!(channels.start(), t0 + Duration::seconds(5));
///         assert_eq!(channels.channels()[0].len(), 290 * 50);
///     }
///     other => panic!("unexpected {:?}", other),
/// }
/// # Ok::<(), bidsphysio::PhysioError>(())
/// ```
pub fn match_session(
    channelsets: &[ChannelSet],
    catalog: &[ScanEntry],
    config: &MatchConfig,
) -> Vec<MatchResult> {
    let scan_order = scan_order(catalog);

    // 空输入的边界情况
    if catalog.is_empty() {
        return channelsets
            .iter()
            .map(|cs| MatchResult::UnmatchedPhysio {
                channels: cs.clone(),
                reason: UnmatchedReason::NoOverlappingScan,
            })
            .collect();
    }
    if channelsets.is_empty() {
        return scan_order
            .iter()
            .map(|&s| MatchResult::UnmatchedScan { scan: catalog[s].clone() })
            .collect();
    }

    let trust_clock = config.mode == CandidacyMode::Overlap;

    // 时钟偏移校正：产生新的 ChannelSet，不修改输入
    let aligned: Vec<ChannelSet> = match (trust_clock && config.estimate_clock_offset)
        .then(|| estimate_clock_offset(channelsets, catalog))
        .flatten()
    {
        Some(offset) => {
            log::debug!("Estimated physio clock offset: {:.3} s", offset);
            channelsets.iter().map(|cs| cs.shifted(-offset)).collect()
        }
        None => channelsets.to_vec(),
    };

    // assignment[s] = 分配给第 s 个扫描的记录
    let mut assignment: Vec<Option<usize>> = vec![None; catalog.len()];
    let mut reasons: Vec<Option<UnmatchedReason>> = vec![None; channelsets.len()];

    if channelsets.len() == 1 && catalog.len() == 1 {
        // 单扫描会话：无歧义
        assignment[0] = Some(0);
    } else if !trust_clock {
        let physio_order = physio_order(&aligned);
        if physio_order.len() == scan_order.len() {
            for (&p, &s) in physio_order.iter().zip(scan_order.iter()) {
                assignment[s] = Some(p);
            }
        } else {
            log::warn!(
                "Positional matching needs equal counts: {} recordings, {} scans",
                channelsets.len(),
                catalog.len()
            );
            for reason in reasons.iter_mut() {
                *reason = Some(UnmatchedReason::AmbiguousCount);
            }
        }
    } else {
        let candidates = candidacy_graph(&aligned, catalog, config);
        let mut has_candidate = vec![false; channelsets.len()];
        for c in &candidates {
            has_candidate[c.physio] = true;
        }

        let mut taken = vec![false; channelsets.len()];
        for c in &candidates {
            if assignment[c.scan].is_none() && !taken[c.physio] {
                assignment[c.scan] = Some(c.physio);
                taken[c.physio] = true;
            }
        }

        for (p, reason) in reasons.iter_mut().enumerate() {
            if !taken[p] {
                *reason = Some(if has_candidate[p] {
                    UnmatchedReason::LostTieBreak
                } else {
                    UnmatchedReason::NoOverlappingScan
                });
            }
        }
    }

    let mut results = Vec::with_capacity(catalog.len() + channelsets.len());
    for &s in &scan_order {
        let scan = &catalog[s];
        match assignment[s] {
            Some(p) => {
                log::debug!("{} -> {}", channelsets[p].source().display(), scan.prefix);
                let channels = if trust_clock {
                    trim_to_scan(&aligned[p], scan)
                } else {
                    // 不可信时钟：以扫描开始为起点重新定位
                    let lag = seconds_between(aligned[p].start(), scan.start);
                    let anchored = aligned[p].shifted(lag);
                    trim_to_scan(&anchored, scan)
                };
                results.push(MatchResult::Matched { scan: scan.clone(), channels });
            }
            None => results.push(MatchResult::UnmatchedScan { scan: scan.clone() }),
        }
    }
    for (p, reason) in reasons.iter().enumerate() {
        if let Some(reason) = reason {
            results.push(MatchResult::UnmatchedPhysio {
                channels: channelsets[p].clone(),
                reason: *reason,
            });
        }
    }
    results
}

/// Candidate edges sorted in greedy assignment order: highest overlap
/// first, then earliest recording start, then input order, then earliest
/// scan.
fn candidacy_graph(
    channelsets: &[ChannelSet],
    catalog: &[ScanEntry],
    config: &MatchConfig,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for (p, cs) in channelsets.iter().enumerate() {
        for (s, scan) in catalog.iter().enumerate() {
            let overlap = cs.overlap_secs(scan.start, scan.duration);
            if overlap <= 0.0 {
                continue;
            }

            let is_candidate = match config.min_overlap_fraction {
                Some(fraction) => overlap >= fraction * scan.duration,
                None => {
                    // 记录必须在扫描开始前（容差内）开始，并覆盖到扫描结束（容差内）
                    let starts_late_by = seconds_between(scan.start, cs.start());
                    let ends_early_by = seconds_between(cs.end(), scan.end());
                    starts_late_by <= config.tolerance_secs
                        && ends_early_by <= config.tolerance_secs
                }
            };

            if is_candidate {
                candidates.push(Candidate { physio: p, scan: s, score: overlap });
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| channelsets[a.physio].start().cmp(&channelsets[b.physio].start()))
            .then_with(|| a.physio.cmp(&b.physio))
            .then_with(|| compare_scans(&catalog[a.scan], &catalog[b.scan]))
            .then_with(|| a.scan.cmp(&b.scan))
    });
    candidates
}

/// Trims a matched recording to its scan when it is longer than the scan.
///
/// A recording that does not overlap the scan at all (possible only in a
/// forced single-scan match) is kept whole.
fn trim_to_scan(cs: &ChannelSet, scan: &ScanEntry) -> ChannelSet {
    if cs.span_secs() <= scan.duration {
        return cs.clone();
    }
    if cs.overlap_secs(scan.start, scan.duration) <= 0.0 {
        log::warn!(
            "{} does not overlap {}; keeping the full recording",
            cs.source().display(),
            scan.prefix
        );
        return cs.clone();
    }
    cs.trimmed_to(scan.start, scan.duration)
}

/// Constant offset (seconds, physio clock minus scanner clock) that best
/// lines up recording starts with scan starts.
///
/// Every recording/scan onset difference is tried as the offset; the one
/// minimizing the summed distance from each recording to its nearest scan
/// wins, the first one found on ties. Returns `None` with fewer than two
/// recordings, where any offset fits equally well.
pub fn estimate_clock_offset(channelsets: &[ChannelSet], catalog: &[ScanEntry]) -> Option<f64> {
    if channelsets.len() < 2 || catalog.is_empty() {
        return None;
    }

    let order = scan_order(catalog);
    let reference = catalog[order[0]].start;
    let scan_onsets: Vec<f64> = order
        .iter()
        .map(|&s| seconds_between(reference, catalog[s].start))
        .collect();
    let physio_onsets: Vec<f64> = physio_order(channelsets)
        .iter()
        .map(|&p| seconds_between(reference, channelsets[p].start()))
        .collect();

    let mut best: Option<(f64, f64)> = None;
    for scan_on in &scan_onsets {
        for physio_on in &physio_onsets {
            let offset = physio_on - scan_on;
            let cost: f64 = physio_onsets
                .iter()
                .map(|p| {
                    scan_onsets
                        .iter()
                        .map(|s| (p - s - offset).abs())
                        .fold(f64::INFINITY, f64::min)
                })
                .sum();
            if best.map_or(true, |(best_cost, _)| cost < best_cost) {
                best = Some((cost, offset));
            }
        }
    }
    best.map(|(_, offset)| offset)
}

fn compare_scans(a: &ScanEntry, b: &ScanEntry) -> Ordering {
    a.start.cmp(&b.start).then_with(|| a.prefix.cmp(&b.prefix))
}

/// Scan indices by start time.
fn scan_order(catalog: &[ScanEntry]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..catalog.len()).collect();
    order.sort_by(|&a, &b| compare_scans(&catalog[a], &catalog[b]).then_with(|| a.cmp(&b)));
    order
}

/// Recording indices by start time, input order breaking ties.
fn physio_order(channelsets: &[ChannelSet]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..channelsets.len()).collect();
    order.sort_by(|&a, &b| {
        channelsets[a]
            .start()
            .cmp(&channelsets[b].start())
            .then_with(|| a.cmp(&b))
    });
    order
}
