//! Correlating completed keys with combat-log fights.
//!
//! Per-fight matching runs a strict filter chain and then scores the
//! survivors; the batch fallback only has report time ranges and zone names
//! to go on, so it picks the report that started closest to the completion.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{CompletedKey, LogLink};
use crate::error::LedgerError;
use crate::logs::{CandidateRun, LogSource, ReportFilter, ReportSummary};
use crate::thresholds;
use crate::{db_call, SharedStore};

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub key: CompletedKey,
    pub run: CandidateRun,
    /// In [0, 1].
    pub confidence: f64,
}

impl MatchResult {
    pub fn to_link(&self) -> LogLink {
        LogLink::for_key(&self.key, &self.run.report_code, Some(self.run.fight_id), None)
    }
}

/// Lowercase, letters and digits only.
pub fn normalize_name(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Equality or containment either way after normalization. Loose on
/// purpose: a short name that is a subset of a longer one will match it.
pub fn dungeon_matches(a: &str, b: &str) -> bool {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(&b) || b.contains(&a)
}

/// Time proximity and run-time agreement, plus the baseline every candidate
/// that survived the exact-level filter earns.
pub fn match_confidence(key: &CompletedKey, run: &CandidateRun, time_diff: Duration, window: Duration) -> f64 {
    let window_ms = window.num_milliseconds();
    let time_score = if window_ms > 0 {
        1.0 - time_diff.num_milliseconds() as f64 / window_ms as f64
    } else {
        1.0
    };
    let mut confidence = time_score.clamp(0.0, 1.0) * thresholds::TIME_WEIGHT;

    if run.elapsed_ms > 0 && key.run_time_ms > 0 {
        let runtime_diff = (run.elapsed_ms - key.run_time_ms).abs();
        if runtime_diff < thresholds::RUNTIME_TOLERANCE_MS {
            let runtime_score = 1.0 - runtime_diff as f64 / thresholds::RUNTIME_TOLERANCE_MS as f64;
            confidence += runtime_score * thresholds::RUNTIME_WEIGHT;
        }
    }

    (confidence + thresholds::LEVEL_BASELINE).clamp(0.0, 1.0)
}

fn abs_diff(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    let d = a - b;
    if d < Duration::zero() { -d } else { d }
}

/// Best candidate for `key`, or `None` when nothing passes the filters.
/// Equal scores keep the earlier candidate.
pub fn match_key_to_runs(
    key: &CompletedKey,
    key_time: DateTime<Utc>,
    runs: &[CandidateRun],
    window: Duration,
) -> Option<MatchResult> {
    let mut best: Option<(&CandidateRun, f64)> = None;
    for run in runs {
        if run.key_level == 0 {
            continue;
        }
        if !run.success && run.elapsed_ms == 0 {
            continue;
        }
        if run.key_level != key.key_level {
            continue;
        }
        if !dungeon_matches(&key.dungeon, &run.dungeon) {
            continue;
        }
        let diff = abs_diff(key_time, run.completed_at);
        if diff > window {
            continue;
        }
        let confidence = match_confidence(key, run, diff, window);
        if best.map_or(true, |(_, top)| confidence > top) {
            best = Some((run, confidence));
        }
    }
    best.map(|(run, confidence)| MatchResult {
        key: key.clone(),
        run: run.clone(),
        confidence,
    })
}

/// Report whose buffered time range holds the completion and whose start is
/// nearest to it. Reports with no code or start are ignored; with no end the
/// range is `[start, start + window]`.
pub fn best_report_match<'a>(
    key: &CompletedKey,
    reports: &'a [ReportSummary],
    pre: Duration,
    post: Duration,
    window: Duration,
) -> Option<&'a ReportSummary> {
    let key_time = key.completed_at_utc().ok()?;
    let mut best: Option<(&ReportSummary, Duration)> = None;
    for report in reports {
        let Some(start) = report.start else { continue };
        if report.code.is_empty() {
            continue;
        }
        if !dungeon_matches(&key.dungeon, &report.zone_name) {
            continue;
        }
        let (lo, hi) = match report.end {
            Some(end) => (start - pre, end + post),
            None => (start, start + window),
        };
        if key_time < lo || key_time > hi {
            continue;
        }
        let distance = abs_diff(key_time, start);
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((report, distance));
        }
    }
    best.map(|(r, _)| r)
}

/// Outcome of matching a batch of keys character by character.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub matches: Vec<MatchResult>,
    /// Keys whose character fetch failed; candidates for the report fallback.
    pub fetch_failed: Vec<CompletedKey>,
}

/// Log-source client plus matching parameters.
pub struct Linker {
    source: Arc<dyn LogSource>,
    pub window: Duration,
    pub pre_buffer: Duration,
    pub post_buffer: Duration,
    pub filter: ReportFilter,
    pub run_limit: usize,
}

impl Linker {
    pub fn new(source: Arc<dyn LogSource>) -> Self {
        Self {
            source,
            window: Duration::seconds(thresholds::MATCH_WINDOW_SECS),
            pre_buffer: Duration::seconds(thresholds::REPORT_PRE_BUFFER_SECS),
            post_buffer: Duration::seconds(thresholds::REPORT_POST_BUFFER_SECS),
            filter: ReportFilter::default(),
            run_limit: thresholds::CHARACTER_RUN_LIMIT,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_filter(mut self, filter: ReportFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Fetch the owner's recent fights and pick the best one for `key`.
    pub async fn match_key(
        &self,
        key: &CompletedKey,
        cancel: &CancellationToken,
    ) -> Result<Option<MatchResult>, LedgerError> {
        let key_time = key.completed_at_utc()?;
        let owner = key.owner();
        let runs = unless_cancelled(cancel, self.source.fetch_character_runs(&owner, self.run_limit)).await?;
        debug!(character = %owner, runs = runs.len(), dungeon = %key.dungeon, level = key.key_level, "matching key");
        let result = match_key_to_runs(key, key_time, &runs, self.window);
        match &result {
            Some(m) => info!(
                key_id = key.resolved_id(),
                report = %m.run.report_code,
                fight = m.run.fight_id,
                confidence = m.confidence,
                "log match found"
            ),
            None => debug!(key_id = key.resolved_id(), dungeon = %key.dungeon, "no log match"),
        }
        Ok(result)
    }

    /// One fetch per character, then per-key matching. A failed fetch skips
    /// that character's keys and reports them in `fetch_failed`. Cancellation
    /// abandons the whole batch.
    pub async fn match_keys(
        &self,
        keys: &[CompletedKey],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, LedgerError> {
        let mut by_character: BTreeMap<String, Vec<&CompletedKey>> = BTreeMap::new();
        for key in keys {
            by_character.entry(key.owner().key()).or_default().push(key);
        }

        let mut outcome = BatchOutcome::default();
        for group in by_character.into_values() {
            let owner = group[0].owner();
            let fetched = unless_cancelled(cancel, self.source.fetch_character_runs(&owner, self.run_limit)).await;
            let runs = match fetched {
                Ok(runs) => runs,
                Err(LedgerError::Cancelled) => return Err(LedgerError::Cancelled),
                Err(e) => {
                    warn!(character = %owner, error = %e, "log fetch failed");
                    outcome.fetch_failed.extend(group.into_iter().cloned());
                    continue;
                }
            };
            for key in group {
                let Ok(key_time) = key.completed_at_utc() else {
                    debug!(key_id = key.key_id, completed_at = %key.completed_at, "unparseable completion time");
                    continue;
                };
                if let Some(m) = match_key_to_runs(key, key_time, &runs, self.window) {
                    outcome.matches.push(m);
                }
            }
        }
        Ok(outcome)
    }

    /// Coarse fallback: one report listing spanning every key, each key
    /// linked to its best report. Returns the number of links created.
    pub async fn link_by_reports(
        &self,
        store: &SharedStore,
        keys: &[CompletedKey],
        cancel: &CancellationToken,
    ) -> Result<usize, LedgerError> {
        let times: Vec<DateTime<Utc>> = keys.iter().filter_map(|k| k.completed_at_utc().ok()).collect();
        let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) else {
            return Ok(0);
        };
        let filter = self.filter.with_window(*min - self.window, *max + self.window);
        let reports = unless_cancelled(cancel, self.source.fetch_reports_in_window(&filter)).await?;
        debug!(keys = keys.len(), reports = reports.len(), "batch report matching");

        let mut linked = 0;
        for key in keys {
            let Some(report) = best_report_match(key, &reports, self.pre_buffer, self.post_buffer, self.window) else {
                continue;
            };
            let link = LogLink::for_key(key, &report.code, None, None);
            match db_call(store, move |s| s.insert_link(&link)).await {
                Ok(true) => {
                    info!(key_id = key.resolved_id(), report = %report.code, "linked by report window");
                    linked += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(key_id = key.resolved_id(), error = %e, "report link failed"),
            }
        }
        Ok(linked)
    }
}

/// Race `fut` against the token; cancellation wins ties.
async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, LedgerError>>,
) -> Result<T, LedgerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LedgerError::Cancelled),
        r = fut => r,
    }
}

/// Store the link for a match. Ok(false) when it was already there.
pub async fn persist_match(store: &SharedStore, m: &MatchResult) -> Result<bool, LedgerError> {
    let link = m.to_link();
    db_call(store, move |s| s.insert_link(&link)).await
}

#[cfg(test)]
#[path = "matching_tests.rs"]
mod matching_tests;
