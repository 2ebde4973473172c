use super::*;
use crate::db::{Character, KeyStore};
use async_trait::async_trait;
use chrono::TimeZone;
use std::sync::atomic::{AtomicUsize, Ordering};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 4, h, m, 0).unwrap()
}

fn key10() -> CompletedKey {
    CompletedKey {
        key_id: 5001,
        character: "arthas".into(),
        region: "us".into(),
        realm: "illidan".into(),
        dungeon: "Mists of Tirna Scithe".into(),
        key_level: 10,
        run_time_ms: 1_320_000,
        par_time_ms: 1_500_000,
        completed_at: at(1, 30).to_rfc3339(),
        source: "raiderio".into(),
    }
}

fn run(code: &str, fight: i64, level: i32, when: DateTime<Utc>, elapsed: i64) -> CandidateRun {
    CandidateRun {
        report_code: code.into(),
        fight_id: fight,
        dungeon: "Mists of Tirna Scithe".into(),
        key_level: level,
        completed_at: when,
        elapsed_ms: elapsed,
        success: true,
    }
}

fn day() -> Duration {
    Duration::hours(24)
}

#[test]
fn names_normalize() {
    assert_eq!(normalize_name("Mists of Tirna Scithe"), "mistsoftirnascithe");
    assert_eq!(normalize_name("Ara-Kara, City of Echoes"), "arakaracityofechoes");
    assert!(dungeon_matches("Mists of Tirna Scithe", "mists-of-tirna scithe"));
    assert!(dungeon_matches("Tirna Scithe", "Mists of Tirna Scithe"));
    assert!(dungeon_matches("Mists of Tirna Scithe", "Tirna"));
    assert!(!dungeon_matches("The Necrotic Wake", "Mists of Tirna Scithe"));
    assert!(!dungeon_matches("", "Mists"));
    assert!(!dungeon_matches("!!", "Mists"));
}

#[test]
fn perfect_candidate_scores_high() {
    let key = key10();
    let runs = [run("ABC", 3, 10, at(1, 30), 1_320_000)];
    let m = match_key_to_runs(&key, at(1, 30), &runs, day()).unwrap();
    assert!(m.confidence >= 0.95, "{}", m.confidence);
    assert!(m.confidence <= 1.0);
    assert_eq!(m.run.fight_id, 3);
}

#[test]
fn close_runtime_and_time_scores_above_point_eight() {
    let key = key10();
    let runs = [run("ABC", 3, 10, at(1, 35), 1_321_000)];
    let m = match_key_to_runs(&key, at(1, 30), &runs, day()).unwrap();
    assert!(m.confidence >= 0.8, "{}", m.confidence);
    assert_eq!(m.to_link().url, "https://www.warcraftlogs.com/reports/ABC#fight=3");
}

#[test]
fn level_mismatch_never_matches() {
    let key = key10();
    let runs = [
        run("ABC", 1, 9, at(1, 30), 1_320_000),
        run("ABC", 2, 11, at(1, 30), 1_320_000),
    ];
    assert!(match_key_to_runs(&key, at(1, 30), &runs, day()).is_none());
}

#[test]
fn filter_chain() {
    let key = key10();
    let zero = run("A", 1, 0, at(1, 30), 1_320_000);
    let mut incomplete = run("B", 2, 10, at(1, 30), 0);
    incomplete.success = false;
    let mut wrong_dungeon = run("C", 3, 10, at(1, 30), 1_320_000);
    wrong_dungeon.dungeon = "The Necrotic Wake".into();
    let too_old = run("D", 4, 10, at(1, 30) - Duration::hours(25), 1_320_000);
    let runs = [zero, incomplete, wrong_dungeon, too_old];
    assert!(match_key_to_runs(&key, at(1, 30), &runs, day()).is_none());

    // Elapsed time alone counts as complete.
    let mut timed = run("E", 5, 10, at(2, 0), 1_320_000);
    timed.success = false;
    let m = match_key_to_runs(&key, at(1, 30), &[timed], day()).unwrap();
    assert_eq!(m.run.report_code, "E");
}

#[test]
fn highest_score_wins_and_ties_keep_first() {
    let key = key10();
    let runs = [
        run("FAR", 1, 10, at(6, 0), 0),
        run("NEAR", 2, 10, at(1, 35), 1_321_000),
        run("FAR2", 3, 10, at(8, 0), 0),
    ];
    let m = match_key_to_runs(&key, at(1, 30), &runs, day()).unwrap();
    assert_eq!(m.run.report_code, "NEAR");

    let twins = [run("FIRST", 1, 10, at(2, 0), 0), run("SECOND", 2, 10, at(1, 0), 0)];
    let m = match_key_to_runs(&key, at(1, 30), &twins, day()).unwrap();
    assert_eq!(m.run.report_code, "FIRST");
}

#[test]
fn confidence_stays_in_unit_interval() {
    let key = key10();
    for minutes in [0i64, 1, 30, 600, 1439, 1440] {
        for elapsed in [0i64, 1, 1_315_001, 1_320_000, 1_324_999, 9_999_999] {
            let r = run("X", 1, 10, at(1, 30), elapsed);
            let c = match_confidence(&key, &r, Duration::minutes(minutes), day());
            assert!((0.0..=1.0).contains(&c), "minutes={minutes} elapsed={elapsed} c={c}");
            assert!(c >= thresholds::LEVEL_BASELINE);
        }
    }
    // Degenerate window and out-of-window diff still clamp.
    let r = run("X", 1, 10, at(1, 30), 1_320_000);
    assert!((0.0..=1.0).contains(&match_confidence(&key, &r, Duration::hours(48), day())));
    assert!((0.0..=1.0).contains(&match_confidence(&key, &r, Duration::zero(), Duration::zero())));
}

fn report(code: &str, zone: &str, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> ReportSummary {
    ReportSummary {
        code: code.into(),
        title: String::new(),
        zone_name: zone.into(),
        start,
        end,
    }
}

#[test]
fn report_fallback_picks_closest_start() {
    let key = key10(); // completed 01:30
    let pre = Duration::minutes(15);
    let post = Duration::minutes(30);
    let reports = [
        report("", "Mists of Tirna Scithe", Some(at(1, 0)), Some(at(2, 0))),
        report("NOSTART", "Mists of Tirna Scithe", None, None),
        report("EARLY", "Mists of Tirna Scithe", Some(at(0, 30)), Some(at(1, 10))),
        report("CLOSE", "Mists of Tirna Scithe", Some(at(1, 20)), Some(at(1, 25))),
        report("OTHER", "The Necrotic Wake", Some(at(1, 29)), Some(at(2, 0))),
    ];
    let best = best_report_match(&key, &reports, pre, post, day()).unwrap();
    assert_eq!(best.code, "CLOSE");

    // Pre-buffer admits a report that starts shortly after the completion.
    let later = [report("LATER", "Mists of Tirna Scithe", Some(at(1, 40)), Some(at(2, 0)))];
    assert_eq!(best_report_match(&key, &later, pre, post, day()).unwrap().code, "LATER");
    let too_late = [report("LATE", "Mists of Tirna Scithe", Some(at(1, 50)), Some(at(2, 0)))];
    assert!(best_report_match(&key, &too_late, pre, post, day()).is_none());

    // No end: [start, start + window].
    let open = [report("OPEN", "Mists of Tirna Scithe", Some(at(0, 0)), None)];
    assert_eq!(best_report_match(&key, &open, pre, post, day()).unwrap().code, "OPEN");
    assert!(best_report_match(&key, &open, pre, post, Duration::hours(1)).is_none());
}

struct FakeLogs {
    runs: Vec<CandidateRun>,
    reports: Vec<ReportSummary>,
    fail_for: Option<String>,
    run_calls: AtomicUsize,
    report_calls: AtomicUsize,
}

impl FakeLogs {
    fn new(runs: Vec<CandidateRun>) -> Self {
        Self {
            runs,
            reports: Vec::new(),
            fail_for: None,
            run_calls: AtomicUsize::new(0),
            report_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LogSource for FakeLogs {
    async fn fetch_character_runs(&self, character: &Character, _limit: usize) -> Result<Vec<CandidateRun>, LedgerError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for.as_deref() == Some(character.name.as_str()) {
            return Err(LedgerError::Upstream("503".into()));
        }
        Ok(self.runs.clone())
    }

    async fn fetch_reports_in_window(&self, filter: &ReportFilter) -> Result<Vec<ReportSummary>, LedgerError> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        assert!(filter.start.is_some() && filter.end.is_some());
        Ok(self.reports.clone())
    }
}

#[tokio::test]
async fn linker_matches_single_key() {
    let fake = Arc::new(FakeLogs::new(vec![run("ABC", 7, 10, at(1, 31), 1_320_500)]));
    let linker = Linker::new(fake.clone());
    let m = linker.match_key(&key10(), &CancellationToken::new()).await.unwrap().unwrap();
    assert_eq!(m.run.fight_id, 7);
    assert_eq!(fake.run_calls.load(Ordering::SeqCst), 1);

    let mut bad = key10();
    bad.completed_at = "garbage".into();
    assert!(linker.match_key(&bad, &CancellationToken::new()).await.unwrap_err().is_malformed());
}

#[tokio::test]
async fn linker_batches_by_character() {
    let mut fake = FakeLogs::new(vec![run("ABC", 7, 10, at(1, 31), 1_320_500)]);
    fake.fail_for = Some("thrall".into());
    let fake = Arc::new(fake);
    let linker = Linker::new(fake.clone());

    let mut second = key10();
    second.key_id = 5002;
    second.key_level = 12;
    let mut other = key10();
    other.character = "thrall".into();

    let outcome = linker
        .match_keys(&[key10(), second, other.clone()], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.run_calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.matches.len(), 1);
    assert_eq!(outcome.matches[0].key.key_id, 5001);
    assert_eq!(outcome.fetch_failed, vec![other]);
}

#[tokio::test]
async fn cancelled_linker_never_reaches_the_source() {
    let fake = Arc::new(FakeLogs::new(vec![run("ABC", 7, 10, at(1, 31), 1_320_500)]));
    let linker = Linker::new(fake.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(linker.match_key(&key10(), &cancel).await, Err(LedgerError::Cancelled)));
    assert!(matches!(linker.match_keys(&[key10()], &cancel).await, Err(LedgerError::Cancelled)));
    let store: SharedStore = Arc::new(KeyStore::in_memory().unwrap());
    assert!(matches!(
        linker.link_by_reports(&store, &[key10()], &cancel).await,
        Err(LedgerError::Cancelled)
    ));
    assert_eq!(fake.run_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fake.report_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn report_fallback_links_through_store() {
    let store: SharedStore = Arc::new(KeyStore::in_memory().unwrap());
    let key = key10();
    store.upsert_completed_key(&key).unwrap();

    let mut fake = FakeLogs::new(Vec::new());
    fake.reports = vec![report("RPT1", "Mists of Tirna Scithe", Some(at(1, 0)), Some(at(1, 45)))];
    let linker = Linker::new(Arc::new(fake));

    assert_eq!(linker.link_by_reports(&store, &[key.clone()], &CancellationToken::new()).await.unwrap(), 1);
    assert_eq!(linker.link_by_reports(&store, &[key.clone()], &CancellationToken::new()).await.unwrap(), 0);
    let links = store.list_links_for_key(&key).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].url, "https://www.warcraftlogs.com/reports/RPT1");

    // Nothing parseable: no query at all.
    let mut bad = key10();
    bad.completed_at = String::new();
    let idle = Arc::new(FakeLogs::new(Vec::new()));
    let linker = Linker::new(idle.clone());
    assert_eq!(linker.link_by_reports(&store, &[bad], &CancellationToken::new()).await.unwrap(), 0);
    assert_eq!(idle.report_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn persisted_match_is_idempotent() {
    let store: SharedStore = Arc::new(KeyStore::in_memory().unwrap());
    let key = key10();
    store.upsert_completed_key(&key).unwrap();
    let m = match_key_to_runs(&key, at(1, 30), &[run("ABC", 3, 10, at(1, 30), 0)], day()).unwrap();
    assert!(persist_match(&store, &m).await.unwrap());
    assert!(!persist_match(&store, &m).await.unwrap());
}
