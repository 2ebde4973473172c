use super::*;
use crate::db::KeyStore;
use crate::epoch::FixedClock;
use crate::logs::{CandidateRun, LogSource, ReportFilter, ReportSummary};
use crate::profile::ProfileResult;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

// Thursday; the cutoff is Tuesday 2026-02-03 15:00 UTC.
fn clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 2, 5, 12, 0, 0).unwrap()))
}

fn arthas() -> Character {
    Character::new("us", "illidan", "arthas")
}

fn key(id: i64, completed_at: &str) -> CompletedKey {
    CompletedKey {
        key_id: id,
        character: "arthas".into(),
        region: "us".into(),
        realm: "illidan".into(),
        dungeon: "Mists of Tirna Scithe".into(),
        key_level: 10,
        run_time_ms: 1_320_000,
        par_time_ms: 1_500_000,
        completed_at: completed_at.into(),
        source: "raiderio".into(),
    }
}

#[derive(Default)]
struct FakeProfiles {
    keys: Vec<CompletedKey>,
    score: f64,
    delay: Duration,
    hang: bool,
    fail: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl ProfileSource for FakeProfiles {
    async fn fetch_weekly_completions(&self, character: &Character) -> Result<ProfileResult, LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            return Err(LedgerError::Upstream("502 bad gateway".into()));
        }
        let keys = self
            .keys
            .iter()
            .cloned()
            .map(|mut k| {
                k.character = character.name.clone();
                k
            })
            .collect();
        Ok(ProfileResult { keys, rating_score: self.score })
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, channel: &str, text: &str) -> Result<(), LedgerError> {
        self.sent.lock().push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

struct OneRunLogs {
    calls: AtomicUsize,
}

#[async_trait]
impl LogSource for OneRunLogs {
    async fn fetch_character_runs(&self, _c: &Character, _limit: usize) -> Result<Vec<CandidateRun>, LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![CandidateRun {
            report_code: "ABC123".into(),
            fight_id: 4,
            dungeon: "Mists of Tirna Scithe".into(),
            key_level: 10,
            completed_at: Utc.with_ymd_and_hms(2026, 2, 4, 1, 24, 0).unwrap(),
            elapsed_ms: 1_321_000,
            success: true,
        }])
    }

    async fn fetch_reports_in_window(&self, _f: &ReportFilter) -> Result<Vec<ReportSummary>, LedgerError> {
        Ok(Vec::new())
    }
}

fn scheduler(
    store: &SharedStore,
    profiles: Arc<FakeProfiles>,
    linker: Option<Arc<Linker>>,
    sink: Arc<RecordingSink>,
    cfg: SchedulerConfig,
) -> Scheduler {
    Scheduler::new(Arc::clone(store), profiles, linker, sink, clock(), cfg)
}

fn new_store() -> SharedStore {
    Arc::new(KeyStore::in_memory().unwrap())
}

#[tokio::test]
async fn second_identical_cycle_writes_nothing() {
    let store = new_store();
    let profiles = Arc::new(FakeProfiles {
        keys: vec![key(0, "2026-02-04T01:23:45Z")],
        score: 2875.0,
        ..Default::default()
    });
    let logs = Arc::new(OneRunLogs { calls: AtomicUsize::new(0) });
    let linker = Arc::new(Linker::new(logs.clone()));
    let sink = Arc::new(RecordingSink::default());
    let sched = scheduler(&store, profiles, Some(linker), sink.clone(), SchedulerConfig::default());
    let cancel = sched.cancel_token();

    let mut poller = sched.poller_for(arthas()).await.unwrap();
    assert_eq!(poller.known_len(), 0);

    let first = poller.poll_once(&cancel).await.unwrap();
    assert_eq!(first.new_keys, 1);
    assert_eq!(first.match_attempts, 1);
    assert_eq!(first.links_created, 1);

    let writes_before = store.mutation_count();
    let second = poller.poll_once(&cancel).await.unwrap();
    assert_eq!(store.mutation_count(), writes_before);
    assert_eq!(
        second,
        CycleStats {
            fetched: 1,
            skipped_known: 1,
            ..CycleStats::default()
        }
    );
    assert_eq!(logs.calls.load(Ordering::SeqCst), 1);

    let cutoff = weekly_reset_at(clock().now());
    assert_eq!(store.list_keys_since(cutoff).unwrap().len(), 1);
    let stored = &store.list_keys_since(cutoff).unwrap()[0];
    assert_eq!(store.list_links_for_key(stored).unwrap().len(), 1);
    assert_eq!(store.get_character(&arthas()).unwrap().unwrap().rating_score, Some(2875.0));

    let sent = sink.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "keys");
    assert_eq!(sent[0].1, "arthas +10 Mists of Tirna Scithe (-3 min vs par)");
}

struct HangingLogs {
    calls: AtomicUsize,
}

#[async_trait]
impl LogSource for HangingLogs {
    async fn fetch_character_runs(&self, _c: &Character, _limit: usize) -> Result<Vec<CandidateRun>, LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }

    async fn fetch_reports_in_window(&self, _f: &ReportFilter) -> Result<Vec<ReportSummary>, LedgerError> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn cancel_interrupts_hung_log_match() {
    let store = new_store();
    let profiles = Arc::new(FakeProfiles {
        keys: vec![key(0, "2026-02-04T01:23:45Z")],
        ..Default::default()
    });
    let logs = Arc::new(HangingLogs { calls: AtomicUsize::new(0) });
    let linker = Arc::new(Linker::new(logs.clone()));
    let sched = scheduler(&store, profiles, Some(linker), Arc::new(RecordingSink::default()), SchedulerConfig::default());
    let mut poller = sched.poller_for(arthas()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(1), poller.poll_once(&cancel))
        .await
        .unwrap();
    assert!(matches!(result, Err(LedgerError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(logs.calls.load(Ordering::SeqCst), 1);

    // The key was stored before matching began, so it is not fetched again as new.
    assert_eq!(poller.known_len(), 1);
    assert_eq!(store.list_keys_since(weekly_reset_at(clock().now())).unwrap().len(), 1);
}

#[tokio::test]
async fn known_set_survives_restart() {
    let store = new_store();
    store.upsert_completed_key(&key(0, "2026-02-04T01:23:45Z")).unwrap();
    // Last week's key is not part of the known set.
    store.upsert_completed_key(&key(77, "2026-01-30T10:00:00Z")).unwrap();

    let profiles = Arc::new(FakeProfiles {
        keys: vec![key(0, "2026-02-04T01:23:45Z")],
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let sched = scheduler(&store, profiles, None, sink.clone(), SchedulerConfig::default());
    let mut poller = sched.poller_for(arthas()).await.unwrap();
    assert_eq!(poller.known_len(), 1);

    let stats = poller.poll_once(&sched.cancel_token()).await.unwrap();
    assert_eq!(stats.skipped_known, 1);
    assert_eq!(stats.new_keys, 0);
    assert!(sink.sent.lock().is_empty());
}

#[tokio::test]
async fn bad_records_skip_only_themselves() {
    let store = new_store();
    let mut zero_level = key(3, "2026-02-04T05:00:00Z");
    zero_level.key_level = 0;
    let profiles = Arc::new(FakeProfiles {
        keys: vec![
            key(1, "not-a-timestamp"),
            key(2, "2026-02-02T10:00:00Z"),
            zero_level,
            key(4, "2026-02-04T06:00:00Z"),
        ],
        ..Default::default()
    });
    let sched = scheduler(&store, profiles, None, Arc::new(RecordingSink::default()), SchedulerConfig::default());
    let mut poller = sched.poller_for(arthas()).await.unwrap();

    let stats = poller.poll_once(&sched.cancel_token()).await.unwrap();
    assert_eq!(stats.fetched, 4);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.skipped_cutoff, 1);
    assert_eq!(stats.upsert_errors, 1);
    assert_eq!(stats.new_keys, 1);
    assert_eq!(stats.match_attempts, 0);

    // The failed key is retried next cycle rather than remembered.
    let again = poller.poll_once(&sched.cancel_token()).await.unwrap();
    assert_eq!(again.upsert_errors, 1);
    assert_eq!(again.skipped_known, 1);
}

#[tokio::test]
async fn fetch_failure_abandons_cycle() {
    let store = new_store();
    let profiles = Arc::new(FakeProfiles {
        keys: vec![key(1, "2026-02-04T06:00:00Z")],
        fail: true,
        ..Default::default()
    });
    let sched = scheduler(&store, profiles, None, Arc::new(RecordingSink::default()), SchedulerConfig::default());
    let mut poller = sched.poller_for(arthas()).await.unwrap();
    let err = poller.poll_once(&sched.cancel_token()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(store.list_keys_since(weekly_reset_at(clock().now())).unwrap().len(), 0);
}

#[tokio::test]
async fn cancelled_token_short_circuits_poll() {
    let store = new_store();
    let profiles = Arc::new(FakeProfiles::default());
    let sched = scheduler(&store, profiles.clone(), None, Arc::new(RecordingSink::default()), SchedulerConfig::default());
    let mut poller = sched.poller_for(arthas()).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(poller.poll_once(&cancel).await, Err(LedgerError::Cancelled)));
    assert_eq!(profiles.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fetches_never_exceed_semaphore() {
    let store = new_store();
    let profiles = Arc::new(FakeProfiles {
        keys: vec![key(0, "2026-02-04T06:00:00Z")],
        delay: Duration::from_millis(25),
        ..Default::default()
    });
    let cfg = SchedulerConfig {
        interval: Duration::from_millis(40),
        max_concurrent: 2,
        ..SchedulerConfig::default()
    };
    let mut sched = scheduler(&store, profiles.clone(), None, Arc::new(RecordingSink::default()), cfg);
    let roster: Vec<Character> = (0..8)
        .map(|i| Character::new("us", "illidan", &format!("alt{i}")))
        .collect();
    sched.start(roster).await.unwrap();
    assert_eq!(sched.task_count(), 8);

    tokio::time::sleep(Duration::from_millis(400)).await;
    sched.stop(Duration::from_secs(2)).await.unwrap();

    assert!(profiles.calls.load(Ordering::SeqCst) >= 8);
    let peak = profiles.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak in-flight fetches {peak}");
    assert_eq!(store.list_characters().unwrap().len(), 8);
}

#[tokio::test]
async fn stop_interrupts_hung_fetches() {
    let store = new_store();
    let profiles = Arc::new(FakeProfiles {
        hang: true,
        ..Default::default()
    });
    let cfg = SchedulerConfig {
        interval: Duration::from_millis(10),
        max_concurrent: 1,
        ..SchedulerConfig::default()
    };
    let mut sched = scheduler(&store, profiles.clone(), None, Arc::new(RecordingSink::default()), cfg);
    sched
        .start(vec![arthas(), Character::new("us", "illidan", "thrall")])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One task is parked in the fetch, the other on the semaphore.
    assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
    let started = std::time::Instant::now();
    sched.stop(Duration::from_secs(1)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(sched.task_count(), 0);
}

#[tokio::test]
async fn empty_roster_starts_nothing() {
    let store = new_store();
    let mut sched = scheduler(
        &store,
        Arc::new(FakeProfiles::default()),
        None,
        Arc::new(RecordingSink::default()),
        SchedulerConfig::default(),
    );
    sched.start(Vec::new()).await.unwrap();
    assert_eq!(sched.task_count(), 0);
    sched.stop(Duration::from_millis(10)).await.unwrap();
}

#[test]
fn jitter_bounds() {
    let interval = Duration::from_secs(300);
    for _ in 0..200 {
        assert!(jitter(interval) < Duration::from_secs(30));
    }
    assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
}
