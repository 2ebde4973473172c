//! Per-character polling.
//!
//! Each tracked character gets one task that owns its known-key set, so no
//! lock is shared across characters. All tasks draw from one semaphore that
//! caps simultaneous profile fetches, and all watch one cancellation token.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Character, CompletedKey};
use crate::epoch::{weekly_reset_at, Clock};
use crate::error::LedgerError;
use crate::matching::{persist_match, Linker};
use crate::notify::{format_announcement, NotificationSink};
use crate::profile::ProfileSource;
use crate::thresholds;
use crate::{db_call, SharedStore};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_concurrent: usize,
    /// Channel reference handed to the notification sink.
    pub notify_channel: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(thresholds::POLL_INTERVAL_SECS),
            max_concurrent: thresholds::MAX_CONCURRENT_FETCHES,
            notify_channel: "keys".into(),
        }
    }
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub fetched: usize,
    pub new_keys: usize,
    pub skipped_cutoff: usize,
    pub skipped_known: usize,
    pub malformed: usize,
    pub upsert_errors: usize,
    pub match_attempts: usize,
    pub links_created: usize,
}

/// Collaborators shared by every character task.
struct PollContext {
    store: SharedStore,
    profiles: Arc<dyn ProfileSource>,
    linker: Option<Arc<Linker>>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    cfg: SchedulerConfig,
}

/// One character's polling state. Owns its known-key set.
pub struct CharacterPoller {
    character: Character,
    known: HashSet<i64>,
    last_score: Option<f64>,
    ctx: Arc<PollContext>,
}

impl CharacterPoller {
    pub fn character(&self) -> &Character {
        &self.character
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    /// One fetch-filter-dedupe-persist-correlate pass. A fetch failure
    /// abandons the cycle; a bad record only skips itself.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<CycleStats, LedgerError> {
        let ctx = Arc::clone(&self.ctx);
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
            permit = ctx.permits.acquire() => permit
                .map_err(|_| LedgerError::Internal("fetch semaphore closed".into()))?,
        };

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
            r = ctx.profiles.fetch_weekly_completions(&self.character) => r,
        };
        let profile = match fetched {
            Ok(p) => p,
            Err(e) => {
                warn!(character = %self.character, error = %e, "profile fetch failed");
                return Err(e);
            }
        };

        let mut stats = CycleStats {
            fetched: profile.keys.len(),
            ..CycleStats::default()
        };
        self.refresh_score(profile.rating_score).await;

        let cutoff = weekly_reset_at(ctx.clock.now());
        for key in profile.keys {
            let completed = match key.completed_at_utc() {
                Ok(t) => t,
                Err(e) => {
                    warn!(character = %self.character, key_id = key.key_id, error = %e, "skipping malformed key");
                    stats.malformed += 1;
                    continue;
                }
            };
            if completed < cutoff {
                debug!(key_id = key.key_id, completed_at = %key.completed_at, "before cutoff");
                stats.skipped_cutoff += 1;
                continue;
            }
            let id = key.resolved_id();
            if self.known.contains(&id) {
                debug!(key_id = id, "already known");
                stats.skipped_known += 1;
                continue;
            }

            let row = key.clone();
            if let Err(e) = db_call(&ctx.store, move |s| s.upsert_completed_key(&row)).await {
                error!(character = %self.character, key_id = id, dungeon = %key.dungeon, error = %e, "key upsert failed");
                stats.upsert_errors += 1;
                continue;
            }
            info!(
                character = %self.character,
                dungeon = %key.dungeon,
                level = key.key_level,
                key_id = id,
                "new key completed"
            );
            self.announce(&key).await;
            self.known.insert(id);
            stats.new_keys += 1;

            if let Some(linker) = &ctx.linker {
                stats.match_attempts += 1;
                // Unlinked keys are retried by the relink sweep.
                if link_new_key(&ctx.store, linker, &key, cancel).await? {
                    stats.links_created += 1;
                }
            }
        }

        debug!(
            character = %self.character,
            fetched = stats.fetched,
            new_keys = stats.new_keys,
            skipped_cutoff = stats.skipped_cutoff,
            skipped_known = stats.skipped_known,
            upsert_errors = stats.upsert_errors,
            "poll cycle complete"
        );
        Ok(stats)
    }

    /// Store the rating when it moved since the last cycle.
    async fn refresh_score(&mut self, score: f64) {
        if self.last_score == Some(score) {
            return;
        }
        let who = self.character.clone();
        match db_call(&self.ctx.store, move |s| s.update_character_score(&who, score)).await {
            Ok(()) => self.last_score = Some(score),
            Err(e) => warn!(character = %self.character, error = %e, "score refresh failed"),
        }
    }

    async fn announce(&self, key: &CompletedKey) {
        let text = format_announcement(key);
        if let Err(e) = self.ctx.sink.send(&self.ctx.cfg.notify_channel, &text).await {
            warn!(character = %self.character, error = %e, "announcement failed");
        }
    }

    async fn run(mut self, initial_delay: Duration, cancel: CancellationToken) {
        if !initial_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
        }
        loop {
            match self.poll_once(&cancel).await {
                Ok(_) | Err(LedgerError::Cancelled) => {}
                // Already logged; the next interval retries.
                Err(e) if e.is_transient() => {}
                Err(e) => error!(character = %self.character, error = %e, "poll failed"),
            }
            let wait = self.ctx.cfg.interval + jitter(self.ctx.cfg.interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(character = %self.character, "character poller stopped");
    }
}

/// Match a freshly stored key and persist the link. Ok(true) when a link was
/// created; only cancellation is returned as an error.
async fn link_new_key(
    store: &SharedStore,
    linker: &Linker,
    key: &CompletedKey,
    cancel: &CancellationToken,
) -> Result<bool, LedgerError> {
    let found = match linker.match_key(key, cancel).await {
        Ok(found) => found,
        Err(LedgerError::Cancelled) => return Err(LedgerError::Cancelled),
        Err(e) => {
            warn!(key_id = key.resolved_id(), error = %e, "log match failed");
            return Ok(false);
        }
    };
    let Some(m) = found else { return Ok(false) };
    match persist_match(store, &m).await {
        Ok(created) => Ok(created),
        Err(e) => {
            warn!(key_id = key.resolved_id(), error = %e, "log link store failed");
            Ok(false)
        }
    }
}

/// Uniform in `[0, interval / JITTER_DIVISOR)`.
pub fn jitter(interval: Duration) -> Duration {
    let window = interval / thresholds::JITTER_DIVISOR;
    let nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

pub struct Scheduler {
    ctx: Arc<PollContext>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        store: SharedStore,
        profiles: Arc<dyn ProfileSource>,
        linker: Option<Arc<Linker>>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        cfg: SchedulerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));
        Self {
            ctx: Arc::new(PollContext {
                store,
                profiles,
                linker,
                sink,
                clock,
                permits,
                cfg,
            }),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Child of the scheduler's token; cancelled by [`Scheduler::stop`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Ensure the character row exists and load every key id it has
    /// completed since the current cutoff.
    pub async fn poller_for(&self, character: Character) -> Result<CharacterPoller, LedgerError> {
        let cutoff = weekly_reset_at(self.ctx.clock.now());
        let who = character.clone();
        let (existing, keys) = db_call(&self.ctx.store, move |s| {
            s.upsert_character(&who.region, &who.realm, &who.name)?;
            let existing = s.get_character(&who)?;
            let keys = s.list_keys_by_character_since(&who, cutoff)?;
            Ok((existing, keys))
        })
        .await?;
        let known: HashSet<i64> = keys.iter().map(CompletedKey::resolved_id).collect();
        debug!(character = %character, known = known.len(), "known keys loaded");
        Ok(CharacterPoller {
            character,
            known,
            last_score: existing.and_then(|c| c.rating_score),
            ctx: Arc::clone(&self.ctx),
        })
    }

    /// Launch one task per character, staggered across one interval.
    /// Fails before spawning anything if a known set cannot be loaded.
    pub async fn start(&mut self, characters: Vec<Character>) -> Result<(), LedgerError> {
        if characters.is_empty() {
            info!("scheduler start: no characters configured");
            return Ok(());
        }
        let mut pollers = Vec::with_capacity(characters.len());
        for character in characters {
            pollers.push(self.poller_for(character).await?);
        }

        let interval = self.ctx.cfg.interval;
        let step = interval / pollers.len() as u32;
        info!(
            characters = pollers.len(),
            interval_secs = interval.as_secs(),
            max_concurrent = self.ctx.cfg.max_concurrent,
            linking = self.ctx.linker.is_some(),
            "scheduler starting"
        );
        for (i, poller) in pollers.into_iter().enumerate() {
            let delay = step * i as u32;
            self.tasks.push(tokio::spawn(poller.run(delay, self.cancel.clone())));
        }
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every task and wait for all of them, bounded by `timeout`.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), LedgerError> {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        let n = tasks.len();
        match tokio::time::timeout(timeout, join_all(tasks)).await {
            Ok(results) => {
                for r in results {
                    if let Err(e) = r {
                        warn!(error = %e, "character task ended abnormally");
                    }
                }
                info!(tasks = n, "scheduler stopped");
                Ok(())
            }
            Err(_) => Err(LedgerError::Internal(format!(
                "{n} character tasks still running after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod scheduler_tests;
