//! Background retry for keys that were stored without a log link.
//!
//! Logs are often uploaded well after the key is finished, so the first
//! attempt at detection time frequently finds nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::epoch::{weekly_reset_at, Clock};
use crate::error::LedgerError;
use crate::matching::{persist_match, Linker};
use crate::{db_call, SharedStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub unlinked: usize,
    pub linked: usize,
    pub fetch_failed: usize,
    pub linked_by_report: usize,
}

pub struct Relinker {
    store: SharedStore,
    linker: Arc<Linker>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Relinker {
    pub fn new(store: SharedStore, linker: Arc<Linker>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            linker,
            clock,
            interval,
        }
    }

    /// Retry per-fight matching for every unlinked key since the cutoff.
    /// Keys whose character fetch failed go to the report fallback when a
    /// report filter is configured. Returns `Cancelled` as soon as the token
    /// fires, even mid-fetch.
    pub async fn sweep_once(&self, cancel: &CancellationToken) -> Result<SweepStats, LedgerError> {
        let cutoff = weekly_reset_at(self.clock.now());
        let keys = db_call(&self.store, move |s| s.list_unlinked_keys_since(cutoff)).await?;
        let mut stats = SweepStats {
            unlinked: keys.len(),
            ..SweepStats::default()
        };
        if keys.is_empty() {
            debug!("no unlinked keys");
            return Ok(stats);
        }

        let outcome = self.linker.match_keys(&keys, cancel).await?;
        for m in &outcome.matches {
            match persist_match(&self.store, m).await {
                Ok(true) => {
                    stats.linked += 1;
                    info!(
                        key_id = m.key.resolved_id(),
                        report = %m.run.report_code,
                        fight = m.run.fight_id,
                        confidence = m.confidence,
                        "log link created"
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(key_id = m.key.resolved_id(), error = %e, "log link store failed"),
            }
        }

        stats.fetch_failed = outcome.fetch_failed.len();
        if !outcome.fetch_failed.is_empty() && self.linker.filter.is_scoped() {
            match self.linker.link_by_reports(&self.store, &outcome.fetch_failed, cancel).await {
                Ok(n) => stats.linked_by_report = n,
                Err(LedgerError::Cancelled) => return Err(LedgerError::Cancelled),
                Err(e) => warn!(error = %e, "report fallback failed"),
            }
        }

        info!(
            unlinked = stats.unlinked,
            linked = stats.linked,
            fetch_failed = stats.fetch_failed,
            linked_by_report = stats.linked_by_report,
            "relink sweep complete"
        );
        Ok(stats)
    }

    /// Sweep now, then every interval, until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "relink sweep starting");
            loop {
                match self.sweep_once(&cancel).await {
                    Ok(_) => {}
                    Err(LedgerError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "relink sweep failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
            debug!("relink sweep stopped");
        })
    }
}
