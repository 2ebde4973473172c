//! keyledger: weekly dungeon-key tracker.
//! poll profiles → dedupe → persist → correlate with combat logs.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use keyledger::db::{Character, KeyStore};
use keyledger::epoch::{weekly_reset_at, Clock, SystemClock};
use keyledger::error::LedgerError;
use keyledger::logs::{HttpLogClient, LogClientConfig, ReportFilter};
use keyledger::matching::Linker;
use keyledger::notify::{LogSink, NotificationSink, WebhookSink};
use keyledger::profile::HttpProfileClient;
use keyledger::relink::Relinker;
use keyledger::scheduler::{Scheduler, SchedulerConfig};
use keyledger::{db_call, SharedStore};

#[derive(Parser)]
#[command(name = "keyledger", version, about = "Weekly dungeon-key tracker")]
struct Args {
    /// Snapshot file the in-memory store is restored from and flushed to
    #[arg(short, long, default_value = "keyledger.db", env = "KEYLEDGER_SNAPSHOT")]
    snapshot: PathBuf,

    /// Roster as region/realm/name, comma separated
    #[arg(short, long, env = "KEYLEDGER_CHARACTERS", value_delimiter = ',')]
    characters: Vec<String>,

    #[arg(long, default_value = "300", env = "KEYLEDGER_POLL_INTERVAL_SECS")]
    poll_interval_secs: u64,

    #[arg(long, default_value = "4", env = "KEYLEDGER_MAX_CONCURRENT")]
    max_concurrent: usize,

    #[arg(long, default_value = "5000", env = "KEYLEDGER_FLUSH_DEBOUNCE_MS")]
    flush_debounce_ms: u64,

    /// Max distance between a key and a log fight
    #[arg(long, default_value = "24", env = "KEYLEDGER_MATCH_WINDOW_HOURS")]
    match_window_hours: i64,

    #[arg(long, default_value = "300", env = "KEYLEDGER_RELINK_INTERVAL_SECS")]
    relink_interval_secs: u64,

    #[arg(long, default_value = "30", env = "KEYLEDGER_SHUTDOWN_TIMEOUT_SECS")]
    shutdown_timeout_secs: u64,

    /// Profile API base URL
    #[arg(long, env = "KEYLEDGER_PROFILE_URL")]
    profile_url: Option<String>,

    #[arg(long, default_value = "keys", env = "KEYLEDGER_NOTIFY_CHANNEL")]
    notify_channel: String,

    /// Post announcements here instead of only logging them
    #[arg(long, env = "KEYLEDGER_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Guild scope for the report-window fallback
    #[arg(long, env = "KEYLEDGER_GUILD_NAME")]
    guild_name: Option<String>,

    #[arg(long, env = "KEYLEDGER_GUILD_SERVER")]
    guild_server: Option<String>,

    #[arg(long, env = "KEYLEDGER_GUILD_REGION")]
    guild_region: Option<String>,

    /// Drop keys from before the current weekly reset on startup
    #[arg(long, env = "KEYLEDGER_ARCHIVE_ON_START")]
    archive_on_start: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "keyledger failed");
        std::process::exit(1);
    }
}

/// Configured entries first, then stored characters not already listed.
fn merge_roster(configured: &[String], stored: Vec<Character>) -> Result<Vec<Character>, LedgerError> {
    let mut seen = HashSet::new();
    let mut roster = Vec::new();
    for entry in configured.iter().filter(|e| !e.trim().is_empty()) {
        let c = Character::parse(entry)?;
        if seen.insert(c.key()) {
            roster.push(c);
        }
    }
    for c in stored {
        if seen.insert(c.key()) {
            roster.push(c);
        }
    }
    Ok(roster)
}

fn report_filter(args: &Args) -> ReportFilter {
    ReportFilter {
        guild_name: args.guild_name.clone(),
        server_slug: args.guild_server.as_deref().map(keyledger::logs::server_slug),
        server_region: args.guild_region.as_ref().map(|r| r.to_lowercase()),
        ..ReportFilter::default()
    }
}

async fn run(args: Args) -> Result<(), LedgerError> {
    let store: SharedStore = Arc::new(KeyStore::open(Some(&args.snapshot))?);
    let flusher = store.start_flusher(Duration::from_millis(args.flush_debounce_ms));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if args.archive_on_start {
        let cutoff = weekly_reset_at(clock.now());
        let n = db_call(&store, move |s| s.archive_keys_before(cutoff)).await?;
        info!(archived = n, cutoff = %cutoff, "archived previous weeks");
    }

    let stored = db_call(&store, |s| s.list_characters()).await?;
    let roster = merge_roster(&args.characters, stored)?;

    let profiles = Arc::new(HttpProfileClient::new(args.profile_url.clone(), None)?);
    let linker = match LogClientConfig::from_env() {
        Some(cfg) => {
            let client = Arc::new(HttpLogClient::new(cfg)?);
            let linker = Linker::new(client)
                .with_window(chrono::Duration::hours(args.match_window_hours))
                .with_filter(report_filter(&args));
            Some(Arc::new(linker))
        }
        None => None,
    };
    let sink: Arc<dyn NotificationSink> = match &args.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone())?),
        None => Arc::new(LogSink),
    };

    let linking = if linker.is_some() { "enabled" } else { "disabled" };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        snapshot = %args.snapshot.display(),
        characters = roster.len(),
        linking,
        webhook = args.webhook_url.is_some(),
        "keyledger starting"
    );

    let cfg = SchedulerConfig {
        interval: Duration::from_secs(args.poll_interval_secs),
        max_concurrent: args.max_concurrent,
        notify_channel: args.notify_channel.clone(),
    };
    let mut scheduler = Scheduler::new(
        Arc::clone(&store),
        profiles,
        linker.clone(),
        sink,
        Arc::clone(&clock),
        cfg,
    );
    scheduler.start(roster).await?;

    let relink = linker.map(|linker| {
        Relinker::new(
            Arc::clone(&store),
            linker,
            Arc::clone(&clock),
            Duration::from_secs(args.relink_interval_secs),
        )
        .spawn(scheduler.cancel_token())
    });

    shutdown_signal().await;

    // One budget for the whole teardown; each step gets what is left.
    let deadline = Instant::now() + Duration::from_secs(args.shutdown_timeout_secs);
    if let Err(e) = scheduler.stop(remaining(deadline)).await {
        warn!(error = %e, "scheduler did not stop cleanly");
    }
    if let Some(handle) = relink {
        if tokio::time::timeout_at(deadline, handle).await.is_err() {
            warn!("relink sweep did not stop in time");
        }
    }
    match flusher.shutdown(remaining(deadline)).await {
        Ok(true) => info!("final snapshot flushed"),
        Ok(false) => {}
        Err(e) => error!(error = %e, "final snapshot flush failed"),
    }
    store.close();
    info!("keyledger stopped");
    Ok(())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_merges_without_duplicates() {
        let configured = vec!["US/Illidan/Arthas".to_string(), " ".to_string(), "eu/draenor/jaina".to_string()];
        let stored = vec![
            Character::new("us", "illidan", "arthas"),
            Character::new("us", "stormrage", "thrall"),
        ];
        let roster = merge_roster(&configured, stored).unwrap();
        let keys: Vec<String> = roster.iter().map(Character::key).collect();
        assert_eq!(keys, vec!["us|illidan|arthas", "eu|draenor|jaina", "us|stormrage|thrall"]);
    }

    #[test]
    fn shutdown_budget_shrinks_and_bottoms_out() {
        let now = Instant::now();
        let left = remaining(now + Duration::from_secs(30));
        assert!(left <= Duration::from_secs(30));
        assert!(left > Duration::from_secs(29));
        assert_eq!(remaining(now - Duration::from_millis(1)), Duration::ZERO);
    }

    #[test]
    fn bad_roster_entry_is_rejected() {
        assert!(merge_roster(&["arthas".to_string()], Vec::new()).is_err());
    }
}
