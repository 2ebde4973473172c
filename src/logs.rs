//! Combat-log source: per-character fight history and time-windowed report
//! listings, behind a GraphQL API that wants a client-credentials bearer token.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::db::Character;
use crate::error::LedgerError;
use crate::thresholds;

const DEFAULT_GRAPHQL_URL: &str = "https://www.warcraftlogs.com/api/v2/client";
const DEFAULT_TOKEN_URL: &str = "https://www.warcraftlogs.com/oauth/token";
const LOGS_TIMEOUT: Duration = Duration::from_secs(15);

fn upstream(msg: impl Into<String>) -> LedgerError {
    LedgerError::Upstream(msg.into())
}

/// One fight pulled live from the log source. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRun {
    pub report_code: String,
    pub fight_id: i64,
    pub dungeon: String,
    pub key_level: i32,
    pub completed_at: DateTime<Utc>,
    /// Timed keystone duration; 0 when the source did not report one.
    pub elapsed_ms: i64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub code: String,
    pub title: String,
    pub zone_name: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Scope for a report listing. Guild and server narrow the search; the time
/// bounds are filled in per query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportFilter {
    pub guild_name: Option<String>,
    pub server_slug: Option<String>,
    pub server_region: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl ReportFilter {
    /// True when the filter names something to search beyond a time range.
    pub fn is_scoped(&self) -> bool {
        self.guild_name.is_some() || self.server_slug.is_some()
    }

    pub fn with_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Keystone fights from the character's most recent `limit` reports.
    async fn fetch_character_runs(
        &self,
        character: &Character,
        limit: usize,
    ) -> Result<Vec<CandidateRun>, LedgerError>;

    async fn fetch_reports_in_window(
        &self,
        filter: &ReportFilter,
    ) -> Result<Vec<ReportSummary>, LedgerError>;
}

/// Realm display name to the API's server slug.
pub fn server_slug(realm: &str) -> String {
    realm
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '-' | ' '))
        .collect()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Clone)]
pub struct LogClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub graphql_url: String,
    pub token_url: String,
    pub user_agent: Option<String>,
}

impl LogClientConfig {
    /// Returns `None` unless both `KEYLEDGER_LOGS_CLIENT_ID` and
    /// `KEYLEDGER_LOGS_CLIENT_SECRET` are set.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("KEYLEDGER_LOGS_CLIENT_ID").ok().filter(|v| !v.is_empty())?;
        let client_secret = std::env::var("KEYLEDGER_LOGS_CLIENT_SECRET").ok().filter(|v| !v.is_empty())?;
        Some(Self {
            client_id,
            client_secret,
            graphql_url: std::env::var("KEYLEDGER_LOGS_GRAPHQL_URL")
                .unwrap_or_else(|_| DEFAULT_GRAPHQL_URL.into()),
            token_url: std::env::var("KEYLEDGER_LOGS_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_TOKEN_URL.into()),
            user_agent: std::env::var("KEYLEDGER_USER_AGENT").ok(),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn new(value: String, expires_in: Option<u64>, now: Instant) -> Self {
        let ttl = expires_in
            .filter(|s| *s > 0)
            .unwrap_or(thresholds::TOKEN_DEFAULT_TTL_SECS);
        Self {
            value,
            expires_at: now + Duration::from_secs(ttl),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now + Duration::from_secs(thresholds::TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Value>,
}

pub struct HttpLogClient {
    cfg: LogClientConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl HttpLogClient {
    pub fn new(cfg: LogClientConfig) -> Result<Self, LedgerError> {
        let mut builder = reqwest::Client::builder().timeout(LOGS_TIMEOUT);
        if let Some(ua) = &cfg.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        let client = builder
            .build()
            .map_err(|e| LedgerError::Internal(format!("log client build failed: {e}")))?;
        Ok(Self {
            cfg,
            client,
            token: Mutex::new(None),
        })
    }

    /// Cached bearer token, exchanged again once it is within the refresh
    /// margin of expiry. The lock is held across the exchange so concurrent
    /// callers share one refresh.
    async fn bearer(&self) -> Result<String, LedgerError> {
        let mut slot = self.token.lock().await;
        if let Some(tok) = slot.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(tok.value.clone());
        }
        let resp = self
            .client
            .post(&self.cfg.token_url)
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .header("Accept", "application/json")
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| upstream(format!("token request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(upstream(format!("token endpoint returned {status}: {body}")));
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| upstream(format!("token response parse failed: {e}")))?;
        if parsed.access_token.is_empty() {
            return Err(upstream("token endpoint returned an empty access token"));
        }
        let tok = CachedToken::new(parsed.access_token, parsed.expires_in, Instant::now());
        debug!(expires_in = ?parsed.expires_in, "log source token refreshed");
        let value = tok.value.clone();
        *slot = Some(tok);
        Ok(value)
    }

    /// Run a GraphQL query and return its `data` member.
    pub async fn query(&self, query: &str, variables: Value) -> Result<Value, LedgerError> {
        if query.trim().is_empty() {
            return Err(LedgerError::Validation("query is empty".into()));
        }
        let token = self.bearer().await?;
        let resp = self
            .client
            .post(&self.cfg.graphql_url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| upstream(format!("log query failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(upstream(format!("log source returned {status}: {body}")));
        }
        let envelope: GraphQlEnvelope = resp
            .json()
            .await
            .map_err(|e| upstream(format!("log response parse failed: {e}")))?;
        if let Some(errors) = envelope.errors.filter(|e| !e.is_null()) {
            return Err(upstream(format!("graphql errors: {errors}")));
        }
        Ok(envelope.data.unwrap_or(Value::Null))
    }
}

const CHARACTER_RUNS_QUERY: &str = r#"
query($name: String!, $serverSlug: String!, $serverRegion: String!, $limit: Int!) {
  characterData {
    character(name: $name, serverSlug: $serverSlug, serverRegion: $serverRegion) {
      recentReports(limit: $limit) {
        data {
          code
          startTime
          fights { id name keystoneLevel keystoneTime endTime kill }
        }
      }
    }
  }
}
"#;

const REPORTS_QUERY: &str = r#"
query Reports($startTime: Float!, $endTime: Float!, $guildName: String, $guildServerSlug: String, $guildServerRegion: String, $limit: Int) {
  reportData {
    reports(startTime: $startTime, endTime: $endTime, guildName: $guildName, guildServerSlug: $guildServerSlug, guildServerRegion: $guildServerRegion, limit: $limit) {
      data { code title startTime endTime zone { name } }
    }
  }
}
"#;

#[derive(Deserialize)]
struct RunsData {
    #[serde(rename = "characterData")]
    character_data: CharacterData,
}

#[derive(Deserialize)]
struct CharacterData {
    character: Option<RecentReportsHolder>,
}

#[derive(Deserialize)]
struct RecentReportsHolder {
    #[serde(rename = "recentReports")]
    recent_reports: Page<RunReport>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RunReport {
    code: String,
    #[serde(rename = "startTime", default)]
    start_time: i64,
    #[serde(default)]
    fights: Vec<Fight>,
}

#[derive(Deserialize)]
struct Fight {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(rename = "keystoneLevel")]
    keystone_level: Option<i32>,
    #[serde(rename = "keystoneTime")]
    keystone_time: Option<i64>,
    #[serde(rename = "endTime", default)]
    end_time: i64,
    kill: Option<bool>,
}

/// Flatten a character-runs response into keystone fights. Fights without a
/// keystone level are not dungeon keys and are dropped; completion time is
/// the report start plus the fight's end offset.
fn runs_from_data(data: Value, who: &Character) -> Result<Vec<CandidateRun>, LedgerError> {
    let parsed: RunsData = serde_json::from_value(data)
        .map_err(|e| upstream(format!("character runs parse failed: {e}")))?;
    let holder = parsed
        .character_data
        .character
        .ok_or_else(|| LedgerError::NotFound(format!("log character {who}")))?;
    let mut runs = Vec::new();
    for report in holder.recent_reports.data {
        for fight in report.fights {
            let Some(level) = fight.keystone_level.filter(|l| *l != 0) else {
                continue;
            };
            let Some(completed_at) = from_millis(report.start_time + fight.end_time) else {
                continue;
            };
            runs.push(CandidateRun {
                report_code: report.code.clone(),
                fight_id: fight.id,
                dungeon: fight.name,
                key_level: level,
                completed_at,
                elapsed_ms: fight.keystone_time.unwrap_or(0),
                success: fight.kill.unwrap_or(false),
            });
        }
    }
    Ok(runs)
}

#[derive(Deserialize)]
struct ReportsData {
    #[serde(rename = "reportData")]
    report_data: ReportsHolder,
}

#[derive(Deserialize)]
struct ReportsHolder {
    reports: Page<ReportRow>,
}

#[derive(Deserialize)]
struct ReportRow {
    #[serde(default)]
    code: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "startTime", default)]
    start_time: i64,
    #[serde(rename = "endTime", default)]
    end_time: i64,
    zone: Option<Zone>,
}

#[derive(Deserialize)]
struct Zone {
    #[serde(default)]
    name: String,
}

fn reports_from_data(data: Value) -> Result<Vec<ReportSummary>, LedgerError> {
    let parsed: ReportsData = serde_json::from_value(data)
        .map_err(|e| upstream(format!("reports parse failed: {e}")))?;
    Ok(parsed
        .report_data
        .reports
        .data
        .into_iter()
        .map(|r| ReportSummary {
            code: r.code,
            title: r.title,
            zone_name: r.zone.map(|z| z.name).unwrap_or_default(),
            start: from_millis(r.start_time),
            end: from_millis(r.end_time),
        })
        .collect())
}

fn report_variables(filter: &ReportFilter) -> Result<Value, LedgerError> {
    let (Some(start), Some(end)) = (filter.start, filter.end) else {
        return Err(LedgerError::Validation("report window needs start and end".into()));
    };
    let mut vars = json!({
        "startTime": start.timestamp_millis() as f64,
        "endTime": end.timestamp_millis() as f64,
    });
    let optional = [
        ("guildName", filter.guild_name.as_ref().map(|v| json!(v))),
        ("guildServerSlug", filter.server_slug.as_ref().map(|v| json!(v))),
        ("guildServerRegion", filter.server_region.as_ref().map(|v| json!(v))),
        ("limit", filter.limit.filter(|l| *l > 0).map(|v| json!(v))),
    ];
    for (name, value) in optional {
        if let Some(v) = value {
            vars[name] = v;
        }
    }
    Ok(vars)
}

#[async_trait]
impl LogSource for HttpLogClient {
    async fn fetch_character_runs(
        &self,
        character: &Character,
        limit: usize,
    ) -> Result<Vec<CandidateRun>, LedgerError> {
        let limit = if limit == 0 { thresholds::CHARACTER_RUN_LIMIT } else { limit };
        let vars = json!({
            "name": character.name,
            "serverSlug": server_slug(&character.realm),
            "serverRegion": character.region.to_lowercase(),
            "limit": limit,
        });
        let data = self.query(CHARACTER_RUNS_QUERY, vars).await?;
        let runs = runs_from_data(data, character)?;
        debug!(character = %character, runs = runs.len(), "fetched log runs");
        Ok(runs)
    }

    async fn fetch_reports_in_window(
        &self,
        filter: &ReportFilter,
    ) -> Result<Vec<ReportSummary>, LedgerError> {
        let vars = report_variables(filter)?;
        let data = self.query(REPORTS_QUERY, vars).await?;
        reports_from_data(data)
    }
}
