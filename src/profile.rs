//! Profile source: a character's weekly key completions and season rating.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::db::{fold, Character, CompletedKey};
use crate::error::LedgerError;

pub const PROFILE_SOURCE_TAG: &str = "raiderio";
const DEFAULT_BASE_URL: &str = "https://raider.io";
const PROFILE_PATH: &str = "/api/v1/characters/profile";
const PROFILE_FIELDS: &str = "mythic_plus_weekly_highest_level_runs,mythic_plus_scores_by_season:current";
const PROFILE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileResult {
    pub keys: Vec<CompletedKey>,
    /// Current season overall rating; 0 when the profile has none.
    pub rating_score: f64,
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_weekly_completions(&self, character: &Character) -> Result<ProfileResult, LedgerError>;
}

#[derive(Deserialize)]
struct ProfileResponse {
    #[serde(rename = "mythic_plus_weekly_highest_level_runs", default)]
    weekly_runs: Vec<WeeklyRun>,
    #[serde(rename = "mythic_plus_scores_by_season", default)]
    scores: Vec<SeasonScore>,
}

#[derive(Deserialize)]
struct SeasonScore {
    scores: ScoreValues,
}

#[derive(Deserialize)]
struct ScoreValues {
    #[serde(default)]
    all: f64,
}

#[derive(Deserialize)]
struct WeeklyRun {
    #[serde(rename = "keystone_run_id", default)]
    run_id: i64,
    #[serde(default)]
    dungeon: String,
    #[serde(rename = "mythic_level", default)]
    level: i32,
    #[serde(rename = "clear_time_ms", default)]
    clear_time_ms: i64,
    #[serde(rename = "par_time_ms", default)]
    par_time_ms: i64,
    #[serde(default)]
    completed_at: String,
}

fn into_result(resp: ProfileResponse, who: &Character) -> ProfileResult {
    let keys = resp
        .weekly_runs
        .into_iter()
        .map(|run| CompletedKey {
            key_id: run.run_id,
            character: fold(&who.name),
            region: fold(&who.region),
            realm: fold(&who.realm),
            dungeon: run.dungeon,
            key_level: run.level,
            run_time_ms: run.clear_time_ms,
            par_time_ms: run.par_time_ms,
            completed_at: run.completed_at,
            source: PROFILE_SOURCE_TAG.into(),
        })
        .collect();
    let rating_score = resp.scores.first().map(|s| s.scores.all).unwrap_or(0.0);
    ProfileResult { keys, rating_score }
}

pub struct HttpProfileClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProfileClient {
    /// `base_url` defaults to the public profile site when `None`.
    pub fn new(base_url: Option<String>, user_agent: Option<&str>) -> Result<Self, LedgerError> {
        let mut builder = reqwest::Client::builder().timeout(PROFILE_TIMEOUT);
        if let Some(ua) = user_agent {
            builder = builder.user_agent(ua.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| LedgerError::Internal(format!("profile client build failed: {e}")))?;
        let base_url = base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ProfileSource for HttpProfileClient {
    async fn fetch_weekly_completions(&self, character: &Character) -> Result<ProfileResult, LedgerError> {
        let url = format!("{}{PROFILE_PATH}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("region", character.region.as_str()),
                ("realm", character.realm.as_str()),
                ("name", character.name.as_str()),
                ("fields", PROFILE_FIELDS),
            ])
            .send()
            .await
            .map_err(|e| LedgerError::Upstream(format!("profile request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Upstream(format!("profile returned {status}: {body}")));
        }
        let parsed: ProfileResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Upstream(format!("profile parse failed: {e}")))?;
        let result = into_result(parsed, character);
        debug!(character = %character, runs = result.keys.len(), score = result.rating_score, "fetched profile");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_weekly_runs() {
        let body = r#"{
            "name": "Arthas",
            "mythic_plus_weekly_highest_level_runs": [
                {"keystone_run_id": 991, "dungeon": "Mists of Tirna Scithe", "mythic_level": 10,
                 "clear_time_ms": 1320000, "par_time_ms": 1500000,
                 "completed_at": "2026-02-04T01:23:45.000Z"},
                {"dungeon": "The Necrotic Wake", "mythic_level": 8,
                 "completed_at": "2026-02-05T20:00:00Z"}
            ],
            "mythic_plus_scores_by_season": [{"season": "current", "scores": {"all": 2875.4, "dps": 2875.4}}]
        }"#;
        let resp: ProfileResponse = serde_json::from_str(body).unwrap();
        let who = Character::new("US", "Illidan", "Arthas");
        let result = into_result(resp, &who);

        assert_eq!(result.rating_score, 2875.4);
        assert_eq!(result.keys.len(), 2);
        let first = &result.keys[0];
        assert_eq!(first.key_id, 991);
        assert_eq!(first.character, "arthas");
        assert_eq!(first.region, "us");
        assert_eq!(first.source, "raiderio");
        assert_eq!(first.run_time_ms, 1_320_000);
        assert_eq!(result.keys[1].key_id, 0);
        assert_eq!(result.keys[1].par_time_ms, 0);
    }

    #[test]
    fn missing_sections_mean_empty() {
        let resp: ProfileResponse = serde_json::from_str("{}").unwrap();
        let result = into_result(resp, &Character::new("eu", "draenor", "jaina"));
        assert!(result.keys.is_empty());
        assert_eq!(result.rating_score, 0.0);
    }

    #[test]
    fn base_url_defaults() {
        let c = HttpProfileClient::new(None, None).unwrap();
        assert_eq!(c.base_url, "https://raider.io");
        let c = HttpProfileClient::new(Some("http://localhost:9000/".into()), Some("keyledger-test")).unwrap();
        assert_eq!(c.base_url, "http://localhost:9000");
    }
}
