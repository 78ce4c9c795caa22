///! Game-statistics API client
///!
///! Thin retryable JSON wrapper over the gameinfo HTTP endpoints. Every call
///! carries the fixed request timeout; retries follow the shared policy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::retry::{FetchError, RetryPolicy};
use super::types::{EventKind, GuildMember, KillEvent};

/// Seam over the event/member endpoints so the scheduler can be exercised
/// without a network.
#[async_trait]
pub trait KillfeedApi: Send + Sync {
    /// Latest bounded page of the guild-wide feed.
    async fn guild_events(&self, guild_id: &str, limit: u32, offset: u32)
    -> Result<Vec<KillEvent>, FetchError>;

    /// Full detail payload for one event.
    async fn event_detail(&self, event_id: i64) -> Result<KillEvent, FetchError>;

    /// Recent kills or deaths of one tracked player.
    async fn player_events(
        &self,
        kind: EventKind,
        player_id: &str,
        limit: u32,
    ) -> Result<Vec<KillEvent>, FetchError>;

    /// Current member listing of the tracked guild.
    async fn guild_members(&self, guild_id: &str) -> Result<Vec<GuildMember>, FetchError>;
}

/// Seam over raw blob GETs, used by the icon cache. A single attempt; the
/// cache drives the retry loop itself.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct GameinfoClient {
    http: reqwest::Client,
    api_base: String,
    retry: RetryPolicy,
}

impl GameinfoClient {
    pub fn new(api_base: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            retry,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T, FetchError> {
        self.retry
            .run(what, || self.get_json_once(url))
            .await
    }

    async fn get_json_once<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl KillfeedApi for GameinfoClient {
    async fn guild_events(
        &self,
        guild_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<KillEvent>, FetchError> {
        let url = format!(
            "{}/events?guildId={}&limit={}&offset={}",
            self.api_base, guild_id, limit, offset
        );
        self.get_json(&url, "guild events").await
    }

    async fn event_detail(&self, event_id: i64) -> Result<KillEvent, FetchError> {
        let url = format!("{}/events/{}", self.api_base, event_id);
        self.get_json(&url, "event detail").await
    }

    async fn player_events(
        &self,
        kind: EventKind,
        player_id: &str,
        limit: u32,
    ) -> Result<Vec<KillEvent>, FetchError> {
        let path = match kind {
            EventKind::Kill => "kills",
            EventKind::Death => "deaths",
        };
        let url = format!(
            "{}/players/{}/{}?limit={}",
            self.api_base, player_id, path, limit
        );
        self.get_json(&url, "player feed").await
    }

    async fn guild_members(&self, guild_id: &str) -> Result<Vec<GuildMember>, FetchError> {
        let url = format!("{}/guilds/{}/members", self.api_base, guild_id);
        self.get_json(&url, "guild members").await
    }
}

#[async_trait]
impl BlobFetcher for GameinfoClient {
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(FetchError::from_reqwest)?;
        Ok(bytes.to_vec())
    }
}
