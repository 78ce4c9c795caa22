///! TTL-refreshed directory of tracked player ids

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::api_client::KillfeedApi;

pub struct MemberDirectory {
    members: Vec<String>,
    refreshed_at: Option<Instant>,
    ttl: Duration,
    /// Operator override; when set, remote refresh is disabled entirely.
    static_override: Option<Vec<String>>,
}

impl MemberDirectory {
    pub fn new(ttl: Duration, static_override: Option<Vec<String>>) -> Self {
        if let Some(list) = &static_override {
            info!("Member directory pinned to {} static ids", list.len());
        }
        Self {
            members: Vec::new(),
            refreshed_at: None,
            ttl,
            static_override,
        }
    }

    pub fn is_static(&self) -> bool {
        self.static_override.is_some()
    }

    fn expired(&self) -> bool {
        self.refreshed_at.is_none_or(|t| t.elapsed() >= self.ttl)
    }

    /// Current tracked ids, refreshing from the remote listing when the TTL
    /// has expired. A failed refresh keeps the stale list.
    pub async fn current(&mut self, api: &dyn KillfeedApi, guild_id: &str) -> &[String] {
        if self.static_override.is_none() && self.expired() {
            self.refresh(api, guild_id).await;
        }

        match &self.static_override {
            Some(list) => list,
            None => &self.members,
        }
    }

    async fn refresh(&mut self, api: &dyn KillfeedApi, guild_id: &str) {
        match api.guild_members(guild_id).await {
            Ok(listing) => {
                let count = listing.len();
                self.members = listing.into_iter().map(|m| m.id).collect();
                self.refreshed_at = Some(Instant::now());
                debug!("Refreshed member directory: {} members", count);
            }
            Err(e) => {
                warn!(
                    "Member directory refresh failed, keeping {} stale entries: {}",
                    self.members.len(),
                    e
                );
            }
        }
    }
}
