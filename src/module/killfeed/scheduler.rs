///! Ingestion scheduler
///!
///! One cooperative loop drives the whole pipeline. Each tick polls the
///! guild-wide feed and both per-member feeds, dedups against the cursor and
///! the seen-sets, renders fresh events, and forwards them to the notifier.
///! Individual failures degrade or abort a single sub-phase; nothing may
///! terminate the loop itself. Shutdown is honored only between ticks.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::config::KillfeedConfig;

use super::api_client::KillfeedApi;
use super::icon_cache::IconCache;
use super::members::MemberDirectory;
use super::notifier::{EventSummary, Notifier};
use super::renderer::ReportRenderer;
use super::seen::SeenIdSet;
use super::state::{PersistedState, StateStore};
use super::types::{EventKind, KillEvent};

pub struct IngestionScheduler {
    config: KillfeedConfig,
    api: Arc<dyn KillfeedApi>,
    icons: IconCache,
    renderer: ReportRenderer,
    notifier: Arc<dyn Notifier>,
    store: StateStore,
    members: MemberDirectory,

    cursor: i64,
    seen_kills: SeenIdSet,
    seen_deaths: SeenIdSet,
    dirty: bool,

    tick_dispatched: u64,
    tick_stale: u64,
}

impl IngestionScheduler {
    pub fn new(
        config: KillfeedConfig,
        api: Arc<dyn KillfeedApi>,
        icons: IconCache,
        renderer: ReportRenderer,
        notifier: Arc<dyn Notifier>,
        store: StateStore,
    ) -> Self {
        let members = MemberDirectory::new(
            Duration::from_secs(config.member_refresh_secs),
            config.static_members.clone(),
        );
        let seen_capacity = config.seen_capacity;

        Self {
            config,
            api,
            icons,
            renderer,
            notifier,
            store,
            members,
            cursor: 0,
            seen_kills: SeenIdSet::new(seen_capacity),
            seen_deaths: SeenIdSet::new(seen_capacity),
            dirty: false,
            tick_dispatched: 0,
            tick_stale: 0,
        }
    }

    /// Load the persisted cursor and seen-sets.
    pub async fn initialize(&mut self) {
        let state = self.store.load().await;
        self.cursor = state.cursor;
        self.seen_kills = SeenIdSet::from_ids(state.seen_kills, self.config.seen_capacity);
        self.seen_deaths = SeenIdSet::from_ids(state.seen_deaths, self.config.seen_capacity);
        info!(
            "Scheduler initialized: cursor={}, {} seen kills, {} seen deaths",
            self.cursor,
            self.seen_kills.len(),
            self.seen_deaths.len()
        );
    }

    /// Poll until shutdown is signalled. In-flight work of the current tick
    /// always finishes or fails naturally first.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(
            "Starting ingestion loop (interval: {:?}, guild: {})",
            interval, self.config.guild_id
        );

        loop {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping ingestion loop");
                        break;
                    }
                }
            }
        }
    }

    /// One full ingestion pass. Never returns an error: sub-phase failures
    /// are logged and the next tick retries whatever was not acknowledged.
    pub async fn tick(&mut self) {
        let started = Instant::now();
        self.tick_dispatched = 0;
        self.tick_stale = 0;

        let members: Vec<String> = {
            let api = self.api.clone();
            self.members
                .current(api.as_ref(), &self.config.guild_id)
                .await
                .to_vec()
        };

        if let Err(e) = self.guild_phase().await {
            warn!("Guild-wide sub-phase aborted: {:#}", e);
        }

        for kind in [EventKind::Kill, EventKind::Death] {
            if let Err(e) = self.member_phase(kind, &members).await {
                warn!("Per-member {} sub-phase aborted: {:#}", kind, e);
            }
        }

        if self.dirty {
            self.persist().await;
        }

        info!(
            "Tick finished in {:?}: {} dispatched, {} stale-acknowledged, cursor={}",
            started.elapsed(),
            self.tick_dispatched,
            self.tick_stale,
            self.cursor
        );
    }

    /// Guild-wide feed: one bounded page, ascending ids above the cursor.
    async fn guild_phase(&mut self) -> Result<()> {
        let page = self
            .api
            .guild_events(&self.config.guild_id, self.config.guild_page_limit, 0)
            .await
            .context("guild feed fetch")?;

        if let Some(max_id) = page.iter().map(|e| e.event_id).max() {
            if max_id < self.cursor {
                warn!(
                    "Remote guild feed max id {} is below stored cursor {}, clamping down",
                    max_id, self.cursor
                );
                self.cursor = max_id;
                self.dirty = true;
            }
        }

        let mut fresh: Vec<KillEvent> = page
            .into_iter()
            .filter(|e| e.event_id > self.cursor)
            .collect();
        fresh.sort_by_key(|e| e.event_id);

        for event in fresh {
            let id = event.event_id;
            let event = self.with_detail(event).await;

            if self.is_stale(&event) {
                self.acknowledge_guild(id);
                self.tick_stale += 1;
                debug!("Acknowledged stale guild event {}", id);
                continue;
            }

            // The guild feed also carries events where the tracked guild is
            // only the victim side; those arrive again through the per-member
            // death feed with proper dedup.
            let actor_tracked =
                event.killer.guild_id.as_deref() == Some(self.config.guild_id.as_str());
            if !actor_tracked {
                self.acknowledge_guild(id);
                continue;
            }

            self.dispatch(EventKind::Kill, &event)
                .await
                .map_err(|e| e.context(format!("dispatch of guild event {}", id)))?;
            self.acknowledge_guild(id);
            self.tick_dispatched += 1;
        }

        Ok(())
    }

    fn acknowledge_guild(&mut self, id: i64) {
        self.cursor = id;
        self.dirty = true;
    }

    /// One per-member sub-phase: concurrent bounded fetches, then a strictly
    /// ascending dedup-and-dispatch pass. Ids are marked seen only after a
    /// successful dispatch; an abort leaves the rest unmarked for next tick.
    async fn member_phase(&mut self, kind: EventKind, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.feed_workers.max(1)));
        let limit = self.config.member_feed_limit;
        let fetches = members.iter().cloned().map(|member| {
            let api = self.api.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await;
                match api.player_events(kind, &member, limit).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Failed to fetch {} feed for {}: {}", kind, member, e);
                        Vec::new()
                    }
                }
            }
        });

        let mut events: Vec<KillEvent> = futures::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect();
        events.sort_by_key(|e| e.event_id);

        let mut previous = None;
        for event in events {
            let id = event.event_id;
            // The same event surfaces in every involved member's feed.
            if previous == Some(id) {
                continue;
            }
            previous = Some(id);

            if self.seen(kind).contains(id) {
                continue;
            }

            let event = self.with_detail(event).await;

            if self.is_stale(&event) {
                self.seen_mut(kind).insert(id);
                self.dirty = true;
                self.tick_stale += 1;
                debug!("Acknowledged stale {} event {}", kind, id);
                continue;
            }

            self.dispatch(kind, &event)
                .await
                .map_err(|e| e.context(format!("dispatch of {} event {}", kind, id)))?;
            self.seen_mut(kind).insert(id);
            self.dirty = true;
            self.tick_dispatched += 1;
        }

        Ok(())
    }

    fn seen(&self, kind: EventKind) -> &SeenIdSet {
        match kind {
            EventKind::Kill => &self.seen_kills,
            EventKind::Death => &self.seen_deaths,
        }
    }

    fn seen_mut(&mut self, kind: EventKind) -> &mut SeenIdSet {
        match kind {
            EventKind::Kill => &mut self.seen_kills,
            EventKind::Death => &mut self.seen_deaths,
        }
    }

    /// Detail payload when available, the summary otherwise. An event is
    /// never dropped over a failed detail fetch.
    async fn with_detail(&self, event: KillEvent) -> KillEvent {
        match self.api.event_detail(event.event_id).await {
            Ok(detail) => detail,
            Err(e) => {
                debug!(
                    "Detail fetch failed for event {}, using summary payload: {}",
                    event.event_id, e
                );
                event
            }
        }
    }

    /// Unparsable timestamps count as fresh; silently dropping them would
    /// hide a remote format change.
    fn is_stale(&self, event: &KillEvent) -> bool {
        event
            .age_at(Utc::now())
            .is_some_and(|age| age.num_seconds() > self.config.max_event_age_secs)
    }

    /// Render and hand off one event. An error here means the event was not
    /// delivered and must stay unacknowledged.
    async fn dispatch(&mut self, kind: EventKind, event: &KillEvent) -> Result<()> {
        let urls = self.renderer.icon_urls(event);
        let icons = self.icons.prefetch(&urls).await;

        let report = self
            .renderer
            .render_event(kind, event, &icons)
            .context("report rendering")?;

        let summary = EventSummary::from_event(kind, event);
        self.notifier
            .notify(&summary, &report.main_png, report.lost_items_png.as_deref())
            .await
            .context("notifier hand-off")
    }

    async fn persist(&mut self) {
        self.seen_kills.trim();
        self.seen_deaths.trim();

        let state = PersistedState {
            cursor: self.cursor,
            seen_kills: self.seen_kills.sorted_ids(),
            seen_deaths: self.seen_deaths.sorted_ids(),
            saved_at: Utc::now().to_rfc3339(),
        };

        // A failed save only risks reprocessing after a restart; in-memory
        // state keeps advancing either way.
        if let Err(e) = self.store.save(&state).await {
            warn!("Failed to persist ingestion state: {:#}", e);
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::killfeed::api_client::BlobFetcher;
    use crate::module::killfeed::retry::{FetchError, RetryPolicy};
    use crate::module::killfeed::types::{EventPlayer, GuildMember};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const GUILD: &str = "G1";

    struct FakeApi {
        guild: Mutex<Vec<KillEvent>>,
        kills: Mutex<HashMap<String, Vec<KillEvent>>>,
        deaths: Mutex<HashMap<String, Vec<KillEvent>>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                guild: Mutex::new(Vec::new()),
                kills: Mutex::new(HashMap::new()),
                deaths: Mutex::new(HashMap::new()),
            }
        }

        fn set_guild(&self, events: Vec<KillEvent>) {
            *self.guild.lock().unwrap() = events;
        }

        fn set_kills(&self, member: &str, events: Vec<KillEvent>) {
            self.kills
                .lock()
                .unwrap()
                .insert(member.to_string(), events);
        }
    }

    #[async_trait]
    impl KillfeedApi for FakeApi {
        async fn guild_events(
            &self,
            _guild_id: &str,
            _limit: u32,
            _offset: u32,
        ) -> Result<Vec<KillEvent>, FetchError> {
            Ok(self.guild.lock().unwrap().clone())
        }

        async fn event_detail(&self, _event_id: i64) -> Result<KillEvent, FetchError> {
            // Forces the summary-payload fallback path.
            Err(FetchError::Status(404))
        }

        async fn player_events(
            &self,
            kind: EventKind,
            player_id: &str,
            _limit: u32,
        ) -> Result<Vec<KillEvent>, FetchError> {
            let feeds = match kind {
                EventKind::Kill => &self.kills,
                EventKind::Death => &self.deaths,
            };
            Ok(feeds
                .lock()
                .unwrap()
                .get(player_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn guild_members(&self, _guild_id: &str) -> Result<Vec<GuildMember>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct RecordingNotifier {
        delivered: Mutex<Vec<(EventKind, i64)>>,
        fail: AtomicBool,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }

        fn delivered(&self) -> Vec<(EventKind, i64)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            summary: &EventSummary,
            _main_png: &[u8],
            _lost_items_png: Option<&[u8]>,
        ) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("sink down");
            }
            self.delivered
                .lock()
                .unwrap()
                .push((summary.kind, summary.event_id));
            Ok(())
        }
    }

    struct NoopFetcher;

    #[async_trait]
    impl BlobFetcher for NoopFetcher {
        async fn fetch_blob(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn ev(id: i64, killer_guild: &str) -> KillEvent {
        KillEvent {
            event_id: id,
            time_stamp: Utc::now().to_rfc3339(),
            total_victim_kill_fame: 1000,
            killer: EventPlayer {
                name: format!("K{}", id),
                guild_id: Some(killer_guild.to_string()),
                ..Default::default()
            },
            victim: EventPlayer {
                name: "V".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn stale_ev(id: i64, killer_guild: &str) -> KillEvent {
        let mut event = ev(id, killer_guild);
        event.time_stamp = (Utc::now() - chrono::Duration::hours(3)).to_rfc3339();
        event
    }

    fn test_config(dir: &Path, static_members: Vec<String>) -> KillfeedConfig {
        KillfeedConfig {
            guild_id: GUILD.to_string(),
            static_members: Some(static_members),
            state_path: dir
                .join("state.json")
                .to_string_lossy()
                .into_owned(),
            icon_cache_dir: dir.join("icons").to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    fn scheduler_with(
        api: Arc<FakeApi>,
        notifier: Arc<RecordingNotifier>,
        config: KillfeedConfig,
    ) -> IngestionScheduler {
        let icons = IconCache::new(
            Arc::new(NoopFetcher),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            &config.icon_cache_dir,
            config.icon_memory_capacity,
            config.icon_workers,
        );
        let renderer = ReportRenderer::new("https://render.test", 80, 5, "Test Guild");
        let store = StateStore::new(&config.state_path);
        IngestionScheduler::new(config, api, icons, renderer, notifier, store)
    }

    #[tokio::test]
    async fn guild_feed_dispatches_past_cursor_in_order() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), Vec::new());

        StateStore::new(&config.state_path)
            .save(&PersistedState {
                cursor: 101,
                ..Default::default()
            })
            .await
            .unwrap();

        api.set_guild(vec![ev(103, GUILD), ev(101, GUILD), ev(102, GUILD)]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config.clone());
        scheduler.initialize().await;
        scheduler.tick().await;

        assert_eq!(
            notifier.delivered(),
            vec![(EventKind::Kill, 102), (EventKind::Kill, 103)]
        );
        assert_eq!(scheduler.cursor, 103);

        let persisted = StateStore::new(&config.state_path).load().await;
        assert_eq!(persisted.cursor, 103);
    }

    #[tokio::test]
    async fn all_seen_tick_dispatches_nothing_and_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), vec!["m1".to_string()]);

        StateStore::new(&config.state_path)
            .save(&PersistedState {
                cursor: 103,
                seen_kills: vec![55],
                ..Default::default()
            })
            .await
            .unwrap();

        api.set_guild(vec![ev(102, GUILD), ev(103, GUILD)]);
        api.set_kills("m1", vec![ev(55, GUILD)]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config.clone());
        scheduler.initialize().await;

        // Remove the state file: an idempotent tick must not rewrite it.
        std::fs::remove_file(&config.state_path).unwrap();
        scheduler.tick().await;

        assert!(notifier.delivered().is_empty());
        assert_eq!(scheduler.cursor, 103);
        assert!(!Path::new(&config.state_path).exists());
    }

    #[tokio::test]
    async fn member_kill_is_dispatched_exactly_once_across_ticks() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), vec!["m1".to_string(), "m2".to_string()]);

        // The same event surfaces in both tracked members' feeds.
        api.set_kills("m1", vec![ev(55, GUILD)]);
        api.set_kills("m2", vec![ev(55, GUILD)]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config);
        scheduler.initialize().await;
        scheduler.tick().await;
        scheduler.tick().await;

        assert_eq!(notifier.delivered(), vec![(EventKind::Kill, 55)]);
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_ids_unmarked_for_retry() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), vec!["m1".to_string()]);

        api.set_kills("m1", vec![ev(55, GUILD), ev(56, GUILD)]);
        notifier.fail.store(true, Ordering::SeqCst);

        let mut scheduler = scheduler_with(api, notifier.clone(), config);
        scheduler.initialize().await;
        scheduler.tick().await;

        assert!(notifier.delivered().is_empty());
        assert!(!scheduler.seen_kills.contains(55));

        notifier.fail.store(false, Ordering::SeqCst);
        scheduler.tick().await;

        assert_eq!(
            notifier.delivered(),
            vec![(EventKind::Kill, 55), (EventKind::Kill, 56)]
        );
        assert!(scheduler.seen_kills.contains(55));
        assert!(scheduler.seen_kills.contains(56));
    }

    #[tokio::test]
    async fn stale_events_are_acknowledged_but_never_rendered() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), vec!["m1".to_string()]);

        api.set_guild(vec![stale_ev(200, GUILD)]);
        api.set_kills("m1", vec![stale_ev(60, GUILD)]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config.clone());
        scheduler.initialize().await;
        scheduler.tick().await;

        assert!(notifier.delivered().is_empty());
        assert_eq!(scheduler.cursor, 200);
        assert!(scheduler.seen_kills.contains(60));
        assert_eq!(scheduler.tick_stale, 2);

        // Acknowledgement is persisted so a restart will not replay them.
        let persisted = StateStore::new(&config.state_path).load().await;
        assert_eq!(persisted.cursor, 200);
        assert_eq!(persisted.seen_kills, vec![60]);
    }

    #[tokio::test]
    async fn cursor_clamps_down_when_remote_max_is_below_it() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), Vec::new());

        StateStore::new(&config.state_path)
            .save(&PersistedState {
                cursor: 100,
                ..Default::default()
            })
            .await
            .unwrap();

        api.set_guild(vec![ev(40, GUILD), ev(50, GUILD)]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config);
        scheduler.initialize().await;
        scheduler.tick().await;

        assert!(notifier.delivered().is_empty());
        assert_eq!(scheduler.cursor, 50);
    }

    #[tokio::test]
    async fn events_by_other_guilds_are_acknowledged_without_dispatch() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), Vec::new());

        api.set_guild(vec![ev(110, "SOMEONE_ELSE")]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config);
        scheduler.initialize().await;
        scheduler.tick().await;

        assert!(notifier.delivered().is_empty());
        assert_eq!(scheduler.cursor, 110);
    }

    #[tokio::test]
    async fn member_feeds_dispatch_deaths_independently() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(FakeApi::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config(dir.path(), vec!["m1".to_string()]);

        api.set_kills("m1", vec![ev(70, GUILD)]);
        api.deaths
            .lock()
            .unwrap()
            .insert("m1".to_string(), vec![ev(70, "SOMEONE_ELSE")]);

        let mut scheduler = scheduler_with(api, notifier.clone(), config);
        scheduler.initialize().await;
        scheduler.tick().await;

        // Id 70 exists in both feeds; the seen-sets are per (feed, kind) so
        // both are dispatched.
        assert_eq!(
            notifier.delivered(),
            vec![(EventKind::Kill, 70), (EventKind::Death, 70)]
        );
    }
}
