///! Two-tier icon cache: bounded FIFO memory tier + unbounded disk tier
///!
///! Disk entries are keyed by a SHA-256 of the source URL and written via
///! temp-file-then-rename so a crashed write never leaves a torn blob.
///! Failed fetches are absent from results; callers render an empty slot.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::api_client::BlobFetcher;
use super::retry::RetryPolicy;
use super::types::ItemDescriptor;

/// Templated icon-rendering URL for one item.
pub fn icon_url(render_base: &str, item: &ItemDescriptor, size: u32) -> String {
    format!(
        "{}/v1/item/{}@{}.png?quality={}&size={}&count={}",
        render_base.trim_end_matches('/'),
        item.base_type(),
        item.enchantment(),
        item.quality,
        size,
        item.count
    )
}

pub struct IconCache {
    fetcher: Arc<dyn BlobFetcher>,
    retry: RetryPolicy,
    cache_dir: PathBuf,
    capacity: usize,
    workers: usize,
    /// Memory tier: map for lookup, queue for O(1) oldest-first eviction.
    entries: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
}

impl IconCache {
    pub fn new(
        fetcher: Arc<dyn BlobFetcher>,
        retry: RetryPolicy,
        cache_dir: impl AsRef<Path>,
        capacity: usize,
        workers: usize,
    ) -> Self {
        Self {
            fetcher,
            retry,
            cache_dir: cache_dir.as_ref().to_path_buf(),
            capacity,
            workers: workers.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn disk_path(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        self.cache_dir.join(format!("{:x}.png", hasher.finalize()))
    }

    /// Memory -> disk -> network, retrying only transient failures.
    /// None means the icon is ultimately unavailable this tick.
    pub async fn fetch(&mut self, url: &str) -> Option<Vec<u8>> {
        if let Some(bytes) = self.entries.get(url) {
            return Some(bytes.clone());
        }

        if let Ok(bytes) = fs::read(self.disk_path(url)).await {
            debug!("Icon disk hit: {}", url);
            self.insert_memory(url.to_string(), bytes.clone());
            return Some(bytes);
        }

        let fetcher = self.fetcher.clone();
        let retry = self.retry.clone();
        let result = retry.run("icon fetch", || fetcher.fetch_blob(url)).await;
        match result {
            Ok(bytes) => {
                if let Err(e) = self.write_disk(url, &bytes).await {
                    warn!("Failed to persist icon {}: {:#}", url, e);
                }
                self.insert_memory(url.to_string(), bytes.clone());
                Some(bytes)
            }
            Err(e) => {
                warn!("Icon fetch failed for {}: {}", url, e);
                None
            }
        }
    }

    /// Fetch the non-cached remainder concurrently under the worker bound.
    /// URLs that ultimately fail are simply absent from the returned map.
    pub async fn prefetch(&mut self, urls: &[String]) -> HashMap<String, Vec<u8>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        let mut queued = HashSet::new();

        for url in urls {
            if out.contains_key(url) || !queued.insert(url.clone()) {
                continue;
            }
            if let Some(bytes) = self.entries.get(url) {
                out.insert(url.clone(), bytes.clone());
            } else if let Ok(bytes) = fs::read(self.disk_path(url)).await {
                self.insert_memory(url.clone(), bytes.clone());
                out.insert(url.clone(), bytes);
            } else {
                missing.push(url.clone());
            }
        }

        if missing.is_empty() {
            return out;
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let shared_fetcher = self.fetcher.clone();
        let shared_retry = self.retry.clone();
        let fetches = missing.into_iter().map(|url| {
            let fetcher = shared_fetcher.clone();
            let retry = shared_retry.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await;
                let result = retry.run("icon fetch", || fetcher.fetch_blob(&url)).await;
                (url, result)
            }
        });
        let results = futures::future::join_all(fetches).await;

        for (url, result) in results {
            match result {
                Ok(bytes) => {
                    if let Err(e) = self.write_disk(&url, &bytes).await {
                        warn!("Failed to persist icon {}: {:#}", url, e);
                    }
                    self.insert_memory(url.clone(), bytes.clone());
                    out.insert(url, bytes);
                }
                Err(e) => warn!("Icon fetch failed for {}: {}", url, e),
            }
        }

        out
    }

    /// FIFO insert: oldest-inserted entry is evicted first, regardless of
    /// how often it was read since.
    fn insert_memory(&mut self, url: String, bytes: Vec<u8>) {
        if self.entries.insert(url.clone(), bytes).is_none() {
            self.order.push_back(url);
        }
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!("Evicted icon from memory cache: {}", oldest);
            } else {
                break;
            }
        }
    }

    async fn write_disk(&self, url: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)
            .await
            .context("Failed to create icon cache directory")?;

        let final_path = self.disk_path(url);
        let tmp_path = final_path.with_extension("png.tmp");

        fs::write(&tmp_path, bytes)
            .await
            .context(format!("Failed to write {:?}", tmp_path))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .context(format!("Failed to rename into {:?}", final_path))?;
        Ok(())
    }

    pub fn memory_len(&self) -> usize {
        self.entries.len()
    }

    /// Delete every blob in the disk tier. Manual maintenance only; nothing
    /// schedules this.
    pub async fn purge_disk(&self) -> Result<usize> {
        if !fs::try_exists(&self.cache_dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let mut removed = 0;
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "png") {
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("Failed to remove cached icon {:?}: {}", path, e);
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
