///! Notifier sink
///!
///! The chat-platform posting layer lives in another process; this side only
///! hands over the rendered images plus a structured summary. Failures here
///! propagate into the scheduler's sub-phase abort so unacknowledged events
///! are retried next tick.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use super::types::{EventKind, KillEvent};

/// Structured companion to the rendered images.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub event_id: i64,
    pub kind: EventKind,
    pub killer: String,
    pub victim: String,
    pub killer_guild: Option<String>,
    pub victim_guild: Option<String>,
    pub fame: i64,
    pub time_stamp: String,
}

impl EventSummary {
    pub fn from_event(kind: EventKind, event: &KillEvent) -> Self {
        Self {
            event_id: event.event_id,
            kind,
            killer: event.killer.name.clone(),
            victim: event.victim.name.clone(),
            killer_guild: event.killer.guild_name.clone(),
            victim_guild: event.victim.guild_name.clone(),
            fame: event.total_victim_kill_fame,
            time_stamp: event.time_stamp.clone(),
        }
    }
}

/// Downstream sink for dispatched events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        summary: &EventSummary,
        main_png: &[u8],
        lost_items_png: Option<&[u8]>,
    ) -> Result<()>;
}

/// Writes each dispatched event into an outbox directory for the posting
/// process to pick up: `<kind>_<id>.png`, optional `<kind>_<id>_lost.png`,
/// and `<kind>_<id>.json`.
pub struct OutboxNotifier {
    output_dir: PathBuf,
}

impl OutboxNotifier {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(
        &self,
        summary: &EventSummary,
        main_png: &[u8],
        lost_items_png: Option<&[u8]>,
    ) -> Result<()> {
        fs::create_dir_all(&self.output_dir)
            .await
            .context("Failed to create outbox directory")?;

        let stem = format!("{}_{}", summary.kind, summary.event_id);

        let image_path = self.output_dir.join(format!("{}.png", stem));
        fs::write(&image_path, main_png)
            .await
            .context(format!("Failed to write {:?}", image_path))?;

        if let Some(bytes) = lost_items_png {
            let lost_path = self.output_dir.join(format!("{}_lost.png", stem));
            fs::write(&lost_path, bytes)
                .await
                .context(format!("Failed to write {:?}", lost_path))?;
        }

        let summary_path = self.output_dir.join(format!("{}.json", stem));
        let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
        fs::write(&summary_path, json)
            .await
            .context(format!("Failed to write {:?}", summary_path))?;

        info!(
            "Dispatched {} {}: {} vs {} ({} fame)",
            summary.kind, summary.event_id, summary.killer, summary.victim, summary.fame
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn summary() -> EventSummary {
        EventSummary {
            event_id: 77,
            kind: EventKind::Kill,
            killer: "Attacker".into(),
            victim: "Defender".into(),
            killer_guild: Some("G".into()),
            victim_guild: None,
            fame: 5000,
            time_stamp: "2026-08-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn writes_images_and_summary() {
        let dir = TempDir::new().unwrap();
        let notifier = OutboxNotifier::new(dir.path());

        notifier
            .notify(&summary(), b"main", Some(b"lost"))
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("kill_77.png")).unwrap(), b"main");
        assert_eq!(
            std::fs::read(dir.path().join("kill_77_lost.png")).unwrap(),
            b"lost"
        );
        let json = std::fs::read_to_string(dir.path().join("kill_77.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["kind"], "kill");
        assert_eq!(parsed["fame"], 5000);
    }

    #[tokio::test]
    async fn lost_items_image_is_optional() {
        let dir = TempDir::new().unwrap();
        let notifier = OutboxNotifier::new(dir.path());

        notifier.notify(&summary(), b"main", None).await.unwrap();

        assert!(dir.path().join("kill_77.png").exists());
        assert!(!dir.path().join("kill_77_lost.png").exists());
    }
}
