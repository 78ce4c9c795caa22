///! Kill/death event ingestion pipeline
///!
///! Polls the game-statistics API for events involving a tracked guild,
///! deduplicates them across the guild-wide and per-member feeds, renders a
///! composite report image for each fresh event, and hands the result to a
///! notifier sink.

pub mod api_client;
pub mod icon_cache;
pub mod members;
pub mod notifier;
pub mod renderer;
pub mod retry;
pub mod scheduler;
pub mod seen;
pub mod state;
pub mod types;

// Re-export the types most callers need
pub use api_client::{GameinfoClient, KillfeedApi};
pub use icon_cache::IconCache;
pub use notifier::{EventSummary, Notifier, OutboxNotifier};
pub use renderer::ReportRenderer;
pub use scheduler::IngestionScheduler;
pub use types::{EventKind, KillEvent};
