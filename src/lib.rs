// =============================================================================
// Hearth Messaging Session Core - Library Crate
// =============================================================================
//
// Client-side session core for a Matrix-style messaging account: a
// bounded-memory room cache backed by compressed disk snapshots, a durable
// per-room event log with a split pointer space for live and backfilled
// history, a declarative push rule engine, and a sync dispatcher feeding
// registered listeners.
//
// The crate deliberately stops at the session boundary. Networking,
// encryption and rendering belong to the embedding application; this
// library consumes decoded sync batches and serves state, history and
// notification decisions back.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod error;
pub mod event;
pub mod notify;
pub mod push;
pub mod rooms;
pub mod session;
pub mod sync;
pub mod timeline;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use event::{Event, EventSource, StoredEvent, StreamPointer};
pub use notify::{Notification, NotificationSink, SoundPlayer, Urgency};
pub use push::{PushDecision, PushRuleEngine, Ruleset};
pub use rooms::{Room, RoomCache};
pub use session::Session;
pub use sync::{SyncBatch, SyncDispatcher, SyncEvent};
pub use timeline::EventStore;

pub use ruma;
