// =============================================================================
// Hearth Messaging Session Core - Session
// =============================================================================
//
// Ties the pieces together for one logged-in account: the room cache, the
// durable event store, the push rule engine and the sync dispatcher, all
// opened from one config. The wire layer feeds decoded sync batches in;
// frontends register listeners and page history back out.
//
// =============================================================================

use std::sync::Arc;

use ruma::{EventId, RoomId, UserId};
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use crate::{
    database::{sqlite::SqliteEngine, KeyValueEngine},
    event::{Event, StoredEvent, StreamPointer},
    push::{PushDecision, PushRuleEngine, Ruleset},
    rooms::{RoomCache, UnloadVeto},
    sync::{SyncBatch, SyncDispatcher, SyncEvent},
    timeline::EventStore,
    Result, SessionConfig,
};

pub struct Session {
    config: SessionConfig,
    engine: Arc<SqliteEngine>,
    rooms: RoomCache,
    events: EventStore,
    push: PushRuleEngine,
    dispatcher: SyncDispatcher,
}

impl Session {
    /// Opens the session's on-disk state. A database that cannot be opened
    /// is fatal; a missing or partial room list is not, rooms are then
    /// rebuilt lazily from snapshots and the event store.
    #[instrument(skip(config), fields(user_id = %config.user_id))]
    pub fn open(config: SessionConfig) -> Result<Self> {
        std::fs::create_dir_all(config.state_dir())?;
        let engine = SqliteEngine::open(&config.store_path())?;
        let events = EventStore::new(engine.as_ref())?;
        let mut rooms = RoomCache::new(&config);
        rooms.load_list()?;
        let push = PushRuleEngine::new(config.user_id.clone());
        info!(rooms = rooms.len(), "session opened");
        Ok(Self {
            config,
            engine,
            rooms,
            events,
            push,
            dispatcher: SyncDispatcher::new(),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.config.user_id
    }

    pub fn rooms(&self) -> &RoomCache {
        &self.rooms
    }

    pub fn rooms_mut(&mut self) -> &mut RoomCache {
        &mut self.rooms
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Registers a sync listener; per event type, listeners run in the
    /// order they were registered.
    pub fn on(
        &mut self,
        kind: impl Into<String>,
        listener: impl Fn(&SyncEvent<'_>) + Send + Sync + 'static,
    ) {
        self.dispatcher.on(kind, listener);
    }

    pub fn set_unload_veto(&mut self, veto: UnloadVeto) {
        self.rooms.set_unload_veto(veto);
    }

    /// Installs the account's real push ruleset once it arrives.
    pub fn set_push_ruleset(&mut self, ruleset: Ruleset) {
        self.push.set_ruleset(ruleset);
    }

    /// Applies one decoded sync batch: state into rooms, timeline into the
    /// store, listeners dispatched. Listener panics surface as an error
    /// after the whole batch has been applied.
    pub fn process_sync(&mut self, batch: &SyncBatch, since: &str) -> Result<()> {
        self.dispatcher.process_response(
            batch,
            since,
            self.config.user_id.as_str(),
            &mut self.rooms,
            &self.events,
        )
    }

    /// Evaluates push rules for one event and records the outcome in the
    /// room's unread counters. The caller decides whether to surface a
    /// desktop notification from the returned decision.
    pub fn decide_push(&mut self, room_id: &RoomId, event: &Event) -> Result<PushDecision> {
        let room = self.rooms.ensure_loaded(room_id)?;
        let decision = self.push.get_actions(room, event);
        room.add_unread(decision.notify, decision.highlight);
        Ok(decision)
    }

    pub fn mark_read(&mut self, room_id: &RoomId) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.mark_read();
        }
    }

    /// Pages history backward: up to `count` events older than `hint`
    /// (the room's live edge when `None`), oldest first, plus the hint for
    /// the next page.
    pub fn load_history(
        &mut self,
        room_id: &RoomId,
        count: usize,
        hint: Option<StreamPointer>,
    ) -> Result<(Vec<StoredEvent>, Option<StreamPointer>)> {
        let result = self.events.load(room_id, count, hint)?;
        self.rooms.touch(room_id, std::time::Instant::now());
        Ok(result)
    }

    /// Stores a chunk of server-side backfill below everything already
    /// known for the room.
    pub fn backfill(&mut self, room_id: &RoomId, events: Vec<Event>) -> Result<Vec<StoredEvent>> {
        self.events.prepend(room_id, events)
    }

    pub fn get_event(&self, room_id: &RoomId, event_id: &EventId) -> Result<StoredEvent> {
        self.events.get(room_id, event_id)
    }

    /// Applies a redaction to the stored copy of its target.
    pub fn redact_event(&mut self, room_id: &RoomId, redaction: &Event) -> Result<StoredEvent> {
        let target = match &redaction.redacts {
            Some(target) => target.clone(),
            None => return Err(crate::Error::event_not_found("<no redacts field>")),
        };
        self.events
            .update(room_id, &target, |event| event.redact(redaction))
    }

    /// Replaces a stored event's content with an edit's `m.new_content`.
    pub fn edit_event(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
        new_content: JsonValue,
    ) -> Result<StoredEvent> {
        self.events
            .update(room_id, event_id, |event| event.apply_edit(new_content))
    }

    /// Bumps the locally aggregated reaction count on a stored event.
    pub fn add_reaction(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
        key: &str,
    ) -> Result<StoredEvent> {
        self.events
            .update(room_id, event_id, |event| event.bump_reaction(key))
    }

    pub fn room_display_name(&self, room_id: &RoomId) -> Option<String> {
        self.rooms
            .get(room_id)
            .and_then(|room| room.display_name(&self.config.user_id))
    }

    /// Flushes every dirty room, the room list and the database. Called on
    /// shutdown; afterwards a fresh `open` sees the same state.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<()> {
        self.rooms.flush_all()?;
        self.rooms.save_list()?;
        self.engine.flush()?;
        info!("session closed");
        Ok(())
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn room(&self, room_id: &RoomId) -> Option<&crate::rooms::Room> {
        self.rooms.get(room_id)
    }
}
