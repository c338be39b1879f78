// =============================================================================
// Hearth Messaging Session Core - Sync Dispatcher
// =============================================================================
//
// Consumes one decoded sync batch at a time: applies state changes to the
// relevant room through the cache, appends timeline events to the event
// store, and invokes the registered per-event-type listeners. Within a
// batch everything is synchronous; batches are never processed
// concurrently.
//
// The wire layer delivers events fully decoded (room id resolved,
// payloads decrypted); this module never touches the network.
//
// =============================================================================

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    time::Instant,
};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use crate::{
    event::{Event, EventSource, StreamPointer},
    rooms::RoomCache,
    timeline::EventStore,
    Error, Result,
};

/// One unit of incoming updates from the protocol collaborator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncBatch {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: BatchRooms,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchRooms {
    #[serde(default)]
    pub join: HashMap<OwnedRoomId, JoinedRoomUpdate>,
    #[serde(default)]
    pub invite: HashMap<OwnedRoomId, InvitedRoomUpdate>,
    #[serde(default)]
    pub leave: HashMap<OwnedRoomId, LeftRoomUpdate>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinedRoomUpdate {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineChunk,
    #[serde(default)]
    pub ephemeral: EphemeralList,
    #[serde(default)]
    pub account_data: EphemeralList,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvitedRoomUpdate {
    #[serde(default)]
    pub invite_state: EventList,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeftRoomUpdate {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineChunk,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimelineChunk {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Ephemeral payloads (typing, receipts) have no event id or sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EphemeralEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: JsonValue,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EphemeralList {
    #[serde(default)]
    pub events: Vec<EphemeralEvent>,
}

/// What a listener receives: the event plus where in the batch it came
/// from.
#[derive(Debug)]
pub enum SyncEvent<'a> {
    Room {
        event: &'a Event,
        /// Set for timeline events that were appended to the store.
        pointer: Option<StreamPointer>,
        source: EventSource,
    },
    Ephemeral {
        room_id: &'a RoomId,
        event: &'a EphemeralEvent,
    },
}

impl SyncEvent<'_> {
    pub fn kind(&self) -> &str {
        match self {
            SyncEvent::Room { event, .. } => &event.kind,
            SyncEvent::Ephemeral { event, .. } => &event.kind,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            SyncEvent::Room { event, .. } => &event.room_id,
            SyncEvent::Ephemeral { room_id, .. } => room_id,
        }
    }
}

pub type Listener = Box<dyn Fn(&SyncEvent<'_>) + Send + Sync>;

/// Type-keyed listener registry plus the batch-application loop.
///
/// Listeners are registered once at session start; for each event type
/// they run in registration order, and a panic in one listener is caught
/// and reported without aborting the rest of the batch.
#[derive(Default)]
pub struct SyncDispatcher {
    listeners: HashMap<String, Vec<Listener>>,
}

impl SyncDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for one event type, after any listener
    /// already registered for that type.
    pub fn on(
        &mut self,
        kind: impl Into<String>,
        listener: impl Fn(&SyncEvent<'_>) + Send + Sync + 'static,
    ) {
        self.listeners
            .entry(kind.into())
            .or_default()
            .push(Box::new(listener));
    }

    fn dispatch(&self, event: &SyncEvent<'_>, panics: &mut Vec<String>) {
        let Some(listeners) = self.listeners.get(event.kind()) else {
            return;
        };
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                warn!(kind = event.kind(), room_id = %event.room_id(), "listener panicked: {message}");
                panics.push(message);
            }
        }
    }

    /// Applies one decoded batch. An empty `since` token only establishes
    /// the baseline and is a no-op.
    ///
    /// Per joined room: state is applied first, then timeline, then
    /// ephemeral, each category dispatched in turn, so handlers always
    /// observe current room state. Invited rooms apply and dispatch only
    /// invite-state; left rooms only timeline events carrying a state key
    /// (membership-retraction history).
    #[instrument(skip(self, batch, cache, store), fields(token = %batch.next_batch))]
    pub fn process_response(
        &self,
        batch: &SyncBatch,
        since: &str,
        session_name: &str,
        cache: &mut RoomCache,
        store: &EventStore,
    ) -> Result<()> {
        if since.is_empty() {
            debug!("baseline sync, skipping dispatch");
            return Ok(());
        }

        let mut panics = Vec::new();

        for (room_id, update) in &batch.rooms.join {
            {
                let room = cache.ensure_loaded(room_id)?;
                for event in &update.state.events {
                    room.apply_state(event);
                }
            }
            for event in &update.state.events {
                self.dispatch(
                    &SyncEvent::Room {
                        event,
                        pointer: None,
                        source: EventSource::JoinState,
                    },
                    &mut panics,
                );
            }

            if !update.account_data.events.is_empty() {
                let room = cache.ensure_loaded(room_id)?;
                for event in &update.account_data.events {
                    if event.kind == "m.tag" {
                        room.apply_tags(&event.content);
                    }
                }
                for event in &update.account_data.events {
                    self.dispatch(&SyncEvent::Ephemeral { room_id, event }, &mut panics);
                }
            }

            if !update.timeline.events.is_empty() {
                {
                    let room = cache.ensure_loaded(room_id)?;
                    for event in &update.timeline.events {
                        if event.state_key.is_some() {
                            room.apply_state(event);
                        }
                    }
                }
                let stored = store.append(room_id, update.timeline.events.clone())?;
                for entry in &stored {
                    self.dispatch(
                        &SyncEvent::Room {
                            event: &entry.event,
                            pointer: Some(entry.pointer),
                            source: EventSource::JoinTimeline,
                        },
                        &mut panics,
                    );
                }
            }

            for event in &update.ephemeral.events {
                self.dispatch(&SyncEvent::Ephemeral { room_id, event }, &mut panics);
            }

            cache.touch(room_id, Instant::now());
        }

        for (room_id, update) in &batch.rooms.invite {
            {
                let room = cache.ensure_loaded(room_id)?;
                for event in &update.invite_state.events {
                    room.apply_state(event);
                }
            }
            for event in &update.invite_state.events {
                self.dispatch(
                    &SyncEvent::Room {
                        event,
                        pointer: None,
                        source: EventSource::InviteState,
                    },
                    &mut panics,
                );
            }
        }

        for (room_id, update) in &batch.rooms.leave {
            let retained: Vec<&Event> = update
                .timeline
                .events
                .iter()
                .filter(|event| event.state_key.is_some())
                .collect();
            if retained.is_empty() {
                continue;
            }
            {
                let room = cache.ensure_loaded(room_id)?;
                for event in &retained {
                    room.apply_state(event);
                }
            }
            for event in retained {
                self.dispatch(
                    &SyncEvent::Room {
                        event,
                        pointer: None,
                        source: EventSource::LeaveTimeline,
                    },
                    &mut panics,
                );
            }
        }

        if panics.is_empty() {
            Ok(())
        } else {
            Err(Error::ListenerPanic {
                session: session_name.to_owned(),
                token: batch.next_batch.clone(),
                details: format!("{} listener(s) panicked: {}", panics.len(), panics.join("; ")),
            })
        }
    }
}
