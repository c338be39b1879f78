use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ruma::{OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use crate::{event::Event, Error, Result};

/// Slot in the room state table: latest event per (event type, state key).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StateKey {
    pub kind: String,
    pub state_key: String,
}

/// One member's resident view, derived from their `m.room.member` event.
#[derive(Clone, Debug, Default)]
pub struct Member {
    pub display_name: Option<String>,
    pub membership: String,
}

/// Lightweight per-room metadata. Survives unload and is what the bulk
/// room-list snapshot persists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: OwnedRoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub unread_notifications: u64,
    #[serde(default)]
    pub unread_highlights: u64,
}

impl RoomMetadata {
    fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            name: None,
            topic: None,
            canonical_alias: None,
            tags: Vec::new(),
            unread_notifications: 0,
            unread_highlights: 0,
        }
    }
}

/// In-memory representation of one conversation.
///
/// Heavy state (the state table and member map) loads lazily from a
/// compressed snapshot and is dropped again on eviction; metadata stays
/// resident for the lifetime of the cache entry.
pub struct Room {
    meta: RoomMetadata,
    state: HashMap<StateKey, Event>,
    members: HashMap<OwnedUserId, Member>,
    loaded: bool,
    dirty: bool,
    last_touch: Instant,
}

/// On-disk form of the heavy state: the state-table events, everything
/// else is derived on load.
#[derive(Serialize, Deserialize)]
struct RoomSnapshot {
    state: Vec<Event>,
}

impl Room {
    pub fn new(room_id: OwnedRoomId) -> Self {
        Self {
            meta: RoomMetadata::new(room_id),
            state: HashMap::new(),
            members: HashMap::new(),
            loaded: false,
            dirty: false,
            last_touch: Instant::now(),
        }
    }

    pub(crate) fn from_metadata(meta: RoomMetadata) -> Self {
        Self {
            meta,
            state: HashMap::new(),
            members: HashMap::new(),
            loaded: false,
            dirty: false,
            last_touch: Instant::now(),
        }
    }

    pub fn room_id(&self) -> &ruma::RoomId {
        &self.meta.room_id
    }

    pub fn metadata(&self) -> &RoomMetadata {
        &self.meta
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_touch(&self) -> Instant {
        self.last_touch
    }

    pub(crate) fn mark_touched(&mut self, now: Instant) {
        self.last_touch = now;
    }

    /// Marks the room loaded without reading a snapshot; used when a
    /// corrupted snapshot is discarded and the room starts empty.
    pub(crate) fn force_loaded(&mut self) {
        self.loaded = true;
        self.dirty = false;
    }

    /// Applies one state event to the (event type, state key) slot and
    /// refreshes the derived metadata and member map it affects.
    pub fn apply_state(&mut self, event: &Event) {
        let Some(state_key) = event.state_key.clone() else {
            warn!(room_id = %self.meta.room_id, kind = %event.kind, "ignoring state event without state key");
            return;
        };

        match event.kind.as_str() {
            "m.room.name" => {
                self.meta.name = event
                    .content
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned);
            }
            "m.room.topic" => {
                self.meta.topic = event
                    .content
                    .get("topic")
                    .and_then(JsonValue::as_str)
                    .map(str::to_owned);
            }
            "m.room.canonical_alias" => {
                self.meta.canonical_alias = event
                    .content
                    .get("alias")
                    .and_then(JsonValue::as_str)
                    .map(str::to_owned);
            }
            "m.room.member" => {
                if let Ok(user_id) = UserId::parse(state_key.as_str()) {
                    let membership = event
                        .content
                        .get("membership")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("leave");
                    if membership == "join" || membership == "invite" {
                        self.members.insert(
                            user_id,
                            Member {
                                display_name: event
                                    .content
                                    .get("displayname")
                                    .and_then(JsonValue::as_str)
                                    .map(str::to_owned),
                                membership: membership.to_owned(),
                            },
                        );
                    } else {
                        self.members.remove(&user_id);
                    }
                }
            }
            _ => {}
        }

        self.state.insert(
            StateKey {
                kind: event.kind.clone(),
                state_key,
            },
            event.clone(),
        );
        self.dirty = true;
    }

    /// Applies `m.tag`-style account data.
    pub fn apply_tags(&mut self, content: &JsonValue) {
        let mut tags: Vec<String> = content
            .get("tags")
            .and_then(JsonValue::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        self.meta.tags = tags;
        self.dirty = true;
    }

    pub fn state_event(&self, kind: &str, state_key: &str) -> Option<&Event> {
        self.state.get(&StateKey {
            kind: kind.to_owned(),
            state_key: state_key.to_owned(),
        })
    }

    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.members.get(user_id)
    }

    /// Count of members currently joined or invited.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// A member's human-readable name, falling back to their user ID.
    pub fn member_display_name(&self, user_id: &UserId) -> String {
        self.members
            .get(user_id)
            .and_then(|member| member.display_name.clone())
            .unwrap_or_else(|| user_id.to_string())
    }

    /// Display name: explicit room name, else canonical alias, else the
    /// other member's name in a two-person room.
    pub fn display_name(&self, own_user_id: &UserId) -> Option<String> {
        if let Some(name) = &self.meta.name {
            return Some(name.clone());
        }
        if let Some(alias) = &self.meta.canonical_alias {
            return Some(alias.clone());
        }
        if self.members.len() == 2 {
            let other = self.members.keys().find(|id| id.as_str() != own_user_id.as_str())?;
            return Some(self.member_display_name(other));
        }
        None
    }

    pub fn topic(&self) -> Option<&str> {
        self.meta.topic.as_deref()
    }

    pub fn canonical_alias(&self) -> Option<&str> {
        self.meta.canonical_alias.as_deref()
    }

    pub fn add_unread(&mut self, notify: bool, highlight: bool) {
        if notify {
            self.meta.unread_notifications += 1;
        }
        if highlight {
            self.meta.unread_highlights += 1;
        }
        self.dirty = true;
    }

    pub fn mark_read(&mut self) {
        if self.meta.unread_notifications != 0 || self.meta.unread_highlights != 0 {
            self.meta.unread_notifications = 0;
            self.meta.unread_highlights = 0;
            self.dirty = true;
        }
    }

    fn snapshot_path(state_dir: &Path, room_id: &ruma::RoomId) -> PathBuf {
        let sanitized: String = room_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        state_dir.join(format!("{sanitized}.json.gz"))
    }

    /// Loads the heavy state from the room's snapshot file; a missing
    /// file is a fresh room. A corrupted snapshot is an error, decided
    /// by the caller (the cache starts the room empty instead).
    #[instrument(skip(self, state_dir), fields(room_id = %self.meta.room_id))]
    pub fn load(&mut self, state_dir: &Path) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let path = Self::snapshot_path(state_dir, &self.meta.room_id);
        if path.exists() {
            let file = File::open(&path)?;
            let snapshot: RoomSnapshot = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
                .map_err(|e| Error::bad_snapshot(format!("{}: {e}", path.display())))?;
            for event in &snapshot.state {
                self.apply_state(event);
            }
            debug!(events = snapshot.state.len(), "room state restored");
        }
        self.loaded = true;
        self.dirty = false;
        Ok(())
    }

    /// Flushes dirty state to the room's snapshot file without unloading.
    pub fn flush(&mut self, state_dir: &Path, compression: u32) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        std::fs::create_dir_all(state_dir)?;
        let path = Self::snapshot_path(state_dir, &self.meta.room_id);
        let snapshot = RoomSnapshot {
            state: self.state.values().cloned().collect(),
        };
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(compression));
        serde_json::to_writer(&mut encoder, &snapshot)?;
        encoder.finish()?.flush()?;
        self.dirty = false;
        debug!(room_id = %self.meta.room_id, path = %path.display(), "room state flushed");
        Ok(())
    }

    /// Eviction: flush dirty state, then release the heavy in-memory
    /// structures. Metadata stays.
    #[instrument(skip(self, state_dir, compression), fields(room_id = %self.meta.room_id))]
    pub fn unload(&mut self, state_dir: &Path, compression: u32) -> Result<()> {
        self.flush(state_dir, compression)?;
        self.state.clear();
        self.state.shrink_to_fit();
        self.members.clear();
        self.members.shrink_to_fit();
        self.loaded = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::RoomId;
    use serde_json::json;

    use super::*;
    use crate::event::test_support::{member, state};

    const ROOM: &str = "!lounge:example.com";

    fn room() -> Room {
        Room::new(RoomId::parse(ROOM).unwrap())
    }

    fn own() -> ruma::OwnedUserId {
        UserId::parse("@bob:example.com").unwrap()
    }

    #[test]
    fn test_state_slots_hold_latest_event() {
        let mut room = room();
        room.apply_state(&state(ROOM, "@a:x.org", "$n1", "m.room.name", "", json!({"name": "Old"})));
        room.apply_state(&state(ROOM, "@a:x.org", "$n2", "m.room.name", "", json!({"name": "New"})));

        assert_eq!(room.display_name(&own()).as_deref(), Some("New"));
        assert_eq!(room.state_event("m.room.name", "").unwrap().event_id.as_str(), "$n2");
    }

    #[test]
    fn test_member_map_tracks_joins_and_leaves() {
        let mut room = room();
        room.apply_state(&member(ROOM, "@a:x.org", "join", Some("Alice")));
        room.apply_state(&member(ROOM, "@b:x.org", "join", None));
        assert_eq!(room.member_count(), 2);

        let alice = UserId::parse("@a:x.org").unwrap();
        assert_eq!(room.member_display_name(&alice), "Alice");
        let bob = UserId::parse("@b:x.org").unwrap();
        assert_eq!(room.member_display_name(&bob), "@b:x.org");

        room.apply_state(&member(ROOM, "@a:x.org", "leave", Some("Alice")));
        assert_eq!(room.member_count(), 1);
        assert!(room.member(&alice).is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut room = room();
        assert_eq!(room.display_name(&own()), None);

        room.apply_state(&member(ROOM, "@bob:example.com", "join", Some("Bob")));
        room.apply_state(&member(ROOM, "@a:x.org", "join", Some("Alice")));
        // Two-person room falls back to the other member.
        assert_eq!(room.display_name(&own()).as_deref(), Some("Alice"));

        room.apply_state(&state(
            ROOM,
            "@a:x.org",
            "$alias",
            "m.room.canonical_alias",
            "",
            json!({"alias": "#lounge:example.com"}),
        ));
        assert_eq!(room.display_name(&own()).as_deref(), Some("#lounge:example.com"));

        room.apply_state(&state(ROOM, "@a:x.org", "$name", "m.room.name", "", json!({"name": "Lounge"})));
        assert_eq!(room.display_name(&own()).as_deref(), Some("Lounge"));
    }

    #[test]
    fn test_tags_and_unread_counters() {
        let mut room = room();
        room.apply_tags(&json!({"tags": {"m.favourite": {"order": 0.1}, "work": {}}}));
        assert_eq!(room.metadata().tags, vec!["m.favourite", "work"]);

        room.add_unread(true, false);
        room.add_unread(true, true);
        assert_eq!(room.metadata().unread_notifications, 2);
        assert_eq!(room.metadata().unread_highlights, 1);
        room.mark_read();
        assert_eq!(room.metadata().unread_notifications, 0);
        assert_eq!(room.metadata().unread_highlights, 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut room = room();
        room.load(dir.path()).unwrap();
        room.apply_state(&state(ROOM, "@a:x.org", "$name", "m.room.name", "", json!({"name": "Lounge"})));
        room.apply_state(&member(ROOM, "@a:x.org", "join", Some("Alice")));
        room.unload(dir.path(), 6).unwrap();

        assert!(!room.is_loaded());
        assert_eq!(room.member_count(), 0);
        // Metadata survives unload.
        assert_eq!(room.metadata().name.as_deref(), Some("Lounge"));

        room.load(dir.path()).unwrap();
        assert!(room.is_loaded());
        assert_eq!(room.member_count(), 1);
        assert_eq!(room.state_event("m.room.name", "").unwrap().content["name"], json!("Lounge"));
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut room = room();
        room.load(dir.path()).unwrap();
        room.apply_state(&member(ROOM, "@a:x.org", "join", None));
        room.unload(dir.path(), 6).unwrap();

        // Overwrite the snapshot with garbage.
        let path = dir.path().read_dir().unwrap().next().unwrap().unwrap().path();
        std::fs::write(&path, b"not gzip at all").unwrap();

        match room.load(dir.path()) {
            Err(Error::BadSnapshot(_)) => {}
            other => panic!("expected BadSnapshot, got {other:?}"),
        }
    }
}
