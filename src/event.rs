use std::fmt;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// 64-bit key ordering events within one room's durable log.
///
/// The key space is split at `LIVE_BASE`: values at or above it are handed
/// out by live append (strictly increasing), values below it by historical
/// prepend (strictly decreasing). The two sequences for one room can never
/// collide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct StreamPointer(pub u64);

impl StreamPointer {
    /// Midpoint of the key space; the first live append lands here.
    pub const LIVE_BASE: StreamPointer = StreamPointer(1 << 63);

    pub fn is_live(self) -> bool {
        self.0 >= Self::LIVE_BASE.0
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Pagination-token form: live pointers render as their offset from
    /// the base, historical pointers with a leading `-`.
    pub fn stringify(self) -> String {
        if self.is_live() {
            (self.0 - Self::LIVE_BASE.0).to_string()
        } else {
            format!("-{}", Self::LIVE_BASE.0 - self.0)
        }
    }
}

impl fmt::Display for StreamPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

/// Where in a sync batch an event came from; listeners receive this next
/// to the event itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventSource {
    JoinTimeline,
    JoinState,
    InviteState,
    LeaveTimeline,
}

/// One event in its compact persisted form: structured content retained,
/// raw wire bytes discarded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub origin_server_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
}

impl Event {
    /// The `content.body` text, if this event has one.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(JsonValue::as_str)
    }

    /// Resolves a push-rule field path against this event. `type`,
    /// `sender`, `room_id` and `state_key` are special-cased; anything
    /// else must be a `content.<subkey>` path. Only string values match.
    pub fn match_field(&self, key: &str) -> Option<String> {
        match key {
            "type" => Some(self.kind.clone()),
            "sender" => Some(self.sender.to_string()),
            "room_id" => Some(self.room_id.to_string()),
            "state_key" => self.state_key.clone(),
            _ => {
                let path = key.strip_prefix("content.")?;
                let mut value = &self.content;
                for part in path.split('.') {
                    value = value.get(part)?;
                }
                value.as_str().map(str::to_owned)
            }
        }
    }

    /// Strips the content and records the redaction, mirroring what a
    /// server-side redaction leaves behind.
    pub fn redact(&mut self, redaction: &Event) {
        self.content = JsonValue::Object(Default::default());
        self.unsigned = Some(json!({ "redacted_because": redaction }));
    }

    /// Replaces the content with an edit's `m.new_content`.
    pub fn apply_edit(&mut self, new_content: JsonValue) {
        self.content = new_content;
    }

    /// Bumps the locally aggregated count for one reaction key.
    pub fn bump_reaction(&mut self, key: &str) {
        let unsigned = self
            .unsigned
            .get_or_insert_with(|| JsonValue::Object(Default::default()));
        if !unsigned.is_object() {
            *unsigned = JsonValue::Object(Default::default());
        }
        let reactions = unsigned
            .as_object_mut()
            .expect("just ensured object")
            .entry("reactions".to_owned())
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if !reactions.is_object() {
            *reactions = JsonValue::Object(Default::default());
        }
        let map = reactions.as_object_mut().expect("just ensured object");
        let count = map.get(key).and_then(JsonValue::as_u64).unwrap_or(0);
        map.insert(key.to_owned(), json!(count + 1));
    }
}

/// An event as returned by the store, carrying its assigned pointer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub pointer: StreamPointer,
    pub event: Event,
}
