// =============================================================================
// Hearth Messaging Session Core - Event Store
// =============================================================================
//
// Durable, per-room ordered log of events. Log keys are
// `shortroomid (8B BE) ++ stream pointer (8B BE)`, so one room's history is
// one contiguous key range and range scans walk it chronologically.
//
// The pointer space is split at the midpoint: live appends climb upward
// from `StreamPointer::LIVE_BASE`, historical prepends walk downward from
// just below it. Boundary bookkeeping lives behind one store-wide lock;
// the in-memory boundary maps are keyed by room ID, never by room object,
// so they survive cache eviction.
//
// =============================================================================

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use ruma::{EventId, OwnedRoomId, RoomId};
use tracing::{debug, instrument, warn};

use crate::{
    database::{u64_from_bytes, KeyValueEngine, KvTree},
    event::{Event, StoredEvent, StreamPointer},
    Error, Result,
};

const NEXT_SHORTROOMID: &[u8] = b"next_shortroomid";

/// Per-room boundary bookkeeping, keyed by room ID.
#[derive(Default)]
struct Boundaries {
    /// Next pointer to assign on append.
    live: HashMap<OwnedRoomId, u64>,
    /// Smallest pointer ever assigned by prepend.
    back: HashMap<OwnedRoomId, u64>,
}

pub struct EventStore {
    /// shortroomid ++ pointer -> serialized event
    eventlog: Arc<dyn KvTree>,
    /// event id -> full log key (secondary index)
    eventid_logid: Arc<dyn KvTree>,
    /// room id -> shortroomid
    roomid_shortroomid: Arc<dyn KvTree>,
    /// shortroomid -> next append pointer
    liveboundary: Arc<dyn KvTree>,
    /// shortroomid -> smallest assigned prepend pointer
    backboundary: Arc<dyn KvTree>,
    counters: Arc<dyn KvTree>,

    /// Serializes append/prepend/load so boundary bookkeeping stays
    /// correct; update also runs under it so a read-modify-write cannot
    /// race a concurrent append.
    boundaries: Mutex<Boundaries>,
}

impl EventStore {
    pub fn new(engine: &dyn KeyValueEngine) -> Result<Self> {
        Ok(Self {
            eventlog: engine.open_tree("eventlog")?,
            eventid_logid: engine.open_tree("eventid_logid")?,
            roomid_shortroomid: engine.open_tree("roomid_shortroomid")?,
            liveboundary: engine.open_tree("liveboundary")?,
            backboundary: engine.open_tree("backboundary")?,
            counters: engine.open_tree("counters")?,
            boundaries: Mutex::new(Boundaries::default()),
        })
    }

    fn short_room_id(&self, room_id: &RoomId) -> Result<Option<u64>> {
        self.roomid_shortroomid
            .get(room_id.as_bytes())?
            .map(|bytes| u64_from_bytes(&bytes))
            .transpose()
    }

    fn get_or_create_short_room_id(&self, room_id: &RoomId) -> Result<u64> {
        if let Some(short) = self.short_room_id(room_id)? {
            return Ok(short);
        }
        let short = self.counters.increment(NEXT_SHORTROOMID)?;
        self.roomid_shortroomid
            .insert(room_id.as_bytes(), &short.to_be_bytes())?;
        debug!(room_id = %room_id, short, "assigned short room id");
        Ok(short)
    }

    fn log_key(short: u64, pointer: u64) -> Vec<u8> {
        let mut key = short.to_be_bytes().to_vec();
        key.extend_from_slice(&pointer.to_be_bytes());
        key
    }

    fn parse_entry(key: &[u8], value: &[u8]) -> Result<StoredEvent> {
        if key.len() != 16 {
            return Err(Error::bad_database("malformed event log key"));
        }
        let pointer = StreamPointer(u64_from_bytes(&key[8..16])?);
        let event: Event = serde_json::from_slice(value)
            .map_err(|e| Error::bad_database(format!("malformed event in log: {e}")))?;
        Ok(StoredEvent { pointer, event })
    }

    /// Next append pointer for the room: in-memory map, then persisted
    /// record, then the start of the live half.
    fn live_boundary(&self, boundaries: &Boundaries, room_id: &RoomId, short: u64) -> Result<u64> {
        if let Some(&next) = boundaries.live.get(room_id) {
            return Ok(next);
        }
        match self.liveboundary.get(&short.to_be_bytes())? {
            Some(bytes) => u64_from_bytes(&bytes),
            None => Ok(StreamPointer::LIVE_BASE.0),
        }
    }

    /// Smallest pointer prepend has assigned so far, or `None` if the room
    /// has never been backfilled.
    fn back_boundary(
        &self,
        boundaries: &Boundaries,
        room_id: &RoomId,
        short: u64,
    ) -> Result<Option<u64>> {
        if let Some(&floor) = boundaries.back.get(room_id) {
            return Ok(Some(floor));
        }
        self.backboundary
            .get(&short.to_be_bytes())?
            .map(|bytes| u64_from_bytes(&bytes))
            .transpose()
    }

    /// Stores live events at strictly increasing pointers, advancing the
    /// room's live boundary. Creates the room's log on first use.
    #[instrument(skip(self, events))]
    pub fn append(&self, room_id: &RoomId, events: Vec<Event>) -> Result<Vec<StoredEvent>> {
        let mut boundaries = self.boundaries.lock();
        let short = self.get_or_create_short_room_id(room_id)?;
        let mut next = self.live_boundary(&boundaries, room_id, short)?;

        let mut stored = Vec::with_capacity(events.len());
        let mut log_batch = Vec::with_capacity(events.len());
        let mut index_batch = Vec::with_capacity(events.len());
        for event in events {
            debug_assert_eq!(event.room_id, room_id);
            let pointer = StreamPointer(next);
            debug_assert!(pointer.is_live(), "append pointer left the live range");
            let key = Self::log_key(short, next);
            log_batch.push((key.clone(), serde_json::to_vec(&event)?));
            index_batch.push((event.event_id.as_bytes().to_vec(), key));
            stored.push(StoredEvent { pointer, event });
            next += 1;
        }
        self.eventlog.insert_batch(&mut log_batch.into_iter())?;
        self.eventid_logid.insert_batch(&mut index_batch.into_iter())?;

        self.liveboundary
            .insert(&short.to_be_bytes(), &next.to_be_bytes())?;
        boundaries.live.insert(room_id.to_owned(), next);

        Ok(stored)
    }

    /// Stores historical events at strictly decreasing pointers below the
    /// live half. The backward boundary is the smallest pointer ever
    /// assigned for the room and survives restarts.
    #[instrument(skip(self, events))]
    pub fn prepend(&self, room_id: &RoomId, events: Vec<Event>) -> Result<Vec<StoredEvent>> {
        let mut boundaries = self.boundaries.lock();
        let short = self.get_or_create_short_room_id(room_id)?;
        let floor = self.back_boundary(&boundaries, room_id, short)?;
        let mut next = match floor {
            Some(floor) => floor
                .checked_sub(1)
                .ok_or_else(|| Error::bad_database("prepend pointer space exhausted"))?,
            None => StreamPointer::LIVE_BASE.0 - 1,
        };

        let mut stored = Vec::with_capacity(events.len());
        let mut log_batch = Vec::with_capacity(events.len());
        let mut index_batch = Vec::with_capacity(events.len());
        for event in events {
            debug_assert_eq!(event.room_id, room_id);
            if next == 0 {
                return Err(Error::bad_database("prepend pointer space exhausted"));
            }
            let pointer = StreamPointer(next);
            debug_assert!(!pointer.is_live(), "prepend pointer entered the live range");
            let key = Self::log_key(short, next);
            log_batch.push((key.clone(), serde_json::to_vec(&event)?));
            index_batch.push((event.event_id.as_bytes().to_vec(), key));
            stored.push(StoredEvent { pointer, event });
            next -= 1;
        }
        self.eventlog.insert_batch(&mut log_batch.into_iter())?;
        self.eventid_logid.insert_batch(&mut index_batch.into_iter())?;

        if let Some(last) = stored.last() {
            let smallest = last.pointer.0;
            self.backboundary
                .insert(&short.to_be_bytes(), &smallest.to_be_bytes())?;
            boundaries.back.insert(room_id.to_owned(), smallest);
        }

        Ok(stored)
    }

    /// Returns up to `count` events with pointer strictly below `hint`
    /// (below the live boundary when `hint` is `None`), oldest first,
    /// together with the smallest returned pointer as the next hint.
    #[instrument(skip(self))]
    pub fn load(
        &self,
        room_id: &RoomId,
        count: usize,
        hint: Option<StreamPointer>,
    ) -> Result<(Vec<StoredEvent>, Option<StreamPointer>)> {
        let boundaries = self.boundaries.lock();
        let short = self
            .short_room_id(room_id)?
            .ok_or_else(|| Error::room_not_found(room_id))?;

        let until = match hint {
            Some(pointer) if pointer.0 != 0 => pointer.0,
            _ => self.live_boundary(&boundaries, room_id, short)?,
        };
        if until == 0 {
            return Ok((Vec::new(), None));
        }

        let prefix = short.to_be_bytes();
        let start = Self::log_key(short, until - 1);
        let mut newest_first = Vec::with_capacity(count);
        // The limit keeps the scan from materializing older rooms' logs
        // below this room's key range.
        for (key, value) in self.eventlog.iter_from(&start, true, count) {
            if !key.starts_with(&prefix) || newest_first.len() == count {
                break;
            }
            match Self::parse_entry(&key, &value) {
                Ok(entry) => newest_first.push(entry),
                Err(e) => {
                    warn!(room_id = %room_id, "skipping malformed log entry: {e}");
                }
            }
        }

        newest_first.reverse();
        let boundary = newest_first.first().map(|entry| entry.pointer);
        Ok((newest_first, boundary))
    }

    /// Point lookup through the event-id index.
    #[instrument(skip(self))]
    pub fn get(&self, room_id: &RoomId, event_id: &EventId) -> Result<StoredEvent> {
        let short = self
            .short_room_id(room_id)?
            .ok_or_else(|| Error::room_not_found(room_id))?;
        let log_key = self
            .eventid_logid
            .get(event_id.as_bytes())?
            .ok_or_else(|| Error::event_not_found(event_id))?;
        // An index hit for another room's log is not a hit for this room.
        if !log_key.starts_with(&short.to_be_bytes()) {
            return Err(Error::event_not_found(event_id));
        }
        let value = self
            .eventlog
            .get(&log_key)?
            .ok_or_else(|| Error::bad_database("index points at missing log entry"))?;
        Self::parse_entry(&log_key, &value)
    }

    /// Atomic read-modify-write of one stored event, used for redactions,
    /// edits and reaction-count bumps. Runs under the store-wide lock so
    /// it cannot interleave with an append.
    #[instrument(skip(self, mutator))]
    pub fn update(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        mutator: impl FnOnce(&mut Event),
    ) -> Result<StoredEvent> {
        let _boundaries = self.boundaries.lock();
        let short = self
            .short_room_id(room_id)?
            .ok_or_else(|| Error::room_not_found(room_id))?;
        let log_key = self
            .eventid_logid
            .get(event_id.as_bytes())?
            .ok_or_else(|| Error::event_not_found(event_id))?;
        if !log_key.starts_with(&short.to_be_bytes()) {
            return Err(Error::event_not_found(event_id));
        }
        let value = self
            .eventlog
            .get(&log_key)?
            .ok_or_else(|| Error::bad_database("index points at missing log entry"))?;
        let mut entry = Self::parse_entry(&log_key, &value)?;
        mutator(&mut entry.event);
        self.eventlog
            .insert(&log_key, &serde_json::to_vec(&entry.event)?)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{EventId, RoomId};
    use serde_json::json;

    use super::*;
    use crate::{database::sqlite::SqliteEngine, event::test_support::message};

    fn store() -> EventStore {
        let engine = SqliteEngine::in_memory().unwrap();
        EventStore::new(engine.as_ref()).unwrap()
    }

    fn room() -> ruma::OwnedRoomId {
        RoomId::parse("!log:example.com").unwrap()
    }

    fn msg(event_id: &str, body: &str) -> Event {
        message("!log:example.com", "@alice:example.com", event_id, body)
    }

    #[test]
    fn test_append_pointers_strictly_increase() {
        let store = store();
        let room = room();

        let first = store.append(&room, vec![msg("$e1", "one"), msg("$e2", "two")]).unwrap();
        let second = store.append(&room, vec![msg("$e3", "three")]).unwrap();

        assert_eq!(first[0].pointer, StreamPointer::LIVE_BASE);
        assert!(first[1].pointer > first[0].pointer);
        assert!(second[0].pointer > first[1].pointer);
        assert!(second[0].pointer.is_live());
    }

    #[test]
    fn test_prepend_pointers_strictly_decrease_and_ranges_never_intersect() {
        let store = store();
        let room = room();

        let live = store.append(&room, vec![msg("$e1", "live")]).unwrap();
        let old1 = store.prepend(&room, vec![msg("$h1", "old"), msg("$h2", "older")]).unwrap();
        let old2 = store.prepend(&room, vec![msg("$h3", "oldest")]).unwrap();

        assert!(old1[1].pointer < old1[0].pointer);
        assert!(old2[0].pointer < old1[1].pointer);
        for entry in old1.iter().chain(old2.iter()) {
            assert!(!entry.pointer.is_live());
            assert!(entry.pointer < live[0].pointer);
        }
    }

    #[test]
    fn test_backward_boundary_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let room = room();

        let floor = {
            let engine = SqliteEngine::open(&path).unwrap();
            let store = EventStore::new(engine.as_ref()).unwrap();
            let stored = store.prepend(&room, vec![msg("$h1", "a"), msg("$h2", "b")]).unwrap();
            stored.last().unwrap().pointer
        };

        let engine = SqliteEngine::open(&path).unwrap();
        let store = EventStore::new(engine.as_ref()).unwrap();
        let stored = store.prepend(&room, vec![msg("$h3", "c")]).unwrap();
        assert!(stored[0].pointer < floor);
    }

    #[test]
    fn test_load_returns_ascending_window_with_boundary() {
        let store = store();
        let room = room();
        store
            .append(&room, vec![msg("$e1", "one"), msg("$e2", "two"), msg("$e3", "three")])
            .unwrap();

        let (events, boundary) = store.load(&room, 2, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.body(), Some("two"));
        assert_eq!(events[1].event.body(), Some("three"));
        assert_eq!(boundary, Some(events[0].pointer));

        // Paging further back with the returned hint yields the rest.
        let (older, older_boundary) = store.load(&room, 2, boundary).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].event.body(), Some("one"));
        assert_eq!(older_boundary, Some(older[0].pointer));
    }

    #[test]
    fn test_load_spans_prepended_history() {
        let store = store();
        let room = room();
        store.append(&room, vec![msg("$e1", "live")]).unwrap();
        store.prepend(&room, vec![msg("$h1", "old")]).unwrap();

        let (events, _) = store.load(&room, 10, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.body(), Some("old"));
        assert_eq!(events[1].event.body(), Some("live"));
        assert!(events[0].pointer < events[1].pointer);
    }

    #[test]
    fn test_get_returns_most_recent_write() {
        let store = store();
        let room = room();
        store.append(&room, vec![msg("$e1", "original")]).unwrap();

        let event_id = EventId::parse("$e1").unwrap();
        store
            .update(&room, &event_id, |event| {
                event.apply_edit(json!({ "msgtype": "m.text", "body": "edited" }))
            })
            .unwrap();

        let got = store.get(&room, &event_id).unwrap();
        assert_eq!(got.event.body(), Some("edited"));
    }

    #[test]
    fn test_update_redaction_and_reactions() {
        let store = store();
        let room = room();
        store.append(&room, vec![msg("$e1", "hi")]).unwrap();
        let event_id = EventId::parse("$e1").unwrap();

        store
            .update(&room, &event_id, |event| event.bump_reaction("👍"))
            .unwrap();
        let got = store.get(&room, &event_id).unwrap();
        assert_eq!(got.event.unsigned.as_ref().unwrap()["reactions"]["👍"], json!(1));

        let redaction = msg("$redaction", "");
        store
            .update(&room, &event_id, |event| event.redact(&redaction))
            .unwrap();
        let got = store.get(&room, &event_id).unwrap();
        assert!(got.event.content.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_missing_room_and_event_errors() {
        let store = store();
        let room = room();
        let event_id = EventId::parse("$nope").unwrap();

        assert!(matches!(store.get(&room, &event_id), Err(Error::RoomNotFound(_))));
        assert!(matches!(store.load(&room, 5, None), Err(Error::RoomNotFound(_))));

        store.append(&room, vec![msg("$e1", "hi")]).unwrap();
        assert!(matches!(store.get(&room, &event_id), Err(Error::EventNotFound(_))));

        // An event in another room's log is not visible through this room.
        let other = RoomId::parse("!other:example.com").unwrap();
        store
            .append(
                &other,
                vec![message("!other:example.com", "@alice:example.com", "$foreign", "x")],
            )
            .unwrap();
        let foreign = EventId::parse("$foreign").unwrap();
        assert!(matches!(store.get(&room, &foreign), Err(Error::EventNotFound(_))));
    }

    #[test]
    fn test_load_window_is_unaffected_by_other_rooms_logs() {
        let store = store();
        let first = RoomId::parse("!first:example.com").unwrap();
        let second = RoomId::parse("!second:example.com").unwrap();

        // The first room gets the lower short id, so its log sits directly
        // below the second room's key range.
        for n in 0..20 {
            store
                .append(
                    &first,
                    vec![message("!first:example.com", "@a:x.org", &format!("$f{n}"), "noise")],
                )
                .unwrap();
        }
        store
            .append(
                &second,
                vec![
                    message("!second:example.com", "@a:x.org", "$s1", "one"),
                    message("!second:example.com", "@a:x.org", "$s2", "two"),
                ],
            )
            .unwrap();

        let (events, boundary) = store.load(&second, 1, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.body(), Some("two"));
        assert_eq!(boundary, Some(events[0].pointer));

        // Paging past the second room's oldest event yields nothing from
        // the neighboring log.
        let (events, boundary) = store.load(&second, 5, boundary).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.body(), Some("one"));
        let (events, _) = store.load(&second, 5, boundary).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_fresh_room_load_with_zero_hint_uses_live_boundary() {
        let store = store();
        let room = room();
        store.append(&room, vec![msg("$e1", "one")]).unwrap();

        let (events, _) = store.load(&room, 5, Some(StreamPointer(0))).unwrap();
        assert_eq!(events.len(), 1);
    }
}
