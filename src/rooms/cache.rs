use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ruma::{OwnedRoomId, RoomId};
use tracing::{debug, info, instrument, warn};

use super::room::{Room, RoomMetadata};
use crate::{Error, Result, SessionConfig};

/// Hook consulted before a room is unloaded; returning `true` vetoes the
/// eviction (e.g. the room is currently displayed).
pub type UnloadVeto = Box<dyn Fn(&Room) -> bool + Send + Sync>;

/// Owns every `Room`, keyed by ID, and bounds how many stay fully loaded.
///
/// An LRU cache with two deviations from the textbook form: eviction
/// degrades to disk instead of deleting (metadata stays resident, heavy
/// state is spilled to the room's snapshot), and a veto hook can exempt
/// entries regardless of recency.
pub struct RoomCache {
    state_dir: PathBuf,
    list_path: PathBuf,
    compression: u32,

    rooms: HashMap<OwnedRoomId, Room>,
    /// Resident rooms only, least recently used at the front.
    order: VecDeque<OwnedRoomId>,

    max_resident: usize,
    max_idle: Duration,
    debounce: Duration,

    veto: Option<UnloadVeto>,
}

impl RoomCache {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state_dir: config.state_dir(),
            list_path: config.room_list_path(),
            compression: config.snapshot_compression_level,
            rooms: HashMap::new(),
            order: VecDeque::new(),
            max_resident: config.max_resident_rooms,
            max_idle: config.max_room_idle(),
            debounce: config.touch_debounce(),
            veto: None,
        }
    }

    pub fn set_unload_veto(&mut self, veto: UnloadVeto) {
        self.veto = Some(veto);
    }

    /// Total rooms known to the cache, resident or not.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Rooms currently holding heavy state in memory.
    pub fn resident_count(&self) -> usize {
        self.order.len()
    }

    pub fn get(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Returns the room, constructing and registering an unloaded one on
    /// first reference.
    pub fn get_or_create(&mut self, room_id: &RoomId) -> &mut Room {
        self.rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(room_id.to_owned()))
    }

    /// Makes sure the room's heavy state is resident, restoring it from
    /// its snapshot on first access. A corrupted snapshot is logged and
    /// the room starts empty; history is still in the event store.
    #[instrument(skip(self))]
    pub fn ensure_loaded(&mut self, room_id: &RoomId) -> Result<&mut Room> {
        let state_dir = self.state_dir.clone();
        let was_loaded = self
            .rooms
            .get(room_id)
            .map(Room::is_loaded)
            .unwrap_or(false);

        let room = self.get_or_create(room_id);
        if !room.is_loaded() {
            if let Err(e) = room.load(&state_dir) {
                match e {
                    Error::BadSnapshot(_) => {
                        warn!(room_id = %room_id, "discarding corrupted room snapshot: {e}");
                        room.force_loaded();
                    }
                    other => return Err(other),
                }
            }
        }

        if !was_loaded {
            self.order.push_back(room_id.to_owned());
            self.clean(false);
        }
        Ok(self
            .rooms
            .get_mut(room_id)
            .expect("room registered just above"))
    }

    /// Moves the room to the most-recently-used end. Touches within the
    /// debounce window are skipped so hot reads stay cheap.
    pub fn touch(&mut self, room_id: &RoomId, now: Instant) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if !room.is_loaded() {
            return;
        }
        if now.duration_since(room.last_touch()) < self.debounce {
            return;
        }
        room.mark_touched(now);
        if let Some(pos) = self.order.iter().position(|id| id == room_id) {
            self.order.remove(pos);
        }
        self.order.push_back(room_id.to_owned());
    }

    /// Evicts from the LRU end while the resident count exceeds the
    /// bound. Rooms younger than the max idle age stop the pass unless
    /// `force` is set; vetoed rooms are re-inserted at the MRU end so a
    /// fully pinned cache terminates instead of spinning.
    #[instrument(skip(self))]
    pub fn clean(&mut self, force: bool) {
        let mut examined = 0;
        let max_examined = self.order.len();

        while self.order.len() > self.max_resident && examined < max_examined {
            examined += 1;
            let Some(room_id) = self.order.front().cloned() else {
                break;
            };
            let Some(room) = self.rooms.get(&room_id) else {
                self.order.pop_front();
                continue;
            };

            // Front is the least recently used; if it is still young,
            // everything behind it is younger.
            if !force && room.last_touch().elapsed() < self.max_idle {
                break;
            }

            if let Some(veto) = &self.veto {
                if veto(room) {
                    debug!(room_id = %room_id, "eviction vetoed, re-pinning at MRU end");
                    self.order.pop_front();
                    self.order.push_back(room_id);
                    continue;
                }
            }

            self.order.pop_front();
            let state_dir = self.state_dir.clone();
            let compression = self.compression;
            if let Some(room) = self.rooms.get_mut(&room_id) {
                if let Err(e) = room.unload(&state_dir, compression) {
                    warn!(room_id = %room_id, "failed to flush room on eviction: {e}");
                }
            }
            debug!(room_id = %room_id, "room evicted");
        }
    }

    /// Flushes every dirty resident room without evicting anything.
    pub fn flush_all(&mut self) -> Result<()> {
        let state_dir = self.state_dir.clone();
        let compression = self.compression;
        for room in self.rooms.values_mut() {
            if room.is_loaded() && room.is_dirty() {
                room.flush(&state_dir, compression)?;
            }
        }
        Ok(())
    }

    /// Persists every room's lightweight metadata as one compressed
    /// snapshot for fast startup.
    #[instrument(skip(self))]
    pub fn save_list(&self) -> Result<()> {
        if let Some(parent) = self.list_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let list: Vec<&RoomMetadata> = self.rooms.values().map(Room::metadata).collect();
        let file = File::create(&self.list_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(self.compression));
        serde_json::to_writer(&mut encoder, &list)?;
        encoder.finish()?.flush()?;
        info!(rooms = list.len(), "room list saved");
        Ok(())
    }

    /// Restores the metadata snapshot, registering every room unloaded.
    /// Malformed entries are skipped and logged, never fatal to startup.
    #[instrument(skip(self))]
    pub fn load_list(&mut self) -> Result<()> {
        if !self.list_path.exists() {
            return Ok(());
        }
        let file = File::open(&self.list_path)?;
        let entries: Vec<serde_json::Value> =
            serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
                .map_err(|e| Error::bad_snapshot(format!("room list: {e}")))?;

        let mut restored = 0usize;
        for entry in entries {
            match serde_json::from_value::<RoomMetadata>(entry) {
                Ok(meta) => {
                    self.rooms
                        .entry(meta.room_id.clone())
                        .or_insert_with(|| Room::from_metadata(meta));
                    restored += 1;
                }
                Err(e) => {
                    warn!("skipping malformed room list entry: {e}");
                }
            }
        }
        info!(rooms = restored, "room list restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::UserId;
    use serde_json::json;

    use super::*;
    use crate::event::test_support::{member, state};

    fn config(dir: &std::path::Path, max_resident: usize) -> SessionConfig {
        let mut config = SessionConfig::with_data_dir(
            UserId::parse("@bob:example.com").unwrap(),
            dir.to_path_buf(),
        );
        config.max_resident_rooms = max_resident;
        config.max_room_idle_secs = 0; // everything is instantly stale
        config.touch_debounce_ms = 0;
        config
    }

    fn room_id(n: usize) -> OwnedRoomId {
        RoomId::parse(format!("!room{n}:example.com")).unwrap()
    }

    #[test]
    fn test_get_or_create_registers_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RoomCache::new(&config(dir.path(), 4));

        let id = room_id(1);
        cache.get_or_create(&id);
        cache.get_or_create(&id);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resident_count(), 0); // unloaded rooms are not resident
    }

    #[test]
    fn test_eviction_spills_lru_room() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RoomCache::new(&config(dir.path(), 2));

        for n in 0..3 {
            let id = room_id(n);
            let room = cache.ensure_loaded(&id).unwrap();
            room.apply_state(&member(id.as_str(), "@a:x.org", "join", None));
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.resident_count(), 2);
        // The first room was evicted but its entry survives.
        assert!(!cache.get(&room_id(0)).unwrap().is_loaded());
        assert!(cache.get(&room_id(2)).unwrap().is_loaded());

        // Reloading restores the spilled state.
        let room = cache.ensure_loaded(&room_id(0)).unwrap();
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_young_rooms_survive_unforced_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1);
        config.max_room_idle_secs = 3600;
        let mut cache = RoomCache::new(&config);

        cache.ensure_loaded(&room_id(0)).unwrap();
        cache.ensure_loaded(&room_id(1)).unwrap();
        // Over the bound, but both rooms were touched just now.
        assert_eq!(cache.resident_count(), 2);

        cache.clean(true);
        assert_eq!(cache.resident_count(), 1);
    }

    #[test]
    fn test_vetoed_room_is_never_evicted_and_ends_mru() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RoomCache::new(&config(dir.path(), 1));
        let pinned = room_id(0);
        let pinned_for_hook = pinned.clone();
        cache.set_unload_veto(Box::new(move |room| room.room_id() == &*pinned_for_hook));

        cache.ensure_loaded(&pinned).unwrap();
        cache.ensure_loaded(&room_id(1)).unwrap();
        cache.ensure_loaded(&room_id(2)).unwrap();

        // The pinned room outlives every eviction pass and ends up at the
        // MRU end; the unpinned rooms are the ones spilled.
        assert!(cache.get(&pinned).unwrap().is_loaded());
        assert_eq!(cache.resident_count(), 1);
        assert_eq!(cache.order.back(), Some(&pinned));
    }

    #[test]
    fn test_touch_moves_to_mru_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RoomCache::new(&config(dir.path(), 8));
        cache.ensure_loaded(&room_id(0)).unwrap();
        cache.ensure_loaded(&room_id(1)).unwrap();

        cache.touch(&room_id(0), Instant::now());
        assert_eq!(cache.order.back(), Some(&room_id(0)));
    }

    #[test]
    fn test_touch_debounce_skips_reorder() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 8);
        config.touch_debounce_ms = 10_000;
        let mut cache = RoomCache::new(&config);
        cache.ensure_loaded(&room_id(0)).unwrap();
        cache.ensure_loaded(&room_id(1)).unwrap();

        // Within the debounce window of the load-time touch: skipped.
        cache.touch(&room_id(0), Instant::now());
        assert_eq!(cache.order.back(), Some(&room_id(1)));
    }

    #[test]
    fn test_room_list_round_trip_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 8);

        {
            let mut cache = RoomCache::new(&config);
            let id = room_id(0);
            let room = cache.ensure_loaded(&id).unwrap();
            room.apply_state(&state(
                id.as_str(),
                "@a:x.org",
                "$name",
                "m.room.name",
                "",
                json!({"name": "Lounge"}),
            ));
            cache.get_or_create(&room_id(1));
            cache.save_list().unwrap();
        }

        // Append a malformed entry by rewriting the snapshot.
        let raw = {
            let file = File::open(config.room_list_path()).unwrap();
            let mut entries: Vec<serde_json::Value> =
                serde_json::from_reader(GzDecoder::new(file)).unwrap();
            entries.push(json!({"not_a_room": true}));
            entries
        };
        {
            let file = File::create(config.room_list_path()).unwrap();
            let mut encoder = GzEncoder::new(file, Compression::new(6));
            serde_json::to_writer(&mut encoder, &raw).unwrap();
            encoder.finish().unwrap();
        }

        let mut cache = RoomCache::new(&config);
        cache.load_list().unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.resident_count(), 0);
        assert_eq!(
            cache.get(&room_id(0)).unwrap().metadata().name.as_deref(),
            Some("Lounge")
        );
    }
}
