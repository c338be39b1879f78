use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Session configuration.
///
/// Loaded from an optional TOML file merged with `HEARTH_`-prefixed
/// environment variables; everything except `user_id` has a default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// The user this session belongs to. Push rules need it to tell own
    /// messages apart and to look up the per-room display name.
    pub user_id: OwnedUserId,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Upper bound on rooms kept fully loaded in memory.
    #[serde(default = "default_max_resident_rooms")]
    pub max_resident_rooms: usize,

    /// Rooms idle longer than this are eligible for eviction.
    #[serde(default = "default_max_room_idle_secs")]
    pub max_room_idle_secs: u64,

    /// Touches within this window are skipped to keep hot reads cheap.
    #[serde(default = "default_touch_debounce_ms")]
    pub touch_debounce_ms: u64,

    /// Gzip level for room state snapshots and the bulk room list.
    #[serde(default = "default_snapshot_compression_level")]
    pub snapshot_compression_level: u32,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hearth")
}

fn default_max_resident_rooms() -> usize {
    32
}

fn default_max_room_idle_secs() -> u64 {
    3600
}

fn default_touch_debounce_ms() -> u64 {
    200
}

fn default_snapshot_compression_level() -> u32 {
    6
}

impl SessionConfig {
    /// Loads the configuration from a TOML file (if given) merged with
    /// `HEARTH_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("HEARTH_"))
            .extract()
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// A minimal config rooted at `data_dir`, defaults everywhere else.
    pub fn with_data_dir(user_id: OwnedUserId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_id,
            data_dir: data_dir.into(),
            max_resident_rooms: default_max_resident_rooms(),
            max_room_idle_secs: default_max_room_idle_secs(),
            touch_debounce_ms: default_touch_debounce_ms(),
            snapshot_compression_level: default_snapshot_compression_level(),
        }
    }

    pub fn max_room_idle(&self) -> Duration {
        Duration::from_secs(self.max_room_idle_secs)
    }

    pub fn touch_debounce(&self) -> Duration {
        Duration::from_millis(self.touch_debounce_ms)
    }

    /// Directory holding one compressed state snapshot per room.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Path of the bulk room-metadata snapshot.
    pub fn room_list_path(&self) -> PathBuf {
        self.data_dir.join("rooms.json.gz")
    }

    /// Path of the event store database.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("events.db")
    }
}
