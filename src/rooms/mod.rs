pub mod cache;
pub mod room;

pub use cache::{RoomCache, UnloadVeto};
pub use room::{Member, Room, RoomMetadata, StateKey};
