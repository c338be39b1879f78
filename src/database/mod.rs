// =============================================================================
// Hearth Messaging Session Core - Storage Abstraction
// =============================================================================
//
// Durable storage for the session core is expressed as named trees of
// byte-ordered key/value pairs. The event log, its secondary indexes and
// the boundary records are each one tree inside a single store file; the
// engine behind the traits is swappable without touching the callers.
//
// Keys are compared bytewise, so multi-part keys are built from big-endian
// fixed-width segments to make range scans line up with chronology.
//
// =============================================================================

pub mod sqlite;

use std::sync::Arc;

use crate::Result;

pub trait KeyValueEngine: Send + Sync {
    /// Opens (creating if needed) the named tree.
    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>>;

    /// Flushes all pending changes to disk.
    fn flush(&self) -> Result<()>;
}

pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Inserts a batch of pairs inside one storage transaction.
    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Up to `limit` key/value pairs starting at `from` (inclusive), in
    /// key order, or reversed when `backwards` is set. The bound is
    /// pushed into the storage query so a short read never materializes
    /// the rest of the tree.
    fn iter_from(&self, from: &[u8], backwards: bool, limit: usize) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Atomically increments the big-endian u64 stored at `key` (from 0 if
    /// absent) and returns the new value.
    fn increment(&self, key: &[u8]) -> Result<u64>;
}

/// Decodes a big-endian u64, erroring on bad widths instead of panicking.
pub(crate) fn u64_from_bytes(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| crate::Error::bad_database("invalid u64 width in store"))?;
    Ok(u64::from_be_bytes(array))
}
