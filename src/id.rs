//! Connection identifier generation
//!
//! IDs are fixed-width lowercase hex so that plain string comparison orders
//! them by creation time first and by generator counter second.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of the timestamp component in bytes (48-bit milliseconds)
const TIMESTAMP_BYTES: usize = 6;

/// Source of unique connection identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce the next identifier
    fn next_id(&self) -> String;
}

/// Time + counter + random identifier generator
///
/// Layout (28 hex chars): 12 chars of milliseconds since the Unix epoch,
/// 8 chars of monotonic counter, 8 chars of random bits.
#[derive(Debug, Default)]
pub struct SortableIdGenerator {
    counter: AtomicU32,
}

impl SortableIdGenerator {
    /// Create a generator with its counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SortableIdGenerator {
    fn next_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let random: u32 = rand::random();

        let mut raw = [0u8; TIMESTAMP_BYTES + 8];
        raw[..TIMESTAMP_BYTES].copy_from_slice(&millis.to_be_bytes()[8 - TIMESTAMP_BYTES..]);
        raw[TIMESTAMP_BYTES..TIMESTAMP_BYTES + 4].copy_from_slice(&counter.to_be_bytes());
        raw[TIMESTAMP_BYTES + 4..].copy_from_slice(&random.to_be_bytes());

        hex::encode(raw)
    }
}

/// Deterministic generator for tests: `prefix-000001`, `prefix-000002`, ...
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Create a generator producing IDs with the given prefix
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n:06}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sortable_id_shape() {
        let gen = SortableIdGenerator::new();
        let id = gen.next_id();

        assert_eq!(id.len(), 28);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sortable_ids_follow_creation_order() {
        let gen = SortableIdGenerator::new();
        let ids: Vec<String> = (0..1000).map(|_| gen.next_id()).collect();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_sortable_ids_unique_across_threads() {
        let gen = Arc::new(SortableIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || (0..500).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_sequential_ids() {
        let gen = SequentialIdGenerator::new("conn");
        assert_eq!(gen.next_id(), "conn-000001");
        assert_eq!(gen.next_id(), "conn-000002");
    }
}
