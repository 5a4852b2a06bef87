use dashmap::DashMap;

use crate::envelope::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub value: String,
    pub timestamp: Timestamp,
}

/// Outcome of reading a key against a client's freshness bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Fresh(StoreEntry),
    /// The local copy is older than what the client has already observed.
    Stale(Timestamp),
}

/// Key-value map with a write timestamp per key.
///
/// Entries are overwritten, never removed. Writers to different keys do not
/// contend on a common lock.
#[derive(Debug, Default)]
pub struct Store(DashMap<String, StoreEntry>);

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last writer wins, no comparison against the stored timestamp.
    pub fn put(&self, key: String, value: String, timestamp: Timestamp) -> Option<StoreEntry> {
        self.0.insert(key, StoreEntry { value, timestamp })
    }

    pub fn get(&self, key: &str) -> Option<StoreEntry> {
        self.0.get(key).map(|entry| entry.clone())
    }

    pub fn read(&self, key: &str, bound: Timestamp) -> Lookup {
        match self.get(key) {
            None => Lookup::Missing,
            Some(entry) if entry.timestamp >= bound => Lookup::Fresh(entry),
            Some(entry) => Lookup::Stale(entry.timestamp),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn missing_key() {
        let store = Store::new();
        assert_eq!(store.read("a", 0), Lookup::Missing);
        assert!(store.is_empty());
    }

    #[test]
    fn stale_read_reports_local_timestamp() {
        let store = Store::new();
        store.put("a".into(), "1".into(), 10);
        assert_eq!(store.read("a", 11), Lookup::Stale(10));
        assert_eq!(
            store.read("a", 10),
            Lookup::Fresh(StoreEntry {
                value: "1".into(),
                timestamp: 10
            })
        );
    }

    #[test]
    fn older_write_still_overwrites() {
        let store = Store::new();
        store.put("a".into(), "new".into(), 20);
        let previous = store.put("a".into(), "old".into(), 10);
        assert_eq!(previous.unwrap().timestamp, 20);
        assert_eq!(store.get("a").unwrap().value, "old");
        assert_eq!(store.len(), 1);
    }

    proptest! {
        #[test]
        fn fresh_iff_bound_not_ahead(timestamp in any::<i64>(), bound in any::<i64>()) {
            let store = Store::new();
            store.put("k".into(), "v".into(), timestamp);
            match store.read("k", bound) {
                Lookup::Fresh(entry) => prop_assert!(entry.timestamp >= bound),
                Lookup::Stale(local) => {
                    prop_assert!(local < bound);
                    prop_assert_eq!(local, timestamp);
                }
                Lookup::Missing => prop_assert!(false),
            }
        }

        #[test]
        fn repeated_write_is_idempotent(
            key in "[a-z]{1,8}",
            value in ".*",
            timestamp in any::<i64>(),
        ) {
            let once = Store::new();
            once.put(key.clone(), value.clone(), timestamp);
            let twice = Store::new();
            twice.put(key.clone(), value.clone(), timestamp);
            twice.put(key.clone(), value.clone(), timestamp);
            prop_assert_eq!(once.get(&key), twice.get(&key));
            prop_assert_eq!(once.len(), twice.len());
        }
    }
}
