use super::{KeyValueStore, MapValue, OrderedMap};
use crate::error::{DbError, IndexError};
use crate::row::SearchKey;
use crate::tx::Transaction;
use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// In-memory reference implementation of [`KeyValueStore`].
///
/// `persistent` is a stand-in for a disk-backed store: it only influences
/// which index build strategy the table picks, the data still lives on the
/// heap.
pub struct MemoryStore {
    maps: RwLock<HashMap<String, Arc<MemoryMap>>>,
    temp_seq: AtomicU64,
    persistent: bool,
}

impl MemoryStore {
    pub fn new(persistent: bool) -> Arc<Self> {
        Arc::new(Self {
            maps: RwLock::new(HashMap::new()),
            temp_seq: AtomicU64::new(0),
            persistent,
        })
    }

    /// How many temporary map names have been handed out so far.
    pub fn temporary_maps_allocated(&self) -> u64 {
        self.temp_seq.load(Ordering::Relaxed)
    }
}

impl KeyValueStore for MemoryStore {
    fn open_map(&self, name: &str) -> Arc<dyn OrderedMap> {
        self.maps
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| MemoryMap::new(name))
            .clone()
    }

    fn open_hash_map(&self, name: &str) -> Arc<dyn OrderedMap> {
        // The ordered map satisfies the unordered contract.
        self.open_map(name)
    }

    fn has_map(&self, name: &str) -> bool {
        self.maps.read().contains_key(name)
    }

    fn remove_map(&self, name: &str) -> Result<()> {
        self.maps
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| IndexError::NotFound(name.to_owned()).into())
    }

    fn next_temporary_map_name(&self) -> String {
        format!("temp.{}", self.temp_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}

struct Slot {
    value: MapValue,
    writer: u64,
}

struct MemoryMap {
    name: String,
    entries: RwLock<BTreeMap<SearchKey, Slot>>,
    // Weak self-handle so `&self` methods can hand owning references to the
    // transaction's undo closures.
    me: Weak<MemoryMap>,
}

impl MemoryMap {
    fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_owned(),
            entries: RwLock::new(BTreeMap::new()),
            me: me.clone(),
        })
    }

    fn owned(&self) -> Result<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or_else(|| DbError::Internal(format!("map `{}` dropped while in use", self.name)))
    }

    fn restore(&self, key: SearchKey, prev: Option<Slot>) {
        let mut entries = self.entries.write();
        match prev {
            Some(slot) => entries.insert(key, slot),
            None => entries.remove(&key),
        };
    }
}

impl OrderedMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &SearchKey) -> Option<MapValue> {
        self.entries.read().get(key).map(|slot| slot.value.clone())
    }

    fn put(&self, tx: &Transaction, key: SearchKey, value: MapValue) -> Result<Option<MapValue>> {
        tx.ensure_open()?;
        let map = self.owned()?;
        let prev = self.entries.write().insert(
            key.clone(),
            Slot {
                value,
                writer: tx.id(),
            },
        );
        let prev_value = prev.as_ref().map(|slot| slot.value.clone());
        tx.log_undo(Box::new(move || map.restore(key, prev)));
        Ok(prev_value)
    }

    fn remove(&self, tx: &Transaction, key: &SearchKey) -> Result<Option<MapValue>> {
        tx.ensure_open()?;
        let prev = self.entries.write().remove(key);
        let prev_value = prev.as_ref().map(|slot| slot.value.clone());
        if prev.is_some() {
            let map = self.owned()?;
            let key = key.clone();
            tx.log_undo(Box::new(move || map.restore(key, prev)));
        }
        Ok(prev_value)
    }

    fn clear(&self, tx: &Transaction) -> Result<()> {
        tx.ensure_open()?;
        let map = self.owned()?;
        let snapshot = std::mem::take(&mut *self.entries.write());
        tx.log_undo(Box::new(move || {
            *map.entries.write() = snapshot;
        }));
        Ok(())
    }

    fn len(&self) -> u64 {
        self.entries.read().len() as u64
    }

    fn byte_size(&self) -> u64 {
        // Rough accounting; the reference backend has no pages to measure.
        self.len() * std::mem::size_of::<(SearchKey, Slot)>() as u64
    }

    fn range(&self, first: Option<&SearchKey>, last: Option<&SearchKey>) -> Vec<(SearchKey, MapValue)> {
        let entries = self.entries.read();
        let lo = first.map_or(Bound::Unbounded, |k| Bound::Included(k.clone()));
        let hi = last.map_or(Bound::Unbounded, |k| Bound::Included(k.clone()));
        entries
            .range((lo, hi))
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }

    fn writer_of(&self, key: &SearchKey) -> Option<u64> {
        self.entries.read().get(key).map(|slot| slot.writer)
    }
}
