//! Bounded tables that let native callbacks find managed objects by key.
//!
//! Native code can only hand back an integer (or another plain key) when it
//! calls into the managed side. These tables map such keys to live objects.
//! Both fail loudly with [`BridgeError::CapacityExceeded`] once full.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Maps keys to weakly held instances.
///
/// An entry whose instance has been dropped is dead: it no longer resolves and
/// is purged when the table needs room.
pub struct InstanceTable<K, V: ?Sized> {
    name: &'static str,
    max_size: AtomicUsize,
    entries: RwLock<HashMap<K, Weak<V>>>,
}

impl<K: Eq + Hash + Clone + fmt::Debug, V: ?Sized> InstanceTable<K, V> {
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self { name, max_size: AtomicUsize::new(max_size), entries: RwLock::new(HashMap::new()) }
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Changes the capacity. Existing entries are kept even if above the new limit.
    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    /// Adds `value` under `key`.
    ///
    /// Fails if a live instance is already registered under `key`, or if the
    /// table is still full after dead entries have been purged.
    pub fn insert(&self, key: K, value: &Arc<V>) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.strong_count() > 0 {
                return Err(BridgeError::invalid_argument(format!(
                    "{}: key {key:?} is already registered",
                    self.name
                )));
            }
        }
        let max_size = self.max_size();
        if entries.len() >= max_size && !entries.contains_key(&key) {
            let before = entries.len();
            entries.retain(|_, weak| weak.strong_count() > 0);
            debug!(table = self.name, purged = before - entries.len(), "purged dead entries");
            if entries.len() >= max_size {
                warn!(table = self.name, max_size, "instance table is full");
                return Err(BridgeError::capacity_exceeded(self.name, max_size));
            }
        }
        entries.insert(key, Arc::downgrade(value));
        Ok(())
    }

    /// Resolves `key` if its instance is still alive.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().get(key).and_then(Weak::upgrade)
    }

    /// Whether `key` resolves to a live instance. Never upgrades the entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.read().get(key).is_some_and(|weak| weak.strong_count() > 0)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Number of entries, including dead ones not purged yet.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<K, V: ?Sized> fmt::Debug for InstanceTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceTable")
            .field("name", &self.name)
            .field("len", &self.entries.read().len())
            .field("max_size", &self.max_size.load(Ordering::Relaxed))
            .finish()
    }
}

/// Key handed to native in place of a managed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackKey(i32);

impl CallbackKey {
    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn from_raw(raw: i32) -> Self {
        CallbackKey(raw)
    }
}

/// Holds callbacks strongly under generated keys. Keys are never reused.
pub struct CallbackTable<F: ?Sized> {
    name: &'static str,
    max_size: AtomicUsize,
    next_key: AtomicI32,
    slots: RwLock<HashMap<CallbackKey, Arc<F>>>,
}

impl<F: ?Sized> CallbackTable<F> {
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            max_size: AtomicUsize::new(max_size),
            next_key: AtomicI32::new(1),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    pub fn register(&self, callback: Arc<F>) -> Result<CallbackKey> {
        let mut slots = self.slots.write();
        let max_size = self.max_size();
        if slots.len() >= max_size {
            warn!(table = self.name, max_size, "callback table is full");
            return Err(BridgeError::capacity_exceeded(self.name, max_size));
        }
        let raw = self.next_key.fetch_add(1, Ordering::Relaxed);
        if raw <= 0 {
            return Err(BridgeError::capacity_exceeded(self.name, i32::MAX as usize));
        }
        let key = CallbackKey(raw);
        slots.insert(key, callback);
        Ok(key)
    }

    pub fn lookup(&self, key: CallbackKey) -> Option<Arc<F>> {
        self.slots.read().get(&key).cloned()
    }

    pub fn remove(&self, key: CallbackKey) -> Option<Arc<F>> {
        self.slots.write().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized> fmt::Debug for CallbackTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTable")
            .field("name", &self.name)
            .field("len", &self.slots.read().len())
            .field("max_size", &self.max_size.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dead_entries_do_not_resolve() {
        let table = InstanceTable::<u32, String>::new("test", 4);
        let value = Arc::new("a".to_string());
        table.insert(1, &value).unwrap();
        assert_eq!(table.get(&1).as_deref(), Some(&"a".to_string()));
        drop(value);
        assert!(table.get(&1).is_none());
        assert!(!table.contains_key(&1));
    }

    #[test]
    fn full_table_purges_dead_entries_first() {
        let table = InstanceTable::<u32, u32>::new("test", 2);
        let a = Arc::new(1);
        let b = Arc::new(2);
        table.insert(1, &a).unwrap();
        table.insert(2, &b).unwrap();
        let c = Arc::new(3);
        assert!(matches!(
            table.insert(3, &c),
            Err(BridgeError::CapacityExceeded { table: "test", max_size: 2 })
        ));
        drop(a);
        table.insert(3, &c).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_live_keys_are_rejected() {
        let table = InstanceTable::<&str, u32>::new("test", 4);
        let a = Arc::new(1);
        table.insert("k", &a).unwrap();
        let b = Arc::new(2);
        assert!(table.insert("k", &b).is_err());
        drop(a);
        table.insert("k", &b).unwrap();
        assert_eq!(table.get(&"k").map(|v| *v), Some(2));
    }

    #[test]
    fn callback_keys_are_unique_and_never_reused() {
        let table = CallbackTable::<dyn Fn() -> i32 + Send + Sync>::new("callbacks", 2);
        let a = table.register(Arc::new(|| 1)).unwrap();
        let b = table.register(Arc::new(|| 2)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(table.register(Arc::new(|| 3)), Err(BridgeError::CapacityExceeded { max_size: 2, .. })));
        assert_eq!(table.lookup(a).map(|f| f()), Some(1));
        assert_eq!(table.lookup(b).map(|f| f()), Some(2));
        assert!(table.remove(a).is_some());
        let c = table.register(Arc::new(|| 4)).unwrap();
        assert_ne!(c, a);
        assert_eq!(table.lookup(c).map(|f| f()), Some(4));
        assert!(table.lookup(a).is_none());
    }

    proptest! {
        #[test]
        fn live_entries_never_exceed_capacity(
            capacity in 1usize..8,
            ops in prop::collection::vec((0u32..16, any::<bool>()), 1..64),
        ) {
            let table = InstanceTable::<u32, u32>::new("prop", capacity);
            let mut alive: HashMap<u32, Arc<u32>> = HashMap::new();
            for (key, keep) in ops {
                let value = Arc::new(key);
                match table.insert(key, &value) {
                    Ok(()) if keep => {
                        alive.insert(key, value);
                    }
                    Ok(()) => drop(value),
                    Err(BridgeError::CapacityExceeded { .. }) => {
                        prop_assert!(alive.len() >= capacity);
                    }
                    Err(_) => prop_assert!(alive.contains_key(&key)),
                }
                let live = (0..16).filter(|k| table.get(k).is_some()).count();
                prop_assert!(live <= capacity);
                prop_assert_eq!(live, alive.len());
            }
        }
    }
}
