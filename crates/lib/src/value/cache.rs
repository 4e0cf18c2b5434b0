//! A small memoizing cache shared between concurrent resolution branches.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// Thread-safe map where each entry is written once and read many times.
///
/// Locks are held only for the duration of a single get or insert, never
/// across an await point.
#[derive(Debug)]
pub struct Cache<K, V> {
  entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Cache<K, V> {
  fn default() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
    }
  }
}

impl<K, V> Cache<K, V>
where
  K: Eq + Hash,
  V: Clone,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &K) -> Option<V> {
    let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    entries.get(key).cloned()
  }

  /// Insert a value, keeping the existing one if another branch got there first.
  ///
  /// Returns the value that ends up in the cache.
  pub fn insert(&self, key: K, value: V) -> V {
    let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    entries.entry(key).or_insert(value).clone()
  }

  /// Insert a value, replacing any existing entry.
  pub fn replace(&self, key: K, value: V) {
    let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    entries.insert(key, value);
  }

  pub fn contains(&self, key: &K) -> bool {
    let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
