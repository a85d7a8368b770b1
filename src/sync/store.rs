// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Keyed resource cache.
//!
//! Maps a stable identifier (object UID) to the latest known snapshot of
//! that object. Mutation is unconditional upsert/delete: the last writer
//! wins regardless of arrival order, which makes page merges and watch
//! event application commutative and idempotent. The transport is expected
//! to deliver events for a single identifier in order; the store does not
//! compare resource versions.
//!
//! Reads are copy-on-write: `snapshot()` hands out the current map behind an
//! `Arc`, so readers always observe a complete version, never a partially
//! mutated one, and never block writers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::gateway::{ResourceObject, WatchEvent, WatchEventKind};

/// An immutable view of the store at one point in time.
pub type Snapshot<T> = Arc<HashMap<String, T>>;

/// Shared handle to one keyed cache. Cloning the handle shares the
/// underlying map; a fresh cache is a fresh `KeyedStore`.
#[derive(Debug)]
pub struct KeyedStore<T> {
    entries: Arc<RwLock<Snapshot<T>>>,
}

impl<T> Clone for KeyedStore<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for KeyedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> KeyedStore<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current entries. Cheap (one Arc clone); the returned map is detached
    /// from subsequent mutation.
    pub fn snapshot(&self) -> Snapshot<T> {
        Arc::clone(&self.entries.read().unwrap())
    }
}

impl<T: Clone> KeyedStore<T> {
    /// Insert or replace the entry for `id`.
    pub fn upsert(&self, id: impl Into<String>, value: T) {
        let mut guard = self.entries.write().unwrap();
        Arc::make_mut(&mut *guard).insert(id.into(), value);
    }

    /// Remove the entry for `id`. Removing an absent identifier is a no-op.
    pub fn remove(&self, id: &str) {
        let mut guard = self.entries.write().unwrap();
        if guard.contains_key(id) {
            Arc::make_mut(&mut *guard).remove(id);
        }
    }

    #[allow(dead_code)]
    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.read().unwrap().get(id).cloned()
    }

    /// Drop every entry. Used on session teardown.
    pub fn clear(&self) {
        *self.entries.write().unwrap() = Arc::new(HashMap::new());
    }
}

impl KeyedStore<ResourceObject> {
    /// Merge one watch event: Added/Updated upsert, Deleted removes.
    pub fn apply(&self, event: &WatchEvent) {
        match event.kind {
            WatchEventKind::Added | WatchEventKind::Updated => {
                self.upsert(event.object.uid.clone(), event.object.clone());
            }
            WatchEventKind::Deleted => {
                self.remove(&event.object.uid);
            }
        }
    }

    /// Merge a page of list results (upsert each item).
    pub fn merge_items(&self, items: &[ResourceObject]) {
        for item in items {
            self.upsert(item.uid.clone(), item.clone());
        }
    }
}
