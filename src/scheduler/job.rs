use std::sync::Arc;

use slotmap::{new_key_type, SlotMap};

use crate::model::{Address, Key, Record};
use crate::timer::{Instant, TimerHandle};

new_key_type! {
    pub struct QueryJobId;
    pub struct ResponseJobId;
    pub struct ProbeJobId;
}

pub struct QueryJob {
    pub key: Arc<Key>,
    pub delivery: Instant,
    pub done: bool,
    pub timer: Option<TimerHandle>,
}

pub struct ResponseJob {
    pub record: Arc<Record>,
    pub delivery: Instant,
    pub done: bool,
    pub flush_cache: bool,
    pub querier: Option<Address>,
    pub timer: Option<TimerHandle>,
}

pub struct ProbeJob {
    pub record: Arc<Record>,
    pub delivery: Instant,
    pub chosen: bool,
    pub timer: Option<TimerHandle>,
}

/// Stable-handle job storage with an explicit insertion-order index.
///
/// A `SlotMap` alone gives O(1) removal but its own iteration order is not
/// dependable once slots get reused, and packet assembly must coalesce jobs
/// in the order they were posted. The separate `order` vec carries that
/// guarantee; removal is O(n) in the list length, which every job list here
/// stays small enough for.
pub struct JobList<K: slotmap::Key, V> {
    jobs: SlotMap<K, V>,
    order: Vec<K>,
}

impl<K: slotmap::Key, V> JobList<K, V> {
    pub fn new() -> Self {
        Self { jobs: SlotMap::with_key(), order: Vec::new() }
    }

    pub fn insert(&mut self, value: V) -> K {
        let id = self.jobs.insert(value);
        self.order.push(id);
        id
    }

    pub fn remove(&mut self, id: K) -> Option<V> {
        self.order.retain(|&x| x != id);
        self.jobs.remove(id)
    }

    pub fn get(&self, id: K) -> Option<&V> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut V> {
        self.jobs.get_mut(id)
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = K> + '_ {
        self.order.iter().copied()
    }

    pub fn find(&self, mut pred: impl FnMut(&V) -> bool) -> Option<K> {
        self.order.iter().copied().find(|&id| pred(&self.jobs[id]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<K: slotmap::Key, V> Default for JobList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
