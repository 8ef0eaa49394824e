//! Write-back queues of saves and removals not yet flushed to storage.
//!
//! Pending inserts keep publication order and support O(1) cancellation by
//! key: items live in a slot arena threaded into a doubly linked list, and an
//! index maps each key to its slot. Pending deletes are an ordered list with
//! a membership set so a key is queued for deletion at most once per batch.
//!
//! A taken batch stays visible as in-flight state until the engine reports
//! the backend write finished, so a read during the write still sees it.
//!
//! [`PendingQueues`] is not synchronized. The engine keeps it behind a single
//! mutex so that both queues and the index change together.

use std::collections::{HashMap, HashSet};

use aerie_core::{ItemKey, PublishedItem};

use crate::storage::FlushBatch;

struct Slot {
    item: PublishedItem,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Insertion-ordered set of pending items, unique by key.
#[derive(Default)]
pub struct PendingInserts {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<ItemKey, usize>,
}

impl PendingInserts {
    /// Appends `item` at the tail.
    ///
    /// If an item with the same key was pending it is unlinked first and
    /// returned, so the key's position becomes the newest.
    pub fn push_back(&mut self, item: PublishedItem) -> Option<PublishedItem> {
        let key = item.key();
        let replaced = self.remove(&key);

        let slot = Slot {
            item,
            prev: self.tail,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(tail_slot) = self.slots[tail].as_mut() {
                    tail_slot.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.index.insert(key, idx);
        replaced
    }

    /// Unlinks the pending item for `key`, if any.
    pub fn remove(&mut self, key: &ItemKey) -> Option<PublishedItem> {
        let idx = self.index.remove(key)?;
        let slot = self.slots[idx].take()?;

        match slot.prev {
            Some(prev) => {
                if let Some(prev_slot) = self.slots[prev].as_mut() {
                    prev_slot.next = slot.next;
                }
            }
            None => self.head = slot.next,
        }
        match slot.next {
            Some(next) => {
                if let Some(next_slot) = self.slots[next].as_mut() {
                    next_slot.prev = slot.prev;
                }
            }
            None => self.tail = slot.prev,
        }
        self.free.push(idx);
        Some(slot.item)
    }

    #[must_use]
    pub fn get(&self, key: &ItemKey) -> Option<&PublishedItem> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|slot| &slot.item)
    }

    #[must_use]
    pub fn contains(&self, key: &ItemKey) -> bool {
        self.index.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterates pending items oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PublishedItem> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = self.slots[cursor?].as_ref()?;
            cursor = slot.next;
            Some(&slot.item)
        })
    }

    /// Unlinks every pending item of `node_id`. Returns how many were dropped.
    pub fn remove_node(&mut self, node_id: &str) -> usize {
        let keys: Vec<ItemKey> = self
            .index
            .keys()
            .filter(|key| key.belongs_to(node_id))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Consumes the list, returning items oldest first.
    #[must_use]
    pub fn into_items(mut self) -> Vec<PublishedItem> {
        let mut items = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match self.slots[idx].take() {
                Some(slot) => {
                    cursor = slot.next;
                    items.push(slot.item);
                }
                None => break,
            }
        }
        items
    }
}

/// Both pending queues plus the key index, mutated as one unit.
#[derive(Default)]
pub struct PendingQueues {
    inserts: PendingInserts,
    deletes: Vec<ItemKey>,
    deleted: HashSet<ItemKey>,
    /// Outcome per key of the batch being written; `None` is a delete.
    in_flight: HashMap<ItemKey, Option<PublishedItem>>,
    generation: u64,
}

impl PendingQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `item` for insertion.
    ///
    /// A pending insert for the same key is cancelled and replaced by a
    /// delete of that key followed by the new insert. Returns `true` when an
    /// earlier pending insert was superseded.
    pub fn enqueue_save(&mut self, item: PublishedItem) -> bool {
        match self.inserts.push_back(item) {
            Some(previous) => {
                self.queue_delete(previous.key());
                true
            }
            None => false,
        }
    }

    /// Queues a delete of `key` and cancels its pending insert.
    ///
    /// Returns `true` when a pending insert was cancelled.
    pub fn enqueue_remove(&mut self, key: ItemKey) -> bool {
        let cancelled = self.inserts.remove(&key).is_some();
        self.queue_delete(key);
        cancelled
    }

    fn queue_delete(&mut self, key: ItemKey) {
        if self.deleted.insert(key.clone()) {
            self.deletes.push(key);
        }
    }

    /// Drops pending inserts of `node_id`. Returns how many were dropped.
    pub fn cancel_node(&mut self, node_id: &str) -> usize {
        self.inserts.remove_node(node_id)
    }

    #[must_use]
    pub fn pending_insert(&self, key: &ItemKey) -> Option<&PublishedItem> {
        self.inserts.get(key)
    }

    /// Whether `key` is queued for deletion with no newer pending insert.
    #[must_use]
    pub fn is_pending_delete(&self, key: &ItemKey) -> bool {
        self.deleted.contains(key) && !self.inserts.contains(key)
    }

    /// State of `key` not yet reflected in the backend.
    ///
    /// `Some(Some(item))` for a queued or in-flight insert, `Some(None)` for
    /// a queued or in-flight delete, `None` when the backend is current.
    /// Queued operations take precedence over the in-flight batch.
    #[must_use]
    pub fn lookup(&self, key: &ItemKey) -> Option<Option<&PublishedItem>> {
        if let Some(item) = self.inserts.get(key) {
            return Some(Some(item));
        }
        if self.deleted.contains(key) {
            return Some(None);
        }
        self.in_flight.get(key).map(Option::as_ref)
    }

    /// Counts finished batch writes. A read that saw one value before going
    /// to the backend and another after may hold a row the batch changed.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of keys in the batch being written.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Newest pending insert of `node_id` by creation date.
    ///
    /// Among equal creation dates the most recently queued item wins.
    ///
    /// In-flight inserts count too, ranking before queued ones.
    #[must_use]
    pub fn newest_for_node(&self, node_id: &str) -> Option<&PublishedItem> {
        let in_flight = self
            .in_flight
            .iter()
            .filter(|(key, _)| !self.inserts.contains(key) && !self.deleted.contains(*key))
            .filter_map(|(_, item)| item.as_ref());
        in_flight
            .chain(self.inserts.iter())
            .filter(|item| item.node_id == node_id)
            .fold(None, |best: Option<&PublishedItem>, item| match best {
                Some(best) if best.creation_date > item.creation_date => Some(best),
                _ => Some(item),
            })
    }

    /// Pending inserts oldest first.
    pub fn inserts(&self) -> impl Iterator<Item = &PublishedItem> + '_ {
        self.inserts.iter()
    }

    #[must_use]
    pub fn insert_count(&self) -> usize {
        self.inserts.len()
    }

    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.deletes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    /// Swaps both queues for empty ones and returns their contents.
    ///
    /// The batch stays in flight until [`finish_batch`](Self::finish_batch).
    pub fn take_batch(&mut self) -> FlushBatch {
        let inserts = std::mem::take(&mut self.inserts).into_items();
        let deletes = std::mem::take(&mut self.deletes);
        self.deleted.clear();

        self.in_flight.clear();
        self.in_flight
            .extend(deletes.iter().map(|key| (key.clone(), None)));
        self.in_flight
            .extend(inserts.iter().map(|item| (item.key(), Some(item.clone()))));
        FlushBatch { inserts, deletes }
    }

    /// Marks the batch from the last [`take_batch`](Self::take_batch) as
    /// written, or as dropped after a failed write.
    pub fn finish_batch(&mut self) {
        self.in_flight.clear();
        self.generation += 1;
    }
}
