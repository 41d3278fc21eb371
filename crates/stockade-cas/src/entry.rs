//! Entry metadata and the unreferenced-entry LRU list.
//!
//! Entries live in a generation-checked arena; slot 0 is a reserved
//! sentinel anchoring a circular doubly-linked list. Exactly the
//! entries whose reference count is zero are on the list, ordered
//! least-recently-used first from the sentinel's `next`. All mutation
//! happens under the cache monitor; the arena itself is not
//! synchronized.

use std::time::{Duration, Instant};

/// Positive-existence cache window for on-disk checks.
pub const EXISTS_WINDOW: Duration = Duration::from_secs(10);

const SENTINEL: u32 = 0;

/// Stable handle to an arena slot. The generation guards against a
/// handle outliving its entry and landing on a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

/// Blob metadata tracked by the cache.
#[derive(Debug)]
pub struct Entry {
    pub key: String,
    pub size: i64,
    pub ref_count: u32,
    pub exists_deadline: Instant,
}

#[derive(Debug)]
enum SlotState {
    Sentinel,
    Free { next_free: Option<u32> },
    Occupied(Entry),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    // list links; `Some` iff the slot is linked into the LRU list
    prev: Option<u32>,
    next: Option<u32>,
    state: SlotState,
}

/// Arena of entries plus the sentinel-anchored LRU list.
#[derive(Debug)]
pub struct EntryArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
}

impl EntryArena {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                prev: Some(SENTINEL),
                next: Some(SENTINEL),
                state: SlotState::Sentinel,
            }],
            free_head: None,
        }
    }

    /// Insert a new entry with one reference, off the list.
    pub fn insert(&mut self, key: String, size: i64) -> EntryId {
        let entry = Entry {
            key,
            size,
            ref_count: 1,
            exists_deadline: Instant::now() + EXISTS_WINDOW,
        };
        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = match slot.state {
                    SlotState::Free { next_free } => next_free,
                    _ => unreachable!("free list points at a live slot"),
                };
                slot.state = SlotState::Occupied(entry);
                slot.prev = None;
                slot.next = None;
                EntryId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    prev: None,
                    next: None,
                    state: SlotState::Occupied(entry),
                });
                EntryId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn slot(&self, id: EntryId) -> Option<&Slot> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation || !matches!(slot.state, SlotState::Occupied(_)) {
            return None;
        }
        Some(slot)
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        match self.slot(id)?.state {
            SlotState::Occupied(ref entry) => Some(entry),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        match slot.state {
            SlotState::Occupied(ref mut entry) => Some(entry),
            _ => None,
        }
    }

    pub fn is_linked(&self, id: EntryId) -> bool {
        self.slot(id).map(|s| s.prev.is_some()).unwrap_or(false)
    }

    /// The least-recently-used entry, if any entry is unreferenced.
    pub fn lru_head(&self) -> Option<EntryId> {
        let next = self.slots[SENTINEL as usize].next.expect("sentinel links");
        if next == SENTINEL {
            return None;
        }
        Some(EntryId {
            index: next,
            generation: self.slots[next as usize].generation,
        })
    }

    fn entry_index(&self, id: EntryId) -> u32 {
        assert!(id.index != SENTINEL, "sentinel cannot be an entry");
        let slot = &self.slots[id.index as usize];
        assert!(
            slot.generation == id.generation && matches!(slot.state, SlotState::Occupied(_)),
            "stale entry id {:?}",
            id
        );
        id.index
    }

    fn detach(&mut self, index: u32) {
        let slot = &self.slots[index as usize];
        let prev = slot.prev.expect("unlinking an unlinked entry");
        let next = slot.next.expect("unlinking an unlinked entry");
        self.slots[prev as usize].next = Some(next);
        self.slots[next as usize].prev = Some(prev);
        let slot = &mut self.slots[index as usize];
        slot.prev = None;
        slot.next = None;
    }

    fn link_before_sentinel(&mut self, index: u32) {
        let tail = self.slots[SENTINEL as usize].prev.expect("sentinel links");
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.prev.is_none() && slot.next.is_none());
        slot.prev = Some(tail);
        slot.next = Some(SENTINEL);
        self.slots[tail as usize].next = Some(index);
        self.slots[SENTINEL as usize].prev = Some(index);
    }

    /// Remove an unreferenced entry from the list (eviction path).
    pub fn unlink(&mut self, id: EntryId) {
        let index = self.entry_index(id);
        self.detach(index);
    }

    /// Take a reference; unlinks on the zero-to-one transition.
    /// Returns true iff the entry changed from unreferenced to
    /// referenced.
    pub fn increment_reference(&mut self, id: EntryId) -> bool {
        let index = self.entry_index(id);
        let linked = self.slots[index as usize].prev.is_some();
        let ref_count = match self.slots[index as usize].state {
            SlotState::Occupied(ref entry) => entry.ref_count,
            _ => unreachable!(),
        };
        if ref_count == 0 {
            assert!(
                linked,
                "entry {:?} has a broken link and is being incremented",
                id
            );
            self.detach(index);
        }
        match self.slots[index as usize].state {
            SlotState::Occupied(ref mut entry) => {
                entry.ref_count += 1;
                entry.ref_count == 1
            }
            _ => unreachable!(),
        }
    }

    /// Drop a reference; links at the most-recently-used end on the
    /// one-to-zero transition. Returns true iff the entry became
    /// unreferenced.
    pub fn decrement_reference(&mut self, id: EntryId) -> bool {
        let index = self.entry_index(id);
        let freed = match self.slots[index as usize].state {
            SlotState::Occupied(ref mut entry) => {
                assert!(
                    entry.ref_count > 0,
                    "entry {} has 0 references and is being decremented",
                    entry.key
                );
                entry.ref_count -= 1;
                entry.ref_count == 0
            }
            _ => unreachable!(),
        };
        if freed {
            self.link_before_sentinel(index);
        }
        freed
    }

    /// Refresh an unreferenced entry's LRU position; no-op when
    /// referenced.
    pub fn record_access(&mut self, id: EntryId) {
        let index = self.entry_index(id);
        let unreferenced = match self.slots[index as usize].state {
            SlotState::Occupied(ref entry) => entry.ref_count == 0,
            _ => unreachable!(),
        };
        if unreferenced {
            assert!(
                self.slots[index as usize].prev.is_some(),
                "entry {:?} has a broken link and is being recorded",
                id
            );
            self.detach(index);
            self.link_before_sentinel(index);
        }
    }

    /// Free an unlinked slot, invalidating its id.
    pub fn remove(&mut self, id: EntryId) -> Entry {
        let index = self.entry_index(id);
        assert!(
            self.slots[index as usize].prev.is_none(),
            "removing a linked entry {:?}",
            id
        );
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let state = std::mem::replace(
            &mut slot.state,
            SlotState::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(index);
        match state {
            SlotState::Occupied(entry) => entry,
            _ => unreachable!(),
        }
    }

    /// Keys currently on the list, least-recently-used first.
    #[cfg(test)]
    fn lru_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let mut index = self.slots[SENTINEL as usize].next.unwrap();
        while index != SENTINEL {
            match self.slots[index as usize].state {
                SlotState::Occupied(ref entry) => keys.push(entry.key.clone()),
                _ => panic!("non-entry on the lru list"),
            }
            index = self.slots[index as usize].next.unwrap();
        }
        keys
    }
}

impl Default for EntryArena {
    fn default() -> Self {
        Self::new()
    }
}
