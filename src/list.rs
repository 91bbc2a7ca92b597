//! Slot-arena doubly linked lists.
//!
//! Eviction lists need O(1) unlink of an arbitrary element from whichever
//! thread currently owns that element, plus O(1) splicing of one list onto
//! another. Instead of heap nodes chained by raw pointers, entries live in a
//! single slot vector and are linked by slot index. Any number of [`Chain`]s
//! can thread through the same [`List`] arena, which is what lets the insert
//! and remove halves of an eviction list be spliced without moving entries.
//!
//! Handles are [`NodeId`]s: a slot index plus a stamp that changes every time
//! the slot is recycled, so a stale handle can always be told apart from the
//! entry that now occupies its slot.
//!
//! ```text
//!   chain.head                               chain.tail
//!       │                                        │
//!       ▼                                        ▼
//!   ┌───────┐ next ┌───────┐ next ┌───────┐ next ┌───────┐
//!   │ slot 4│─────▶│ slot 0│─────▶│ slot 7│─────▶│ slot 2│──▶ NIL
//!   │       │◀─────│       │◀─────│       │◀─────│       │
//!   └───────┘ prev └───────┘ prev └───────┘ prev └───────┘
//! ```

use core::fmt;

const NIL: u32 = u32::MAX;

/// Stable handle to an entry of a [`List`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    slot: u32,
    stamp: u32,
}

/// One slot of the arena.
struct Entry<T> {
    /// `None` while the slot sits on the free list.
    val: Option<T>,
    /// Bytes (live lists) or units (ghost lists) this entry accounts for.
    weight: u64,
    prev: u32,
    next: u32,
    stamp: u32,
}

/// Head/tail descriptor of one chain threaded through a [`List`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Chain {
    head: u32,
    tail: u32,
    len: usize,
    weight: u64,
}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

impl Chain {
    pub(crate) const fn new() -> Self {
        Chain {
            head: NIL,
            tail: NIL,
            len: 0,
            weight: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Summed weight of every entry on the chain.
    pub(crate) fn weight(&self) -> u64 {
        self.weight
    }
}

/// Arena of list entries shared by one or more [`Chain`]s.
pub(crate) struct List<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

impl<T> List<T> {
    pub(crate) const fn new() -> Self {
        List {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of occupied slots across all chains.
    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    fn id_of(&self, slot: u32) -> Option<NodeId> {
        if slot == NIL {
            return None;
        }
        Some(NodeId {
            slot,
            stamp: self.entries[slot as usize].stamp,
        })
    }

    /// True when `id` still names the entry it was issued for.
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.entries
            .get(id.slot as usize)
            .is_some_and(|e| e.stamp == id.stamp && e.val.is_some())
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&T> {
        if !self.contains(id) {
            return None;
        }
        self.entries[id.slot as usize].val.as_ref()
    }

    pub(crate) fn first(&self, chain: &Chain) -> Option<NodeId> {
        self.id_of(chain.head)
    }

    pub(crate) fn last(&self, chain: &Chain) -> Option<NodeId> {
        self.id_of(chain.tail)
    }

    /// Entry after `id` (towards the tail).
    pub(crate) fn next(&self, id: NodeId) -> Option<NodeId> {
        if !self.contains(id) {
            return None;
        }
        self.id_of(self.entries[id.slot as usize].next)
    }

    /// Entry before `id` (towards the head).
    pub(crate) fn prev(&self, id: NodeId) -> Option<NodeId> {
        if !self.contains(id) {
            return None;
        }
        self.id_of(self.entries[id.slot as usize].prev)
    }

    fn alloc(&mut self, val: T, weight: u64) -> u32 {
        match self.free.pop() {
            Some(slot) => {
                let e = &mut self.entries[slot as usize];
                e.val = Some(val);
                e.weight = weight;
                e.prev = NIL;
                e.next = NIL;
                slot
            }
            None => {
                let slot = self.entries.len() as u32;
                self.entries.push(Entry {
                    val: Some(val),
                    weight,
                    prev: NIL,
                    next: NIL,
                    stamp: 0,
                });
                slot
            }
        }
    }

    fn attach(&mut self, chain: &mut Chain, slot: u32) {
        let old_head = chain.head;
        {
            let e = &mut self.entries[slot as usize];
            e.prev = NIL;
            e.next = old_head;
            chain.weight += e.weight;
        }
        if old_head == NIL {
            chain.tail = slot;
        } else {
            self.entries[old_head as usize].prev = slot;
        }
        chain.head = slot;
        chain.len += 1;
    }

    #[cfg(test)]
    fn attach_last(&mut self, chain: &mut Chain, slot: u32) {
        let old_tail = chain.tail;
        {
            let e = &mut self.entries[slot as usize];
            e.next = NIL;
            e.prev = old_tail;
            chain.weight += e.weight;
        }
        if old_tail == NIL {
            chain.head = slot;
        } else {
            self.entries[old_tail as usize].next = slot;
        }
        chain.tail = slot;
        chain.len += 1;
    }

    fn detach(&mut self, chain: &mut Chain, slot: u32) {
        let (prev, next, weight) = {
            let e = &self.entries[slot as usize];
            (e.prev, e.next, e.weight)
        };
        if prev == NIL {
            chain.head = next;
        } else {
            self.entries[prev as usize].next = next;
        }
        if next == NIL {
            chain.tail = prev;
        } else {
            self.entries[next as usize].prev = prev;
        }
        let e = &mut self.entries[slot as usize];
        e.prev = NIL;
        e.next = NIL;
        chain.len -= 1;
        chain.weight -= weight;
    }

    /// Adds a value at the head of `chain`.
    pub(crate) fn add(&mut self, chain: &mut Chain, val: T, weight: u64) -> NodeId {
        let slot = self.alloc(val, weight);
        self.attach(chain, slot);
        NodeId {
            slot,
            stamp: self.entries[slot as usize].stamp,
        }
    }

    #[cfg(test)]
    /// Adds a value at the tail of `chain`.
    pub(crate) fn add_last(&mut self, chain: &mut Chain, val: T, weight: u64) -> NodeId {
        let slot = self.alloc(val, weight);
        self.attach_last(chain, slot);
        NodeId {
            slot,
            stamp: self.entries[slot as usize].stamp,
        }
    }

    /// Unlinks `id` from `chain` and returns its value and weight.
    ///
    /// The caller must pass the chain the entry is on. Returns `None` for a
    /// stale handle.
    pub(crate) fn remove(&mut self, chain: &mut Chain, id: NodeId) -> Option<(T, u64)> {
        if !self.contains(id) {
            return None;
        }
        self.detach(chain, id.slot);
        let e = &mut self.entries[id.slot as usize];
        e.stamp = e.stamp.wrapping_add(1);
        let val = e.val.take()?;
        let weight = e.weight;
        e.weight = 0;
        self.free.push(id.slot);
        Some((val, weight))
    }

    #[cfg(test)]
    /// Removes and returns the tail entry of `chain`.
    pub(crate) fn remove_last(&mut self, chain: &mut Chain) -> Option<(T, u64)> {
        let id = self.last(chain)?;
        self.remove(chain, id)
    }

    /// Moves `id` to the head of `chain`. Returns false for a stale handle.
    pub(crate) fn move_to_front(&mut self, chain: &mut Chain, id: NodeId) -> bool {
        if !self.contains(id) {
            return false;
        }
        if chain.head != id.slot {
            self.detach(chain, id.slot);
            self.attach(chain, id.slot);
        }
        true
    }

    /// Moves every entry of `src` in front of the entries of `dst`, keeping
    /// their relative order. `src` is left empty.
    pub(crate) fn splice_front(&mut self, dst: &mut Chain, src: &mut Chain) {
        if src.is_empty() {
            return;
        }
        if dst.is_empty() {
            *dst = *src;
        } else {
            self.entries[src.tail as usize].next = dst.head;
            self.entries[dst.head as usize].prev = src.tail;
            dst.head = src.head;
            dst.len += src.len;
            dst.weight += src.weight;
        }
        *src = Chain::new();
    }

    #[cfg(test)]
    /// Iterates over `chain` from head to tail.
    pub(crate) fn iter<'a>(&'a self, chain: &Chain) -> impl Iterator<Item = &'a T> + 'a {
        let mut slot = chain.head;
        core::iter::from_fn(move || {
            if slot == NIL {
                return None;
            }
            let e = &self.entries[slot as usize];
            slot = e.next;
            e.val.as_ref()
        })
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("slots", &self.entries.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &List<u32>, chain: &Chain) -> Vec<u32> {
        list.iter(chain).copied().collect()
    }

    #[test]
    fn test_add_and_order() {
        let mut list = List::new();
        let mut chain = Chain::new();
        list.add(&mut chain, 1, 10);
        list.add(&mut chain, 2, 20);
        list.add_last(&mut chain, 0, 5);
        assert_eq!(collect(&list, &chain), vec![2, 1, 0]);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.weight(), 35);
    }

    #[test]
    fn test_remove_middle_and_stale_handle() {
        let mut list = List::new();
        let mut chain = Chain::new();
        let a = list.add(&mut chain, 1, 1);
        let b = list.add(&mut chain, 2, 1);
        let _c = list.add(&mut chain, 3, 1);

        assert_eq!(list.remove(&mut chain, a), Some((1, 1)));
        assert_eq!(collect(&list, &chain), vec![3, 2]);
        // Removing again through the same handle is a no-op
        assert_eq!(list.remove(&mut chain, a), None);

        // The freed slot is recycled with a new stamp
        let d = list.add(&mut chain, 4, 1);
        assert_ne!(a, d);
        assert!(!list.contains(a));
        assert!(list.contains(d));
        assert!(list.contains(b));
    }

    #[test]
    fn test_move_to_front() {
        let mut list = List::new();
        let mut chain = Chain::new();
        let a = list.add(&mut chain, 1, 1);
        list.add(&mut chain, 2, 1);
        list.add(&mut chain, 3, 1);
        assert!(list.move_to_front(&mut chain, a));
        assert_eq!(collect(&list, &chain), vec![1, 3, 2]);
        // Already at the front
        assert!(list.move_to_front(&mut chain, a));
        assert_eq!(collect(&list, &chain), vec![1, 3, 2]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_splice_front_keeps_handles_valid() {
        let mut list = List::new();
        let mut insert = Chain::new();
        let mut remove = Chain::new();
        let old = list.add(&mut remove, 1, 4);
        let new = list.add(&mut insert, 2, 8);
        list.add(&mut insert, 3, 8);

        list.splice_front(&mut remove, &mut insert);
        assert!(insert.is_empty());
        assert_eq!(insert.weight(), 0);
        assert_eq!(collect(&list, &remove), vec![3, 2, 1]);
        assert_eq!(remove.weight(), 20);

        // Handles issued before the splice still work against the new chain
        assert_eq!(list.remove(&mut remove, new), Some((2, 8)));
        assert_eq!(list.remove_last(&mut remove), Some((1, 4)));
        assert!(!list.contains(old));
        assert_eq!(collect(&list, &remove), vec![3]);
    }

    #[test]
    fn test_splice_into_empty() {
        let mut list = List::new();
        let mut insert = Chain::new();
        let mut remove = Chain::new();
        list.add(&mut insert, 1, 1);
        list.add(&mut insert, 2, 1);
        list.splice_front(&mut remove, &mut insert);
        assert_eq!(collect(&list, &remove), vec![2, 1]);
        assert_eq!(list.first(&remove).and_then(|id| list.get(id)), Some(&2));
        assert_eq!(list.last(&remove).and_then(|id| list.get(id)), Some(&1));
    }

    #[test]
    fn test_prev_next_walk() {
        let mut list = List::new();
        let mut chain = Chain::new();
        for v in 0..5u32 {
            list.add(&mut chain, v, 1);
        }
        let mut seen = Vec::new();
        let mut cursor = list.last(&chain);
        while let Some(id) = cursor {
            seen.push(*list.get(id).unwrap());
            cursor = list.prev(id);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(list.len(), 5);
    }
}
