// src/slab.rs

/// Index of an occupied slab entry.
pub type ConnId = usize;

enum Slot<T> {
    Occupied(T),
    Free { next: Option<usize> },
}

/// Fixed-capacity arena with an intrusive free list.
///
/// Freed slots are pushed onto the head of the list and reused first, so ids
/// stay small and the backing vector never grows past `capacity`.
pub struct ConnectionSlab<T> {
    entries: Vec<Slot<T>>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
}

impl<T> ConnectionSlab<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) allocation. Returns `Err(value)` when the slab is full so the
    /// caller keeps ownership of what it tried to store.
    pub fn allocate(&mut self, value: T) -> Result<ConnId, T> {
        if let Some(idx) = self.head_free
            && let Some(&Slot::Free { next }) = self.entries.get(idx)
        {
            self.head_free = next;
            self.entries[idx] = Slot::Occupied(value);
            self.active_count += 1;
            return Ok(idx);
        }

        if self.entries.len() >= self.capacity {
            return Err(value);
        }
        self.entries.push(Slot::Occupied(value));
        self.active_count += 1;
        Ok(self.entries.len() - 1)
    }

    /// O(1) deallocation. Freeing an empty slot returns `None`.
    pub fn free(&mut self, id: ConnId) -> Option<T> {
        let slot = self.entries.get_mut(id)?;
        if let Slot::Free { .. } = slot {
            return None; // Double free prevention
        }
        let old = std::mem::replace(slot, Slot::Free { next: self.head_free });
        self.head_free = Some(id);
        self.active_count -= 1;
        match old {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    #[inline(always)]
    pub fn get(&self, id: ConnId) -> Option<&T> {
        match self.entries.get(id)? {
            Slot::Occupied(v) => Some(v),
            Slot::Free { .. } => None,
        }
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        match self.entries.get_mut(id)? {
            Slot::Occupied(v) => Some(v),
            Slot::Free { .. } => None,
        }
    }

    /// Ids of every occupied slot, collected so the caller may mutate the
    /// slab while walking them.
    pub fn ids(&self) -> Vec<ConnId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, Slot::Occupied(_)).then_some(i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied(v) => Some((i, v)),
            Slot::Free { .. } => None,
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(10);

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let idx1 = slab.allocate(100).unwrap();
        assert_eq!(idx1, 0);
        assert_eq!(slab.get(idx1), Some(&100));

        let idx2 = slab.allocate(101).unwrap();
        assert_eq!(idx2, 1);

        assert_eq!(slab.free(idx1), Some(100));
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.get(idx1), None);

        // Index 0 is reused since it was pushed to the head of the free list
        let idx3 = slab.allocate(102).unwrap();
        assert_eq!(idx3, 0);
        assert_eq!(slab.ids(), vec![0, 1]);
    }

    #[test]
    fn full_slab_hands_value_back() {
        let mut slab = ConnectionSlab::new(1);
        slab.allocate("a").unwrap();
        assert_eq!(slab.allocate("b"), Err("b"));
    }

    #[test]
    fn double_free_is_ignored() {
        let mut slab = ConnectionSlab::new(2);
        let id = slab.allocate(1).unwrap();
        assert_eq!(slab.free(id), Some(1));
        assert_eq!(slab.free(id), None);
        assert!(slab.is_empty());
        assert_eq!(slab.free(99), None);
    }
}
