//! Paged sparse sets mapping entities to dense indices.
//!
//! Sparse pages are allocated on first use and never shrunk,
//! so memory is proportional to the highest page touched rather than to the largest entity index.

use crate::error::StorageError;
use crate::Entity;
use std::mem::size_of;

const ABSENT: u64 = u64::MAX;

fn alloc_page(page_size: usize) -> Result<Box<[u64]>, StorageError> {
    let mut page = Vec::new();
    page.try_reserve_exact(page_size)
        .map_err(|_| StorageError::OutOfMemory {
            bytes: page_size.saturating_mul(size_of::<u64>()),
        })?;
    page.resize(page_size, ABSENT);
    tracing::trace!(page_size, "allocated sparse page");
    Ok(page.into_boxed_slice())
}

/// A paged `entity -> dense index` map without a dense array.
///
/// The owner keeps its dense region compact: after [remove](Self::remove)
/// it must [relocate](Self::relocate) whichever key held the last index.
pub struct SparseIndex {
    pages: Vec<Option<Box<[u64]>>>,
    page_size: usize,
    len: usize,
}

impl SparseIndex {
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "sparse page size must be non-zero");
        SparseIndex {
            pages: Vec::new(),
            page_size,
            len: 0,
        }
    }

    #[inline]
    fn split(&self, entity: Entity) -> (usize, usize) {
        let index = entity.index() as usize;
        (index / self.page_size, index % self.page_size)
    }

    #[inline]
    fn slot(&self, entity: Entity) -> Option<&u64> {
        let (page, offset) = self.split(entity);
        self.pages.get(page)?.as_ref().map(|page| &page[offset])
    }

    /// Slot of an entity whose page is already allocated.
    fn slot_mut(&mut self, entity: Entity) -> &mut u64 {
        let (page, offset) = self.split(entity);
        match self.pages.get_mut(page) {
            Some(Some(page)) => &mut page[offset],
            _ => panic!("{:?} is not present in the sparse set", entity),
        }
    }

    /// Like [slot_mut](Self::slot_mut), allocating the page on first use.
    fn slot_or_alloc(&mut self, entity: Entity) -> Result<&mut u64, StorageError> {
        let (page, offset) = self.split(entity);
        if page >= self.pages.len() {
            self.pages
                .try_reserve(page + 1 - self.pages.len())
                .map_err(|_| StorageError::OutOfMemory {
                    bytes: (page + 1).saturating_mul(size_of::<Option<Box<[u64]>>>()),
                })?;
            self.pages.resize_with(page + 1, || None);
        }
        let page_size = self.page_size;
        let page = match &mut self.pages[page] {
            Some(page) => page,
            empty => empty.insert(alloc_page(page_size)?),
        };
        Ok(&mut page[offset])
    }

    /// Assigns the next dense index to `entity` and returns it.
    /// Fails only if a new page cannot be allocated, leaving the index unchanged.
    /// Panics if the entity is already present.
    pub fn emplace(&mut self, entity: Entity) -> Result<usize, StorageError> {
        let index = self.len;
        let slot = self.slot_or_alloc(entity)?;
        assert_eq!(*slot, ABSENT, "{:?} is already present in the sparse set", entity);
        *slot = index as u64;
        self.len += 1;
        Ok(index)
    }

    /// Points an already present `entity` at another dense index.
    pub fn relocate(&mut self, entity: Entity, index: usize) {
        let slot = self.slot_mut(entity);
        debug_assert_ne!(*slot, ABSENT, "{:?} is not present in the sparse set", entity);
        *slot = index as u64;
    }

    /// Returns the dense index of the entity.
    /// Panics if the entity is not present.
    #[inline]
    pub fn index(&self, entity: Entity) -> usize {
        #[cold]
        #[inline(never)]
        fn absent(entity: Entity) -> ! {
            panic!("{:?} is not present in the sparse set", entity);
        }

        self.get(entity).unwrap_or_else(|| absent(entity))
    }

    #[inline]
    pub fn get(&self, entity: Entity) -> Option<usize> {
        match self.slot(entity) {
            Some(&idx) if idx != ABSENT => Some(idx as usize),
            _ => None,
        }
    }

    #[inline]
    pub fn has(&self, entity: Entity) -> bool {
        self.get(entity).is_some()
    }

    /// Invalidates the entry of `entity` and returns the index it held.
    pub fn remove(&mut self, entity: Entity) -> Option<usize> {
        let index = self.get(entity)?;
        *self.slot_mut(entity) = ABSENT;
        self.len -= 1;
        Some(index)
    }

    /// Returns the number of present entities.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of allocated sparse pages.
    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

/// A paged sparse set with a packed dense array of entities.
///
/// Removal swaps the last entity into the freed slot, so dense indices are always `0..len()`.
pub struct PagedSparseSet {
    sparse: SparseIndex,
    dense: Vec<Entity>,
}

impl PagedSparseSet {
    pub fn new(page_size: usize) -> Self {
        PagedSparseSet {
            sparse: SparseIndex::new(page_size),
            dense: Vec::new(),
        }
    }

    /// Inserts the entity at the end of the dense array and returns its index.
    /// Panics if the entity is already present.
    pub fn emplace(&mut self, entity: Entity) -> Result<usize, StorageError> {
        self.dense
            .try_reserve(1)
            .map_err(|_| StorageError::OutOfMemory {
                bytes: (self.dense.len() + 1).saturating_mul(size_of::<Entity>()),
            })?;
        let index = self.sparse.emplace(entity)?;
        self.dense.push(entity);
        Ok(index)
    }

    /// Removes the entity and returns the index it occupied.
    /// The entity that was last, if any, now lives at that index.
    pub fn remove(&mut self, entity: Entity) -> Option<usize> {
        let index = self.sparse.remove(entity)?;
        self.dense.swap_remove(index);
        if let Some(&moved) = self.dense.get(index) {
            self.sparse.relocate(moved, index);
        }
        Some(index)
    }

    #[inline]
    pub fn index(&self, entity: Entity) -> usize {
        self.sparse.index(entity)
    }

    #[inline]
    pub fn get(&self, entity: Entity) -> Option<usize> {
        self.sparse.get(entity)
    }

    #[inline]
    pub fn has(&self, entity: Entity) -> bool {
        self.sparse.has(entity)
    }

    pub fn dense(&self) -> &[Entity] {
        &self.dense
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.dense.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn pages_are_allocated_lazily() {
        let mut index = SparseIndex::new(16);
        assert_eq!(index.page_count(), 0);

        index.emplace(Entity::new(100, 0)).unwrap();
        assert_eq!(index.page_count(), 1);
        assert!(!index.has(Entity::new(0, 0)));
        assert!(!index.has(Entity::new(10_000, 0)));
        assert_eq!(index.index(Entity::new(100, 0)), 0);

        index.remove(Entity::new(100, 0));
        assert_eq!(index.page_count(), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn unallocatable_page_is_reported() {
        let mut set = PagedSparseSet::new(usize::MAX / 4);
        let e = Entity::new(7, 0);

        assert!(matches!(set.emplace(e), Err(StorageError::OutOfMemory { .. })));
        assert!(set.is_empty());
        assert!(!set.has(e));
        assert_eq!(set.sparse.page_count(), 0);
    }

    #[test]
    #[should_panic(expected = "already present")]
    fn double_emplace_panics() {
        let mut set = PagedSparseSet::new(8);
        set.emplace(Entity::new(3, 0)).unwrap();
        set.emplace(Entity::new(3, 0)).unwrap();
    }

    #[test]
    fn swap_remove_keeps_dense_region_packed() {
        let mut set = PagedSparseSet::new(4);
        let entities: Vec<_> = (0..10).map(|i| Entity::new(i * 3, 0)).collect();
        for &e in &entities {
            set.emplace(e).unwrap();
        }

        assert_eq!(set.remove(entities[2]), Some(2));
        assert_eq!(set.dense()[2], entities[9]);
        assert_eq!(set.index(entities[9]), 2);
        assert_eq!(set.remove(entities[2]), None);

        assert_eq!(set.remove(entities[8]), Some(8));
        assert_eq!(set.len(), 8);
        for (i, &e) in set.dense().iter().enumerate() {
            assert_eq!(set.index(e), i);
        }
    }

    #[test]
    fn random_roundtrip() {
        let mut rng = rand::thread_rng();
        let mut set = PagedSparseSet::new(32);
        let mut present = HashSet::new();
        let mut pool: Vec<u32> = (0..500).collect();
        pool.shuffle(&mut rng);

        for _ in 0..5000 {
            let e = Entity::new(*pool.choose(&mut rng).unwrap(), 0);
            if rng.gen_bool(0.6) {
                if present.insert(e) {
                    set.emplace(e).unwrap();
                }
            } else if present.remove(&e) {
                assert!(set.remove(e).is_some());
            } else {
                assert_eq!(set.remove(e), None);
            }

            assert_eq!(set.len(), present.len());
        }

        for i in 0..500 {
            let e = Entity::new(i, 0);
            assert_eq!(set.has(e), present.contains(&e));
        }
        let mut seen = HashSet::new();
        for &e in &present {
            let idx = set.index(e);
            assert!(idx < set.len());
            assert!(seen.insert(idx));
            assert_eq!(set.dense()[idx], e);
        }
    }
}
