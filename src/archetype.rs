pub(crate) mod chunk;
pub(crate) mod registry;

use crate::component::{ComponentState, Tick, TypeDescriptor};
use crate::error::StorageError;
use crate::sparse_set::SparseIndex;
use crate::{ComponentId, Entity, HashMap, StorageConfig};
use chunk::{Chunk, ChunkLayout, ChunkView, ChunkViewMut, MAX_INLINE_COMPONENTS};
use smallvec::SmallVec;
use std::hash::{BuildHasher, Hash, Hasher};

/// An archetype identifier.
pub type ArchetypeId = u32;

pub(crate) type ComponentIds = SmallVec<[ComponentId; MAX_INLINE_COMPONENTS]>;

// Fixed seeds keep archetype hashes identical across runs.
const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// A sorted set of component ids with its precomputed hash.
///
/// Equal hashes do not imply equal sets: lookups hash first and then compare the ids.
#[derive(Clone, Debug, Eq)]
pub(crate) struct ArchetypeKey {
    sorted_ids: ComponentIds,
    hash_val: u64,
}

impl ArchetypeKey {
    pub fn new(mut ids: ComponentIds) -> ArchetypeKey {
        ids.sort_unstable();
        ids.dedup();

        let [k0, k1, k2, k3] = HASH_SEEDS;
        let mut hasher = ahash::RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
        ids.hash(&mut hasher);
        let hash_val = hasher.finish();

        ArchetypeKey {
            sorted_ids: ids,
            hash_val,
        }
    }

    #[cfg(test)]
    pub fn with_hash(mut ids: ComponentIds, hash_val: u64) -> ArchetypeKey {
        ids.sort_unstable();
        ids.dedup();
        ArchetypeKey {
            sorted_ids: ids,
            hash_val,
        }
    }

    pub fn ids(&self) -> &[ComponentId] {
        &self.sorted_ids
    }

    pub fn hash_val(&self) -> u64 {
        self.hash_val
    }
}

impl PartialEq for ArchetypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash_val == other.hash_val && self.sorted_ids == other.sorted_ids
    }
}

impl Hash for ArchetypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_val.hash(state);
    }
}

/// A collection of entities with unique combination of components.
///
/// Entities are packed into fixed-capacity chunks: row `r` lives in chunk `r / capacity`
/// at slot `r % capacity`, and every chunk except the last one is full.
pub struct Archetype {
    id: ArchetypeId,
    key: ArchetypeKey,
    descriptors: Vec<TypeDescriptor>,
    layout: ChunkLayout,
    chunks: Vec<Chunk>,
    rows: SparseIndex,
    pub(crate) add_edges: HashMap<ComponentId, ArchetypeId>,
    pub(crate) remove_edges: HashMap<ComponentId, Option<ArchetypeId>>,
}

impl Archetype {
    pub(crate) fn new(
        id: ArchetypeId,
        key: ArchetypeKey,
        descriptors: Vec<TypeDescriptor>,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        debug_assert_eq!(key.ids().len(), descriptors.len());
        let layout = ChunkLayout::fitting(&descriptors, config)?;

        Ok(Archetype {
            id,
            key,
            descriptors,
            layout,
            chunks: Vec::new(),
            rows: SparseIndex::new(config.sparse_page_size),
            add_edges: Default::default(),
            remove_edges: Default::default(),
        })
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Sorted identifiers of the archetype components.
    pub fn component_ids(&self) -> &[ComponentId] {
        self.key.ids()
    }

    /// Returns iterator of archetype constituent component descriptors.
    pub fn iter_descriptors(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.descriptors.iter()
    }

    /// Returns the number of entities in the archetype.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Maximum number of entities in a single chunk.
    pub fn chunk_capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Size of a single chunk allocation in bytes.
    pub fn chunk_bytes(&self) -> usize {
        self.layout.chunk_bytes()
    }

    /// Returns the number of allocated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if the archetype contains the specified entity.
    pub fn contains(&self, entity: Entity) -> bool {
        self.rows.has(entity)
    }

    /// Returns the packed row of the entity.
    pub fn row_of(&self, entity: Entity) -> Option<usize> {
        self.rows.get(entity)
    }

    /// Panics if the entity is not in the archetype.
    #[inline]
    pub(crate) fn row(&self, entity: Entity) -> usize {
        self.rows.index(entity)
    }

    /// Returns `true` if the archetype stores every component of `ids`.
    pub fn has_all(&self, ids: &[ComponentId]) -> bool {
        ids.iter().all(|id| self.column_index(*id).is_some())
    }

    #[inline]
    pub(crate) fn column_index(&self, id: ComponentId) -> Option<usize> {
        self.key.ids().binary_search(&id).ok()
    }

    #[inline]
    pub(crate) fn descriptor(&self, col: usize) -> &TypeDescriptor {
        &self.descriptors[col]
    }

    #[inline]
    fn locate(&self, row: usize) -> (usize, usize) {
        let capacity = self.layout.capacity();
        (row / capacity, row % capacity)
    }

    /// Returns the entity stored at `row`.
    pub fn entity_at(&self, row: usize) -> Option<Entity> {
        let (chunk, slot) = self.locate(row);
        self.chunks.get(chunk)?.entities().get(slot).copied()
    }

    /// Reserves the next row for `entity` and returns it.
    /// States of all columns are initialized, values are not: the caller must write every column.
    pub(crate) fn allocate(&mut self, entity: Entity, tick: Tick) -> Result<usize, StorageError> {
        let row = self.rows.len();
        let (chunk_idx, slot) = self.locate(row);

        let fresh = chunk_idx == self.chunks.len();
        if fresh {
            self.chunks.push(Chunk::new(&self.layout)?);
        }
        if let Err(err) = self.rows.emplace(entity) {
            if fresh {
                self.chunks.pop();
            }
            return Err(err);
        }

        let chunk = &mut self.chunks[chunk_idx];
        debug_assert_eq!(chunk.len, slot);

        // Safety: `slot` is below the chunk capacity.
        unsafe {
            chunk.write_entity(slot, entity);
            for col in 0..self.descriptors.len() {
                chunk
                    .state_ptr(self.layout.column(col), slot)
                    .write(ComponentState::inserted(tick));
            }
        }
        chunk.len += 1;
        Ok(row)
    }

    /// Returns a pointer to the value of column `col` at `row`. The row must be occupied or just allocated.
    #[inline]
    pub(crate) fn value_ptr(&self, col: usize, row: usize) -> *mut u8 {
        let (chunk, slot) = self.locate(row);
        // Safety: `slot` is below the chunk capacity.
        unsafe { self.chunks[chunk].value_ptr(self.layout.column(col), slot) }
    }

    #[inline]
    pub(crate) fn state(&self, col: usize, row: usize) -> &ComponentState {
        let (chunk, slot) = self.locate(row);
        unsafe { &*self.chunks[chunk].state_ptr(self.layout.column(col), slot) }
    }

    #[inline]
    pub(crate) fn state_mut(&mut self, col: usize, row: usize) -> &mut ComponentState {
        let (chunk, slot) = self.locate(row);
        unsafe { &mut *self.chunks[chunk].state_ptr(self.layout.column(col), slot) }
    }

    /// Returns a reference to the value of column `col` at `row`.
    /// Safety: the column must hold values of type `C`, `row` must be occupied.
    #[inline]
    pub(crate) unsafe fn get_unchecked<C>(&self, col: usize, row: usize) -> &C {
        &*(self.value_ptr(col, row) as *const C)
    }

    /// Safety: see [get_unchecked](Self::get_unchecked).
    #[inline]
    pub(crate) unsafe fn get_unchecked_mut<C>(&mut self, col: usize, row: usize) -> &mut C {
        &mut *(self.value_ptr(col, row) as *mut C)
    }

    /// Removes the entity at `row` by moving the last row into its place.
    /// Returns the entity that was moved, if any.
    ///
    /// Safety: if `drop_values` is `false`, every value at `row` must have been moved out or dropped already.
    pub(crate) unsafe fn swap_remove(&mut self, row: usize, drop_values: bool) -> Option<Entity> {
        let last = self.rows.len() - 1;
        let (chunk_idx, slot) = self.locate(row);
        let (last_chunk, last_slot) = self.locate(last);
        let entity = self.chunks[chunk_idx].entities()[slot];

        if drop_values {
            for (col, desc) in self.descriptors.iter().enumerate() {
                desc.drop_in_place(self.value_ptr(col, row));
            }
        }

        let moved = if row != last {
            let moved = self.chunks[last_chunk].entities()[last_slot];
            for col in 0..self.descriptors.len() {
                let desc = self.descriptors[col];
                desc.move_value(self.value_ptr(col, last), self.value_ptr(col, row));
                let state = *self.state(col, last);
                *self.state_mut(col, row) = state;
            }
            self.chunks[chunk_idx].write_entity(slot, moved);
            self.rows.relocate(moved, row);
            Some(moved)
        } else {
            None
        };

        self.rows.remove(entity);

        let chunk = &mut self.chunks[last_chunk];
        chunk.len -= 1;
        if chunk.len == 0 {
            self.chunks.pop();
        }

        moved
    }

    /// Returns an iterator over the chunks of the archetype.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkView<'_>> {
        let layout = &self.layout;
        let ids = self.key.ids();
        let descriptors = &self.descriptors[..];

        self.chunks.iter().map(move |chunk| ChunkView {
            chunk,
            layout,
            ids,
            descriptors,
        })
    }

    /// Returns an iterator over the chunks of the archetype that marks mutably accessed columns with `tick`.
    pub(crate) fn chunks_mut(&mut self, tick: Tick) -> impl Iterator<Item = ChunkViewMut<'_>> {
        let Archetype {
            key,
            descriptors,
            layout,
            chunks,
            ..
        } = self;
        let layout = &*layout;
        let ids = key.ids();
        let descriptors = &descriptors[..];

        chunks.iter_mut().map(move |chunk| ChunkViewMut {
            chunk,
            layout,
            ids,
            descriptors,
            tick,
        })
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for (col, desc) in self.descriptors.iter().enumerate() {
            if !desc.needs_drop() {
                continue;
            }
            for chunk in &self.chunks {
                unsafe {
                    let base = chunk.value_ptr(self.layout.column(col), 0);
                    desc.drop_batch(base, chunk.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>, u32);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn archetype(config: &StorageConfig) -> Archetype {
        let key = ArchetypeKey::new(ComponentIds::from_slice(&[ComponentId(0), ComponentId(1)]));
        let descriptors = vec![TypeDescriptor::of::<u64>(), TypeDescriptor::of::<Tracked>()];
        Archetype::new(0, key, descriptors, config).unwrap()
    }

    fn push(arch: &mut Archetype, entity: Entity, drops: &Arc<AtomicUsize>) -> usize {
        let row = arch.allocate(entity, 1).unwrap();
        unsafe {
            ptr::write(arch.value_ptr(0, row) as *mut u64, entity.index() as u64);
            ptr::write(
                arch.value_ptr(1, row) as *mut Tracked,
                Tracked(drops.clone(), entity.index()),
            );
        }
        row
    }

    #[test]
    fn key_equality_verifies_ids() {
        let a = ArchetypeKey::new(ComponentIds::from_slice(&[ComponentId(2), ComponentId(1)]));
        let b = ArchetypeKey::new(ComponentIds::from_slice(&[ComponentId(1), ComponentId(2), ComponentId(2)]));
        assert_eq!(a, b);
        assert_eq!(a.ids(), &[ComponentId(1), ComponentId(2)]);

        let c = ArchetypeKey::with_hash(ComponentIds::from_slice(&[ComponentId(3)]), a.hash_val());
        assert_ne!(a, c);
    }

    #[test]
    fn chunks_grow_and_shrink() {
        let config = StorageConfig::default().with_max_chunk_entities(4);
        let drops = Arc::new(AtomicUsize::new(0));
        let mut arch = archetype(&config);
        assert_eq!(arch.chunk_capacity(), 4);

        let entities: Vec<_> = (0..10).map(|i| Entity::new(i, 0)).collect();
        for &e in &entities {
            push(&mut arch, e, &drops);
        }
        assert_eq!(arch.chunk_count(), 3);
        assert_eq!(arch.len(), 10);

        for &e in &entities[..6] {
            let row = arch.row_of(e).unwrap();
            unsafe { arch.swap_remove(row, true) };
        }
        assert_eq!(drops.load(Ordering::SeqCst), 6);
        assert_eq!(arch.chunk_count(), 1);

        for (row, &e) in entities[6..].iter().enumerate() {
            assert!(arch.row_of(e).unwrap() < arch.len());
            assert!(!arch.contains(entities[row]));
            let r = arch.row_of(e).unwrap();
            assert_eq!(arch.entity_at(r), Some(e));
            assert_eq!(unsafe { *arch.get_unchecked::<u64>(0, r) }, e.index() as u64);
            assert_eq!(unsafe { arch.get_unchecked::<Tracked>(1, r).1 }, e.index());
        }

        drop(arch);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn removing_last_row_moves_nothing() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut arch = archetype(&StorageConfig::default());
        let a = Entity::new(0, 0);
        let b = Entity::new(1, 0);
        push(&mut arch, a, &drops);
        push(&mut arch, b, &drops);

        assert_eq!(unsafe { arch.swap_remove(1, true) }, None);
        assert_eq!(unsafe { arch.swap_remove(0, true) }, None);
        assert_eq!(arch.chunk_count(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
