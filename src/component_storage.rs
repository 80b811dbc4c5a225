use crate::archetype::chunk::{Chunk, ChunkLayout, ColumnLayout, Staging};
use crate::component::{ComponentState, Tick, TypeDescriptor};
use crate::error::StorageError;
use crate::sparse_set::SparseIndex;
use crate::{Component, Entity, StorageConfig};
use std::ptr::{self, NonNull};

/// Chunked dense storage of a single component type.
///
/// Packed index `i` lives in chunk `i / capacity` at slot `i % capacity`.
/// Removal moves the last value into the freed slot, so iteration order is not stable.
/// Pointers returned by this storage are invalidated by any removal.
///
/// Values are keyed by entity index; the owner removes them before the index is recycled.
pub struct ComponentColumn {
    descriptor: TypeDescriptor,
    layout: ChunkLayout,
    sparse: SparseIndex,
    chunks: Vec<Chunk>,
    tick: Tick,
}

impl ComponentColumn {
    pub fn new(descriptor: TypeDescriptor, config: &StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let layout = ChunkLayout::with_capacity(&[descriptor], config.column_chunk_capacity)?;

        Ok(ComponentColumn {
            descriptor,
            layout,
            sparse: SparseIndex::new(config.sparse_page_size),
            chunks: Vec::new(),
            tick: 1,
        })
    }

    /// A column of `T` with default construction available.
    pub fn of<T: Component + Default>(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::new(TypeDescriptor::of::<T>().with_default::<T>(), config)
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    #[inline]
    fn col(&self) -> &ColumnLayout {
        self.layout.column(0)
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        let capacity = self.layout.capacity();
        (index / capacity, index % capacity)
    }

    #[inline]
    fn value_ptr(&self, index: usize) -> *mut u8 {
        let (chunk, slot) = self.locate(index);
        // Safety: `slot` is below the chunk capacity.
        unsafe { self.chunks[chunk].value_ptr(self.col(), slot) }
    }

    #[inline]
    fn state_mut(&mut self, index: usize) -> &mut ComponentState {
        let (chunk, slot) = self.locate(index);
        unsafe { &mut *self.chunks[chunk].state_ptr(self.layout.column(0), slot) }
    }

    /// Reserves the next packed index for `entity`; the value slot is left uninitialized.
    fn allocate(&mut self, entity: Entity) -> Result<usize, StorageError> {
        let index = self.sparse.len();
        let (chunk_idx, slot) = self.locate(index);

        let fresh = chunk_idx == self.chunks.len();
        if fresh {
            self.chunks.push(Chunk::new(&self.layout)?);
        }
        if let Err(err) = self.sparse.emplace(entity) {
            if fresh {
                self.chunks.pop();
            }
            return Err(err);
        }

        let chunk = &mut self.chunks[chunk_idx];
        unsafe {
            chunk.write_entity(slot, entity);
            chunk
                .state_ptr(self.layout.column(0), slot)
                .write(ComponentState::inserted(self.tick));
        }
        chunk.len += 1;
        Ok(index)
    }

    /// Default-constructs a value for `entity` and returns a pointer to it.
    /// If the entity already has a value, returns a pointer to the existing one.
    pub fn emplace(&mut self, entity: Entity) -> Result<NonNull<u8>, StorageError> {
        if let Some(index) = self.sparse.get(entity) {
            return Ok(self.touch(index));
        }
        if !self.descriptor.can_construct() {
            return Err(StorageError::NotConstructible(self.descriptor.name()));
        }

        // A panicking constructor must not leave a reserved slot behind.
        let staging = Staging::new(&self.descriptor)?;
        unsafe { self.descriptor.construct(staging.ptr()) };

        let index = match self.allocate(entity) {
            Ok(index) => index,
            Err(err) => {
                unsafe { self.descriptor.drop_in_place(staging.ptr()) };
                return Err(err);
            }
        };
        unsafe { self.descriptor.move_value(staging.ptr(), self.value_ptr(index)) };
        Ok(self.touch(index))
    }

    /// Inserts or replaces the value of `entity`.
    pub fn insert<T: Component>(&mut self, entity: Entity, value: T) -> Result<&mut T, StorageError> {
        self.assert_type::<T>();

        let index = match self.sparse.get(entity) {
            Some(index) => {
                // Safety: the slot holds an initialized `T`.
                unsafe { *(self.value_ptr(index) as *mut T) = value };
                self.touch(index);
                index
            }
            None => {
                let index = self.allocate(entity)?;
                unsafe { ptr::write(self.value_ptr(index) as *mut T, value) };
                index
            }
        };
        Ok(unsafe { &mut *(self.value_ptr(index) as *mut T) })
    }

    fn touch(&mut self, index: usize) -> NonNull<u8> {
        let tick = self.tick;
        self.state_mut(index).mark_changed(tick);
        // Safety: chunk memory is never null.
        unsafe { NonNull::new_unchecked(self.value_ptr(index)) }
    }

    fn assert_type<T: 'static>(&self) {
        assert!(
            self.descriptor.is::<T>(),
            "column of `{}` accessed as `{}`",
            self.descriptor.name(),
            std::any::type_name::<T>()
        );
    }

    /// Returns `true` if the column holds a value for the entity.
    pub fn contains(&self, entity: Entity) -> bool {
        self.sparse.has(entity)
    }

    /// Returns the packed index of the entity.
    pub fn index_of(&self, entity: Entity) -> Option<usize> {
        self.sparse.get(entity)
    }

    /// Returns the entity stored at packed index `index`.
    pub fn entity_at(&self, index: usize) -> Option<Entity> {
        let (chunk, slot) = self.locate(index);
        self.chunks.get(chunk)?.entities().get(slot).copied()
    }

    pub fn get_ptr(&self, entity: Entity) -> Option<NonNull<u8>> {
        let index = self.sparse.get(entity)?;
        NonNull::new(self.value_ptr(index))
    }

    /// Returns a pointer to the value of the entity and marks it changed.
    pub fn get_ptr_mut(&mut self, entity: Entity) -> Option<NonNull<u8>> {
        let index = self.sparse.get(entity)?;
        Some(self.touch(index))
    }

    /// Returns a reference to the value of the entity.
    /// Panics if `T` is not the type of the column.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.assert_type::<T>();
        let ptr = self.get_ptr(entity)?;
        Some(unsafe { &*(ptr.as_ptr() as *const T) })
    }

    /// Returns a mutable reference to the value of the entity and marks it changed.
    /// Panics if `T` is not the type of the column.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        self.assert_type::<T>();
        let ptr = self.get_ptr_mut(entity)?;
        Some(unsafe { &mut *(ptr.as_ptr() as *mut T) })
    }

    pub fn state(&self, entity: Entity) -> Option<ComponentState> {
        let index = self.sparse.get(entity)?;
        let (chunk, slot) = self.locate(index);
        Some(self.chunks[chunk].states(self.col())[slot])
    }

    /// Returns `true` if the value changed since the previous check.
    pub fn check_changed(&mut self, entity: Entity) -> Option<bool> {
        let index = self.sparse.get(entity)?;
        let tick = self.tick;
        let changed = self.state_mut(index).check(tick);
        self.tick += 1;
        Some(changed)
    }

    /// Removes the value at `index`, optionally moving it to `out` instead of dropping it.
    ///
    /// Safety: `out` must be valid for writes of the column type.
    unsafe fn remove_at(&mut self, entity: Entity, index: usize, out: Option<*mut u8>) {
        let last = self.sparse.len() - 1;
        let desc = self.descriptor;
        let ptr = self.value_ptr(index);

        match out {
            Some(out) => desc.move_value(ptr, out),
            None => desc.drop_in_place(ptr),
        }

        if index != last {
            let (last_chunk, last_slot) = self.locate(last);
            let moved = self.chunks[last_chunk].entities()[last_slot];
            desc.move_value(self.value_ptr(last), ptr);

            let last_state = self.chunks[last_chunk].states(self.col())[last_slot];
            *self.state_mut(index) = last_state;

            let (chunk, slot) = self.locate(index);
            self.chunks[chunk].write_entity(slot, moved);
            self.sparse.relocate(moved, index);
        }

        self.sparse.remove(entity);

        let (last_chunk, _) = self.locate(last);
        let chunk = &mut self.chunks[last_chunk];
        chunk.len -= 1;
        if chunk.len == 0 {
            self.chunks.pop();
        }
    }

    /// Drops the value of the entity. Returns `false` if the entity had no value.
    pub fn remove(&mut self, entity: Entity) -> bool {
        match self.sparse.get(entity) {
            Some(index) => {
                unsafe { self.remove_at(entity, index, None) };
                true
            }
            None => false,
        }
    }

    /// Removes the value of the entity and returns it.
    pub fn take<T: Component>(&mut self, entity: Entity) -> Option<T> {
        self.assert_type::<T>();
        let index = self.sparse.get(entity)?;
        let mut out = std::mem::MaybeUninit::<T>::uninit();
        unsafe {
            self.remove_at(entity, index, Some(out.as_mut_ptr() as *mut u8));
            Some(out.assume_init())
        }
    }

    /// Returns the number of values.
    pub fn len(&self) -> usize {
        self.sparse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sparse.is_empty()
    }

    /// Returns the number of allocated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Returns an iterator over all entities in packed order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.chunks.iter().flat_map(|c| c.entities().iter().copied())
    }

    /// Returns an iterator over all values in packed order.
    /// Panics if `T` is not the type of the column.
    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.assert_type::<T>();
        let col = *self.col();
        self.chunks.iter().flat_map(move |chunk| {
            // Safety: the column holds values of type `T`.
            let values = unsafe { chunk.column::<T>(&col) };
            chunk.entities().iter().copied().zip(values.iter())
        })
    }
}

impl Drop for ComponentColumn {
    fn drop(&mut self) {
        if !self.descriptor.needs_drop() {
            return;
        }
        for chunk in &self.chunks {
            unsafe {
                let base = chunk.value_ptr(self.layout.column(0), 0);
                self.descriptor.drop_batch(base, chunk.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default, Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Default)]
    struct Counted(Option<Arc<AtomicUsize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            if let Some(c) = &self.0 {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn small() -> StorageConfig {
        StorageConfig::default()
            .with_column_chunk_capacity(4)
            .with_sparse_page_size(8)
    }

    #[test]
    fn emplace_places_entity_and_value_in_same_slot() {
        let mut column = ComponentColumn::of::<Health>(&small()).unwrap();
        let entities: Vec<_> = (0..10).map(|i| Entity::new(i * 7, 0)).collect();

        for &e in &entities {
            let ptr = column.emplace(e).unwrap();
            let index = column.index_of(e).unwrap();
            assert_eq!(column.entity_at(index), Some(e));
            assert_eq!(ptr.as_ptr(), column.get_ptr(e).unwrap().as_ptr());
            column.get_mut::<Health>(e).unwrap().0 = e.index();
        }
        assert_eq!(column.chunk_count(), 3);

        let again = column.emplace(entities[3]).unwrap();
        assert_eq!(unsafe { &*(again.as_ptr() as *const Health) }, &Health(21));
        assert_eq!(column.len(), 10);
    }

    #[test]
    fn remove_swaps_last_and_frees_chunks() {
        let mut column = ComponentColumn::of::<Health>(&small()).unwrap();
        let entities: Vec<_> = (0..9).map(|i| Entity::new(i, 0)).collect();
        for &e in &entities {
            column.insert(e, Health(e.index() * 10)).unwrap();
        }
        assert_eq!(column.chunk_count(), 3);

        assert!(column.remove(entities[1]));
        assert!(!column.remove(entities[1]));
        assert_eq!(column.index_of(entities[8]), Some(1));
        assert_eq!(column.chunk_count(), 2);

        assert_eq!(column.take::<Health>(entities[0]), Some(Health(0)));
        for &e in &entities[2..] {
            assert_eq!(column.get::<Health>(e), Some(&Health(e.index() * 10)));
            assert!(column.index_of(e).unwrap() < column.len());
        }

        for &e in &entities[2..] {
            assert!(column.remove(e));
        }
        assert!(column.is_empty());
        assert_eq!(column.chunk_count(), 0);
        assert_eq!(column.entities().count(), 0);
    }

    #[test]
    fn values_are_dropped_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut column = ComponentColumn::of::<Counted>(&small()).unwrap();
        for i in 0..6 {
            column.insert(Entity::new(i, 0), Counted(Some(drops.clone()))).unwrap();
        }
        column.remove(Entity::new(2, 0));
        let taken = column.take::<Counted>(Entity::new(4, 0));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(taken);
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        column.insert(Entity::new(0, 0), Counted(None)).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        drop(column);
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn emplace_requires_constructor() {
        let mut column = ComponentColumn::new(TypeDescriptor::of::<Health>(), &small()).unwrap();
        let err = column.emplace(Entity::new(0, 0)).unwrap_err();
        assert!(matches!(err, StorageError::NotConstructible(_)));
        assert!(column.is_empty());
        assert_eq!(column.chunk_count(), 0);
    }

    struct Brittle(u64);

    impl Default for Brittle {
        fn default() -> Self {
            panic!("no default Brittle");
        }
    }

    #[test]
    fn panicking_constructor_reserves_nothing() {
        let mut column = ComponentColumn::of::<Brittle>(&small()).unwrap();
        column.insert(Entity::new(0, 0), Brittle(1)).unwrap();

        let e = Entity::new(1, 0);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            column.emplace(e).map(|_| ())
        }));
        assert!(result.is_err());
        assert!(!column.contains(e));
        assert_eq!(column.len(), 1);
        assert_eq!(column.entities().collect::<Vec<_>>(), vec![Entity::new(0, 0)]);

        column.insert(e, Brittle(2)).unwrap();
        assert_eq!(column.get::<Brittle>(e).map(|b| b.0), Some(2));
    }

    #[test]
    fn change_detection() {
        let mut column = ComponentColumn::of::<Health>(&small()).unwrap();
        let e = Entity::new(1, 0);
        column.insert(e, Health(1)).unwrap();
        assert_eq!(column.check_changed(e), Some(true));
        assert_eq!(column.check_changed(e), Some(false));
        let _ = column.get::<Health>(e);
        assert_eq!(column.check_changed(e), Some(false));
        column.get_mut::<Health>(e).unwrap().0 = 5;
        assert_eq!(column.check_changed(e), Some(true));
        assert_eq!(column.check_changed(Entity::new(2, 0)), None);
    }

    #[test]
    #[should_panic(expected = "accessed as")]
    fn wrong_type_panics() {
        let column = ComponentColumn::of::<Health>(&small()).unwrap();
        let _ = column.get::<u32>(Entity::new(0, 0));
    }

    #[test]
    fn iteration_matches_entities() {
        let mut column = ComponentColumn::of::<Health>(&small()).unwrap();
        for i in 0..11 {
            column.insert(Entity::new(i, 0), Health(i)).unwrap();
        }
        column.remove(Entity::new(5, 0));
        let mut seen: Vec<_> = column.iter::<Health>().map(|(e, h)| {
            assert_eq!(e.index(), h.0);
            h.0
        }).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 6, 7, 8, 9, 10]);
    }
}
