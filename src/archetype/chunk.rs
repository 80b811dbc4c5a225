use crate::component::{ComponentState, Tick, TypeDescriptor};
use crate::error::StorageError;
use crate::{ComponentId, Entity, StorageConfig};
use smallvec::SmallVec;
use std::alloc::{alloc, dealloc, Layout};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::slice;

pub(crate) const MAX_INLINE_COMPONENTS: usize = 16;

/// Byte offsets of one component type within a chunk.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ColumnLayout {
    pub states: usize,
    pub data: usize,
    pub stride: usize,
}

/// Byte layout shared by all chunks of a storage.
///
/// ```text
/// [ entity ids | states(T0) | data(T0) | states(T1) | data(T1) | ... ]
/// ```
#[derive(Debug, Clone)]
pub(crate) struct ChunkLayout {
    capacity: usize,
    arena: Layout,
    columns: SmallVec<[ColumnLayout; MAX_INLINE_COMPONENTS]>,
}

fn align_up(offset: usize, align: usize) -> Result<usize, StorageError> {
    offset
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or(StorageError::LayoutOverflow)
}

fn column_end(offset: usize, capacity: usize, stride: usize) -> Result<usize, StorageError> {
    capacity
        .checked_mul(stride)
        .and_then(|len| offset.checked_add(len))
        .ok_or(StorageError::LayoutOverflow)
}

impl ChunkLayout {
    /// Lays out `capacity` slots for each of `descriptors`.
    pub fn with_capacity(descriptors: &[TypeDescriptor], capacity: usize) -> Result<Self, StorageError> {
        let mut size = column_end(0, capacity, size_of::<Entity>())?;
        let mut align = align_of::<Entity>().max(align_of::<ComponentState>());
        let mut columns = SmallVec::with_capacity(descriptors.len());

        for desc in descriptors {
            let states = align_up(size, align_of::<ComponentState>())?;
            size = column_end(states, capacity, size_of::<ComponentState>())?;
            let data = align_up(size, desc.align())?;
            size = column_end(data, capacity, desc.size())?;
            align = align.max(desc.align());

            columns.push(ColumnLayout {
                states,
                data,
                stride: desc.size(),
            });
        }

        let arena = Layout::from_size_align(size.max(1), align)
            .map_err(|_| StorageError::LayoutOverflow)?;

        Ok(ChunkLayout {
            capacity,
            arena,
            columns,
        })
    }

    /// Picks the largest capacity not exceeding `max_chunk_entities`
    /// whose chunk fits into `chunk_bytes`. At least one slot is always available.
    pub fn fitting(descriptors: &[TypeDescriptor], config: &StorageConfig) -> Result<Self, StorageError> {
        let per_entity = descriptors
            .iter()
            .try_fold(size_of::<Entity>(), |acc, d| {
                acc.checked_add(d.size())?.checked_add(size_of::<ComponentState>())
            })
            .ok_or(StorageError::LayoutOverflow)?;
        let mut capacity = (config.chunk_bytes / per_entity).clamp(1, config.max_chunk_entities);
        let mut layout = Self::with_capacity(descriptors, capacity)?;

        // Alignment padding may push the estimate over budget.
        while capacity > 1 && layout.arena.size() > config.chunk_bytes {
            capacity -= 1;
            layout = Self::with_capacity(descriptors, capacity)?;
        }

        if layout.arena.size() > config.chunk_bytes {
            tracing::warn!(
                bytes = layout.arena.size(),
                budget = config.chunk_bytes,
                "a single entity exceeds the chunk byte budget"
            );
        }
        Ok(layout)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn chunk_bytes(&self) -> usize {
        self.arena.size()
    }

    #[inline]
    pub fn column(&self, col: usize) -> &ColumnLayout {
        &self.columns[col]
    }
}

/// A single allocation holding up to `capacity` entities of one storage.
///
/// The chunk only owns memory. Component values are constructed, moved and dropped
/// by the owning storage, which knows their descriptors.
pub(crate) struct Chunk {
    ptr: NonNull<u8>,
    arena: Layout,
    pub(crate) len: usize,
}

impl Chunk {
    pub fn new(layout: &ChunkLayout) -> Result<Self, StorageError> {
        // Safety: arena size is non-zero.
        let ptr = unsafe { alloc(layout.arena) };
        let ptr = NonNull::new(ptr).ok_or(StorageError::OutOfMemory {
            bytes: layout.arena.size(),
        })?;
        tracing::trace!(bytes = layout.arena.size(), capacity = layout.capacity, "allocated chunk");

        Ok(Chunk {
            ptr,
            arena: layout.arena,
            len: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn entities(&self) -> &[Entity] {
        // Safety: the first `len` entity slots are always initialized.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr() as *const Entity, self.len) }
    }

    /// Safety: `slot` must be below the layout capacity.
    #[inline]
    pub unsafe fn write_entity(&mut self, slot: usize, entity: Entity) {
        (self.ptr.as_ptr() as *mut Entity).add(slot).write(entity);
    }

    /// Safety: `slot` must be below the layout capacity.
    #[inline]
    pub unsafe fn value_ptr(&self, col: &ColumnLayout, slot: usize) -> *mut u8 {
        self.ptr.as_ptr().add(col.data + slot * col.stride)
    }

    /// Safety: `slot` must be below the layout capacity.
    #[inline]
    pub unsafe fn state_ptr(&self, col: &ColumnLayout, slot: usize) -> *mut ComponentState {
        (self.ptr.as_ptr().add(col.states) as *mut ComponentState).add(slot)
    }

    #[inline]
    pub fn states(&self, col: &ColumnLayout) -> &[ComponentState] {
        // Safety: states of occupied slots are written on allocation.
        unsafe { slice::from_raw_parts(self.state_ptr(col, 0), self.len) }
    }

    #[inline]
    pub fn states_mut(&mut self, col: &ColumnLayout) -> &mut [ComponentState] {
        unsafe { slice::from_raw_parts_mut(self.state_ptr(col, 0), self.len) }
    }

    /// Safety: the column must hold values of type `T`.
    #[inline]
    pub unsafe fn column<T>(&self, col: &ColumnLayout) -> &[T] {
        slice::from_raw_parts(self.value_ptr(col, 0) as *const T, self.len)
    }

    /// Safety: the column must hold values of type `T`.
    #[inline]
    pub unsafe fn column_mut<T>(&mut self, col: &ColumnLayout) -> &mut [T] {
        slice::from_raw_parts_mut(self.value_ptr(col, 0) as *mut T, self.len)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        tracing::trace!(bytes = self.arena.size(), "released chunk");
        // Safety: allocated in `Chunk::new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.arena) };
    }
}

/// A single slot for a value built before it has a place in a storage.
///
/// Only memory is owned: whoever constructs a value here must move it out or drop it.
pub(crate) struct Staging {
    layout: ChunkLayout,
    chunk: Chunk,
}

impl Staging {
    pub fn new(descriptor: &TypeDescriptor) -> Result<Self, StorageError> {
        let layout = ChunkLayout::with_capacity(slice::from_ref(descriptor), 1)?;
        let chunk = Chunk::new(&layout)?;
        Ok(Staging { layout, chunk })
    }

    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        // Safety: slot 0 exists in a chunk of capacity 1.
        unsafe { self.chunk.value_ptr(self.layout.column(0), 0) }
    }
}

// Safety: a chunk only holds `Entity` ids and component values, which are `Send + Sync`.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

fn position<T: 'static>(descriptors: &[TypeDescriptor]) -> Option<usize> {
    descriptors.iter().position(|d| d.is::<T>())
}

/// Read access to the occupied slots of a chunk.
#[derive(Copy, Clone)]
pub struct ChunkView<'a> {
    pub(crate) chunk: &'a Chunk,
    pub(crate) layout: &'a ChunkLayout,
    pub(crate) ids: &'a [ComponentId],
    pub(crate) descriptors: &'a [TypeDescriptor],
}

impl<'a> ChunkView<'a> {
    /// Returns the number of entities in the chunk.
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.len() == 0
    }

    /// Entity ids of the chunk. Slot `i` of every column belongs to `entities()[i]`.
    pub fn entities(&self) -> &'a [Entity] {
        self.chunk.entities()
    }

    pub fn component_ids(&self) -> &'a [ComponentId] {
        self.ids
    }

    /// Returns the values of component `C`, if the chunk stores it.
    pub fn column<C: 'static>(&self) -> Option<&'a [C]> {
        let col = position::<C>(self.descriptors)?;
        // Safety: the descriptor at `col` describes `C`.
        Some(unsafe { self.chunk.column(self.layout.column(col)) })
    }

    pub fn states<C: 'static>(&self) -> Option<&'a [ComponentState]> {
        let col = position::<C>(self.descriptors)?;
        Some(self.chunk.states(self.layout.column(col)))
    }

    /// Returns a pointer to the value of component `id` at `slot`.
    pub fn get_raw(&self, id: ComponentId, slot: usize) -> Option<NonNull<u8>> {
        let col = self.ids.binary_search(&id).ok()?;
        if slot >= self.chunk.len() {
            return None;
        }
        // Safety: `slot` is occupied.
        NonNull::new(unsafe { self.chunk.value_ptr(self.layout.column(col), slot) })
    }
}

/// Write access to the occupied slots of a chunk.
/// Mutable column access marks every value of the column as changed.
pub struct ChunkViewMut<'a> {
    pub(crate) chunk: &'a mut Chunk,
    pub(crate) layout: &'a ChunkLayout,
    pub(crate) ids: &'a [ComponentId],
    pub(crate) descriptors: &'a [TypeDescriptor],
    pub(crate) tick: Tick,
}

impl<'a> ChunkViewMut<'a> {
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.len() == 0
    }

    pub fn entities(&self) -> &[Entity] {
        self.chunk.entities()
    }

    pub fn component_ids(&self) -> &[ComponentId] {
        self.ids
    }

    pub fn column<C: 'static>(&self) -> Option<&[C]> {
        let col = position::<C>(self.descriptors)?;
        Some(unsafe { self.chunk.column(self.layout.column(col)) })
    }

    pub fn states<C: 'static>(&self) -> Option<&[ComponentState]> {
        let col = position::<C>(self.descriptors)?;
        Some(self.chunk.states(self.layout.column(col)))
    }

    fn touch(&mut self, col: usize) {
        let tick = self.tick;
        for state in self.chunk.states_mut(self.layout.column(col)) {
            state.mark_changed(tick);
        }
    }

    pub fn column_mut<C: 'static>(&mut self) -> Option<&mut [C]> {
        let col = position::<C>(self.descriptors)?;
        self.touch(col);
        Some(unsafe { self.chunk.column_mut(self.layout.column(col)) })
    }

    /// Returns the entity ids together with a mutable column of `C`.
    pub fn entities_and_column_mut<C: 'static>(&mut self) -> Option<(&[Entity], &mut [C])> {
        let col = position::<C>(self.descriptors)?;
        self.touch(col);

        let len = self.chunk.len();
        // Safety: the entity column does not overlap value columns.
        unsafe {
            let entities = slice::from_raw_parts(self.chunk.ptr.as_ptr() as *const Entity, len);
            let values = slice::from_raw_parts_mut(self.chunk.value_ptr(self.layout.column(col), 0) as *mut C, len);
            Some((entities, values))
        }
    }

    /// Returns a mutable column of `A` together with a mutable column of `B`.
    /// Returns `None` if either is missing or `A` and `B` are the same type.
    pub fn column_pair_mut<A: 'static, B: 'static>(&mut self) -> Option<(&mut [A], &mut [B])> {
        let a = position::<A>(self.descriptors)?;
        let b = position::<B>(self.descriptors)?;
        if a == b {
            return None;
        }
        self.touch(a);
        self.touch(b);

        let len = self.chunk.len();
        // Safety: distinct columns occupy disjoint byte ranges of the chunk.
        unsafe {
            let pa = self.chunk.value_ptr(self.layout.column(a), 0) as *mut A;
            let pb = self.chunk.value_ptr(self.layout.column(b), 0) as *mut B;
            Some((
                slice::from_raw_parts_mut(pa, len),
                slice::from_raw_parts_mut(pb, len),
            ))
        }
    }
}
