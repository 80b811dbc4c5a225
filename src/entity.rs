use crate::error::StorageError;
use crate::sparse_set::PagedSparseSet;
use std::fmt;

/// An entity identifier.
///
/// The lower 32 bits are the index used as the sparse key,
/// the upper 32 bits are the generation of that index.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    pub const NULL: Self = Entity(u64::MAX);

    /// Constructs a new entity identifier.
    pub const fn new(index: u32, generation: u32) -> Entity {
        Entity(((generation as u64) << 32) | index as u64)
    }

    pub const fn from_bits(bits: u64) -> Entity {
        Entity(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Entity(null)");
        }
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Issues and recycles entity identifiers.
///
/// Released indices are reused most-recently-freed first, each time with the next generation,
/// so a released handle never becomes alive again.
pub struct EntityIdAllocator {
    alive: PagedSparseSet,
    free: Vec<Entity>,
    next_index: u32,
}

impl EntityIdAllocator {
    /// The last index is reserved for [Entity::NULL].
    pub const MAX_ENTITIES: usize = u32::MAX as usize;

    pub fn new(page_size: usize) -> Self {
        EntityIdAllocator {
            alive: PagedSparseSet::new(page_size),
            free: Vec::new(),
            next_index: 0,
        }
    }

    /// Returns a fresh or recycled entity and marks it alive.
    pub fn create(&mut self) -> Entity {
        #[cold]
        #[inline(never)]
        fn assert_failed() -> ! {
            panic!(
                "Out of entity ids. A maximum number of entities ({}) is reached.",
                EntityIdAllocator::MAX_ENTITIES
            );
        }

        self.try_create().unwrap_or_else(|err| match err {
            StorageError::EntitiesExhausted => assert_failed(),
            err => panic!("{}", err),
        })
    }

    pub fn try_create(&mut self) -> Result<Entity, StorageError> {
        let entity = if let Some(&entity) = self.free.last() {
            entity
        } else if self.next_index < u32::MAX {
            Entity::new(self.next_index, 0)
        } else {
            tracing::warn!("entity index space exhausted");
            return Err(StorageError::EntitiesExhausted);
        };

        self.alive.emplace(entity)?;
        if self.free.pop().is_none() {
            self.next_index += 1;
        }
        Ok(entity)
    }

    /// Marks the entity dead and puts its index on the free list.
    /// Returns `false` if the entity was not alive.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        self.alive.remove(entity);
        self.free
            .push(Entity::new(entity.index(), entity.generation().wrapping_add(1)));
        true
    }

    /// Returns `true` if the handle was issued and has not been destroyed since.
    pub fn is_alive(&self, entity: Entity) -> bool {
        if entity.is_null() {
            return false;
        }
        self.alive
            .get(entity)
            .map_or(false, |idx| self.alive.dense()[idx] == entity)
    }

    /// Returns the number of alive entities.
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Returns an iterator over all alive entities in packed order.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.alive.iter()
    }
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new(crate::StorageConfig::DEFAULT_SPARSE_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip() {
        let e = Entity::new(7, 3);
        assert_eq!(e.index(), 7);
        assert_eq!(e.generation(), 3);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
        assert!(Entity::default().is_null());
    }

    #[test]
    fn recycles_last_freed_first() {
        let mut ids = EntityIdAllocator::default();
        let a = ids.create();
        let b = ids.create();
        let c = ids.create();

        assert!(ids.destroy(a));
        assert!(ids.destroy(c));

        let c2 = ids.create();
        let a2 = ids.create();
        assert_eq!(c2.index(), c.index());
        assert_eq!(a2.index(), a.index());
        assert_eq!(c2.generation(), c.generation() + 1);

        assert!(ids.is_alive(b));
        assert!(ids.is_alive(c2));
        assert!(!ids.is_alive(c));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn failed_page_allocation_consumes_no_id() {
        let mut ids = EntityIdAllocator::new(usize::MAX / 4);
        assert!(matches!(ids.try_create(), Err(StorageError::OutOfMemory { .. })));
        assert!(matches!(ids.try_create(), Err(StorageError::OutOfMemory { .. })));
        assert!(ids.is_empty());
        assert_eq!(ids.next_index, 0);
    }

    #[test]
    fn double_destroy_is_reported() {
        let mut ids = EntityIdAllocator::default();
        let a = ids.create();
        assert!(ids.destroy(a));
        assert!(!ids.destroy(a));
        assert!(!ids.is_alive(a));
        assert!(!ids.is_alive(Entity::NULL));
        assert!(ids.is_empty());
    }
}
