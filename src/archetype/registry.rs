use super::{Archetype, ArchetypeId, ArchetypeKey, ComponentIds};
use crate::component::{ComponentRegistry, Tick, TypeDescriptor};
use crate::error::StorageError;
use crate::{ComponentId, Entity, HashMap, HashSet, StorageConfig};
use std::collections::hash_map;

/// Finds or creates archetypes by their component set and moves entities between them.
///
/// Owned by a [World](crate::World), which is the only way to obtain one:
///
/// ```compile_fail
/// let registry = entity_store::ArchetypeRegistry::new();
/// ```
pub struct ArchetypeRegistry {
    archetypes: Vec<Archetype>,
    archetypes_by_key: HashMap<ArchetypeKey, ArchetypeId>,
    seen_hashes: HashSet<u64>,
}

impl ArchetypeRegistry {
    pub(crate) fn new() -> Self {
        ArchetypeRegistry {
            archetypes: Vec::new(),
            archetypes_by_key: HashMap::default(),
            seen_hashes: HashSet::default(),
        }
    }

    /// Returns the number of archetypes.
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Archetype> {
        self.archetypes.iter_mut()
    }

    #[inline]
    pub(crate) fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id as usize]
    }

    #[inline]
    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id as usize]
    }

    /// Returns the archetype storing exactly the components `ids`.
    pub fn find(&self, ids: &[ComponentId]) -> Option<ArchetypeId> {
        let key = ArchetypeKey::new(ComponentIds::from_slice(ids));
        self.archetypes_by_key.get(&key).copied()
    }

    pub(crate) fn find_or_create(
        &mut self,
        ids: ComponentIds,
        components: &ComponentRegistry,
        config: &StorageConfig,
    ) -> Result<ArchetypeId, StorageError> {
        self.find_or_create_by_key(ArchetypeKey::new(ids), components, config)
    }

    pub(crate) fn find_or_create_by_key(
        &mut self,
        key: ArchetypeKey,
        components: &ComponentRegistry,
        config: &StorageConfig,
    ) -> Result<ArchetypeId, StorageError> {
        if let Some(&id) = self.archetypes_by_key.get(&key) {
            return Ok(id);
        }

        let descriptors = key
            .ids()
            .iter()
            .map(|&id| components.descriptor(id).copied().ok_or(StorageError::UnknownComponent(id)))
            .collect::<Result<Vec<TypeDescriptor>, _>>()?;

        let id = self.archetypes.len() as ArchetypeId;
        let archetype = Archetype::new(id, key.clone(), descriptors, config)?;

        if !self.seen_hashes.insert(key.hash_val()) {
            tracing::warn!(hash = key.hash_val(), components = ?key.ids(), "archetype hash collision");
        }
        tracing::debug!(
            id,
            components = ?key.ids(),
            chunk_capacity = archetype.chunk_capacity(),
            chunk_bytes = archetype.chunk_bytes(),
            "created archetype"
        );

        self.archetypes.push(archetype);
        self.archetypes_by_key.insert(key, id);
        Ok(id)
    }

    /// Returns the archetype of the component set of `from` plus `component`.
    pub(crate) fn with_component(
        &mut self,
        from: Option<ArchetypeId>,
        component: ComponentId,
        components: &ComponentRegistry,
        config: &StorageConfig,
    ) -> Result<ArchetypeId, StorageError> {
        let mut ids = ComponentIds::new();

        if let Some(from) = from {
            let arch = self.archetype(from);
            if arch.column_index(component).is_some() {
                return Ok(from);
            }
            if let Some(&to) = arch.add_edges.get(&component) {
                return Ok(to);
            }
            ids.extend_from_slice(arch.component_ids());
        }
        ids.push(component);

        let to = self.find_or_create(ids, components, config)?;
        if let Some(from) = from {
            self.archetype_mut(from).add_edges.insert(component, to);
            self.archetype_mut(to).remove_edges.insert(component, Some(from));
        }
        Ok(to)
    }

    /// Returns the archetype of the component set of `from` minus `component`,
    /// `None` if no components remain.
    pub(crate) fn without_component(
        &mut self,
        from: ArchetypeId,
        component: ComponentId,
        components: &ComponentRegistry,
        config: &StorageConfig,
    ) -> Result<Option<ArchetypeId>, StorageError> {
        let arch = self.archetype(from);
        if arch.column_index(component).is_none() {
            return Ok(Some(from));
        }
        if let Some(&to) = arch.remove_edges.get(&component) {
            return Ok(to);
        }

        let ids: ComponentIds = arch
            .component_ids()
            .iter()
            .copied()
            .filter(|&id| id != component)
            .collect();

        let to = if ids.is_empty() {
            None
        } else {
            Some(self.find_or_create(ids, components, config)?)
        };

        self.archetype_mut(from).remove_edges.insert(component, to);
        if let Some(to) = to {
            if let hash_map::Entry::Vacant(e) = self.archetype_mut(to).add_edges.entry(component) {
                e.insert(from);
            }
        }
        Ok(to)
    }

    fn pair_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        let (a, b) = (a as usize, b as usize);
        assert_ne!(a, b);
        if a < b {
            let (left, right) = self.archetypes.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    /// Moves `entity` from archetype `from` to archetype `to` and returns its new row.
    ///
    /// Values of components present in both archetypes are moved with their change state.
    /// The value of `taken.0`, if present only in `from`, is moved to `taken.1`;
    /// all other values present only in `from` are dropped.
    /// Values present only in `to` are left uninitialized and must be written by the caller.
    ///
    /// The destination row is allocated first: on error nothing is changed.
    ///
    /// Safety: `taken.1` must be valid for writes of the taken component type.
    pub(crate) unsafe fn relocate(
        &mut self,
        entity: Entity,
        from: Option<ArchetypeId>,
        to: Option<ArchetypeId>,
        taken: Option<(ComponentId, *mut u8)>,
        tick: Tick,
    ) -> Result<Option<usize>, StorageError> {
        match (from, to) {
            (None, None) => Ok(None),
            (None, Some(to)) => self.archetype_mut(to).allocate(entity, tick).map(Some),
            (Some(from), None) => {
                let src = self.archetype_mut(from);
                let row = src.rows.index(entity);
                for (col, &id) in src.component_ids().iter().enumerate() {
                    take_or_drop(src.descriptor(col), id, src.value_ptr(col, row), taken);
                }
                src.swap_remove(row, false);
                tracing::trace!(?entity, from, "removed entity from archetype");
                Ok(None)
            }
            (Some(from), Some(to)) if from == to => Ok(Some(self.archetype(from).rows.index(entity))),
            (Some(from), Some(to)) => {
                let (src, dst) = self.pair_mut(from, to);
                let src_row = src.rows.index(entity);
                let dst_row = dst.allocate(entity, tick)?;

                for (col, &id) in src.component_ids().iter().enumerate() {
                    let desc = src.descriptor(col);
                    let src_ptr = src.value_ptr(col, src_row);

                    if let Some(dst_col) = dst.column_index(id) {
                        desc.move_value(src_ptr, dst.value_ptr(dst_col, dst_row));
                        let state = *src.state(col, src_row);
                        *dst.state_mut(dst_col, dst_row) = state;
                    } else {
                        take_or_drop(desc, id, src_ptr, taken);
                    }
                }

                src.swap_remove(src_row, false);
                tracing::trace!(?entity, from, to, "migrated entity");
                Ok(Some(dst_row))
            }
        }
    }
}

unsafe fn take_or_drop(desc: &TypeDescriptor, id: ComponentId, ptr: *mut u8, taken: Option<(ComponentId, *mut u8)>) {
    match taken {
        Some((taken_id, out)) if taken_id == id => desc.move_value(ptr, out),
        _ => desc.drop_in_place(ptr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct X(u32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Y(f64);
    #[derive(Debug, Clone, PartialEq)]
    struct Z(String);

    fn setup() -> (ComponentRegistry, [ComponentId; 3]) {
        let mut components = ComponentRegistry::new();
        let ids = [
            components.register::<X>(),
            components.register::<Y>(),
            components.register::<Z>(),
        ];
        (components, ids)
    }

    #[test]
    fn same_set_same_archetype() {
        let (components, [x, y, _]) = setup();
        let config = StorageConfig::default();
        let mut registry = ArchetypeRegistry::new();

        let a = registry.find_or_create(ComponentIds::from_slice(&[x, y]), &components, &config).unwrap();
        let b = registry.find_or_create(ComponentIds::from_slice(&[y, x]), &components, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(&[y, x]), Some(a));
        assert_eq!(registry.find(&[x]), None);
    }

    #[test]
    fn colliding_hashes_stay_distinct() {
        let (components, [x, y, z]) = setup();
        let config = StorageConfig::default();
        let mut registry = ArchetypeRegistry::new();

        let k1 = ArchetypeKey::with_hash(ComponentIds::from_slice(&[x, y]), 42);
        let k2 = ArchetypeKey::with_hash(ComponentIds::from_slice(&[z]), 42);
        let a = registry.find_or_create_by_key(k1.clone(), &components, &config).unwrap();
        let b = registry.find_or_create_by_key(k2.clone(), &components, &config).unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.archetype(a).component_ids(), &[x, y]);
        assert_eq!(registry.archetype(b).component_ids(), &[z]);
        assert_eq!(registry.find_or_create_by_key(k2, &components, &config).unwrap(), b);
        assert_eq!(registry.find_or_create_by_key(k1, &components, &config).unwrap(), a);
    }

    #[test]
    fn unknown_component_is_rejected() {
        let (components, _) = setup();
        let mut registry = ArchetypeRegistry::new();
        let bogus = ComponentId(99);
        let err = registry
            .find_or_create(ComponentIds::from_slice(&[bogus]), &components, &StorageConfig::default())
            .unwrap_err();
        assert_eq!(err, StorageError::UnknownComponent(bogus));
        assert!(registry.is_empty());
    }

    #[test]
    fn migration_moves_values() {
        let (components, [x, y, z]) = setup();
        let config = StorageConfig::default();
        let mut registry = ArchetypeRegistry::new();
        let e = Entity::new(5, 0);

        let xy = registry.with_component(None, x, &components, &config).unwrap();
        let xy = registry.with_component(Some(xy), y, &components, &config).unwrap();
        unsafe {
            let row = registry.relocate(e, None, Some(xy), None, 1).unwrap().unwrap();
            let arch = registry.archetype(xy);
            ptr::write(arch.value_ptr(arch.column_index(x).unwrap(), row) as *mut X, X(7));
            ptr::write(arch.value_ptr(arch.column_index(y).unwrap(), row) as *mut Y, Y(2.5));
        }

        let xyz = registry.with_component(Some(xy), z, &components, &config).unwrap();
        assert_eq!(registry.with_component(Some(xy), z, &components, &config).unwrap(), xyz);
        unsafe {
            let row = registry.relocate(e, Some(xy), Some(xyz), None, 2).unwrap().unwrap();
            let arch = registry.archetype(xyz);
            ptr::write(arch.value_ptr(arch.column_index(z).unwrap(), row) as *mut Z, Z("z".into()));
            assert_eq!(*arch.get_unchecked::<X>(arch.column_index(x).unwrap(), row), X(7));
            assert_eq!(*arch.get_unchecked::<Y>(arch.column_index(y).unwrap(), row), Y(2.5));
        }
        assert!(!registry.archetype(xy).contains(e));
        assert!(registry.archetype(xyz).contains(e));

        let back = registry.without_component(xyz, z, &components, &config).unwrap();
        assert_eq!(back, Some(xy));

        let mut out = std::mem::MaybeUninit::<Z>::uninit();
        unsafe {
            registry
                .relocate(e, Some(xyz), back, Some((z, out.as_mut_ptr() as *mut u8)), 3)
                .unwrap();
            assert_eq!(out.assume_init(), Z("z".into()));
        }
        assert!(registry.archetype(xy).contains(e));
        assert!(registry.archetype(xyz).is_empty());
        assert_eq!(registry.len(), 3);
    }
}
