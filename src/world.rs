use crate::archetype::chunk::{ChunkView, ChunkViewMut, Staging};
use crate::archetype::{Archetype, ArchetypeId, ComponentIds};
use crate::archetype::registry::ArchetypeRegistry;
use crate::bundle::Bundle;
use crate::component::{Component, ComponentRegistry, ComponentState, Tick, TypeDescriptor};
use crate::entity::EntityIdAllocator;
use crate::error::StorageError;
use crate::{ComponentId, Entity, StorageConfig};
use std::any::type_name;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr::{self, NonNull};

#[cold]
#[inline(never)]
fn violated(err: StorageError) -> ! {
    panic!("{}", err);
}

/// The root object owning entities, component types and archetypes.
///
/// Each alive entity lives in at most one archetype, the one storing exactly its components.
/// Adding or removing a component moves the entity between archetypes.
///
/// References and pointers into component storage must not outlive a structural change.
/// The borrow checker enforces this for references; raw pointers obtained from
/// [get_component_raw](Self::get_component_raw) and friends are invalidated by any
/// add, remove, spawn, clone or destroy.
pub struct World {
    entities: EntityIdAllocator,
    components: ComponentRegistry,
    archetypes: ArchetypeRegistry,
    locations: Vec<Option<ArchetypeId>>,
    tick: Tick,
    config: StorageConfig,
}

impl World {
    /// Creates an empty `World` with the default configuration.
    pub fn new() -> World {
        Self::build(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Result<World, StorageError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: StorageConfig) -> World {
        World {
            entities: EntityIdAllocator::new(config.sparse_page_size),
            components: ComponentRegistry::new(),
            archetypes: ArchetypeRegistry::new(),
            locations: Vec::new(),
            tick: 1,
            config,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // ---------------------------------------------------------------------------------------------
    // Component types

    /// Registers `T` if it is not registered yet and returns its identifier.
    pub fn register<T: Component>(&mut self) -> ComponentId {
        self.components.register::<T>()
    }

    /// Registers a component type described at runtime.
    pub fn register_descriptor(&mut self, descriptor: TypeDescriptor) -> ComponentId {
        self.components.register_descriptor(descriptor)
    }

    pub fn component_id<T: Component>(&self) -> Option<ComponentId> {
        self.components.id_of::<T>()
    }

    pub fn descriptor(&self, id: ComponentId) -> Option<&TypeDescriptor> {
        self.components.descriptor(id)
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    // ---------------------------------------------------------------------------------------------
    // Entities

    /// Creates an entity without components.
    pub fn create_entity(&mut self) -> Entity {
        self.try_create_entity().unwrap_or_else(|err| violated(err))
    }

    pub fn try_create_entity(&mut self) -> Result<Entity, StorageError> {
        let entity = self.entities.try_create()?;
        let index = entity.index() as usize;
        if index >= self.locations.len() {
            self.locations.resize(index + 1, None);
        }
        self.locations[index] = None;
        Ok(entity)
    }

    /// Destroys the entity and drops all of its components.
    /// Panics if the entity is not alive.
    pub fn destroy_entity(&mut self, entity: Entity) {
        self.try_destroy_entity(entity).unwrap_or_else(|err| violated(err))
    }

    pub fn try_destroy_entity(&mut self, entity: Entity) -> Result<(), StorageError> {
        let from = self.location(entity)?;
        // Safety: nothing is taken out.
        unsafe {
            self.archetypes.relocate(entity, from, None, None, self.tick)?;
        }
        self.locations[entity.index() as usize] = None;
        self.entities.destroy(entity);
        tracing::trace!(?entity, "destroyed entity");
        Ok(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Returns the number of alive entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Returns an iterator over all alive entities.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter()
    }

    /// Creates an entity with every field of `bundle` as a component.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Entity {
        self.try_spawn(bundle).unwrap_or_else(|err| violated(err))
    }

    pub fn try_spawn<B: Bundle>(&mut self, bundle: B) -> Result<Entity, StorageError> {
        let fields = B::fields();
        let ids: ComponentIds = fields
            .iter()
            .map(|field| self.components.register_descriptor(field.descriptor))
            .collect();

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
            let name = self.components.descriptor(pair[0]).map_or("?", |d| d.name());
            return Err(StorageError::DuplicateComponent(name));
        }

        if ids.is_empty() {
            return self.try_create_entity();
        }

        let to = self.archetypes.find_or_create(sorted, &self.components, &self.config)?;
        let entity = self.try_create_entity()?;
        let row = match unsafe { self.migrate(entity, None, to) } {
            Ok(row) => row,
            Err(err) => {
                self.entities.destroy(entity);
                return Err(err);
            }
        };

        let bundle = ManuallyDrop::new(bundle);
        let base = &*bundle as *const B as *const u8;
        let arch = self.archetypes.archetype(to);

        for (field, &id) in fields.iter().zip(ids.iter()) {
            let col = column_of(arch, id);
            // Safety: the field is moved out of the bundle, which is never dropped.
            unsafe {
                ptr::copy_nonoverlapping(
                    base.add(field.offset),
                    arch.value_ptr(col, row),
                    field.descriptor.size(),
                );
            }
        }

        Ok(entity)
    }

    /// Creates an entity with a copy of every component of `entity`.
    /// Panics if the entity is not alive or a component cannot be cloned.
    pub fn clone_entity(&mut self, entity: Entity) -> Entity {
        self.try_clone_entity(entity).unwrap_or_else(|err| violated(err))
    }

    pub fn try_clone_entity(&mut self, entity: Entity) -> Result<Entity, StorageError> {
        let Some(arch_id) = self.location(entity)? else {
            return self.try_create_entity();
        };

        if let Some(desc) = self
            .archetypes
            .archetype(arch_id)
            .iter_descriptors()
            .find(|desc| !desc.can_clone())
        {
            return Err(StorageError::NotCloneable(desc.name()));
        }

        let clone = self.try_create_entity()?;
        let dst_row = match unsafe { self.migrate(clone, None, arch_id) } {
            Ok(row) => row,
            Err(err) => {
                self.entities.destroy(clone);
                return Err(err);
            }
        };

        let mut guard = PartialClone {
            archetype: self.archetypes.archetype_mut(arch_id),
            entities: &mut self.entities,
            locations: &mut self.locations,
            clone,
            row: dst_row,
            cloned: 0,
        };
        let src_row = guard.archetype.row(entity);
        for col in 0..guard.archetype.component_ids().len() {
            let arch = &*guard.archetype;
            // Safety: rows are distinct and chunk memory does not move when chunks are added.
            unsafe {
                arch.descriptor(col)
                    .clone_value(arch.value_ptr(col, src_row), arch.value_ptr(col, dst_row));
            }
            guard.cloned += 1;
        }
        mem::forget(guard);

        Ok(clone)
    }

    // ---------------------------------------------------------------------------------------------
    // Typed components

    /// Adds a default-constructed `T` to the entity and returns a reference to it.
    /// Panics if the entity is not alive or already has `T`.
    pub fn add_component<T: Component + Default>(&mut self, entity: Entity) -> &mut T {
        self.try_add_component(entity).unwrap_or_else(|err| violated(err))
    }

    pub fn try_add_component<T: Component + Default>(&mut self, entity: Entity) -> Result<&mut T, StorageError> {
        self.location(entity)?;
        if self.has_component::<T>(entity) {
            return Err(StorageError::ComponentAlreadyPresent {
                entity,
                component: type_name::<T>(),
            });
        }
        self.write_component(entity, T::default())
    }

    /// Adds `value` to the entity, replacing the previous value of `T` if there is one.
    /// Panics if the entity is not alive.
    pub fn insert_component<T: Component>(&mut self, entity: Entity, value: T) -> &mut T {
        self.try_insert_component(entity, value)
            .unwrap_or_else(|err| violated(err))
    }

    pub fn try_insert_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<&mut T, StorageError> {
        self.write_component(entity, value)
    }

    fn write_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<&mut T, StorageError> {
        let from = self.location(entity)?;
        let id = self.components.register::<T>();

        if let Some((arch_id, col, row)) = self.slot(entity, id)? {
            let tick = self.tick;
            let arch = self.archetypes.archetype_mut(arch_id);
            arch.state_mut(col, row).mark_changed(tick);
            // Safety: the column stores `T`.
            let slot = unsafe { arch.get_unchecked_mut::<T>(col, row) };
            *slot = value;
            return Ok(slot);
        }

        let to = self.archetypes.with_component(from, id, &self.components, &self.config)?;
        let row = unsafe { self.migrate(entity, from, to)? };

        let arch = self.archetypes.archetype_mut(to);
        let col = column_of(arch, id);
        // Safety: the slot of the added column is uninitialized.
        unsafe {
            ptr::write(arch.value_ptr(col, row) as *mut T, value);
            Ok(arch.get_unchecked_mut::<T>(col, row))
        }
    }

    /// Removes `T` from the entity and returns it, `None` if the entity has no `T`.
    /// Panics if the entity is not alive.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Option<T> {
        self.try_remove_component(entity)
            .unwrap_or_else(|err| violated(err))
    }

    pub fn try_remove_component<T: Component>(&mut self, entity: Entity) -> Result<Option<T>, StorageError> {
        let from = self.location(entity)?;
        let (Some(from), Some(id)) = (from, self.components.id_of::<T>()) else {
            return Ok(None);
        };
        if self.archetypes.archetype(from).column_index(id).is_none() {
            return Ok(None);
        }

        let to = self
            .archetypes
            .without_component(from, id, &self.components, &self.config)?;

        let mut out = MaybeUninit::<T>::uninit();
        // Safety: `out` is valid for writes of `T`, which is the type of component `id`.
        unsafe {
            self.archetypes
                .relocate(entity, Some(from), to, Some((id, out.as_mut_ptr() as *mut u8)), self.tick)?;
            self.locations[entity.index() as usize] = to;
            Ok(Some(out.assume_init()))
        }
    }

    /// Returns a reference to the component `T` of the entity.
    /// Panics if the entity is not alive or has no `T`.
    pub fn get_component<T: Component>(&self, entity: Entity) -> &T {
        self.try_get_component(entity).unwrap_or_else(|err| violated(err))
    }

    pub fn try_get_component<T: Component>(&self, entity: Entity) -> Result<&T, StorageError> {
        let (arch, col, row) = self.typed_slot::<T>(entity)?;
        // Safety: the column stores `T`.
        Ok(unsafe { self.archetypes.archetype(arch).get_unchecked::<T>(col, row) })
    }

    /// Returns a mutable reference to the component `T` of the entity and marks it changed.
    /// Panics if the entity is not alive or has no `T`.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> &mut T {
        self.try_get_component_mut(entity)
            .unwrap_or_else(|err| violated(err))
    }

    pub fn try_get_component_mut<T: Component>(&mut self, entity: Entity) -> Result<&mut T, StorageError> {
        let (arch, col, row) = self.typed_slot::<T>(entity)?;
        let tick = self.tick;
        let arch = self.archetypes.archetype_mut(arch);
        arch.state_mut(col, row).mark_changed(tick);
        Ok(unsafe { arch.get_unchecked_mut::<T>(col, row) })
    }

    /// Returns `false` for dead entities.
    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        match self.components.id_of::<T>() {
            Some(id) => self.has_component_by_id(entity, id),
            None => false,
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Components by identifier

    /// Adds a default-constructed value of component `id` to the entity and returns a pointer to it.
    pub fn add_component_by_id(&mut self, entity: Entity, id: ComponentId) -> Result<NonNull<u8>, StorageError> {
        let from = self.location(entity)?;
        let desc = *self
            .components
            .descriptor(id)
            .ok_or(StorageError::UnknownComponent(id))?;

        if self.slot(entity, id)?.is_some() {
            return Err(StorageError::ComponentAlreadyPresent {
                entity,
                component: desc.name(),
            });
        }
        if !desc.can_construct() {
            return Err(StorageError::NotConstructible(desc.name()));
        }

        // Constructed before the entity moves, so a panicking constructor leaves it untouched.
        let staging = Staging::new(&desc)?;
        unsafe { desc.construct(staging.ptr()) };

        let moved = self
            .archetypes
            .with_component(from, id, &self.components, &self.config)
            .and_then(|to| Ok((to, unsafe { self.migrate(entity, from, to)? })));
        let (to, row) = match moved {
            Ok(moved) => moved,
            Err(err) => {
                unsafe { desc.drop_in_place(staging.ptr()) };
                return Err(err);
            }
        };

        let arch = self.archetypes.archetype(to);
        let ptr = arch.value_ptr(column_of(arch, id), row);
        // Safety: the slot of the added column is uninitialized and chunk memory is never null.
        unsafe {
            desc.move_value(staging.ptr(), ptr);
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    /// Drops the value of component `id`. Returns `false` if the entity has no such component.
    pub fn remove_component_by_id(&mut self, entity: Entity, id: ComponentId) -> Result<bool, StorageError> {
        let Some((from, _, _)) = self.slot(entity, id)? else {
            return Ok(false);
        };

        let to = self
            .archetypes
            .without_component(from, id, &self.components, &self.config)?;
        // Safety: nothing is taken out.
        unsafe {
            self.archetypes.relocate(entity, Some(from), to, None, self.tick)?;
        }
        self.locations[entity.index() as usize] = to;
        Ok(true)
    }

    /// Returns `false` for dead entities.
    pub fn has_component_by_id(&self, entity: Entity, id: ComponentId) -> bool {
        matches!(self.slot(entity, id), Ok(Some(_)))
    }

    /// Returns a pointer to the value of component `id` of the entity.
    pub fn get_component_raw(&self, entity: Entity, id: ComponentId) -> Option<NonNull<u8>> {
        let (arch, col, row) = self.slot(entity, id).ok()??;
        NonNull::new(self.archetypes.archetype(arch).value_ptr(col, row))
    }

    /// Returns a pointer to the value of component `id` of the entity and marks it changed.
    pub fn get_component_raw_mut(&mut self, entity: Entity, id: ComponentId) -> Option<NonNull<u8>> {
        let (arch, col, row) = self.slot(entity, id).ok()??;
        let tick = self.tick;
        let arch = self.archetypes.archetype_mut(arch);
        arch.state_mut(col, row).mark_changed(tick);
        NonNull::new(arch.value_ptr(col, row))
    }

    // ---------------------------------------------------------------------------------------------
    // Change detection

    /// Returns the tick stamped on values accessed mutably.
    pub fn change_tick(&self) -> Tick {
        self.tick
    }

    pub fn component_state<T: Component>(&self, entity: Entity) -> Option<ComponentState> {
        let (arch, col, row) = self.typed_slot::<T>(entity).ok()?;
        Some(*self.archetypes.archetype(arch).state(col, row))
    }

    /// Returns `true` if `T` of the entity changed since the previous check, and advances the tick.
    pub fn check_changed<T: Component>(&mut self, entity: Entity) -> Result<bool, StorageError> {
        let (arch, col, row) = self.typed_slot::<T>(entity)?;
        let tick = self.tick;
        let changed = self.archetypes.archetype_mut(arch).state_mut(col, row).check(tick);
        self.tick += 1;
        Ok(changed)
    }

    // ---------------------------------------------------------------------------------------------
    // Iteration

    /// Returns the chunks of every archetype storing at least the components `ids`.
    pub fn query_chunks<'a>(&'a self, ids: &'a [ComponentId]) -> impl Iterator<Item = ChunkView<'a>> + 'a {
        self.archetypes
            .iter()
            .filter(move |arch| arch.has_all(ids))
            .flat_map(|arch| arch.chunks())
    }

    /// Mutable counterpart of [query_chunks](Self::query_chunks).
    /// Mutably accessed columns are marked changed.
    pub fn query_chunks_mut<'a>(
        &'a mut self,
        ids: &'a [ComponentId],
    ) -> impl Iterator<Item = ChunkViewMut<'a>> + 'a {
        let tick = self.tick;
        self.archetypes
            .iter_mut()
            .filter(move |arch| arch.has_all(ids))
            .flat_map(move |arch| arch.chunks_mut(tick))
    }

    /// Returns an iterator over every entity having `T` along with its value.
    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        let id = self.components.id_of::<T>();
        self.archetypes
            .iter()
            .filter(move |arch| id.map_or(false, |id| arch.column_index(id).is_some()))
            .flat_map(|arch| arch.chunks())
            .flat_map(|chunk| {
                let values = chunk.column::<T>().unwrap_or(&[]);
                chunk.entities().iter().copied().zip(values)
            })
    }

    /// Calls `f` for every entity having `T`. Every visited value is marked changed.
    pub fn for_each_mut<T: Component>(&mut self, mut f: impl FnMut(Entity, &mut T)) {
        let Some(id) = self.components.id_of::<T>() else {
            return;
        };
        let tick = self.tick;

        for arch in self.archetypes.iter_mut() {
            if arch.column_index(id).is_none() {
                continue;
            }
            for mut chunk in arch.chunks_mut(tick) {
                if let Some((entities, values)) = chunk.entities_and_column_mut::<T>() {
                    for (&entity, value) in entities.iter().zip(values) {
                        f(entity, value);
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Archetypes

    /// Returns the number of archetypes created so far.
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetypes(&self) -> &ArchetypeRegistry {
        &self.archetypes
    }

    /// Returns the archetype of the entity, `None` for dead entities and entities without components.
    pub fn archetype_of(&self, entity: Entity) -> Option<&Archetype> {
        let arch = self.location(entity).ok()??;
        self.archetypes.get(arch)
    }

    // ---------------------------------------------------------------------------------------------

    fn location(&self, entity: Entity) -> Result<Option<ArchetypeId>, StorageError> {
        if !self.entities.is_alive(entity) {
            return Err(StorageError::DeadEntity(entity));
        }
        Ok(self.locations[entity.index() as usize])
    }

    /// Returns the archetype, column and row of component `id` of the entity.
    fn slot(&self, entity: Entity, id: ComponentId) -> Result<Option<(ArchetypeId, usize, usize)>, StorageError> {
        let Some(arch_id) = self.location(entity)? else {
            return Ok(None);
        };
        let arch = self.archetypes.archetype(arch_id);
        Ok(arch.column_index(id).map(|col| (arch_id, col, arch.row(entity))))
    }

    fn typed_slot<T: Component>(&self, entity: Entity) -> Result<(ArchetypeId, usize, usize), StorageError> {
        let missing = || StorageError::MissingComponent {
            entity,
            component: type_name::<T>(),
        };
        self.location(entity)?;
        let id = self.components.id_of::<T>().ok_or_else(missing)?;
        self.slot(entity, id)?.ok_or_else(missing)
    }

    /// Moves the entity into `to` and returns its row there.
    /// Columns of `to` missing in `from` are left uninitialized.
    ///
    /// Safety: the caller must initialize those columns before the next access.
    unsafe fn migrate(&mut self, entity: Entity, from: Option<ArchetypeId>, to: ArchetypeId) -> Result<usize, StorageError> {
        let row = self.archetypes.relocate(entity, from, Some(to), None, self.tick)?;
        self.locations[entity.index() as usize] = Some(to);
        Ok(row.unwrap_or_else(|| unreachable!("relocation into an archetype yields a row")))
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a clone whose row is only partly initialized when a `Clone` implementation panics.
struct PartialClone<'a> {
    archetype: &'a mut Archetype,
    entities: &'a mut EntityIdAllocator,
    locations: &'a mut [Option<ArchetypeId>],
    clone: Entity,
    row: usize,
    cloned: usize,
}

impl Drop for PartialClone<'_> {
    fn drop(&mut self) {
        // Safety: columns before `cloned` hold values, the rest are uninitialized.
        unsafe {
            for col in 0..self.cloned {
                let desc = *self.archetype.descriptor(col);
                desc.drop_in_place(self.archetype.value_ptr(col, self.row));
            }
            self.archetype.swap_remove(self.row, false);
        }
        self.locations[self.clone.index() as usize] = None;
        self.entities.destroy(self.clone);
    }
}

#[inline]
fn column_of(arch: &Archetype, id: ComponentId) -> usize {
    arch.column_index(id)
        .unwrap_or_else(|| unreachable!("archetype {} has no component {:?}", arch.id(), id))
}
