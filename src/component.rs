use crate::HashMap;
use std::alloc::Layout;
use std::any::{type_name, TypeId};
use std::{fmt, ptr};

/// Any type that can be stored as a component.
pub trait Component: Send + Sync + 'static {}

impl<T> Component for T where T: Send + Sync + 'static {}

/// A change counter. Starts at 1, 0 means "never".
pub type Tick = u64;

/// A component type identifier, unique within a [World](crate::World).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

/// Change state of a single component value.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct ComponentState {
    pub last_change: Tick,
    pub last_check: Tick,
}

impl ComponentState {
    pub(crate) fn inserted(tick: Tick) -> Self {
        ComponentState {
            last_change: tick,
            last_check: 0,
        }
    }

    #[inline]
    pub(crate) fn mark_changed(&mut self, tick: Tick) {
        self.last_change = tick;
    }

    /// Returns `true` if the value was changed after `tick`.
    #[inline]
    pub fn changed_since(&self, tick: Tick) -> bool {
        self.last_change > tick
    }

    /// Returns `true` if the value changed since the previous check and records this check.
    pub(crate) fn check(&mut self, tick: Tick) -> bool {
        let changed = self.last_change > self.last_check;
        self.last_check = tick;
        changed
    }
}

unsafe fn drop_one<T>(p: *mut u8) {
    ptr::drop_in_place(p as *mut T);
}

unsafe fn drop_many<T>(p: *mut u8, count: usize) {
    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(p as *mut T, count));
}

unsafe fn move_one<T>(src: *mut u8, dst: *mut u8) {
    ptr::copy_nonoverlapping(src as *const T, dst as *mut T, 1);
}

unsafe fn construct_default<T: Default>(dst: *mut u8) {
    ptr::write(dst as *mut T, T::default());
}

unsafe fn clone_one<T: Clone>(src: *const u8, dst: *mut u8) {
    ptr::write(dst as *mut T, (*(src as *const T)).clone());
}

/// Type-erased operations on values of a single component type.
///
/// All storages place, relocate and tear down component values exclusively through these functions.
#[derive(Copy, Clone)]
pub struct TypeDescriptor {
    name: &'static str,
    rust_type: Option<TypeId>,
    layout: Layout,
    construct: Option<unsafe fn(*mut u8)>,
    drop: Option<unsafe fn(*mut u8)>,
    drop_batch: Option<unsafe fn(*mut u8, usize)>,
    move_fn: unsafe fn(*mut u8, *mut u8),
    clone: Option<unsafe fn(*const u8, *mut u8)>,
}

impl TypeDescriptor {
    /// Describes the Rust type `T`. Default construction and cloning are not available
    /// until added with [with_default](Self::with_default) and [with_clone](Self::with_clone).
    pub fn of<T: Component>() -> Self {
        let needs_drop = std::mem::needs_drop::<T>();
        TypeDescriptor {
            name: type_name::<T>(),
            rust_type: Some(TypeId::of::<T>()),
            layout: Layout::new::<T>(),
            construct: None,
            drop: needs_drop.then_some(drop_one::<T> as unsafe fn(*mut u8)),
            drop_batch: needs_drop.then_some(drop_many::<T> as unsafe fn(*mut u8, usize)),
            move_fn: move_one::<T> as unsafe fn(*mut u8, *mut u8),
            clone: None,
        }
    }

    pub fn with_default<T: Component + Default>(mut self) -> Self {
        assert_eq!(self.rust_type, Some(TypeId::of::<T>()), "descriptor of another type");
        self.construct = Some(construct_default::<T> as unsafe fn(*mut u8));
        self
    }

    pub fn with_clone<T: Component + Clone>(mut self) -> Self {
        assert_eq!(self.rust_type, Some(TypeId::of::<T>()), "descriptor of another type");
        self.clone = Some(clone_one::<T> as unsafe fn(*const u8, *mut u8));
        self
    }

    /// Describes a type that is only known at runtime.
    /// The size is rounded up to a multiple of the alignment.
    ///
    /// # Safety
    /// * `construct` must fully initialize `layout.size()` bytes at an address aligned to `layout.align()`.
    /// * `move_fn(src, dst)` must relocate the value so that `src` is never used again.
    /// * `drop` must release every resource of an initialized value.
    /// * `clone(src, dst)` must initialize `dst` with an independent copy of `src`.
    /// * Values must be safe to send and share between threads.
    pub unsafe fn from_raw_parts(
        name: &'static str,
        layout: Layout,
        construct: Option<unsafe fn(*mut u8)>,
        drop: Option<unsafe fn(*mut u8)>,
        move_fn: unsafe fn(*mut u8, *mut u8),
        clone: Option<unsafe fn(*const u8, *mut u8)>,
    ) -> Self {
        TypeDescriptor {
            name,
            rust_type: None,
            layout: layout.pad_to_align(),
            construct,
            drop,
            drop_batch: None,
            move_fn,
            clone,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the `TypeId` of a descriptor created with [of](Self::of).
    pub fn rust_type(&self) -> Option<TypeId> {
        self.rust_type
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.rust_type == Some(TypeId::of::<T>())
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn needs_drop(&self) -> bool {
        self.drop.is_some() || self.drop_batch.is_some()
    }

    pub fn can_construct(&self) -> bool {
        self.construct.is_some()
    }

    pub fn can_clone(&self) -> bool {
        self.clone.is_some()
    }

    /// Default-initializes a value at `dst`. Returns `false` if the type has no constructor.
    /// Safety: `dst` must be valid for writes of this type.
    pub(crate) unsafe fn construct(&self, dst: *mut u8) -> bool {
        match self.construct {
            Some(f) => {
                f(dst);
                true
            }
            None => false,
        }
    }

    /// Safety: `p` must point to an initialized value of this type.
    pub(crate) unsafe fn drop_in_place(&self, p: *mut u8) {
        if let Some(f) = self.drop {
            f(p);
        } else if let Some(f) = self.drop_batch {
            f(p, 1);
        }
    }

    /// Drops `count` contiguous values starting at `base`.
    /// Safety: all of them must be initialized.
    pub(crate) unsafe fn drop_batch(&self, base: *mut u8, count: usize) {
        if let Some(f) = self.drop_batch {
            f(base, count);
        } else if let Some(f) = self.drop {
            for i in 0..count {
                f(base.add(i * self.layout.size()));
            }
        }
    }

    /// Safety: `src` must be initialized, `dst` must be valid for writes; `src` is uninitialized afterwards.
    #[inline]
    pub(crate) unsafe fn move_value(&self, src: *mut u8, dst: *mut u8) {
        (self.move_fn)(src, dst);
    }

    /// Returns `false` if the type cannot be cloned.
    /// Safety: `src` must be initialized, `dst` must be valid for writes.
    pub(crate) unsafe fn clone_value(&self, src: *const u8, dst: *mut u8) -> bool {
        match self.clone {
            Some(f) => {
                f(src, dst);
                true
            }
            None => false,
        }
    }

    /// Adds capabilities of `other` that this descriptor lacks.
    fn merge(&mut self, other: &TypeDescriptor) {
        if self.construct.is_none() {
            self.construct = other.construct;
        }
        if self.clone.is_none() {
            self.clone = other.clone;
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("construct", &self.construct.is_some())
            .field("clone", &self.clone.is_some())
            .finish()
    }
}

/// Descriptors of all component types known to a world.
#[derive(Default)]
pub struct ComponentRegistry {
    descriptors: Vec<TypeDescriptor>,
    by_rust_type: HashMap<TypeId, ComponentId>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `T` if it is not registered yet and returns its identifier.
    pub fn register<T: Component>(&mut self) -> ComponentId {
        match self.by_rust_type.get(&TypeId::of::<T>()) {
            Some(&id) => id,
            None => self.register_descriptor(TypeDescriptor::of::<T>()),
        }
    }

    /// Registers a descriptor. Rust types are registered once: registering the same type
    /// again returns the existing identifier and adds the missing capabilities.
    /// Runtime-defined descriptors always receive a new identifier.
    pub fn register_descriptor(&mut self, descriptor: TypeDescriptor) -> ComponentId {
        if let Some(rust_type) = descriptor.rust_type {
            if let Some(&id) = self.by_rust_type.get(&rust_type) {
                self.descriptors[id.index()].merge(&descriptor);
                return id;
            }
        }

        let id = ComponentId(self.descriptors.len() as u32);
        tracing::debug!(?id, name = descriptor.name, size = descriptor.size(), "registered component");

        if let Some(rust_type) = descriptor.rust_type {
            self.by_rust_type.insert(rust_type, id);
        }
        self.descriptors.push(descriptor);
        id
    }

    /// Returns the identifier of `T` if it is registered.
    #[inline]
    pub fn id_of<T: 'static>(&self) -> Option<ComponentId> {
        self.by_rust_type.get(&TypeId::of::<T>()).copied()
    }

    #[inline]
    pub fn descriptor(&self, id: ComponentId) -> Option<&TypeDescriptor> {
        self.descriptors.get(id.index())
    }

    /// Returns the number of registered component types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Name(String);

    #[test]
    fn descriptor_capabilities() {
        let plain = TypeDescriptor::of::<u32>();
        assert!(!plain.needs_drop());
        assert!(!plain.can_construct());
        assert_eq!(plain.size(), 4);

        let name = TypeDescriptor::of::<Name>().with_default::<Name>().with_clone::<Name>();
        assert!(name.needs_drop());
        assert!(name.is::<Name>());

        let mut a = MaybeUninit::<Name>::uninit();
        let mut b = MaybeUninit::<Name>::uninit();
        unsafe {
            assert!(name.construct(a.as_mut_ptr() as *mut u8));
            (*a.as_mut_ptr()).0.push_str("hi");
            assert!(name.clone_value(a.as_ptr() as *const u8, b.as_mut_ptr() as *mut u8));
            assert_eq!(b.assume_init_ref(), &Name("hi".to_string()));
            name.drop_in_place(a.as_mut_ptr() as *mut u8);
            name.drop_in_place(b.as_mut_ptr() as *mut u8);
        }
    }

    #[test]
    fn registering_twice_merges() {
        let mut registry = ComponentRegistry::new();
        let id = registry.register::<Name>();
        assert!(!registry.descriptor(id).unwrap().can_construct());

        let again = registry.register_descriptor(TypeDescriptor::of::<Name>().with_default::<Name>());
        assert_eq!(id, again);
        assert!(registry.descriptor(id).unwrap().can_construct());
        assert_eq!(registry.id_of::<Name>(), Some(id));
        assert_eq!(registry.id_of::<u8>(), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn check_detects_changes_once() {
        let mut state = ComponentState::inserted(1);
        assert!(state.check(1));
        assert!(!state.check(2));
        state.mark_changed(3);
        assert!(state.changed_since(2));
        assert!(state.check(3));
        assert!(!state.check(4));
    }
}
