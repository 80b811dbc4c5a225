//! A container for entity component data.
//!
//! An entity is an opaque identifier for an object.
//! Each entity can have any set of components associated with it, and the set can change at runtime.
//! Storage is based on [ECS](https://en.wikipedia.org/wiki/Entity_component_system) technique:
//! entities with the same set of components share an archetype, which keeps the components
//! in fixed-size chunks, one contiguous column per component type.
//!
//! Component types don't have to be known at compile time: a [TypeDescriptor]
//! carries everything the storage needs to construct, move, clone and drop the values.
//!
//! # Examples
//!
//! ```
//! use entity_store::{Bundle, World};
//!
//! #[derive(Default, Debug, PartialEq)]
//! struct Position {
//!     x: f32,
//!     y: f32,
//! }
//!
//! #[derive(Default)]
//! struct Velocity {
//!     dx: f32,
//!     dy: f32,
//! }
//!
//! #[derive(Bundle)]
//! struct Bird {
//!     position: Position,
//!     velocity: Velocity,
//! }
//!
//! let mut world = World::new();
//!
//! let rock = world.create_entity();
//! world.insert_component(rock, Position { x: 1.0, y: 2.0 });
//!
//! let bird = world.spawn(Bird {
//!     position: Position::default(),
//!     velocity: Velocity { dx: 1.0, dy: 0.5 },
//! });
//!
//! world.for_each_mut::<Position>(|entity, position| {
//!     if entity == bird {
//!         position.x += 1.0;
//!     }
//! });
//! assert_eq!(world.get_component::<Position>(bird), &Position { x: 1.0, y: 0.0 });
//!
//! let velocity = world.remove_component::<Velocity>(bird).unwrap();
//! assert_eq!(velocity.dx, 1.0);
//!
//! // `rock` and `bird` now share an archetype.
//! assert_eq!(world.archetype_of(rock).unwrap().len(), 2);
//! ```

extern crate self as entity_store;


mod archetype;
mod bundle;
mod component;
mod component_storage;
mod config;
mod entity;
mod error;
#[doc(hidden)]
pub mod private;
mod sparse_set;
mod world;

pub use archetype::chunk::{ChunkView, ChunkViewMut};
pub use archetype::registry::ArchetypeRegistry;
pub use archetype::{Archetype, ArchetypeId};
pub use bundle::{Bundle, BundleField, BundleFields};
pub use component::{Component, ComponentId, ComponentRegistry, ComponentState, Tick, TypeDescriptor};
pub use component_storage::ComponentColumn;
pub use config::StorageConfig;
pub use entity::{Entity, EntityIdAllocator};
pub use error::{Result, StorageError};
pub use macros::Bundle;
pub use sparse_set::{PagedSparseSet, SparseIndex};
pub use world::World;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub(crate) type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;
