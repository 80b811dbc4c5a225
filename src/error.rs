use crate::{ComponentId, Entity};
use thiserror::Error;

/// Errors reported by the checked storage API.
///
/// The unchecked API panics with the same messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("{0} is not alive")]
    DeadEntity(Entity),

    #[error("{entity} has no component `{component}`")]
    MissingComponent {
        entity: Entity,
        component: &'static str,
    },

    #[error("{entity} already has component `{component}`")]
    ComponentAlreadyPresent {
        entity: Entity,
        component: &'static str,
    },

    #[error("component {0:?} is not registered")]
    UnknownComponent(ComponentId),

    #[error("component `{0}` has no default constructor")]
    NotConstructible(&'static str),

    #[error("component `{0}` cannot be cloned")]
    NotCloneable(&'static str),

    #[error("component `{0}` appears more than once in a bundle")]
    DuplicateComponent(&'static str),

    #[error("failed to allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("chunk layout does not fit in the address space")]
    LayoutOverflow,

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("entity index space is exhausted")]
    EntitiesExhausted,
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
