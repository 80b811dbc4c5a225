use crate::archetype::chunk::MAX_INLINE_COMPONENTS;
use crate::component::{Component, TypeDescriptor};
use smallvec::{smallvec, SmallVec};
use std::mem::MaybeUninit;
use std::ptr;

/// A field of a [Bundle] together with its byte offset.
#[derive(Copy, Clone, Debug)]
pub struct BundleField {
    pub descriptor: TypeDescriptor,
    pub offset: usize,
}

pub type BundleFields = SmallVec<[BundleField; MAX_INLINE_COMPONENTS]>;

/// A group of components that is spawned as a single entity.
///
/// Implemented for tuples of components and derived with `#[derive(Bundle)]`.
/// Every field becomes a separate component; the bundle itself is never dropped,
/// so a `Drop` implementation of the bundle type does not run.
///
/// # Safety
/// `fields` must list every field of `Self` exactly once, each with a descriptor of the field type
/// and the field offset within `Self`.
pub unsafe trait Bundle: Send + Sync + 'static {
    fn fields() -> BundleFields;
}

macro_rules! impl_bundle_for_tuple {
    ($($name:ident $idx:tt),+) => {
        unsafe impl<$($name: Component),+> Bundle for ($($name,)+) {
            fn fields() -> BundleFields {
                let uninit = MaybeUninit::<Self>::uninit();
                let base = uninit.as_ptr();
                smallvec![$(BundleField {
                    descriptor: TypeDescriptor::of::<$name>(),
                    // Safety: only the address of the field is taken.
                    offset: unsafe { ptr::addr_of!((*base).$idx) as usize - base as usize },
                }),+]
            }
        }
    };
}

impl_bundle_for_tuple!(A 0);
impl_bundle_for_tuple!(A 0, B 1);
impl_bundle_for_tuple!(A 0, B 1, C 2);
impl_bundle_for_tuple!(A 0, B 1, C 2, D 3);
impl_bundle_for_tuple!(A 0, B 1, C 2, D 3, E 4);
impl_bundle_for_tuple!(A 0, B 1, C 2, D 3, E 4, F 5);
impl_bundle_for_tuple!(A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_bundle_for_tuple!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_offsets_point_at_fields() {
        let fields = <(u8, u64, u16)>::fields();
        assert_eq!(fields.len(), 3);

        let value = (1u8, 2u64, 3u16);
        let base = &value as *const _ as usize;
        assert_eq!(fields[0].offset, &value.0 as *const _ as usize - base);
        assert_eq!(fields[1].offset, &value.1 as *const _ as usize - base);
        assert_eq!(fields[2].offset, &value.2 as *const _ as usize - base);
        assert!(fields[1].descriptor.is::<u64>());
    }
}
