//! The opaque pool handle.
//!
//! The source this crate is modeled on tags pool references by stealing
//! the low bit of the pointer, purely so one C function signature can
//! serve several pool flavors. [`PoolKind`] is the tagged-variant
//! alternative: handle identity is still pointer equality of the
//! underlying instance, and the kind is carried alongside it rather than
//! folded into the address.

use core::ptr::NonNull;

use crate::pool::PoolInstance;

/// Which flavor of pool a [`PoolHandle`] refers to.
///
/// Only `Native` exists in this crate; the enum exists so the handle type
/// has somewhere to carry a discriminant without resorting to pointer
/// tagging. The discriminant is not part of the externally observable
/// contract -- only handle identity (pointer equality) is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Native,
}

/// An opaque reference to a live pool instance.
///
/// Two handles compare equal exactly when they refer to the same pool
/// instance; the handle carries no data a caller can use to reach into
/// the pool except through [`crate::pool::PagePool`]'s own methods.
#[derive(Clone, Copy)]
pub struct PoolHandle {
    kind: PoolKind,
    pub(crate) instance: NonNull<PoolInstance>,
}

impl PoolHandle {
    pub(crate) fn new(instance: NonNull<PoolInstance>) -> Self {
        Self {
            kind: PoolKind::Native,
            instance,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

impl PartialEq for PoolHandle {
    fn eq(&self, other: &Self) -> bool {
        self.instance == other.instance
    }
}

impl Eq for PoolHandle {}

impl core::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("kind", &self.kind)
            .field("instance", &self.instance.as_ptr())
            .finish()
    }
}
