//! Shared, copy-on-write metadata snapshots.
//!
//! A [`MetadataRef`] pins one [`HotMetadata`] instance. Anything borrowed
//! through it stays valid until that same `MetadataRef` is swapped or
//! dropped; swaps made through other refs never touch it.

pub mod store;

pub use store::MetadataStore;

use crate::catalog::HotMetadata;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapKind {
    /// No other holder; contents replaced in place.
    InPlace,
    /// The old instance was shared; this ref now points at a fresh one.
    Unshared,
}

#[derive(Debug, Clone)]
pub struct MetadataRef {
    inner: Arc<HotMetadata>,
}

impl MetadataRef {
    pub fn new(metadata: HotMetadata) -> Self {
        Self {
            inner: Arc::new(metadata),
        }
    }

    pub fn from_shared(inner: Arc<HotMetadata>) -> Self {
        Self { inner }
    }

    /// Number of holders of the pinned instance, this one included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn shared(&self) -> Arc<HotMetadata> {
        Arc::clone(&self.inner)
    }

    pub fn ptr_eq(&self, other: &MetadataRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn swap_metadata(&mut self, metadata: HotMetadata) -> SwapKind {
        match Arc::get_mut(&mut self.inner) {
            Some(slot) => {
                *slot = metadata;
                SwapKind::InPlace
            }
            None => {
                self.inner = Arc::new(metadata);
                SwapKind::Unshared
            }
        }
    }

    /// Mutable access, unsharing first if anyone else holds the instance.
    pub fn make_mut(&mut self) -> &mut HotMetadata {
        Arc::make_mut(&mut self.inner)
    }
}

impl Deref for MetadataRef {
    type Target = HotMetadata;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
