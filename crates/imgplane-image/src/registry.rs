//! Arena of open image handles
//!
//! Handles refer to each other (child to parent) by [`HandleId`] and resolve
//! the link here, so a parent can be closed and reopened independently of
//! the children that point at it.

use crate::handle::ImageCtx;
use imgplane_common::PoolId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier of an open handle
pub type HandleId = u64;

#[derive(Default)]
pub struct HandleRegistry {
    next_id: AtomicU64,
    handles: RwLock<HashMap<HandleId, Arc<ImageCtx>>>,
}

impl HandleRegistry {
    pub(crate) fn allocate_id(&self) -> HandleId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn insert(&self, handle: Arc<ImageCtx>) {
        self.handles.write().insert(handle.handle_id(), handle);
    }

    pub(crate) fn remove(&self, id: HandleId) -> Option<Arc<ImageCtx>> {
        self.handles.write().remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<Arc<ImageCtx>> {
        self.handles.read().get(&id).cloned()
    }

    /// Open handles of one image, in any snapshot
    #[must_use]
    pub fn open_handles(&self, pool: PoolId, image_id: &str) -> Vec<Arc<ImageCtx>> {
        self.handles
            .read()
            .values()
            .filter(|h| h.pool() == pool && h.image_id() == image_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}
