#![allow(clippy::result_large_err)]
//! imgplane image - client-side control plane for block images
//!
//! An image is a header object plus a striped set of data objects in a
//! pool of the metadata store. This crate owns everything a client does to
//! an image other than moving bytes on the wire:
//!
//! - **Handles**: open/refresh/close, bound to the head or a snapshot
//! - **Exclusive lock**: cooperative single-writer ownership
//! - **Lineage**: clone from a protected snapshot, flatten, bulk copy
//! - **Snapshots**: create/remove/rollback and the protection state machine
//! - **Mirroring**: per-image and per-pool mirroring state machines
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ image · snapshot · lineage · mirror · lock   │  operations
//! └──────────────────────┬───────────────────────┘
//!                        │ Arc<ImageCtx>
//! ┌──────────────────────▼───────────────────────┐
//! │ handle (ImageCtx) ─ registry ─ io ─ journal  │  per-image state
//! └──────────────────────┬───────────────────────┘
//!                        │ Context (store + config)
//! ┌──────────────────────▼───────────────────────┐
//! │ imgplane_store::MetadataStore                │
//! └──────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod handle;
pub mod image;
pub mod io;
pub mod journal;
pub mod layout;
pub mod lineage;
pub mod lock;
pub mod mirror;
pub mod progress;
pub mod registry;
pub mod snapshot;
pub mod undo;

pub use context::Context;
pub use handle::{ImageCtx, ImageMetadata, ParentImageInfo, SnapTarget};
pub use image::{CreateOptions, ImageInfo};
pub use layout::Layout;
pub use lineage::{ChildImage, CloneOptions};
pub use lock::{BreakOutcome, LockState};
pub use progress::{LogProgress, NoOpProgress, ProgressContext, RecordingProgress};
pub use registry::{HandleId, HandleRegistry};
pub use snapshot::RemoveFlags;
pub use undo::Compensations;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::context::Context;
    use crate::handle::ImageCtx;
    use crate::image;
    use imgplane_common::{Config, PoolId};
    use imgplane_store::Cluster;
    use std::sync::Arc;

    /// Fresh cluster with an `rbd` pool and a default-configured client
    pub fn setup() -> (Arc<Cluster>, Context, PoolId) {
        let cluster = Cluster::new();
        let pool = cluster.create_pool("rbd").unwrap();
        let ctx = connect(&cluster, Config::default());
        (cluster, ctx, pool)
    }

    /// Another client of the same cluster
    pub fn connect(cluster: &Arc<Cluster>, config: Config) -> Context {
        Context::new(Arc::new(cluster.connect()), config)
    }

    pub async fn open(ctx: &Context, pool: PoolId, name: &str) -> Arc<ImageCtx> {
        image::open(ctx, pool, name, false).await.unwrap()
    }
}
