//! Replication journal client
//!
//! Only tag ownership is handled here: the newest tag names the cluster
//! that is currently allowed to write. Appending and replaying entries is
//! the replication daemon's business.

use crate::handle::ImageCtx;
use imgplane_common::{Result, TagOwner};
use tracing::info;

/// Owner of the newest journal tag
pub async fn tag_owner(ictx: &ImageCtx) -> Result<TagOwner> {
    ictx.context()
        .store()
        .journal_tag_owner(ictx.pool(), ictx.image_id())
        .await
}

/// Whether this cluster is the write primary
pub async fn is_tag_owner(ictx: &ImageCtx) -> Result<bool> {
    Ok(tag_owner(ictx).await? == TagOwner::Local)
}

async fn allocate_tag(ictx: &ImageCtx, owner: TagOwner) -> Result<()> {
    ictx.context()
        .store()
        .journal_allocate_tag(ictx.pool(), ictx.image_id(), &owner)
        .await?;
    info!("Journal of {} now owned by {owner:?}", ictx.name());
    Ok(())
}

pub(crate) async fn promote(ictx: &ImageCtx) -> Result<()> {
    allocate_tag(ictx, TagOwner::Local).await
}

/// Give up primary ownership without naming a successor
pub(crate) async fn demote(ictx: &ImageCtx) -> Result<()> {
    allocate_tag(ictx, TagOwner::Orphan).await
}

pub(crate) async fn request_resync(ictx: &ImageCtx) -> Result<()> {
    ictx.context()
        .store()
        .journal_request_resync(ictx.pool(), ictx.image_id())
        .await
}

pub async fn resync_requested(ictx: &ImageCtx) -> Result<bool> {
    ictx.context()
        .store()
        .journal_resync_requested(ictx.pool(), ictx.image_id())
        .await
}
