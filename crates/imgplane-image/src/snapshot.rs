//! Snapshots and the protection state machine
//!
//! ```text
//! Unprotected ──BeginProtect──▶ Protecting ──FinishProtect──▶ Protected
//!      ▲                            │                            │
//!      └────────AbortProtect────────┘                     BeginUnprotect
//!      ▲                                                         ▼
//!      └──────────FinishUnprotect─────────────────────── Unprotecting
//!                                  Protected ◀──AbortUnprotect──┘
//! ```
//!
//! Unprotect only finishes once no clone in any pool still references the
//! snapshot; otherwise it falls back to protected.

use crate::handle::ImageCtx;
use crate::lineage;
use crate::lock;
use crate::progress::{NoOpProgress, ProgressContext};
use imgplane_common::error::consistency_fault;
use imgplane_common::{
    Error, Features, ParentSpec, ProtectionState, Result, SnapId, SnapInfo, SnapshotNamespace,
};
use tracing::{debug, info, warn};

/// Optional steps taken before removing a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoveFlags {
    /// Flatten every clone of the snapshot first
    pub flatten_children: bool,
    /// Unprotect first; a snapshot that is not protected is left as is
    pub unprotect: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProtectionEvent {
    BeginProtect,
    FinishProtect,
    AbortProtect,
    BeginUnprotect,
    FinishUnprotect,
    AbortUnprotect,
}

fn transition(state: ProtectionState, event: ProtectionEvent) -> Result<ProtectionState> {
    use ProtectionEvent::{
        AbortProtect, AbortUnprotect, BeginProtect, BeginUnprotect, FinishProtect,
        FinishUnprotect,
    };
    use ProtectionState::{Protected, Protecting, Unprotected, Unprotecting};

    match (state, event) {
        (Unprotected, BeginProtect) => Ok(Protecting),
        (Protecting, FinishProtect) | (Unprotecting, AbortUnprotect) => Ok(Protected),
        (Protecting, AbortProtect) | (Unprotecting, FinishUnprotect) => Ok(Unprotected),
        (Protected, BeginUnprotect) => Ok(Unprotecting),
        (Protected, BeginProtect) => Err(Error::busy("snapshot is already protected")),
        (Unprotected, BeginUnprotect) => Err(Error::invalid_argument("snapshot is not protected")),
        (state, event) => Err(Error::busy(format!(
            "snapshot protection is {state}, cannot apply {event:?}"
        ))),
    }
}

fn find(ictx: &ImageCtx, name: &str) -> Result<SnapInfo> {
    ictx.metadata()
        .snap_by_name(name)
        .cloned()
        .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))
}

fn require_writable(ictx: &ImageCtx) -> Result<()> {
    if ictx.is_read_only() {
        return Err(Error::ReadOnly(format!("{} is opened read-only", ictx.name())));
    }
    Ok(())
}

fn require_layering(ictx: &ImageCtx) -> Result<()> {
    let md = ictx.metadata();
    if md.old_format {
        return Err(Error::not_supported("format 1 images do not support protection"));
    }
    if !md.features.contains(Features::LAYERING) {
        return Err(Error::invalid_argument("image must support layering"));
    }
    Ok(())
}

async fn set_protection(
    ictx: &ImageCtx,
    snap: SnapId,
    current: ProtectionState,
    event: ProtectionEvent,
) -> Result<ProtectionState> {
    let next = transition(current, event)?;
    ictx.context()
        .store()
        .snap_set_protection(ictx.pool(), ictx.image_id(), snap, next)
        .await?;
    debug!("Snapshot {snap} of {}: {current} -> {next}", ictx.name());
    Ok(next)
}

/// Create a user snapshot of the head
pub async fn create(ictx: &ImageCtx, name: &str) -> Result<SnapId> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;

    let id = ictx
        .context()
        .store()
        .snap_add(ictx.pool(), ictx.image_id(), name, SnapshotNamespace::User)
        .await?;
    ictx.notify_update().await;
    info!("Created snapshot {name} ({id}) of {}", ictx.name());
    Ok(id)
}

/// Remove a user snapshot
pub async fn remove(ictx: &ImageCtx, name: &str, flags: RemoveFlags) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let snap = find(ictx, name)?;
    if snap.namespace != SnapshotNamespace::User {
        return Err(Error::invalid_argument(format!(
            "snapshot {name} is not in the user namespace"
        )));
    }

    if flags.flatten_children {
        lineage::flatten_children(ictx, name, &NoOpProgress).await?;
    }
    if flags.unprotect {
        match unprotect(ictx, name).await {
            Ok(()) => {
                let state = ictx
                    .context()
                    .store()
                    .snap_get_protection(ictx.pool(), ictx.image_id(), snap.id)
                    .await?;
                if state == ProtectionState::Protected {
                    consistency_fault(&format!(
                        "snapshot {name} of {} still protected after unprotect",
                        ictx.name()
                    ));
                }
            }
            Err(Error::InvalidArgument(_)) => {
                debug!("Snapshot {name} was not protected");
            }
            Err(e) => return Err(e),
        }
    }

    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;
    let store = ictx.context().store();
    store
        .snap_remove(ictx.pool(), ictx.image_id(), snap.id)
        .await?;

    // Drop the child index entry once nothing references that parent any more
    if let Some(parent) = &snap.parent {
        let md = store.header_get(ictx.pool(), ictx.image_id()).await?;
        let referenced = md.parent.as_ref().is_some_and(|p| p.spec == parent.spec)
            || md
                .snaps
                .values()
                .any(|s| s.parent.as_ref().is_some_and(|p| p.spec == parent.spec));
        if !referenced {
            match store
                .children_remove(ictx.pool(), &parent.spec, ictx.image_id())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to drop child index entry of {}: {e}", ictx.name()),
            }
        }
    }

    ictx.notify_update().await;
    info!("Removed snapshot {name} of {}", ictx.name());
    Ok(())
}

/// Pin a snapshot so it can be cloned
pub async fn protect(ictx: &ImageCtx, name: &str) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    require_layering(ictx)?;
    let snap = find(ictx, name)?;
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;

    let store = ictx.context().store();
    let current = store
        .snap_get_protection(ictx.pool(), ictx.image_id(), snap.id)
        .await?;
    let state = set_protection(ictx, snap.id, current, ProtectionEvent::BeginProtect).await?;
    if let Err(e) = set_protection(ictx, snap.id, state, ProtectionEvent::FinishProtect).await {
        if let Err(undo) =
            set_protection(ictx, snap.id, state, ProtectionEvent::AbortProtect).await
        {
            warn!("Failed to roll back protection of {name}: {undo}");
        }
        return Err(e);
    }
    ictx.notify_update().await;
    info!("Protected snapshot {name} of {}", ictx.name());
    Ok(())
}

/// Unpin a snapshot; fails while any clone in any pool depends on it
pub async fn unprotect(ictx: &ImageCtx, name: &str) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    require_layering(ictx)?;
    let snap = find(ictx, name)?;
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;

    let store = ictx.context().store();
    let current = store
        .snap_get_protection(ictx.pool(), ictx.image_id(), snap.id)
        .await?;
    let state = set_protection(ictx, snap.id, current, ProtectionEvent::BeginUnprotect).await?;

    let spec = ParentSpec {
        pool: ictx.pool(),
        image_id: ictx.image_id().to_string(),
        snap_id: snap.id,
    };
    let outcome = match lineage::find_children(ictx.context(), &spec).await {
        Ok(children) if children.is_empty() => {
            set_protection(ictx, snap.id, state, ProtectionEvent::FinishUnprotect)
                .await
                .map(|_| ())
        }
        Ok(children) => {
            debug!("Snapshot {name} still has {} clones", children.len());
            Err(Error::HasChildren)
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            ictx.notify_update().await;
            info!("Unprotected snapshot {name} of {}", ictx.name());
            Ok(())
        }
        Err(e) => {
            if let Err(undo) =
                set_protection(ictx, snap.id, state, ProtectionEvent::AbortUnprotect).await
            {
                warn!("Failed to restore protection of {name}: {undo} (original error: {e})");
            }
            Err(e)
        }
    }
}

pub async fn rename(ictx: &ImageCtx, src: &str, dst: &str) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let snap = find(ictx, src)?;
    if ictx.metadata().snap_by_name(dst).is_some() {
        return Err(Error::AlreadyExists(format!("snapshot {dst}")));
    }
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;
    ictx.context()
        .store()
        .snap_rename(ictx.pool(), ictx.image_id(), snap.id, dst)
        .await?;
    ictx.notify_update().await;
    info!("Renamed snapshot {src} of {} to {dst}", ictx.name());
    Ok(())
}

/// Snapshots, oldest first
pub async fn list(ictx: &ImageCtx) -> Result<Vec<SnapInfo>> {
    ictx.refresh_if_required().await?;
    Ok(ictx.metadata().snaps.values().cloned().collect())
}

pub async fn exists(ictx: &ImageCtx, name: &str) -> Result<bool> {
    ictx.refresh_if_required().await?;
    Ok(ictx.metadata().snap_by_name(name).is_some())
}

/// Bind the handle to a snapshot, or back to the head
pub async fn set(ictx: &ImageCtx, name: Option<&str>) -> Result<()> {
    ictx.snap_set(name).await
}

/// Protected and unprotecting snapshots both count as protected
pub async fn is_protected(ictx: &ImageCtx, name: &str) -> Result<bool> {
    ictx.refresh_if_required().await?;
    let snap = find(ictx, name)?;
    let state = ictx
        .context()
        .store()
        .snap_get_protection(ictx.pool(), ictx.image_id(), snap.id)
        .await?;
    Ok(matches!(
        state,
        ProtectionState::Protected | ProtectionState::Unprotecting
    ))
}

/// Maximum number of snapshots; `u64::MAX` when unlimited
pub async fn get_limit(ictx: &ImageCtx) -> Result<u64> {
    match ictx
        .context()
        .store()
        .snap_limit_get(ictx.pool(), ictx.image_id())
        .await
    {
        Ok(limit) => Ok(limit.unwrap_or(u64::MAX)),
        Err(Error::NotSupported(_)) => Ok(u64::MAX),
        Err(e) => Err(e),
    }
}

/// Cap the snapshot count; `u64::MAX` removes the cap
pub async fn set_limit(ictx: &ImageCtx, limit: u64) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;
    let limit = (limit != u64::MAX).then_some(limit);
    ictx.context()
        .store()
        .snap_limit_set(ictx.pool(), ictx.image_id(), limit)
        .await?;
    ictx.notify_update().await;
    Ok(())
}

/// Restore the head to the contents of a snapshot
pub async fn rollback(ictx: &ImageCtx, name: &str, progress: &dyn ProgressContext) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_writable(ictx)?;
    let snap = find(ictx, name)?;
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;

    let store = ictx.context().store();
    let md = ictx.metadata();
    if md.size != snap.size {
        store
            .header_set_size(ictx.pool(), ictx.image_id(), snap.size)
            .await?;
    }

    let snapc = md.snap_context();
    let object_size = md.layout.object_size();
    let total = md.layout.num_objects(snap.size.max(md.size));
    for objno in 0..total {
        let oid = crate::layout::object_name(&md.object_prefix, objno);
        let at_snap = if objno < md.layout.num_objects(snap.size) {
            match store
                .object_read(ictx.pool(), &oid, snap.id, 0, object_size)
                .await
            {
                Ok(data) => Some(data),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        match at_snap {
            Some(data) => {
                ictx.mark_object(objno).await?;
                store.object_truncate(ictx.pool(), &oid, &snapc, 0).await?;
                store.object_write(ictx.pool(), &oid, &snapc, 0, &data).await?;
            }
            None => match store.object_remove(ictx.pool(), &oid, &snapc).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            },
        }
        progress.update_progress(objno + 1, total);
    }

    ictx.notify_update().await;
    info!("Rolled back {} to snapshot {name}", ictx.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{self, CreateOptions};
    use crate::io;
    use crate::lineage::CloneOptions;
    use crate::progress::RecordingProgress;
    use crate::test_support::{open, setup};

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_protection_transition_table() {
        use ProtectionEvent::*;
        use ProtectionState::*;
        assert_eq!(transition(Unprotected, BeginProtect), Ok(Protecting));
        assert_eq!(transition(Protecting, FinishProtect), Ok(Protected));
        assert_eq!(transition(Protected, BeginUnprotect), Ok(Unprotecting));
        assert_eq!(transition(Unprotecting, FinishUnprotect), Ok(Unprotected));
        assert_eq!(transition(Unprotecting, AbortUnprotect), Ok(Protected));
        assert!(matches!(transition(Protected, BeginProtect), Err(Error::Busy(_))));
        assert!(matches!(transition(Protecting, BeginUnprotect), Err(Error::Busy(_))));
        assert!(matches!(transition(Unprotecting, BeginProtect), Err(Error::Busy(_))));
        assert!(matches!(
            transition(Unprotected, BeginUnprotect),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_unprotect_blocked_by_clone_until_removed() {
        let (_cluster, ctx, pool) = setup();
        let opts = CreateOptions {
            order: Some(22),
            ..CreateOptions::default()
        };
        image::create(&ctx, pool, "a", 10 * GIB, &opts).await.unwrap();
        let a = open(&ctx, pool, "a").await;
        create(&a, "s1").await.unwrap();
        protect(&a, "s1").await.unwrap();
        lineage::clone(&ctx, pool, "a", "s1", pool, "b", &CloneOptions::default())
            .await
            .unwrap();

        assert_eq!(unprotect(&a, "s1").await, Err(Error::HasChildren));
        assert!(is_protected(&a, "s1").await.unwrap());

        image::remove(&ctx, pool, "b", false, &NoOpProgress)
            .await
            .unwrap();
        unprotect(&a, "s1").await.unwrap();
        assert!(!is_protected(&a, "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_children_in_other_pools_block_unprotect() {
        let (cluster, ctx, pool) = setup();
        let other = cluster.create_pool("other").unwrap();
        cluster.create_cache_tier("cache", other).unwrap();
        image::create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        let a = open(&ctx, pool, "a").await;
        create(&a, "s").await.unwrap();
        protect(&a, "s").await.unwrap();
        lineage::clone(&ctx, pool, "a", "s", other, "b", &CloneOptions::default())
            .await
            .unwrap();

        assert_eq!(unprotect(&a, "s").await, Err(Error::HasChildren));
        let b = open(&ctx, other, "b").await;
        lineage::flatten(&b, &NoOpProgress).await.unwrap();
        unprotect(&a, "s").await.unwrap();
    }

    #[tokio::test]
    async fn test_protect_rules() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        let a = open(&ctx, pool, "a").await;
        create(&a, "s").await.unwrap();
        assert!(matches!(
            unprotect(&a, "s").await,
            Err(Error::InvalidArgument(_))
        ));
        protect(&a, "s").await.unwrap();
        assert!(matches!(protect(&a, "s").await, Err(Error::Busy(_))));
        assert!(matches!(
            remove(&a, "s", RemoveFlags::default()).await,
            Err(Error::Busy(_))
        ));

        let plain = CreateOptions {
            features: Some(Features::EXCLUSIVE_LOCK),
            ..CreateOptions::default()
        };
        image::create(&ctx, pool, "nolayer", GIB, &plain).await.unwrap();
        let img = open(&ctx, pool, "nolayer").await;
        create(&img, "s").await.unwrap();
        assert!(matches!(
            protect(&img, "s").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_with_flags() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "a", 1 << 23, &CreateOptions::default())
            .await
            .unwrap();
        let a = open(&ctx, pool, "a").await;
        io::write(&a, 0, b"parent").await.unwrap();
        create(&a, "s").await.unwrap();
        protect(&a, "s").await.unwrap();
        lineage::clone(&ctx, pool, "a", "s", pool, "b", &CloneOptions::default())
            .await
            .unwrap();

        let flags = RemoveFlags {
            flatten_children: true,
            unprotect: true,
        };
        remove(&a, "s", flags).await.unwrap();
        assert!(!exists(&a, "s").await.unwrap());

        let b = open(&ctx, pool, "b").await;
        assert!(b.get_parent_info().await.unwrap_err().is_not_found());
        assert_eq!(io::read(&b, 0, 6).await.unwrap(), b"parent");

        // Unprotect of an unprotected snapshot is a no-op
        create(&a, "t").await.unwrap();
        remove(&a, "t", flags).await.unwrap();
    }

    #[tokio::test]
    async fn test_only_user_snapshots_are_removable() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        let a = open(&ctx, pool, "a").await;
        ctx.store()
            .snap_add(
                pool,
                a.image_id(),
                "m",
                SnapshotNamespace::Mirror { primary: true },
            )
            .await
            .unwrap();
        a.refresh().await.unwrap();
        assert!(matches!(
            remove(&a, "m", RemoveFlags::default()).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_limit() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        let a = open(&ctx, pool, "a").await;
        assert_eq!(get_limit(&a).await.unwrap(), u64::MAX);
        set_limit(&a, 1).await.unwrap();
        create(&a, "one").await.unwrap();
        assert_eq!(
            create(&a, "two").await,
            Err(Error::SnapshotLimit { limit: 1 })
        );
        set_limit(&a, u64::MAX).await.unwrap();
        create(&a, "two").await.unwrap();
        assert_eq!(list(&a).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_and_rollback() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "a", 2 << 22, &CreateOptions::default())
            .await
            .unwrap();
        let a = open(&ctx, pool, "a").await;
        io::write(&a, 0, b"original").await.unwrap();
        create(&a, "s").await.unwrap();
        io::write(&a, 0, b"changed!").await.unwrap();
        io::write(&a, 1 << 22, b"new").await.unwrap();

        rename(&a, "s", "base").await.unwrap();
        assert!(matches!(
            rename(&a, "missing", "x").await,
            Err(Error::SnapshotNotFound(_))
        ));

        let progress = RecordingProgress::default();
        rollback(&a, "base", &progress).await.unwrap();
        assert_eq!(io::read(&a, 0, 8).await.unwrap(), b"original");
        assert_eq!(io::read(&a, 1 << 22, 3).await.unwrap(), vec![0; 3]);
        assert_eq!(progress.last(), Some((2, 2)));
    }
}
