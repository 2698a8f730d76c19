//! Mirroring state machines
//!
//! Per image: `Disabled -> Enabled -> Disabling -> Disabled`. Per pool:
//! `Disabled <-> Image <-> Pool`, always passing through `Image` so image
//! level enable/disable can be reused for the pool-wide walks.
//!
//! ```text
//!            enable                 disable
//!  Disabled ───────▶ Enabled ─────────────────▶ Disabling ──teardown──▶ (removed)
//!                      ▲                            │
//!                      └────── rollback on error ───┘
//! ```

use crate::context::Context;
use crate::handle::ImageCtx;
use crate::image;
use crate::journal;
use crate::lineage;
use crate::lock;
use crate::undo::Compensations;
use imgplane_common::{
    Error, Features, MirrorImageInfo, MirrorImageRecord, MirrorImageState, MirrorImageStatus,
    MirrorImageStatusState, MirrorMode, MirrorPeer, ParentSpec, PoolId, Result, TagOwner,
};
use imgplane_store::MetadataStore;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LIST_PAGE: usize = 1024;

// ── Image records ──

/// Mark an image mirrored. Already enabled is a no-op; a record that is
/// being disabled cannot be re-enabled until the disable finishes.
pub(crate) async fn enable_record(
    store: &dyn MetadataStore,
    pool: PoolId,
    image_id: &str,
    global_image_id: Option<&str>,
) -> Result<()> {
    let existing = match store.mirror_image_get(pool, image_id).await {
        Ok(record) => Some(record),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    let global_image_id = match existing {
        Some(record) if record.state == MirrorImageState::Enabled => {
            debug!("Mirroring already enabled for {image_id}");
            return Ok(());
        }
        Some(record) if record.state == MirrorImageState::Disabling => {
            return Err(Error::invalid_argument(format!(
                "mirroring is being disabled for {image_id}"
            )));
        }
        Some(record) => record.global_image_id,
        None => global_image_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string),
    };

    let record = MirrorImageRecord {
        global_image_id,
        state: MirrorImageState::Enabled,
    };
    store.mirror_image_set(pool, image_id, &record).await?;
    info!(
        "Enabled mirroring for {pool}/{image_id} (global id {})",
        record.global_image_id
    );
    Ok(())
}

async fn enable_internal(ictx: &ImageCtx) -> Result<()> {
    if !ictx.metadata().features.contains(Features::JOURNALING) {
        return Err(Error::invalid_argument(
            "cannot enable mirroring: journaling is not enabled",
        ));
    }
    enable_record(ictx.context().store(), ictx.pool(), ictx.image_id(), None).await
}

/// Tear down mirroring of one image. `remove_record` drops the record
/// entirely, otherwise it is left behind as disabled.
pub(crate) async fn disable_internal(
    ictx: &ImageCtx,
    force: bool,
    remove_record: bool,
) -> Result<()> {
    let store = ictx.context().store();
    let mut record = match store.mirror_image_get(ictx.pool(), ictx.image_id()).await {
        Ok(record) => record,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    if !force && ictx.metadata().features.contains(Features::JOURNALING) {
        let primary = match journal::tag_owner(ictx).await {
            Ok(owner) => owner == TagOwner::Local,
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(e),
        };
        if !primary {
            return Err(Error::invalid_argument("mirrored image is not primary"));
        }
    }

    if record.state != MirrorImageState::Disabling {
        record.state = MirrorImageState::Disabling;
        store
            .mirror_image_set(ictx.pool(), ictx.image_id(), &record)
            .await?;
    }

    match store
        .mirror_status_remove(ictx.pool(), &record.global_image_id)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    if remove_record {
        store
            .mirror_image_remove(ictx.pool(), ictx.image_id())
            .await?;
    } else {
        record.state = MirrorImageState::Disabled;
        store
            .mirror_image_set(ictx.pool(), ictx.image_id(), &record)
            .await?;
    }
    info!("Disabled mirroring for {}", ictx.name());
    Ok(())
}

async fn require_image_mode(ictx: &ImageCtx, action: &str) -> Result<()> {
    let mode = ictx.context().store().mirror_mode_get(ictx.pool()).await?;
    if mode != MirrorMode::Image {
        return Err(Error::invalid_argument(format!(
            "cannot {action} mirroring in pool mirror mode {mode}"
        )));
    }
    Ok(())
}

async fn require_mirroring_enabled(ictx: &ImageCtx) -> Result<()> {
    match ictx
        .context()
        .store()
        .mirror_image_get(ictx.pool(), ictx.image_id())
        .await
    {
        Ok(record) if record.state == MirrorImageState::Enabled => Ok(()),
        Ok(_) => Err(Error::invalid_argument("mirroring is not currently enabled")),
        Err(e) if e.is_not_found() => {
            Err(Error::invalid_argument("mirroring is not enabled"))
        }
        Err(e) => Err(e),
    }
}

/// Fail with busy if any clone of any snapshot still has a mirror record
async fn ensure_no_mirrored_children(ictx: &ImageCtx) -> Result<()> {
    let ctx = ictx.context();
    let store = ctx.store();
    for snap_id in ictx.metadata().snaps.keys() {
        let spec = ParentSpec {
            pool: ictx.pool(),
            image_id: ictx.image_id().to_string(),
            snap_id: *snap_id,
        };
        for (pool, child_id) in lineage::find_children(ctx, &spec).await? {
            match store.mirror_image_get(pool, &child_id).await {
                Ok(_) => {
                    return Err(Error::busy("mirroring is enabled on one or more children"));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

// ── Image operations ──

/// Enable mirroring of one image. A clone's parent must be mirrored too,
/// unless both share a pool and `relax_same_pool_parent_check` is set, in
/// which case a journaled parent suffices.
pub async fn image_enable(ictx: &ImageCtx, relax_same_pool_parent_check: bool) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_image_mode(ictx, "enable").await?;

    if let Some(parent) = ictx.parent() {
        if relax_same_pool_parent_check && parent.pool() == ictx.pool() {
            if !parent.metadata().features.contains(Features::JOURNALING) {
                return Err(Error::invalid_argument(
                    "journaling is not enabled for the parent",
                ));
            }
        } else {
            match ictx
                .context()
                .store()
                .mirror_image_get(parent.pool(), parent.image_id())
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    return Err(Error::invalid_argument(
                        "mirroring is not enabled for the parent",
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    enable_internal(ictx).await
}

/// Disable mirroring of one image; refused while a clone is still mirrored
/// unless `force`
pub async fn image_disable(ictx: &ImageCtx, force: bool) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_image_mode(ictx, "disable").await?;

    let store = ictx.context().store();
    let mut record = match store.mirror_image_get(ictx.pool(), ictx.image_id()).await {
        Ok(record) => record,
        Err(e) if e.is_not_found() => {
            debug!("Mirroring is not enabled for {}", ictx.name());
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if !force {
        ensure_no_mirrored_children(ictx).await?;
    }

    record.state = MirrorImageState::Disabling;
    store
        .mirror_image_set(ictx.pool(), ictx.image_id(), &record)
        .await?;

    let result = async {
        if !force {
            ensure_no_mirrored_children(ictx).await?;
        }
        disable_internal(ictx, force, true).await
    }
    .await;

    if let Err(e) = result {
        record.state = MirrorImageState::Enabled;
        if let Err(undo) = store
            .mirror_image_set(ictx.pool(), ictx.image_id(), &record)
            .await
        {
            warn!(
                "Failed to re-enable mirroring of {}: {undo} (original error: {e})",
                ictx.name()
            );
        }
        return Err(e);
    }
    Ok(())
}

/// Make the local image the write primary
pub async fn image_promote(ictx: &ImageCtx, force: bool) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_mirroring_enabled(ictx).await?;

    match journal::tag_owner(ictx).await? {
        TagOwner::Local => return Err(Error::invalid_argument("image is already primary")),
        TagOwner::Remote(uuid) if !force => {
            return Err(Error::busy(format!(
                "image is still primary within remote cluster {uuid}"
            )));
        }
        _ => {}
    }

    journal::promote(ictx).await?;
    ictx.notify_update().await;
    info!("Promoted {} to primary", ictx.name());
    Ok(())
}

/// Give up primary status. Peer lock requests are refused and the lock is
/// held for the duration of the demotion.
pub async fn image_demote(ictx: &ImageCtx) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_mirroring_enabled(ictx).await?;
    if !journal::is_tag_owner(ictx).await? {
        return Err(Error::invalid_argument("image is not currently the primary"));
    }
    if !ictx.metadata().features.contains(Features::EXCLUSIVE_LOCK) {
        return Err(Error::invalid_argument("exclusive lock is not active"));
    }
    let ctx = ictx.context();
    let handle = ctx
        .registry()
        .get(ictx.handle_id())
        .ok_or_else(|| Error::internal(format!("{} is not registered", ictx.name())))?;

    let mut undo = Compensations::new("demote");
    let result: Result<()> = async {
        handle.exclusive_lock().block_requests();
        {
            let handle = handle.clone();
            undo.push("request blocking", move || async move {
                handle.exclusive_lock().unblock_requests();
                Ok(())
            });
        }

        let acquired = {
            let _owner = ictx.owner_lock().write().await;
            handle
                .exclusive_lock()
                .try_acquire(ctx.store(), ictx.pool(), ictx.header_oid())
                .await?
        };
        if !acquired {
            return Err(Error::ReadOnly("failed to acquire exclusive lock".into()));
        }
        {
            let handle = handle.clone();
            undo.push("exclusive lock", move || async move {
                handle
                    .exclusive_lock()
                    .release(
                        handle.context().store(),
                        handle.pool(),
                        handle.header_oid(),
                        lock::retry_delay(&handle),
                    )
                    .await
            });
        }

        // Ownership may have moved while waiting for the lock
        if !journal::is_tag_owner(ictx).await? {
            return Err(Error::invalid_argument("image is not currently the primary"));
        }
        journal::demote(ictx).await
    }
    .await;

    match result {
        Ok(()) => {
            undo.run_all().await?;
            ictx.notify_update().await;
            info!("Demoted {} to non-primary", ictx.name());
            Ok(())
        }
        Err(e) => Err(undo.unwind(e).await),
    }
}

/// Ask the replication daemon to rebuild this non-primary image
pub async fn image_resync(ictx: &ImageCtx) -> Result<()> {
    ictx.refresh_if_required().await?;
    require_mirroring_enabled(ictx).await?;
    if journal::tag_owner(ictx).await? == TagOwner::Local {
        return Err(Error::invalid_argument(
            "image is primary, cannot resync to itself",
        ));
    }
    journal::request_resync(ictx).await?;
    info!("Requested resync of {}", ictx.name());
    Ok(())
}

/// Mirroring view of an image; a missing record reads as disabled
pub async fn image_get_info(ictx: &ImageCtx) -> Result<MirrorImageInfo> {
    ictx.refresh_if_required().await?;
    let record = match ictx
        .context()
        .store()
        .mirror_image_get(ictx.pool(), ictx.image_id())
        .await
    {
        Ok(record) => record,
        Err(e) if e.is_not_found() => return Ok(MirrorImageInfo::default()),
        Err(e) => return Err(e),
    };
    let primary = record.state == MirrorImageState::Enabled && journal::is_tag_owner(ictx).await?;
    Ok(MirrorImageInfo {
        global_id: record.global_image_id,
        state: record.state,
        primary,
    })
}

pub async fn image_get_status(ictx: &ImageCtx) -> Result<MirrorImageStatus> {
    let info = image_get_info(ictx).await?;
    let site = match ictx
        .context()
        .store()
        .mirror_status_get(ictx.pool(), &info.global_id)
        .await
    {
        Ok(site) => Some(site),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    Ok(status_of(ictx.name(), info, site))
}

fn status_of(
    name: String,
    info: MirrorImageInfo,
    site: Option<imgplane_common::MirrorSiteStatus>,
) -> MirrorImageStatus {
    match site {
        Some(site) => MirrorImageStatus {
            name,
            info,
            state: site.state,
            description: site.description,
            last_update: Some(site.last_update),
            up: site.up,
        },
        None => MirrorImageStatus {
            name,
            info,
            state: MirrorImageStatusState::Unknown,
            description: "status not found".to_string(),
            last_update: None,
            up: false,
        },
    }
}

// ── Pool operations ──

pub async fn mode_get(ctx: &Context, pool: PoolId) -> Result<MirrorMode> {
    ctx.store().mirror_mode_get(pool).await
}

async fn directory(store: &dyn MetadataStore, pool: PoolId) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    let mut start = String::new();
    loop {
        let page = store.dir_list(pool, &start, LIST_PAGE).await?;
        let full = page.len() == LIST_PAGE;
        if let Some((name, _)) = page.last() {
            start.clone_from(name);
        }
        entries.extend(page);
        if !full {
            return Ok(entries);
        }
    }
}

async fn mirrored_images(store: &dyn MetadataStore, pool: PoolId) -> Result<Vec<(String, String)>> {
    let mut images = Vec::new();
    let mut start = String::new();
    loop {
        let page = store.mirror_image_list(pool, &start, LIST_PAGE).await?;
        let full = page.len() == LIST_PAGE;
        if let Some((id, _)) = page.last() {
            start.clone_from(id);
        }
        images.extend(page);
        if !full {
            return Ok(images);
        }
    }
}

/// Walk the images of a pool for a mode change out of `Image`
async fn apply_mode(ctx: &Context, pool: PoolId, current: MirrorMode, next: MirrorMode) -> Result<()> {
    let store = ctx.store();
    match next {
        MirrorMode::Pool => {
            for (name, image_id) in directory(store, pool).await? {
                let header = store.header_get(pool, &image_id).await?;
                if !header.features.contains(Features::JOURNALING) {
                    continue;
                }
                let img = image::open_by_id(ctx, pool, &image_id, false).await?;
                let enabled = image_enable(&img, true).await;
                let closed = image::close(img).await;
                if let Err(e) = enabled {
                    warn!("Failed to enable mirroring for image {name}: {e}");
                    return Err(e);
                }
                closed?;
            }
        }
        MirrorMode::Disabled => {
            for (image_id, _) in mirrored_images(store, pool).await? {
                if current == MirrorMode::Image {
                    match store.mirror_image_get(pool, &image_id).await {
                        Ok(record) if record.state == MirrorImageState::Enabled => {
                            return Err(Error::invalid_argument(
                                "images with mirroring enabled remain in the pool",
                            ));
                        }
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                } else {
                    let img = image::open_by_id(ctx, pool, &image_id, false).await?;
                    let disabled = image_disable(&img, false).await;
                    let closed = image::close(img).await;
                    if let Err(e) = disabled {
                        warn!("Failed to disable mirroring for image id {image_id}: {e}");
                        return Err(e);
                    }
                    closed?;
                }
            }
        }
        MirrorMode::Image => {}
    }
    Ok(())
}

/// Change the pool mirror mode. Leaving `Disabled` for the first time mints
/// the pool's mirror uuid; entering `Disabled` requires no registered peers.
pub async fn mode_set(ctx: &Context, pool: PoolId, mode: MirrorMode) -> Result<()> {
    let store = ctx.store();
    if mode == MirrorMode::Disabled && !peer_list(ctx, pool).await?.is_empty() {
        return Err(Error::busy("mirror peers still registered"));
    }

    let current = store.mirror_mode_get(pool).await?;
    if current == mode {
        return Ok(());
    }
    if current == MirrorMode::Disabled {
        match store.mirror_uuid_get(pool).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                match store
                    .mirror_uuid_set(pool, &Uuid::new_v4().to_string())
                    .await
                {
                    Ok(()) | Err(Error::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }

    if current != MirrorMode::Image {
        store.mirror_mode_set(pool, MirrorMode::Image).await?;
    }
    if mode != MirrorMode::Image {
        if let Err(e) = apply_mode(ctx, pool, current, mode).await {
            if current != MirrorMode::Image {
                if let Err(undo) = store.mirror_mode_set(pool, current).await {
                    warn!("Failed to restore mirror mode {current}: {undo} (original error: {e})");
                }
            }
            return Err(e);
        }
        store.mirror_mode_set(pool, mode).await?;
    }
    info!("Pool {pool} mirror mode {current} -> {mode}");
    Ok(())
}

pub async fn uuid_get(ctx: &Context, pool: PoolId) -> Result<String> {
    ctx.store().mirror_uuid_get(pool).await
}

/// Register a remote cluster; returns the generated peer uuid
pub async fn peer_add(
    ctx: &Context,
    pool: PoolId,
    cluster_name: &str,
    client_name: &str,
) -> Result<String> {
    if cluster_name == ctx.config().cluster_name {
        return Err(Error::invalid_argument("cannot add self as remote peer"));
    }
    loop {
        let peer = MirrorPeer {
            uuid: Uuid::new_v4().to_string(),
            cluster_name: cluster_name.to_string(),
            client_name: client_name.to_string(),
        };
        match ctx.store().mirror_peer_add(pool, &peer).await {
            Ok(()) => {
                info!("Added mirror peer {cluster_name} ({})", peer.uuid);
                return Ok(peer.uuid);
            }
            Err(Error::LostRace(_)) => debug!("Duplicate peer uuid, retrying"),
            Err(e) => return Err(e),
        }
    }
}

/// Unregister a peer; an unknown uuid is not an error
pub async fn peer_remove(ctx: &Context, pool: PoolId, uuid: &str) -> Result<()> {
    match ctx.store().mirror_peer_remove(pool, uuid).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn peer_list(ctx: &Context, pool: PoolId) -> Result<Vec<MirrorPeer>> {
    match ctx.store().mirror_peer_list(pool).await {
        Ok(peers) => Ok(peers),
        Err(Error::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

pub async fn peer_set_client(ctx: &Context, pool: PoolId, uuid: &str, client: &str) -> Result<()> {
    ctx.store().mirror_peer_set_client(pool, uuid, client).await
}

pub async fn peer_set_cluster(ctx: &Context, pool: PoolId, uuid: &str, cluster: &str) -> Result<()> {
    ctx.store().mirror_peer_set_cluster(pool, uuid, cluster).await
}

/// Status of mirrored images after `start_id`, keyed by image id. Images
/// missing from the directory are reported under their id.
pub async fn image_status_list(
    ctx: &Context,
    pool: PoolId,
    start_id: &str,
    max: usize,
) -> Result<BTreeMap<String, MirrorImageStatus>> {
    let store = ctx.store();
    let names: BTreeMap<String, String> = directory(store, pool)
        .await?
        .into_iter()
        .map(|(name, id)| (id, name))
        .collect();

    let mut statuses = BTreeMap::new();
    for (image_id, global_id) in store.mirror_image_list(pool, start_id, max).await? {
        let state = match store.mirror_image_get(pool, &image_id).await {
            Ok(record) => record.state,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        let site = match store.mirror_status_get(pool, &global_id).await {
            Ok(site) => Some(site),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let name = names.get(&image_id).cloned().unwrap_or_else(|| {
            debug!("No name for image {image_id}, using its id");
            image_id.clone()
        });
        let info = MirrorImageInfo {
            global_id,
            state,
            primary: false,
        };
        statuses.insert(image_id, status_of(name, info, site));
    }
    Ok(statuses)
}

/// Number of mirrored images in each replay state
pub async fn image_status_summary(
    ctx: &Context,
    pool: PoolId,
) -> Result<BTreeMap<MirrorImageStatusState, usize>> {
    let store = ctx.store();
    let mut summary = BTreeMap::new();
    for (_, global_id) in mirrored_images(store, pool).await? {
        let state = match store.mirror_status_get(pool, &global_id).await {
            Ok(site) => site.state,
            Err(e) if e.is_not_found() => MirrorImageStatusState::Unknown,
            Err(e) => return Err(e),
        };
        *summary.entry(state).or_insert(0) += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::CreateOptions;
    use crate::lineage::{self, CloneOptions};
    use crate::snapshot;
    use crate::test_support::{connect, open, setup};
    use chrono::Utc;
    use imgplane_common::MirrorSiteStatus;

    fn journaled() -> CreateOptions {
        CreateOptions {
            features: Some(Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::JOURNALING),
            ..CreateOptions::default()
        }
    }

    #[tokio::test]
    async fn test_mode_transitions_mint_uuid_once() {
        let (_cluster, ctx, pool) = setup();
        assert_eq!(mode_get(&ctx, pool).await.unwrap(), MirrorMode::Disabled);
        assert!(uuid_get(&ctx, pool).await.unwrap_err().is_not_found());

        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        let uuid = uuid_get(&ctx, pool).await.unwrap();
        mode_set(&ctx, pool, MirrorMode::Disabled).await.unwrap();
        mode_set(&ctx, pool, MirrorMode::Pool).await.unwrap();
        assert_eq!(uuid_get(&ctx, pool).await.unwrap(), uuid);
        assert_eq!(mode_get(&ctx, pool).await.unwrap(), MirrorMode::Pool);
    }

    #[tokio::test]
    async fn test_disable_requires_no_peers() {
        let (cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        assert!(matches!(
            peer_add(&ctx, pool, &ctx.config().cluster_name, "client.admin").await,
            Err(Error::InvalidArgument(_))
        ));

        cluster.inject_fault("mirror_peer_add", 1, Error::lost_race("duplicate uuid"));
        let uuid = peer_add(&ctx, pool, "remote", "client.mirror").await.unwrap();
        assert_eq!(cluster.op_calls("mirror_peer_add"), 2);
        assert!(matches!(
            peer_add(&ctx, pool, "remote", "client.mirror").await,
            Err(Error::AlreadyExists(_))
        ));

        peer_set_client(&ctx, pool, &uuid, "client.other").await.unwrap();
        peer_set_cluster(&ctx, pool, &uuid, "site-b").await.unwrap();
        let peers = peer_list(&ctx, pool).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].cluster_name, "site-b");
        assert_eq!(peers[0].client_name, "client.other");

        assert!(matches!(
            mode_set(&ctx, pool, MirrorMode::Disabled).await,
            Err(Error::Busy(_))
        ));
        peer_remove(&ctx, pool, &uuid).await.unwrap();
        peer_remove(&ctx, pool, &uuid).await.unwrap();
        mode_set(&ctx, pool, MirrorMode::Disabled).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_mode_enables_journaled_images() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "j", 1 << 22, &journaled()).await.unwrap();
        image::create(&ctx, pool, "plain", 1 << 22, &CreateOptions::default())
            .await
            .unwrap();
        mode_set(&ctx, pool, MirrorMode::Pool).await.unwrap();

        let j = open(&ctx, pool, "j").await;
        let info = image_get_info(&j).await.unwrap();
        assert_eq!(info.state, MirrorImageState::Enabled);
        assert!(info.primary);
        assert!(!info.global_id.is_empty());
        let plain = open(&ctx, pool, "plain").await;
        assert_eq!(
            image_get_info(&plain).await.unwrap(),
            MirrorImageInfo::default()
        );

        // Per-image toggles are only allowed in image mode
        assert!(matches!(
            image_disable(&j, false).await,
            Err(Error::InvalidArgument(_))
        ));

        // New journaled images start out mirrored
        image::create(&ctx, pool, "j2", 1 << 22, &journaled()).await.unwrap();
        let j2 = open(&ctx, pool, "j2").await;
        assert_eq!(
            image_get_info(&j2).await.unwrap().state,
            MirrorImageState::Enabled
        );
    }

    #[tokio::test]
    async fn test_pool_to_disabled_blocked_by_enabled_image() {
        let (_cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Pool).await.unwrap();
        let replica = CreateOptions {
            non_primary_global_image_id: Some("global-1".into()),
            primary_mirror_uuid: Some("remote-uuid".into()),
            ..journaled()
        };
        image::create(&ctx, pool, "replica", 1 << 22, &replica)
            .await
            .unwrap();

        // A non-primary image cannot be disabled without force
        assert!(matches!(
            mode_set(&ctx, pool, MirrorMode::Disabled).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(mode_get(&ctx, pool).await.unwrap(), MirrorMode::Pool);

        let img = open(&ctx, pool, "replica").await;
        assert!(matches!(
            image_promote(&img, false).await,
            Err(Error::Busy(_))
        ));
        image_promote(&img, true).await.unwrap();
        image::close(img).await.unwrap();

        mode_set(&ctx, pool, MirrorMode::Disabled).await.unwrap();
        assert_eq!(mode_get(&ctx, pool).await.unwrap(), MirrorMode::Disabled);
        let img = open(&ctx, pool, "replica").await;
        assert_eq!(
            image_get_info(&img).await.unwrap().state,
            MirrorImageState::Disabled
        );
    }

    #[tokio::test]
    async fn test_image_mode_disable_requires_images_disabled() {
        let (_cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        image::create(&ctx, pool, "j", 1 << 22, &journaled()).await.unwrap();
        let j = open(&ctx, pool, "j").await;
        image_enable(&j, false).await.unwrap();

        assert!(matches!(
            mode_set(&ctx, pool, MirrorMode::Disabled).await,
            Err(Error::InvalidArgument(_))
        ));
        image_disable(&j, false).await.unwrap();
        image_disable(&j, false).await.unwrap();
        mode_set(&ctx, pool, MirrorMode::Disabled).await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_requires_journaling_and_mirrored_parent() {
        let (_cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        image::create(&ctx, pool, "plain", 1 << 22, &CreateOptions::default())
            .await
            .unwrap();
        let plain = open(&ctx, pool, "plain").await;
        assert!(matches!(
            image_enable(&plain, false).await,
            Err(Error::InvalidArgument(_))
        ));

        image::create(&ctx, pool, "parent", 1 << 22, &journaled()).await.unwrap();
        let parent = open(&ctx, pool, "parent").await;
        snapshot::create(&parent, "s").await.unwrap();
        snapshot::protect(&parent, "s").await.unwrap();
        lineage::clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
            .await
            .unwrap();
        let child = open(&ctx, pool, "child").await;

        assert!(matches!(
            image_enable(&child, false).await,
            Err(Error::InvalidArgument(_))
        ));
        // Same pool and journaled parent is enough when relaxed
        image_enable(&child, true).await.unwrap();

        // The mirrored clone keeps the parent from being disabled
        image_enable(&parent, false).await.unwrap();
        assert!(matches!(
            image_disable(&parent, false).await,
            Err(Error::Busy(_))
        ));
        assert_eq!(
            image_get_info(&parent).await.unwrap().state,
            MirrorImageState::Enabled
        );
        image_disable(&child, false).await.unwrap();
        image_disable(&parent, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_rolls_back_on_teardown_failure() {
        let (cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        image::create(&ctx, pool, "j", 1 << 22, &journaled()).await.unwrap();
        let j = open(&ctx, pool, "j").await;
        image_enable(&j, false).await.unwrap();

        cluster.inject_fault("mirror_image_remove", 1, Error::Timeout);
        assert_eq!(image_disable(&j, false).await, Err(Error::Timeout));
        assert_eq!(
            image_get_info(&j).await.unwrap().state,
            MirrorImageState::Enabled
        );
    }

    #[tokio::test]
    async fn test_promote_demote_resync() {
        let (_cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        image::create(&ctx, pool, "j", 1 << 22, &journaled()).await.unwrap();
        let j = open(&ctx, pool, "j").await;
        assert!(matches!(
            image_promote(&j, false).await,
            Err(Error::InvalidArgument(_))
        ));
        image_enable(&j, false).await.unwrap();

        assert!(matches!(
            image_promote(&j, false).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            image_resync(&j).await,
            Err(Error::InvalidArgument(_))
        ));

        image_demote(&j).await.unwrap();
        assert!(!image_get_info(&j).await.unwrap().primary);
        assert!(!j.exclusive_lock().requests_blocked());
        assert!(!lock::is_exclusive_lock_owner(&j).await.unwrap());
        assert!(matches!(
            image_demote(&j).await,
            Err(Error::InvalidArgument(_))
        ));

        image_resync(&j).await.unwrap();
        assert!(journal::resync_requested(&j).await.unwrap());

        // Orphaned tags can be taken over without force
        image_promote(&j, false).await.unwrap();
        assert!(image_get_info(&j).await.unwrap().primary);
    }

    #[tokio::test]
    async fn test_demote_unwinds_when_lock_is_held_elsewhere() {
        let (cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        image::create(&ctx, pool, "j", 1 << 22, &journaled()).await.unwrap();
        let a = open(&ctx, pool, "j").await;
        image_enable(&a, false).await.unwrap();

        let other = connect(&cluster, imgplane_common::Config::default());
        let b = open(&other, pool, "j").await;
        lock::lock_acquire(&b, imgplane_common::LockMode::Exclusive)
            .await
            .unwrap();

        assert!(matches!(image_demote(&a).await, Err(Error::ReadOnly(_))));
        assert!(!a.exclusive_lock().requests_blocked());
        assert!(image_get_info(&a).await.unwrap().primary);
    }

    #[tokio::test]
    async fn test_status_reporting() {
        let (_cluster, ctx, pool) = setup();
        mode_set(&ctx, pool, MirrorMode::Image).await.unwrap();
        for name in ["a", "b"] {
            image::create(&ctx, pool, name, 1 << 22, &journaled()).await.unwrap();
            let img = open(&ctx, pool, name).await;
            image_enable(&img, false).await.unwrap();
        }
        let a = open(&ctx, pool, "a").await;
        let status = image_get_status(&a).await.unwrap();
        assert_eq!(status.state, MirrorImageStatusState::Unknown);
        assert_eq!(status.description, "status not found");
        assert_eq!(status.name, "a");

        let info = image_get_info(&a).await.unwrap();
        let site = MirrorSiteStatus {
            state: MirrorImageStatusState::Replaying,
            description: "replaying".into(),
            last_update: Utc::now(),
            up: true,
        };
        ctx.store()
            .mirror_status_set(pool, &info.global_id, &site)
            .await
            .unwrap();
        assert_eq!(
            image_get_status(&a).await.unwrap().state,
            MirrorImageStatusState::Replaying
        );

        let listed = image_status_list(&ctx, pool, "", 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[a.image_id()].name, "a");
        assert!(listed[a.image_id()].up);

        let summary = image_status_summary(&ctx, pool).await.unwrap();
        assert_eq!(summary[&MirrorImageStatusState::Replaying], 1);
        assert_eq!(summary[&MirrorImageStatusState::Unknown], 1);
    }
}
