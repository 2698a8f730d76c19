//! Image lifecycle
//!
//! Create, open, remove, rename, list, resize and feature updates. Creation
//! is a multi-step protocol; every step that leaves state behind registers
//! its undo so a failure leaves no partial image.

use crate::context::Context;
use crate::handle::{ImageCtx, ParentImageInfo, SnapTarget, close_image, open_image};
use crate::layout::{Layout, object_name};
use crate::lock;
use crate::mirror;
use crate::progress::ProgressContext;
use crate::undo::Compensations;
use imgplane_common::{
    Error, Features, MirrorImageState, MirrorMode, PoolId, Result, SnapId, TagOwner,
};
use imgplane_store::{MetadataStore, NewImage, data_prefix, header_oid};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory page size used when listing
const LIST_PAGE: usize = 1024;

/// Options for a new image; unset fields come from the configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub order: Option<u8>,
    pub features: Option<Features>,
    pub stripe_unit: Option<u64>,
    pub stripe_count: Option<u64>,
    /// Format 1 images carry no features and no striping
    pub old_format: bool,
    /// Create as the non-primary replica of this global image id
    pub non_primary_global_image_id: Option<String>,
    /// Mirror uuid of the remote primary for a non-primary image
    pub primary_mirror_uuid: Option<String>,
}

/// Summary of an open image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub size: u64,
    pub object_size: u64,
    pub num_objects: u64,
    pub order: u8,
    pub block_name_prefix: String,
    pub old_format: bool,
    pub features: Features,
    pub parent: Option<ParentImageInfo>,
}

/// Reject feature sets whose dependencies are not met
pub(crate) fn validate_features(features: Features) -> Result<()> {
    if !Features::ALL.contains(features) {
        return Err(Error::not_supported(format!(
            "unsupported features {:#x}",
            features.difference(Features::ALL).bits()
        )));
    }
    let requires = [
        (Features::OBJECT_MAP, Features::EXCLUSIVE_LOCK),
        (Features::FAST_DIFF, Features::OBJECT_MAP),
        (Features::JOURNALING, Features::EXCLUSIVE_LOCK),
    ];
    for (feature, needed) in requires {
        if features.contains(feature) && !features.contains(needed) {
            return Err(Error::invalid_argument(format!(
                "feature {feature} requires {needed}"
            )));
        }
    }
    Ok(())
}

fn generate_image_id(store: &dyn MetadataStore) -> String {
    format!("{:x}{:08x}", store.instance_id(), rand::random::<u32>())
}

/// Data objects of an image as `(object number, name)`
pub(crate) async fn list_data_objects(
    store: &dyn MetadataStore,
    pool: PoolId,
    object_prefix: &str,
) -> Result<Vec<(u64, String)>> {
    let prefix = format!("{object_prefix}.");
    let mut objects = Vec::new();
    for oid in store.object_list(pool, &prefix).await? {
        match u64::from_str_radix(&oid[prefix.len()..], 16) {
            Ok(objno) => objects.push((objno, oid)),
            Err(_) => debug!("Skipping foreign object {oid}"),
        }
    }
    Ok(objects)
}

/// Create a header, directory entry and the per-feature objects; returns
/// the new image id and its features. Mirroring is left to the caller.
pub(crate) async fn create_inner(
    ctx: &Context,
    pool: PoolId,
    name: &str,
    size: u64,
    opts: &CreateOptions,
) -> Result<(String, Features)> {
    let store = ctx.store();
    let defaults = &ctx.config().image;

    if name.is_empty() {
        return Err(Error::invalid_argument("image name must not be empty"));
    }
    match store.dir_get_id(pool, name).await {
        Ok(_) => return Err(Error::AlreadyExists(format!("image {name}"))),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let old_format = opts.old_format || defaults.format == 1;
    let order = opts.order.unwrap_or(defaults.order);
    let stripe_unit = opts.stripe_unit.unwrap_or(defaults.stripe_unit);
    let stripe_count = opts.stripe_count.unwrap_or(defaults.stripe_count);
    let layout = Layout::new(order, stripe_unit, stripe_count)?;

    let mut features = if old_format {
        if opts.features.is_some_and(|f| !f.is_empty()) {
            return Err(Error::invalid_argument("format 1 images do not support features"));
        }
        if layout.is_fancy() {
            return Err(Error::invalid_argument("format 1 images do not support striping"));
        }
        Features::empty()
    } else {
        opts.features.unwrap_or_else(|| defaults.features())
    };
    if layout.is_fancy() {
        features |= Features::STRIPINGV2;
    }
    validate_features(features)?;

    let image_id = generate_image_id(store);
    let spec = NewImage {
        size,
        order,
        features,
        stripe_unit: layout.stripe_unit(),
        stripe_count: layout.stripe_count(),
        object_prefix: data_prefix(&image_id),
        old_format,
    };

    let mut undo = Compensations::new("create");
    let result: Result<()> = async {
        store.dir_add(pool, name, &image_id).await?;
        {
            let (ctx, name, id) = (ctx.clone(), name.to_string(), image_id.clone());
            undo.push("directory entry", move || async move {
                ctx.store().dir_remove(pool, &name, &id).await
            });
        }

        store.header_create(pool, &image_id, &spec).await?;
        {
            let (ctx, id) = (ctx.clone(), image_id.clone());
            undo.push("header", move || async move {
                ctx.store().header_remove(pool, &id).await
            });
        }

        if features.contains(Features::OBJECT_MAP) {
            store.object_map_create(pool, &image_id).await?;
            let (ctx, id) = (ctx.clone(), image_id.clone());
            undo.push("object map", move || async move {
                ctx.store().object_map_remove(pool, &id).await
            });
        }

        if features.contains(Features::JOURNALING) {
            let owner = match &opts.non_primary_global_image_id {
                Some(_) => TagOwner::Remote(opts.primary_mirror_uuid.clone().unwrap_or_default()),
                None => TagOwner::Local,
            };
            store.journal_create(pool, &image_id, &owner).await?;
            let (ctx, id) = (ctx.clone(), image_id.clone());
            undo.push("journal", move || async move {
                ctx.store().journal_remove(pool, &id).await
            });
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            undo.disarm();
            info!("Created image {name} ({pool}/{image_id}) size {size} order {order}");
            Ok((image_id, features))
        }
        Err(e) => Err(undo.unwind(e).await),
    }
}

/// Whether a new journaled image must start out mirrored
pub(crate) async fn mirroring_required(
    store: &dyn MetadataStore,
    pool: PoolId,
    features: Features,
    non_primary_global_image_id: Option<&str>,
) -> Result<bool> {
    if !features.contains(Features::JOURNALING) {
        return Ok(false);
    }
    if non_primary_global_image_id.is_some() {
        return Ok(true);
    }
    Ok(store.mirror_mode_get(pool).await? == MirrorMode::Pool)
}

/// Create an image
pub async fn create(
    ctx: &Context,
    pool: PoolId,
    name: &str,
    size: u64,
    opts: &CreateOptions,
) -> Result<()> {
    let (image_id, features) = create_inner(ctx, pool, name, size, opts).await?;
    let store = ctx.store();
    let non_primary = opts.non_primary_global_image_id.as_deref();

    let enable = match mirroring_required(store, pool, features, non_primary).await {
        Ok(enable) => enable,
        Err(e) => {
            purge(ctx, pool, name, &image_id).await;
            return Err(e);
        }
    };
    if enable {
        if let Err(e) = mirror::enable_record(store, pool, &image_id, non_primary).await {
            warn!("Failed to enable mirroring on new image {name}: {e}");
            purge(ctx, pool, name, &image_id).await;
            return Err(e);
        }
    }
    Ok(())
}

// ── Open / close ──

/// Open the head of an image by name
pub async fn open(ctx: &Context, pool: PoolId, name: &str, read_only: bool) -> Result<Arc<ImageCtx>> {
    let image_id = lookup_id(ctx.store(), pool, name).await?;
    open_image(
        ctx.clone(),
        pool,
        image_id,
        Some(name.to_string()),
        SnapTarget::Head,
        read_only,
    )
    .await
}

pub async fn open_by_id(
    ctx: &Context,
    pool: PoolId,
    image_id: &str,
    read_only: bool,
) -> Result<Arc<ImageCtx>> {
    open_image(
        ctx.clone(),
        pool,
        image_id.to_string(),
        None,
        SnapTarget::Head,
        read_only,
    )
    .await
}

/// Open a read-only handle bound to a snapshot
pub async fn open_snapshot(
    ctx: &Context,
    pool: PoolId,
    name: &str,
    snap_name: &str,
) -> Result<Arc<ImageCtx>> {
    let image_id = lookup_id(ctx.store(), pool, name).await?;
    open_image(
        ctx.clone(),
        pool,
        image_id,
        Some(name.to_string()),
        SnapTarget::Name(snap_name.to_string()),
        true,
    )
    .await
}

/// Close a handle, releasing an owned exclusive lock first
pub async fn close(ictx: Arc<ImageCtx>) -> Result<()> {
    close_image(ictx).await
}

async fn lookup_id(store: &dyn MetadataStore, pool: PoolId, name: &str) -> Result<String> {
    store.dir_get_id(pool, name).await.map_err(|e| {
        if e.is_not_found() {
            Error::ImageNotFound(name.to_string())
        } else {
            e
        }
    })
}

// ── Remove ──

/// Delete every trace of an image, tolerating pieces that are already gone
pub(crate) async fn purge(ctx: &Context, pool: PoolId, name: &str, image_id: &str) {
    let store = ctx.store();
    let mut complete = true;
    let mut check = |step: &str, result: Result<()>| {
        if let Err(e) = ignore_missing(result) {
            warn!("Cleanup of {name} ({image_id}): failed to remove {step}: {e}");
            complete = false;
        }
    };

    check("journal", store.journal_remove(pool, image_id).await);
    check("object map", store.object_map_remove(pool, image_id).await);
    if let Ok(record) = store.mirror_image_get(pool, image_id).await {
        check(
            "mirror status",
            store.mirror_status_remove(pool, &record.global_image_id).await,
        );
    }
    check("mirror record", store.mirror_image_remove(pool, image_id).await);

    match store.header_get(pool, image_id).await {
        Ok(header) => {
            match list_data_objects(store, pool, &header.object_prefix).await {
                Ok(objects) => {
                    for (_, oid) in objects {
                        check("data object", store.object_delete(pool, &oid).await);
                    }
                }
                Err(e) => check("data objects", Err(e)),
            }
            if let Some(parent) = header.parent {
                check(
                    "child index entry",
                    store.children_remove(pool, &parent.spec, image_id).await,
                );
            }
            check("header", store.header_remove(pool, image_id).await);
        }
        Err(e) => check("header", Err(e)),
    }
    check("directory entry", store.dir_remove(pool, name, image_id).await);

    if complete {
        debug!("Purged image {name} ({pool}/{image_id})");
    }
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Remove an image. Without `force` the exclusive lock must be obtainable.
pub async fn remove(
    ctx: &Context,
    pool: PoolId,
    name: &str,
    force: bool,
    progress: &dyn ProgressContext,
) -> Result<()> {
    let store = ctx.store();
    let image_id = lookup_id(store, pool, name).await?;

    let ictx = match open_image(
        ctx.clone(),
        pool,
        image_id.clone(),
        Some(name.to_string()),
        SnapTarget::Head,
        false,
    )
    .await
    {
        Ok(ictx) => ictx,
        Err(e) if e.is_not_found() => {
            warn!("Image {name} could not be opened ({e}), removing what remains");
            purge(ctx, pool, name, &image_id).await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = prepare_removal(&ictx, force, progress).await {
        if let Err(close_err) = close_image(Arc::clone(&ictx)).await {
            warn!("Failed to close {name} after aborted removal: {close_err}");
        }
        return Err(e);
    }
    close_image(ictx).await?;
    purge(ctx, pool, name, &image_id).await;
    info!("Removed image {name} ({pool}/{image_id})");
    Ok(())
}

async fn prepare_removal(
    ictx: &ImageCtx,
    force: bool,
    progress: &dyn ProgressContext,
) -> Result<()> {
    let store = ictx.context().store();
    let md = ictx.metadata();

    if md.features.contains(Features::EXCLUSIVE_LOCK) && !force {
        let acquired = ictx
            .exclusive_lock()
            .try_acquire(store, ictx.pool(), ictx.header_oid())
            .await
            .unwrap_or(false);
        if !acquired {
            return Err(Error::busy("cannot obtain exclusive lock, not removing"));
        }
    }
    if !md.snaps.is_empty() {
        return Err(Error::HasSnapshots);
    }
    if store
        .list_watchers(ictx.pool(), ictx.header_oid())
        .await?
        .len()
        > 1
    {
        return Err(Error::busy("image has watchers, not removing"));
    }

    let objects = list_data_objects(store, ictx.pool(), &md.object_prefix).await?;
    let total = objects.len() as u64;
    for (done, (_, oid)) in objects.iter().enumerate() {
        ignore_missing(store.object_delete(ictx.pool(), oid).await)?;
        progress.update_progress(done as u64 + 1, total);
    }

    if let Some(parent) = &md.parent {
        ignore_missing(
            store
                .children_remove(ictx.pool(), &parent.spec, ictx.image_id())
                .await,
        )?;
    }

    if !md.old_format {
        match mirror::disable_internal(ictx, force, !force).await {
            Ok(()) => {}
            Err(Error::NotSupported(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ── Directory ──

/// Rename an image within its pool
pub async fn rename(ctx: &Context, pool: PoolId, src: &str, dst: &str) -> Result<()> {
    let store = ctx.store();
    if dst.is_empty() {
        return Err(Error::invalid_argument("image name must not be empty"));
    }
    let image_id = lookup_id(store, pool, src).await?;
    match store.dir_get_id(pool, dst).await {
        Ok(_) => return Err(Error::AlreadyExists(format!("image {dst}"))),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    store.dir_rename(pool, src, dst, &image_id).await?;
    for handle in ctx.registry().open_handles(pool, &image_id) {
        handle.set_name(dst);
    }
    if let Err(e) = store.notify(pool, &header_oid(&image_id)).await {
        warn!("Failed to notify watchers of renamed image {dst}: {e}");
    }
    info!("Renamed image {src} to {dst}");
    Ok(())
}

/// Names of every image in a pool
pub async fn list(ctx: &Context, pool: PoolId) -> Result<Vec<String>> {
    let store = ctx.store();
    let mut names = Vec::new();
    let mut start_after = String::new();
    loop {
        let page = store.dir_list(pool, &start_after, LIST_PAGE).await?;
        let full = page.len() == LIST_PAGE;
        if let Some((last, _)) = page.last() {
            start_after.clone_from(last);
        }
        names.extend(page.into_iter().map(|(name, _)| name));
        if !full {
            return Ok(names);
        }
    }
}

// ── Open-image operations ──

pub async fn info(ictx: &ImageCtx) -> Result<ImageInfo> {
    ictx.refresh_if_required().await?;
    let md = ictx.metadata();
    let snap = ictx.snap_id();
    let size = md.size_at(snap)?;
    let parent = match ictx.get_parent_info().await {
        Ok(parent) => Some(parent),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    Ok(ImageInfo {
        size,
        object_size: md.layout.object_size(),
        num_objects: md.layout.num_objects(size),
        order: md.layout.order(),
        block_name_prefix: md.object_prefix.clone(),
        old_format: md.old_format,
        features: md.features,
        parent,
    })
}

/// Change the image size. Shrinking trims data beyond the new end while
/// preserving it for existing snapshots.
pub async fn resize(ictx: &ImageCtx, size: u64, progress: &dyn ProgressContext) -> Result<()> {
    ictx.refresh_if_required().await?;
    if ictx.is_read_only() {
        return Err(Error::ReadOnly(format!("{} is opened read-only", ictx.name())));
    }
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;

    let store = ictx.context().store();
    let md = ictx.metadata();
    let old_size = md.size;
    if size < old_size {
        let snapc = md.snap_context();
        let keep = md.layout.num_objects(size);

        // Partial objects at the new end
        for ext in md.layout.map_extent(size, old_size - size) {
            if ext.objno >= keep {
                continue;
            }
            let oid = object_name(&md.object_prefix, ext.objno);
            let current = match store.object_stat(ictx.pool(), &oid, SnapId::HEAD).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if ext.offset >= current {
                continue;
            }
            if ext.offset + ext.length >= current {
                store
                    .object_truncate(ictx.pool(), &oid, &snapc, ext.offset)
                    .await?;
            } else {
                let zeros = vec![0u8; usize::try_from(ext.length).unwrap_or_default()];
                store
                    .object_write(ictx.pool(), &oid, &snapc, ext.offset, &zeros)
                    .await?;
            }
        }

        let doomed: Vec<String> = list_data_objects(store, ictx.pool(), &md.object_prefix)
            .await?
            .into_iter()
            .filter(|(objno, _)| *objno >= keep)
            .map(|(_, oid)| oid)
            .collect();
        let total = doomed.len() as u64;
        for (done, oid) in doomed.iter().enumerate() {
            ignore_missing(store.object_remove(ictx.pool(), oid, &snapc).await)?;
            progress.update_progress(done as u64 + 1, total);
        }
    }

    store
        .header_set_size(ictx.pool(), ictx.image_id(), size)
        .await?;
    ictx.notify_update().await;
    info!("Resized {} from {old_size} to {size}", ictx.name());
    Ok(())
}

/// Enable or disable mutable features
pub async fn update_features(ictx: &ImageCtx, features: Features, enabled: bool) -> Result<()> {
    if features.is_empty() {
        return Ok(());
    }
    let allowed = if enabled {
        Features::MUTABLE
    } else {
        Features::MUTABLE.union(Features::DISABLE_ONLY)
    };
    if !allowed.contains(features) {
        return Err(Error::invalid_argument(format!(
            "cannot {} features {}",
            if enabled { "enable" } else { "disable" },
            features.difference(allowed)
        )));
    }

    ictx.refresh_if_required().await?;
    if ictx.is_read_only() {
        return Err(Error::ReadOnly(format!("{} is opened read-only", ictx.name())));
    }
    let _owner = ictx.owner_lock().write().await;
    let md = ictx.metadata();
    if md.old_format {
        return Err(Error::not_supported("format 1 images do not support features"));
    }
    lock::ensure_owner(ictx).await?;

    let current = md.features;
    let updated = if enabled {
        current.union(features)
    } else {
        current.difference(features)
    };
    validate_features(updated)?;

    let store = ictx.context().store();
    let (pool, image_id) = (ictx.pool(), ictx.image_id());
    let mut enable_mirroring = false;

    if enabled {
        if features.contains(Features::OBJECT_MAP) && !current.contains(Features::OBJECT_MAP) {
            store.object_map_create(pool, image_id).await?;
            for (objno, _) in list_data_objects(store, pool, &md.object_prefix).await? {
                store.object_map_mark(pool, image_id, objno).await?;
            }
        }
        if features.contains(Features::JOURNALING) && !current.contains(Features::JOURNALING) {
            store.journal_create(pool, image_id, &TagOwner::Local).await?;
            enable_mirroring = store.mirror_mode_get(pool).await? == MirrorMode::Pool;
        }
    } else {
        if features.contains(Features::JOURNALING) && current.contains(Features::JOURNALING) {
            match store.mirror_image_get(pool, image_id).await {
                Ok(record) if record.state == MirrorImageState::Enabled => {
                    return Err(Error::invalid_argument(
                        "cannot disable journaling while mirroring is enabled",
                    ));
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            ignore_missing(store.journal_remove(pool, image_id).await)?;
        }
        if features.contains(Features::OBJECT_MAP) && current.contains(Features::OBJECT_MAP) {
            ignore_missing(store.object_map_remove(pool, image_id).await)?;
        }
    }

    store
        .header_set_features(pool, image_id, updated, features)
        .await?;
    if enable_mirroring {
        mirror::enable_record(store, pool, image_id, None).await?;
    }

    if !enabled
        && features.contains(Features::EXCLUSIVE_LOCK)
        && ictx.exclusive_lock().state() == lock::LockState::Owned
    {
        let delay =
            std::time::Duration::from_millis(ictx.context().config().lock.release_retry_delay_ms);
        ictx.exclusive_lock()
            .release(store, pool, ictx.header_oid(), delay)
            .await?;
    }

    ictx.notify_update().await;
    info!(
        "{} features {features} on {}",
        if enabled { "Enabled" } else { "Disabled" },
        ictx.name()
    );
    Ok(())
}

// ── User metadata ──

pub async fn metadata_get(ictx: &ImageCtx, key: &str) -> Result<String> {
    ictx.context()
        .store()
        .metadata_get(ictx.pool(), ictx.image_id(), key)
        .await
}

pub async fn metadata_set(ictx: &ImageCtx, key: &str, value: &str) -> Result<()> {
    ictx.context()
        .store()
        .metadata_set(ictx.pool(), ictx.image_id(), key, value)
        .await?;
    ictx.notify_update().await;
    Ok(())
}

pub async fn metadata_remove(ictx: &ImageCtx, key: &str) -> Result<()> {
    ictx.context()
        .store()
        .metadata_remove(ictx.pool(), ictx.image_id(), key)
        .await?;
    ictx.notify_update().await;
    Ok(())
}

/// Key/value pairs after `start_after`; `max == 0` lists everything
pub async fn metadata_list(
    ictx: &ImageCtx,
    start_after: &str,
    max: usize,
) -> Result<Vec<(String, String)>> {
    let store = ictx.context().store();
    if max > 0 {
        return store
            .metadata_list(ictx.pool(), ictx.image_id(), start_after, max)
            .await;
    }
    let mut out: Vec<(String, String)> = Vec::new();
    let mut cursor = start_after.to_string();
    loop {
        let page = store
            .metadata_list(ictx.pool(), ictx.image_id(), &cursor, LIST_PAGE)
            .await?;
        let full = page.len() == LIST_PAGE;
        if let Some((last, _)) = page.last() {
            cursor.clone_from(last);
        }
        out.extend(page);
        if !full {
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io;
    use crate::progress::{NoOpProgress, RecordingProgress};
    use crate::snapshot;
    use crate::test_support::{connect, open, setup};
    use imgplane_common::Config;

    const GIB: u64 = 1 << 30;

    #[tokio::test]
    async fn test_create_reports_requested_size() {
        let (_cluster, ctx, pool) = setup();
        let opts = CreateOptions {
            order: Some(22),
            ..CreateOptions::default()
        };
        create(&ctx, pool, "a", 10 * GIB, &opts).await.unwrap();
        let img = open(&ctx, pool, "a").await;
        assert_eq!(img.get_size().await.unwrap(), 10 * GIB);

        let info = info(&img).await.unwrap();
        assert_eq!(info.order, 22);
        assert_eq!(info.num_objects, 2560);
        assert!(info.block_name_prefix.starts_with("rbd_data."));
        assert!(info.parent.is_none());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (_cluster, ctx, pool) = setup();
        create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            create(&ctx, pool, "a", GIB, &CreateOptions::default()).await,
            Err(Error::AlreadyExists(_))
        ));

        let bad_order = CreateOptions {
            order: Some(26),
            ..CreateOptions::default()
        };
        assert!(create(&ctx, pool, "b", GIB, &bad_order).await.is_err());

        let bad_deps = CreateOptions {
            features: Some(Features::LAYERING | Features::OBJECT_MAP),
            ..CreateOptions::default()
        };
        assert!(matches!(
            create(&ctx, pool, "b", GIB, &bad_deps).await,
            Err(Error::InvalidArgument(_))
        ));

        let v1_features = CreateOptions {
            old_format: true,
            features: Some(Features::LAYERING),
            ..CreateOptions::default()
        };
        assert!(create(&ctx, pool, "b", GIB, &v1_features).await.is_err());
        assert_eq!(list(&ctx, pool).await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_striping_adds_feature() {
        let (_cluster, ctx, pool) = setup();
        let opts = CreateOptions {
            stripe_unit: Some(64 * 1024),
            stripe_count: Some(4),
            ..CreateOptions::default()
        };
        create(&ctx, pool, "s", GIB, &opts).await.unwrap();
        let img = open(&ctx, pool, "s").await;
        assert!(img.get_features().await.unwrap().contains(Features::STRIPINGV2));
        assert_eq!(img.get_stripe_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing() {
        let (cluster, ctx, pool) = setup();
        cluster.inject_fault("object_map_create", 1, Error::Timeout);
        assert_eq!(
            create(&ctx, pool, "a", GIB, &CreateOptions::default()).await,
            Err(Error::Timeout)
        );
        assert!(list(&ctx, pool).await.unwrap().is_empty());
        assert!(ctx.store().dir_get_id(pool, "a").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let (cluster, ctx, pool) = setup();
        create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "a").await;
        io::write(&img, 0, b"data").await.unwrap();
        snapshot::create(&img, "s").await.unwrap();

        // A second client holds the lock through its open handle
        let other = connect(&cluster, Config::default());
        assert!(matches!(
            remove(&other, pool, "a", false, &NoOpProgress).await,
            Err(Error::Busy(_))
        ));

        close(img).await.unwrap();
        assert_eq!(
            remove(&ctx, pool, "a", false, &NoOpProgress).await,
            Err(Error::HasSnapshots)
        );

        let img = open(&ctx, pool, "a").await;
        snapshot::remove(&img, "s", snapshot::RemoveFlags::default())
            .await
            .unwrap();
        let watcher = open(&other, pool, "a").await;
        close(img).await.unwrap();
        assert!(matches!(
            remove(&ctx, pool, "a", false, &NoOpProgress).await,
            Err(Error::Busy(_))
        ));
        close(watcher).await.unwrap();

        let progress = RecordingProgress::default();
        remove(&ctx, pool, "a", false, &progress).await.unwrap();
        assert_eq!(progress.last(), Some((1, 1)));
        assert!(list(&ctx, pool).await.unwrap().is_empty());
        assert!(ctx
            .store()
            .object_list(pool, "rbd_data.")
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            remove(&ctx, pool, "a", false, &NoOpProgress).await,
            Err(Error::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_and_list() {
        let (_cluster, ctx, pool) = setup();
        for name in ["a", "b"] {
            create(&ctx, pool, name, GIB, &CreateOptions::default())
                .await
                .unwrap();
        }
        let img = open(&ctx, pool, "a").await;
        assert!(matches!(
            rename(&ctx, pool, "a", "b").await,
            Err(Error::AlreadyExists(_))
        ));
        rename(&ctx, pool, "a", "c").await.unwrap();
        assert_eq!(img.name(), "c");
        assert_eq!(
            list(&ctx, pool).await.unwrap(),
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_shrink_preserves_snapshot_data() {
        let (_cluster, ctx, pool) = setup();
        create(&ctx, pool, "a", 3 << 22, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "a").await;
        io::write(&img, 2 << 22, b"tail").await.unwrap();
        snapshot::create(&img, "s").await.unwrap();

        let progress = RecordingProgress::default();
        resize(&img, 1 << 22, &progress).await.unwrap();
        assert_eq!(img.get_size().await.unwrap(), 1 << 22);
        assert_eq!(progress.last(), Some((1, 1)));

        resize(&img, 3 << 22, &NoOpProgress).await.unwrap();
        assert_eq!(io::read(&img, 2 << 22, 4).await.unwrap(), vec![0; 4]);
        let at_snap = open_snapshot(&ctx, pool, "a", "s").await.unwrap();
        assert_eq!(io::read(&at_snap, 2 << 22, 4).await.unwrap(), b"tail");
    }

    #[tokio::test]
    async fn test_update_features_dependencies() {
        let (_cluster, ctx, pool) = setup();
        let opts = CreateOptions {
            features: Some(Features::LAYERING),
            ..CreateOptions::default()
        };
        create(&ctx, pool, "a", GIB, &opts).await.unwrap();
        let img = open(&ctx, pool, "a").await;
        io::write(&img, 5 << 22, b"x").await.unwrap();

        assert!(matches!(
            update_features(&img, Features::OBJECT_MAP, true).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            update_features(&img, Features::LAYERING, false).await,
            Err(Error::InvalidArgument(_))
        ));
        update_features(&img, Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP, true)
            .await
            .unwrap();
        let features = img.get_features().await.unwrap();
        assert!(features.contains(Features::OBJECT_MAP));
        // The rebuilt map knows about data written before it existed
        assert!(ctx
            .store()
            .object_map_load(pool, img.image_id())
            .await
            .unwrap()
            .contains(&5));
        assert_eq!(io::read(&img, 5 << 22, 1).await.unwrap(), b"x");

        assert!(update_features(&img, Features::EXCLUSIVE_LOCK, false)
            .await
            .is_err());
        update_features(&img, Features::OBJECT_MAP, false)
            .await
            .unwrap();
        update_features(&img, Features::EXCLUSIVE_LOCK, false)
            .await
            .unwrap();
        assert_eq!(img.get_features().await.unwrap(), Features::LAYERING);
    }

    #[tokio::test]
    async fn test_metadata_pagination() {
        let (_cluster, ctx, pool) = setup();
        create(&ctx, pool, "a", GIB, &CreateOptions::default())
            .await
            .unwrap();
        let img = open(&ctx, pool, "a").await;
        for key in ["k1", "k2", "k3"] {
            metadata_set(&img, key, "v").await.unwrap();
        }
        assert_eq!(metadata_get(&img, "k2").await.unwrap(), "v");
        assert_eq!(metadata_list(&img, "k1", 1).await.unwrap().len(), 1);
        assert_eq!(metadata_list(&img, "", 0).await.unwrap().len(), 3);
        metadata_remove(&img, "k2").await.unwrap();
        assert!(metadata_get(&img, "k2").await.unwrap_err().is_not_found());
    }
}
