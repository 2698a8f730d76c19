//! Clone lineage: clone, flatten and bulk copy
//!
//! ```text
//!  parent@snap (protected)
//!        │  header_set_parent + children_add
//!        ▼
//!      clone ──reads fall through within the overlap──▶ parent@snap
//!        │  flatten: copy up every inherited object
//!        ▼
//!   independent image (child index entry dropped)
//! ```
//!
//! Clone creation pushes an undo for every step that leaves state behind,
//! so a failure at any step leaves neither a child image nor a child index
//! entry behind.

use crate::context::Context;
use crate::handle::{ImageCtx, SnapTarget, close_image, open_image};
use crate::image::{self, CreateOptions};
use crate::io;
use crate::journal;
use crate::lock;
use crate::mirror;
use crate::progress::{NoOpProgress, ProgressContext};
use crate::undo::Compensations;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use imgplane_common::{
    Error, Features, ParentInfo, ParentSpec, PoolId, ProtectionState, Result, SnapId,
};
use imgplane_store::MetadataStore;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const METADATA_PAGE: usize = 1024;

/// Options for a new clone; unset fields are inherited from the parent
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloneOptions {
    pub features: Option<Features>,
    pub order: Option<u8>,
    pub stripe_unit: Option<u64>,
    pub stripe_count: Option<u64>,
    /// Clone size; must not be smaller than the parent snapshot
    pub size: Option<u64>,
    /// Create as the non-primary replica of this global image id
    pub non_primary_global_image_id: Option<String>,
    pub primary_mirror_uuid: Option<String>,
}

/// A clone that depends on a snapshot
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChildImage {
    pub pool: PoolId,
    pub pool_name: String,
    pub image_id: String,
    pub image_name: String,
}

/// Copy every user metadata pair of one image onto another
async fn copy_metadata(
    store: &dyn MetadataStore,
    src_pool: PoolId,
    src_id: &str,
    dst_pool: PoolId,
    dst_id: &str,
) -> Result<()> {
    let mut start = String::new();
    loop {
        let pairs = match store
            .metadata_list(src_pool, src_id, &start, METADATA_PAGE)
            .await
        {
            Ok(pairs) => pairs,
            Err(Error::NotSupported(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for (key, value) in &pairs {
            store.metadata_set(dst_pool, dst_id, key, value).await?;
        }
        match pairs.last() {
            Some((key, _)) if pairs.len() == METADATA_PAGE => start.clone_from(key),
            _ => return Ok(()),
        }
    }
}

/// Ids of every clone of `spec`, searched across all base pools
pub(crate) async fn find_children(
    ctx: &Context,
    spec: &ParentSpec,
) -> Result<Vec<(PoolId, String)>> {
    let store = ctx.store();
    let mut children = Vec::new();
    for (pool, name) in store.pool_list().await? {
        let base = match store.pool_base_tier(pool).await {
            Ok(base) => base,
            Err(e) if e.is_not_found() => {
                debug!("Pool {name} no longer exists");
                continue;
            }
            Err(e) => return Err(e),
        };
        if base != pool {
            // cache tier
            continue;
        }
        match store.children_list(pool, spec).await {
            Ok(ids) => children.extend(ids.into_iter().map(|id| (pool, id))),
            Err(e) if e.is_not_found() => debug!("Pool {name} no longer exists"),
            Err(e) => return Err(e),
        }
    }
    Ok(children)
}

// ── Clone ──

/// Clone `p_name@p_snap` into a new image `c_name`
pub async fn clone(
    ctx: &Context,
    p_pool: PoolId,
    p_name: &str,
    p_snap: &str,
    c_pool: PoolId,
    c_name: &str,
    opts: &CloneOptions,
) -> Result<()> {
    if p_snap.is_empty() {
        return Err(Error::invalid_argument("image to be cloned must be a snapshot"));
    }
    let parent = image::open_snapshot(ctx, p_pool, p_name, p_snap).await?;
    let result = clone_from(&parent, c_pool, c_name, opts).await;
    let closed = image::close(parent).await;
    match (result, closed) {
        (Ok(()), Err(e)) => Err(e),
        (result, _) => result,
    }
}

/// Clone the snapshot an open handle is bound to
pub async fn clone_from(
    parent: &ImageCtx,
    c_pool: PoolId,
    c_name: &str,
    opts: &CloneOptions,
) -> Result<()> {
    parent.refresh_if_required().await?;
    let ctx = parent.context();
    let store = ctx.store();
    let snap_id = parent.snap_id();
    if snap_id.is_head() {
        return Err(Error::invalid_argument("image to be cloned must be a snapshot"));
    }
    if let Some(features) = opts.features {
        if !Features::ALL.contains(features) {
            return Err(Error::not_supported(format!(
                "unsupported features {:#x}",
                features.difference(Features::ALL).bits()
            )));
        }
    }

    // Step 1: the parent snapshot must be clonable
    let md = parent.metadata();
    if md.old_format {
        return Err(Error::invalid_argument("parent image must be in new format"));
    }
    if !md.features.contains(Features::LAYERING) {
        return Err(Error::not_supported("parent image must support layering"));
    }
    let snap = md.snap(snap_id)?;
    if snap.protection != ProtectionState::Protected {
        return Err(Error::invalid_argument("parent snapshot must be protected"));
    }
    let non_primary = opts.non_primary_global_image_id.as_deref();
    if md.features.contains(Features::JOURNALING)
        && !journal::is_tag_owner(parent).await?
        && non_primary.is_none()
    {
        return Err(Error::invalid_argument("parent is a non-primary mirrored image"));
    }

    // Step 2: effective child features
    let features = opts
        .features
        .unwrap_or_else(|| md.features.difference(Features::STRIPINGV2));
    if !features.contains(Features::LAYERING) {
        return Err(Error::not_supported("clone must support layering"));
    }
    let parent_size = snap.size;
    let size = opts.size.unwrap_or(parent_size);
    if size < parent_size {
        return Err(Error::invalid_argument(format!(
            "clone size {size} smaller than parent snapshot size {parent_size}"
        )));
    }

    // Step 3: child header and parent link
    let create_opts = CreateOptions {
        order: Some(opts.order.unwrap_or_else(|| md.layout.order())),
        features: Some(features),
        stripe_unit: opts.stripe_unit,
        stripe_count: opts.stripe_count,
        old_format: false,
        non_primary_global_image_id: opts.non_primary_global_image_id.clone(),
        primary_mirror_uuid: opts.primary_mirror_uuid.clone(),
    };
    let (child_id, child_features) =
        image::create_inner(ctx, c_pool, c_name, size, &create_opts).await?;

    let mut undo = Compensations::new("clone");
    {
        let (ctx, name, id) = (ctx.clone(), c_name.to_string(), child_id.clone());
        undo.push("child image", move || async move {
            image::purge(&ctx, c_pool, &name, &id).await;
            Ok(())
        });
    }

    let spec = ParentSpec {
        pool: parent.pool(),
        image_id: parent.image_id().to_string(),
        snap_id,
    };
    let result: Result<()> = async {
        let link = ParentInfo {
            spec: spec.clone(),
            overlap: parent_size,
        };
        store.header_set_parent(c_pool, &child_id, &link).await?;

        // Step 4: open the child and register it with the parent
        let child = open_image(
            ctx.clone(),
            c_pool,
            child_id.clone(),
            Some(c_name.to_string()),
            SnapTarget::Head,
            false,
        )
        .await?;
        {
            let child = child.clone();
            undo.push("child handle", move || async move { close_image(child).await });
        }

        store.children_add(c_pool, &spec, &child_id).await?;
        {
            let (ctx, spec, id) = (ctx.clone(), spec.clone(), child_id.clone());
            undo.push("child index entry", move || async move {
                ctx.store().children_remove(c_pool, &spec, &id).await
            });
        }

        // Step 5: an unprotect may have raced the registration
        match store
            .snap_get_protection(spec.pool, &spec.image_id, snap_id)
            .await
        {
            Ok(ProtectionState::Protected) => {}
            Ok(state) => {
                return Err(Error::lost_race(format!(
                    "parent snapshot became {state} during clone"
                )));
            }
            Err(e) if e.is_not_found() => {
                return Err(Error::lost_race("parent snapshot removed during clone"));
            }
            Err(e) => return Err(e),
        }

        // Step 6: user metadata
        copy_metadata(store, spec.pool, &spec.image_id, c_pool, &child_id).await?;

        // Step 7: mirroring
        if image::mirroring_required(store, c_pool, child_features, non_primary).await? {
            mirror::enable_record(store, c_pool, &child_id, non_primary).await?;
        }

        close_image(child).await
    }
    .await;

    match result {
        Ok(()) => {
            undo.disarm();
            info!(
                "Cloned {}@{} to {c_name} ({c_pool}/{child_id})",
                parent.name(),
                snap.name
            );
            Ok(())
        }
        Err(e) => Err(undo.unwind(e).await),
    }
}

/// Clones of the snapshot this handle is bound to
pub async fn list_children(ictx: &ImageCtx) -> Result<Vec<ChildImage>> {
    ictx.refresh_if_required().await?;
    if !ictx.metadata().features.contains(Features::LAYERING) {
        return Ok(Vec::new());
    }
    let ctx = ictx.context();
    let store = ctx.store();
    let spec = ParentSpec {
        pool: ictx.pool(),
        image_id: ictx.image_id().to_string(),
        snap_id: ictx.snap_id(),
    };
    let pool_names: HashMap<PoolId, String> = store.pool_list().await?.into_iter().collect();

    let mut children = Vec::new();
    for (pool, image_id) in find_children(ctx, &spec).await? {
        let image_name = store.dir_get_name(pool, &image_id).await?;
        children.push(ChildImage {
            pool,
            pool_name: pool_names.get(&pool).cloned().unwrap_or_default(),
            image_id,
            image_name,
        });
    }
    children.sort();
    Ok(children)
}

// ── Flatten ──

/// Copy every object inherited from the parent into the clone and drop the
/// parent link
pub async fn flatten(ictx: &ImageCtx, progress: &dyn ProgressContext) -> Result<()> {
    ictx.refresh_if_required().await?;
    if ictx.is_read_only() {
        return Err(Error::ReadOnly(format!("{} is opened read-only", ictx.name())));
    }
    let _owner = ictx.owner_lock().write().await;
    lock::ensure_owner(ictx).await?;

    let md = ictx.metadata();
    let Some(parent) = md.parent.clone() else {
        return Err(Error::invalid_argument(format!("{} has no parent", ictx.name())));
    };
    let overlap = md.overlap_at(SnapId::HEAD)?;
    let total = md.layout.num_objects(overlap);
    let limit = ictx.context().config().management.concurrent_management_ops.max(1);
    debug!("Flattening {} ({total} objects)", ictx.name());

    let mut objects = 0..total;
    let mut in_flight = FuturesUnordered::new();
    let mut first_err = None;
    let mut done = 0;
    loop {
        while first_err.is_none() && in_flight.len() < limit {
            let Some(objno) = objects.next() else { break };
            let md = &md;
            in_flight.push(async move { io::copyup(ictx, md, objno).await });
        }
        match in_flight.next().await {
            Some(Ok(_)) => {
                done += 1;
                progress.update_progress(done, total);
            }
            Some(Err(e)) => {
                first_err.get_or_insert(e);
            }
            None => break,
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    let store = ictx.context().store();
    let deep = md.features.contains(Features::DEEP_FLATTEN);
    store
        .header_remove_parent(ictx.pool(), ictx.image_id(), deep)
        .await?;
    // Snapshots of a shallow-flattened clone may still read the parent, but
    // the head no longer depends on it
    match store
        .children_remove(ictx.pool(), &parent.spec, ictx.image_id())
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!("{} was not in the child index", ictx.name()),
        Err(e) => return Err(e),
    }

    ictx.notify_update().await;
    info!("Flattened {}", ictx.name());
    Ok(())
}

/// Flatten every clone of snapshot `snap_name`
pub async fn flatten_children(
    ictx: &ImageCtx,
    snap_name: &str,
    progress: &dyn ProgressContext,
) -> Result<()> {
    ictx.refresh_if_required().await?;
    let snap_id = ictx
        .metadata()
        .snap_by_name(snap_name)
        .map(|s| s.id)
        .ok_or_else(|| Error::SnapshotNotFound(snap_name.to_string()))?;
    let spec = ParentSpec {
        pool: ictx.pool(),
        image_id: ictx.image_id().to_string(),
        snap_id,
    };

    let ctx = ictx.context();
    let children = find_children(ctx, &spec).await?;
    let total = children.len() as u64;
    for (i, (pool, image_id)) in children.into_iter().enumerate() {
        let child = image::open_by_id(ctx, pool, &image_id, false).await?;
        let flattened = flatten(&child, &NoOpProgress).await;
        let closed = image::close(child).await;
        if let Err(e) = flattened {
            warn!("Failed to flatten child {pool}/{image_id}: {e}");
            return Err(e);
        }
        closed?;
        progress.update_progress(i as u64 + 1, total);
    }
    Ok(())
}

// ── Bulk copy ──

async fn copy_chunk(src: &ImageCtx, dst: &ImageCtx, offset: u64, len: u64) -> Result<bool> {
    let data = io::read(src, offset, len).await?;
    if data.iter().all(|b| *b == 0) {
        return Ok(false);
    }
    io::write(dst, offset, &data).await?;
    Ok(true)
}

/// Copy user metadata and contents of `src` into the existing image `dst`
pub async fn copy(src: &ImageCtx, dst: &ImageCtx, progress: &dyn ProgressContext) -> Result<()> {
    src.refresh_if_required().await?;
    dst.refresh_if_required().await?;
    let src_md = src.metadata();
    let src_size = src_md.size_at(src.snap_id())?;
    let dst_size = dst.metadata().size_at(dst.snap_id())?;
    if dst_size < src_size {
        return Err(Error::invalid_argument(format!(
            "source size {src_size} exceeds destination size {dst_size}"
        )));
    }

    copy_metadata(
        src.context().store(),
        src.pool(),
        src.image_id(),
        dst.pool(),
        dst.image_id(),
    )
    .await?;

    let period = src_md.layout.period();
    let limit = src.context().config().management.concurrent_management_ops.max(1);
    let mut offsets = (0..src_size).step_by(usize::try_from(period).unwrap_or(usize::MAX));
    let mut in_flight = FuturesUnordered::new();
    let mut first_err = None;
    let mut written = 0u64;
    loop {
        while first_err.is_none() && in_flight.len() < limit {
            let Some(offset) = offsets.next() else { break };
            let len = period.min(src_size - offset);
            in_flight.push(copy_chunk(src, dst, offset, len));
            progress.update_progress(offset, src_size);
        }
        match in_flight.next().await {
            Some(Ok(true)) => written += 1,
            Some(Ok(false)) => {}
            Some(Err(e)) => {
                warn!("Copy of {} failed: {e}", src.name());
                first_err.get_or_insert(e);
            }
            None => break,
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    progress.update_progress(src_size, src_size);
    info!(
        "Copied {} to {} ({written} chunks written)",
        src.name(),
        dst.name()
    );
    Ok(())
}

/// Copy `src` into a new image; layout and features follow the source
/// unless overridden
pub async fn copy_to_new(
    src: &ImageCtx,
    pool: PoolId,
    name: &str,
    opts: &CreateOptions,
    progress: &dyn ProgressContext,
) -> Result<()> {
    src.refresh_if_required().await?;
    let ctx = src.context();
    let md = src.metadata();
    let size = md.size_at(src.snap_id())?;

    let mut opts = opts.clone();
    opts.old_format |= md.old_format;
    opts.order.get_or_insert(md.layout.order());
    opts.features
        .get_or_insert(md.features.difference(Features::STRIPINGV2));
    if md.layout.is_fancy() {
        opts.stripe_unit.get_or_insert(md.layout.stripe_unit());
        opts.stripe_count.get_or_insert(md.layout.stripe_count());
    }

    image::create(ctx, pool, name, size, &opts).await?;
    let dst = image::open(ctx, pool, name, false).await?;
    let copied = copy(src, &dst, progress).await;
    let closed = image::close(dst).await;
    copied?;
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingProgress;
    use crate::snapshot;
    use crate::test_support::{open, setup};
    use imgplane_common::MirrorMode;
    use imgplane_store::Cluster;
    use std::sync::Arc;

    const MIB: u64 = 1 << 20;

    /// Image `parent` with protected snapshot `s`
    async fn parent_with_snapshot(ctx: &Context, pool: PoolId, opts: &CreateOptions) {
        image::create(ctx, pool, "parent", 8 * MIB, opts).await.unwrap();
        let p = open(ctx, pool, "parent").await;
        io::write(&p, 0, b"from parent").await.unwrap();
        image::metadata_set(&p, "conf", "v").await.unwrap();
        snapshot::create(&p, "s").await.unwrap();
        snapshot::protect(&p, "s").await.unwrap();
        image::close(p).await.unwrap();
    }

    async fn spec_of(ctx: &Context, pool: PoolId) -> ParentSpec {
        let p = open(ctx, pool, "parent").await;
        let snap_id = p.metadata().snap_by_name("s").unwrap().id;
        let spec = ParentSpec {
            pool,
            image_id: p.image_id().to_string(),
            snap_id,
        };
        image::close(p).await.unwrap();
        spec
    }

    #[tokio::test]
    async fn test_clone_reads_parent_and_copies_metadata() {
        let (_cluster, ctx, pool) = setup();
        parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
        clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
            .await
            .unwrap();

        let child = open(&ctx, pool, "child").await;
        assert_eq!(child.get_size().await.unwrap(), 8 * MIB);
        assert_eq!(io::read(&child, 0, 11).await.unwrap(), b"from parent");
        assert_eq!(image::metadata_get(&child, "conf").await.unwrap(), "v");
        let info = child.get_parent_info().await.unwrap();
        assert_eq!(info.image_name, "parent");
        assert_eq!(info.snap_name, "s");
        assert_eq!(info.overlap, 8 * MIB);

        let spec = spec_of(&ctx, pool).await;
        assert_eq!(
            ctx.store().children_list(pool, &spec).await.unwrap(),
            vec![child.image_id().to_string()]
        );
    }

    #[tokio::test]
    async fn test_clone_size_override() {
        let (_cluster, ctx, pool) = setup();
        parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
        let bigger = CloneOptions {
            size: Some(16 * MIB),
            ..CloneOptions::default()
        };
        clone(&ctx, pool, "parent", "s", pool, "big", &bigger).await.unwrap();
        let big = open(&ctx, pool, "big").await;
        assert_eq!(big.get_size().await.unwrap(), 16 * MIB);
        assert_eq!(big.get_overlap().await.unwrap(), 8 * MIB);

        let smaller = CloneOptions {
            size: Some(MIB),
            ..CloneOptions::default()
        };
        assert!(matches!(
            clone(&ctx, pool, "parent", "s", pool, "small", &smaller).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(image::list(&ctx, pool).await.unwrap(), vec!["big", "parent"]);
    }

    #[tokio::test]
    async fn test_clone_preconditions() {
        let (_cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "parent", 8 * MIB, &CreateOptions::default())
            .await
            .unwrap();
        let p = open(&ctx, pool, "parent").await;
        snapshot::create(&p, "s").await.unwrap();

        let opts = CloneOptions::default();
        assert!(matches!(
            clone(&ctx, pool, "parent", "", pool, "c", &opts).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            clone(&ctx, pool, "parent", "s", pool, "c", &opts).await,
            Err(Error::InvalidArgument(_))
        ));
        snapshot::protect(&p, "s").await.unwrap();

        let no_layering = CloneOptions {
            features: Some(Features::EXCLUSIVE_LOCK),
            ..CloneOptions::default()
        };
        assert!(matches!(
            clone(&ctx, pool, "parent", "s", pool, "c", &no_layering).await,
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            clone(&ctx, pool, "parent", "s", pool, "parent", &opts).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            clone(&ctx, pool, "parent", "missing", pool, "c", &opts).await,
            Err(Error::SnapshotNotFound(_))
        ));
    }

    async fn assert_no_residue(cluster: &Arc<Cluster>, ctx: &Context, pool: PoolId) {
        cluster.clear_faults();
        assert_eq!(image::list(ctx, pool).await.unwrap(), vec!["parent"]);
        let spec = spec_of(ctx, pool).await;
        assert!(ctx.store().children_list(pool, &spec).await.unwrap().is_empty());
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_clone_failure_at_each_step_leaves_nothing() {
        // (operation, which call after injection fails)
        let steps = [
            ("header_create", 1),
            ("header_set_parent", 1),
            ("watch", 2),
            ("children_add", 1),
            ("snap_get_protection", 1),
            ("metadata_set", 1),
        ];
        for (op, nth) in steps {
            let (cluster, ctx, pool) = setup();
            parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
            cluster.inject_fault(op, nth, Error::Timeout);
            let err = clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err, Error::Timeout, "failure at {op}");
            assert_no_residue(&cluster, &ctx, pool).await;
        }
    }

    #[tokio::test]
    async fn test_clone_mirroring_failure_leaves_nothing() {
        let (cluster, ctx, pool) = setup();
        let journaled = CreateOptions {
            features: Some(
                Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::JOURNALING,
            ),
            ..CreateOptions::default()
        };
        parent_with_snapshot(&ctx, pool, &journaled).await;
        mirror::mode_set(&ctx, pool, MirrorMode::Pool).await.unwrap();

        cluster.inject_fault("mirror_image_set", 1, Error::Timeout);
        let err = clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_no_residue(&cluster, &ctx, pool).await;

        // Without the fault the clone comes out mirrored
        clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
            .await
            .unwrap();
        let child = open(&ctx, pool, "child").await;
        let info = mirror::image_get_info(&child).await.unwrap();
        assert_eq!(info.state, imgplane_common::MirrorImageState::Enabled);
        assert!(info.primary);
    }

    #[tokio::test]
    async fn test_clone_detects_unprotect_race() {
        let (cluster, ctx, pool) = setup();
        parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
        cluster.inject_fault(
            "snap_get_protection",
            1,
            Error::SnapshotNotFound("s".into()),
        );
        let err = clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_lost_race());
        assert_no_residue(&cluster, &ctx, pool).await;
    }

    #[tokio::test]
    async fn test_flatten_detaches_clone() {
        let (_cluster, ctx, pool) = setup();
        parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
        clone(&ctx, pool, "parent", "s", pool, "child", &CloneOptions::default())
            .await
            .unwrap();
        let child = open(&ctx, pool, "child").await;

        let progress = RecordingProgress::default();
        flatten(&child, &progress).await.unwrap();
        assert_eq!(progress.last(), Some((2, 2)));
        assert!(child.get_parent_info().await.unwrap_err().is_not_found());
        assert_eq!(io::read(&child, 0, 11).await.unwrap(), b"from parent");
        assert!(matches!(
            flatten(&child, &NoOpProgress).await,
            Err(Error::InvalidArgument(_))
        ));

        let p = open(&ctx, pool, "parent").await;
        snapshot::unprotect(&p, "s").await.unwrap();
    }

    #[tokio::test]
    async fn test_shallow_flatten_keeps_snapshot_view() {
        let (_cluster, ctx, pool) = setup();
        parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
        let shallow = CloneOptions {
            features: Some(Features::LAYERING | Features::EXCLUSIVE_LOCK),
            ..CloneOptions::default()
        };
        clone(&ctx, pool, "parent", "s", pool, "child", &shallow).await.unwrap();
        let child = open(&ctx, pool, "child").await;
        snapshot::create(&child, "cs").await.unwrap();
        flatten(&child, &NoOpProgress).await.unwrap();

        // The snapshot still reads through to the parent
        let at_snap = image::open_snapshot(&ctx, pool, "child", "cs").await.unwrap();
        assert!(at_snap.get_parent_info().await.is_ok());
        assert_eq!(io::read(&at_snap, 0, 11).await.unwrap(), b"from parent");

        let spec = spec_of(&ctx, pool).await;
        assert!(ctx.store().children_list(pool, &spec).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_children_across_pools() {
        let (cluster, ctx, pool) = setup();
        let other = cluster.create_pool("other").unwrap();
        parent_with_snapshot(&ctx, pool, &CreateOptions::default()).await;
        let opts = CloneOptions::default();
        clone(&ctx, pool, "parent", "s", pool, "c1", &opts).await.unwrap();
        clone(&ctx, pool, "parent", "s", other, "c2", &opts).await.unwrap();

        let at_snap = image::open_snapshot(&ctx, pool, "parent", "s").await.unwrap();
        let children = list_children(&at_snap).await.unwrap();
        let names: Vec<_> = children
            .iter()
            .map(|c| (c.pool_name.as_str(), c.image_name.as_str()))
            .collect();
        assert_eq!(names, vec![("rbd", "c1"), ("other", "c2")]);

        let p = open(&ctx, pool, "parent").await;
        let progress = RecordingProgress::default();
        flatten_children(&p, "s", &progress).await.unwrap();
        assert_eq!(progress.last(), Some((2, 2)));
        assert!(list_children(&at_snap).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_skips_zero_chunks() {
        let (cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "zero", 16 * MIB, &CreateOptions::default())
            .await
            .unwrap();
        let src = open(&ctx, pool, "zero").await;
        let writes = cluster.op_calls("object_write");

        let progress = RecordingProgress::default();
        copy_to_new(&src, pool, "dup", &CreateOptions::default(), &progress)
            .await
            .unwrap();
        assert_eq!(cluster.op_calls("object_write"), writes);
        assert_eq!(progress.last(), Some((16 * MIB, 16 * MIB)));
        let dst = open(&ctx, pool, "dup").await;
        assert_eq!(dst.get_size().await.unwrap(), 16 * MIB);
    }

    #[tokio::test]
    async fn test_copy_contents_and_errors() {
        let (cluster, ctx, pool) = setup();
        image::create(&ctx, pool, "src", 16 * MIB, &CreateOptions::default())
            .await
            .unwrap();
        let src = open(&ctx, pool, "src").await;
        for i in 0..4u64 {
            io::write(&src, i * 4 * MIB + 7, format!("chunk{i}").as_bytes())
                .await
                .unwrap();
        }
        image::metadata_set(&src, "k", "v").await.unwrap();

        image::create(&ctx, pool, "small", MIB, &CreateOptions::default())
            .await
            .unwrap();
        let small = open(&ctx, pool, "small").await;
        assert!(matches!(
            copy(&src, &small, &NoOpProgress).await,
            Err(Error::InvalidArgument(_))
        ));

        image::create(&ctx, pool, "dst", 16 * MIB, &CreateOptions::default())
            .await
            .unwrap();
        let dst = open(&ctx, pool, "dst").await;
        copy(&src, &dst, &NoOpProgress).await.unwrap();
        for i in 0..4u64 {
            assert_eq!(
                io::read(&dst, i * 4 * MIB + 7, 6).await.unwrap(),
                format!("chunk{i}").as_bytes()
            );
        }
        assert_eq!(image::metadata_get(&dst, "k").await.unwrap(), "v");

        image::create(&ctx, pool, "dst2", 16 * MIB, &CreateOptions::default())
            .await
            .unwrap();
        let dst2 = open(&ctx, pool, "dst2").await;
        cluster.inject_fault("object_write", 2, Error::Transport("link down".into()));
        assert_eq!(
            copy(&src, &dst2, &NoOpProgress).await,
            Err(Error::Transport("link down".into()))
        );
    }
}
