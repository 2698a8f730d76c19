//! Open image handle
//!
//! An [`ImageCtx`] caches the image header and keeps it coherent through a
//! watch on the header object. Every notification bumps `update_seq`; a
//! refresh loads the header and re-derives the parent chain, then swaps the
//! whole cached view at once. Readers never observe a half-refreshed state.
//!
//! ```text
//!  notify ──▶ HeaderWatcher ──▶ update_seq += 1
//!                                   │
//!  refresh_if_required: update_seq != refresh_seq ──▶ refresh()
//!                                                       │
//!                header_get + object map + parent ◀─────┘
//!                              │
//!                 swap ImageState, refresh_seq = seen
//! ```

use crate::context::Context;
use crate::layout::Layout;
use crate::lock::{ExclusiveLock, LockState};
use crate::registry::HandleId;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use imgplane_common::{
    Error, Features, LockPolicy, ParentInfo, ParentSpec, PoolId, Result, SnapContext, SnapId,
    SnapInfo, TagOwner,
};
use imgplane_store::{ImageHeader, MetadataStore, UpdateWatcher, header_oid};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which image revision a handle is bound to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapTarget {
    Head,
    Name(String),
    Id(SnapId),
}

/// Immutable snapshot of an image's header as last loaded
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    pub size: u64,
    pub layout: Layout,
    pub features: Features,
    pub flags: u64,
    pub old_format: bool,
    pub object_prefix: String,
    pub parent: Option<ParentInfo>,
    pub snaps: BTreeMap<SnapId, SnapInfo>,
    pub snap_seq: u64,
    /// Journal tag owner when journaling is enabled
    pub journal_owner: Option<TagOwner>,
    pub created_at: DateTime<Utc>,
}

impl ImageMetadata {
    fn from_header(header: ImageHeader, journal_owner: Option<TagOwner>) -> Result<Self> {
        let layout = Layout::new(header.order, header.stripe_unit, header.stripe_count)?;
        Ok(Self {
            size: header.size,
            layout,
            features: header.features,
            flags: header.flags,
            old_format: header.old_format,
            object_prefix: header.object_prefix,
            parent: header.parent,
            snaps: header.snaps,
            snap_seq: header.snap_seq,
            journal_owner,
            created_at: header.created_at,
        })
    }

    /// Image size as seen at `snap`
    pub fn size_at(&self, snap: SnapId) -> Result<u64> {
        if snap.is_head() {
            return Ok(self.size);
        }
        self.snap(snap).map(|s| s.size)
    }

    /// Parent link as seen at `snap`
    pub fn parent_at(&self, snap: SnapId) -> Result<Option<&ParentInfo>> {
        if snap.is_head() {
            return Ok(self.parent.as_ref());
        }
        self.snap(snap).map(|s| s.parent.as_ref())
    }

    /// Bytes of the image still backed by the parent at `snap`
    pub fn overlap_at(&self, snap: SnapId) -> Result<u64> {
        let size = self.size_at(snap)?;
        Ok(self
            .parent_at(snap)?
            .map_or(0, |p| p.overlap.min(size)))
    }

    pub fn snap(&self, snap: SnapId) -> Result<&SnapInfo> {
        self.snaps
            .get(&snap)
            .ok_or_else(|| Error::SnapshotNotFound(snap.to_string()))
    }

    #[must_use]
    pub fn snap_by_name(&self, name: &str) -> Option<&SnapInfo> {
        self.snaps.values().find(|s| s.name == name)
    }

    /// Context attached to head writes: every snapshot, newest first
    #[must_use]
    pub fn snap_context(&self) -> SnapContext {
        SnapContext {
            seq: self.snap_seq,
            snaps: self.snaps.keys().rev().copied().collect(),
        }
    }

    #[must_use]
    pub fn num_objects(&self, snap: SnapId) -> u64 {
        self.size_at(snap)
            .map_or(0, |size| self.layout.num_objects(size))
    }
}

/// Parent description resolved to names for display
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentImageInfo {
    pub pool: PoolId,
    pub pool_name: String,
    pub image_id: String,
    pub image_name: String,
    pub snap_id: SnapId,
    pub snap_name: String,
    pub overlap: u64,
}

struct ImageState {
    md: Arc<ImageMetadata>,
    object_map: Option<BTreeSet<u64>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ParentLink {
    spec: ParentSpec,
    handle: HandleId,
}

/// Bumps the update sequence of every handle watching a header
struct HeaderWatcher {
    update_seq: Arc<AtomicU64>,
}

impl UpdateWatcher for HeaderWatcher {
    fn handle_update(&self) {
        self.update_seq.fetch_add(1, Ordering::SeqCst);
    }
}

/// An open image
pub struct ImageCtx {
    handle_id: HandleId,
    pool: PoolId,
    image_id: String,
    name: RwLock<String>,
    header_oid: String,
    read_only: bool,
    snap: RwLock<SnapId>,
    state: RwLock<ImageState>,
    parent: RwLock<Option<ParentLink>>,
    update_seq: Arc<AtomicU64>,
    refresh_seq: AtomicU64,
    /// Serializes refreshes; a caller that waited re-checks staleness
    refresh_gate: tokio::sync::Mutex<()>,
    /// Maintenance operations hold it for write, public I/O for read
    owner_lock: tokio::sync::RwLock<()>,
    /// Serializes copy-up so two writers never both seed an object
    copyup_gate: tokio::sync::Mutex<()>,
    watch_handle: Mutex<Option<u64>>,
    lock: ExclusiveLock,
    lock_policy: RwLock<LockPolicy>,
    ctx: Context,
}

impl std::fmt::Debug for ImageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCtx")
            .field("handle_id", &self.handle_id)
            .field("pool", &self.pool)
            .field("image_id", &self.image_id)
            .field("snap", &*self.snap.read())
            .finish_non_exhaustive()
    }
}

async fn load_state(store: &dyn MetadataStore, pool: PoolId, image_id: &str) -> Result<ImageState> {
    let header = store.header_get(pool, image_id).await?;

    let object_map = if header.features.contains(Features::OBJECT_MAP) {
        match store.object_map_load(pool, image_id).await {
            Ok(map) => Some(map),
            Err(e) if e.is_not_found() => {
                warn!("Object map of {image_id} missing, reading every object");
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    let journal_owner = if header.features.contains(Features::JOURNALING) {
        match store.journal_tag_owner(pool, image_id).await {
            Ok(owner) => Some(owner),
            Err(e) if e.is_not_found() => {
                warn!("Journal of {image_id} missing");
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    Ok(ImageState {
        md: Arc::new(ImageMetadata::from_header(header, journal_owner)?),
        object_map,
    })
}

fn resolve_snap(md: &ImageMetadata, target: &SnapTarget) -> Result<SnapId> {
    match target {
        SnapTarget::Head => Ok(SnapId::HEAD),
        SnapTarget::Name(name) => md
            .snap_by_name(name)
            .map(|s| s.id)
            .ok_or_else(|| Error::SnapshotNotFound(name.clone())),
        SnapTarget::Id(id) => md.snap(*id).map(|s| s.id),
    }
}

/// Open a handle on `image_id`, including its parent chain
pub(crate) fn open_image(
    ctx: Context,
    pool: PoolId,
    image_id: String,
    name: Option<String>,
    target: SnapTarget,
    read_only: bool,
) -> BoxFuture<'static, Result<Arc<ImageCtx>>> {
    async move {
        let store = ctx.store();
        let state = load_state(store, pool, &image_id).await?;
        let snap = resolve_snap(&state.md, &target)?;
        let name = match name {
            Some(name) => name,
            None => match store.dir_get_name(pool, &image_id).await {
                Ok(name) => name,
                Err(e) if e.is_not_found() => image_id.clone(),
                Err(e) => return Err(e),
            },
        };

        let handle_id = ctx.registry().allocate_id();
        let update_seq = Arc::new(AtomicU64::new(0));
        let oid = header_oid(&image_id);
        let ictx = Arc::new(ImageCtx {
            handle_id,
            pool,
            lock: ExclusiveLock::new(format!("auto {}.{handle_id}", store.instance_id())),
            lock_policy: RwLock::new(ctx.config().lock.policy),
            image_id,
            name: RwLock::new(name),
            header_oid: oid,
            read_only: read_only || !snap.is_head(),
            snap: RwLock::new(snap),
            state: RwLock::new(state),
            parent: RwLock::new(None),
            update_seq: Arc::clone(&update_seq),
            refresh_seq: AtomicU64::new(0),
            refresh_gate: tokio::sync::Mutex::new(()),
            owner_lock: tokio::sync::RwLock::new(()),
            copyup_gate: tokio::sync::Mutex::new(()),
            watch_handle: Mutex::new(None),
            ctx: ctx.clone(),
        });

        let watch = store
            .watch(pool, &ictx.header_oid, Arc::new(HeaderWatcher { update_seq }))
            .await?;
        *ictx.watch_handle.lock() = Some(watch);

        let md = ictx.metadata();
        let wanted = md.parent_at(snap)?.map(|p| p.spec.clone());
        match ictx.resolve_parent(wanted.as_ref()).await {
            Ok(link) => *ictx.parent.write() = link,
            Err(e) => {
                if let Err(e) = store.unwatch(pool, &ictx.header_oid, watch).await {
                    debug!("Failed to drop watch after aborted open: {e}");
                }
                return Err(e);
            }
        }

        ctx.registry().insert(Arc::clone(&ictx));
        debug!(
            "Opened image {} ({pool}/{}) at {snap} as handle {handle_id}",
            ictx.name(),
            ictx.image_id
        );
        Ok(ictx)
    }
    .boxed()
}

/// Close a handle and the parent handles it opened
pub(crate) fn close_image(ictx: Arc<ImageCtx>) -> BoxFuture<'static, Result<()>> {
    async move {
        let ctx = ictx.ctx.clone();
        let store = ctx.store();

        if ictx.lock.state() == LockState::Owned {
            let delay = Duration::from_millis(ctx.config().lock.release_retry_delay_ms);
            if let Err(e) = ictx
                .lock
                .release(store, ictx.pool, &ictx.header_oid, delay)
                .await
            {
                if e.is_retryable() {
                    return Err(e);
                }
                // Fenced or broken: the store no longer honors this handle's lock
                warn!("Failed to release exclusive lock on {}: {e}", ictx.header_oid);
                ictx.lock.mark_released();
            }
        }

        let watch = ictx.watch_handle.lock().take();
        if let Some(watch) = watch {
            if let Err(e) = store.unwatch(ictx.pool, &ictx.header_oid, watch).await {
                debug!("Failed to drop watch on {}: {e}", ictx.header_oid);
            }
        }

        let parent = ictx.parent.write().take();
        if let Some(link) = parent {
            if let Some(parent) = ctx.registry().get(link.handle) {
                if let Err(e) = close_image(parent).await {
                    warn!("Failed to close parent {}: {e}", link.spec);
                }
            }
        }

        ctx.registry().remove(ictx.handle_id);
        debug!("Closed handle {} on {}", ictx.handle_id, ictx.name());
        Ok(())
    }
    .boxed()
}

impl ImageCtx {
    #[must_use]
    pub const fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    #[must_use]
    pub const fn pool(&self) -> PoolId {
        self.pool
    }

    #[must_use]
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    #[must_use]
    pub fn header_oid(&self) -> &str {
        &self.header_oid
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    /// Handles bound to a snapshot are always read-only
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only || !self.snap_id().is_head()
    }

    #[must_use]
    pub fn snap_id(&self) -> SnapId {
        *self.snap.read()
    }

    #[must_use]
    pub fn snap_name(&self) -> Option<String> {
        let snap = self.snap_id();
        if snap.is_head() {
            return None;
        }
        self.metadata().snaps.get(&snap).map(|s| s.name.clone())
    }

    /// Current cached header view
    #[must_use]
    pub fn metadata(&self) -> Arc<ImageMetadata> {
        Arc::clone(&self.state.read().md)
    }

    /// Open parent handle, if the image is a clone at the bound revision
    #[must_use]
    pub fn parent(&self) -> Option<Arc<ImageCtx>> {
        let link = self.parent.read().clone()?;
        self.ctx.registry().get(link.handle)
    }

    #[must_use]
    pub const fn exclusive_lock(&self) -> &ExclusiveLock {
        &self.lock
    }

    #[must_use]
    pub fn lock_policy(&self) -> LockPolicy {
        *self.lock_policy.read()
    }

    pub fn set_lock_policy(&self, policy: LockPolicy) {
        *self.lock_policy.write() = policy;
    }

    pub(crate) const fn owner_lock(&self) -> &tokio::sync::RwLock<()> {
        &self.owner_lock
    }

    pub(crate) const fn copyup_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.copyup_gate
    }

    /// False only when the object map proves the object was never written
    pub(crate) fn object_may_exist(&self, objno: u64) -> bool {
        if !self.snap_id().is_head() {
            return true;
        }
        self.state
            .read()
            .object_map
            .as_ref()
            .is_none_or(|map| map.contains(&objno))
    }

    pub(crate) async fn mark_object(&self, objno: u64) -> Result<()> {
        let tracked = {
            let state = self.state.read();
            match &state.object_map {
                Some(map) => !map.contains(&objno),
                None => false,
            }
        };
        if !tracked {
            return Ok(());
        }
        self.ctx
            .store()
            .object_map_mark(self.pool, &self.image_id, objno)
            .await?;
        if let Some(map) = self.state.write().object_map.as_mut() {
            map.insert(objno);
        }
        Ok(())
    }

    // ---- Coherence ----

    /// Whether a header update arrived since the last refresh
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.update_seq.load(Ordering::SeqCst) != self.refresh_seq.load(Ordering::SeqCst)
    }

    /// Refresh when stale; a failed refresh surfaces as a stale handle
    pub async fn refresh_if_required(&self) -> Result<()> {
        if !self.needs_refresh() {
            return Ok(());
        }
        self.do_refresh(true).await.map_err(Error::stale)
    }

    /// Reload the header and parent chain unconditionally
    pub async fn refresh(&self) -> Result<()> {
        self.do_refresh(false).await
    }

    async fn do_refresh(&self, only_if_stale: bool) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;
        // Someone else may have refreshed while we waited on the gate
        if only_if_stale && !self.needs_refresh() {
            return Ok(());
        }
        let seen = self.update_seq.load(Ordering::SeqCst);
        let snap = self.snap_id();

        let state = load_state(self.ctx.store(), self.pool, &self.image_id).await?;
        if !snap.is_head() && !state.md.snaps.contains_key(&snap) {
            return Err(Error::SnapshotNotFound(snap.to_string()));
        }
        let wanted = state.md.parent_at(snap)?.map(|p| p.spec.clone());
        let new_link = self.resolve_parent(wanted.as_ref()).await?;

        let old_link = {
            let mut current = self.state.write();
            let mut parent = self.parent.write();
            *current = state;
            std::mem::replace(&mut *parent, new_link.clone())
        };
        self.refresh_seq.store(seen, Ordering::SeqCst);
        self.drop_old_parent(old_link, new_link.as_ref()).await;
        debug!("Refreshed {} (update {seen})", self.name());
        Ok(())
    }

    /// Reuse the current parent handle when the parent spec is unchanged,
    /// otherwise open a new one
    async fn resolve_parent(&self, wanted: Option<&ParentSpec>) -> Result<Option<ParentLink>> {
        let Some(spec) = wanted else {
            return Ok(None);
        };
        let current = self.parent.read().clone();
        if let Some(link) = current {
            if &link.spec == spec && self.ctx.registry().get(link.handle).is_some() {
                return Ok(Some(link));
            }
        }
        let parent = open_image(
            self.ctx.clone(),
            spec.pool,
            spec.image_id.clone(),
            None,
            SnapTarget::Id(spec.snap_id),
            true,
        )
        .await?;
        Ok(Some(ParentLink {
            spec: spec.clone(),
            handle: parent.handle_id(),
        }))
    }

    async fn drop_old_parent(&self, old: Option<ParentLink>, new: Option<&ParentLink>) {
        let Some(old) = old else {
            return;
        };
        if new.is_some_and(|n| n.handle == old.handle) {
            return;
        }
        if let Some(parent) = self.ctx.registry().get(old.handle) {
            if let Err(e) = close_image(parent).await {
                warn!("Failed to close detached parent {}: {e}", old.spec);
            }
        }
    }

    /// Mark this handle stale and tell every other handle on the image
    pub(crate) async fn notify_update(&self) {
        self.update_seq.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.ctx.store().notify(self.pool, &self.header_oid).await {
            warn!("Failed to notify watchers of {}: {e}", self.name());
        }
    }

    /// Bind the handle to a snapshot, or back to the head with `None`
    pub async fn snap_set(&self, name: Option<&str>) -> Result<()> {
        self.refresh_if_required().await?;
        let _gate = self.refresh_gate.lock().await;
        let md = self.metadata();
        let target = name.map_or(SnapTarget::Head, |n| SnapTarget::Name(n.to_string()));
        let snap = resolve_snap(&md, &target)?;

        let wanted = md.parent_at(snap)?.map(|p| p.spec.clone());
        let new_link = self.resolve_parent(wanted.as_ref()).await?;
        let old_link = {
            let mut current = self.snap.write();
            let mut parent = self.parent.write();
            *current = snap;
            std::mem::replace(&mut *parent, new_link.clone())
        };
        self.drop_old_parent(old_link, new_link.as_ref()).await;
        info!("Handle {} on {} now at {snap}", self.handle_id, self.name());
        Ok(())
    }

    // ---- Header projections ----

    pub async fn get_size(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        self.metadata().size_at(self.snap_id())
    }

    pub async fn get_features(&self) -> Result<Features> {
        self.refresh_if_required().await?;
        Ok(self.metadata().features)
    }

    pub async fn get_overlap(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        self.metadata().overlap_at(self.snap_id())
    }

    pub async fn get_flags(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        Ok(self.metadata().flags)
    }

    pub async fn get_old_format(&self) -> Result<bool> {
        self.refresh_if_required().await?;
        Ok(self.metadata().old_format)
    }

    pub async fn get_stripe_unit(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        Ok(self.metadata().layout.stripe_unit())
    }

    pub async fn get_stripe_count(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        Ok(self.metadata().layout.stripe_count())
    }

    /// Parent at the bound revision; not found for a non-clone
    pub async fn get_parent_info(&self) -> Result<ParentImageInfo> {
        self.refresh_if_required().await?;
        let md = self.metadata();
        let snap = self.snap_id();
        let parent = md
            .parent_at(snap)?
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("parent of {}", self.name())))?;
        let overlap = md.overlap_at(snap)?;

        let store = self.ctx.store();
        let pool_name = store
            .pool_list()
            .await?
            .into_iter()
            .find(|(id, _)| *id == parent.spec.pool)
            .map(|(_, name)| name)
            .ok_or(Error::PoolNotFound(parent.spec.pool))?;

        let (image_name, snap_name) = match self.parent() {
            Some(handle) => {
                let snap_name = handle
                    .metadata()
                    .snap(parent.spec.snap_id)
                    .map(|s| s.name.clone())?;
                (handle.name(), snap_name)
            }
            None => {
                let header = store.header_get(parent.spec.pool, &parent.spec.image_id).await?;
                let snap_name = header
                    .snaps
                    .get(&parent.spec.snap_id)
                    .map(|s| s.name.clone())
                    .ok_or_else(|| Error::SnapshotNotFound(parent.spec.snap_id.to_string()))?;
                let image_name = store
                    .dir_get_name(parent.spec.pool, &parent.spec.image_id)
                    .await?;
                (image_name, snap_name)
            }
        };

        Ok(ParentImageInfo {
            pool: parent.spec.pool,
            pool_name,
            image_id: parent.spec.image_id,
            image_name,
            snap_id: parent.spec.snap_id,
            snap_name,
            overlap,
        })
    }
}
