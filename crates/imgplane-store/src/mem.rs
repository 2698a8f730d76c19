//! In-process cluster implementing the metadata store contract.
//!
//! A [`Cluster`] holds every pool; each [`MemStore`] is one connected
//! client with its own instance id and address, so lock ownership and
//! blacklisting behave as they would across separate processes. When opened
//! from a file, every mutated pool is written through to redb.

use crate::client::{MetadataStore, UpdateWatcher};
use crate::fault::FaultInjector;
use crate::persist::ClusterDb;
use crate::types::{
    ClusterMeta, ImageHeader, JournalRecord, LockRecord, NewImage, PoolState, StoredObject,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use imgplane_common::{
    Error, Features, LockInfo, LockMode, Locker, MirrorImageRecord, MirrorMode, MirrorPeer,
    MirrorSiteStatus, ParentInfo, ParentSpec, PoolId, ProtectionState, Result, SnapContext,
    SnapId, SnapInfo, SnapshotNamespace, TagOwner,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Blacklist expiry when the caller passes 0
const DEFAULT_BLACKLIST_SECONDS: i64 = 3600;

struct WatchEntry {
    handle: u64,
    address: String,
    watcher: Arc<dyn UpdateWatcher>,
}

/// Shared state of a simulated cluster
pub struct Cluster {
    pools: Mutex<BTreeMap<PoolId, PoolState>>,
    meta: Mutex<ClusterMeta>,
    watchers: Mutex<BTreeMap<(PoolId, String), Vec<WatchEntry>>>,
    next_watch: AtomicU64,
    faults: FaultInjector,
    db: Option<ClusterDb>,
}

impl Cluster {
    /// Empty, memory-only cluster
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(BTreeMap::new()),
            meta: Mutex::new(ClusterMeta {
                next_pool_id: 1,
                next_instance_id: 4100,
                blacklist: BTreeMap::new(),
            }),
            watchers: Mutex::new(BTreeMap::new()),
            next_watch: AtomicU64::new(1),
            faults: FaultInjector::default(),
            db: None,
        })
    }

    /// Cluster persisted in a redb file, loading any existing state
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let db = ClusterDb::open(path)?;
        let pools = db.load_pools()?;
        let meta = db.load_meta()?.unwrap_or(ClusterMeta {
            next_pool_id: 1,
            next_instance_id: 4100,
            blacklist: BTreeMap::new(),
        });
        info!("Loaded cluster with {} pools", pools.len());
        Ok(Arc::new(Self {
            pools: Mutex::new(pools),
            meta: Mutex::new(meta),
            watchers: Mutex::new(BTreeMap::new()),
            next_watch: AtomicU64::new(1),
            faults: FaultInjector::default(),
            db: Some(db),
        }))
    }

    /// Connect a new client with a fresh instance id
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> MemStore {
        let instance_id = {
            let mut meta = self.meta.lock();
            meta.next_instance_id += 1;
            if let Some(db) = &self.db {
                db.put_meta(&meta);
            }
            meta.next_instance_id
        };
        MemStore {
            cluster: Arc::clone(self),
            instance_id,
            address: format!("127.0.0.1:0/{instance_id}"),
        }
    }

    pub fn create_pool(&self, name: &str) -> Result<PoolId> {
        self.add_pool(name, None)
    }

    /// Create a cache-tier pool fronting `base`
    pub fn create_cache_tier(&self, name: &str, base: PoolId) -> Result<PoolId> {
        if !self.pools.lock().contains_key(&base) {
            return Err(Error::PoolNotFound(base));
        }
        self.add_pool(name, Some(base))
    }

    fn add_pool(&self, name: &str, base: Option<PoolId>) -> Result<PoolId> {
        let mut pools = self.pools.lock();
        if pools.values().any(|p| p.name == name) {
            return Err(Error::AlreadyExists(format!("pool {name}")));
        }
        let id = {
            let mut meta = self.meta.lock();
            let id = meta.next_pool_id;
            meta.next_pool_id += 1;
            if let Some(db) = &self.db {
                db.put_meta(&meta);
            }
            id
        };
        let pool = PoolState {
            name: name.to_string(),
            base_tier: base.unwrap_or(id),
            ..PoolState::default()
        };
        if let Some(db) = &self.db {
            db.put_pool(id, &pool);
        }
        pools.insert(id, pool);
        info!("Created pool '{name}' with id {id}");
        Ok(id)
    }

    pub fn remove_pool(&self, id: PoolId) -> Result<()> {
        if self.pools.lock().remove(&id).is_none() {
            return Err(Error::PoolNotFound(id));
        }
        if let Some(db) = &self.db {
            db.delete_pool(id);
        }
        Ok(())
    }

    /// Fail the `nth` (1-based) next call of store operation `op`
    pub fn inject_fault(&self, op: &str, nth: u64, error: Error) {
        self.faults.inject(op, nth, error);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Number of calls made to `op` since the last reset
    #[must_use]
    pub fn op_calls(&self, op: &str) -> u64 {
        self.faults.calls(op)
    }

    pub fn reset_op_calls(&self) {
        self.faults.reset_calls();
    }

    fn with_pool<R>(&self, pool: PoolId, f: impl FnOnce(&PoolState) -> Result<R>) -> Result<R> {
        let pools = self.pools.lock();
        let state = pools.get(&pool).ok_or(Error::PoolNotFound(pool))?;
        f(state)
    }

    fn mutate_pool<R>(
        &self,
        pool: PoolId,
        f: impl FnOnce(&mut PoolState) -> Result<R>,
    ) -> Result<R> {
        let mut pools = self.pools.lock();
        let state = pools.get_mut(&pool).ok_or(Error::PoolNotFound(pool))?;
        let out = f(state)?;
        if let Some(db) = &self.db {
            db.put_pool(pool, state);
        }
        Ok(out)
    }

    fn is_blacklisted(&self, address: &str) -> bool {
        self.meta
            .lock()
            .blacklist
            .get(address)
            .is_some_and(|expiry| *expiry > Utc::now())
    }
}

/// One connected client of a [`Cluster`]
pub struct MemStore {
    cluster: Arc<Cluster>,
    instance_id: u64,
    address: String,
}

impl MemStore {
    #[must_use]
    pub const fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    async fn enter(&self, op: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.cluster.faults.check(op)?;
        if self.cluster.is_blacklisted(&self.address) {
            return Err(Error::Blacklisted);
        }
        Ok(())
    }

    fn me(&self, cookie: &str) -> Locker {
        Locker {
            client: self.client_name(),
            cookie: cookie.to_string(),
            address: self.address.clone(),
        }
    }
}

fn header_mut<'a>(state: &'a mut PoolState, image_id: &str) -> Result<&'a mut ImageHeader> {
    state
        .headers
        .get_mut(image_id)
        .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))
}

fn header_ref<'a>(state: &'a PoolState, image_id: &str) -> Result<&'a ImageHeader> {
    state
        .headers
        .get(image_id)
        .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))
}

fn snap_mut(header: &mut ImageHeader, snap: SnapId) -> Result<&mut SnapInfo> {
    header
        .snaps
        .get_mut(&snap)
        .ok_or_else(|| Error::SnapshotNotFound(snap.to_string()))
}

/// Preserve the head for snapshots taken since the object was last cloned
fn copy_on_write(obj: &mut StoredObject, snapc: &SnapContext) {
    if snapc.seq > obj.seq {
        if snapc.snaps.iter().any(|s| s.0 > obj.seq) {
            obj.clones.insert(snapc.seq, obj.head.clone());
        }
        obj.seq = snapc.seq;
    }
}

fn page_after<V: Clone>(
    map: &BTreeMap<String, V>,
    start_after: &str,
    max: usize,
) -> Vec<(String, V)> {
    map.range::<str, _>((Bound::Excluded(start_after), Bound::Unbounded))
        .take(max)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait]
impl MetadataStore for MemStore {
    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn client_name(&self) -> String {
        format!("client.{}", self.instance_id)
    }

    fn client_address(&self) -> String {
        self.address.clone()
    }

    // ── Pools ──

    async fn pool_list(&self) -> Result<Vec<(PoolId, String)>> {
        self.enter("pool_list").await?;
        Ok(self
            .cluster
            .pools
            .lock()
            .iter()
            .map(|(id, p)| (*id, p.name.clone()))
            .collect())
    }

    async fn pool_lookup(&self, name: &str) -> Result<PoolId> {
        self.enter("pool_lookup").await?;
        self.cluster
            .pools
            .lock()
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::NotFound(format!("pool {name}")))
    }

    async fn pool_base_tier(&self, pool: PoolId) -> Result<PoolId> {
        self.enter("pool_base_tier").await?;
        self.cluster.with_pool(pool, |p| Ok(p.base_tier))
    }

    // ── Image directory ──

    async fn dir_add(&self, pool: PoolId, name: &str, image_id: &str) -> Result<()> {
        self.enter("dir_add").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.directory.contains_key(name) {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            p.directory.insert(name.to_string(), image_id.to_string());
            Ok(())
        })
    }

    async fn dir_remove(&self, pool: PoolId, name: &str, image_id: &str) -> Result<()> {
        self.enter("dir_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.directory.get(name).map(String::as_str) != Some(image_id) {
                return Err(Error::ImageNotFound(name.to_string()));
            }
            p.directory.remove(name);
            Ok(())
        })
    }

    async fn dir_rename(&self, pool: PoolId, src: &str, dst: &str, image_id: &str) -> Result<()> {
        self.enter("dir_rename").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.directory.get(src).map(String::as_str) != Some(image_id) {
                return Err(Error::ImageNotFound(src.to_string()));
            }
            if p.directory.contains_key(dst) {
                return Err(Error::AlreadyExists(dst.to_string()));
            }
            p.directory.remove(src);
            p.directory.insert(dst.to_string(), image_id.to_string());
            Ok(())
        })
    }

    async fn dir_get_id(&self, pool: PoolId, name: &str) -> Result<String> {
        self.enter("dir_get_id").await?;
        self.cluster.with_pool(pool, |p| {
            p.directory
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ImageNotFound(name.to_string()))
        })
    }

    async fn dir_get_name(&self, pool: PoolId, image_id: &str) -> Result<String> {
        self.enter("dir_get_name").await?;
        self.cluster.with_pool(pool, |p| {
            p.directory
                .iter()
                .find(|(_, id)| id.as_str() == image_id)
                .map(|(name, _)| name.clone())
                .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))
        })
    }

    async fn dir_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>> {
        self.enter("dir_list").await?;
        self.cluster
            .with_pool(pool, |p| Ok(page_after(&p.directory, start_after, max)))
    }

    // ── Image header ──

    async fn header_create(&self, pool: PoolId, image_id: &str, image: &NewImage) -> Result<()> {
        self.enter("header_create").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.headers.contains_key(image_id) {
                return Err(Error::AlreadyExists(format!("header {image_id}")));
            }
            p.headers
                .insert(image_id.to_string(), ImageHeader::new(image));
            Ok(())
        })
    }

    async fn header_get(&self, pool: PoolId, image_id: &str) -> Result<ImageHeader> {
        self.enter("header_get").await?;
        self.cluster
            .with_pool(pool, |p| header_ref(p, image_id).cloned())
    }

    async fn header_remove(&self, pool: PoolId, image_id: &str) -> Result<()> {
        self.enter("header_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.headers
                .remove(image_id)
                .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))?;
            p.metadata.remove(image_id);
            p.locks.remove(&crate::types::header_oid(image_id));
            Ok(())
        })
    }

    async fn header_set_size(&self, pool: PoolId, image_id: &str, size: u64) -> Result<()> {
        self.enter("header_set_size").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            header.size = size;
            if let Some(parent) = header.parent.as_mut() {
                parent.overlap = parent.overlap.min(size);
            }
            Ok(())
        })
    }

    async fn header_set_parent(
        &self,
        pool: PoolId,
        image_id: &str,
        parent: &ParentInfo,
    ) -> Result<()> {
        self.enter("header_set_parent").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.parent.is_some() {
                return Err(Error::AlreadyExists(format!("parent of {image_id}")));
            }
            header.parent = Some(parent.clone());
            Ok(())
        })
    }

    async fn header_remove_parent(
        &self,
        pool: PoolId,
        image_id: &str,
        include_snaps: bool,
    ) -> Result<()> {
        self.enter("header_remove_parent").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.parent.take().is_none() {
                return Err(Error::NotFound(format!("parent of {image_id}")));
            }
            if include_snaps {
                for snap in header.snaps.values_mut() {
                    snap.parent = None;
                }
            }
            Ok(())
        })
    }

    async fn header_set_features(
        &self,
        pool: PoolId,
        image_id: &str,
        features: Features,
        mask: Features,
    ) -> Result<()> {
        self.enter("header_set_features").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.old_format {
                return Err(Error::not_supported("features on old format image"));
            }
            let selected = Features::from_bits_retain(features.bits() & mask.bits());
            header.features = header.features.difference(mask).union(selected);
            Ok(())
        })
    }

    // ── Snapshots ──

    async fn snap_add(
        &self,
        pool: PoolId,
        image_id: &str,
        name: &str,
        namespace: SnapshotNamespace,
    ) -> Result<SnapId> {
        self.enter("snap_add").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.snap_by_name(name).is_some() {
                return Err(Error::AlreadyExists(format!("snapshot {name}")));
            }
            if let Some(limit) = header.snap_limit {
                if header.snaps.len() as u64 >= limit {
                    return Err(Error::SnapshotLimit { limit });
                }
            }
            header.snap_seq += 1;
            let id = SnapId(header.snap_seq);
            header.snaps.insert(
                id,
                SnapInfo {
                    id,
                    name: name.to_string(),
                    size: header.size,
                    namespace,
                    protection: ProtectionState::Unprotected,
                    parent: header.parent.clone(),
                    created_at: Utc::now(),
                },
            );
            Ok(id)
        })
    }

    async fn snap_remove(&self, pool: PoolId, image_id: &str, snap: SnapId) -> Result<()> {
        self.enter("snap_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            let info = snap_mut(header, snap)?;
            if info.protection != ProtectionState::Unprotected {
                return Err(Error::busy(format!("snapshot {} is {}", info.name, info.protection)));
            }
            header.snaps.remove(&snap);
            Ok(())
        })
    }

    async fn snap_rename(
        &self,
        pool: PoolId,
        image_id: &str,
        snap: SnapId,
        name: &str,
    ) -> Result<()> {
        self.enter("snap_rename").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.snap_by_name(name).is_some() {
                return Err(Error::AlreadyExists(format!("snapshot {name}")));
            }
            snap_mut(header, snap)?.name = name.to_string();
            Ok(())
        })
    }

    async fn snap_get_protection(
        &self,
        pool: PoolId,
        image_id: &str,
        snap: SnapId,
    ) -> Result<ProtectionState> {
        self.enter("snap_get_protection").await?;
        self.cluster.with_pool(pool, |p| {
            let header = header_ref(p, image_id)?;
            if header.old_format {
                return Err(Error::not_supported("protection on old format image"));
            }
            header
                .snaps
                .get(&snap)
                .map(|s| s.protection)
                .ok_or_else(|| Error::SnapshotNotFound(snap.to_string()))
        })
    }

    async fn snap_set_protection(
        &self,
        pool: PoolId,
        image_id: &str,
        snap: SnapId,
        state: ProtectionState,
    ) -> Result<()> {
        self.enter("snap_set_protection").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.old_format {
                return Err(Error::not_supported("protection on old format image"));
            }
            snap_mut(header, snap)?.protection = state;
            Ok(())
        })
    }

    async fn snap_limit_get(&self, pool: PoolId, image_id: &str) -> Result<Option<u64>> {
        self.enter("snap_limit_get").await?;
        self.cluster.with_pool(pool, |p| {
            let header = header_ref(p, image_id)?;
            if header.old_format {
                return Err(Error::not_supported("snapshot limit on old format image"));
            }
            Ok(header.snap_limit)
        })
    }

    async fn snap_limit_set(
        &self,
        pool: PoolId,
        image_id: &str,
        limit: Option<u64>,
    ) -> Result<()> {
        self.enter("snap_limit_set").await?;
        self.cluster.mutate_pool(pool, |p| {
            let header = header_mut(p, image_id)?;
            if header.old_format {
                return Err(Error::not_supported("snapshot limit on old format image"));
            }
            if let Some(limit) = limit {
                if (header.snaps.len() as u64) > limit {
                    return Err(Error::invalid_argument(format!(
                        "limit {limit} below existing snapshot count {}",
                        header.snaps.len()
                    )));
                }
            }
            header.snap_limit = limit;
            Ok(())
        })
    }

    // ── Data objects ──

    async fn object_read(
        &self,
        pool: PoolId,
        oid: &str,
        snap: SnapId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        self.enter("object_read").await?;
        self.cluster.with_pool(pool, |p| {
            let obj = p
                .objects
                .get(oid)
                .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
            let data = if snap.is_head() {
                &obj.head
            } else {
                obj.clones
                    .range(snap.0..)
                    .next()
                    .map_or(&obj.head, |(_, v)| v)
            };
            let data = data
                .as_ref()
                .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
            let end = usize::try_from(offset.saturating_add(len))
                .unwrap_or(usize::MAX)
                .min(data.len());
            Ok(data[start..end].to_vec())
        })
    }

    async fn object_write(
        &self,
        pool: PoolId,
        oid: &str,
        snapc: &SnapContext,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.enter("object_write").await?;
        let start = usize::try_from(offset).map_err(|e| Error::invalid_argument(e.to_string()))?;
        self.cluster.mutate_pool(pool, |p| {
            let obj = p.objects.entry(oid.to_string()).or_default();
            copy_on_write(obj, snapc);
            let head = obj.head.get_or_insert_with(Vec::new);
            let end = start + data.len();
            if head.len() < end {
                head.resize(end, 0);
            }
            head[start..end].copy_from_slice(data);
            Ok(())
        })
    }

    async fn object_stat(&self, pool: PoolId, oid: &str, snap: SnapId) -> Result<u64> {
        let data = self.object_read(pool, oid, snap, 0, u64::MAX).await?;
        Ok(data.len() as u64)
    }

    async fn object_remove(&self, pool: PoolId, oid: &str, snapc: &SnapContext) -> Result<()> {
        self.enter("object_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            let obj = p
                .objects
                .get_mut(oid)
                .filter(|o| o.head.is_some())
                .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
            copy_on_write(obj, snapc);
            obj.head = None;
            if obj.clones.is_empty() {
                p.objects.remove(oid);
            }
            Ok(())
        })
    }

    async fn object_truncate(
        &self,
        pool: PoolId,
        oid: &str,
        snapc: &SnapContext,
        size: u64,
    ) -> Result<()> {
        self.enter("object_truncate").await?;
        let size = usize::try_from(size).map_err(|e| Error::invalid_argument(e.to_string()))?;
        self.cluster.mutate_pool(pool, |p| {
            let obj = p.objects.entry(oid.to_string()).or_default();
            copy_on_write(obj, snapc);
            obj.head.get_or_insert_with(Vec::new).resize(size, 0);
            Ok(())
        })
    }

    async fn object_delete(&self, pool: PoolId, oid: &str) -> Result<()> {
        self.enter("object_delete").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.objects
                .remove(oid)
                .map(|_| ())
                .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))
        })
    }

    async fn object_list(&self, pool: PoolId, prefix: &str) -> Result<Vec<String>> {
        self.enter("object_list").await?;
        self.cluster.with_pool(pool, |p| {
            Ok(p.objects
                .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect())
        })
    }

    // ── Children index ──

    async fn children_add(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child_id: &str,
    ) -> Result<()> {
        self.enter("children_add").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.children
                .entry(parent.clone())
                .or_default()
                .insert(child_id.to_string());
            Ok(())
        })
    }

    async fn children_remove(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child_id: &str,
    ) -> Result<()> {
        self.enter("children_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            let children = p
                .children
                .get_mut(parent)
                .filter(|c| c.contains(child_id))
                .ok_or_else(|| Error::NotFound(format!("child {child_id} of {parent}")))?;
            children.remove(child_id);
            if children.is_empty() {
                p.children.remove(parent);
            }
            Ok(())
        })
    }

    async fn children_list(&self, pool: PoolId, parent: &ParentSpec) -> Result<Vec<String>> {
        self.enter("children_list").await?;
        self.cluster.with_pool(pool, |p| {
            Ok(p.children
                .get(parent)
                .map(|c| c.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    // ── Object map ──

    async fn object_map_create(&self, pool: PoolId, image_id: &str) -> Result<()> {
        self.enter("object_map_create").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.object_maps.insert(image_id.to_string(), BTreeSet::new());
            Ok(())
        })
    }

    async fn object_map_load(&self, pool: PoolId, image_id: &str) -> Result<BTreeSet<u64>> {
        self.enter("object_map_load").await?;
        self.cluster.with_pool(pool, |p| {
            p.object_maps
                .get(image_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("object map of {image_id}")))
        })
    }

    async fn object_map_mark(&self, pool: PoolId, image_id: &str, objno: u64) -> Result<()> {
        self.enter("object_map_mark").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.object_maps
                .get_mut(image_id)
                .ok_or_else(|| Error::NotFound(format!("object map of {image_id}")))?
                .insert(objno);
            Ok(())
        })
    }

    async fn object_map_remove(&self, pool: PoolId, image_id: &str) -> Result<()> {
        self.enter("object_map_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.object_maps
                .remove(image_id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("object map of {image_id}")))
        })
    }

    // ── Header locks ──

    async fn lock_acquire(
        &self,
        pool: PoolId,
        oid: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()> {
        self.enter("lock_acquire").await?;
        let me = self.me(cookie);
        self.cluster.mutate_pool(pool, |p| {
            if let Some(record) = p.locks.get_mut(oid).filter(|r| !r.holders.is_empty()) {
                if record
                    .holders
                    .iter()
                    .any(|h| h.client == me.client && h.cookie == me.cookie)
                {
                    return Err(Error::AlreadyExists(format!("lock on {oid}")));
                }
                if record.exclusive || mode == LockMode::Exclusive {
                    return Err(Error::busy(format!("{oid} locked by {}", record.holders[0])));
                }
                if record.tag != tag {
                    return Err(Error::busy(format!("{oid} locked with another tag")));
                }
                record.holders.push(me);
                return Ok(());
            }
            p.locks.insert(
                oid.to_string(),
                LockRecord {
                    exclusive: mode == LockMode::Exclusive,
                    tag: tag.to_string(),
                    holders: vec![me],
                },
            );
            Ok(())
        })
    }

    async fn lock_release(&self, pool: PoolId, oid: &str, cookie: &str) -> Result<()> {
        self.enter("lock_release").await?;
        let client = self.client_name();
        self.cluster
            .mutate_pool(pool, |p| remove_holder(p, oid, &client, cookie))
    }

    async fn lock_info(&self, pool: PoolId, oid: &str) -> Result<LockInfo> {
        self.enter("lock_info").await?;
        self.cluster.with_pool(pool, |p| {
            Ok(p.locks
                .get(oid)
                .map(|r| LockInfo {
                    lockers: r.holders.clone(),
                    exclusive: r.exclusive,
                    tag: r.tag.clone(),
                })
                .unwrap_or_default())
        })
    }

    async fn lock_break(
        &self,
        pool: PoolId,
        oid: &str,
        client: &str,
        cookie: &str,
    ) -> Result<()> {
        self.enter("lock_break").await?;
        self.cluster
            .mutate_pool(pool, |p| remove_holder(p, oid, client, cookie))
    }

    async fn lock_assert(
        &self,
        pool: PoolId,
        oid: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()> {
        self.enter("lock_assert").await?;
        let client = self.client_name();
        self.cluster.with_pool(pool, |p| {
            let held = p.locks.get(oid).is_some_and(|r| {
                r.exclusive == (mode == LockMode::Exclusive)
                    && r.tag == tag
                    && r.holders
                        .iter()
                        .any(|h| h.client == client && h.cookie == cookie)
            });
            if held {
                Ok(())
            } else {
                Err(Error::busy(format!("lock on {oid} not held")))
            }
        })
    }

    async fn blacklist_add(&self, address: &str, expire_seconds: u64) -> Result<()> {
        self.enter("blacklist_add").await?;
        let seconds = match i64::try_from(expire_seconds) {
            Ok(0) | Err(_) => DEFAULT_BLACKLIST_SECONDS,
            Ok(s) => s,
        };
        {
            let mut meta = self.cluster.meta.lock();
            meta.blacklist
                .insert(address.to_string(), Utc::now() + Duration::seconds(seconds));
            if let Some(db) = &self.cluster.db {
                db.put_meta(&meta);
            }
        }
        // A blacklisted client's watches are torn down with its session
        for entries in self.cluster.watchers.lock().values_mut() {
            entries.retain(|w| w.address != address);
        }
        info!("Blacklisted {address} for {seconds}s");
        Ok(())
    }

    // ── Watch/notify ──

    async fn watch(
        &self,
        pool: PoolId,
        oid: &str,
        watcher: Arc<dyn UpdateWatcher>,
    ) -> Result<u64> {
        self.enter("watch").await?;
        self.cluster.with_pool(pool, |_| Ok(()))?;
        let handle = self.cluster.next_watch.fetch_add(1, Ordering::Relaxed);
        self.cluster
            .watchers
            .lock()
            .entry((pool, oid.to_string()))
            .or_default()
            .push(WatchEntry {
                handle,
                address: self.address.clone(),
                watcher,
            });
        debug!("Watch {handle} registered on {pool}/{oid}");
        Ok(handle)
    }

    async fn unwatch(&self, pool: PoolId, oid: &str, handle: u64) -> Result<()> {
        self.enter("unwatch").await?;
        let mut watchers = self.cluster.watchers.lock();
        let key = (pool, oid.to_string());
        let entries = watchers
            .get_mut(&key)
            .filter(|e| e.iter().any(|w| w.handle == handle))
            .ok_or_else(|| Error::NotFound(format!("watch {handle} on {oid}")))?;
        entries.retain(|w| w.handle != handle);
        if entries.is_empty() {
            watchers.remove(&key);
        }
        Ok(())
    }

    async fn notify(&self, pool: PoolId, oid: &str) -> Result<()> {
        self.enter("notify").await?;
        let targets: Vec<Arc<dyn UpdateWatcher>> = self
            .cluster
            .watchers
            .lock()
            .get(&(pool, oid.to_string()))
            .map(|e| e.iter().map(|w| Arc::clone(&w.watcher)).collect())
            .unwrap_or_default();
        for watcher in targets {
            watcher.handle_update();
        }
        Ok(())
    }

    async fn list_watchers(&self, pool: PoolId, oid: &str) -> Result<Vec<String>> {
        self.enter("list_watchers").await?;
        Ok(self
            .cluster
            .watchers
            .lock()
            .get(&(pool, oid.to_string()))
            .map(|e| e.iter().map(|w| w.address.clone()).collect())
            .unwrap_or_default())
    }

    // ── User metadata ──

    async fn metadata_get(&self, pool: PoolId, image_id: &str, key: &str) -> Result<String> {
        self.enter("metadata_get").await?;
        self.cluster.with_pool(pool, |p| {
            header_ref(p, image_id)?;
            p.metadata
                .get(image_id)
                .and_then(|m| m.get(key))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("metadata key {key}")))
        })
    }

    async fn metadata_set(
        &self,
        pool: PoolId,
        image_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.enter("metadata_set").await?;
        self.cluster.mutate_pool(pool, |p| {
            header_ref(p, image_id)?;
            p.metadata
                .entry(image_id.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn metadata_remove(&self, pool: PoolId, image_id: &str, key: &str) -> Result<()> {
        self.enter("metadata_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.metadata
                .get_mut(image_id)
                .and_then(|m| m.remove(key))
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("metadata key {key}")))
        })
    }

    async fn metadata_list(
        &self,
        pool: PoolId,
        image_id: &str,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>> {
        self.enter("metadata_list").await?;
        self.cluster.with_pool(pool, |p| {
            header_ref(p, image_id)?;
            Ok(p.metadata
                .get(image_id)
                .map(|m| page_after(m, start_after, max))
                .unwrap_or_default())
        })
    }

    // ── Mirroring ──

    async fn mirror_mode_get(&self, pool: PoolId) -> Result<MirrorMode> {
        self.enter("mirror_mode_get").await?;
        self.cluster.with_pool(pool, |p| Ok(p.mirror.mode))
    }

    async fn mirror_mode_set(&self, pool: PoolId, mode: MirrorMode) -> Result<()> {
        self.enter("mirror_mode_set").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.mirror.mode = mode;
            Ok(())
        })
    }

    async fn mirror_uuid_get(&self, pool: PoolId) -> Result<String> {
        self.enter("mirror_uuid_get").await?;
        self.cluster.with_pool(pool, |p| {
            p.mirror
                .uuid
                .clone()
                .ok_or_else(|| Error::NotFound("mirror uuid".into()))
        })
    }

    async fn mirror_uuid_set(&self, pool: PoolId, uuid: &str) -> Result<()> {
        self.enter("mirror_uuid_set").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.mirror.uuid.is_some() {
                return Err(Error::AlreadyExists("mirror uuid".into()));
            }
            p.mirror.uuid = Some(uuid.to_string());
            Ok(())
        })
    }

    async fn mirror_peer_list(&self, pool: PoolId) -> Result<Vec<MirrorPeer>> {
        self.enter("mirror_peer_list").await?;
        self.cluster.with_pool(pool, |p| Ok(p.mirror.peers.clone()))
    }

    async fn mirror_peer_add(&self, pool: PoolId, peer: &MirrorPeer) -> Result<()> {
        self.enter("mirror_peer_add").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.mirror.peers.iter().any(|x| x.uuid == peer.uuid) {
                return Err(Error::lost_race(format!("peer uuid {} in use", peer.uuid)));
            }
            if p.mirror
                .peers
                .iter()
                .any(|x| x.cluster_name == peer.cluster_name && x.client_name == peer.client_name)
            {
                return Err(Error::AlreadyExists(format!(
                    "peer {}/{}",
                    peer.cluster_name, peer.client_name
                )));
            }
            p.mirror.peers.push(peer.clone());
            Ok(())
        })
    }

    async fn mirror_peer_remove(&self, pool: PoolId, uuid: &str) -> Result<()> {
        self.enter("mirror_peer_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            let before = p.mirror.peers.len();
            p.mirror.peers.retain(|x| x.uuid != uuid);
            if p.mirror.peers.len() == before {
                return Err(Error::PeerNotFound(uuid.to_string()));
            }
            Ok(())
        })
    }

    async fn mirror_peer_set_client(&self, pool: PoolId, uuid: &str, client: &str) -> Result<()> {
        self.enter("mirror_peer_set_client").await?;
        self.cluster.mutate_pool(pool, |p| {
            let peer = p
                .mirror
                .peers
                .iter_mut()
                .find(|x| x.uuid == uuid)
                .ok_or_else(|| Error::PeerNotFound(uuid.to_string()))?;
            peer.client_name = client.to_string();
            Ok(())
        })
    }

    async fn mirror_peer_set_cluster(
        &self,
        pool: PoolId,
        uuid: &str,
        cluster: &str,
    ) -> Result<()> {
        self.enter("mirror_peer_set_cluster").await?;
        self.cluster.mutate_pool(pool, |p| {
            let peer = p
                .mirror
                .peers
                .iter_mut()
                .find(|x| x.uuid == uuid)
                .ok_or_else(|| Error::PeerNotFound(uuid.to_string()))?;
            peer.cluster_name = cluster.to_string();
            Ok(())
        })
    }

    async fn mirror_image_get(&self, pool: PoolId, image_id: &str) -> Result<MirrorImageRecord> {
        self.enter("mirror_image_get").await?;
        self.cluster.with_pool(pool, |p| {
            p.mirror
                .images
                .get(image_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("mirror record of {image_id}")))
        })
    }

    async fn mirror_image_set(
        &self,
        pool: PoolId,
        image_id: &str,
        record: &MirrorImageRecord,
    ) -> Result<()> {
        self.enter("mirror_image_set").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.mirror.images.iter().any(|(id, r)| {
                id != image_id && r.global_image_id == record.global_image_id
            }) {
                return Err(Error::AlreadyExists(format!(
                    "global image id {}",
                    record.global_image_id
                )));
            }
            p.mirror
                .images
                .insert(image_id.to_string(), record.clone());
            Ok(())
        })
    }

    async fn mirror_image_remove(&self, pool: PoolId, image_id: &str) -> Result<()> {
        self.enter("mirror_image_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.mirror
                .images
                .remove(image_id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("mirror record of {image_id}")))
        })
    }

    async fn mirror_image_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>> {
        self.enter("mirror_image_list").await?;
        self.cluster.with_pool(pool, |p| {
            Ok(page_after(&p.mirror.images, start_after, max)
                .into_iter()
                .map(|(id, r)| (id, r.global_image_id))
                .collect())
        })
    }

    async fn mirror_status_get(&self, pool: PoolId, global_id: &str) -> Result<MirrorSiteStatus> {
        self.enter("mirror_status_get").await?;
        self.cluster.with_pool(pool, |p| {
            p.mirror
                .statuses
                .get(global_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("mirror status of {global_id}")))
        })
    }

    async fn mirror_status_set(
        &self,
        pool: PoolId,
        global_id: &str,
        status: &MirrorSiteStatus,
    ) -> Result<()> {
        self.enter("mirror_status_set").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.mirror
                .statuses
                .insert(global_id.to_string(), status.clone());
            Ok(())
        })
    }

    async fn mirror_status_remove(&self, pool: PoolId, global_id: &str) -> Result<()> {
        self.enter("mirror_status_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.mirror
                .statuses
                .remove(global_id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("mirror status of {global_id}")))
        })
    }

    // ── Replication journal ──

    async fn journal_create(&self, pool: PoolId, image_id: &str, owner: &TagOwner) -> Result<()> {
        self.enter("journal_create").await?;
        self.cluster.mutate_pool(pool, |p| {
            if p.journals.contains_key(image_id) {
                return Err(Error::AlreadyExists(format!("journal of {image_id}")));
            }
            p.journals.insert(
                image_id.to_string(),
                JournalRecord {
                    tags: vec![owner.clone()],
                    resync_requested: false,
                },
            );
            Ok(())
        })
    }

    async fn journal_remove(&self, pool: PoolId, image_id: &str) -> Result<()> {
        self.enter("journal_remove").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.journals
                .remove(image_id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("journal of {image_id}")))
        })
    }

    async fn journal_tag_owner(&self, pool: PoolId, image_id: &str) -> Result<TagOwner> {
        self.enter("journal_tag_owner").await?;
        self.cluster.with_pool(pool, |p| {
            p.journals
                .get(image_id)
                .and_then(|j| j.tags.last())
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("journal of {image_id}")))
        })
    }

    async fn journal_allocate_tag(
        &self,
        pool: PoolId,
        image_id: &str,
        owner: &TagOwner,
    ) -> Result<()> {
        self.enter("journal_allocate_tag").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.journals
                .get_mut(image_id)
                .ok_or_else(|| Error::NotFound(format!("journal of {image_id}")))?
                .tags
                .push(owner.clone());
            Ok(())
        })
    }

    async fn journal_request_resync(&self, pool: PoolId, image_id: &str) -> Result<()> {
        self.enter("journal_request_resync").await?;
        self.cluster.mutate_pool(pool, |p| {
            p.journals
                .get_mut(image_id)
                .ok_or_else(|| Error::NotFound(format!("journal of {image_id}")))?
                .resync_requested = true;
            Ok(())
        })
    }

    async fn journal_resync_requested(&self, pool: PoolId, image_id: &str) -> Result<bool> {
        self.enter("journal_resync_requested").await?;
        self.cluster.with_pool(pool, |p| {
            p.journals
                .get(image_id)
                .map(|j| j.resync_requested)
                .ok_or_else(|| Error::NotFound(format!("journal of {image_id}")))
        })
    }
}

fn remove_holder(p: &mut PoolState, oid: &str, client: &str, cookie: &str) -> Result<()> {
    let record = p
        .locks
        .get_mut(oid)
        .ok_or_else(|| Error::LockNotFound(oid.to_string()))?;
    let pos = record
        .holders
        .iter()
        .position(|h| h.client == client && h.cookie == cookie)
        .ok_or_else(|| Error::LockNotFound(oid.to_string()))?;
    record.holders.remove(pos);
    if record.holders.is_empty() {
        p.locks.remove(oid);
    }
    Ok(())
}
