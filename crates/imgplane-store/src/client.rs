//! Metadata store client contract
//!
//! Every method is one atomic store-side procedure. Multi-step protocols
//! are built on top of these by the image layer; nothing here spans more
//! than one object.

use crate::types::{ImageHeader, NewImage};
use async_trait::async_trait;
use imgplane_common::{
    Features, LockInfo, LockMode, MirrorImageRecord, MirrorMode, MirrorPeer, MirrorSiteStatus,
    ParentInfo, ParentSpec, PoolId, ProtectionState, Result, SnapContext, SnapId,
    SnapshotNamespace, TagOwner,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Callback invoked when a watched header is notified
pub trait UpdateWatcher: Send + Sync {
    fn handle_update(&self);
}

/// Store operations consumed by the image control plane
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ── Client identity ──

    /// Unique per connected client; seeds generated names
    fn instance_id(&self) -> u64;

    /// Entity name, e.g. `client.4123`
    fn client_name(&self) -> String;

    /// Network address used for blacklisting
    fn client_address(&self) -> String;

    // ── Pools ──

    async fn pool_list(&self) -> Result<Vec<(PoolId, String)>>;
    async fn pool_lookup(&self, name: &str) -> Result<PoolId>;
    /// Pool a cache tier fronts; a base pool returns itself
    async fn pool_base_tier(&self, pool: PoolId) -> Result<PoolId>;

    // ── Image directory ──

    async fn dir_add(&self, pool: PoolId, name: &str, image_id: &str) -> Result<()>;
    async fn dir_remove(&self, pool: PoolId, name: &str, image_id: &str) -> Result<()>;
    async fn dir_rename(&self, pool: PoolId, src: &str, dst: &str, image_id: &str) -> Result<()>;
    async fn dir_get_id(&self, pool: PoolId, name: &str) -> Result<String>;
    async fn dir_get_name(&self, pool: PoolId, image_id: &str) -> Result<String>;
    /// Names strictly after `start_after`, at most `max` entries
    async fn dir_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>>;

    // ── Image header ──

    async fn header_create(&self, pool: PoolId, image_id: &str, image: &NewImage) -> Result<()>;
    async fn header_get(&self, pool: PoolId, image_id: &str) -> Result<ImageHeader>;
    async fn header_remove(&self, pool: PoolId, image_id: &str) -> Result<()>;
    async fn header_set_size(&self, pool: PoolId, image_id: &str, size: u64) -> Result<()>;
    async fn header_set_parent(
        &self,
        pool: PoolId,
        image_id: &str,
        parent: &ParentInfo,
    ) -> Result<()>;
    /// Drop the head parent link; `include_snaps` also clears it from snapshots
    async fn header_remove_parent(
        &self,
        pool: PoolId,
        image_id: &str,
        include_snaps: bool,
    ) -> Result<()>;
    /// Set the bits of `features` selected by `mask`
    async fn header_set_features(
        &self,
        pool: PoolId,
        image_id: &str,
        features: Features,
        mask: Features,
    ) -> Result<()>;

    // ── Snapshots ──

    async fn snap_add(
        &self,
        pool: PoolId,
        image_id: &str,
        name: &str,
        namespace: SnapshotNamespace,
    ) -> Result<SnapId>;
    async fn snap_remove(&self, pool: PoolId, image_id: &str, snap: SnapId) -> Result<()>;
    async fn snap_rename(
        &self,
        pool: PoolId,
        image_id: &str,
        snap: SnapId,
        name: &str,
    ) -> Result<()>;
    async fn snap_get_protection(
        &self,
        pool: PoolId,
        image_id: &str,
        snap: SnapId,
    ) -> Result<ProtectionState>;
    async fn snap_set_protection(
        &self,
        pool: PoolId,
        image_id: &str,
        snap: SnapId,
        state: ProtectionState,
    ) -> Result<()>;
    async fn snap_limit_get(&self, pool: PoolId, image_id: &str) -> Result<Option<u64>>;
    async fn snap_limit_set(&self, pool: PoolId, image_id: &str, limit: Option<u64>)
    -> Result<()>;

    // ── Data objects ──

    /// May return fewer than `len` bytes when the object is shorter
    async fn object_read(
        &self,
        pool: PoolId,
        oid: &str,
        snap: SnapId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>>;
    async fn object_write(
        &self,
        pool: PoolId,
        oid: &str,
        snapc: &SnapContext,
        offset: u64,
        data: &[u8],
    ) -> Result<()>;
    async fn object_stat(&self, pool: PoolId, oid: &str, snap: SnapId) -> Result<u64>;
    /// Remove the head, preserving it for snapshots in `snapc`
    async fn object_remove(&self, pool: PoolId, oid: &str, snapc: &SnapContext) -> Result<()>;
    async fn object_truncate(
        &self,
        pool: PoolId,
        oid: &str,
        snapc: &SnapContext,
        size: u64,
    ) -> Result<()>;
    /// Purge the object and every snapshot clone of it
    async fn object_delete(&self, pool: PoolId, oid: &str) -> Result<()>;
    async fn object_list(&self, pool: PoolId, prefix: &str) -> Result<Vec<String>>;

    // ── Children index ──

    /// Idempotent: adding an existing child is a no-op
    async fn children_add(&self, pool: PoolId, parent: &ParentSpec, child_id: &str)
    -> Result<()>;
    async fn children_remove(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child_id: &str,
    ) -> Result<()>;
    async fn children_list(&self, pool: PoolId, parent: &ParentSpec) -> Result<Vec<String>>;

    // ── Object map ──

    async fn object_map_create(&self, pool: PoolId, image_id: &str) -> Result<()>;
    async fn object_map_load(&self, pool: PoolId, image_id: &str) -> Result<BTreeSet<u64>>;
    async fn object_map_mark(&self, pool: PoolId, image_id: &str, objno: u64) -> Result<()>;
    async fn object_map_remove(&self, pool: PoolId, image_id: &str) -> Result<()>;

    // ── Header locks ──

    async fn lock_acquire(
        &self,
        pool: PoolId,
        oid: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()>;
    async fn lock_release(&self, pool: PoolId, oid: &str, cookie: &str) -> Result<()>;
    async fn lock_info(&self, pool: PoolId, oid: &str) -> Result<LockInfo>;
    async fn lock_break(&self, pool: PoolId, oid: &str, client: &str, cookie: &str)
    -> Result<()>;
    /// Fails unless this client still holds the lock
    async fn lock_assert(
        &self,
        pool: PoolId,
        oid: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()>;
    /// 0 seconds uses the store default expiry
    async fn blacklist_add(&self, address: &str, expire_seconds: u64) -> Result<()>;

    // ── Watch/notify ──

    async fn watch(&self, pool: PoolId, oid: &str, watcher: Arc<dyn UpdateWatcher>)
    -> Result<u64>;
    async fn unwatch(&self, pool: PoolId, oid: &str, handle: u64) -> Result<()>;
    async fn notify(&self, pool: PoolId, oid: &str) -> Result<()>;
    /// Addresses of current watchers
    async fn list_watchers(&self, pool: PoolId, oid: &str) -> Result<Vec<String>>;

    // ── User metadata ──

    async fn metadata_get(&self, pool: PoolId, image_id: &str, key: &str) -> Result<String>;
    async fn metadata_set(&self, pool: PoolId, image_id: &str, key: &str, value: &str)
    -> Result<()>;
    async fn metadata_remove(&self, pool: PoolId, image_id: &str, key: &str) -> Result<()>;
    async fn metadata_list(
        &self,
        pool: PoolId,
        image_id: &str,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>>;

    // ── Mirroring ──

    async fn mirror_mode_get(&self, pool: PoolId) -> Result<MirrorMode>;
    async fn mirror_mode_set(&self, pool: PoolId, mode: MirrorMode) -> Result<()>;
    async fn mirror_uuid_get(&self, pool: PoolId) -> Result<String>;
    async fn mirror_uuid_set(&self, pool: PoolId, uuid: &str) -> Result<()>;
    async fn mirror_peer_list(&self, pool: PoolId) -> Result<Vec<MirrorPeer>>;
    /// A duplicate uuid fails as a lost race so the caller can regenerate it
    async fn mirror_peer_add(&self, pool: PoolId, peer: &MirrorPeer) -> Result<()>;
    async fn mirror_peer_remove(&self, pool: PoolId, uuid: &str) -> Result<()>;
    async fn mirror_peer_set_client(&self, pool: PoolId, uuid: &str, client: &str) -> Result<()>;
    async fn mirror_peer_set_cluster(&self, pool: PoolId, uuid: &str, cluster: &str)
    -> Result<()>;
    async fn mirror_image_get(&self, pool: PoolId, image_id: &str) -> Result<MirrorImageRecord>;
    async fn mirror_image_set(
        &self,
        pool: PoolId,
        image_id: &str,
        record: &MirrorImageRecord,
    ) -> Result<()>;
    async fn mirror_image_remove(&self, pool: PoolId, image_id: &str) -> Result<()>;
    /// (image id, global id) pairs after `start_after`
    async fn mirror_image_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>>;
    async fn mirror_status_get(&self, pool: PoolId, global_id: &str) -> Result<MirrorSiteStatus>;
    async fn mirror_status_set(
        &self,
        pool: PoolId,
        global_id: &str,
        status: &MirrorSiteStatus,
    ) -> Result<()>;
    async fn mirror_status_remove(&self, pool: PoolId, global_id: &str) -> Result<()>;

    // ── Replication journal ──

    async fn journal_create(&self, pool: PoolId, image_id: &str, owner: &TagOwner) -> Result<()>;
    async fn journal_remove(&self, pool: PoolId, image_id: &str) -> Result<()>;
    async fn journal_tag_owner(&self, pool: PoolId, image_id: &str) -> Result<TagOwner>;
    async fn journal_allocate_tag(
        &self,
        pool: PoolId,
        image_id: &str,
        owner: &TagOwner,
    ) -> Result<()>;
    async fn journal_request_resync(&self, pool: PoolId, image_id: &str) -> Result<()>;
    async fn journal_resync_requested(&self, pool: PoolId, image_id: &str) -> Result<bool>;
}
