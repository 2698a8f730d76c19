//! Stored types for the metadata store.
//!
//! These types are serialized to redb via bincode when the cluster is
//! persistent. All of them are plain data; the procedures that mutate them
//! live in [`crate::mem`].

use chrono::{DateTime, Utc};
use imgplane_common::{
    Features, Locker, MirrorImageRecord, MirrorMode, MirrorPeer, MirrorSiteStatus, ParentInfo,
    ParentSpec, PoolId, SnapId, SnapInfo, TagOwner,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the header object for an image id
#[must_use]
pub fn header_oid(image_id: &str) -> String {
    format!("rbd_header.{image_id}")
}

/// Prefix shared by an image's data objects
#[must_use]
pub fn data_prefix(image_id: &str) -> String {
    format!("rbd_data.{image_id}")
}

/// Parameters for a new image header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewImage {
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub object_prefix: String,
    pub old_format: bool,
}

/// Image header: the single metadata object per image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub object_prefix: String,
    pub old_format: bool,
    pub flags: u64,
    pub parent: Option<ParentInfo>,
    pub snap_seq: u64,
    pub snaps: BTreeMap<SnapId, SnapInfo>,
    pub snap_limit: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ImageHeader {
    pub(crate) fn new(spec: &NewImage) -> Self {
        Self {
            size: spec.size,
            order: spec.order,
            features: spec.features,
            stripe_unit: spec.stripe_unit,
            stripe_count: spec.stripe_count,
            object_prefix: spec.object_prefix.clone(),
            old_format: spec.old_format,
            flags: 0,
            parent: None,
            snap_seq: 0,
            snaps: BTreeMap::new(),
            snap_limit: None,
            created_at: Utc::now(),
        }
    }

    /// Look up a snapshot by name
    #[must_use]
    pub fn snap_by_name(&self, name: &str) -> Option<&SnapInfo> {
        self.snaps.values().find(|s| s.name == name)
    }
}

/// Data object with its snapshot clones
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoredObject {
    /// `None` once the head was removed but clones remain
    pub head: Option<Vec<u8>>,
    /// Clone taken before the first write under snap sequence `seq`.
    /// A read at snapshot `s` uses the first clone with key >= `s`.
    pub clones: BTreeMap<u64, Option<Vec<u8>>>,
    pub seq: u64,
}

/// Header lock record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    pub exclusive: bool,
    pub tag: String,
    pub holders: Vec<Locker>,
}

/// Replication journal metadata for one image
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct JournalRecord {
    /// Allocated tag owners, oldest first
    pub tags: Vec<TagOwner>,
    pub resync_requested: bool,
}

/// Per-pool mirroring metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct MirrorPoolState {
    pub mode: MirrorMode,
    pub uuid: Option<String>,
    pub peers: Vec<MirrorPeer>,
    pub images: BTreeMap<String, MirrorImageRecord>,
    /// Keyed by global image id
    pub statuses: BTreeMap<String, MirrorSiteStatus>,
}

/// Everything stored in one pool
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct PoolState {
    pub name: String,
    pub base_tier: PoolId,
    /// name -> image id
    pub directory: BTreeMap<String, String>,
    pub headers: BTreeMap<String, ImageHeader>,
    /// image id -> user metadata
    pub metadata: BTreeMap<String, BTreeMap<String, String>>,
    pub objects: BTreeMap<String, StoredObject>,
    pub children: BTreeMap<ParentSpec, BTreeSet<String>>,
    pub object_maps: BTreeMap<String, BTreeSet<u64>>,
    /// header oid -> lock
    pub locks: BTreeMap<String, LockRecord>,
    pub journals: BTreeMap<String, JournalRecord>,
    pub mirror: MirrorPoolState,
}

/// Cluster-wide state outside any pool
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ClusterMeta {
    pub next_pool_id: PoolId,
    pub next_instance_id: u64,
    /// address -> expiry
    pub blacklist: BTreeMap<String, DateTime<Utc>>,
}
