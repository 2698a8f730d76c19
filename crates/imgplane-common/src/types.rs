//! Core domain types for imgplane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric pool identifier
pub type PoolId = i64;

/// Snapshot identifier, allocated from the image's snapshot sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapId(pub u64);

impl SnapId {
    /// The live, writable view of an image
    pub const HEAD: Self = Self(u64::MAX - 1);

    #[must_use]
    pub const fn is_head(self) -> bool {
        self.0 == Self::HEAD.0
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "head")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

bitflags::bitflags! {
    /// Image feature bitmask. Unknown bits are retained so a newer image's
    /// features can be reported as unsupported.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u64 {
        const LAYERING = 1 << 0;
        const STRIPINGV2 = 1 << 1;
        const EXCLUSIVE_LOCK = 1 << 2;
        const OBJECT_MAP = 1 << 3;
        const FAST_DIFF = 1 << 4;
        const DEEP_FLATTEN = 1 << 5;
        const JOURNALING = 1 << 6;
    }
}

impl Features {
    /// Every feature this client understands
    pub const ALL: Self = Self::all();

    /// Features that can be toggled after creation
    pub const MUTABLE: Self = Self::EXCLUSIVE_LOCK
        .union(Self::OBJECT_MAP)
        .union(Self::FAST_DIFF)
        .union(Self::JOURNALING);

    /// Features that can only be turned off after creation
    pub const DISABLE_ONLY: Self = Self::DEEP_FLATTEN;

    const NAMES: [(Self, &'static str); 7] = [
        (Self::LAYERING, "layering"),
        (Self::STRIPINGV2, "striping"),
        (Self::EXCLUSIVE_LOCK, "exclusive-lock"),
        (Self::OBJECT_MAP, "object-map"),
        (Self::FAST_DIFF, "fast-diff"),
        (Self::DEEP_FLATTEN, "deep-flatten"),
        (Self::JOURNALING, "journaling"),
    ];

    /// Parse a comma separated feature list such as `layering,exclusive-lock`
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut out = Self::empty();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let feature = Self::NAMES
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(f, _)| *f)
                .ok_or_else(|| format!("unknown feature '{name}'"))?;
            out |= feature;
        }
        Ok(out)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(feature, _)| self.contains(*feature))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Exact point-in-time ancestor of a clone
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParentSpec {
    pub pool: PoolId,
    pub image_id: String,
    pub snap_id: SnapId,
}

impl fmt::Display for ParentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.pool, self.image_id, self.snap_id)
    }
}

/// Parent link plus the byte range of the child still backed by it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub spec: ParentSpec,
    pub overlap: u64,
}

/// Snapshot protection state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionState {
    #[default]
    Unprotected,
    Protecting,
    Protected,
    Unprotecting,
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unprotected => "unprotected",
            Self::Protecting => "protecting",
            Self::Protected => "protected",
            Self::Unprotecting => "unprotecting",
        };
        write!(f, "{s}")
    }
}

/// Namespace a snapshot was created in
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotNamespace {
    #[default]
    User,
    Group { pool: PoolId, group_id: String },
    Mirror { primary: bool },
}

/// Snapshot as recorded in an image header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub id: SnapId,
    pub name: String,
    pub size: u64,
    pub namespace: SnapshotNamespace,
    pub protection: ProtectionState,
    pub parent: Option<ParentInfo>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot context attached to head writes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    pub seq: u64,
    /// Existing snapshot ids, newest first
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            seq: 0,
            snaps: Vec::new(),
        }
    }
}

/// Lock mode for header locks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// One holder of a header lock
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locker {
    /// Client entity name, e.g. `client.4123`
    pub client: String,
    pub cookie: String,
    pub address: String,
}

impl fmt::Display for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.client, self.cookie, self.address)
    }
}

/// Lock record as stored with the image header
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lockers: Vec<Locker>,
    pub exclusive: bool,
    pub tag: String,
}

/// Pool-wide mirroring mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorMode {
    #[default]
    Disabled,
    Image,
    Pool,
}

impl fmt::Display for MirrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Image => "image",
            Self::Pool => "pool",
        };
        write!(f, "{s}")
    }
}

/// Per-image mirroring state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorImageState {
    Disabling,
    Enabled,
    #[default]
    Disabled,
}

impl fmt::Display for MirrorImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabling => "disabling",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Stored per-image mirroring record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageRecord {
    pub global_image_id: String,
    pub state: MirrorImageState,
}

/// Mirroring view of an image as reported to callers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageInfo {
    pub global_id: String,
    pub state: MirrorImageState,
    pub primary: bool,
}

/// Registered remote cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPeer {
    pub uuid: String,
    pub cluster_name: String,
    pub client_name: String,
}

/// Replay state reported by the remote replayer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MirrorImageStatusState {
    #[default]
    Unknown,
    Error,
    Syncing,
    StartingReplay,
    Replaying,
    StoppingReplay,
    Stopped,
}

/// Status record keyed by global image id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSiteStatus {
    pub state: MirrorImageStatusState,
    pub description: String,
    pub last_update: DateTime<Utc>,
    pub up: bool,
}

/// Combined mirroring status of an image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageStatus {
    pub name: String,
    pub info: MirrorImageInfo,
    pub state: MirrorImageStatusState,
    pub description: String,
    pub last_update: Option<DateTime<Utc>>,
    pub up: bool,
}

/// Owner of the newest tag in an image's replication journal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagOwner {
    /// This cluster is the write primary
    Local,
    /// Demoted with no new primary elected yet
    Orphan,
    /// Primary lives in the cluster with this mirror uuid
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_parse_and_display() {
        let f = Features::parse("layering, exclusive-lock").unwrap();
        assert!(f.contains(Features::LAYERING));
        assert!(f.contains(Features::EXCLUSIVE_LOCK));
        assert!(!f.intersects(Features::JOURNALING));
        assert_eq!(f.to_string(), "layering, exclusive-lock");
        assert!(Features::parse("bogus").is_err());
        assert!(Features::ALL.contains(f | Features::JOURNALING));
    }

    #[test]
    fn test_features_difference() {
        let f = Features::ALL.difference(Features::JOURNALING);
        assert!(!f.contains(Features::JOURNALING));
        assert!(f.contains(Features::DEEP_FLATTEN));
        assert!(Features::empty().is_empty());
    }

    #[test]
    fn test_features_keep_unknown_bits() {
        let f = Features::from_bits_retain((1 << 20) | Features::LAYERING.bits());
        assert_eq!(f.difference(Features::ALL).bits(), 1 << 20);
        assert!(f.contains(Features::LAYERING));
        assert_eq!(f.to_string(), "layering");
        assert_eq!(Features::MUTABLE.bits(), 0b101_1100);
        assert_eq!(Features::ALL.bits(), 0x7f);
    }

    #[test]
    fn test_snap_id_head() {
        assert!(SnapId::HEAD.is_head());
        assert!(!SnapId(4).is_head());
        assert_eq!(SnapId::HEAD.to_string(), "head");
    }
}
