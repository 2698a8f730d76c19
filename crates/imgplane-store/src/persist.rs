//! Persistent cluster state backed by redb.
//!
//! The in-memory cluster stays authoritative; this module writes each
//! mutated pool through to disk and loads everything back on open.

use crate::tables;
use crate::types::{ClusterMeta, PoolState};
use imgplane_common::{Error, PoolId};
use redb::{Database, ReadableTable};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::error;

/// Error type for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for PersistError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<PersistError> for Error {
    fn from(e: PersistError) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Cluster file on disk
pub struct ClusterDb {
    db: Database,
}

impl ClusterDb {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::POOLS)?;
            let _t = write_txn.open_table(tables::CLUSTER)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // ---- Pools (bincode) ----

    pub(crate) fn put_pool(&self, id: PoolId, pool: &PoolState) {
        if let Err(e) = self.put_bincode(tables::POOLS, &id.to_string(), pool) {
            error!("Failed to persist pool {id}: {e}");
        }
    }

    pub(crate) fn delete_pool(&self, id: PoolId) {
        if let Err(e) = self.delete_key(tables::POOLS, &id.to_string()) {
            error!("Failed to delete pool {id}: {e}");
        }
    }

    pub(crate) fn load_pools(&self) -> PersistResult<BTreeMap<PoolId, PoolState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::POOLS)?;
        let mut result = BTreeMap::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let Ok(id) = key.parse::<PoolId>() else {
                error!("Skipping pool with malformed key '{key}'");
                continue;
            };
            match bincode::deserialize::<PoolState>(entry.1.value()) {
                Ok(pool) => {
                    result.insert(id, pool);
                }
                Err(e) => error!("Failed to decode pool '{key}': {e}"),
            }
        }
        Ok(result)
    }

    // ---- Cluster meta (bincode, single key) ----

    pub(crate) fn put_meta(&self, meta: &ClusterMeta) {
        if let Err(e) = self.put_bincode(tables::CLUSTER, tables::CLUSTER_META_KEY, meta) {
            error!("Failed to persist cluster meta: {e}");
        }
    }

    pub(crate) fn load_meta(&self) -> PersistResult<Option<ClusterMeta>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::CLUSTER)?;
        match table.get(tables::CLUSTER_META_KEY)? {
            Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
            None => Ok(None),
        }
    }

    // ---- Generic helpers ----

    fn put_bytes(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> PersistResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn put_bincode<T: serde::Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> PersistResult<()> {
        let bytes = bincode::serialize(value)?;
        self.put_bytes(table_def, key, &bytes)
    }

    fn delete_key(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> PersistResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.redb");
        {
            let db = ClusterDb::open(&path).unwrap();
            let mut pool = PoolState {
                name: "rbd".into(),
                base_tier: 1,
                ..PoolState::default()
            };
            pool.directory.insert("a".into(), "10f2".into());
            db.put_pool(1, &pool);
            db.put_meta(&ClusterMeta {
                next_pool_id: 2,
                next_instance_id: 7,
                blacklist: BTreeMap::new(),
            });
        }

        let db = ClusterDb::open(&path).unwrap();
        let pools = db.load_pools().unwrap();
        assert_eq!(pools[&1].name, "rbd");
        assert_eq!(pools[&1].directory["a"], "10f2");
        assert_eq!(db.load_meta().unwrap().unwrap().next_instance_id, 7);

        db.delete_pool(1);
        assert!(db.load_pools().unwrap().is_empty());
    }
}
