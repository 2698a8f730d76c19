//! Redb table definitions for the persistent cluster file.

use redb::TableDefinition;

// Key: pool id as decimal string, Value: bincode-encoded PoolState
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

// Single key "meta", Value: bincode-encoded ClusterMeta
pub const CLUSTER: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster");

pub const CLUSTER_META_KEY: &str = "meta";
