//! imgplane store - metadata store client
//!
//! Defines the [`MetadataStore`] contract the image control plane consumes,
//! plus [`MemStore`], an in-process cluster used by the CLI and tests. The
//! in-process cluster can persist to a redb file and inject faults into any
//! named operation.

mod fault;
pub mod client;
pub mod mem;
pub mod persist;
pub mod tables;
pub mod types;

// Re-exports
pub use client::{MetadataStore, UpdateWatcher};
pub use mem::{Cluster, MemStore};
pub use persist::{ClusterDb, PersistError};
pub use types::{ImageHeader, NewImage, data_prefix, header_oid};
