pub mod client;
pub mod config;
pub mod index;

pub use client::{ObjectRecord, StorageClient, StorageError};
pub use index::StorageIndexCache;
