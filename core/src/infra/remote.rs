//! Boundary to the versioned, content-addressed remote store.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ContentHash, VersionRecord};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
	#[error("remote store unreachable: {0}")]
	Network(String),
	#[error("remote store request timed out")]
	Timeout,
	#[error("content not found: {0}")]
	ContentNotFound(ContentHash),
	#[error("publish rejected: {0}")]
	PublishRejected(String),
}

/// Mutable names pointing at immutable blobs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
	/// Latest record published under `name`, `None` if nothing has been.
	async fn resolve(&self, name: &str) -> Result<Option<VersionRecord>, RemoteError>;

	async fn fetch(&self, hash: &ContentHash) -> Result<Vec<u8>, RemoteError>;

	/// Upload a blob, returning its content hash.
	async fn put(&self, content: Vec<u8>) -> Result<ContentHash, RemoteError>;

	async fn publish(
		&self,
		name: &str,
		hash: &ContentHash,
		sequence: u64,
	) -> Result<(), RemoteError>;
}
