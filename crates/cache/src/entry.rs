use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
	/// Read back from the remote store
	Remote,
	/// Written by this process right after a successful publish
	Published,
	/// A local failure marker
	Local,
}

/// A cached value with its insertion time and optional lifetime.
///
/// `ttl == None` means the entry never expires, which is what immutable
/// content-addressed blobs use.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
	pub data: T,
	pub timestamp: Instant,
	pub source: CacheSource,
	pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
	pub fn new(data: T, source: CacheSource, ttl: Option<Duration>) -> Self {
		Self {
			data,
			timestamp: Instant::now(),
			source,
			ttl,
		}
	}

	pub fn age(&self) -> Duration {
		Instant::now().saturating_duration_since(self.timestamp)
	}

	pub fn is_expired(&self) -> bool {
		match self.ttl {
			Some(ttl) => self.age() >= ttl,
			None => false,
		}
	}
}
