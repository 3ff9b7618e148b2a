//! Three-population TTL cache used in front of the remote store.
//!
//! * version records: the latest `(content hash, sequence)` a remote name
//!   resolves to, short-lived
//! * content blobs: immutable, keyed by their content hash, never expire
//! * failure markers: remember a recent failed resolve so callers can back off
//!
//! On top of that a "known fresh" marker is kept per name. It is set right
//! after this process publishes, so the next pass can trust its own record
//! without asking the network again.

mod entry;

pub use entry::{CacheEntry, CacheSource};

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Lifetimes of the individual populations.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
	pub version_record: Duration,
	pub failure: Duration,
}

impl Default for CacheTtls {
	fn default() -> Self {
		Self {
			version_record: Duration::from_secs(60),
			failure: Duration::from_secs(30),
		}
	}
}

/// Cache for version records `R` and content blobs `C`.
pub struct RemoteCache<R, C> {
	ttls: CacheTtls,
	versions: Mutex<HashMap<String, CacheEntry<R>>>,
	content: Mutex<HashMap<String, CacheEntry<C>>>,
	failures: Mutex<HashMap<String, CacheEntry<String>>>,
	known_fresh: Mutex<HashMap<String, Instant>>,
}

impl<R: Clone, C: Clone> RemoteCache<R, C> {
	pub fn new(ttls: CacheTtls) -> Self {
		Self {
			ttls,
			versions: Mutex::new(HashMap::new()),
			content: Mutex::new(HashMap::new()),
			failures: Mutex::new(HashMap::new()),
			known_fresh: Mutex::new(HashMap::new()),
		}
	}

	pub fn ttls(&self) -> CacheTtls {
		self.ttls
	}

	/// Version record for `name` if one is cached and still within its TTL.
	pub fn get_version_record(&self, name: &str) -> Option<R> {
		let mut versions = self.versions.lock();
		let hit = fresh_or_evict(&mut versions, name);
		trace!(name, hit = hit.is_some(), "version record lookup");
		hit
	}

	/// Store a version record. A successful write clears any failure marker
	/// for the same name.
	pub fn set_version_record(&self, name: &str, record: R, source: CacheSource, ttl: Duration) {
		self.versions
			.lock()
			.insert(name.to_owned(), CacheEntry::new(record, source, Some(ttl)));
		self.failures.lock().remove(name);
	}

	/// Store a version record with the configured default lifetime.
	pub fn set_version_record_default(&self, name: &str, record: R, source: CacheSource) {
		self.set_version_record(name, record, source, self.ttls.version_record);
	}

	/// Cached record regardless of its TTL.
	///
	/// Only meaningful when the caller has established the record is current,
	/// normally through [`RemoteCache::is_known_fresh`].
	pub fn get_ignoring_ttl(&self, name: &str) -> Option<R> {
		self.versions.lock().get(name).map(|entry| entry.data.clone())
	}

	pub fn get_content(&self, hash: &str) -> Option<C> {
		self.content.lock().get(hash).map(|entry| entry.data.clone())
	}

	pub fn set_content(&self, hash: &str, blob: C, source: CacheSource) {
		self.content
			.lock()
			.insert(hash.to_owned(), CacheEntry::new(blob, source, None));
	}

	pub fn record_failure(&self, name: &str, reason: impl Into<String>) {
		self.failures.lock().insert(
			name.to_owned(),
			CacheEntry::new(reason.into(), CacheSource::Local, Some(self.ttls.failure)),
		);
	}

	pub fn has_recent_failure(&self, name: &str) -> bool {
		let mut failures = self.failures.lock();
		fresh_or_evict(&mut failures, name).is_some()
	}

	pub fn mark_known_fresh(&self, name: &str) {
		self.known_fresh.lock().insert(name.to_owned(), Instant::now());
	}

	/// Whether `name` was marked fresh less than `max_age` ago.
	pub fn is_known_fresh(&self, name: &str, max_age: Duration) -> bool {
		self.known_fresh
			.lock()
			.get(name)
			.is_some_and(|marked| Instant::now().saturating_duration_since(*marked) < max_age)
	}

	/// Forget everything cached about `name`. Content blobs are left alone
	/// since they are keyed by hash and immutable.
	pub fn invalidate(&self, name: &str) {
		self.versions.lock().remove(name);
		self.failures.lock().remove(name);
		self.known_fresh.lock().remove(name);
	}

	pub fn clear(&self) {
		self.versions.lock().clear();
		self.content.lock().clear();
		self.failures.lock().clear();
		self.known_fresh.lock().clear();
	}
}

impl<R: Clone, C: Clone> Default for RemoteCache<R, C> {
	fn default() -> Self {
		Self::new(CacheTtls::default())
	}
}

fn fresh_or_evict<T: Clone>(map: &mut HashMap<String, CacheEntry<T>>, key: &str) -> Option<T> {
	match map.get(key) {
		Some(entry) if !entry.is_expired() => Some(entry.data.clone()),
		Some(_) => {
			map.remove(key);
			None
		}
		None => None,
	}
}
