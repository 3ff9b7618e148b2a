//! Versioned sync of the local inventory with the remote store.
//!
//! The remote holds one mutable record per wallet pointing at an immutable
//! snapshot blob. Each pass compares the local version counter with the
//! remote sequence: behind means import, ahead means publish, equal means
//! nothing to do unless the local inventory is empty while the remote is not,
//! which is repaired by a forced import.

pub mod mode;

pub use mode::{
	is_read_only, requires_lock, select_mode, skip_remote_io, skip_remote_read,
	skip_spent_detection, CircuitBreaker, SyncContext, SyncMode, TransferDirection,
};

use std::{cmp::Ordering, collections::HashSet, future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use tw_cache::{CacheSource, RemoteCache};

use crate::{
	config::WalletConfig,
	domain::{ContentHash, InventorySnapshot, VersionRecord},
	infra::{
		event::{EventBus, WalletEvent},
		ledger::LedgerClient,
		remote::{RemoteError, RemoteStore},
		store::{Inventory, MergeStats, StoreError},
	},
	service::leader::LeaderCoordinator,
};

/// Version records by remote name, snapshot blobs by content hash.
pub type SnapshotCache = RemoteCache<VersionRecord, Arc<Vec<u8>>>;

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("Remote store error: {0}")]
	Remote(#[from] RemoteError),
	#[error("Local store error: {0}")]
	Store(#[from] StoreError),
	#[error("Remote call timed out after {0:?}")]
	Timeout(Duration),
	#[error("Resolving {name} is backing off after a recent failure")]
	Backoff { name: String },
	#[error("Remote content does not match its hash {expected}")]
	ContentMismatch { expected: ContentHash },
	#[error("Invalid snapshot document: {0}")]
	Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
	/// Remote was not consulted
	LocalOnly,
	/// Remote was read without touching local state
	ReadOnly,
	UpToDate,
	Imported,
	Published,
	/// Local inventory was empty while the remote was not; it was re-imported
	Repaired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
	pub mode: SyncMode,
	pub action: SyncAction,
	pub local_version: u64,
	pub remote_sequence: Option<u64>,
	pub lock_held: bool,
	pub published: bool,
	/// A publish was due but skipped because the sync lock was not granted
	pub publish_skipped: bool,
	pub merge: MergeStats,
	pub spent_archived: usize,
	pub nametags: Vec<String>,
}

impl SyncReport {
	fn new(mode: SyncMode, action: SyncAction, local_version: u64, lock_held: bool) -> Self {
		Self {
			mode,
			action,
			local_version,
			remote_sequence: None,
			lock_held,
			published: false,
			publish_skipped: false,
			merge: MergeStats::default(),
			spent_archived: 0,
			nametags: Vec::new(),
		}
	}

	pub fn inventory_changed(&self) -> bool {
		self.merge.changed() || self.spent_archived > 0
	}
}

pub struct SyncEngine {
	inventory: Arc<Inventory>,
	remote: Arc<dyn RemoteStore>,
	ledger: Arc<dyn LedgerClient>,
	coordinator: Arc<LeaderCoordinator>,
	cache: Arc<SnapshotCache>,
	breaker: CircuitBreaker,
	events: EventBus,
	remote_enabled: bool,
	remote_timeout: Duration,
	lock_timeout: Duration,
	known_fresh_max_age: Duration,
	// one pass at a time within this process
	pass_lock: Mutex<()>,
}

impl SyncEngine {
	pub fn new(
		config: &WalletConfig,
		inventory: Arc<Inventory>,
		remote: Arc<dyn RemoteStore>,
		ledger: Arc<dyn LedgerClient>,
		coordinator: Arc<LeaderCoordinator>,
		events: EventBus,
	) -> Self {
		Self {
			inventory,
			remote,
			ledger,
			coordinator,
			cache: Arc::new(SnapshotCache::new(config.cache.ttls())),
			breaker: CircuitBreaker::new(
				config.sync.circuit_breaker_threshold,
				config.sync.circuit_breaker_cooldown(),
			),
			events,
			remote_enabled: config.sync.remote_enabled,
			remote_timeout: config.sync.remote_timeout(),
			lock_timeout: config.coordinator.lock_timeout(),
			known_fresh_max_age: config.cache.known_fresh_max_age(),
			pass_lock: Mutex::new(()),
		}
	}

	pub fn cache(&self) -> &Arc<SnapshotCache> {
		&self.cache
	}

	pub fn inventory(&self) -> &Arc<Inventory> {
		&self.inventory
	}

	pub fn mode_for(&self, context: &SyncContext) -> SyncMode {
		select_mode(context, self.breaker.is_open())
	}

	/// Run one sync pass.
	///
	/// A failed fetch or publish is reported and recorded for backoff; it
	/// never leaves the local inventory half-written.
	pub async fn sync(&self, context: &SyncContext) -> Result<SyncReport, SyncError> {
		let mode = self.mode_for(context);

		if skip_remote_io(mode, self.remote_enabled) {
			trace!(?mode, "Sync pass is local-only");
			return Ok(SyncReport::new(
				mode,
				SyncAction::LocalOnly,
				self.inventory.version_counter()?,
				false,
			));
		}

		let _pass = self.pass_lock.lock().await;

		let lock_held = requires_lock(mode) && self.coordinator.acquire_lock(self.lock_timeout).await;
		let result = self.run_pass(mode, lock_held).await;
		if lock_held {
			self.coordinator.release_lock();
		}

		match &result {
			Ok(report) => {
				self.breaker.record_success();
				debug!(
					?mode,
					action = ?report.action,
					local_version = report.local_version,
					remote_sequence = ?report.remote_sequence,
					published = report.published,
					"Sync pass completed"
				);
				if report.inventory_changed() {
					self.emit_inventory_updated();
				}
				self.events.emit(WalletEvent::SyncCompleted {
					mode,
					local_version: report.local_version,
					remote_sequence: report.remote_sequence,
					published: report.published,
				});
			}
			Err(e) => {
				self.breaker.record_failure();
				warn!(?mode, error = %e, "Sync pass failed");
				self.events.emit(WalletEvent::SyncFailed {
					mode,
					error: e.to_string(),
				});
			}
		}

		result
	}

	async fn run_pass(&self, mode: SyncMode, lock_held: bool) -> Result<SyncReport, SyncError> {
		let name = self.inventory.remote_name().to_owned();
		let local_version = self.inventory.version_counter()?;
		let mut report = SyncReport::new(mode, SyncAction::UpToDate, local_version, lock_held);

		if skip_remote_read(mode) {
			// publish only against a record this process knows to be current
			let known = self
				.cache
				.is_known_fresh(&name, self.known_fresh_max_age)
				.then(|| self.cache.get_ignoring_ttl(&name))
				.flatten();
			report.remote_sequence = known.as_ref().map(|r| r.sequence);
			if let Some(record) = known {
				if local_version > record.sequence {
					self.publish(&name, local_version, &mut report).await?;
				}
			}
			return Ok(report);
		}

		let remote = self.resolve(&name, mode).await?;
		report.remote_sequence = remote.as_ref().map(|r| r.sequence);

		if is_read_only(mode) {
			if let Some(record) = &remote {
				report.nametags = self.fetch_snapshot(&record.content_hash).await?.nametags;
			}
			report.action = SyncAction::ReadOnly;
			return Ok(report);
		}

		match remote {
			None => {
				if local_version > 0 || self.inventory.active_count()? > 0 {
					self.publish(&name, local_version.max(1), &mut report).await?;
				}
			}
			Some(record) => match local_version.cmp(&record.sequence) {
				Ordering::Less => {
					let snapshot = self.fetch_snapshot(&record.content_hash).await?;
					report.merge = self.inventory.merge_remote(&snapshot)?;
					report.local_version =
						self.inventory.commit_version(local_version, record.sequence)?;
					report.action = SyncAction::Imported;

					info!(
						name = %name,
						from = local_version,
						to = record.sequence,
						imported = report.merge.imported,
						"Imported newer remote inventory"
					);

					if self.has_unpublished(&snapshot)? {
						self.publish(&name, record.sequence + 1, &mut report).await?;
					}
				}
				Ordering::Greater => {
					// fold in the remote first so nothing published elsewhere is lost
					let snapshot = self.fetch_snapshot(&record.content_hash).await?;
					report.merge = self.inventory.merge_remote(&snapshot)?;
					self.publish(&name, local_version, &mut report).await?;
				}
				Ordering::Equal => self.check_consistency(&record, &mut report).await?,
			},
		}

		if !skip_spent_detection(mode) {
			report.spent_archived = self.detect_spent().await?;
			if report.spent_archived > 0 {
				let version = self.inventory.version_counter()?;
				self.publish(&name, version, &mut report).await?;
			}
		}

		Ok(report)
	}

	/// Equal versions but an empty local inventory means the local tables
	/// were wiped while the counter survived.
	async fn check_consistency(
		&self,
		record: &VersionRecord,
		report: &mut SyncReport,
	) -> Result<(), SyncError> {
		if self.inventory.active_count()? > 0 {
			return Ok(());
		}

		let snapshot = self.fetch_snapshot(&record.content_hash).await?;
		let remote_count = snapshot.active_token_count();
		if remote_count == 0 {
			return Ok(());
		}

		report.merge = self.inventory.merge_remote(&snapshot)?;
		report.action = SyncAction::Repaired;

		warn!(
			sequence = record.sequence,
			remote_tokens = remote_count,
			recovered = report.merge.imported,
			"Local inventory empty at current version, re-imported remote snapshot"
		);
		self.events.emit(WalletEvent::RecoveryWarning {
			reason: format!(
				"local inventory was empty at version {} while the remote held {} tokens",
				record.sequence, remote_count
			),
			recovered_tokens: report.merge.imported,
		});

		Ok(())
	}

	async fn resolve(&self, name: &str, mode: SyncMode) -> Result<Option<VersionRecord>, SyncError> {
		if mode != SyncMode::Recovery {
			if self.cache.is_known_fresh(name, self.known_fresh_max_age) {
				if let Some(record) = self.cache.get_ignoring_ttl(name) {
					trace!(name, sequence = record.sequence, "Using known-fresh record");
					return Ok(Some(record));
				}
			}
			if let Some(record) = self.cache.get_version_record(name) {
				return Ok(Some(record));
			}
			if self.cache.has_recent_failure(name) {
				return Err(SyncError::Backoff {
					name: name.to_owned(),
				});
			}
		}

		match self.bounded(self.remote.resolve(name)).await {
			Ok(record) => {
				if let Some(record) = &record {
					self.cache
						.set_version_record_default(name, record.clone(), CacheSource::Remote);
				}
				Ok(record)
			}
			Err(e) => {
				self.cache.record_failure(name, e.to_string());
				Err(e)
			}
		}
	}

	async fn fetch_snapshot(&self, hash: &ContentHash) -> Result<InventorySnapshot, SyncError> {
		let bytes = match self.cache.get_content(hash.as_str()) {
			Some(bytes) => bytes,
			None => {
				let bytes = self.bounded(self.remote.fetch(hash)).await?;
				if ContentHash::of(&bytes) != *hash {
					return Err(SyncError::ContentMismatch {
						expected: hash.clone(),
					});
				}
				let bytes = Arc::new(bytes);
				self.cache
					.set_content(hash.as_str(), bytes.clone(), CacheSource::Remote);
				bytes
			}
		};

		Ok(InventorySnapshot::from_bytes(&bytes)?)
	}

	async fn publish(
		&self,
		name: &str,
		version: u64,
		report: &mut SyncReport,
	) -> Result<(), SyncError> {
		if !report.lock_held {
			warn!(name, version, "Sync lock not held, skipping remote publish");
			report.publish_skipped = true;
			return Ok(());
		}

		// local writes may have landed since the pass started
		let (snapshot, observed) = self.inventory.snapshot_for_publish(version)?;
		let version = snapshot.version;
		let bytes = snapshot.to_bytes()?;

		let published = async {
			let hash = self.bounded(self.remote.put(bytes.clone())).await?;
			self.bounded(self.remote.publish(name, &hash, version)).await?;
			Ok::<_, SyncError>(hash)
		}
		.await;

		let hash = match published {
			Ok(hash) => hash,
			Err(e) => {
				self.cache.record_failure(name, e.to_string());
				return Err(e);
			}
		};

		let counter = self.inventory.commit_version(observed, version)?;

		self.cache
			.set_content(hash.as_str(), Arc::new(bytes), CacheSource::Published);
		self.cache.set_version_record_default(
			name,
			VersionRecord {
				content_hash: hash.clone(),
				sequence: version,
			},
			CacheSource::Published,
		);
		self.cache.mark_known_fresh(name);

		report.published = true;
		report.local_version = counter;
		report.remote_sequence = Some(version);
		if report.action == SyncAction::UpToDate {
			report.action = SyncAction::Published;
		}

		info!(
			name,
			version,
			hash = %hash,
			tokens = snapshot.tokens.len(),
			term = self.coordinator.term(),
			"Published inventory snapshot"
		);

		Ok(())
	}

	/// Whether local state holds anything the remote snapshot lacks.
	fn has_unpublished(&self, snapshot: &InventorySnapshot) -> Result<bool, SyncError> {
		let remote_states = snapshot
			.tokens
			.iter()
			.map(|t| (t.id.clone(), t.state_hash()))
			.collect::<HashSet<_>>();
		for token in self.inventory.active_tokens()? {
			if !remote_states.contains(&(token.id.clone(), token.state_hash())) {
				return Ok(true);
			}
		}

		let remote_tombstones = snapshot.tombstones.iter().collect::<HashSet<_>>();
		let tombstones = self.inventory.tombstones()?;
		if tombstones.iter().any(|t| !remote_tombstones.contains(t)) {
			return Ok(true);
		}

		let nametags = self.inventory.nametags()?;
		Ok(nametags.iter().any(|n| !snapshot.nametags.contains(n)))
	}

	/// Archive and tombstone every token the ledger reports spent. Tokens
	/// whose check fails are kept.
	async fn detect_spent(&self) -> Result<usize, SyncError> {
		let mut archived = 0;
		for token in self.inventory.active_tokens()? {
			match tokio::time::timeout(self.remote_timeout, self.ledger.check_spent(&token)).await {
				Ok(Ok(true)) => {
					if self.inventory.archive_token(&token.id)?.is_some() {
						info!(token_id = %token.id, "Archived token the ledger reports spent");
						archived += 1;
					}
				}
				Ok(Ok(false)) => {}
				Ok(Err(e)) => {
					warn!(token_id = %token.id, error = %e, "Spent check failed, keeping token");
				}
				Err(_) => {
					warn!(token_id = %token.id, "Spent check timed out, keeping token");
				}
			}
		}
		Ok(archived)
	}

	fn emit_inventory_updated(&self) {
		match self.inventory.active_count() {
			Ok(active_tokens) => {
				self.events
					.emit(WalletEvent::InventoryUpdated { active_tokens });
			}
			Err(e) => warn!(error = %e, "Failed to count inventory for event"),
		}
	}

	async fn bounded<T>(
		&self,
		call: impl Future<Output = Result<T, RemoteError>>,
	) -> Result<T, SyncError> {
		match tokio::time::timeout(self.remote_timeout, call).await {
			Ok(result) => Ok(result?),
			Err(_) => Err(SyncError::Timeout(self.remote_timeout)),
		}
	}
}
