use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::{InventorySnapshot, Token, TokenId, Tombstone};

use super::{decode, encode, KeyValueStore, StoreError, Table};

/// Outcome of merging a remote snapshot into the local inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
	pub imported: usize,
	pub updated: usize,
	/// Remote tokens refused because their exact state is tombstoned
	pub rejected_tombstoned: usize,
	/// Local tokens archived because a remote tombstone names their state
	pub archived: usize,
	pub tombstones_added: usize,
	pub nametags_added: usize,
}

impl MergeStats {
	pub fn changed(&self) -> bool {
		self.imported + self.updated + self.archived + self.tombstones_added + self.nametags_added
			> 0
	}
}

/// The local token inventory, its tombstones and the local version counter
/// of the remote record it mirrors.
///
/// The version counter lives in its own table and survives a wipe of the
/// token tables. Local mutations bump it; imports from the remote set it
/// explicitly.
pub struct Inventory {
	store: Arc<dyn KeyValueStore>,
	remote_name: String,
	write_lock: Mutex<()>,
}

fn tombstone_key(tombstone: &Tombstone) -> String {
	format!("{}:{}", tombstone.token_id, tombstone.state_hash)
}

impl Inventory {
	pub fn new(store: Arc<dyn KeyValueStore>, remote_name: impl Into<String>) -> Self {
		Self {
			store,
			remote_name: remote_name.into(),
			write_lock: Mutex::new(()),
		}
	}

	pub fn remote_name(&self) -> &str {
		&self.remote_name
	}

	pub fn store(&self) -> &Arc<dyn KeyValueStore> {
		&self.store
	}

	pub fn get_token(&self, id: &TokenId) -> Result<Option<Token>, StoreError> {
		self.store
			.get(Table::Tokens, &id.0)?
			.map(|bytes| decode(Table::Tokens, &id.0, &bytes))
			.transpose()
	}

	pub fn contains(&self, id: &TokenId) -> Result<bool, StoreError> {
		Ok(self.store.get(Table::Tokens, &id.0)?.is_some())
	}

	/// Every token, archived ones included.
	pub fn tokens(&self) -> Result<Vec<Token>, StoreError> {
		self.store
			.list(Table::Tokens)?
			.into_iter()
			.map(|(key, bytes)| decode(Table::Tokens, &key, &bytes))
			.collect()
	}

	pub fn active_tokens(&self) -> Result<Vec<Token>, StoreError> {
		Ok(self
			.tokens()?
			.into_iter()
			.filter(Token::is_active)
			.collect())
	}

	pub fn active_count(&self) -> Result<usize, StoreError> {
		Ok(self.active_tokens()?.len())
	}

	pub fn tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
		self.store
			.list(Table::Tombstones)?
			.into_iter()
			.map(|(key, bytes)| decode(Table::Tombstones, &key, &bytes))
			.collect()
	}

	pub fn is_tombstoned(&self, token: &Token) -> Result<bool, StoreError> {
		Ok(self
			.store
			.get(Table::Tombstones, &tombstone_key(&token.tombstone()))?
			.is_some())
	}

	pub fn nametags(&self) -> Result<Vec<String>, StoreError> {
		let mut names = self
			.store
			.list(Table::Nametags)?
			.into_iter()
			.map(|(name, _)| name)
			.collect::<Vec<_>>();
		names.sort();
		Ok(names)
	}

	pub fn version_counter(&self) -> Result<u64, StoreError> {
		let key = self.remote_name.as_str();
		self.store
			.get(Table::VersionCounters, key)?
			.map(|bytes| decode(Table::VersionCounters, key, &bytes))
			.transpose()
			.map(Option::unwrap_or_default)
	}

	pub fn set_version_counter(&self, version: u64) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock();
		self.write_version(version)
	}

	/// Move the counter to `version` after a publish or import that started
	/// from `observed`.
	///
	/// When local changes bumped the counter in the meantime the counter is
	/// placed above `version`, so the next sync still publishes them.
	pub fn commit_version(&self, observed: u64, version: u64) -> Result<u64, StoreError> {
		let _guard = self.write_lock.lock();
		let current = self.version_counter()?;
		let next = if current == observed {
			version
		} else {
			debug!(observed, current, version, "Counter moved during sync");
			current.max(version + 1)
		};
		self.write_version(next)?;
		Ok(next)
	}

	/// Add or replace a token as a local change.
	///
	/// Returns `false` when the token state is tombstoned and was not stored.
	pub fn put_token(&self, token: &Token) -> Result<bool, StoreError> {
		let _guard = self.write_lock.lock();
		if self.is_tombstoned(token)? {
			warn!(token_id = %token.id, "Refusing to store a tombstoned token state");
			return Ok(false);
		}
		self.write_token(token)?;
		self.bump_version()?;
		Ok(true)
	}

	/// Archive a spent token and tombstone its current state.
	///
	/// Returns the tombstone, or `None` when the token is unknown.
	pub fn archive_token(&self, id: &TokenId) -> Result<Option<Tombstone>, StoreError> {
		let _guard = self.write_lock.lock();
		let Some(mut token) = self.get_token(id)? else {
			return Ok(None);
		};

		let tombstone = token.tombstone();
		self.write_tombstone(&tombstone)?;
		token.archived = true;
		self.write_token(&token)?;
		self.bump_version()?;

		debug!(token_id = %id, state_hash = %tombstone.state_hash, "Archived spent token");

		Ok(Some(tombstone))
	}

	/// Record a spent state for a token this inventory never held.
	pub fn add_tombstone(&self, tombstone: &Tombstone) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock();
		self.write_tombstone(tombstone)?;
		self.bump_version()
	}

	pub fn add_nametag(&self, name: &str) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock();
		self.store.put(Table::Nametags, name, Vec::new())?;
		self.bump_version()
	}

	/// Snapshot of the active inventory for publishing at `version`.
	pub fn snapshot(&self, version: u64) -> Result<InventorySnapshot, StoreError> {
		Ok(InventorySnapshot {
			version,
			tokens: self.active_tokens()?,
			tombstones: self.tombstones()?,
			nametags: self.nametags()?,
		})
	}

	/// Consistent snapshot for publishing, stamped at no less than the
	/// current counter. Also returns the counter it was taken at.
	pub fn snapshot_for_publish(&self, version: u64) -> Result<(InventorySnapshot, u64), StoreError> {
		let _guard = self.write_lock.lock();
		let counter = self.version_counter()?;
		Ok((self.snapshot(version.max(counter))?, counter))
	}

	/// Merge a remote snapshot. Does not touch the version counter.
	///
	/// Remote tombstones are adopted first so a token state that was spent
	/// anywhere is never resurrected locally.
	pub fn merge_remote(&self, snapshot: &InventorySnapshot) -> Result<MergeStats, StoreError> {
		let _guard = self.write_lock.lock();
		let mut stats = MergeStats::default();

		let known = self
			.tombstones()?
			.into_iter()
			.map(|t| tombstone_key(&t))
			.collect::<HashSet<_>>();
		for tombstone in &snapshot.tombstones {
			if known.contains(&tombstone_key(tombstone)) {
				continue;
			}
			self.write_tombstone(tombstone)?;
			stats.tombstones_added += 1;

			if let Some(mut local) = self.get_token(&tombstone.token_id)? {
				if local.is_active() && tombstone.matches(&local) {
					local.archived = true;
					self.write_token(&local)?;
					stats.archived += 1;
				}
			}
		}

		for remote in snapshot.tokens.iter().filter(|t| t.is_active()) {
			if self.is_tombstoned(remote)? {
				stats.rejected_tombstoned += 1;
				continue;
			}

			match self.get_token(&remote.id)? {
				None => {
					self.write_token(remote)?;
					stats.imported += 1;
				}
				Some(local) if local.archived => {}
				Some(local)
					if remote.state.transactions.len() > local.state.transactions.len() =>
				{
					self.write_token(remote)?;
					stats.updated += 1;
				}
				Some(_) => {}
			}
		}

		let nametags = self.nametags()?;
		for name in &snapshot.nametags {
			if !nametags.contains(name) {
				self.store.put(Table::Nametags, name, Vec::new())?;
				stats.nametags_added += 1;
			}
		}

		if stats.rejected_tombstoned > 0 {
			warn!(
				rejected = stats.rejected_tombstoned,
				"Remote snapshot carried tombstoned token states"
			);
		}

		Ok(stats)
	}

	fn write_token(&self, token: &Token) -> Result<(), StoreError> {
		self.store
			.put(Table::Tokens, &token.id.0, encode(Table::Tokens, token)?)
	}

	fn write_tombstone(&self, tombstone: &Tombstone) -> Result<(), StoreError> {
		self.store.put(
			Table::Tombstones,
			&tombstone_key(tombstone),
			encode(Table::Tombstones, tombstone)?,
		)
	}

	fn write_version(&self, version: u64) -> Result<(), StoreError> {
		self.store.put(
			Table::VersionCounters,
			&self.remote_name,
			encode(Table::VersionCounters, &version)?,
		)
	}

	fn bump_version(&self) -> Result<(), StoreError> {
		let next = self.version_counter()? + 1;
		self.write_version(next)
	}
}
