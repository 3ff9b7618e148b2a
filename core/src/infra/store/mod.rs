//! Local key-value persistence.
//!
//! Everything the wallet must survive a restart with (outbox entries, tokens,
//! tombstones and version counters) goes through [`KeyValueStore`]. Values
//! are MessagePack encoded.

mod inventory;
mod memory;
mod outbox;
mod persistent;

pub use inventory::{Inventory, MergeStats};
pub use memory::MemoryStore;
pub use outbox::OutboxRepository;
pub use persistent::RedbStore;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Logical tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
	Outbox,
	Tokens,
	Tombstones,
	VersionCounters,
	Nametags,
}

impl Table {
	pub const ALL: [Table; 5] = [
		Table::Outbox,
		Table::Tokens,
		Table::Tombstones,
		Table::VersionCounters,
		Table::Nametags,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::Outbox => "outbox",
			Self::Tokens => "tokens",
			Self::Tombstones => "tombstones",
			Self::VersionCounters => "version_counters",
			Self::Nametags => "nametags",
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Database error: {0}")]
	Database(#[from] ::redb::DatabaseError),
	#[error("Transaction error: {0}")]
	Transaction(#[from] ::redb::TransactionError),
	#[error("Table error: {0}")]
	Table(#[from] ::redb::TableError),
	#[error("Storage error: {0}")]
	Storage(#[from] ::redb::StorageError),
	#[error("Commit error: {0}")]
	Commit(#[from] ::redb::CommitError),
	#[error("Failed to encode value for table {table}: {source}")]
	Encode {
		table: &'static str,
		#[source]
		source: rmp_serde::encode::Error,
	},
	#[error("Failed to decode value in table {table} at key {key}: {source}")]
	Decode {
		table: &'static str,
		key: String,
		#[source]
		source: rmp_serde::decode::Error,
	},
}

/// Minimal table-oriented key-value store.
///
/// Calls are short and synchronous; implementations must be safe to share
/// between tasks.
pub trait KeyValueStore: Send + Sync {
	fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

	fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

	/// Returns whether a value was present.
	fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError>;

	fn list(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

	fn clear(&self, table: Table) -> Result<(), StoreError>;
}

pub(crate) fn encode<T: Serialize>(table: Table, value: &T) -> Result<Vec<u8>, StoreError> {
	rmp_serde::to_vec_named(value).map_err(|source| StoreError::Encode {
		table: table.name(),
		source,
	})
}

pub(crate) fn decode<T: DeserializeOwned>(
	table: Table,
	key: &str,
	bytes: &[u8],
) -> Result<T, StoreError> {
	rmp_serde::from_slice(bytes).map_err(|source| StoreError::Decode {
		table: table.name(),
		key: key.to_owned(),
		source,
	})
}
