use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{EntryId, OutboxEntry, OutboxStatus};

use super::{decode, encode, KeyValueStore, StoreError, Table};

/// Typed access to the outbox table.
pub struct OutboxRepository {
	store: Arc<dyn KeyValueStore>,
}

impl OutboxRepository {
	pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
		Self { store }
	}

	pub fn save(&self, entry: &OutboxEntry) -> Result<(), StoreError> {
		let key = entry.id.to_string();
		self.store
			.put(Table::Outbox, &key, encode(Table::Outbox, entry)?)
	}

	pub fn get(&self, id: &EntryId) -> Result<Option<OutboxEntry>, StoreError> {
		let key = id.to_string();
		self.store
			.get(Table::Outbox, &key)?
			.map(|bytes| decode(Table::Outbox, &key, &bytes))
			.transpose()
	}

	/// All entries, oldest first.
	pub fn list(&self) -> Result<Vec<OutboxEntry>, StoreError> {
		let mut entries = self
			.store
			.list(Table::Outbox)?
			.into_iter()
			.map(|(key, bytes)| decode::<OutboxEntry>(Table::Outbox, &key, &bytes))
			.collect::<Result<Vec<_>, _>>()?;
		entries.sort_by_key(|e| e.created_at);
		Ok(entries)
	}

	pub fn list_incomplete(&self) -> Result<Vec<OutboxEntry>, StoreError> {
		Ok(self
			.list()?
			.into_iter()
			.filter(OutboxEntry::is_incomplete)
			.collect())
	}

	pub fn list_with_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEntry>, StoreError> {
		Ok(self
			.list()?
			.into_iter()
			.filter(|e| e.status == status)
			.collect())
	}

	pub fn delete(&self, id: &EntryId) -> Result<bool, StoreError> {
		self.store.delete(Table::Outbox, &id.to_string())
	}

	/// Delete completed entries last updated before `cutoff`.
	pub fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
		let mut purged = 0;
		for entry in self.list_with_status(OutboxStatus::Completed)? {
			if entry.updated_at < cutoff && self.delete(&entry.id)? {
				purged += 1;
			}
		}
		Ok(purged)
	}
}
