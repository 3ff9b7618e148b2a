use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{KeyValueStore, StoreError, Table};

/// Volatile store for tests and ephemeral wallets.
#[derive(Default)]
pub struct MemoryStore {
	tables: RwLock<HashMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl KeyValueStore for MemoryStore {
	fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		Ok(self
			.tables
			.read()
			.get(&table)
			.and_then(|rows| rows.get(key).cloned()))
	}

	fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
		self.tables
			.write()
			.entry(table)
			.or_default()
			.insert(key.to_owned(), value);
		Ok(())
	}

	fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
		Ok(self
			.tables
			.write()
			.get_mut(&table)
			.is_some_and(|rows| rows.remove(key).is_some()))
	}

	fn list(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
		Ok(self
			.tables
			.read()
			.get(&table)
			.map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
			.unwrap_or_default())
	}

	fn clear(&self, table: Table) -> Result<(), StoreError> {
		self.tables.write().remove(&table);
		Ok(())
	}
}
