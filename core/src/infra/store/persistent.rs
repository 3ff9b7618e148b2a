use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::{KeyValueStore, StoreError, Table};

const OUTBOX_TABLE: TableDefinition<'_, &'_ str, Vec<u8>> = TableDefinition::new("outbox");
const TOKENS_TABLE: TableDefinition<'_, &'_ str, Vec<u8>> = TableDefinition::new("tokens");
const TOMBSTONES_TABLE: TableDefinition<'_, &'_ str, Vec<u8>> =
	TableDefinition::new("tombstones");
const VERSION_COUNTERS_TABLE: TableDefinition<'_, &'_ str, Vec<u8>> =
	TableDefinition::new("version_counters");
const NAMETAGS_TABLE: TableDefinition<'_, &'_ str, Vec<u8>> = TableDefinition::new("nametags");

fn definition(table: Table) -> TableDefinition<'static, &'static str, Vec<u8>> {
	match table {
		Table::Outbox => OUTBOX_TABLE,
		Table::Tokens => TOKENS_TABLE,
		Table::Tombstones => TOMBSTONES_TABLE,
		Table::VersionCounters => VERSION_COUNTERS_TABLE,
		Table::Nametags => NAMETAGS_TABLE,
	}
}

/// Persistent store backed by a single redb file.
pub struct RedbStore {
	db: Database,
}

impl RedbStore {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let path = path.as_ref();
		let db = Database::create(path)?;

		// create every table up front so readers never hit a missing table
		let txn = db.begin_write()?;
		{
			for table in Table::ALL {
				txn.open_table(definition(table))?;
			}
		}
		txn.commit()?;

		debug!(path = %path.display(), "Opened wallet store");

		Ok(Self { db })
	}
}

impl KeyValueStore for RedbStore {
	fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let txn = self.db.begin_read()?;
		let table = txn.open_table(definition(table))?;
		let value = table.get(key)?.map(|guard| guard.value());
		Ok(value)
	}

	fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
		let txn = self.db.begin_write()?;
		{
			let mut table = txn.open_table(definition(table))?;
			table.insert(key, value)?;
		}
		txn.commit()?;
		Ok(())
	}

	fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
		let txn = self.db.begin_write()?;
		let removed = {
			let mut table = txn.open_table(definition(table))?;
			let removed = table.remove(key)?.is_some();
			removed
		};
		txn.commit()?;
		Ok(removed)
	}

	fn list(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
		let txn = self.db.begin_read()?;
		let table = txn.open_table(definition(table))?;
		let mut rows = Vec::new();
		for row in table.iter()? {
			let (key, value) = row?;
			rows.push((key.value().to_owned(), value.value()));
		}
		Ok(rows)
	}

	fn clear(&self, table: Table) -> Result<(), StoreError> {
		let txn = self.db.begin_write()?;
		{
			let mut table = txn.open_table(definition(table))?;
			let keys = table
				.iter()?
				.map(|row| row.map(|(key, _)| key.value().to_owned()))
				.collect::<Result<Vec<_>, _>>()?;
			for key in keys {
				table.remove(key.as_str())?;
			}
		}
		txn.commit()?;
		Ok(())
	}
}
