use std::fmt;

use serde::{Deserialize, Serialize};

use super::token::{Token, Tombstone};

/// BLAKE3 hex digest of an immutable remote blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
	pub fn of(bytes: &[u8]) -> Self {
		Self(blake3::hash(bytes).to_hex().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// What a mutable remote name currently points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
	pub content_hash: ContentHash,
	pub sequence: u64,
}

/// The document published to the remote store: every active token, every
/// tombstone and the nametags this wallet minted, stamped with the version it
/// was published at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
	pub version: u64,
	pub tokens: Vec<Token>,
	pub tombstones: Vec<Tombstone>,
	#[serde(default)]
	pub nametags: Vec<String>,
}

impl InventorySnapshot {
	pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(bytes)
	}

	pub fn active_token_count(&self) -> usize {
		self.tokens.iter().filter(|t| t.is_active()).count()
	}
}
