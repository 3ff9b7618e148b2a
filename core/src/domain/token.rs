//! Bearer tokens held in the local inventory

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex identifier of a token, fixed at genesis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl fmt::Display for TokenId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for TokenId {
	fn from(id: &str) -> Self {
		Self(id.to_owned())
	}
}

/// Coin type a token carries value in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoinId(pub String);

impl fmt::Display for CoinId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Unique key of a ledger submission. Submitting twice with the same request
/// id is idempotent on the ledger side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Ledger-issued proof that a commitment was included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
	pub request_id: RequestId,
	pub data: Vec<u8>,
}

/// A signed request to mutate ledger state, already constructed by the
/// signing layer. `source_state_hash` names the token state it consumes, if
/// any (mints consume nothing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
	pub request_id: RequestId,
	pub source_state_hash: Option<String>,
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
	Pending,
	Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
	pub data: Vec<u8>,
	pub inclusion_proof: Option<InclusionProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
	pub data: Vec<u8>,
	pub inclusion_proof: Option<InclusionProof>,
}

impl TokenTransaction {
	pub fn is_confirmed(&self) -> bool {
		self.inclusion_proof.is_some()
	}
}

/// Genesis plus the ordered transaction history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
	pub genesis: Genesis,
	pub transactions: Vec<TokenTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
	pub id: TokenId,
	pub coin_id: CoinId,
	pub amount: u64,
	pub status: TokenStatus,
	pub state: TokenState,
	#[serde(default)]
	pub archived: bool,
}

impl Token {
	/// A freshly minted token whose genesis is `genesis_data`.
	pub fn minted(
		id: TokenId,
		coin_id: CoinId,
		amount: u64,
		genesis_data: Vec<u8>,
		proof: Option<InclusionProof>,
	) -> Self {
		let status = if proof.is_some() {
			TokenStatus::Confirmed
		} else {
			TokenStatus::Pending
		};

		Self {
			id,
			coin_id,
			amount,
			status,
			state: TokenState {
				genesis: Genesis {
					data: genesis_data,
					inclusion_proof: proof,
				},
				transactions: Vec::new(),
			},
			archived: false,
		}
	}

	pub fn is_active(&self) -> bool {
		!self.archived
	}

	/// Opaque bytes of the current state.
	pub fn serialized_state(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(&self.state)
	}

	/// SHA-256 hex digest identifying the current state.
	///
	/// Hashes the state fields directly so it cannot fail and stays stable
	/// across serializer versions.
	pub fn state_hash(&self) -> String {
		let mut hasher = Sha256::new();
		hasher.update(self.id.0.as_bytes());
		hash_part(&mut hasher, &self.state.genesis.data, &self.state.genesis.inclusion_proof);
		for tx in &self.state.transactions {
			hash_part(&mut hasher, &tx.data, &tx.inclusion_proof);
		}
		hex::encode(hasher.finalize())
	}

	/// This token with one more transaction appended.
	pub fn with_transaction(&self, data: Vec<u8>, proof: Option<InclusionProof>) -> Self {
		let mut next = self.clone();
		next.state.transactions.push(TokenTransaction {
			data,
			inclusion_proof: proof,
		});
		next.status = if next.has_unconfirmed_transactions() {
			TokenStatus::Pending
		} else {
			TokenStatus::Confirmed
		};
		next
	}

	pub fn has_unconfirmed_transactions(&self) -> bool {
		self.state.transactions.iter().any(|tx| !tx.is_confirmed())
	}

	/// The last state the network confirmed: history is cut at the first
	/// transaction lacking an inclusion proof.
	pub fn revert_to_committed_state(&self) -> Self {
		let mut reverted = self.clone();
		let confirmed = reverted
			.state
			.transactions
			.iter()
			.take_while(|tx| tx.is_confirmed())
			.count();
		reverted.state.transactions.truncate(confirmed);
		reverted.status = if reverted.state.genesis.inclusion_proof.is_some() {
			TokenStatus::Confirmed
		} else {
			TokenStatus::Pending
		};
		reverted
	}

	pub fn tombstone(&self) -> Tombstone {
		Tombstone {
			token_id: self.id.clone(),
			state_hash: self.state_hash(),
		}
	}
}

fn hash_part(hasher: &mut Sha256, data: &[u8], proof: &Option<InclusionProof>) {
	hasher.update((data.len() as u64).to_be_bytes());
	hasher.update(data);
	match proof {
		Some(proof) => {
			hasher.update([1]);
			hasher.update(proof.request_id.0.as_bytes());
			hasher.update((proof.data.len() as u64).to_be_bytes());
			hasher.update(&proof.data);
		}
		None => hasher.update([0]),
	}
}

/// Permanent record that a token state was spent. A token matching a
/// tombstone is never imported again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tombstone {
	pub token_id: TokenId,
	pub state_hash: String,
}

impl Tombstone {
	pub fn matches(&self, token: &Token) -> bool {
		self.token_id == token.id && self.state_hash == token.state_hash()
	}
}
