use serde::{Deserialize, Serialize};

use crate::domain::{Commitment, InclusionProof, OperationType, Token};

/// What the recipient of a transfer receives: the token in its new state
/// plus the commitment that moved it there.
///
/// Instant variants are sent before the ledger proof exists, so
/// `inclusion_proof` may be absent; the recipient finalizes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPackage {
	pub operation: OperationType,
	pub token: Token,
	pub commitment: Commitment,
	pub inclusion_proof: Option<InclusionProof>,
}

impl TransferPackage {
	pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(bytes)
	}

	pub fn is_finalized(&self) -> bool {
		self.inclusion_proof.is_some()
	}
}
