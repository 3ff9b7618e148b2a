//! Persisted records of in-flight multi-step operations.
//!
//! An entry is written before any network call for its operation and then
//! advanced along [`OutboxStatus`]. Every step is resumable from the status
//! alone, which is what makes crash recovery possible.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::token::{CoinId, Commitment, InclusionProof, RequestId, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for EntryId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EntryId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// How a split divides its source token. Persisted with the entry so orphan
/// recovery can rebuild the change token without guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitParams {
	pub total: u64,
	pub split_amount: u64,
	pub remainder: u64,
	pub coin_id: CoinId,
}

/// Public handle of the peer an operation delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipient(pub String);

impl fmt::Display for Recipient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
	MintNametag,
	Transfer,
	SplitMint,
	SplitBurn,
	InstantSend,
	InstantSplit,
}

/// The operation an entry drives, each variant with exactly its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxOperation {
	MintNametag {
		nametag: String,
		commitment: Commitment,
	},
	Transfer {
		source_token_id: TokenId,
		recipient: Recipient,
		commitment: Commitment,
	},
	/// Mints one side of a split. Without a recipient it is the change token
	/// that stays in the local inventory.
	SplitMint {
		source_token_id: TokenId,
		recipient: Option<Recipient>,
		commitment: Commitment,
		split: SplitParams,
	},
	SplitBurn {
		source_token_id: TokenId,
		commitment: Commitment,
		split: SplitParams,
	},
	InstantSend {
		source_token_id: TokenId,
		recipient: Recipient,
		commitment: Commitment,
	},
	InstantSplit {
		source_token_id: TokenId,
		recipient: Recipient,
		commitment: Commitment,
		split: SplitParams,
	},
}

impl OutboxOperation {
	pub fn operation_type(&self) -> OperationType {
		match self {
			Self::MintNametag { .. } => OperationType::MintNametag,
			Self::Transfer { .. } => OperationType::Transfer,
			Self::SplitMint { .. } => OperationType::SplitMint,
			Self::SplitBurn { .. } => OperationType::SplitBurn,
			Self::InstantSend { .. } => OperationType::InstantSend,
			Self::InstantSplit { .. } => OperationType::InstantSplit,
		}
	}

	pub fn commitment(&self) -> &Commitment {
		match self {
			Self::MintNametag { commitment, .. }
			| Self::Transfer { commitment, .. }
			| Self::SplitMint { commitment, .. }
			| Self::SplitBurn { commitment, .. }
			| Self::InstantSend { commitment, .. }
			| Self::InstantSplit { commitment, .. } => commitment,
		}
	}

	pub fn request_id(&self) -> &RequestId {
		&self.commitment().request_id
	}

	pub fn source_token_id(&self) -> Option<&TokenId> {
		match self {
			Self::MintNametag { .. } => None,
			Self::Transfer {
				source_token_id, ..
			}
			| Self::SplitMint {
				source_token_id, ..
			}
			| Self::SplitBurn {
				source_token_id, ..
			}
			| Self::InstantSend {
				source_token_id, ..
			}
			| Self::InstantSplit {
				source_token_id, ..
			} => Some(source_token_id),
		}
	}

	pub fn recipient(&self) -> Option<&Recipient> {
		match self {
			Self::MintNametag { .. } | Self::SplitBurn { .. } => None,
			Self::SplitMint { recipient, .. } => recipient.as_ref(),
			Self::Transfer { recipient, .. }
			| Self::InstantSend { recipient, .. }
			| Self::InstantSplit { recipient, .. } => Some(recipient),
		}
	}

	pub fn split(&self) -> Option<&SplitParams> {
		match self {
			Self::SplitMint { split, .. }
			| Self::SplitBurn { split, .. }
			| Self::InstantSplit { split, .. } => Some(split),
			_ => None,
		}
	}

	/// Mint-type commitments create a token; everything else consumes the
	/// source token state.
	pub fn is_mint(&self) -> bool {
		matches!(self, Self::MintNametag { .. } | Self::SplitMint { .. })
	}

	/// Instant variants notify the peer before the inclusion proof exists.
	pub fn is_instant(&self) -> bool {
		matches!(self, Self::InstantSend { .. } | Self::InstantSplit { .. })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
	PendingIpfsSync,
	ReadyToSubmit,
	Submitted,
	ProofReceived,
	NostrSent,
	ReadyToSend,
	Completed,
	Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid outbox transition: {from:?} -> {to:?}")]
pub struct TransitionError {
	pub from: OutboxStatus,
	pub to: OutboxStatus,
}

impl OutboxStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed)
	}

	/// Forward-only transition graph. `Failed` is reachable from any
	/// non-terminal status. A retry moves it back to the status the entry
	/// failed at, or to `ReadyToSubmit` when the attempt never got past
	/// submission.
	///
	/// `ReadyToSend` is only entered from `Submitted` by instant operations;
	/// confirmed deliveries go from `ProofReceived` straight to `NostrSent`.
	pub fn can_transition_to(self, next: Self) -> bool {
		use OutboxStatus::*;

		match (self, next) {
			(PendingIpfsSync, ReadyToSubmit) => true,
			(ReadyToSubmit, Submitted) => true,
			(Submitted, ProofReceived) => true,
			(Submitted, ReadyToSend) => true,
			(ProofReceived, NostrSent) => true,
			(ProofReceived, Completed) => true,
			(ReadyToSend, NostrSent) => true,
			(ReadyToSend, Completed) => true,
			(NostrSent, Completed) => true,
			(Failed, status) => status.is_resume_point(),
			(Completed, _) => false,
			(_, Failed) => true,
			_ => false,
		}
	}

	/// Statuses a failed entry can be moved back to.
	pub fn is_resume_point(self) -> bool {
		matches!(
			self,
			Self::ReadyToSubmit
				| Self::Submitted
				| Self::ProofReceived
				| Self::ReadyToSend
				| Self::NostrSent
		)
	}

	pub fn validate_transition(self, next: Self) -> Result<(), TransitionError> {
		if self.can_transition_to(next) {
			Ok(())
		} else {
			Err(TransitionError {
				from: self,
				to: next,
			})
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::PendingIpfsSync => "PENDING_IPFS_SYNC",
			Self::ReadyToSubmit => "READY_TO_SUBMIT",
			Self::Submitted => "SUBMITTED",
			Self::ProofReceived => "PROOF_RECEIVED",
			Self::NostrSent => "NOSTR_SENT",
			Self::ReadyToSend => "READY_TO_SEND",
			Self::Completed => "COMPLETED",
			Self::Failed => "FAILED",
		}
	}
}

impl fmt::Display for OutboxStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
	pub id: EntryId,
	pub operation: OutboxOperation,
	pub status: OutboxStatus,
	pub inclusion_proof: Option<InclusionProof>,
	pub final_artifact: Option<Vec<u8>>,
	/// Consecutive failed attempts since the entry last advanced.
	pub retry_count: u32,
	pub last_error: Option<String>,
	/// Status the entry was in when it moved to `Failed`.
	#[serde(default)]
	pub failed_at: Option<OutboxStatus>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
	pub fn new(operation: OutboxOperation) -> Self {
		let now = Utc::now();
		Self {
			id: EntryId::new(),
			operation,
			status: OutboxStatus::PendingIpfsSync,
			inclusion_proof: None,
			final_artifact: None,
			retry_count: 0,
			last_error: None,
			failed_at: None,
			created_at: now,
			updated_at: now,
		}
	}

	/// Move to `next`, stamping `updated_at`.
	pub fn advance(&mut self, next: OutboxStatus) -> Result<(), TransitionError> {
		self.status.validate_transition(next)?;
		self.status = next;
		self.updated_at = Utc::now();
		Ok(())
	}

	pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
		let from = self.status;
		self.advance(OutboxStatus::Failed)?;
		self.failed_at = Some(from);
		self.last_error = Some(reason.into());
		Ok(())
	}

	pub fn is_incomplete(&self) -> bool {
		!self.status.is_terminal()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use OutboxStatus::*;

	const ALL: [OutboxStatus; 8] = [
		PendingIpfsSync,
		ReadyToSubmit,
		Submitted,
		ProofReceived,
		NostrSent,
		ReadyToSend,
		Completed,
		Failed,
	];

	#[test]
	fn test_happy_path_transitions() {
		let confirmed = [
			PendingIpfsSync,
			ReadyToSubmit,
			Submitted,
			ProofReceived,
			NostrSent,
			Completed,
		];
		let instant = [
			PendingIpfsSync,
			ReadyToSubmit,
			Submitted,
			ReadyToSend,
			NostrSent,
			Completed,
		];
		for path in [&confirmed, &instant] {
			for pair in path.windows(2) {
				assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
			}
		}
		assert!(!ProofReceived.can_transition_to(ReadyToSend));
	}

	#[test]
	fn test_no_backwards_transitions() {
		assert!(!Submitted.can_transition_to(ReadyToSubmit));
		assert!(!ProofReceived.can_transition_to(Submitted));
		assert!(!NostrSent.can_transition_to(ReadyToSend));
		assert!(!ReadyToSubmit.can_transition_to(PendingIpfsSync));
	}

	#[test]
	fn test_failed_reachable_from_every_non_terminal_status() {
		for status in ALL {
			let expected = !matches!(status, Completed | Failed);
			assert_eq!(status.can_transition_to(Failed), expected, "{status}");
		}
	}

	#[test]
	fn test_completed_is_final_and_failed_only_resumes() {
		for status in ALL {
			assert!(!Completed.can_transition_to(status));
			let expected = !matches!(status, PendingIpfsSync | Completed | Failed);
			assert_eq!(Failed.can_transition_to(status), expected, "{status}");
		}
	}

	#[test]
	fn test_fail_remembers_where_the_entry_stopped() {
		let mut entry = OutboxEntry::new(OutboxOperation::MintNametag {
			nametag: "alice".into(),
			commitment: Commitment {
				request_id: RequestId("mint-alice".into()),
				source_state_hash: None,
				data: Vec::new(),
			},
		});
		entry.advance(ReadyToSubmit).unwrap();
		entry.advance(Submitted).unwrap();
		entry.fail("relay unreachable").unwrap();

		assert_eq!(entry.status, Failed);
		assert_eq!(entry.failed_at, Some(Submitted));
		entry.advance(Submitted).unwrap();
	}

	#[test]
	fn test_status_serializes_in_screaming_case() {
		let json = serde_json::to_string(&ReadyToSubmit).unwrap();
		assert_eq!(json, "\"READY_TO_SUBMIT\"");
	}
}
