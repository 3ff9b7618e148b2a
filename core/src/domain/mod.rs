//! Wallet domain types

pub mod outbox;
pub mod snapshot;
pub mod token;

pub use outbox::{
	EntryId, OperationType, OutboxEntry, OutboxOperation, OutboxStatus, Recipient, SplitParams,
	TransitionError,
};
pub use snapshot::{ContentHash, InventorySnapshot, VersionRecord};
pub use token::{
	CoinId, Commitment, Genesis, InclusionProof, RequestId, Token, TokenId, TokenState,
	TokenStatus, TokenTransaction, Tombstone,
};
