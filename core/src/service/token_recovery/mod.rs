//! Classify failed ledger submissions and put the local inventory back in
//! line with what the ledger actually holds.

mod classify;
pub mod orphan;

pub use classify::ErrorClass;
pub use orphan::{candidate_splits, change_token_id, recipient_token_id};

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
	config::RecoveryConfig,
	domain::{CoinId, InclusionProof, SplitParams, Token, TokenId, Tombstone},
	infra::{
		event::{EventBus, WalletEvent},
		ledger::{FailureStatus, LedgerClient, LedgerError},
		store::{Inventory, StoreError},
	},
};

#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Local store error: {0}")]
	Store(#[from] StoreError),
	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),
}

/// What [`TokenRecoveryService::handle_transfer_failure`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
	/// The ledger could not be reached; the token is left as it was
	Deferred,
	/// The token state is spent and was archived
	Archived(Tombstone),
	/// The token was reverted to its last confirmed state and kept
	Reverted(Token),
	/// The reverted state turned out to be spent as well
	ArchivedAfterRevert(Tombstone),
}

pub struct TokenRecoveryService {
	inventory: Arc<Inventory>,
	ledger: Arc<dyn LedgerClient>,
	events: EventBus,
	config: RecoveryConfig,
	call_timeout: Duration,
}

impl TokenRecoveryService {
	pub fn new(
		config: RecoveryConfig,
		inventory: Arc<Inventory>,
		ledger: Arc<dyn LedgerClient>,
		events: EventBus,
		call_timeout: Duration,
	) -> Self {
		Self {
			inventory,
			ledger,
			events,
			config,
			call_timeout,
		}
	}

	/// Bounded spent check for the token's current state.
	pub async fn is_spent(&self, token: &Token) -> Result<bool, LedgerError> {
		match tokio::time::timeout(self.call_timeout, self.ledger.check_spent(token)).await {
			Ok(result) => result,
			Err(_) => Err(LedgerError::Timeout),
		}
	}

	/// Transient failures are classified without contacting the ledger.
	/// Everything else is decided by a spent check, never by the status text
	/// alone.
	pub async fn classify_error(&self, status: &FailureStatus, token: &Token) -> ErrorClass {
		if status.is_transient() {
			return ErrorClass::NetworkError;
		}

		match self.is_spent(token).await {
			Ok(spent) => ErrorClass::after_spent_check(status, spent),
			Err(e) => {
				debug!(token_id = %token.id, error = %e, "Spent check failed during classification");
				ErrorClass::NetworkError
			}
		}
	}

	pub async fn handle_transfer_failure(
		&self,
		token: &Token,
		status: &FailureStatus,
	) -> Result<RecoveryAction, RecoveryError> {
		let class = self.classify_error(status, token).await;
		debug!(token_id = %token.id, ?status, ?class, "Classified transfer failure");

		match class {
			ErrorClass::NetworkError => Ok(RecoveryAction::Deferred),
			ErrorClass::AlreadySpent => {
				let tombstone = self.archive_spent(token)?;
				Ok(RecoveryAction::Archived(tombstone))
			}
			_ => {
				let reverted = token.revert_to_committed_state();
				if !self.inventory.put_token(&reverted)? {
					let tombstone = self.archive_spent(token)?;
					info!(token_id = %token.id, "Reverted token state already tombstoned, archived");
					return Ok(RecoveryAction::ArchivedAfterRevert(tombstone));
				}

				match self.is_spent(&reverted).await {
					Ok(true) => {
						let tombstone = self.archive_spent(&reverted)?;
						info!(token_id = %token.id, "Reverted token state is spent, archived");
						Ok(RecoveryAction::ArchivedAfterRevert(tombstone))
					}
					Ok(false) => {
						info!(
							token_id = %token.id,
							transactions = reverted.state.transactions.len(),
							"Reverted token to its last confirmed state"
						);
						self.emit_inventory_updated();
						Ok(RecoveryAction::Reverted(reverted))
					}
					Err(e) => {
						warn!(token_id = %token.id, error = %e, "Spent re-check failed, keeping reverted token");
						self.emit_inventory_updated();
						Ok(RecoveryAction::Reverted(reverted))
					}
				}
			}
		}
	}

	/// Archive `token` and tombstone its state, whether or not the inventory
	/// holds it.
	pub fn archive_spent(&self, token: &Token) -> Result<Tombstone, StoreError> {
		let tombstone = match self.inventory.get_token(&token.id)? {
			Some(local) if local.state_hash() == token.state_hash() => {
				self.inventory.archive_token(&token.id)?
			}
			_ => None,
		};

		let tombstone = match tombstone {
			Some(tombstone) => tombstone,
			None => {
				let tombstone = token.tombstone();
				self.inventory.add_tombstone(&tombstone)?;
				tombstone
			}
		};

		info!(token_id = %token.id, state_hash = %tombstone.state_hash, "Archived spent token");
		self.emit_inventory_updated();

		Ok(tombstone)
	}

	/// Record the change token of a confirmed split.
	///
	/// Returns `None` when the change state is already tombstoned.
	pub fn record_change_token(
		&self,
		source: &TokenId,
		split: &SplitParams,
		proof: Option<InclusionProof>,
	) -> Result<Option<Token>, StoreError> {
		let token = orphan::change_token(source, split, proof);
		if !self.inventory.put_token(&token)? {
			return Ok(None);
		}
		info!(
			token_id = %token.id,
			source = %source,
			amount = token.amount,
			"Recorded split change token"
		);
		self.emit_inventory_updated();
		Ok(Some(token))
	}

	/// Find the change token of a split whose outbox entry was lost or failed
	/// after the burn went through.
	///
	/// Known parameters are tried first. Candidates already held locally are
	/// skipped; the first candidate the ledger knows is imported.
	pub async fn recover_orphaned_split(
		&self,
		source: &TokenId,
		coin_id: &CoinId,
		total: u64,
		known: Option<&SplitParams>,
	) -> Result<Option<Token>, RecoveryError> {
		let limit = self.config.max_split_candidates;
		let mut candidates = Vec::new();
		if let Some(split) = known {
			candidates.push((split.split_amount, split.remainder));
		}
		if self.config.enumerate_splits {
			for pair in candidate_splits(total, limit) {
				if !candidates.contains(&pair) {
					candidates.push(pair);
				}
			}
		}
		candidates.truncate(limit.max(1));

		for (split_amount, remainder) in candidates {
			let id = change_token_id(source, split_amount, remainder);
			if self.inventory.contains(&id)? {
				debug!(token_id = %id, "Change candidate already held");
				continue;
			}

			let exists =
				match tokio::time::timeout(self.call_timeout, self.ledger.token_exists(&id)).await {
					Ok(result) => result?,
					Err(_) => return Err(LedgerError::Timeout.into()),
				};
			if !exists {
				continue;
			}

			let split = SplitParams {
				total,
				split_amount,
				remainder,
				coin_id: coin_id.clone(),
			};
			let Some(token) = self.record_change_token(source, &split, None)? else {
				debug!(token_id = %id, "Change candidate already spent");
				continue;
			};
			info!(source = %source, split_amount, remainder, "Recovered orphaned split change");
			return Ok(Some(token));
		}

		debug!(source = %source, "No orphaned split change found");
		Ok(None)
	}

	fn emit_inventory_updated(&self) {
		match self.inventory.active_count() {
			Ok(active_tokens) => {
				self.events
					.emit(WalletEvent::InventoryUpdated { active_tokens });
			}
			Err(e) => warn!(error = %e, "Failed to count inventory for event"),
		}
	}
}
