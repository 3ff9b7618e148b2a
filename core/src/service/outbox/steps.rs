//! One handler per outbox status. Each handler performs the work of its
//! status and moves the entry on; the caller persists after every move.

use std::cmp;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{OutboxError, OutboxService, TransferPackage};
use crate::{
	domain::{
		InclusionProof, OutboxEntry, OutboxOperation, OutboxStatus, RequestId, Token,
	},
	infra::ledger::{FailureStatus, SubmitStatus},
	service::{
		sync::SyncContext,
		token_recovery::{orphan, RecoveryAction},
	},
};

pub(super) enum Step {
	/// The entry moved to a new status
	Advanced,
	/// Nothing more can happen until an external event
	Waiting,
}

const SUPERSEDED: &str = "superseded: source token state was spent by another commitment";

impl OutboxService {
	pub(super) async fn step(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		match entry.status {
			OutboxStatus::PendingIpfsSync => self.sync_before_submit(entry).await,
			OutboxStatus::ReadyToSubmit => self.submit(entry).await,
			OutboxStatus::Submitted => self.await_proof(entry).await,
			OutboxStatus::ProofReceived => self.apply_proof(entry).await,
			OutboxStatus::ReadyToSend => self.send(entry).await,
			OutboxStatus::NostrSent => {
				entry.advance(OutboxStatus::Completed)?;
				Ok(Step::Advanced)
			}
			OutboxStatus::Completed | OutboxStatus::Failed => Ok(Step::Waiting),
		}
	}

	async fn sync_before_submit(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		let pending = self.repo.list_incomplete()?.len().max(1);
		let report = self.sync.sync(&SyncContext::for_outbox(pending)).await?;
		debug!(
			entry_id = %entry.id,
			action = ?report.action,
			local_version = report.local_version,
			"Synced before submission"
		);

		entry.advance(OutboxStatus::ReadyToSubmit)?;
		Ok(Step::Advanced)
	}

	async fn submit(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		let operation = entry.operation.clone();

		if !operation.is_mint() {
			let source = self.source_token(&operation)?;
			if self.bounded(self.ledger.check_spent(&source)).await? {
				return self.resolve_spent_source(entry).await;
			}
		}

		let commitment = operation.commitment();
		let status = if operation.is_mint() {
			self.bounded(self.ledger.submit_mint_commitment(commitment))
				.await?
		} else {
			self.bounded(self.ledger.submit_transfer_commitment(commitment))
				.await?
		};

		let duplicate = status == SubmitStatus::RequestIdExists;
		match status {
			SubmitStatus::Success | SubmitStatus::RequestIdExists => {
				info!(
					entry_id = %entry.id,
					request_id = %commitment.request_id,
					duplicate,
					"Commitment accepted by ledger"
				);
				entry.advance(OutboxStatus::Submitted)?;
				Ok(Step::Advanced)
			}
			SubmitStatus::Rejected(failure) => self.handle_rejection(entry, failure).await,
		}
	}

	/// The source state is already consumed. If our own commitment did it
	/// the entry went through before a crash; otherwise it lost the race.
	async fn resolve_spent_source(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		let request_id = entry.operation.request_id().clone();

		// instant commitments are accepted long before their proof exists
		if entry.operation.is_instant() {
			if self.is_own_commitment(entry).await? {
				info!(
					entry_id = %entry.id,
					request_id = %request_id,
					"Source already spent by this entry's own commitment"
				);
				entry.advance(OutboxStatus::Submitted)?;
			} else {
				warn!(entry_id = %entry.id, request_id = %request_id, "Outbox entry superseded");
				entry.fail(SUPERSEDED)?;
			}
			return Ok(Step::Advanced);
		}

		match self.poll_for_proof(&request_id).await? {
			Some(proof) => {
				info!(
					entry_id = %entry.id,
					request_id = %request_id,
					"Source already spent by this entry's own commitment"
				);
				entry.advance(OutboxStatus::Submitted)?;
				entry.inclusion_proof = Some(proof);
				entry.advance(OutboxStatus::ProofReceived)?;
			}
			None => {
				warn!(entry_id = %entry.id, request_id = %request_id, "Outbox entry superseded");
				entry.fail(SUPERSEDED)?;
			}
		}
		Ok(Step::Advanced)
	}

	/// Resubmit the entry's commitment; the ledger answers `RequestIdExists`
	/// only when this very commitment was accepted before.
	async fn is_own_commitment(&self, entry: &OutboxEntry) -> Result<bool, OutboxError> {
		let status = self
			.bounded(self.ledger.submit_transfer_commitment(entry.operation.commitment()))
			.await?;
		match status {
			SubmitStatus::RequestIdExists | SubmitStatus::Success => Ok(true),
			SubmitStatus::Rejected(failure) if failure.is_transient() => {
				Err(OutboxError::Rejected(failure))
			}
			SubmitStatus::Rejected(failure) => {
				debug!(entry_id = %entry.id, ?failure, "Resubmission rejected");
				Ok(false)
			}
		}
	}

	async fn handle_rejection(
		&self,
		entry: &mut OutboxEntry,
		failure: FailureStatus,
	) -> Result<Step, OutboxError> {
		if failure.is_transient() {
			return Err(OutboxError::Rejected(failure));
		}

		let reason = if entry.operation.is_mint() {
			format!("mint rejected by ledger: {failure:?}")
		} else {
			let source = self.source_token(&entry.operation)?;
			match self
				.token_recovery
				.handle_transfer_failure(&source, &failure)
				.await?
			{
				RecoveryAction::Deferred => return Err(OutboxError::Rejected(failure)),
				RecoveryAction::Archived(_) | RecoveryAction::ArchivedAfterRevert(_) => {
					"source token already spent".to_owned()
				}
				RecoveryAction::Reverted(_) => {
					format!("rejected by ledger: {failure:?}; source token reverted")
				}
			}
		};

		entry.fail(reason)?;
		Ok(Step::Advanced)
	}

	async fn await_proof(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		if entry.operation.is_instant() {
			// the peer is notified now; the proof is the recipient's concern
			self.package_bytes(entry)?;
			self.archive_source(entry)?;
			entry.advance(OutboxStatus::ReadyToSend)?;
			return Ok(Step::Advanced);
		}

		let request_id = entry.operation.request_id().clone();
		match self.poll_for_proof(&request_id).await? {
			Some(proof) => {
				debug!(entry_id = %entry.id, request_id = %request_id, "Inclusion proof received");
				entry.inclusion_proof = Some(proof);
				entry.advance(OutboxStatus::ProofReceived)?;
				Ok(Step::Advanced)
			}
			None => Ok(Step::Waiting),
		}
	}

	/// Apply the confirmed commitment to the local inventory.
	async fn apply_proof(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		let proof = entry.inclusion_proof.clone();
		let operation = entry.operation.clone();

		match &operation {
			OutboxOperation::MintNametag { nametag, .. } => {
				self.inventory.add_nametag(nametag)?;
				info!(entry_id = %entry.id, nametag = %nametag, "Nametag minted");
				entry.advance(OutboxStatus::Completed)?;
			}
			OutboxOperation::SplitBurn { .. } => {
				self.archive_source(entry)?;
				entry.advance(OutboxStatus::Completed)?;
			}
			OutboxOperation::SplitMint {
				source_token_id,
				recipient: None,
				split,
				..
			} => {
				let recorded = self
					.token_recovery
					.record_change_token(source_token_id, split, proof)?;
				if recorded.is_none() {
					warn!(entry_id = %entry.id, "Change token state already spent, nothing recorded");
				}
				entry.advance(OutboxStatus::Completed)?;
			}
			OutboxOperation::SplitMint {
				recipient: Some(_), ..
			} => {
				let bytes = self.package_bytes(entry)?;
				self.deliver(entry, bytes).await?;
			}
			OutboxOperation::Transfer { .. }
			| OutboxOperation::InstantSend { .. }
			| OutboxOperation::InstantSplit { .. } => {
				let bytes = self.package_bytes(entry)?;
				self.archive_source(entry)?;
				self.deliver(entry, bytes).await?;
			}
		}

		Ok(Step::Advanced)
	}

	/// Deliver an instant package built before the proof existed.
	async fn send(&self, entry: &mut OutboxEntry) -> Result<Step, OutboxError> {
		if entry.operation.recipient().is_none() {
			entry.advance(OutboxStatus::Completed)?;
			return Ok(Step::Advanced);
		}

		let bytes = self.package_bytes(entry)?;
		self.deliver(entry, bytes).await?;
		Ok(Step::Advanced)
	}

	/// The persisted package, built and stored on first use.
	fn package_bytes(&self, entry: &mut OutboxEntry) -> Result<Vec<u8>, OutboxError> {
		if let Some(bytes) = &entry.final_artifact {
			return Ok(bytes.clone());
		}
		let bytes = self.build_package(entry)?.to_bytes()?;
		entry.final_artifact = Some(bytes.clone());
		Ok(bytes)
	}

	/// Hand the package to the recipient and move to `NostrSent`, or straight
	/// to `Completed` when the recipient already spent the token.
	async fn deliver(&self, entry: &mut OutboxEntry, bytes: Vec<u8>) -> Result<(), OutboxError> {
		let Some(recipient) = entry.operation.recipient().cloned() else {
			return Err(OutboxError::NothingToDeliver(entry.operation.operation_type()));
		};
		let package = TransferPackage::from_bytes(&bytes)?;

		if self.bounded(self.ledger.check_spent(&package.token)).await? {
			info!(
				entry_id = %entry.id,
				token_id = %package.token.id,
				"Delivered token already spent by recipient, skipping send"
			);
			entry.advance(OutboxStatus::Completed)?;
			return Ok(());
		}

		let delivery_id = self.bounded(self.transport.deliver(&recipient, bytes)).await?;
		info!(
			entry_id = %entry.id,
			recipient = %recipient,
			delivery_id = %delivery_id,
			finalized = package.is_finalized(),
			"Transfer package delivered"
		);

		entry.advance(OutboxStatus::NostrSent)?;
		Ok(())
	}

	/// Move a failed entry back to where it can be retried.
	///
	/// Entries that failed after their commitment was accepted resume at the
	/// status they failed at. Earlier failures restart at `ReadyToSubmit`
	/// once the source is re-checked; returns `false`, leaving the entry
	/// failed, when the source state is spent by someone else.
	pub(super) async fn reopen_failed(&self, entry: &mut OutboxEntry) -> Result<bool, OutboxError> {
		let resume_at = match entry.failed_at {
			Some(status) if status.is_resume_point() && status != OutboxStatus::ReadyToSubmit => {
				status
			}
			_ => {
				if !self.source_unspent_or_own(entry).await? {
					entry.last_error = Some(SUPERSEDED.to_owned());
					debug!(entry_id = %entry.id, "Failed entry's source is spent, not retrying");
					return Ok(false);
				}
				OutboxStatus::ReadyToSubmit
			}
		};

		entry.advance(resume_at)?;
		entry.failed_at = None;
		self.repo.save(entry)?;
		info!(
			entry_id = %entry.id,
			status = %resume_at,
			retry_count = entry.retry_count,
			"Failed outbox entry reopened for retry"
		);
		Ok(true)
	}

	async fn source_unspent_or_own(&self, entry: &OutboxEntry) -> Result<bool, OutboxError> {
		if entry.operation.is_mint() {
			return Ok(true);
		}
		let source = self.source_token(&entry.operation)?;
		if !self.bounded(self.ledger.check_spent(&source)).await? {
			return Ok(true);
		}
		if entry.operation.is_instant() {
			return self.is_own_commitment(entry).await;
		}
		let own = self
			.bounded(self.ledger.get_inclusion_proof(entry.operation.request_id()))
			.await?;
		Ok(own.is_some())
	}

	/// Poll for the proof of `request_id` until it appears or the poll
	/// window closes.
	async fn poll_for_proof(
		&self,
		request_id: &RequestId,
	) -> Result<Option<InclusionProof>, OutboxError> {
		let interval = self.config.proof_poll_interval();
		let deadline = Instant::now() + self.config.proof_poll_timeout();

		loop {
			match self
				.bounded(self.ledger.get_inclusion_proof(request_id))
				.await
			{
				Ok(Some(proof)) => return Ok(Some(proof)),
				Ok(None) => {}
				Err(e) if e.is_transient() => {
					debug!(request_id = %request_id, error = %e, "Proof poll failed, polling again");
				}
				Err(e) => return Err(e),
			}

			let now = Instant::now();
			if now >= deadline {
				debug!(request_id = %request_id, "Inclusion proof not available yet");
				return Ok(None);
			}
			tokio::time::sleep(cmp::min(interval, deadline - now)).await;
		}
	}

	fn source_token(&self, operation: &OutboxOperation) -> Result<Token, OutboxError> {
		let Some(id) = operation.source_token_id() else {
			return Err(OutboxError::NoSourceToken(operation.operation_type()));
		};
		self.inventory
			.get_token(id)?
			.ok_or_else(|| OutboxError::MissingSourceToken(id.clone()))
	}

	fn archive_source(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
		let source = self.source_token(&entry.operation)?;
		if source.archived {
			return Ok(());
		}
		let tombstone = self.token_recovery.archive_spent(&source)?;
		debug!(entry_id = %entry.id, state_hash = %tombstone.state_hash, "Source token archived");
		Ok(())
	}

	/// The token the recipient ends up with.
	fn build_package(&self, entry: &OutboxEntry) -> Result<TransferPackage, OutboxError> {
		let proof = entry.inclusion_proof.clone();
		let operation = &entry.operation;
		let commitment = operation.commitment().clone();

		let token = match operation {
			OutboxOperation::Transfer { .. } | OutboxOperation::InstantSend { .. } => {
				let source = self.source_token(operation)?;
				let mut token = source.with_transaction(commitment.data.clone(), proof.clone());
				token.archived = false;
				token
			}
			OutboxOperation::InstantSplit {
				source_token_id,
				split,
				..
			}
			| OutboxOperation::SplitMint {
				source_token_id,
				split,
				..
			} => orphan::recipient_token(source_token_id, split, proof.clone()),
			OutboxOperation::MintNametag { .. } | OutboxOperation::SplitBurn { .. } => {
				return Err(OutboxError::NothingToDeliver(operation.operation_type()));
			}
		};

		Ok(TransferPackage {
			operation: operation.operation_type(),
			token,
			commitment,
			inclusion_proof: proof,
		})
	}
}
