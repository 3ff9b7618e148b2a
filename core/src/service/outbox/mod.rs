//! Crash-safe driver for multi-step token operations.
//!
//! Each operation is persisted as an [`OutboxEntry`] before anything leaves
//! the process, and its status is saved after every step. Whatever happens
//! in between, a later pass resumes from the saved status. Ledger
//! submissions are keyed by request id, so repeating one is harmless.

mod backoff;
mod package;
mod recovery;
mod steps;

pub use backoff::{backoff_delay, is_due};
pub use package::TransferPackage;
pub use recovery::{RecoveryReport, RecoveryTrigger};

use std::{
	collections::HashSet,
	future::Future,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Weak,
	},
	time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
	sync::broadcast,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
	config::OutboxConfig,
	domain::{
		EntryId, OperationType, OutboxEntry, OutboxOperation, OutboxStatus, TokenId,
		TransitionError,
	},
	infra::{
		event::{EventBus, WalletEvent},
		ledger::{FailureStatus, LedgerClient, LedgerError},
		store::{Inventory, OutboxRepository, StoreError},
		transport::{MessageTransport, TransportError},
	},
	service::{
		sync::{SyncEngine, SyncError},
		token_recovery::{RecoveryError, TokenRecoveryService},
		Service,
	},
};

#[derive(Debug, Error)]
pub enum OutboxError {
	#[error("Outbox store error: {0}")]
	Store(#[from] StoreError),
	#[error(transparent)]
	Transition(#[from] TransitionError),
	#[error("Pre-submission sync failed: {0}")]
	Sync(#[from] SyncError),
	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),
	#[error("Delivery failed: {0}")]
	Transport(#[from] TransportError),
	#[error("Token recovery failed: {0}")]
	Recovery(#[from] RecoveryError),
	#[error("Ledger rejected the commitment: {0:?}")]
	Rejected(FailureStatus),
	#[error("Outbox entry {0} not found")]
	NotFound(EntryId),
	#[error("Outbox entry {0} is not failed")]
	NotFailed(EntryId),
	#[error("Source token {0} is not in the inventory")]
	MissingSourceToken(TokenId),
	#[error("{0:?} operations consume no source token")]
	NoSourceToken(OperationType),
	#[error("{0:?} operations deliver nothing")]
	NothingToDeliver(OperationType),
	#[error("Step timed out after {0:?}")]
	Timeout(Duration),
	#[error("Invalid transfer package: {0}")]
	Package(#[from] serde_json::Error),
}

impl OutboxError {
	fn is_transient(&self) -> bool {
		match self {
			Self::Ledger(e) => e.is_transient(),
			Self::Timeout(_) => true,
			_ => false,
		}
	}
}

/// Where [`OutboxService::process_entry`] left an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
	Completed,
	/// Parked at a status that needs an external event, usually the proof
	Waiting(OutboxStatus),
	/// A step failed; the entry stays at its status until the next attempt
	Retrying { retry_count: u32, error: String },
	Failed(String),
	/// Another task in this process is driving the entry
	Busy,
}

/// Marks an entry as driven by one task until dropped.
struct Claim<'a> {
	in_flight: &'a Mutex<HashSet<EntryId>>,
	id: EntryId,
}

impl Drop for Claim<'_> {
	fn drop(&mut self) {
		self.in_flight.lock().remove(&self.id);
	}
}

pub struct OutboxService {
	this: Weak<OutboxService>,
	config: OutboxConfig,
	repo: OutboxRepository,
	inventory: Arc<Inventory>,
	sync: Arc<SyncEngine>,
	ledger: Arc<dyn LedgerClient>,
	transport: Arc<dyn MessageTransport>,
	token_recovery: Arc<TokenRecoveryService>,
	events: EventBus,
	in_flight: Mutex<HashSet<EntryId>>,
	is_recovering: AtomicBool,
	is_running: Arc<AtomicBool>,
	shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl OutboxService {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: OutboxConfig,
		repo: OutboxRepository,
		inventory: Arc<Inventory>,
		sync: Arc<SyncEngine>,
		ledger: Arc<dyn LedgerClient>,
		transport: Arc<dyn MessageTransport>,
		token_recovery: Arc<TokenRecoveryService>,
		events: EventBus,
	) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			config,
			repo,
			inventory,
			sync,
			ledger,
			transport,
			token_recovery,
			events,
			in_flight: Mutex::new(HashSet::new()),
			is_recovering: AtomicBool::new(false),
			is_running: Arc::new(AtomicBool::new(false)),
			shutdown_tx: Mutex::new(None),
		})
	}

	pub fn repository(&self) -> &OutboxRepository {
		&self.repo
	}

	/// Persist a new entry for `operation`. Nothing is sent yet.
	pub fn enqueue(&self, operation: OutboxOperation) -> Result<OutboxEntry, OutboxError> {
		let entry = OutboxEntry::new(operation);
		self.repo.save(&entry)?;

		info!(
			entry_id = %entry.id,
			operation = ?entry.operation.operation_type(),
			request_id = %entry.operation.request_id(),
			"Outbox entry created"
		);

		Ok(entry)
	}

	/// Enqueue `operation` and drive it as far as it goes right now.
	pub async fn execute(
		&self,
		operation: OutboxOperation,
	) -> Result<(EntryId, ProcessOutcome), OutboxError> {
		let entry = self.enqueue(operation)?;
		let outcome = self.process_entry(&entry.id).await?;
		Ok((entry.id, outcome))
	}

	/// Drive one entry from its saved status until it completes, fails, or
	/// has to wait.
	pub async fn process_entry(&self, id: &EntryId) -> Result<ProcessOutcome, OutboxError> {
		let Some(_claim) = self.claim(id) else {
			debug!(entry_id = %id, "Outbox entry already being processed");
			return Ok(ProcessOutcome::Busy);
		};

		let mut entry = self.repo.get(id)?.ok_or(OutboxError::NotFound(*id))?;
		self.drive(&mut entry).await
	}

	pub fn list_failed(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
		Ok(self.repo.list_with_status(OutboxStatus::Failed)?)
	}

	/// Manually retry a failed entry, resetting its attempt count. It resumes
	/// at the status it failed at; an entry that never got its commitment
	/// accepted is left failed when its source was spent by someone else.
	pub async fn retry_failed(&self, id: &EntryId) -> Result<ProcessOutcome, OutboxError> {
		let Some(_claim) = self.claim(id) else {
			return Ok(ProcessOutcome::Busy);
		};

		let mut entry = self.repo.get(id)?.ok_or(OutboxError::NotFound(*id))?;
		if entry.status != OutboxStatus::Failed {
			return Err(OutboxError::NotFailed(*id));
		}

		entry.retry_count = 0;
		if !self.reopen_failed(&mut entry).await? {
			self.repo.save(&entry)?;
			return Ok(ProcessOutcome::Failed(
				entry.last_error.clone().unwrap_or_default(),
			));
		}

		self.drive(&mut entry).await
	}

	fn claim(&self, id: &EntryId) -> Option<Claim<'_>> {
		self.in_flight.lock().insert(*id).then(|| Claim {
			in_flight: &self.in_flight,
			id: *id,
		})
	}

	async fn drive(&self, entry: &mut OutboxEntry) -> Result<ProcessOutcome, OutboxError> {
		loop {
			match entry.status {
				OutboxStatus::Completed => return Ok(ProcessOutcome::Completed),
				OutboxStatus::Failed => {
					return Ok(ProcessOutcome::Failed(
						entry.last_error.clone().unwrap_or_default(),
					))
				}
				_ => {}
			}

			let from = entry.status;
			match self.step(entry).await {
				Ok(steps::Step::Advanced) => {
					if entry.status != OutboxStatus::Failed {
						entry.retry_count = 0;
						entry.last_error = None;
					}
					self.repo.save(entry)?;
					debug!(entry_id = %entry.id, %from, to = %entry.status, "Outbox entry advanced");
					if entry.status == OutboxStatus::Failed {
						self.on_entry_failed(entry).await;
					}
				}
				Ok(steps::Step::Waiting) => {
					debug!(entry_id = %entry.id, status = %entry.status, "Outbox entry waiting");
					return Ok(ProcessOutcome::Waiting(entry.status));
				}
				Err(OutboxError::Store(e)) => return Err(e.into()),
				Err(e) => return self.record_step_failure(entry, e).await,
			}
		}
	}

	async fn record_step_failure(
		&self,
		entry: &mut OutboxEntry,
		error: OutboxError,
	) -> Result<ProcessOutcome, OutboxError> {
		entry.retry_count += 1;
		entry.last_error = Some(error.to_string());
		entry.updated_at = Utc::now();

		if entry.retry_count >= self.config.max_retries {
			let reason = format!("gave up after {} attempts: {error}", entry.retry_count);
			entry.fail(reason.clone())?;
			self.repo.save(entry)?;
			self.on_entry_failed(entry).await;
			return Ok(ProcessOutcome::Failed(reason));
		}

		self.repo.save(entry)?;
		warn!(
			entry_id = %entry.id,
			status = %entry.status,
			retry_count = entry.retry_count,
			transient = error.is_transient(),
			error = %error,
			"Outbox step failed, will retry"
		);

		Ok(ProcessOutcome::Retrying {
			retry_count: entry.retry_count,
			error: error.to_string(),
		})
	}

	async fn on_entry_failed(&self, entry: &OutboxEntry) {
		let reason = entry.last_error.clone().unwrap_or_default();
		error!(
			entry_id = %entry.id,
			operation = ?entry.operation.operation_type(),
			reason = %reason,
			"Outbox entry failed"
		);
		self.events.emit(WalletEvent::OutboxEntryFailed {
			entry_id: entry.id,
			reason,
		});

		// a failed split may still have burned its source
		let (Some(source), Some(split)) =
			(entry.operation.source_token_id(), entry.operation.split())
		else {
			return;
		};
		match self
			.token_recovery
			.recover_orphaned_split(source, &split.coin_id, split.total, Some(split))
			.await
		{
			Ok(Some(token)) => {
				info!(entry_id = %entry.id, token_id = %token.id, "Recovered change of failed split")
			}
			Ok(None) => {}
			Err(e) => warn!(entry_id = %entry.id, error = %e, "Orphaned split recovery failed"),
		}
	}

	async fn bounded<T, E>(
		&self,
		call: impl Future<Output = Result<T, E>>,
	) -> Result<T, OutboxError>
	where
		E: Into<OutboxError>,
	{
		let limit = self.config.step_timeout();
		match tokio::time::timeout(limit, call).await {
			Ok(result) => result.map_err(Into::into),
			Err(_) => Err(OutboxError::Timeout(limit)),
		}
	}
}

#[async_trait]
impl Service for OutboxService {
	async fn start(&self) -> crate::Result<()> {
		if self.is_running.load(Ordering::SeqCst) {
			warn!("Outbox service already running");
			return Ok(());
		}
		let Some(this) = self.this.upgrade() else {
			return Ok(());
		};

		let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
		*self.shutdown_tx.lock() = Some(shutdown_tx);
		self.is_running.store(true, Ordering::SeqCst);

		let period = self.config.retry_interval();
		tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = shutdown_rx.recv() => {
						debug!("Outbox retry loop received shutdown signal");
						break;
					}
					_ = ticker.tick() => {
						this.run_recovery_pass(RecoveryTrigger::Periodic).await;
					}
				}
			}

			this.is_running.store(false, Ordering::SeqCst);
		});

		info!(interval = ?period, "Outbox service started");

		Ok(())
	}

	async fn stop(&self) -> crate::Result<()> {
		if !self.is_running.load(Ordering::SeqCst) {
			return Ok(());
		}

		if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
			let _ = shutdown_tx.send(());
		}
		self.is_running.store(false, Ordering::SeqCst);

		info!("Outbox service stopped");

		Ok(())
	}

	fn is_running(&self) -> bool {
		self.is_running.load(Ordering::SeqCst)
	}

	fn name(&self) -> &'static str {
		"outbox"
	}
}
