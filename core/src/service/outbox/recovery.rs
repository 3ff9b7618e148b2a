use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{backoff::is_due, OutboxError, OutboxService, ProcessOutcome};
use crate::domain::{EntryId, OutboxStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
	/// First pass after the process starts; backoff is ignored
	Startup,
	Periodic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
	/// Another pass was already running, nothing was done
	pub skipped: bool,
	pub scanned: usize,
	pub completed: usize,
	pub waiting: usize,
	pub retrying: usize,
	pub failed: usize,
	pub busy: usize,
	/// Not yet due under backoff
	pub deferred: usize,
	/// Failed entries left alone: retry ceiling reached or source spent
	pub abandoned: usize,
	pub errors: usize,
	pub purged: usize,
}

impl RecoveryReport {
	fn record(&mut self, outcome: &ProcessOutcome) {
		match outcome {
			ProcessOutcome::Completed => self.completed += 1,
			ProcessOutcome::Waiting(_) => self.waiting += 1,
			ProcessOutcome::Retrying { .. } => self.retrying += 1,
			ProcessOutcome::Failed(_) => self.failed += 1,
			ProcessOutcome::Busy => self.busy += 1,
		}
	}
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

impl OutboxService {
	/// Resume every incomplete entry, oldest first.
	///
	/// Only one pass runs at a time per process; an overlapping call returns
	/// a report with `skipped` set. A failure on one entry never stops the
	/// pass.
	pub async fn run_recovery_pass(&self, trigger: RecoveryTrigger) -> RecoveryReport {
		if self
			.is_recovering
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			debug!(?trigger, "Outbox recovery pass already running");
			return RecoveryReport {
				skipped: true,
				..Default::default()
			};
		}
		let _guard = PassGuard(&self.is_recovering);

		let mut report = RecoveryReport::default();
		let entries = match self.repo.list_incomplete() {
			Ok(entries) => entries,
			Err(e) => {
				warn!(error = %e, "Failed to list outbox entries for recovery");
				report.errors += 1;
				return report;
			}
		};

		let now = Utc::now();
		for entry in entries {
			report.scanned += 1;

			if trigger == RecoveryTrigger::Periodic && !is_due(&entry, now, &self.config) {
				report.deferred += 1;
				continue;
			}

			let result = if entry.status == OutboxStatus::Failed {
				if entry.retry_count >= self.config.max_retries {
					report.abandoned += 1;
					continue;
				}
				self.resume_failed(&entry.id).await
			} else {
				self.process_entry(&entry.id).await.map(Some)
			};

			match result {
				Ok(Some(outcome)) => report.record(&outcome),
				Ok(None) => report.abandoned += 1,
				Err(e) => {
					warn!(entry_id = %entry.id, error = %e, "Failed to resume outbox entry");
					report.errors += 1;
				}
			}
		}

		let cutoff = Utc::now() - self.config.completed_retention();
		match self.repo.purge_completed_before(cutoff) {
			Ok(purged) => report.purged = purged,
			Err(e) => {
				warn!(error = %e, "Failed to purge completed outbox entries");
				report.errors += 1;
			}
		}

		if report.scanned > 0 || report.purged > 0 {
			info!(
				?trigger,
				scanned = report.scanned,
				completed = report.completed,
				waiting = report.waiting,
				retrying = report.retrying,
				failed = report.failed,
				deferred = report.deferred,
				purged = report.purged,
				"Outbox recovery pass finished"
			);
		}

		report
	}

	/// Run the startup pass. Callers should wait for it before accepting new
	/// operations.
	pub async fn recover_on_startup(&self) -> RecoveryReport {
		self.run_recovery_pass(RecoveryTrigger::Startup).await
	}

	/// Automatic retry of a failed entry below the retry ceiling. Each retry
	/// counts as an attempt.
	async fn resume_failed(&self, id: &EntryId) -> Result<Option<ProcessOutcome>, OutboxError> {
		let Some(_claim) = self.claim(id) else {
			return Ok(Some(ProcessOutcome::Busy));
		};

		let mut entry = self.repo.get(id)?.ok_or(OutboxError::NotFound(*id))?;
		if entry.status != OutboxStatus::Failed {
			return self.drive(&mut entry).await.map(Some);
		}

		entry.retry_count += 1;
		if !self.reopen_failed(&mut entry).await? {
			self.repo.save(&entry)?;
			return Ok(None);
		}

		self.drive(&mut entry).await.map(Some)
	}
}
