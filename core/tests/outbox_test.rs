//! Outbox Tests
//!
//! Drives operations through the outbox against mock collaborators and
//! checks crash recovery, idempotent submission and failure handling.

mod helpers;

use std::sync::Arc;

use helpers::*;
use tracing_test::traced_test;
use tw_core::{
	domain::{
		CoinId, Commitment, OutboxEntry, OutboxOperation, OutboxStatus, Recipient, RequestId,
		SplitParams, Token,
	},
	infra::{
		event::WalletEvent,
		ledger::{FailureStatus, LedgerClient, SubmitStatus},
		store::MemoryStore,
	},
	service::{
		outbox::{ProcessOutcome, RecoveryTrigger},
		token_recovery::change_token_id,
	},
};

fn mint_commitment(tag: &str) -> Commitment {
	Commitment {
		request_id: RequestId(format!("mint-{tag}")),
		source_state_hash: None,
		data: tag.as_bytes().to_vec(),
	}
}

fn split(total: u64, split_amount: u64) -> SplitParams {
	SplitParams {
		total,
		split_amount,
		remainder: total - split_amount,
		coin_id: CoinId("uct".into()),
	}
}

/// Persist `entry` as if a previous process got it to `status`.
fn park(entry: &mut OutboxEntry, path: &[OutboxStatus]) -> anyhow::Result<()> {
	for status in path {
		entry.advance(*status)?;
	}
	Ok(())
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_transfer_completes_and_delivers() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;

	let (id, outcome) = wallet.submit(transfer(&source, "bob")).await?;
	assert_eq!(outcome, ProcessOutcome::Completed);

	let entry = wallet.outbox().repository().get(&id)?.expect("entry kept");
	assert_eq!(entry.status, OutboxStatus::Completed);
	assert!(entry.inclusion_proof.is_some());

	assert_eq!(world.ledger.accepted_count(), 1);
	assert_eq!(wallet.inventory().active_count()?, 0);
	assert!(wallet.inventory().is_tombstoned(&source)?);

	let delivered = world.transport.delivered_packages();
	assert_eq!(delivered.len(), 1);
	let (recipient, package) = &delivered[0];
	assert_eq!(recipient, &Recipient("bob".into()));
	assert_eq!(package.token.id, source.id);
	assert_eq!(package.token.state.transactions.len(), 1);
	assert!(package.is_finalized());

	// the pre-submission sync published the wallet before anything was sent
	assert!(world.remote.record("wallet").is_some());
	assert!(logs_contain("Transfer package delivered"));

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_submitted_does_not_resubmit() -> anyhow::Result<()> {
	let world = World::new();
	let store = Arc::new(MemoryStore::new());

	let source = token("alpha", 100);
	let operation = transfer(&source, "bob");
	{
		let crashed = world.wallet_on(store.clone());
		crashed.inventory().put_token(&source)?;
		let mut entry = crashed.outbox().enqueue(operation.clone())?;

		world
			.ledger
			.submit_transfer_commitment(operation.commitment())
			.await?;
		park(&mut entry, &[OutboxStatus::ReadyToSubmit, OutboxStatus::Submitted])?;
		crashed.outbox().repository().save(&entry)?;
	}

	let restarted = world.wallet_on(store);
	let report = restarted.start().await?;

	assert_eq!(report.completed, 1);
	assert_eq!(world.ledger.submitted().len(), 1);
	assert_eq!(world.transport.delivery_count(), 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_crash_after_submit_recognizes_own_commitment() -> anyhow::Result<()> {
	let world = World::new();
	let store = Arc::new(MemoryStore::new());

	let source = token("alpha", 100);
	let operation = transfer(&source, "bob");
	{
		let crashed = world.wallet_on(store.clone());
		crashed.inventory().put_token(&source)?;
		let mut entry = crashed.outbox().enqueue(operation.clone())?;
		park(&mut entry, &[OutboxStatus::ReadyToSubmit])?;
		crashed.outbox().repository().save(&entry)?;

		// accepted by the ledger, but the process died before saving SUBMITTED
		world
			.ledger
			.submit_transfer_commitment(operation.commitment())
			.await?;
	}

	let restarted = world.wallet_on(store);
	let report = restarted.start().await?;

	assert_eq!(report.completed, 1);
	assert_eq!(world.ledger.submitted().len(), 1);
	assert_eq!(world.transport.delivery_count(), 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resubmitting_same_request_is_idempotent() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let commitment = mint_commitment("alice");
	world.ledger.submit_mint_commitment(&commitment).await?;

	let mut entry = wallet.outbox().enqueue(OutboxOperation::MintNametag {
		nametag: "alice".into(),
		commitment,
	})?;
	park(&mut entry, &[OutboxStatus::ReadyToSubmit])?;
	wallet.outbox().repository().save(&entry)?;

	let outcome = wallet.outbox().process_entry(&entry.id).await?;

	assert_eq!(outcome, ProcessOutcome::Completed);
	assert_eq!(world.ledger.duplicate_submissions(), 1);
	assert_eq!(world.ledger.accepted_count(), 1);
	assert_eq!(wallet.inventory().nametags()?, vec!["alice".to_owned()]);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_duplicate_is_not_submitted() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;

	let mut ready = wallet.outbox().enqueue(transfer(&source, "bob"))?;
	park(&mut ready, &[OutboxStatus::ReadyToSubmit])?;
	wallet.outbox().repository().save(&ready)?;

	let mut stale = wallet.outbox().enqueue(transfer(&source, "carol"))?;
	park(&mut stale, &[OutboxStatus::ReadyToSubmit])?;
	stale.fail("relay unreachable")?;
	stale.retry_count = 1;
	wallet.outbox().repository().save(&stale)?;

	let report = wallet.start().await?;

	assert_eq!(report.completed, 1);
	assert_eq!(report.abandoned, 1);
	assert_eq!(world.ledger.submitted(), vec![ready.operation.request_id().clone()]);

	let stale = wallet.outbox().repository().get(&stale.id)?.expect("entry kept");
	assert_eq!(stale.status, OutboxStatus::Failed);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_network_rejection_retries_without_spent_check() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;
	world.ledger.push_submit_response(Ok(SubmitStatus::Rejected(
		FailureStatus::from_message("TypeError: fetch failed"),
	)));

	let (id, outcome) = wallet.submit(transfer(&source, "bob")).await?;

	assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));
	// only the pre-submission check, classification never checked
	assert_eq!(world.ledger.spent_checks(), 1);
	assert_eq!(wallet.inventory().get_token(&source.id)?, Some(source.clone()));

	// the next attempt goes through
	let outcome = wallet.outbox().process_entry(&id).await?;
	assert_eq!(outcome, ProcessOutcome::Completed);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_already_spent_keeps_token() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;
	world
		.ledger
		.push_submit_response(Ok(SubmitStatus::Rejected(FailureStatus::AlreadySpent)));

	let (_, outcome) = wallet.submit(transfer(&source, "bob")).await?;

	let ProcessOutcome::Failed(reason) = outcome else {
		panic!("expected failure, got {outcome:?}");
	};
	assert!(reason.contains("reverted"));
	assert!(wallet.inventory().get_token(&source.id)?.expect("kept").is_active());
	assert_eq!(world.transport.delivery_count(), 0);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_fails_entry_and_notifies() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;
	let mut events = wallet.subscribe();

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;
	world.transport.set_offline(true);

	let (id, outcome) = wallet.submit(transfer(&source, "bob")).await?;
	assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));

	// confirmed transfers deliver straight from PROOF_RECEIVED
	let entry = wallet.outbox().repository().get(&id)?.expect("entry kept");
	assert_eq!(entry.status, OutboxStatus::ProofReceived);

	wallet.outbox().process_entry(&id).await?;
	let outcome = wallet.outbox().process_entry(&id).await?;
	assert!(matches!(outcome, ProcessOutcome::Failed(_)));

	let failed = wallet.outbox().list_failed()?;
	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].retry_count, 3);
	assert_eq!(failed[0].failed_at, Some(OutboxStatus::ProofReceived));

	let mut notified = false;
	while let Ok(event) = events.try_recv() {
		if let WalletEvent::OutboxEntryFailed { entry_id, .. } = event {
			assert_eq!(entry_id, id);
			notified = true;
		}
	}
	assert!(notified);

	// a manual retry after the relay is back delivers exactly once
	world.transport.set_offline(false);
	let outcome = wallet.outbox().retry_failed(&id).await?;
	assert_eq!(outcome, ProcessOutcome::Completed);
	assert_eq!(world.transport.delivery_count(), 1);
	assert_eq!(world.ledger.accepted_count(), 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_instant_send_delivers_before_proof() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;
	world.ledger.withhold_proofs(true);

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;

	let (_, outcome) = wallet
		.submit(OutboxOperation::InstantSend {
			source_token_id: source.id.clone(),
			recipient: Recipient("bob".into()),
			commitment: transfer_commitment(&source, "bob"),
		})
		.await?;

	assert_eq!(outcome, ProcessOutcome::Completed);
	let delivered = world.transport.delivered_packages();
	assert_eq!(delivered.len(), 1);
	assert!(!delivered[0].1.is_finalized());
	assert_eq!(wallet.inventory().active_count()?, 0);

	Ok(())
}

fn instant_send(source: &Token) -> OutboxOperation {
	OutboxOperation::InstantSend {
		source_token_id: source.id.clone(),
		recipient: Recipient("bob".into()),
		commitment: transfer_commitment(source, "bob"),
	}
}

fn instant_split(source: &Token) -> OutboxOperation {
	OutboxOperation::InstantSplit {
		source_token_id: source.id.clone(),
		recipient: Recipient("bob".into()),
		commitment: transfer_commitment(source, "split"),
		split: split(100, 25),
	}
}

/// An instant operation that ran out of delivery attempts is retried from
/// READY_TO_SEND and still reaches the recipient.
async fn retry_instant_after_failed_delivery(
	operation: impl FnOnce(&Token) -> OutboxOperation,
) -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;
	world.ledger.withhold_proofs(true);
	world.transport.set_offline(true);

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;

	let (id, outcome) = wallet.submit(operation(&source)).await?;
	assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));
	wallet.outbox().process_entry(&id).await?;
	let outcome = wallet.outbox().process_entry(&id).await?;
	assert!(matches!(outcome, ProcessOutcome::Failed(_)));

	let failed = wallet.outbox().repository().get(&id)?.expect("entry kept");
	assert_eq!(failed.failed_at, Some(OutboxStatus::ReadyToSend));
	assert_eq!(world.transport.delivery_count(), 0);

	world.transport.set_offline(false);
	let outcome = wallet.outbox().retry_failed(&id).await?;

	assert_eq!(outcome, ProcessOutcome::Completed);
	assert_eq!(world.transport.delivery_count(), 1);
	assert_eq!(world.ledger.accepted_count(), 1);
	assert!(wallet.outbox().list_failed()?.is_empty());

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_instant_send_retries_delivery() -> anyhow::Result<()> {
	retry_instant_after_failed_delivery(instant_send).await
}

#[tokio::test(start_paused = true)]
async fn test_failed_instant_split_retries_delivery() -> anyhow::Result<()> {
	retry_instant_after_failed_delivery(instant_split).await
}

#[tokio::test(start_paused = true)]
async fn test_instant_crash_after_submit_recognizes_own_commitment() -> anyhow::Result<()> {
	let world = World::new();
	let store = Arc::new(MemoryStore::new());
	world.ledger.withhold_proofs(true);

	let source = token("alpha", 100);
	let operation = instant_send(&source);
	{
		let crashed = world.wallet_on(store.clone());
		crashed.inventory().put_token(&source)?;
		let mut entry = crashed.outbox().enqueue(operation.clone())?;
		park(&mut entry, &[OutboxStatus::ReadyToSubmit])?;
		crashed.outbox().repository().save(&entry)?;

		// accepted, no proof yet, and the process died before saving SUBMITTED
		world
			.ledger
			.submit_transfer_commitment(operation.commitment())
			.await?;
	}

	let restarted = world.wallet_on(store);
	let report = restarted.start().await?;

	assert_eq!(report.completed, 1);
	assert_eq!(world.ledger.accepted_count(), 1);
	assert_eq!(world.ledger.duplicate_submissions(), 1);
	assert_eq!(world.transport.delivery_count(), 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_count_tracks_consecutive_failures() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;
	for _ in 0..2 {
		world.ledger.push_submit_response(Ok(SubmitStatus::Rejected(FailureStatus::Network(
			"connection reset".into(),
		))));
	}

	let (id, outcome) = wallet.submit(transfer(&source, "bob")).await?;
	assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));
	let outcome = wallet.outbox().process_entry(&id).await?;
	assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 2, .. }));

	// submission now succeeds; the delivery failure starts a fresh count
	world.transport.set_offline(true);
	let outcome = wallet.outbox().process_entry(&id).await?;
	assert!(matches!(outcome, ProcessOutcome::Retrying { retry_count: 1, .. }));

	let entry = wallet.outbox().repository().get(&id)?.expect("entry kept");
	assert_eq!(entry.status, OutboxStatus::ProofReceived);
	assert!(entry.last_error.as_deref().is_some_and(|e| e.contains("relay")));

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_split_burn_and_change_mint() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let source = token("alpha", 100);
	wallet.inventory().put_token(&source)?;
	let params = split(100, 30);

	let (_, burned) = wallet
		.submit(OutboxOperation::SplitBurn {
			source_token_id: source.id.clone(),
			commitment: transfer_commitment(&source, "burn"),
			split: params.clone(),
		})
		.await?;
	let (_, minted) = wallet
		.submit(OutboxOperation::SplitMint {
			source_token_id: source.id.clone(),
			recipient: None,
			commitment: mint_commitment("change"),
			split: params,
		})
		.await?;

	assert_eq!(burned, ProcessOutcome::Completed);
	assert_eq!(minted, ProcessOutcome::Completed);

	let active = wallet.inventory().active_tokens()?;
	assert_eq!(active.len(), 1);
	assert_eq!(active[0].id, change_token_id(&source.id, 30, 70));
	assert_eq!(active[0].amount, 70);
	assert!(active[0].state.genesis.inclusion_proof.is_some());

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_split_recovers_orphaned_change() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let source = token("alpha", 100);
	let change_id = change_token_id(&source.id, 40, 60);
	world.ledger.add_existing_token(change_id.clone());
	world.ledger.push_submit_response(Ok(SubmitStatus::Rejected(FailureStatus::Rejected(
		"mint conflict".into(),
	))));

	let (_, outcome) = wallet
		.submit(OutboxOperation::SplitMint {
			source_token_id: source.id.clone(),
			recipient: None,
			commitment: mint_commitment("change"),
			split: split(100, 40),
		})
		.await?;

	assert!(matches!(outcome, ProcessOutcome::Failed(_)));
	let recovered = wallet.inventory().get_token(&change_id)?.expect("change recovered");
	assert_eq!(recovered.amount, 60);
	assert_eq!(world.ledger.exists_checks(), 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_periodic_pass_respects_backoff() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;

	let mut entry = wallet.outbox().enqueue(OutboxOperation::MintNametag {
		nametag: "alice".into(),
		commitment: mint_commitment("alice"),
	})?;
	park(&mut entry, &[OutboxStatus::ReadyToSubmit])?;
	entry.retry_count = 2;
	wallet.outbox().repository().save(&entry)?;

	let periodic = wallet.outbox().run_recovery_pass(RecoveryTrigger::Periodic).await;
	assert_eq!(periodic.deferred, 1);
	assert!(world.ledger.submitted().is_empty());

	let startup = wallet.outbox().run_recovery_pass(RecoveryTrigger::Startup).await;
	assert_eq!(startup.completed, 1);
	assert_eq!(world.ledger.submitted().len(), 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_recovery_passes_do_not_overlap() -> anyhow::Result<()> {
	let world = World::new();
	let wallet = world.wallet();
	start(&wallet).await?;
	world.ledger.withhold_proofs(true);

	let mut entry = wallet.outbox().enqueue(OutboxOperation::MintNametag {
		nametag: "alice".into(),
		commitment: mint_commitment("alice"),
	})?;
	park(&mut entry, &[OutboxStatus::ReadyToSubmit, OutboxStatus::Submitted])?;
	wallet.outbox().repository().save(&entry)?;

	let (first, second) = tokio::join!(
		wallet.outbox().run_recovery_pass(RecoveryTrigger::Startup),
		wallet.outbox().run_recovery_pass(RecoveryTrigger::Startup),
	);

	assert!(!first.skipped);
	assert_eq!(first.waiting, 1);
	assert!(second.skipped);

	// a proof timeout is not a failed attempt
	let entry = wallet.outbox().repository().get(&entry.id)?.expect("entry kept");
	assert_eq!(entry.status, OutboxStatus::Submitted);
	assert_eq!(entry.retry_count, 0);

	Ok(())
}
