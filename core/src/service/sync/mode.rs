//! Per-call choice of how much remote work a sync pass does.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::domain::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
	Local,
	Nametag,
	Recovery,
	InstantSend,
	InstantReceive,
	Fast,
	Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
	Outgoing,
	Incoming,
}

/// What the caller of a sync pass is in the middle of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncContext {
	pub local_only: bool,
	pub recovery: bool,
	pub nametag_only: bool,
	pub instant_send: bool,
	pub instant_receive: bool,
	pub direction: Option<TransferDirection>,
	pub incoming_tokens: Vec<TokenId>,
	pub pending_outbox: usize,
	pub completed_transfers: Vec<TokenId>,
}

impl SyncContext {
	pub fn normal() -> Self {
		Self::default()
	}

	pub fn local_only() -> Self {
		Self {
			local_only: true,
			..Default::default()
		}
	}

	pub fn recovery() -> Self {
		Self {
			recovery: true,
			..Default::default()
		}
	}

	pub fn nametag() -> Self {
		Self {
			nametag_only: true,
			..Default::default()
		}
	}

	/// Pre-submission sync run on behalf of outbox entries.
	pub fn for_outbox(pending: usize) -> Self {
		Self {
			pending_outbox: pending,
			..Default::default()
		}
	}

	pub fn instant_send() -> Self {
		Self {
			instant_send: true,
			direction: Some(TransferDirection::Outgoing),
			..Default::default()
		}
	}

	pub fn instant_receive(incoming: Vec<TokenId>) -> Self {
		Self {
			instant_receive: true,
			direction: Some(TransferDirection::Incoming),
			incoming_tokens: incoming,
			..Default::default()
		}
	}

	pub fn with_incoming(incoming: Vec<TokenId>) -> Self {
		Self {
			incoming_tokens: incoming,
			..Default::default()
		}
	}
}

/// First matching rule wins.
pub fn select_mode(context: &SyncContext, breaker_open: bool) -> SyncMode {
	if context.local_only || breaker_open {
		return SyncMode::Local;
	}
	if context.recovery {
		return SyncMode::Recovery;
	}
	if context.nametag_only {
		return SyncMode::Nametag;
	}
	if context.instant_send && context.direction == Some(TransferDirection::Outgoing) {
		return SyncMode::InstantSend;
	}
	if context.instant_receive && context.direction == Some(TransferDirection::Incoming) {
		return SyncMode::InstantReceive;
	}
	if !context.incoming_tokens.is_empty()
		|| context.pending_outbox > 0
		|| !context.completed_transfers.is_empty()
	{
		return SyncMode::Fast;
	}
	SyncMode::Normal
}

pub fn skip_remote_io(mode: SyncMode, remote_enabled: bool) -> bool {
	mode == SyncMode::Local || !remote_enabled
}

pub fn skip_remote_read(mode: SyncMode) -> bool {
	matches!(mode, SyncMode::Local | SyncMode::InstantSend)
}

pub fn skip_spent_detection(mode: SyncMode) -> bool {
	matches!(
		mode,
		SyncMode::Local | SyncMode::Fast | SyncMode::InstantSend | SyncMode::InstantReceive
	)
}

pub fn is_read_only(mode: SyncMode) -> bool {
	mode == SyncMode::Nametag
}

pub fn requires_lock(mode: SyncMode) -> bool {
	mode != SyncMode::Nametag
}

/// Opens after `threshold` consecutive failed passes and stays open for
/// `cooldown`, during which sync runs local-only.
pub struct CircuitBreaker {
	threshold: u32,
	cooldown: Duration,
	state: Mutex<BreakerState>,
}

#[derive(Default)]
struct BreakerState {
	consecutive_failures: u32,
	opened_at: Option<Instant>,
}

impl CircuitBreaker {
	pub fn new(threshold: u32, cooldown: Duration) -> Self {
		Self {
			threshold: threshold.max(1),
			cooldown,
			state: Mutex::new(BreakerState::default()),
		}
	}

	pub fn is_open(&self) -> bool {
		let mut state = self.state.lock();
		match state.opened_at {
			Some(opened) if opened.elapsed() < self.cooldown => true,
			Some(_) => {
				// half-open: let the next pass try the remote again
				state.opened_at = None;
				state.consecutive_failures = self.threshold - 1;
				false
			}
			None => false,
		}
	}

	pub fn record_success(&self) {
		let mut state = self.state.lock();
		state.consecutive_failures = 0;
		state.opened_at = None;
	}

	pub fn record_failure(&self) {
		let mut state = self.state.lock();
		state.consecutive_failures += 1;
		if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
			warn!(
				failures = state.consecutive_failures,
				cooldown = ?self.cooldown,
				"Remote sync circuit breaker opened"
			);
			state.opened_at = Some(Instant::now());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_rule_precedence() {
		let everything = SyncContext {
			local_only: true,
			recovery: true,
			nametag_only: true,
			instant_send: true,
			direction: Some(TransferDirection::Outgoing),
			pending_outbox: 1,
			..Default::default()
		};
		assert_eq!(select_mode(&everything, false), SyncMode::Local);

		let mut ctx = everything.clone();
		ctx.local_only = false;
		assert_eq!(select_mode(&ctx, false), SyncMode::Recovery);
		assert_eq!(select_mode(&ctx, true), SyncMode::Local);

		ctx.recovery = false;
		assert_eq!(select_mode(&ctx, false), SyncMode::Nametag);

		ctx.nametag_only = false;
		assert_eq!(select_mode(&ctx, false), SyncMode::InstantSend);

		ctx.instant_send = false;
		assert_eq!(select_mode(&ctx, false), SyncMode::Fast);

		ctx.pending_outbox = 0;
		assert_eq!(select_mode(&ctx, false), SyncMode::Normal);
	}

	#[test]
	fn test_instant_flags_must_match_direction() {
		let mismatched = SyncContext {
			instant_send: true,
			direction: Some(TransferDirection::Incoming),
			..Default::default()
		};
		assert_eq!(select_mode(&mismatched, false), SyncMode::Normal);

		let receive = SyncContext::instant_receive(vec![TokenId::from("t")]);
		assert_eq!(select_mode(&receive, false), SyncMode::InstantReceive);
		assert_eq!(
			select_mode(&SyncContext::with_incoming(vec![TokenId::from("t")]), false),
			SyncMode::Fast
		);
	}

	#[test]
	fn test_predicates() {
		assert!(skip_remote_io(SyncMode::Local, true));
		assert!(skip_remote_io(SyncMode::Normal, false));
		assert!(!skip_remote_io(SyncMode::Normal, true));

		assert!(skip_remote_read(SyncMode::InstantSend));
		assert!(!skip_remote_read(SyncMode::InstantReceive));

		for mode in [SyncMode::Local, SyncMode::Fast, SyncMode::InstantSend, SyncMode::InstantReceive] {
			assert!(skip_spent_detection(mode));
		}
		assert!(!skip_spent_detection(SyncMode::Normal));
		assert!(!skip_spent_detection(SyncMode::Recovery));

		assert!(is_read_only(SyncMode::Nametag));
		assert!(!requires_lock(SyncMode::Nametag));
		assert!(requires_lock(SyncMode::Recovery));
	}

	#[tokio::test(start_paused = true)]
	async fn test_breaker_opens_and_cools_down() {
		let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
		breaker.record_failure();
		breaker.record_failure();
		assert!(!breaker.is_open());

		breaker.record_failure();
		assert!(breaker.is_open());

		tokio::time::advance(Duration::from_secs(60)).await;
		assert!(!breaker.is_open());

		// one more failure in half-open state reopens it
		breaker.record_failure();
		assert!(breaker.is_open());

		breaker.record_success();
		assert!(!breaker.is_open());
	}
}
