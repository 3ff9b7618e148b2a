//! Wallet event bus
//!
//! Services report what they did here; the UI layer and tests subscribe.
//! Emitting never blocks and never fails: with no subscribers the event is
//! simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
	domain::EntryId,
	service::{leader::InstanceId, sync::SyncMode},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
	/// The set of active tokens changed
	InventoryUpdated { active_tokens: usize },
	SyncCompleted {
		mode: SyncMode,
		local_version: u64,
		remote_sequence: Option<u64>,
		published: bool,
	},
	SyncFailed { mode: SyncMode, error: String },
	/// Local state was found inconsistent with the remote and repaired
	RecoveryWarning {
		reason: String,
		recovered_tokens: usize,
	},
	/// An outbox entry reached `FAILED` and needs manual attention
	OutboxEntryFailed { entry_id: EntryId, reason: String },
	LeaderChanged {
		leader: Option<InstanceId>,
		is_self: bool,
	},
}

impl WalletEvent {
	pub fn event_type(&self) -> &'static str {
		match self {
			Self::InventoryUpdated { .. } => "InventoryUpdated",
			Self::SyncCompleted { .. } => "SyncCompleted",
			Self::SyncFailed { .. } => "SyncFailed",
			Self::RecoveryWarning { .. } => "RecoveryWarning",
			Self::OutboxEntryFailed { .. } => "OutboxEntryFailed",
			Self::LeaderChanged { .. } => "LeaderChanged",
		}
	}
}

#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Returns the number of subscribers that received the event.
	pub fn emit(&self, event: WalletEvent) -> usize {
		let event_type = event.event_type();
		match self.sender.send(event) {
			Ok(count) => {
				debug!(event_type, subscribers = count, "Wallet event emitted");
				count
			}
			Err(_) => {
				trace!(event_type, "Wallet event dropped, no subscribers");
				0
			}
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
		self.sender.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
