//! Broadcast channel shared by every process of the same wallet

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Random per-process identity. Ordering breaks election ties: the higher id
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
	pub fn random() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordinatorMessage {
	LeaderRequest { from: InstanceId },
	LeaderAnnounce { leader: InstanceId, term: u64 },
	Heartbeat { leader: InstanceId, term: u64 },
	SyncStart { holder: InstanceId },
	SyncComplete { holder: InstanceId },
	Ping { from: InstanceId },
	Pong { leader: InstanceId, term: u64 },
}

impl CoordinatorMessage {
	pub fn sender(&self) -> InstanceId {
		match self {
			Self::LeaderRequest { from } | Self::Ping { from } => *from,
			Self::LeaderAnnounce { leader, .. }
			| Self::Heartbeat { leader, .. }
			| Self::Pong { leader, .. } => *leader,
			Self::SyncStart { holder } | Self::SyncComplete { holder } => *holder,
		}
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
	#[error("coordination bus closed")]
	Closed,
}

/// Transport the election runs over. Every published message reaches every
/// subscriber, the publisher's own subscription included.
pub trait MessageBus: Send + Sync {
	/// Returns how many subscribers the message reached.
	fn publish(&self, message: CoordinatorMessage) -> Result<usize, BusError>;

	fn subscribe(&self) -> broadcast::Receiver<CoordinatorMessage>;
}

/// In-process bus. Clones share one channel, so several coordinators in the
/// same process behave like separate tabs.
#[derive(Debug, Clone)]
pub struct LocalBus {
	sender: broadcast::Sender<CoordinatorMessage>,
}

impl LocalBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}
}

impl MessageBus for LocalBus {
	fn publish(&self, message: CoordinatorMessage) -> Result<usize, BusError> {
		// no subscribers is not an error: this process is alone
		Ok(self.sender.send(message).unwrap_or(0))
	}

	fn subscribe(&self) -> broadcast::Receiver<CoordinatorMessage> {
		self.sender.subscribe()
	}
}
