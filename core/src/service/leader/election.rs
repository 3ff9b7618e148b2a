//! Leader election protocol, independent of any transport or clock.
//!
//! [`ElectionState`] consumes messages and clock ticks and returns the
//! messages to broadcast in response. The async coordinator drives it, and
//! tests can drive it directly with simulated delivery.

use tokio::time::{Duration, Instant};

use super::bus::{CoordinatorMessage, InstanceId};

/// Leadership transition caused by a call, for event reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
	None,
	BecameLeader,
	SteppedDown,
	LeaderChanged,
}

#[derive(Debug, Clone)]
pub struct ElectionState {
	me: InstanceId,
	leader: Option<InstanceId>,
	term: u64,
	last_leader_seen: Option<Instant>,
	started_at: Instant,
	leader_timeout: Duration,
	election_grace: Duration,
	remote_sync_holder: Option<InstanceId>,
	last_change: RoleChange,
}

impl ElectionState {
	pub fn new(
		me: InstanceId,
		leader_timeout: Duration,
		election_grace: Duration,
		now: Instant,
	) -> Self {
		Self {
			me,
			leader: None,
			term: 0,
			last_leader_seen: None,
			started_at: now,
			leader_timeout,
			election_grace,
			remote_sync_holder: None,
			last_change: RoleChange::None,
		}
	}

	pub fn me(&self) -> InstanceId {
		self.me
	}

	pub fn leader(&self) -> Option<InstanceId> {
		self.leader
	}

	pub fn is_leader(&self) -> bool {
		self.leader == Some(self.me)
	}

	/// Highest term seen or claimed. Increases with every claim.
	pub fn term(&self) -> u64 {
		self.term
	}

	/// Another process announced it is running a remote sync.
	pub fn remote_sync_holder(&self) -> Option<InstanceId> {
		self.remote_sync_holder
	}

	/// Role transition caused by the most recent `handle` or `tick`.
	pub fn last_change(&self) -> RoleChange {
		self.last_change
	}

	/// Messages to broadcast when joining the bus.
	pub fn start(&mut self) -> Vec<CoordinatorMessage> {
		vec![CoordinatorMessage::LeaderRequest { from: self.me }]
	}

	pub fn handle(&mut self, message: CoordinatorMessage, now: Instant) -> Vec<CoordinatorMessage> {
		self.last_change = RoleChange::None;

		if message.sender() == self.me {
			return Vec::new();
		}

		match message {
			CoordinatorMessage::LeaderRequest { .. } => self.announce_if_leader(),
			CoordinatorMessage::Ping { .. } => {
				if self.is_leader() {
					vec![CoordinatorMessage::Pong {
						leader: self.me,
						term: self.term,
					}]
				} else {
					Vec::new()
				}
			}
			CoordinatorMessage::LeaderAnnounce { leader, term }
			| CoordinatorMessage::Heartbeat { leader, term }
			| CoordinatorMessage::Pong { leader, term } => self.observe_leader(leader, term, now),
			CoordinatorMessage::SyncStart { holder } => {
				self.remote_sync_holder = Some(holder);
				Vec::new()
			}
			CoordinatorMessage::SyncComplete { holder } => {
				if self.remote_sync_holder == Some(holder) {
					self.remote_sync_holder = None;
				}
				Vec::new()
			}
		}
	}

	/// Periodic step: heartbeat when leading, claim when there is no live
	/// leader.
	pub fn tick(&mut self, now: Instant) -> Vec<CoordinatorMessage> {
		self.last_change = RoleChange::None;

		if self.is_leader() {
			return vec![CoordinatorMessage::Heartbeat {
				leader: self.me,
				term: self.term,
			}];
		}

		let grace_elapsed = now.saturating_duration_since(self.started_at) >= self.election_grace;
		let leader_missing = match self.leader {
			None => grace_elapsed,
			Some(_) => !self.leader_alive(now),
		};

		if !leader_missing {
			return Vec::new();
		}

		self.claim(now)
	}

	fn leader_alive(&self, now: Instant) -> bool {
		self.last_leader_seen
			.is_some_and(|seen| now.saturating_duration_since(seen) < self.leader_timeout)
	}

	fn claim(&mut self, now: Instant) -> Vec<CoordinatorMessage> {
		self.term += 1;
		self.leader = Some(self.me);
		self.last_leader_seen = Some(now);
		self.last_change = RoleChange::BecameLeader;

		vec![CoordinatorMessage::LeaderAnnounce {
			leader: self.me,
			term: self.term,
		}]
	}

	fn announce_if_leader(&self) -> Vec<CoordinatorMessage> {
		if self.is_leader() {
			vec![CoordinatorMessage::LeaderAnnounce {
				leader: self.me,
				term: self.term,
			}]
		} else {
			Vec::new()
		}
	}

	fn observe_leader(
		&mut self,
		leader: InstanceId,
		term: u64,
		now: Instant,
	) -> Vec<CoordinatorMessage> {
		if self.is_leader() {
			if leader > self.me {
				self.adopt(leader, term, now);
				self.last_change = RoleChange::SteppedDown;
				return Vec::new();
			}
			// conflicting claim from a lower id: reassert
			return vec![CoordinatorMessage::LeaderAnnounce {
				leader: self.me,
				term: self.term,
			}];
		}

		match self.leader {
			Some(current) if current == leader => {
				self.last_leader_seen = Some(now);
				self.term = self.term.max(term);
			}
			Some(current) if current > leader && self.leader_alive(now) => {
				// the live higher leader will make the lower claimant step down
			}
			_ => {
				self.adopt(leader, term, now);
				self.last_change = RoleChange::LeaderChanged;
			}
		}

		Vec::new()
	}

	fn adopt(&mut self, leader: InstanceId, term: u64, now: Instant) {
		self.leader = Some(leader);
		self.term = self.term.max(term);
		self.last_leader_seen = Some(now);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;

	use uuid::Uuid;

	use super::*;

	const TIMEOUT: Duration = Duration::from_secs(10);
	const GRACE: Duration = Duration::from_millis(500);

	fn id(n: u128) -> InstanceId {
		InstanceId(Uuid::from_u128(n))
	}

	/// Deliver every queued message to every other node until nothing new is
	/// produced.
	fn deliver_all(
		nodes: &mut [ElectionState],
		mut queue: VecDeque<CoordinatorMessage>,
		now: Instant,
	) {
		let mut steps = 0;
		while let Some(message) = queue.pop_front() {
			steps += 1;
			assert!(steps < 10_000, "election did not converge");
			for node in nodes.iter_mut() {
				queue.extend(node.handle(message.clone(), now));
			}
		}
	}

	#[test]
	fn test_single_process_claims_after_grace() {
		let start = Instant::now();
		let mut node = ElectionState::new(id(1), TIMEOUT, GRACE, start);
		assert_eq!(
			node.start(),
			vec![CoordinatorMessage::LeaderRequest { from: id(1) }]
		);

		assert!(node.tick(start).is_empty());
		assert!(!node.is_leader());

		let out = node.tick(start + GRACE);
		assert!(node.is_leader());
		assert_eq!(node.term(), 1);
		assert_eq!(node.last_change(), RoleChange::BecameLeader);
		assert_eq!(
			out,
			vec![CoordinatorMessage::LeaderAnnounce {
				leader: id(1),
				term: 1
			}]
		);
	}

	#[test]
	fn test_simultaneous_claims_converge_to_highest_id() {
		let start = Instant::now();
		let mut nodes = (1..=5)
			.map(|n| ElectionState::new(id(n), TIMEOUT, GRACE, start))
			.collect::<Vec<_>>();

		let now = start + GRACE;
		let mut queue = VecDeque::new();
		for node in nodes.iter_mut() {
			queue.extend(node.start());
		}
		for node in nodes.iter_mut() {
			queue.extend(node.tick(now));
		}
		deliver_all(&mut nodes, queue, now);

		let leaders = nodes.iter().filter(|n| n.is_leader()).count();
		assert_eq!(leaders, 1);
		for node in &nodes {
			assert_eq!(node.leader(), Some(id(5)));
		}
	}

	#[test]
	fn test_late_joiner_adopts_existing_leader() {
		let start = Instant::now();
		let mut leader = ElectionState::new(id(1), TIMEOUT, GRACE, start);
		leader.tick(start + GRACE);

		let mut joiner = ElectionState::new(id(9), TIMEOUT, GRACE, start + GRACE);
		let mut nodes = vec![leader, joiner.clone()];
		let queue = VecDeque::from(joiner.start());
		deliver_all(&mut nodes, queue, start + GRACE);

		// the joiner has a higher id but does not depose a live leader
		joiner = nodes.remove(1);
		assert_eq!(joiner.leader(), Some(id(1)));
		assert!(joiner.tick(start + GRACE * 4).is_empty());
		assert!(nodes[0].is_leader());
	}

	#[test]
	fn test_follower_claims_after_leader_timeout() {
		let start = Instant::now();
		let mut follower = ElectionState::new(id(1), TIMEOUT, GRACE, start);
		follower.handle(
			CoordinatorMessage::Heartbeat {
				leader: id(2),
				term: 4,
			},
			start,
		);
		assert_eq!(follower.leader(), Some(id(2)));

		assert!(follower.tick(start + TIMEOUT - Duration::from_millis(1)).is_empty());

		let out = follower.tick(start + TIMEOUT);
		assert!(follower.is_leader());
		assert_eq!(follower.term(), 5);
		assert_eq!(
			out,
			vec![CoordinatorMessage::LeaderAnnounce {
				leader: id(1),
				term: 5
			}]
		);
	}

	#[test]
	fn test_leader_answers_ping_and_request() {
		let start = Instant::now();
		let mut leader = ElectionState::new(id(3), TIMEOUT, GRACE, start);
		leader.tick(start + GRACE);

		assert_eq!(
			leader.handle(CoordinatorMessage::Ping { from: id(1) }, start),
			vec![CoordinatorMessage::Pong {
				leader: id(3),
				term: 1
			}]
		);
		assert_eq!(
			leader.handle(CoordinatorMessage::LeaderRequest { from: id(1) }, start),
			vec![CoordinatorMessage::LeaderAnnounce {
				leader: id(3),
				term: 1
			}]
		);
		assert_eq!(
			leader.tick(start + GRACE * 2),
			vec![CoordinatorMessage::Heartbeat {
				leader: id(3),
				term: 1
			}]
		);
	}

	#[test]
	fn test_tracks_remote_sync_holder() {
		let start = Instant::now();
		let mut node = ElectionState::new(id(1), TIMEOUT, GRACE, start);

		node.handle(CoordinatorMessage::SyncStart { holder: id(2) }, start);
		assert_eq!(node.remote_sync_holder(), Some(id(2)));

		node.handle(CoordinatorMessage::SyncComplete { holder: id(3) }, start);
		assert_eq!(node.remote_sync_holder(), Some(id(2)));

		node.handle(CoordinatorMessage::SyncComplete { holder: id(2) }, start);
		assert_eq!(node.remote_sync_holder(), None);
	}
}
