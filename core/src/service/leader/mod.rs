//! Cross-process leader election and the remote sync lock.
//!
//! Every process sharing a wallet joins the same [`MessageBus`]. Exactly one
//! of them leads at a time and only the leader hands out the sync lock, so
//! remote publishes are serialized across processes. Followers that ask for
//! the lock wait in a queue until it is granted or their timeout elapses, in
//! which case they carry on without publishing.

pub mod bus;
pub mod election;

pub use bus::{BusError, CoordinatorMessage, InstanceId, LocalBus, MessageBus};
pub use election::{ElectionState, RoleChange};

use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
	sync::{
		broadcast::{self, error::RecvError},
		oneshot,
	},
	time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
	config::CoordinatorConfig,
	infra::event::{EventBus, WalletEvent},
	service::Service,
	Result,
};

#[derive(Default)]
struct SyncLock {
	held: bool,
	waiters: VecDeque<oneshot::Sender<()>>,
}

struct CoordinatorInner {
	config: CoordinatorConfig,
	bus: Arc<dyn MessageBus>,
	events: EventBus,
	election: Mutex<ElectionState>,
	// lock order: `lock` before `election`
	lock: Mutex<SyncLock>,
}

impl CoordinatorInner {
	fn me(&self) -> InstanceId {
		self.election.lock().me()
	}

	fn is_leader(&self) -> bool {
		self.election.lock().is_leader()
	}

	fn publish(&self, message: CoordinatorMessage) {
		if let Err(e) = self.bus.publish(message) {
			warn!(error = %e, "Failed to publish coordinator message");
		}
	}

	fn publish_all(&self, messages: Vec<CoordinatorMessage>) {
		for message in messages {
			self.publish(message);
		}
	}

	fn on_message(&self, message: CoordinatorMessage) {
		let (out, change) = {
			let mut election = self.election.lock();
			let out = election.handle(message, Instant::now());
			(out, election.last_change())
		};
		self.publish_all(out);
		self.on_role_change(change);
	}

	fn on_tick(&self) {
		let (out, change) = {
			let mut election = self.election.lock();
			let out = election.tick(Instant::now());
			(out, election.last_change())
		};
		self.publish_all(out);
		self.on_role_change(change);
	}

	fn on_role_change(&self, change: RoleChange) {
		if change == RoleChange::None {
			return;
		}

		let (leader, me, term) = {
			let election = self.election.lock();
			(election.leader(), election.me(), election.term())
		};
		let is_self = leader == Some(me);

		match change {
			RoleChange::BecameLeader => info!(instance_id = %me, term, "Became leader"),
			RoleChange::SteppedDown => {
				info!(instance_id = %me, leader = ?leader, term, "Stepped down as leader")
			}
			_ => debug!(instance_id = %me, leader = ?leader, term, "Leader changed"),
		}

		self.events
			.emit(WalletEvent::LeaderChanged { leader, is_self });

		if is_self {
			self.serve_next_waiter();
		}
	}

	/// Hand the lock to the oldest waiter still listening. Only the leader
	/// serves its queue.
	fn serve_next_waiter(&self) {
		let mut lock = self.lock.lock();
		if lock.held || !self.is_leader() {
			return;
		}

		while let Some(waiter) = lock.waiters.pop_front() {
			if waiter.send(()).is_ok() {
				lock.held = true;
				break;
			}
		}
	}

	async fn run(
		self: Arc<Self>,
		mut messages: broadcast::Receiver<CoordinatorMessage>,
		mut shutdown_rx: broadcast::Receiver<()>,
		is_running: Arc<AtomicBool>,
	) {
		let period = self.config.heartbeat_interval();
		let mut ticker = interval_at(Instant::now() + self.config.election_grace(), period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = shutdown_rx.recv() => {
					debug!("Coordinator loop received shutdown signal");
					break;
				}
				received = messages.recv() => match received {
					Ok(message) => self.on_message(message),
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "Coordinator lagged behind the bus");
					}
					Err(RecvError::Closed) => {
						warn!("Coordination bus closed");
						break;
					}
				},
				_ = ticker.tick() => self.on_tick(),
			}
		}

		is_running.store(false, Ordering::SeqCst);
	}
}

/// Per-process handle on the election and the sync lock.
pub struct LeaderCoordinator {
	inner: Arc<CoordinatorInner>,
	is_running: Arc<AtomicBool>,
	shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl LeaderCoordinator {
	pub fn new(config: CoordinatorConfig, bus: Arc<dyn MessageBus>, events: EventBus) -> Self {
		Self::with_instance_id(InstanceId::random(), config, bus, events)
	}

	pub fn with_instance_id(
		instance_id: InstanceId,
		config: CoordinatorConfig,
		bus: Arc<dyn MessageBus>,
		events: EventBus,
	) -> Self {
		let election = ElectionState::new(
			instance_id,
			config.leader_timeout(),
			config.election_grace(),
			Instant::now(),
		);

		Self {
			inner: Arc::new(CoordinatorInner {
				config,
				bus,
				events,
				election: Mutex::new(election),
				lock: Mutex::new(SyncLock::default()),
			}),
			is_running: Arc::new(AtomicBool::new(false)),
			shutdown_tx: Mutex::new(None),
		}
	}

	pub fn instance_id(&self) -> InstanceId {
		self.inner.me()
	}

	pub fn is_leader(&self) -> bool {
		self.inner.is_leader()
	}

	pub fn leader_id(&self) -> Option<InstanceId> {
		self.inner.election.lock().leader()
	}

	/// Election term, increasing with every claim. Publishes record it so a
	/// remote store able to compare terms could fence stale leaders.
	pub fn term(&self) -> u64 {
		self.inner.election.lock().term()
	}

	/// Acquire the cross-process sync lock.
	///
	/// Returns `false` when the lock was not granted within `timeout`. That is
	/// not an error: the caller skips its remote publish this time.
	pub async fn acquire_lock(&self, timeout: Duration) -> bool {
		let me = self.instance_id();

		let waiter = {
			let mut lock = self.inner.lock.lock();
			if !lock.held && self.inner.is_leader() {
				lock.held = true;
				None
			} else {
				let (tx, rx) = oneshot::channel();
				lock.waiters.push_back(tx);
				Some(rx)
			}
		};

		let granted = match waiter {
			None => true,
			Some(mut rx) => {
				self.inner.publish(CoordinatorMessage::Ping { from: me });
				match tokio::time::timeout(timeout, &mut rx).await {
					Ok(Ok(())) => true,
					Ok(Err(_)) => false,
					Err(_) => {
						// a grant may have raced the deadline
						rx.close();
						rx.try_recv().is_ok()
					}
				}
			}
		};

		if granted {
			debug!(instance_id = %me, "Sync lock acquired");
			self.inner
				.publish(CoordinatorMessage::SyncStart { holder: me });
		} else {
			warn!(instance_id = %me, ?timeout, "Timed out waiting for the sync lock");
		}

		granted
	}

	/// Release the sync lock and pass it to the next waiter.
	pub fn release_lock(&self) {
		{
			let mut lock = self.inner.lock.lock();
			if !lock.held {
				return;
			}
			lock.held = false;
		}

		let me = self.instance_id();
		self.inner
			.publish(CoordinatorMessage::SyncComplete { holder: me });
		debug!(instance_id = %me, "Sync lock released");

		self.inner.serve_next_waiter();
	}

	pub async fn shutdown(&self) -> Result<()> {
		self.stop().await
	}
}

#[async_trait]
impl Service for LeaderCoordinator {
	async fn start(&self) -> Result<()> {
		if self.is_running.load(Ordering::SeqCst) {
			warn!("Leader coordinator already running");
			return Ok(());
		}

		let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
		*self.shutdown_tx.lock() = Some(shutdown_tx);

		// subscribe before announcing so replies are not missed
		let messages = self.inner.bus.subscribe();
		let hello = self.inner.election.lock().start();
		self.inner.publish_all(hello);

		self.is_running.store(true, Ordering::SeqCst);

		let inner = self.inner.clone();
		let is_running = self.is_running.clone();
		tokio::spawn(async move {
			inner.run(messages, shutdown_rx, is_running).await;
		});

		info!(instance_id = %self.instance_id(), "Leader coordinator started");

		Ok(())
	}

	async fn stop(&self) -> Result<()> {
		if !self.is_running.load(Ordering::SeqCst) {
			return Ok(());
		}

		if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
			let _ = shutdown_tx.send(());
		}

		// waiting callers see their sender dropped and give up
		self.inner.lock.lock().waiters.clear();
		self.is_running.store(false, Ordering::SeqCst);

		info!(instance_id = %self.instance_id(), "Leader coordinator stopped");

		Ok(())
	}

	fn is_running(&self) -> bool {
		self.is_running.load(Ordering::SeqCst)
	}

	fn name(&self) -> &'static str {
		"leader_coordinator"
	}
}
