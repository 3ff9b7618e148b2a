//! The wallet context: every service wired together over one store.

use std::sync::Arc;

use tracing::info;

use crate::{
	config::WalletConfig,
	domain::{EntryId, OutboxOperation},
	infra::{
		event::{EventBus, WalletEvent},
		ledger::LedgerClient,
		remote::RemoteStore,
		store::{Inventory, KeyValueStore, MemoryStore, OutboxRepository, RedbStore},
		transport::MessageTransport,
	},
	service::{
		leader::MessageBus,
		outbox::{ProcessOutcome, RecoveryReport},
		sync::{SyncContext, SyncReport},
		LeaderCoordinator, OutboxService, Service, SyncEngine, TokenRecoveryService,
	},
	Result,
};

/// The external systems a wallet talks to.
#[derive(Clone)]
pub struct Collaborators {
	pub remote: Arc<dyn RemoteStore>,
	pub ledger: Arc<dyn LedgerClient>,
	pub transport: Arc<dyn MessageTransport>,
	/// Shared by every process that opens the same wallet
	pub bus: Arc<dyn MessageBus>,
}

pub struct Wallet {
	config: WalletConfig,
	events: EventBus,
	inventory: Arc<Inventory>,
	coordinator: Arc<LeaderCoordinator>,
	sync: Arc<SyncEngine>,
	token_recovery: Arc<TokenRecoveryService>,
	outbox: Arc<OutboxService>,
}

impl Wallet {
	/// Open the wallet stored under `config.data_dir`.
	pub fn open(config: WalletConfig, collaborators: Collaborators) -> Result<Self> {
		std::fs::create_dir_all(&config.data_dir).map_err(crate::config::ConfigError::from)?;
		let store = Arc::new(RedbStore::open(config.store_path())?);
		Ok(Self::with_store(config, store, collaborators))
	}

	/// A wallet whose local state vanishes with the process.
	pub fn in_memory(config: WalletConfig, collaborators: Collaborators) -> Self {
		Self::with_store(config, Arc::new(MemoryStore::new()), collaborators)
	}

	pub fn with_store(
		config: WalletConfig,
		store: Arc<dyn KeyValueStore>,
		collaborators: Collaborators,
	) -> Self {
		let events = EventBus::default();
		let inventory = Arc::new(Inventory::new(store.clone(), config.sync.remote_name.clone()));

		let coordinator = Arc::new(LeaderCoordinator::new(
			config.coordinator.clone(),
			collaborators.bus,
			events.clone(),
		));

		let sync = Arc::new(SyncEngine::new(
			&config,
			inventory.clone(),
			collaborators.remote,
			collaborators.ledger.clone(),
			coordinator.clone(),
			events.clone(),
		));

		let token_recovery = Arc::new(TokenRecoveryService::new(
			config.recovery.clone(),
			inventory.clone(),
			collaborators.ledger.clone(),
			events.clone(),
			config.outbox.step_timeout(),
		));

		let outbox = OutboxService::new(
			config.outbox.clone(),
			OutboxRepository::new(store),
			inventory.clone(),
			sync.clone(),
			collaborators.ledger,
			collaborators.transport,
			token_recovery.clone(),
			events.clone(),
		);

		Self {
			config,
			events,
			inventory,
			coordinator,
			sync,
			token_recovery,
			outbox,
		}
	}

	/// Join the election, finish every interrupted operation, then start the
	/// periodic outbox retry loop.
	pub async fn start(&self) -> Result<RecoveryReport> {
		self.coordinator.start().await?;
		let report = self.outbox.recover_on_startup().await;
		self.outbox.start().await?;

		info!(
			instance_id = %self.coordinator.instance_id(),
			resumed = report.scanned,
			"Wallet started"
		);

		Ok(report)
	}

	pub async fn shutdown(&self) -> Result<()> {
		self.outbox.stop().await?;
		self.coordinator.stop().await?;
		info!("Wallet shut down");
		Ok(())
	}

	pub async fn sync(&self, context: &SyncContext) -> Result<SyncReport> {
		Ok(self.sync.sync(context).await?)
	}

	/// Persist `operation` in the outbox and drive it right away.
	pub async fn submit(&self, operation: OutboxOperation) -> Result<(EntryId, ProcessOutcome)> {
		Ok(self.outbox.execute(operation).await?)
	}

	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WalletEvent> {
		self.events.subscribe()
	}

	pub fn config(&self) -> &WalletConfig {
		&self.config
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn inventory(&self) -> &Arc<Inventory> {
		&self.inventory
	}

	pub fn coordinator(&self) -> &Arc<LeaderCoordinator> {
		&self.coordinator
	}

	pub fn sync_engine(&self) -> &Arc<SyncEngine> {
		&self.sync
	}

	pub fn token_recovery(&self) -> &Arc<TokenRecoveryService> {
		&self.token_recovery
	}

	pub fn outbox(&self) -> &Arc<OutboxService> {
		&self.outbox
	}
}
