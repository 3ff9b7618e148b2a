//! Shared setup for wallet integration tests

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use tw_core::{
	config::WalletConfig,
	domain::{CoinId, Commitment, InclusionProof, OutboxOperation, Recipient, RequestId, Token, TokenId},
	infra::store::{KeyValueStore, MemoryStore},
	service::leader::LocalBus,
	testing::{MockLedger, MockRemoteStore, MockTransport},
	wallet::{Collaborators, Wallet},
};

/// Mocks shared by every wallet process of one test.
#[derive(Clone)]
pub struct World {
	pub ledger: Arc<MockLedger>,
	pub remote: Arc<MockRemoteStore>,
	pub transport: Arc<MockTransport>,
	pub bus: LocalBus,
}

impl World {
	pub fn new() -> Self {
		Self {
			ledger: Arc::new(MockLedger::new()),
			remote: Arc::new(MockRemoteStore::new()),
			transport: Arc::new(MockTransport::new()),
			bus: LocalBus::new(256),
		}
	}

	/// Same remote and ledger, but a process group of its own.
	pub fn other_device(&self) -> Self {
		Self {
			bus: LocalBus::new(256),
			..self.clone()
		}
	}

	pub fn collaborators(&self) -> Collaborators {
		Collaborators {
			remote: self.remote.clone(),
			ledger: self.ledger.clone(),
			transport: self.transport.clone(),
			bus: Arc::new(self.bus.clone()),
		}
	}

	/// A wallet process over its own fresh store.
	pub fn wallet(&self) -> Wallet {
		self.wallet_on(Arc::new(MemoryStore::new()))
	}

	/// A wallet process over `store`, as after a restart.
	pub fn wallet_on(&self, store: Arc<dyn KeyValueStore>) -> Wallet {
		Wallet::with_store(test_config(), store, self.collaborators())
	}
}

pub fn test_config() -> WalletConfig {
	let mut config = WalletConfig::default_with_dir(std::env::temp_dir().join("tw-core-tests"));
	config.outbox.max_retries = 3;
	config.outbox.proof_poll_timeout_secs = 5;
	config.coordinator.lock_timeout_ms = 5_000;
	config
}

/// Let the election settle.
pub async fn settle() {
	tokio::time::sleep(Duration::from_secs(2)).await;
}

/// Start `wallet` and wait until it has taken part in an election.
pub async fn start(wallet: &Wallet) -> anyhow::Result<()> {
	wallet.start().await?;
	settle().await;
	Ok(())
}

pub fn token(id: &str, amount: u64) -> Token {
	Token::minted(
		TokenId::from(id),
		CoinId("uct".into()),
		amount,
		format!("genesis:{id}").into_bytes(),
		Some(InclusionProof {
			request_id: RequestId(format!("mint-{id}")),
			data: b"genesis-proof".to_vec(),
		}),
	)
}

pub fn transfer_commitment(source: &Token, tag: &str) -> Commitment {
	Commitment {
		request_id: RequestId(format!("transfer-{}-{tag}", source.id)),
		source_state_hash: Some(source.state_hash()),
		data: format!("transfer:{tag}").into_bytes(),
	}
}

pub fn transfer(source: &Token, recipient: &str) -> OutboxOperation {
	OutboxOperation::Transfer {
		source_token_id: source.id.clone(),
		recipient: Recipient(recipient.to_owned()),
		commitment: transfer_commitment(source, recipient),
	}
}
