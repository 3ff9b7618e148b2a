//! Wallet services

use async_trait::async_trait;

use crate::Result;

pub mod leader;
pub mod outbox;
pub mod sync;
pub mod token_recovery;

pub use leader::LeaderCoordinator;
pub use outbox::OutboxService;
pub use sync::SyncEngine;
pub use token_recovery::TokenRecoveryService;

/// Trait for background services
#[async_trait]
pub trait Service: Send + Sync {
	/// Start the service
	async fn start(&self) -> Result<()>;

	/// Stop the service gracefully
	async fn stop(&self) -> Result<()>;

	/// Check if the service is running
	fn is_running(&self) -> bool;

	/// Get service name for logging
	fn name(&self) -> &'static str;
}
