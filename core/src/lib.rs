//! Local-first bearer token wallet core.
//!
//! Keeps a local token inventory in sync with a versioned remote snapshot,
//! drives multi-step ledger operations through a crash-safe outbox, and
//! coordinates several processes sharing one wallet so only one of them
//! publishes at a time.

use std::path::Path;

use thiserror::Error;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod config;
pub mod domain;
pub mod infra;
pub mod service;
pub mod testing;
pub mod wallet;

pub use config::WalletConfig;
pub use wallet::Wallet;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] config::ConfigError),
	#[error(transparent)]
	Store(#[from] infra::store::StoreError),
	#[error(transparent)]
	Sync(#[from] service::sync::SyncError),
	#[error(transparent)]
	Outbox(#[from] service::outbox::OutboxError),
	#[error(transparent)]
	Recovery(#[from] service::token_recovery::RecoveryError),
	#[error(transparent)]
	Ledger(#[from] infra::ledger::LedgerError),
	#[error(transparent)]
	Remote(#[from] infra::remote::RemoteError),
	#[error(transparent)]
	Transport(#[from] infra::transport::TransportError),
	#[error(transparent)]
	Bus(#[from] service::leader::BusError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Install the global subscriber: console output filtered by `RUST_LOG` (or
/// the configured level), plus daily-rotated files when enabled.
///
/// Keep the returned guard alive for as long as file logs should flush.
/// Installing twice is a no-op.
pub fn init_tracing(config: &config::LoggingConfig, logs_dir: &Path) -> Option<WorkerGuard> {
	let filter = || {
		let mut filter = EnvFilter::try_from_default_env()
			.unwrap_or_else(|_| EnvFilter::new(&config.level));
		for directive in &config.directives {
			match directive.parse() {
				Ok(directive) => filter = filter.add_directive(directive),
				Err(e) => eprintln!("Ignoring invalid log directive {directive:?}: {e}"),
			}
		}
		filter
	};

	let console = fmt::layer().with_target(true).with_filter(filter());

	if !config.log_to_file {
		let _ = tracing_subscriber::registry().with(console).try_init();
		return None;
	}

	let (non_blocking, guard) =
		tracing_appender::non_blocking(rolling::daily(logs_dir, "wallet.log"));
	let file = fmt::layer()
		.with_writer(non_blocking)
		.with_ansi(false)
		.with_filter(filter());

	let _ = tracing_subscriber::registry()
		.with(console)
		.with(file)
		.try_init();

	Some(guard)
}
