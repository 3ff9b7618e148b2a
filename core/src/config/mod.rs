//! Wallet configuration management

use std::{fs, io, path::PathBuf};

use thiserror::Error;

pub mod wallet_config;

pub use wallet_config::{
	CacheConfig, CoordinatorConfig, LoggingConfig, OutboxConfig, RecoveryConfig, SyncConfig,
	WalletConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("Could not determine data directory")]
	NoDataDir,
	#[error("IO error: {0}")]
	Io(#[from] io::Error),
	#[error("Invalid config file: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("Unsupported config version {found}, newest known is {supported}")]
	UnsupportedVersion { found: u32, supported: u32 },
}

/// Platform-specific data directory resolution
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
	#[cfg(target_os = "linux")]
	let base = dirs::data_local_dir();

	#[cfg(not(target_os = "linux"))]
	let base = dirs::data_dir();

	let dir = base.ok_or(ConfigError::NoDataDir)?.join("token-wallet");
	fs::create_dir_all(&dir)?;

	Ok(dir)
}
