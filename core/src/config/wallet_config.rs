//! Wallet configuration file

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{default_data_dir, ConfigError};

const CONFIG_FILE: &str = "wallet.json";
const CONFIG_VERSION: u32 = 1;

/// Main wallet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
	/// Config schema version
	pub version: u32,

	/// Data directory path
	pub data_dir: PathBuf,

	#[serde(default)]
	pub coordinator: CoordinatorConfig,

	#[serde(default)]
	pub cache: CacheConfig,

	#[serde(default)]
	pub sync: SyncConfig,

	#[serde(default)]
	pub outbox: OutboxConfig,

	#[serde(default)]
	pub recovery: RecoveryConfig,

	#[serde(default)]
	pub logging: LoggingConfig,
}

/// Cross-process leader election and sync lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
	pub heartbeat_interval_ms: u64,

	/// A leader silent for this long is presumed dead
	pub leader_timeout_ms: u64,

	/// How long a starting process waits for an existing leader to answer
	/// before claiming
	pub election_grace_ms: u64,

	pub lock_timeout_ms: u64,

	pub bus_capacity: usize,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval_ms: 3_000,
			leader_timeout_ms: 10_000,
			election_grace_ms: 500,
			lock_timeout_ms: 30_000,
			bus_capacity: 256,
		}
	}
}

impl CoordinatorConfig {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms)
	}

	pub fn leader_timeout(&self) -> Duration {
		Duration::from_millis(self.leader_timeout_ms)
	}

	pub fn election_grace(&self) -> Duration {
		Duration::from_millis(self.election_grace_ms)
	}

	pub fn lock_timeout(&self) -> Duration {
		Duration::from_millis(self.lock_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	pub version_ttl_secs: u64,
	pub failure_ttl_secs: u64,
	pub known_fresh_max_age_secs: u64,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			version_ttl_secs: 60,
			failure_ttl_secs: 30,
			known_fresh_max_age_secs: 30,
		}
	}
}

impl CacheConfig {
	pub fn ttls(&self) -> tw_cache::CacheTtls {
		tw_cache::CacheTtls {
			version_record: Duration::from_secs(self.version_ttl_secs),
			failure: Duration::from_secs(self.failure_ttl_secs),
		}
	}

	pub fn known_fresh_max_age(&self) -> Duration {
		Duration::from_secs(self.known_fresh_max_age_secs)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Mutable name the inventory is published under
	pub remote_name: String,

	/// Whether the remote store is configured at all
	pub remote_enabled: bool,

	/// Upper bound on any single remote store call
	pub remote_timeout_secs: u64,

	/// Consecutive failed passes before sync falls back to local-only
	pub circuit_breaker_threshold: u32,

	pub circuit_breaker_cooldown_secs: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			remote_name: "wallet".to_string(),
			remote_enabled: true,
			remote_timeout_secs: 30,
			circuit_breaker_threshold: 3,
			circuit_breaker_cooldown_secs: 60,
		}
	}
}

impl SyncConfig {
	pub fn remote_timeout(&self) -> Duration {
		Duration::from_secs(self.remote_timeout_secs)
	}

	pub fn circuit_breaker_cooldown(&self) -> Duration {
		Duration::from_secs(self.circuit_breaker_cooldown_secs)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
	/// Period of the background recovery pass
	pub retry_interval_secs: u64,

	/// Failed step attempts before an entry is marked `FAILED`
	pub max_retries: u32,

	pub backoff_base_ms: u64,
	pub backoff_cap_ms: u64,

	/// Completed entries older than this are purged
	pub completed_retention_hours: u64,

	pub proof_poll_interval_ms: u64,
	pub proof_poll_timeout_secs: u64,

	/// Upper bound on a single ledger or transport call
	pub step_timeout_secs: u64,
}

impl Default for OutboxConfig {
	fn default() -> Self {
		Self {
			retry_interval_secs: 60,
			max_retries: 10,
			backoff_base_ms: 30_000,
			backoff_cap_ms: 3_600_000,
			completed_retention_hours: 24,
			proof_poll_interval_ms: 1_000,
			proof_poll_timeout_secs: 30,
			step_timeout_secs: 30,
		}
	}
}

impl OutboxConfig {
	pub fn retry_interval(&self) -> Duration {
		Duration::from_secs(self.retry_interval_secs)
	}

	pub fn proof_poll_interval(&self) -> Duration {
		Duration::from_millis(self.proof_poll_interval_ms)
	}

	pub fn proof_poll_timeout(&self) -> Duration {
		Duration::from_secs(self.proof_poll_timeout_secs)
	}

	pub fn step_timeout(&self) -> Duration {
		Duration::from_secs(self.step_timeout_secs)
	}

	pub fn completed_retention(&self) -> chrono::Duration {
		chrono::Duration::hours(self.completed_retention_hours as i64)
	}
}

/// Orphaned split recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
	/// Fall back to enumerating plausible splits when the exact parameters
	/// are unknown
	pub enumerate_splits: bool,

	/// Upper bound on ledger lookups per orphan search
	pub max_split_candidates: usize,
}

impl Default for RecoveryConfig {
	fn default() -> Self {
		Self {
			enumerate_splits: true,
			max_split_candidates: 128,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	/// Default level when `RUST_LOG` is unset
	pub level: String,

	/// Extra filter directives, e.g. `tw_core::service::sync=trace`
	pub directives: Vec<String>,

	/// Also write daily-rotated logs under `log_directory`
	pub log_to_file: bool,

	pub log_directory: PathBuf,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			directives: Vec::new(),
			log_to_file: false,
			log_directory: PathBuf::from("logs"),
		}
	}
}

impl WalletConfig {
	/// Load configuration from the default location
	pub fn load() -> Result<Self, ConfigError> {
		let data_dir = default_data_dir()?;
		Self::load_from(&data_dir)
	}

	/// Load configuration from a specific data directory, writing a default
	/// file when none exists
	pub fn load_from(data_dir: &Path) -> Result<Self, ConfigError> {
		let config_path = data_dir.join(CONFIG_FILE);

		if config_path.exists() {
			info!("Loading config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)?;
			let config: WalletConfig = serde_json::from_str(&json)?;

			if config.version > CONFIG_VERSION {
				return Err(ConfigError::UnsupportedVersion {
					found: config.version,
					supported: CONFIG_VERSION,
				});
			}

			Ok(config)
		} else {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		}
	}

	/// Create default configuration with specific data directory
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: CONFIG_VERSION,
			data_dir,
			coordinator: CoordinatorConfig::default(),
			cache: CacheConfig::default(),
			sync: SyncConfig::default(),
			outbox: OutboxConfig::default(),
			recovery: RecoveryConfig::default(),
			logging: LoggingConfig::default(),
		}
	}

	/// Save configuration to disk
	pub fn save(&self) -> Result<(), ConfigError> {
		fs::create_dir_all(&self.data_dir)?;

		let config_path = self.data_dir.join(CONFIG_FILE);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	/// Path of the persistent wallet store
	pub fn store_path(&self) -> PathBuf {
		self.data_dir.join("wallet.redb")
	}

	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join(&self.logging.log_directory)
	}
}
