use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{config::OutboxConfig, domain::OutboxEntry};

/// Delay before the next attempt after `retry_count` failures:
/// `base * 2^retry_count`, capped at `cap`.
pub fn backoff_delay(retry_count: u32, base: Duration, cap: Duration) -> Duration {
	let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
	base.saturating_mul(factor).min(cap)
}

/// Whether a periodic pass should pick `entry` up at `now`.
pub fn is_due(entry: &OutboxEntry, now: DateTime<Utc>, config: &OutboxConfig) -> bool {
	if entry.retry_count == 0 {
		return true;
	}

	let delay = backoff_delay(
		entry.retry_count,
		Duration::from_millis(config.backoff_base_ms),
		Duration::from_millis(config.backoff_cap_ms),
	);
	let Ok(delay) = chrono::Duration::from_std(delay) else {
		return false;
	};

	now >= entry.updated_at + delay
}
