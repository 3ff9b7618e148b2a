//! Boundary to the external ledger (aggregator) that orders commitments and
//! issues inclusion proofs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Commitment, InclusionProof, RequestId, Token, TokenId};

/// Categorized reason the ledger refused (or could not take) a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureStatus {
	Network(String),
	Timeout,
	ServerError(u16),
	AlreadySpent,
	AuthenticatorVerificationFailed,
	RequestIdMismatch,
	Rejected(String),
}

impl FailureStatus {
	/// Failures that say nothing about the token itself.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Network(_) | Self::Timeout | Self::ServerError(_))
	}

	/// Best-effort categorization of a free-text error, for ledger clients
	/// that only surface messages.
	pub fn from_message(message: &str) -> Self {
		let lower = message.to_ascii_lowercase();

		if lower.contains("already_spent") || lower.contains("already spent") {
			return Self::AlreadySpent;
		}
		if lower.contains("authenticator_verification_failed")
			|| lower.contains("authenticator verification failed")
		{
			return Self::AuthenticatorVerificationFailed;
		}
		if lower.contains("request_id_mismatch") || lower.contains("request id mismatch") {
			return Self::RequestIdMismatch;
		}
		if lower.contains("timeout") || lower.contains("timed out") {
			return Self::Timeout;
		}
		if let Some(code) = server_error_code(&lower) {
			return Self::ServerError(code);
		}
		const NETWORK_MARKERS: [&str; 6] = [
			"fetch failed",
			"network",
			"econnrefused",
			"econnreset",
			"connection refused",
			"dns",
		];
		if NETWORK_MARKERS.iter().any(|marker| lower.contains(marker)) {
			return Self::Network(message.to_owned());
		}

		Self::Rejected(message.to_owned())
	}
}

/// A 5xx code that reads as an HTTP status: leading the message, or right
/// after `http`, `http/1.1`, `status` or `code`.
fn server_error_code(lower: &str) -> Option<u16> {
	let words = lower
		.split_whitespace()
		.map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '/' && c != '.'))
		.collect::<Vec<_>>();

	words.iter().enumerate().find_map(|(i, word)| {
		if word.len() != 3 {
			return None;
		}
		let code = word.parse::<u16>().ok().filter(|code| (500..600).contains(code))?;
		let status_shaped = match i.checked_sub(1).map(|prev| words[prev]) {
			None => true,
			Some(prev) => prev.starts_with("http") || prev == "status" || prev == "code",
		};
		status_shaped.then_some(code)
	})
}

impl From<&LedgerError> for FailureStatus {
	fn from(error: &LedgerError) -> Self {
		match error {
			LedgerError::Network(msg) => Self::Network(msg.clone()),
			LedgerError::Timeout => Self::Timeout,
			LedgerError::HttpStatus(code) if *code >= 500 => Self::ServerError(*code),
			LedgerError::HttpStatus(code) => Self::Rejected(format!("http status {code}")),
			LedgerError::InvalidResponse(msg) => Self::Rejected(msg.clone()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
	Success,
	/// The same request id was already accepted. Equivalent to success.
	RequestIdExists,
	Rejected(FailureStatus),
}

impl SubmitStatus {
	pub fn is_accepted(&self) -> bool {
		matches!(self, Self::Success | Self::RequestIdExists)
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
	#[error("ledger unreachable: {0}")]
	Network(String),
	#[error("ledger request timed out")]
	Timeout,
	#[error("ledger returned http status {0}")]
	HttpStatus(u16),
	#[error("invalid ledger response: {0}")]
	InvalidResponse(String),
}

impl LedgerError {
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Network(_) | Self::Timeout => true,
			Self::HttpStatus(code) => *code >= 500,
			Self::InvalidResponse(_) => false,
		}
	}
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
	async fn submit_mint_commitment(
		&self,
		commitment: &Commitment,
	) -> Result<SubmitStatus, LedgerError>;

	async fn submit_transfer_commitment(
		&self,
		commitment: &Commitment,
	) -> Result<SubmitStatus, LedgerError>;

	/// `None` while the proof is not available yet.
	async fn get_inclusion_proof(
		&self,
		request_id: &RequestId,
	) -> Result<Option<InclusionProof>, LedgerError>;

	/// Whether the token's current state has been consumed on the ledger.
	async fn check_spent(&self, token: &Token) -> Result<bool, LedgerError>;

	/// Whether the ledger holds a proof (inclusion or exclusion) for the
	/// genesis of `token_id`.
	async fn token_exists(&self, token_id: &TokenId) -> Result<bool, LedgerError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_legacy_messages() {
		assert_eq!(
			FailureStatus::from_message("TypeError: fetch failed"),
			FailureStatus::Network("TypeError: fetch failed".into())
		);
		assert_eq!(FailureStatus::from_message("Request timed out"), FailureStatus::Timeout);
		assert_eq!(
			FailureStatus::from_message("HTTP 503 Service Unavailable"),
			FailureStatus::ServerError(503)
		);
		assert_eq!(
			FailureStatus::from_message("REQUEST_ID_MISMATCH"),
			FailureStatus::RequestIdMismatch
		);
		assert_eq!(
			FailureStatus::from_message("Authenticator verification failed"),
			FailureStatus::AuthenticatorVerificationFailed
		);
		assert_eq!(
			FailureStatus::from_message("token is ALREADY_SPENT"),
			FailureStatus::AlreadySpent
		);
		assert_eq!(
			FailureStatus::from_message("bad predicate"),
			FailureStatus::Rejected("bad predicate".into())
		);
	}

	#[test]
	fn test_only_status_shaped_numbers_are_server_errors() {
		assert_eq!(
			FailureStatus::from_message("503 Service Unavailable"),
			FailureStatus::ServerError(503)
		);
		assert_eq!(
			FailureStatus::from_message("upstream returned status code 502"),
			FailureStatus::ServerError(502)
		);
		assert_eq!(
			FailureStatus::from_message("HTTP/1.1 500 Internal Server Error"),
			FailureStatus::ServerError(500)
		);
		assert_eq!(
			FailureStatus::from_message("amount 512 exceeds balance"),
			FailureStatus::Rejected("amount 512 exceeds balance".into())
		);
		assert_eq!(
			FailureStatus::from_message("invalid predicate at offset 550"),
			FailureStatus::Rejected("invalid predicate at offset 550".into())
		);
	}

	#[test]
	fn test_error_to_status() {
		assert!(FailureStatus::from(&LedgerError::HttpStatus(502)).is_transient());
		assert!(!FailureStatus::from(&LedgerError::HttpStatus(400)).is_transient());
		assert!(FailureStatus::from(&LedgerError::Timeout).is_transient());
	}
}
