//! Peer delivery of finished artifacts

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Recipient;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
	#[error("relay unreachable: {0}")]
	Network(String),
	#[error("delivery timed out")]
	Timeout,
	#[error("unknown recipient: {0}")]
	UnknownRecipient(String),
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
	/// Hand `payload` to the transport for `recipient`. Returns the
	/// transport's delivery id.
	async fn deliver(&self, recipient: &Recipient, payload: Vec<u8>)
		-> Result<String, TransportError>;
}
