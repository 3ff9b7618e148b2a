//! In-memory stand-ins for the ledger, the remote store and the peer
//! transport.
//!
//! They behave like the real services where it matters: the ledger is
//! idempotent on request ids and tracks spent states, and the remote store
//! is content-addressed.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
	domain::{
		Commitment, ContentHash, InclusionProof, InventorySnapshot, Recipient, RequestId, Token,
		TokenId, VersionRecord,
	},
	infra::{
		ledger::{FailureStatus, LedgerClient, LedgerError, SubmitStatus},
		remote::{RemoteError, RemoteStore},
		transport::{MessageTransport, TransportError},
	},
	service::outbox::TransferPackage,
};

#[derive(Default)]
struct LedgerState {
	accepted: HashMap<RequestId, Commitment>,
	submitted: Vec<RequestId>,
	spent: HashSet<String>,
	existing: HashSet<TokenId>,
	scripted: VecDeque<Result<SubmitStatus, LedgerError>>,
	withhold_proofs: bool,
	fail_spent_checks: bool,
	duplicates: usize,
	spent_checks: usize,
	exists_checks: usize,
}

/// Ledger that accepts every well-formed commitment once.
#[derive(Default)]
pub struct MockLedger {
	state: Mutex<LedgerState>,
}

impl MockLedger {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_spent(&self, token: &Token) {
		self.state.lock().spent.insert(token.state_hash());
	}

	pub fn add_existing_token(&self, id: TokenId) {
		self.state.lock().existing.insert(id);
	}

	/// Answer the next submission with `response` instead of processing it.
	pub fn push_submit_response(&self, response: Result<SubmitStatus, LedgerError>) {
		self.state.lock().scripted.push_back(response);
	}

	pub fn withhold_proofs(&self, withhold: bool) {
		self.state.lock().withhold_proofs = withhold;
	}

	pub fn fail_spent_checks(&self, fail: bool) {
		self.state.lock().fail_spent_checks = fail;
	}

	/// Every submit call, in order, duplicates included.
	pub fn submitted(&self) -> Vec<RequestId> {
		self.state.lock().submitted.clone()
	}

	pub fn accepted_count(&self) -> usize {
		self.state.lock().accepted.len()
	}

	pub fn duplicate_submissions(&self) -> usize {
		self.state.lock().duplicates
	}

	pub fn spent_checks(&self) -> usize {
		self.state.lock().spent_checks
	}

	pub fn exists_checks(&self) -> usize {
		self.state.lock().exists_checks
	}

	fn submit(&self, commitment: &Commitment) -> Result<SubmitStatus, LedgerError> {
		let mut state = self.state.lock();
		state.submitted.push(commitment.request_id.clone());

		if let Some(response) = state.scripted.pop_front() {
			return response;
		}

		if state.accepted.contains_key(&commitment.request_id) {
			state.duplicates += 1;
			return Ok(SubmitStatus::RequestIdExists);
		}

		if let Some(source) = &commitment.source_state_hash {
			if !state.spent.insert(source.clone()) {
				return Ok(SubmitStatus::Rejected(FailureStatus::AlreadySpent));
			}
		}

		state
			.accepted
			.insert(commitment.request_id.clone(), commitment.clone());
		Ok(SubmitStatus::Success)
	}
}

#[async_trait]
impl LedgerClient for MockLedger {
	async fn submit_mint_commitment(
		&self,
		commitment: &Commitment,
	) -> Result<SubmitStatus, LedgerError> {
		self.submit(commitment)
	}

	async fn submit_transfer_commitment(
		&self,
		commitment: &Commitment,
	) -> Result<SubmitStatus, LedgerError> {
		self.submit(commitment)
	}

	async fn get_inclusion_proof(
		&self,
		request_id: &RequestId,
	) -> Result<Option<InclusionProof>, LedgerError> {
		let state = self.state.lock();
		if state.withhold_proofs || !state.accepted.contains_key(request_id) {
			return Ok(None);
		}
		Ok(Some(InclusionProof {
			request_id: request_id.clone(),
			data: format!("proof:{request_id}").into_bytes(),
		}))
	}

	async fn check_spent(&self, token: &Token) -> Result<bool, LedgerError> {
		let mut state = self.state.lock();
		state.spent_checks += 1;
		if state.fail_spent_checks {
			return Err(LedgerError::Network("mock ledger offline".into()));
		}
		Ok(state.spent.contains(&token.state_hash()))
	}

	async fn token_exists(&self, token_id: &TokenId) -> Result<bool, LedgerError> {
		let mut state = self.state.lock();
		state.exists_checks += 1;
		Ok(state.existing.contains(token_id))
	}
}

#[derive(Default)]
struct RemoteState {
	records: HashMap<String, VersionRecord>,
	blobs: HashMap<String, Vec<u8>>,
	offline: bool,
	resolves: usize,
	publishes: usize,
}

/// Content-addressed blob store with one mutable record per name.
#[derive(Default)]
pub struct MockRemoteStore {
	state: Mutex<RemoteState>,
}

impl MockRemoteStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_offline(&self, offline: bool) {
		self.state.lock().offline = offline;
	}

	pub fn record(&self, name: &str) -> Option<VersionRecord> {
		self.state.lock().records.get(name).cloned()
	}

	/// The snapshot the record for `name` currently points at.
	pub fn snapshot(&self, name: &str) -> Option<InventorySnapshot> {
		let state = self.state.lock();
		let record = state.records.get(name)?;
		let bytes = state.blobs.get(record.content_hash.as_str())?;
		InventorySnapshot::from_bytes(bytes).ok()
	}

	/// Store `snapshot` and point `name` at it, bypassing the publish path.
	pub fn seed(&self, name: &str, snapshot: &InventorySnapshot) -> Result<VersionRecord, serde_json::Error> {
		let bytes = snapshot.to_bytes()?;
		let hash = ContentHash::of(&bytes);
		let record = VersionRecord {
			content_hash: hash.clone(),
			sequence: snapshot.version,
		};

		let mut state = self.state.lock();
		state.blobs.insert(hash.0, bytes);
		state.records.insert(name.to_owned(), record.clone());
		Ok(record)
	}

	pub fn resolve_count(&self) -> usize {
		self.state.lock().resolves
	}

	pub fn publish_count(&self) -> usize {
		self.state.lock().publishes
	}

	fn check_online(state: &RemoteState) -> Result<(), RemoteError> {
		if state.offline {
			return Err(RemoteError::Network("mock remote offline".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl RemoteStore for MockRemoteStore {
	async fn resolve(&self, name: &str) -> Result<Option<VersionRecord>, RemoteError> {
		let mut state = self.state.lock();
		state.resolves += 1;
		Self::check_online(&state)?;
		Ok(state.records.get(name).cloned())
	}

	async fn fetch(&self, hash: &ContentHash) -> Result<Vec<u8>, RemoteError> {
		let state = self.state.lock();
		Self::check_online(&state)?;
		state
			.blobs
			.get(hash.as_str())
			.cloned()
			.ok_or_else(|| RemoteError::ContentNotFound(hash.clone()))
	}

	async fn put(&self, content: Vec<u8>) -> Result<ContentHash, RemoteError> {
		let mut state = self.state.lock();
		Self::check_online(&state)?;
		let hash = ContentHash::of(&content);
		state.blobs.insert(hash.0.clone(), content);
		Ok(hash)
	}

	async fn publish(
		&self,
		name: &str,
		hash: &ContentHash,
		sequence: u64,
	) -> Result<(), RemoteError> {
		let mut state = self.state.lock();
		Self::check_online(&state)?;
		state.publishes += 1;
		state.records.insert(
			name.to_owned(),
			VersionRecord {
				content_hash: hash.clone(),
				sequence,
			},
		);
		Ok(())
	}
}

#[derive(Default)]
struct TransportState {
	deliveries: Vec<(Recipient, Vec<u8>)>,
	offline: bool,
}

/// Records every delivered payload.
#[derive(Default)]
pub struct MockTransport {
	state: Mutex<TransportState>,
}

impl MockTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_offline(&self, offline: bool) {
		self.state.lock().offline = offline;
	}

	pub fn delivery_count(&self) -> usize {
		self.state.lock().deliveries.len()
	}

	pub fn delivered_packages(&self) -> Vec<(Recipient, TransferPackage)> {
		self.state
			.lock()
			.deliveries
			.iter()
			.filter_map(|(recipient, bytes)| {
				TransferPackage::from_bytes(bytes)
					.ok()
					.map(|package| (recipient.clone(), package))
			})
			.collect()
	}
}

#[async_trait]
impl MessageTransport for MockTransport {
	async fn deliver(
		&self,
		recipient: &Recipient,
		payload: Vec<u8>,
	) -> Result<String, TransportError> {
		let mut state = self.state.lock();
		if state.offline {
			return Err(TransportError::Network("mock relay offline".into()));
		}
		state.deliveries.push((recipient.clone(), payload));
		Ok(format!("delivery-{}", state.deliveries.len()))
	}
}
