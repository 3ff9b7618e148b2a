//! Deterministic ids of split outputs and the candidate search used when a
//! split's parameters were lost.

use sha2::{Digest, Sha256};

use crate::domain::{InclusionProof, SplitParams, Token, TokenId};

const CHANGE_DOMAIN: &[u8] = b"tw:split-change";
const RECIPIENT_DOMAIN: &[u8] = b"tw:split-recipient";

fn derive(domain: &[u8], source: &TokenId, split_amount: u64, remainder: u64) -> TokenId {
	let mut hasher = Sha256::new();
	hasher.update(domain);
	hasher.update(source.0.as_bytes());
	hasher.update(split_amount.to_be_bytes());
	hasher.update(remainder.to_be_bytes());
	TokenId(hex::encode(hasher.finalize()))
}

/// Id of the change token a split of `source` leaves with the sender.
pub fn change_token_id(source: &TokenId, split_amount: u64, remainder: u64) -> TokenId {
	derive(CHANGE_DOMAIN, source, split_amount, remainder)
}

/// Id of the token a split of `source` creates for the recipient.
pub fn recipient_token_id(source: &TokenId, split_amount: u64, remainder: u64) -> TokenId {
	derive(RECIPIENT_DOMAIN, source, split_amount, remainder)
}

fn genesis_data(kind: &str, source: &TokenId, split: &SplitParams) -> Vec<u8> {
	format!(
		"{kind}:{source}:{}:{}:{}",
		split.split_amount, split.remainder, split.coin_id
	)
	.into_bytes()
}

/// The change token of a split, as it is reconstructed locally.
pub fn change_token(
	source: &TokenId,
	split: &SplitParams,
	proof: Option<InclusionProof>,
) -> Token {
	Token::minted(
		change_token_id(source, split.split_amount, split.remainder),
		split.coin_id.clone(),
		split.remainder,
		genesis_data("change", source, split),
		proof,
	)
}

/// The recipient's side of a split.
pub fn recipient_token(
	source: &TokenId,
	split: &SplitParams,
	proof: Option<InclusionProof>,
) -> Token {
	Token::minted(
		recipient_token_id(source, split.split_amount, split.remainder),
		split.coin_id.clone(),
		split.split_amount,
		genesis_data("recipient", source, split),
		proof,
	)
}

/// Plausible `(split_amount, remainder)` pairs for a token of `total`, most
/// common first: whole percentages, then repeated halving.
pub fn candidate_splits(total: u64, limit: usize) -> Vec<(u64, u64)> {
	let mut candidates = Vec::new();
	let mut push = |split: u64| {
		if split == 0 || split >= total {
			return;
		}
		let pair = (split, total - split);
		if !candidates.contains(&pair) {
			candidates.push(pair);
		}
	};

	for percent in 1..100u128 {
		push((total as u128 * percent / 100) as u64);
	}

	let mut half = total / 2;
	while half > 0 {
		push(half);
		half /= 2;
	}

	candidates.truncate(limit);
	candidates
}
