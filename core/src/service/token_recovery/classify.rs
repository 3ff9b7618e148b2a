use serde::{Deserialize, Serialize};

use crate::infra::ledger::FailureStatus;

/// What a failed transfer means for the token it tried to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
	/// The ledger was not reached. Nothing is known about the token.
	NetworkError,
	/// The ledger confirms the token state is consumed.
	AlreadySpent,
	AuthenticatorFailed,
	RequestIdMismatch,
	OtherRejection,
}

impl ErrorClass {
	/// Class of a non-transient rejection once a spent check has answered.
	///
	/// A rejection saying "already spent" that the spent check does not confirm is
	/// not trusted and is treated as any other rejection.
	pub(super) fn after_spent_check(status: &FailureStatus, spent: bool) -> Self {
		if spent {
			return Self::AlreadySpent;
		}
		match status {
			FailureStatus::AuthenticatorVerificationFailed => Self::AuthenticatorFailed,
			FailureStatus::RequestIdMismatch => Self::RequestIdMismatch,
			_ => Self::OtherRejection,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_spent_check_overrides_status() {
		assert_eq!(
			ErrorClass::after_spent_check(&FailureStatus::Rejected("x".into()), true),
			ErrorClass::AlreadySpent
		);
		assert_eq!(
			ErrorClass::after_spent_check(&FailureStatus::AlreadySpent, false),
			ErrorClass::OtherRejection
		);
		assert_eq!(
			ErrorClass::after_spent_check(&FailureStatus::AuthenticatorVerificationFailed, false),
			ErrorClass::AuthenticatorFailed
		);
		assert_eq!(
			ErrorClass::after_spent_check(&FailureStatus::RequestIdMismatch, false),
			ErrorClass::RequestIdMismatch
		);
	}
}
