
use bitcoin::{Amount, Txid};


/// Errors surfaced by the escrow engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	#[error("insufficient funds: need {needed}, {available} available")]
	InsufficientFunds {
		needed: Amount,
		available: Amount,
	},
	#[error("amount of {amount} is below the dust threshold of {threshold}")]
	DustAmount {
		amount: Amount,
		threshold: Amount,
	},
	#[error("failed to generate escrow script: {0}")]
	ScriptGeneration(String),
	#[error("signing failure: {0}")]
	SigningFailure(String),
	#[error("transaction {0} is already confirmed")]
	AlreadyConfirmed(Txid),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("network error: {0}")]
	Network(String),
	#[error("invalid address '{address}': {reason}")]
	InvalidAddress {
		address: String,
		reason: String,
	},
}

impl Error {
	pub(crate) fn signing(msg: impl Into<String>) -> Error {
		Error::SigningFailure(msg.into())
	}

	pub(crate) fn script(msg: impl Into<String>) -> Error {
		Error::ScriptGeneration(msg.into())
	}
}
