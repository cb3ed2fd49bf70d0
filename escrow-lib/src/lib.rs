pub extern crate bitcoin;

#[macro_use] extern crate serde;
#[macro_use] extern crate lazy_static;
#[macro_use] extern crate log;

pub mod bip69;
pub mod chain;
pub mod error;
pub mod multisig;
pub mod script;
pub mod select;
pub mod sign;
pub mod weight;


pub use crate::chain::{BitcoinChain, Chain, ScriptKind};
pub use crate::error::Error;
pub use crate::multisig::{EscrowSpend, SpendPath};
pub use crate::script::{EscrowPolicy, EscrowScript};


use bitcoin::{Amount, OutPoint};
use bitcoin::secp256k1;

lazy_static! {
	/// Global secp context.
	pub static ref SECP: secp256k1::Secp256k1<secp256k1::All> = secp256k1::Secp256k1::new();
}

/// An output to be spent, as exchanged between the parties of an escrow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionInput {
	pub outpoint: OutPoint,
	/// Address of the output being spent, when known.
	pub linked_address: Option<String>,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub value: Amount,
}

/// A payment to an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionOutput {
	pub address: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub value: Amount,
}

/// A signature by one party over one input of an escrow release.
///
/// The signature bytes are DER-encoded and carry the sighash flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
	pub input_index: u32,
	pub signature: Vec<u8>,
}
