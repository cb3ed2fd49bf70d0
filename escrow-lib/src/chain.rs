//! Per-chain capabilities.
//!
//! The engine never looks at which coin it is running on. Everything that
//! differs between chains (address text encoding, which script templates pay
//! to keys and escrows, transaction size accounting and dust rules) is
//! reached through the [Chain] capability set, so adding a chain means adding
//! an implementation of these traits and nothing else.

use std::str::FromStr;

use bitcoin::{Address, Amount, CompressedPublicKey, FeeRate, Network, PubkeyHash, Script, ScriptBuf, Weight};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;

use bitcoin_ext::{ScriptExt, DEFAULT_DUST_RELAY_FEE};

use crate::error::Error;
use crate::weight::{self, InputClass};


/// The script templates a chain uses for keys and escrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
	/// Keys are paid through P2WPKH and escrows through P2WSH.
	Witness,
	/// Keys are paid through P2PKH and escrows through P2SH, for chains
	/// without witness programs.
	Legacy,
}

/// Conversion between output scripts and their address text.
pub trait AddressCodec {
	/// The address for the script, if it has one on this chain.
	fn encode_address(&self, script: &Script) -> Option<String>;

	/// Parse an address into the script it pays to.
	fn decode_address(&self, address: &str) -> Result<ScriptBuf, Error>;
}

/// The output script templates of a chain.
pub trait ScriptCodec {
	fn script_kind(&self) -> ScriptKind;

	/// The script paying to a single wallet key.
	fn key_script(&self, pubkey: &PublicKey) -> ScriptBuf {
		let pk = CompressedPublicKey(*pubkey);
		match self.script_kind() {
			ScriptKind::Witness => ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()),
			ScriptKind::Legacy => ScriptBuf::new_p2pkh(&pk.pubkey_hash()),
		}
	}

	/// The hash of the key a key script pays to.
	///
	/// Returns [None] for any script that is not a key script.
	fn key_hash(&self, script: &Script) -> Option<PubkeyHash> {
		let bytes = script.as_bytes();
		if script.is_p2wpkh() {
			PubkeyHash::from_slice(&bytes[2..22]).ok()
		} else if script.is_p2pkh() {
			PubkeyHash::from_slice(&bytes[3..23]).ok()
		} else {
			None
		}
	}

	/// The script paying to the hash of an escrow redeem script.
	fn escrow_script_pubkey(&self, redeem_script: &Script) -> ScriptBuf {
		match self.script_kind() {
			ScriptKind::Witness => ScriptBuf::new_p2wsh(&redeem_script.wscript_hash()),
			ScriptKind::Legacy => ScriptBuf::new_p2sh(&redeem_script.script_hash()),
		}
	}
}

/// Worst-case serialized size accounting.
pub trait SerializeSizeEstimator {
	fn estimate_weight(&self, inputs: &[InputClass], outputs: &[&Script]) -> Weight;
}

/// The dust rules of a chain.
pub trait DustPolicy {
	/// The smallest value an output to `script` may carry.
	fn dust_threshold(&self, script: &Script) -> Amount;

	fn is_dust(&self, amount: Amount, script: &Script) -> bool {
		amount < self.dust_threshold(script)
	}
}

/// The full capability set the wallet engine needs from a chain.
pub trait Chain: AddressCodec + ScriptCodec + SerializeSizeEstimator + DustPolicy + Send + Sync + 'static {
	/// Short identifier of the coin, used to key per-coin state.
	fn coin(&self) -> String;

	/// A maximal-length destination script, used to never underestimate
	/// the fee of a payment whose destination is not known yet.
	fn dummy_destination(&self) -> ScriptBuf {
		match self.script_kind() {
			ScriptKind::Witness => ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::all_zeros()),
			ScriptKind::Legacy => ScriptBuf::new_p2pkh(&PubkeyHash::all_zeros()),
		}
	}
}


/// Bitcoin and networks sharing its address format.
#[derive(Debug, Clone)]
pub struct BitcoinChain {
	network: Network,
	kind: ScriptKind,
	dust_relay_fee: FeeRate,
}

impl BitcoinChain {
	pub fn new(network: Network, kind: ScriptKind) -> BitcoinChain {
		BitcoinChain { network, kind, dust_relay_fee: DEFAULT_DUST_RELAY_FEE }
	}

	pub fn with_dust_relay_fee(mut self, dust_relay_fee: FeeRate) -> BitcoinChain {
		self.dust_relay_fee = dust_relay_fee;
		self
	}

	pub fn network(&self) -> Network {
		self.network
	}
}

impl AddressCodec for BitcoinChain {
	fn encode_address(&self, script: &Script) -> Option<String> {
		Address::from_script(script, self.network).ok().map(|a| a.to_string())
	}

	fn decode_address(&self, address: &str) -> Result<ScriptBuf, Error> {
		let invalid = |reason: String| Error::InvalidAddress {
			address: address.to_owned(),
			reason,
		};
		let unchecked = Address::from_str(address).map_err(|e| invalid(e.to_string()))?;
		let checked = unchecked.require_network(self.network).map_err(|e| invalid(e.to_string()))?;
		Ok(checked.script_pubkey())
	}
}

impl ScriptCodec for BitcoinChain {
	fn script_kind(&self) -> ScriptKind {
		self.kind
	}
}

impl SerializeSizeEstimator for BitcoinChain {
	fn estimate_weight(&self, inputs: &[InputClass], outputs: &[&Script]) -> Weight {
		weight::estimate_tx_weight(self.kind, inputs, outputs)
	}
}

impl DustPolicy for BitcoinChain {
	fn dust_threshold(&self, script: &Script) -> Amount {
		script.dust_threshold(self.dust_relay_fee)
	}
}

impl Chain for BitcoinChain {
	fn coin(&self) -> String {
		match self.kind {
			ScriptKind::Witness => self.network.to_string(),
			ScriptKind::Legacy => format!("{}-legacy", self.network),
		}
	}
}
