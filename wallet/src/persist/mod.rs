//! Persistence of the wallet state.
//!
//! The [Datastore] trait is the storage boundary of the wallet. It holds the
//! unspent outputs and transactions the sync engine observed, the wallet keys,
//! the watched scripts and a small string cache for checkpoints.
//!
//! Implementations must be safe for concurrent use: the sync engine calls
//! them from many tasks at once.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::{Amount, OutPoint, PubkeyHash, ScriptBuf, SignedAmount, Transaction, Txid};
use bitcoin::secp256k1::SecretKey;
use chrono::{DateTime, Utc};

use bitcoin_ext::BlockHeight;


/// An unspent output paying to a wallet key or a watched script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUtxo {
	pub outpoint: OutPoint,
	pub value: Amount,
	pub script_pubkey: ScriptBuf,
	/// Height of the block that confirmed it, 0 while unconfirmed.
	pub height: BlockHeight,
	pub watch_only: bool,
}

/// A transaction touching the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTxn {
	pub txid: Txid,
	/// Owned outputs minus owned inputs.
	pub net_value: SignedAmount,
	/// Height of the block that confirmed it, 0 while unconfirmed.
	pub height: BlockHeight,
	pub timestamp: DateTime<Utc>,
	pub watch_only: bool,
	pub tx: Transaction,
}

/// The two key chains of the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPurpose {
	/// Keys handed out to receive payments.
	External,
	/// Keys used for change.
	Internal,
}

impl KeyPurpose {
	pub const ALL: [KeyPurpose; 2] = [KeyPurpose::External, KeyPurpose::Internal];

	pub fn as_index(&self) -> u32 {
		match self {
			KeyPurpose::External => 0,
			KeyPurpose::Internal => 1,
		}
	}

	pub fn from_index(idx: u32) -> Option<KeyPurpose> {
		match idx {
			0 => Some(KeyPurpose::External),
			1 => Some(KeyPurpose::Internal),
			_ => None,
		}
	}
}

impl fmt::Display for KeyPurpose {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			KeyPurpose::External => f.write_str("external"),
			KeyPurpose::Internal => f.write_str("internal"),
		}
	}
}

impl FromStr for KeyPurpose {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"external" => Ok(KeyPurpose::External),
			"internal" => Ok(KeyPurpose::Internal),
			_ => bail!("invalid key purpose: {}", s),
		}
	}
}

/// The derivation path of a wallet key below the account key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath {
	pub purpose: KeyPurpose,
	pub index: u32,
}

impl fmt::Display for KeyPath {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.purpose.as_index(), self.index)
	}
}

/// The storage boundary of the wallet.
pub trait Datastore: Send + Sync + 'static {
	// * utxos

	/// Insert or replace the output with the same outpoint.
	fn put_utxo(&self, utxo: &StoredUtxo) -> anyhow::Result<()>;

	fn get_utxos(&self) -> anyhow::Result<Vec<StoredUtxo>>;

	fn set_utxo_watch_only(&self, outpoint: OutPoint, watch_only: bool) -> anyhow::Result<()>;

	/// Returns whether the output was present.
	fn delete_utxo(&self, outpoint: OutPoint) -> anyhow::Result<bool>;

	// * transactions

	/// Insert or replace the transaction with the same txid.
	fn put_txn(&self, txn: &StoredTxn) -> anyhow::Result<()>;

	fn get_txn(&self, txid: Txid) -> anyhow::Result<Option<StoredTxn>>;

	fn get_txns(&self, include_watch_only: bool) -> anyhow::Result<Vec<StoredTxn>>;

	fn update_txn_height(
		&self,
		txid: Txid,
		height: BlockHeight,
		timestamp: DateTime<Utc>,
	) -> anyhow::Result<()>;

	/// Returns whether the transaction was present.
	fn delete_txn(&self, txid: Txid) -> anyhow::Result<bool>;

	// * keys

	/// Store a derived key, identified by the hash of its public key.
	fn put_key(&self, hash: PubkeyHash, path: KeyPath) -> anyhow::Result<()>;

	/// Store a key that was not derived from the wallet's account key.
	fn import_key(&self, hash: PubkeyHash, key: &SecretKey) -> anyhow::Result<()>;

	/// Fails if the key is unknown.
	fn mark_key_used(&self, hash: PubkeyHash) -> anyhow::Result<()>;

	/// The highest derived index for the purpose and whether it was used.
	fn get_last_key_index(&self, purpose: KeyPurpose) -> anyhow::Result<Option<(u32, bool)>>;

	/// The path of a derived key. Imported keys have no path.
	fn get_path_for_key(&self, hash: PubkeyHash) -> anyhow::Result<Option<KeyPath>>;

	/// The secret of an imported key.
	fn get_imported_key(&self, hash: PubkeyHash) -> anyhow::Result<Option<SecretKey>>;

	fn get_imported_keys(&self) -> anyhow::Result<Vec<SecretKey>>;

	/// The unused derived indices of the purpose, ascending.
	fn get_unused_keys(&self, purpose: KeyPurpose) -> anyhow::Result<Vec<u32>>;

	fn get_key_paths(&self) -> anyhow::Result<Vec<KeyPath>>;

	/// The number of unused keys past the last used one, per purpose.
	fn get_lookahead_windows(&self) -> anyhow::Result<HashMap<KeyPurpose, usize>>;

	// * watched scripts

	fn put_watched_scripts(&self, scripts: &[ScriptBuf]) -> anyhow::Result<()>;

	fn put_watched_script(&self, script: &ScriptBuf) -> anyhow::Result<()> {
		self.put_watched_scripts(std::slice::from_ref(script))
	}

	fn get_watched_scripts(&self) -> anyhow::Result<Vec<ScriptBuf>>;

	fn delete_watched_script(&self, script: &ScriptBuf) -> anyhow::Result<()>;

	// * cache

	fn get_cache(&self, key: &str) -> anyhow::Result<Option<String>>;

	fn set_cache(&self, key: &str, value: &str) -> anyhow::Result<()>;
}
