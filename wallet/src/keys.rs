//! Wallet keys.
//!
//! Keys are derived from an account-level extended private key along
//! `purpose/index`, both non-hardened. For each purpose a window of unused
//! keys is kept derived past the last used one, so payments to addresses
//! handed out earlier are still recognized.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bitcoin::{CompressedPublicKey, PubkeyHash, Script, ScriptBuf};
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::{Keypair, PublicKey, SecretKey};
use parking_lot::Mutex;

use escrow::{Chain, SECP};

use crate::persist::{Datastore, KeyPath, KeyPurpose};


/// The number of unused keys kept ahead by default.
pub const DEFAULT_LOOKAHEAD: usize = 20;

/// The hash identifying a key in the [Datastore].
pub fn pubkey_hash(pubkey: &PublicKey) -> PubkeyHash {
	CompressedPublicKey(*pubkey).pubkey_hash()
}

/// A script paying to one of the wallet's keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedScript {
	pub script: ScriptBuf,
	pub key_hash: PubkeyHash,
}

pub struct KeyManager {
	db: Arc<dyn Datastore>,
	chain: Arc<dyn Chain>,
	account: Xpriv,
	lookahead: usize,
	/// Scripts of derived keys, so listing them doesn't derive again.
	scripts: Mutex<HashMap<KeyPath, OwnedScript>>,
}

impl KeyManager {
	pub fn new(
		db: Arc<dyn Datastore>,
		chain: Arc<dyn Chain>,
		account: Xpriv,
		lookahead: usize,
	) -> anyhow::Result<KeyManager> {
		let ret = KeyManager { db, chain, account, lookahead, scripts: Mutex::new(HashMap::new()) };
		ret.extend_lookahead()?;
		Ok(ret)
	}

	pub fn derive(&self, path: KeyPath) -> anyhow::Result<Keypair> {
		let steps = [
			ChildNumber::from_normal_idx(path.purpose.as_index())?,
			ChildNumber::from_normal_idx(path.index)?,
		];
		let xpriv = self.account.derive_priv(&SECP, &steps)
			.with_context(|| format!("failed to derive key {}", path))?;
		Ok(xpriv.to_keypair(&SECP))
	}

	fn owned_script(&self, pubkey: &PublicKey) -> OwnedScript {
		OwnedScript { script: self.chain.key_script(pubkey), key_hash: pubkey_hash(pubkey) }
	}

	fn store(&self, path: KeyPath) -> anyhow::Result<Keypair> {
		let key = self.derive(path)?;
		let owned = self.owned_script(&key.public_key());
		self.db.put_key(owned.key_hash, path)?;
		self.scripts.lock().insert(path, owned);
		trace!("Derived new {} key at index {}", path.purpose, path.index);
		Ok(key)
	}

	fn derived_script(&self, path: KeyPath) -> anyhow::Result<OwnedScript> {
		if let Some(owned) = self.scripts.lock().get(&path) {
			return Ok(owned.clone());
		}
		let owned = self.owned_script(&self.derive(path)?.public_key());
		self.scripts.lock().insert(path, owned.clone());
		Ok(owned)
	}

	fn next_index(&self, purpose: KeyPurpose) -> anyhow::Result<u32> {
		Ok(match self.db.get_last_key_index(purpose)? {
			Some((idx, _)) => idx.checked_add(1).context("key index overflow")?,
			None => 0,
		})
	}

	/// Derive keys until each purpose has a full window of unused keys.
	fn extend_lookahead(&self) -> anyhow::Result<()> {
		let windows = self.db.get_lookahead_windows()?;
		for purpose in KeyPurpose::ALL {
			let have = windows.get(&purpose).copied().unwrap_or(0);
			if have >= self.lookahead {
				continue;
			}
			let next = self.next_index(purpose)?;
			for i in 0..(self.lookahead - have) as u32 {
				self.store(KeyPath { purpose, index: next + i })?;
			}
		}
		Ok(())
	}

	/// Mark the key as used and extend the lookahead window past it.
	pub fn mark_key_used(&self, hash: PubkeyHash) -> anyhow::Result<()> {
		self.db.mark_key_used(hash)?;
		self.extend_lookahead()
	}

	/// The first unused key of the purpose.
	pub fn current_key(&self, purpose: KeyPurpose) -> anyhow::Result<Keypair> {
		match self.db.get_unused_keys(purpose)?.first() {
			Some(index) => self.derive(KeyPath { purpose, index: *index }),
			None => self.fresh_key(purpose),
		}
	}

	/// A key that was never handed out before.
	pub fn fresh_key(&self, purpose: KeyPurpose) -> anyhow::Result<Keypair> {
		let index = self.next_index(purpose)?;
		self.store(KeyPath { purpose, index })
	}

	/// The scripts of all derived and imported keys.
	pub fn owned_scripts(&self) -> anyhow::Result<Vec<OwnedScript>> {
		let mut ret = self.db.get_key_paths()?.into_iter()
			.map(|p| self.derived_script(p))
			.collect::<anyhow::Result<Vec<_>>>()?;
		ret.extend(self.db.get_imported_keys()?.iter()
			.map(|sk| self.owned_script(&sk.public_key(&SECP))));
		Ok(ret)
	}

	pub fn key_for_hash(&self, hash: PubkeyHash) -> anyhow::Result<Option<Keypair>> {
		if let Some(path) = self.db.get_path_for_key(hash)? {
			return Ok(Some(self.derive(path)?));
		}
		Ok(self.db.get_imported_key(hash)?.map(|sk| Keypair::from_secret_key(&SECP, &sk)))
	}

	/// The key able to spend outputs with the given script.
	pub fn key_for_script(&self, script: &Script) -> anyhow::Result<Option<Keypair>> {
		match self.chain.key_hash(script) {
			Some(hash) => self.key_for_hash(hash),
			None => Ok(None),
		}
	}

	pub fn import_key(&self, key: SecretKey) -> anyhow::Result<()> {
		let pk = key.public_key(&SECP);
		self.db.import_key(pubkey_hash(&pk), &key)
	}
}
