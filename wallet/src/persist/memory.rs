//! A [Datastore] that keeps everything in memory.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Context;
use bitcoin::{OutPoint, PubkeyHash, ScriptBuf, Txid};
use bitcoin::secp256k1::SecretKey;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use bitcoin_ext::BlockHeight;

use crate::persist::{Datastore, KeyPath, KeyPurpose, StoredTxn, StoredUtxo};


#[derive(Debug, Clone)]
enum KeyEntry {
	Derived { path: KeyPath, used: bool },
	Imported { key: SecretKey, used: bool },
}

#[derive(Default)]
struct Inner {
	utxos: BTreeMap<OutPoint, StoredUtxo>,
	txns: BTreeMap<Txid, StoredTxn>,
	keys: HashMap<PubkeyHash, KeyEntry>,
	watched: BTreeSet<ScriptBuf>,
	cache: HashMap<String, String>,
}

impl Inner {
	fn derived(&self, purpose: KeyPurpose) -> impl Iterator<Item = (u32, bool)> + '_ {
		self.keys.values().filter_map(move |k| match k {
			KeyEntry::Derived { path, used } if path.purpose == purpose => Some((path.index, *used)),
			_ => None,
		})
	}
}

/// An in-memory [Datastore], for tests and short-lived wallets.
#[derive(Default)]
pub struct MemoryDatastore {
	inner: Mutex<Inner>,
}

impl MemoryDatastore {
	pub fn new() -> MemoryDatastore {
		MemoryDatastore::default()
	}
}

impl Datastore for MemoryDatastore {
	fn put_utxo(&self, utxo: &StoredUtxo) -> anyhow::Result<()> {
		self.inner.lock().utxos.insert(utxo.outpoint, utxo.clone());
		Ok(())
	}

	fn get_utxos(&self) -> anyhow::Result<Vec<StoredUtxo>> {
		Ok(self.inner.lock().utxos.values().cloned().collect())
	}

	fn set_utxo_watch_only(&self, outpoint: OutPoint, watch_only: bool) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		let utxo = inner.utxos.get_mut(&outpoint)
			.with_context(|| format!("unknown utxo {}", outpoint))?;
		utxo.watch_only = watch_only;
		Ok(())
	}

	fn delete_utxo(&self, outpoint: OutPoint) -> anyhow::Result<bool> {
		Ok(self.inner.lock().utxos.remove(&outpoint).is_some())
	}

	fn put_txn(&self, txn: &StoredTxn) -> anyhow::Result<()> {
		self.inner.lock().txns.insert(txn.txid, txn.clone());
		Ok(())
	}

	fn get_txn(&self, txid: Txid) -> anyhow::Result<Option<StoredTxn>> {
		Ok(self.inner.lock().txns.get(&txid).cloned())
	}

	fn get_txns(&self, include_watch_only: bool) -> anyhow::Result<Vec<StoredTxn>> {
		Ok(self.inner.lock().txns.values()
			.filter(|t| include_watch_only || !t.watch_only)
			.cloned()
			.collect())
	}

	fn update_txn_height(
		&self,
		txid: Txid,
		height: BlockHeight,
		timestamp: DateTime<Utc>,
	) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		let txn = inner.txns.get_mut(&txid)
			.with_context(|| format!("unknown transaction {}", txid))?;
		txn.height = height;
		txn.timestamp = timestamp;
		Ok(())
	}

	fn delete_txn(&self, txid: Txid) -> anyhow::Result<bool> {
		Ok(self.inner.lock().txns.remove(&txid).is_some())
	}

	fn put_key(&self, hash: PubkeyHash, path: KeyPath) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		if inner.derived(path.purpose).any(|(idx, _)| idx == path.index) {
			bail!("key {} already exists", path);
		}
		inner.keys.insert(hash, KeyEntry::Derived { path, used: false });
		Ok(())
	}

	fn import_key(&self, hash: PubkeyHash, key: &SecretKey) -> anyhow::Result<()> {
		self.inner.lock().keys.insert(hash, KeyEntry::Imported { key: *key, used: false });
		Ok(())
	}

	fn mark_key_used(&self, hash: PubkeyHash) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		match inner.keys.get_mut(&hash) {
			Some(KeyEntry::Derived { used, .. }) | Some(KeyEntry::Imported { used, .. }) => {
				*used = true;
				Ok(())
			},
			None => bail!("unknown key {}", hash),
		}
	}

	fn get_last_key_index(&self, purpose: KeyPurpose) -> anyhow::Result<Option<(u32, bool)>> {
		Ok(self.inner.lock().derived(purpose).max_by_key(|(idx, _)| *idx))
	}

	fn get_path_for_key(&self, hash: PubkeyHash) -> anyhow::Result<Option<KeyPath>> {
		Ok(match self.inner.lock().keys.get(&hash) {
			Some(KeyEntry::Derived { path, .. }) => Some(*path),
			_ => None,
		})
	}

	fn get_imported_key(&self, hash: PubkeyHash) -> anyhow::Result<Option<SecretKey>> {
		Ok(match self.inner.lock().keys.get(&hash) {
			Some(KeyEntry::Imported { key, .. }) => Some(*key),
			_ => None,
		})
	}

	fn get_imported_keys(&self) -> anyhow::Result<Vec<SecretKey>> {
		Ok(self.inner.lock().keys.values().filter_map(|k| match k {
			KeyEntry::Imported { key, .. } => Some(*key),
			_ => None,
		}).collect())
	}

	fn get_unused_keys(&self, purpose: KeyPurpose) -> anyhow::Result<Vec<u32>> {
		let mut ret = self.inner.lock().derived(purpose)
			.filter(|(_, used)| !used)
			.map(|(idx, _)| idx)
			.collect::<Vec<_>>();
		ret.sort();
		Ok(ret)
	}

	fn get_key_paths(&self) -> anyhow::Result<Vec<KeyPath>> {
		let mut ret = self.inner.lock().keys.values().filter_map(|k| match k {
			KeyEntry::Derived { path, .. } => Some(*path),
			_ => None,
		}).collect::<Vec<_>>();
		ret.sort();
		Ok(ret)
	}

	fn get_lookahead_windows(&self) -> anyhow::Result<HashMap<KeyPurpose, usize>> {
		let inner = self.inner.lock();
		Ok(KeyPurpose::ALL.iter().map(|purpose| {
			let last_used = inner.derived(*purpose).filter(|(_, used)| *used).map(|(idx, _)| idx).max();
			let window = inner.derived(*purpose)
				.filter(|(idx, used)| !used && last_used.map(|l| *idx > l).unwrap_or(true))
				.count();
			(*purpose, window)
		}).collect())
	}

	fn put_watched_scripts(&self, scripts: &[ScriptBuf]) -> anyhow::Result<()> {
		self.inner.lock().watched.extend(scripts.iter().cloned());
		Ok(())
	}

	fn get_watched_scripts(&self) -> anyhow::Result<Vec<ScriptBuf>> {
		Ok(self.inner.lock().watched.iter().cloned().collect())
	}

	fn delete_watched_script(&self, script: &ScriptBuf) -> anyhow::Result<()> {
		self.inner.lock().watched.remove(script);
		Ok(())
	}

	fn get_cache(&self, key: &str) -> anyhow::Result<Option<String>> {
		Ok(self.inner.lock().cache.get(key).cloned())
	}

	fn set_cache(&self, key: &str, value: &str) -> anyhow::Result<()> {
		self.inner.lock().cache.insert(key.to_owned(), value.to_owned());
		Ok(())
	}
}
