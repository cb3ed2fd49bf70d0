//! SQLite persistence backend.
//!
//! A [Datastore] backed by a local SQLite database. Every call opens its own
//! connection, so the client can be shared freely between the tasks of the
//! sync engine. Writes touching more than one row run in a single database
//! transaction.

mod migrations;
mod query;


use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bitcoin::{OutPoint, PubkeyHash, ScriptBuf, Txid};
use bitcoin::secp256k1::SecretKey;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use rusqlite::Connection;

use bitcoin_ext::BlockHeight;

use crate::persist::{Datastore, KeyPath, KeyPurpose, StoredTxn, StoredUtxo};


/// A [Datastore] using rusqlite. Changes are persisted in the file at the
/// given [PathBuf].
#[derive(Clone)]
pub struct SqliteClient {
	connection_string: PathBuf,
}

impl SqliteClient {
	/// Open a new [SqliteClient] with the given file path
	pub fn open(db_file: impl AsRef<Path>) -> anyhow::Result<SqliteClient> {
		let path = db_file.as_ref().to_path_buf();

		debug!("Opening database at {}", path.display());
		let mut conn = rusqlite::Connection::open(&path)
			.with_context(|| format!("Error connecting to database {}", path.display()))?;

		let version = migrations::migrate(&mut conn)?;
		trace!("Database {} is at schema version {}", path.display(), version);

		Ok( Self { connection_string: path })
	}

	fn connect(&self) -> anyhow::Result<Connection> {
		rusqlite::Connection::open(&self.connection_string)
			.with_context(|| format!("Error connecting to database {}", self.connection_string.display()))
	}
}

impl Datastore for SqliteClient {
	fn put_utxo(&self, utxo: &StoredUtxo) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_utxo(&conn, utxo)
	}

	fn get_utxos(&self) -> anyhow::Result<Vec<StoredUtxo>> {
		let conn = self.connect()?;
		query::fetch_utxos(&conn)
	}

	fn set_utxo_watch_only(&self, outpoint: OutPoint, watch_only: bool) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::update_utxo_watch_only(&conn, outpoint, watch_only)
	}

	fn delete_utxo(&self, outpoint: OutPoint) -> anyhow::Result<bool> {
		let conn = self.connect()?;
		query::delete_utxo(&conn, outpoint)
	}

	fn put_txn(&self, txn: &StoredTxn) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_txn(&conn, txn)
	}

	fn get_txn(&self, txid: Txid) -> anyhow::Result<Option<StoredTxn>> {
		let conn = self.connect()?;
		query::fetch_txn(&conn, txid)
	}

	fn get_txns(&self, include_watch_only: bool) -> anyhow::Result<Vec<StoredTxn>> {
		let conn = self.connect()?;
		query::fetch_txns(&conn, include_watch_only)
	}

	fn update_txn_height(
		&self,
		txid: Txid,
		height: BlockHeight,
		timestamp: DateTime<Utc>,
	) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::update_txn_height(&conn, txid, height, timestamp)
	}

	fn delete_txn(&self, txid: Txid) -> anyhow::Result<bool> {
		let conn = self.connect()?;
		query::delete_txn(&conn, txid)
	}

	fn put_key(&self, hash: PubkeyHash, path: KeyPath) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_derived_key(&conn, hash, path)
			.with_context(|| format!("failed to store key {}", path))
	}

	fn import_key(&self, hash: PubkeyHash, key: &SecretKey) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_imported_key(&conn, hash, key)
	}

	fn mark_key_used(&self, hash: PubkeyHash) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::mark_key_used(&conn, hash)
	}

	fn get_last_key_index(&self, purpose: KeyPurpose) -> anyhow::Result<Option<(u32, bool)>> {
		let conn = self.connect()?;
		query::fetch_last_key_index(&conn, purpose)
	}

	fn get_path_for_key(&self, hash: PubkeyHash) -> anyhow::Result<Option<KeyPath>> {
		let conn = self.connect()?;
		query::fetch_path_for_key(&conn, hash)
	}

	fn get_imported_key(&self, hash: PubkeyHash) -> anyhow::Result<Option<SecretKey>> {
		let conn = self.connect()?;
		query::fetch_imported_key(&conn, hash)
	}

	fn get_imported_keys(&self) -> anyhow::Result<Vec<SecretKey>> {
		let conn = self.connect()?;
		query::fetch_imported_keys(&conn)
	}

	fn get_unused_keys(&self, purpose: KeyPurpose) -> anyhow::Result<Vec<u32>> {
		let conn = self.connect()?;
		Ok(query::fetch_derived_keys(&conn, purpose)?.into_iter()
			.filter(|(_, used)| !used)
			.map(|(idx, _)| idx)
			.collect())
	}

	fn get_key_paths(&self) -> anyhow::Result<Vec<KeyPath>> {
		let conn = self.connect()?;
		let mut ret = Vec::new();
		for purpose in KeyPurpose::ALL {
			let keys = query::fetch_derived_keys(&conn, purpose)?;
			ret.extend(keys.into_iter().map(|(index, _)| KeyPath { purpose, index }));
		}
		Ok(ret)
	}

	fn get_lookahead_windows(&self) -> anyhow::Result<HashMap<KeyPurpose, usize>> {
		let conn = self.connect()?;
		let mut ret = HashMap::new();
		for purpose in KeyPurpose::ALL {
			let keys = query::fetch_derived_keys(&conn, purpose)?;
			let last_used = keys.iter().filter(|(_, used)| *used).map(|(idx, _)| *idx).max();
			let window = keys.iter()
				.filter(|(idx, used)| !used && last_used.map(|l| *idx > l).unwrap_or(true))
				.count();
			ret.insert(purpose, window);
		}
		Ok(ret)
	}

	fn put_watched_scripts(&self, scripts: &[ScriptBuf]) -> anyhow::Result<()> {
		let mut conn = self.connect()?;
		let tx = conn.transaction()?;
		for script in scripts {
			query::store_watched_script(&tx, script)?;
		}
		tx.commit()?;
		Ok(())
	}

	fn get_watched_scripts(&self) -> anyhow::Result<Vec<ScriptBuf>> {
		let conn = self.connect()?;
		query::fetch_watched_scripts(&conn)
	}

	fn delete_watched_script(&self, script: &ScriptBuf) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::delete_watched_script(&conn, script)
	}

	fn get_cache(&self, key: &str) -> anyhow::Result<Option<String>> {
		let conn = self.connect()?;
		query::fetch_cache(&conn, key)
	}

	fn set_cache(&self, key: &str, value: &str) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_cache(&conn, key, value)
	}
}
