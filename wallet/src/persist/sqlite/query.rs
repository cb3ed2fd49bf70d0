use std::str::FromStr;

use anyhow::Context;
use bitcoin::{consensus, Amount, OutPoint, PubkeyHash, ScriptBuf, SignedAmount, Txid};
use bitcoin::secp256k1::SecretKey;
use chrono::{DateTime, Utc};
use rusqlite::{named_params, Connection, OptionalExtension, Row};

use bitcoin_ext::BlockHeight;

use crate::persist::{KeyPath, KeyPurpose, StoredTxn, StoredUtxo};


fn row_to_utxo(row: &Row) -> anyhow::Result<StoredUtxo> {
	let outpoint: String = row.get("outpoint")?;
	let value: i64 = row.get("value_sat")?;
	let script: Vec<u8> = row.get("script_pubkey")?;
	Ok(StoredUtxo {
		outpoint: OutPoint::from_str(&outpoint).context("invalid outpoint")?,
		value: Amount::from_sat(u64::try_from(value).context("negative utxo value")?),
		script_pubkey: ScriptBuf::from_bytes(script),
		height: row.get("height")?,
		watch_only: row.get("watch_only")?,
	})
}

fn row_to_txn(row: &Row) -> anyhow::Result<StoredTxn> {
	let txid: String = row.get("txid")?;
	let raw_tx: Vec<u8> = row.get("raw_tx")?;
	let timestamp: i64 = row.get("timestamp")?;
	Ok(StoredTxn {
		txid: Txid::from_str(&txid).context("invalid txid")?,
		net_value: SignedAmount::from_sat(row.get("net_value_sat")?),
		height: row.get("height")?,
		timestamp: DateTime::from_timestamp(timestamp, 0).context("invalid timestamp")?,
		watch_only: row.get("watch_only")?,
		tx: consensus::deserialize(&raw_tx).context("invalid raw transaction")?,
	})
}

fn row_to_path(row: &Row) -> anyhow::Result<Option<KeyPath>> {
	let purpose: Option<u32> = row.get("purpose")?;
	let index: Option<u32> = row.get("idx")?;
	match (purpose, index) {
		(Some(p), Some(index)) => {
			let purpose = KeyPurpose::from_index(p)
				.with_context(|| format!("invalid key purpose {}", p))?;
			Ok(Some(KeyPath { purpose, index }))
		},
		_ => Ok(None),
	}
}

pub (crate) fn store_utxo(conn: &Connection, utxo: &StoredUtxo) -> anyhow::Result<()> {
	let query =
		"INSERT INTO mwallet_utxo (outpoint, value_sat, script_pubkey, height, watch_only)
		VALUES (:outpoint, :value_sat, :script_pubkey, :height, :watch_only)
		ON CONFLICT (outpoint) DO UPDATE SET
			value_sat = :value_sat,
			script_pubkey = :script_pubkey,
			height = :height,
			watch_only = :watch_only";
	let mut statement = conn.prepare(query)?;
	statement.execute(named_params! {
		":outpoint": utxo.outpoint.to_string(),
		":value_sat": utxo.value.to_sat() as i64,
		":script_pubkey": utxo.script_pubkey.as_bytes(),
		":height": utxo.height,
		":watch_only": utxo.watch_only,
	})?;
	Ok(())
}

pub (crate) fn fetch_utxos(conn: &Connection) -> anyhow::Result<Vec<StoredUtxo>> {
	let mut statement = conn.prepare("SELECT * FROM mwallet_utxo ORDER BY outpoint")?;
	let mut rows = statement.query([])?;

	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_utxo(row)?);
	}
	Ok(ret)
}

pub (crate) fn update_utxo_watch_only(
	conn: &Connection,
	outpoint: OutPoint,
	watch_only: bool,
) -> anyhow::Result<()> {
	let query = "UPDATE mwallet_utxo SET watch_only = :watch_only WHERE outpoint = :outpoint";
	let mut statement = conn.prepare(query)?;
	let changed = statement.execute(named_params! {
		":outpoint": outpoint.to_string(),
		":watch_only": watch_only,
	})?;
	if changed == 0 {
		bail!("unknown utxo {}", outpoint);
	}
	Ok(())
}

pub (crate) fn delete_utxo(conn: &Connection, outpoint: OutPoint) -> anyhow::Result<bool> {
	let mut statement = conn.prepare("DELETE FROM mwallet_utxo WHERE outpoint = :outpoint")?;
	let changed = statement.execute(named_params! { ":outpoint": outpoint.to_string() })?;
	Ok(changed > 0)
}

pub (crate) fn store_txn(conn: &Connection, txn: &StoredTxn) -> anyhow::Result<()> {
	let query =
		"INSERT INTO mwallet_txn (txid, raw_tx, net_value_sat, height, timestamp, watch_only)
		VALUES (:txid, :raw_tx, :net_value_sat, :height, :timestamp, :watch_only)
		ON CONFLICT (txid) DO UPDATE SET
			raw_tx = :raw_tx,
			net_value_sat = :net_value_sat,
			height = :height,
			timestamp = :timestamp,
			watch_only = :watch_only";
	let mut statement = conn.prepare(query)?;
	statement.execute(named_params! {
		":txid": txn.txid.to_string(),
		":raw_tx": consensus::serialize(&txn.tx),
		":net_value_sat": txn.net_value.to_sat(),
		":height": txn.height,
		":timestamp": txn.timestamp.timestamp(),
		":watch_only": txn.watch_only,
	})?;
	Ok(())
}

pub (crate) fn fetch_txn(conn: &Connection, txid: Txid) -> anyhow::Result<Option<StoredTxn>> {
	let mut statement = conn.prepare("SELECT * FROM mwallet_txn WHERE txid = :txid")?;
	let mut rows = statement.query(named_params! { ":txid": txid.to_string() })?;
	match rows.next()? {
		Some(row) => Ok(Some(row_to_txn(row)?)),
		None => Ok(None),
	}
}

pub (crate) fn fetch_txns(conn: &Connection, include_watch_only: bool) -> anyhow::Result<Vec<StoredTxn>> {
	let query =
		"SELECT * FROM mwallet_txn
		WHERE watch_only = 0 OR :include_watch_only
		ORDER BY timestamp, txid";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query(named_params! { ":include_watch_only": include_watch_only })?;

	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_txn(row)?);
	}
	Ok(ret)
}

pub (crate) fn update_txn_height(
	conn: &Connection,
	txid: Txid,
	height: BlockHeight,
	timestamp: DateTime<Utc>,
) -> anyhow::Result<()> {
	let query = "UPDATE mwallet_txn SET height = :height, timestamp = :timestamp WHERE txid = :txid";
	let mut statement = conn.prepare(query)?;
	let changed = statement.execute(named_params! {
		":txid": txid.to_string(),
		":height": height,
		":timestamp": timestamp.timestamp(),
	})?;
	if changed == 0 {
		bail!("unknown transaction {}", txid);
	}
	Ok(())
}

pub (crate) fn delete_txn(conn: &Connection, txid: Txid) -> anyhow::Result<bool> {
	let mut statement = conn.prepare("DELETE FROM mwallet_txn WHERE txid = :txid")?;
	let changed = statement.execute(named_params! { ":txid": txid.to_string() })?;
	Ok(changed > 0)
}

pub (crate) fn store_derived_key(conn: &Connection, hash: PubkeyHash, path: KeyPath) -> anyhow::Result<()> {
	let query =
		"INSERT INTO mwallet_key (pubkey_hash, purpose, idx)
		VALUES (:pubkey_hash, :purpose, :idx)";
	let mut statement = conn.prepare(query)?;
	statement.execute(named_params! {
		":pubkey_hash": hash.to_string(),
		":purpose": path.purpose.as_index(),
		":idx": path.index,
	})?;
	Ok(())
}

pub (crate) fn store_imported_key(conn: &Connection, hash: PubkeyHash, key: &SecretKey) -> anyhow::Result<()> {
	let query =
		"INSERT INTO mwallet_key (pubkey_hash, secret_key) VALUES (:pubkey_hash, :secret_key)
		ON CONFLICT (pubkey_hash) DO UPDATE SET secret_key = :secret_key";
	let mut statement = conn.prepare(query)?;
	statement.execute(named_params! {
		":pubkey_hash": hash.to_string(),
		":secret_key": key.display_secret().to_string(),
	})?;
	Ok(())
}

pub (crate) fn mark_key_used(conn: &Connection, hash: PubkeyHash) -> anyhow::Result<()> {
	let mut statement = conn.prepare("UPDATE mwallet_key SET used = 1 WHERE pubkey_hash = :pubkey_hash")?;
	let changed = statement.execute(named_params! { ":pubkey_hash": hash.to_string() })?;
	if changed == 0 {
		bail!("unknown key {}", hash);
	}
	Ok(())
}

pub (crate) fn fetch_last_key_index(
	conn: &Connection,
	purpose: KeyPurpose,
) -> anyhow::Result<Option<(u32, bool)>> {
	let query =
		"SELECT idx, used FROM mwallet_key WHERE purpose = :purpose
		ORDER BY idx DESC LIMIT 1";
	let mut statement = conn.prepare(query)?;
	Ok(statement.query_row(
		named_params! { ":purpose": purpose.as_index() },
		|row| Ok((row.get::<_, u32>(0)?, row.get::<_, bool>(1)?)),
	).optional()?)
}

pub (crate) fn fetch_path_for_key(conn: &Connection, hash: PubkeyHash) -> anyhow::Result<Option<KeyPath>> {
	let mut statement = conn.prepare("SELECT purpose, idx FROM mwallet_key WHERE pubkey_hash = :pubkey_hash")?;
	let mut rows = statement.query(named_params! { ":pubkey_hash": hash.to_string() })?;
	match rows.next()? {
		Some(row) => row_to_path(row),
		None => Ok(None),
	}
}

pub (crate) fn fetch_imported_key(conn: &Connection, hash: PubkeyHash) -> anyhow::Result<Option<SecretKey>> {
	let query =
		"SELECT secret_key FROM mwallet_key
		WHERE pubkey_hash = :pubkey_hash AND secret_key IS NOT NULL";
	let mut statement = conn.prepare(query)?;
	let secret = statement.query_row(
		named_params! { ":pubkey_hash": hash.to_string() },
		|row| row.get::<_, String>(0),
	).optional()?;
	match secret {
		Some(s) => Ok(Some(SecretKey::from_str(&s).context("invalid stored secret key")?)),
		None => Ok(None),
	}
}

pub (crate) fn fetch_imported_keys(conn: &Connection) -> anyhow::Result<Vec<SecretKey>> {
	let mut statement = conn.prepare("SELECT secret_key FROM mwallet_key WHERE secret_key IS NOT NULL")?;
	let mut rows = statement.query([])?;

	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		let secret: String = row.get(0)?;
		ret.push(SecretKey::from_str(&secret).context("invalid stored secret key")?);
	}
	Ok(ret)
}

/// All derived keys of the purpose as `(index, used)`, ascending by index.
pub (crate) fn fetch_derived_keys(
	conn: &Connection,
	purpose: KeyPurpose,
) -> anyhow::Result<Vec<(u32, bool)>> {
	let query = "SELECT idx, used FROM mwallet_key WHERE purpose = :purpose ORDER BY idx";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query(named_params! { ":purpose": purpose.as_index() })?;

	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push((row.get(0)?, row.get(1)?));
	}
	Ok(ret)
}

pub (crate) fn store_watched_script(conn: &Connection, script: &ScriptBuf) -> anyhow::Result<()> {
	let query = "INSERT INTO mwallet_watched_script (script) VALUES (:script) ON CONFLICT DO NOTHING";
	let mut statement = conn.prepare(query)?;
	statement.execute(named_params! { ":script": script.as_bytes() })?;
	Ok(())
}

pub (crate) fn fetch_watched_scripts(conn: &Connection) -> anyhow::Result<Vec<ScriptBuf>> {
	let mut statement = conn.prepare("SELECT script FROM mwallet_watched_script ORDER BY script")?;
	let mut rows = statement.query([])?;

	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(ScriptBuf::from_bytes(row.get(0)?));
	}
	Ok(ret)
}

pub (crate) fn delete_watched_script(conn: &Connection, script: &ScriptBuf) -> anyhow::Result<()> {
	let mut statement = conn.prepare("DELETE FROM mwallet_watched_script WHERE script = :script")?;
	statement.execute(named_params! { ":script": script.as_bytes() })?;
	Ok(())
}

pub (crate) fn fetch_cache(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
	let mut statement = conn.prepare("SELECT value FROM mwallet_cache WHERE key = :key")?;
	Ok(statement.query_row(named_params! { ":key": key }, |row| row.get(0)).optional()?)
}

pub (crate) fn store_cache(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
	let query =
		"INSERT INTO mwallet_cache (key, value) VALUES (:key, :value)
		ON CONFLICT (key) DO UPDATE SET value = :value";
	let mut statement = conn.prepare(query)?;
	statement.execute(named_params! { ":key": key, ":value": value })?;
	Ok(())
}
