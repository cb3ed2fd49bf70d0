use anyhow::Context;

use rusqlite::Transaction;

use super::Migration;

pub struct InitialTables;

impl Migration for InitialTables {
	fn description(&self) -> &'static str {
		"create the utxo, transaction, key, watched script and cache tables"
	}

	fn apply(&self, tx: &Transaction) -> anyhow::Result<()> {
		let queries = [
			"CREATE TABLE IF NOT EXISTS mwallet_utxo (
				outpoint TEXT PRIMARY KEY,
				value_sat INTEGER NOT NULL,
				script_pubkey BLOB NOT NULL,
				height INTEGER NOT NULL,
				watch_only INTEGER NOT NULL
			);",
			"CREATE TABLE IF NOT EXISTS mwallet_txn (
				txid TEXT PRIMARY KEY,
				raw_tx BLOB NOT NULL,
				net_value_sat INTEGER NOT NULL,
				height INTEGER NOT NULL,
				timestamp INTEGER NOT NULL,
				watch_only INTEGER NOT NULL
			);",
			"CREATE TABLE IF NOT EXISTS mwallet_key (
				pubkey_hash TEXT PRIMARY KEY,
				-- purpose and idx are NULL for imported keys
				purpose INTEGER,
				idx INTEGER,
				secret_key TEXT,
				used INTEGER NOT NULL DEFAULT 0,
				UNIQUE (purpose, idx)
			);",
			"CREATE TABLE IF NOT EXISTS mwallet_watched_script (
				script BLOB PRIMARY KEY
			);",
			"CREATE TABLE IF NOT EXISTS mwallet_cache (
				key TEXT PRIMARY KEY,
				value TEXT NOT NULL
			);",
		];

		for query in queries {
			tx.execute(query, ()).with_context(|| format!("failed to execute: {}", query))?;
		}

		Ok(())
	}
}
