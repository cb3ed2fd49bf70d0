use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitcoin::{absolute, transaction, Amount, OutPoint, PubkeyHash, ScriptBuf, SignedAmount};
use bitcoin::{Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use chrono::{DateTime, Utc};

use mwallet::{Datastore, KeyPurpose, MemoryDatastore, SqliteClient};
use mwallet::persist::{KeyPath, StoredTxn, StoredUtxo};


fn temp_db() -> (SqliteClient, PathBuf) {
	static COUNTER: AtomicUsize = AtomicUsize::new(0);
	let path = std::env::temp_dir().join(format!(
		"mwallet-persister-test-{}-{}.sqlite",
		std::process::id(),
		COUNTER.fetch_add(1, Ordering::SeqCst),
	));
	let _ = std::fs::remove_file(&path);
	(SqliteClient::open(&path).expect("open sqlite db"), path)
}

fn time(secs: i64) -> DateTime<Utc> {
	DateTime::from_timestamp(secs, 0).unwrap()
}

fn script(n: u8) -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([n; 20]))
}

fn utxo(n: u8, height: u32, watch_only: bool) -> StoredUtxo {
	StoredUtxo {
		outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), n as u32),
		value: Amount::from_sat(1_000 * n as u64),
		script_pubkey: script(n),
		height,
		watch_only,
	}
}

fn txn(n: u8, net: i64, height: u32, watch_only: bool) -> StoredTxn {
	let tx = Transaction {
		version: transaction::Version::TWO,
		lock_time: absolute::LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ZERO,
			witness: Witness::new(),
		}],
		output: vec![TxOut { value: Amount::from_sat(5_000), script_pubkey: script(n) }],
	};
	StoredTxn {
		txid: tx.compute_txid(),
		net_value: SignedAmount::from_sat(net),
		height,
		timestamp: time(1_700_000_000 + n as i64),
		watch_only,
		tx,
	}
}

fn hash(n: u8) -> PubkeyHash {
	PubkeyHash::from_byte_array([n; 20])
}

fn sorted_utxos(db: &dyn Datastore) -> Vec<StoredUtxo> {
	let mut ret = db.get_utxos().unwrap();
	ret.sort_by_key(|u| u.outpoint);
	ret
}

fn sorted_txns(db: &dyn Datastore, include_watch_only: bool) -> Vec<StoredTxn> {
	let mut ret = db.get_txns(include_watch_only).unwrap();
	ret.sort_by_key(|t| t.txid);
	ret
}

fn check_utxos(db: &dyn Datastore) {
	assert!(db.get_utxos().unwrap().is_empty());

	let a = utxo(1, 0, false);
	let b = utxo(2, 10, true);
	db.put_utxo(&a).unwrap();
	db.put_utxo(&b).unwrap();
	assert_eq!(sorted_utxos(db), vec![a.clone(), b.clone()]);

	// upsert by outpoint
	let a_confirmed = StoredUtxo { height: 12, ..a.clone() };
	db.put_utxo(&a_confirmed).unwrap();
	assert_eq!(sorted_utxos(db), vec![a_confirmed.clone(), b.clone()]);

	db.set_utxo_watch_only(b.outpoint, false).unwrap();
	assert!(!sorted_utxos(db)[1].watch_only);
	assert!(db.set_utxo_watch_only(utxo(3, 0, false).outpoint, true).is_err());

	assert!(db.delete_utxo(a.outpoint).unwrap());
	assert!(!db.delete_utxo(a.outpoint).unwrap());
	assert_eq!(db.get_utxos().unwrap().len(), 1);
}

fn check_txns(db: &dyn Datastore) {
	let a = txn(1, 5_000, 0, false);
	let b = txn(2, -3_000, 7, false);
	let w = txn(3, 5_000, 8, true);
	for t in [&a, &b, &w] {
		db.put_txn(t).unwrap();
	}

	assert_eq!(db.get_txn(a.txid).unwrap(), Some(a.clone()));
	assert_eq!(db.get_txn(Txid::all_zeros()).unwrap(), None);

	let mut expected = vec![a.clone(), b.clone()];
	expected.sort_by_key(|t| t.txid);
	assert_eq!(sorted_txns(db, false), expected);
	assert_eq!(sorted_txns(db, true).len(), 3);

	db.update_txn_height(a.txid, 9, time(1_700_001_000)).unwrap();
	let updated = db.get_txn(a.txid).unwrap().unwrap();
	assert_eq!(updated.height, 9);
	assert_eq!(updated.timestamp, time(1_700_001_000));
	assert_eq!(updated.tx, a.tx);
	assert!(db.update_txn_height(Txid::all_zeros(), 1, time(0)).is_err());

	assert!(db.delete_txn(b.txid).unwrap());
	assert!(!db.delete_txn(b.txid).unwrap());
	assert_eq!(sorted_txns(db, true).len(), 2);
}

fn check_keys(db: &dyn Datastore) {
	assert_eq!(db.get_last_key_index(KeyPurpose::External).unwrap(), None);
	for i in 0..4 {
		db.put_key(hash(i + 1), KeyPath { purpose: KeyPurpose::External, index: i as u32 }).unwrap();
	}
	db.put_key(hash(20), KeyPath { purpose: KeyPurpose::Internal, index: 0 }).unwrap();
	assert!(db.put_key(hash(21), KeyPath { purpose: KeyPurpose::Internal, index: 0 }).is_err());

	assert_eq!(db.get_last_key_index(KeyPurpose::External).unwrap(), Some((3, false)));
	assert_eq!(
		db.get_path_for_key(hash(2)).unwrap(),
		Some(KeyPath { purpose: KeyPurpose::External, index: 1 }),
	);
	assert_eq!(db.get_path_for_key(hash(99)).unwrap(), None);

	db.mark_key_used(hash(2)).unwrap();
	assert!(db.mark_key_used(hash(99)).is_err());
	assert_eq!(db.get_unused_keys(KeyPurpose::External).unwrap(), vec![0, 2, 3]);
	let windows = db.get_lookahead_windows().unwrap();
	assert_eq!(windows[&KeyPurpose::External], 2);
	assert_eq!(windows[&KeyPurpose::Internal], 1);

	let mut paths = db.get_key_paths().unwrap();
	paths.sort();
	assert_eq!(paths.len(), 5);
	assert_eq!(paths[0], KeyPath { purpose: KeyPurpose::External, index: 0 });

	let imported = SecretKey::from_slice(&[9; 32]).unwrap();
	db.import_key(hash(30), &imported).unwrap();
	assert_eq!(db.get_imported_key(hash(30)).unwrap(), Some(imported));
	assert_eq!(db.get_imported_key(hash(1)).unwrap(), None);
	assert_eq!(db.get_imported_keys().unwrap(), vec![imported]);
	assert_eq!(db.get_path_for_key(hash(30)).unwrap(), None);
	db.mark_key_used(hash(30)).unwrap();
	assert_eq!(db.get_key_paths().unwrap().len(), 5);
}

fn check_watched_scripts(db: &dyn Datastore) {
	db.put_watched_scripts(&[script(2), script(1)]).unwrap();
	db.put_watched_script(&script(3)).unwrap();
	// putting a script twice keeps one
	db.put_watched_script(&script(1)).unwrap();

	let mut scripts = db.get_watched_scripts().unwrap();
	scripts.sort();
	assert_eq!(scripts, vec![script(1), script(2), script(3)]);

	db.delete_watched_script(&script(2)).unwrap();
	assert_eq!(db.get_watched_scripts().unwrap().len(), 2);
}

fn check_cache(db: &dyn Datastore) {
	assert_eq!(db.get_cache("best-height-regtest").unwrap(), None);
	db.set_cache("best-height-regtest", "{\"height\":1}").unwrap();
	db.set_cache("best-height-regtest", "{\"height\":2}").unwrap();
	assert_eq!(db.get_cache("best-height-regtest").unwrap().as_deref(), Some("{\"height\":2}"));
}

fn check_all(db: &dyn Datastore) {
	check_utxos(db);
	check_txns(db);
	check_keys(db);
	check_watched_scripts(db);
	check_cache(db);
}

#[test]
fn memory_datastore() {
	check_all(&MemoryDatastore::new());
}

#[test]
fn sqlite_datastore() {
	let (db, path) = temp_db();
	check_all(&db);
	let _ = std::fs::remove_file(path);
}

#[test]
fn sqlite_persists_across_reopen() {
	let (db, path) = temp_db();
	let u = utxo(4, 3, false);
	let t = txn(4, 4_000, 3, false);
	db.put_utxo(&u).unwrap();
	db.put_txn(&t).unwrap();
	db.set_cache("key", "value").unwrap();
	drop(db);

	let db = SqliteClient::open(&path).unwrap();
	assert_eq!(db.get_utxos().unwrap(), vec![u]);
	assert_eq!(db.get_txn(t.txid).unwrap(), Some(t));
	assert_eq!(db.get_cache("key").unwrap().as_deref(), Some("value"));
	let _ = std::fs::remove_file(path);
}
