//! End-to-end tests of the wallet against a scripted chain.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::{consensus, Amount, FeeRate, Network, OutPoint, ScriptBuf, SignedAmount, Txid};
use bitcoin::bip32::Xpriv;
use bitcoin::hashes::Hash;
use chrono::Utc;

use escrow::{Error, TransactionInput, TransactionOutput};
use escrow::script::lock_time_from_redeem_script;
use escrow::test::{keypair, sorted_keypairs};

use crate::*;
use crate::test_util::MockChainSource;


struct Setup {
	wallet: Wallet,
	source: Arc<MockChainSource>,
	db: Arc<MemoryDatastore>,
}

impl Setup {
	fn new() -> Setup {
		let mut cfg = Config::network_default(Network::Regtest);
		cfg.key_lookahead = 5;
		let db = Arc::new(MemoryDatastore::new());
		let source = Arc::new(MockChainSource::new());
		let account = Xpriv::new_master(Network::Regtest, &[1; 32]).unwrap();
		let wallet = Wallet::new(cfg, account, db.clone(), source.clone()).unwrap();
		Setup { wallet, source, db }
	}

	fn script(&self, address: &str) -> ScriptBuf {
		self.wallet.chain.decode_address(address).unwrap()
	}

	/// An address outside the wallet.
	fn foreign_address(&self, seed: u8) -> String {
		let script = self.wallet.chain.key_script(&keypair(seed).public_key());
		self.wallet.chain.encode_address(&script).unwrap()
	}

	/// Pay to the wallet from outside and sync.
	async fn receive(&self, sat: u64, mine: bool) -> Txid {
		let address = self.wallet.current_address(KeyPurpose::External).unwrap();
		let funding = self.source.fund(&self.script(&address), Amount::from_sat(sat));
		if mine {
			self.source.mine_block();
		}
		self.wallet.sync().await.unwrap();
		funding.txid()
	}
}

fn escrow_error(err: &anyhow::Error) -> Option<&Error> {
	err.downcast_ref::<Error>()
}

#[tokio::test]
async fn dust_is_rejected_before_any_network_call() {
	let s = Setup::new();
	let address = s.foreign_address(1);
	let err = s.wallet.spend(Amount::from_sat(1), &address, FeeLevel::Normal, None, false)
		.await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::DustAmount { .. })), "{:#}", err);
	assert_eq!(s.source.calls(), 0);
}

#[tokio::test]
async fn overspending_leaves_the_datastore_untouched() {
	let s = Setup::new();
	s.receive(10_000, true).await;
	assert_eq!(s.wallet.balance().unwrap().confirmed, Amount::from_sat(10_000));

	let utxos = s.db.get_utxos().unwrap();
	let txns = s.db.get_txns(true).unwrap();
	let keys = s.db.get_key_paths().unwrap();

	let address = s.foreign_address(1);
	let err = s.wallet.spend(Amount::from_sat(10_001), &address, FeeLevel::Normal, None, false)
		.await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::InsufficientFunds { .. })), "{:#}", err);

	assert_eq!(s.db.get_utxos().unwrap(), utxos);
	assert_eq!(s.db.get_txns(true).unwrap(), txns);
	assert_eq!(s.db.get_key_paths().unwrap(), keys);
	assert!(s.source.broadcasts().is_empty());
}

#[tokio::test]
async fn invalid_address_is_rejected() {
	let s = Setup::new();
	let err = s.wallet.spend(Amount::from_sat(10_000), "not an address", FeeLevel::Normal, None, false)
		.await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::InvalidAddress { .. })), "{:#}", err);
}

#[tokio::test]
async fn spend_broadcasts_and_ingests() {
	let s = Setup::new();
	s.receive(100_000, true).await;

	let address = s.foreign_address(1);
	let txid = s.wallet.spend(Amount::from_sat(30_000), &address, FeeLevel::Normal, Some("order-1"), false)
		.await.unwrap();

	let broadcast = s.source.broadcasts();
	assert_eq!(broadcast.len(), 1);
	assert_eq!(broadcast[0].compute_txid(), txid);
	assert!(broadcast[0].output.iter().any(|o| o.script_pubkey == s.script(&address)));

	let tx = s.wallet.get_transaction(txid).unwrap();
	assert_eq!(tx.status, TxStatus::Unconfirmed);
	assert!(tx.value < SignedAmount::from_sat(-30_000));

	// the change of our own payment counts as confirmed
	let change = SignedAmount::from_sat(100_000) + tx.value;
	let balance = s.wallet.balance().unwrap();
	assert_eq!(balance.confirmed.to_sat() as i64, change.to_sat());
	assert_eq!(balance.unconfirmed, Amount::ZERO);
	assert_eq!(s.db.get_utxos().unwrap().len(), 1);
}

#[tokio::test]
async fn spend_all_empties_the_wallet() {
	let s = Setup::new();
	s.receive(40_000, true).await;
	s.receive(60_000, true).await;

	let address = s.foreign_address(2);
	s.wallet.spend(Amount::ZERO, &address, FeeLevel::Economic, None, true).await.unwrap();
	let tx = s.source.broadcasts().pop().unwrap();
	assert_eq!(tx.input.len(), 2);
	assert_eq!(tx.output.len(), 1);
	assert!(s.db.get_utxos().unwrap().is_empty());
	assert_eq!(s.wallet.balance().unwrap(), Balance::default());
}

#[tokio::test]
async fn spend_fee_estimate_uses_the_fee_level() {
	let s = Setup::new();
	s.receive(100_000, true).await;
	s.source.set_fee_estimate(1, FeeRate::from_sat_per_vb_u32(20));
	s.source.set_fee_estimate(6, FeeRate::from_sat_per_vb_u32(2));

	let priority = s.wallet.estimate_spend_fee(Amount::from_sat(10_000), FeeLevel::Priority).await.unwrap();
	let economic = s.wallet.estimate_spend_fee(Amount::from_sat(10_000), FeeLevel::Economic).await.unwrap();
	assert!(priority <= economic * 10 && priority > economic * 9);
}

#[tokio::test]
async fn bump_fee_spends_the_stuck_outputs() {
	let s = Setup::new();
	let funding = s.receive(100_000, false).await;

	let child = s.wallet.bump_fee(funding).await.unwrap();
	let tx = s.source.broadcasts().pop().unwrap();
	assert_eq!(tx.compute_txid(), child);
	assert_eq!(tx.input[0].previous_output, OutPoint::new(funding, 0));
	assert!(s.wallet.has_key(&s.wallet.chain.encode_address(&tx.output[0].script_pubkey).unwrap()).unwrap());

	let err = s.wallet.bump_fee(Txid::all_zeros()).await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::NotFound(_))), "{:#}", err);

	// the funding output is spent now
	let err = s.wallet.bump_fee(funding).await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::NotFound(_))), "{:#}", err);

	s.source.mine_block();
	s.wallet.sync().await.unwrap();
	let err = s.wallet.bump_fee(child).await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::AlreadyConfirmed(t)) if *t == child), "{:#}", err);
}

#[tokio::test]
async fn transaction_status_follows_confirmations() {
	let s = Setup::new();
	let txid = s.receive(10_000, false).await;
	assert_eq!(s.wallet.get_transaction(txid).unwrap().status, TxStatus::Unconfirmed);
	assert_eq!(s.wallet.get_confirmations(txid).unwrap(), (0, 0));

	s.source.mine_block();
	s.wallet.sync().await.unwrap();
	assert_eq!(s.wallet.get_transaction(txid).unwrap().status, TxStatus::Pending);
	assert_eq!(s.wallet.get_confirmations(txid).unwrap(), (1, 1));

	for _ in 0..5 {
		s.source.mine_block();
	}
	s.wallet.sync().await.unwrap();
	assert_eq!(s.wallet.get_transaction(txid).unwrap().status, TxStatus::Confirmed);
	assert_eq!(s.wallet.get_confirmations(txid).unwrap(), (6, 1));
	assert_eq!(s.wallet.transactions().unwrap().len(), 1);

	let err = s.wallet.get_confirmations(Txid::all_zeros()).unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::NotFound(_))));
}

#[tokio::test]
async fn old_unconfirmed_transactions_are_dead() {
	let s = Setup::new();
	let txid = s.receive(10_000, false).await;
	let mut txn = s.db.get_txn(txid).unwrap().unwrap();
	txn.timestamp = Utc::now() - chrono::Duration::hours(7);
	s.db.put_txn(&txn).unwrap();
	assert_eq!(s.wallet.get_transaction(txid).unwrap().status, TxStatus::Dead);
}

#[tokio::test]
async fn addresses_and_keys() {
	let s = Setup::new();
	let current = s.wallet.current_address(KeyPurpose::External).unwrap();
	assert_eq!(s.wallet.current_address(KeyPurpose::External).unwrap(), current);
	assert!(current.starts_with("bcrt1q"));
	assert!(s.wallet.has_key(&current).unwrap());

	let fresh = s.wallet.new_address(KeyPurpose::External).unwrap();
	assert_ne!(fresh, current);
	assert!(s.wallet.has_key(&fresh).unwrap());

	// receiving moves the current address
	s.receive(10_000, false).await;
	assert_ne!(s.wallet.current_address(KeyPurpose::External).unwrap(), current);

	let imported = keypair(42);
	let address = s.foreign_address(42);
	assert!(!s.wallet.has_key(&address).unwrap());
	s.wallet.import_key(imported.secret_key()).unwrap();
	assert!(s.wallet.has_key(&address).unwrap());
}

#[tokio::test]
async fn watched_addresses_are_followed_but_not_spendable() {
	let s = Setup::new();
	let address = s.foreign_address(3);
	s.wallet.add_watched_addresses(&[address.clone()]).await.unwrap();
	assert!(s.source.listened_scripts().contains(&s.script(&address)));

	s.source.fund(&s.script(&address), Amount::from_sat(25_000));
	s.source.mine_block();
	s.wallet.sync().await.unwrap();

	assert!(s.wallet.transactions().unwrap().is_empty());
	assert_eq!(s.db.get_txns(true).unwrap().len(), 1);
	assert_eq!(s.wallet.balance().unwrap(), Balance::default());
}

#[tokio::test]
async fn own_addresses_are_not_watched() {
	let s = Setup::new();
	let own = s.wallet.current_address(KeyPurpose::External).unwrap();
	let foreign = s.foreign_address(4);
	s.wallet.add_watched_addresses(&[own.clone(), foreign.clone()]).await.unwrap();
	assert_eq!(s.db.get_watched_scripts().unwrap(), vec![s.script(&foreign)]);

	s.source.fund(&s.script(&own), Amount::from_sat(30_000));
	s.source.mine_block();
	s.wallet.sync().await.unwrap();
	let txs = s.wallet.transactions().unwrap();
	assert_eq!(txs.len(), 1);
	assert!(!txs[0].watch_only);
	assert_eq!(s.wallet.balance().unwrap().confirmed, Amount::from_sat(30_000));
}

#[tokio::test]
async fn fee_estimate_for_plain_inputs() {
	let s = Setup::new();
	let inputs = vec![TransactionInput {
		outpoint: OutPoint::new(Txid::all_zeros(), 0),
		linked_address: None,
		value: Amount::from_sat(10_000),
	}];
	let outputs = vec![TransactionOutput { address: s.foreign_address(1), value: Amount::from_sat(5_000) }];
	let one = s.wallet.estimate_fee(&inputs, &outputs, FeeRate::from_sat_per_vb_u32(1)).unwrap();
	let ten = s.wallet.estimate_fee(&inputs, &outputs, FeeRate::from_sat_per_vb_u32(10)).unwrap();
	assert!(one > Amount::ZERO);
	assert!(ten >= one * 9 && ten <= one * 10);
}

#[tokio::test]
async fn escrow_release_round_trip() {
	let s = Setup::new();
	let keys = sorted_keypairs(3);
	let pubkeys = keys.iter().map(|k| k.public_key()).collect::<Vec<_>>();
	let escrow = s.wallet.generate_multisig_script(&pubkeys, 2, Duration::ZERO, None).unwrap();
	assert_eq!(s.wallet.generate_multisig_script(&pubkeys, 2, Duration::ZERO, None).unwrap(), escrow);

	let funding = s.source.fund(&escrow.script_pubkey, Amount::from_sat(50_000));
	let inputs = vec![TransactionInput {
		outpoint: OutPoint::new(funding.txid(), 0),
		linked_address: Some(escrow.address.clone()),
		value: Amount::from_sat(50_000),
	}];
	let outputs = vec![
		TransactionOutput { address: s.foreign_address(10), value: Amount::from_sat(30_000) },
		TransactionOutput { address: s.foreign_address(11), value: Amount::from_sat(20_000) },
	];
	let fee_rate = FeeRate::from_sat_per_vb_u32(2);

	let sigs_a = s.wallet.create_multisig_signature(&inputs, &outputs, &keys[0], &escrow.redeem_script, fee_rate)
		.unwrap();
	let sigs_b = s.wallet.create_multisig_signature(&inputs, &outputs, &keys[2], &escrow.redeem_script, fee_rate)
		.unwrap();
	assert_eq!(sigs_a.len(), 1);

	// a party signing at another fee rate signs another transaction
	let other = s.wallet.create_multisig_signature(
		&inputs, &outputs, &keys[1], &escrow.redeem_script, FeeRate::from_sat_per_vb_u32(3),
	).unwrap();
	let err = s.wallet.multisign(&inputs, &outputs, &sigs_a, &other, &escrow.redeem_script, fee_rate, true)
		.await.unwrap_err();
	assert!(matches!(escrow_error(&err), Some(Error::SigningFailure(_))), "{:#}", err);
	assert!(s.source.broadcasts().is_empty());

	let raw = s.wallet.multisign(&inputs, &outputs, &sigs_a, &sigs_b, &escrow.redeem_script, fee_rate, true)
		.await.unwrap();
	let tx = consensus::deserialize::<bitcoin::Transaction>(&raw).unwrap();
	assert_eq!(s.source.broadcasts(), vec![tx.clone()]);
	assert_eq!(tx.input[0].previous_output, inputs[0].outpoint);
	assert!(tx.output.iter().all(|o| o.value < Amount::from_sat(30_000)));
	// the release doesn't touch the wallet
	assert!(s.db.get_txns(true).unwrap().is_empty());
}

#[tokio::test]
async fn sweep_timelocked_escrow_into_the_wallet() {
	let s = Setup::new();
	let keys = sorted_keypairs(2);
	let pubkeys = keys.iter().map(|k| k.public_key()).collect::<Vec<_>>();
	let timeout_key = keypair(7);
	let escrow = s.wallet.generate_multisig_script(
		&pubkeys, 2, Duration::from_secs(3600), Some(timeout_key.public_key()),
	).unwrap();

	let funding = s.source.fund(&escrow.script_pubkey, Amount::from_sat(50_000));
	let inputs = vec![TransactionInput {
		outpoint: OutPoint::new(funding.txid(), 0),
		linked_address: Some(escrow.address.clone()),
		value: Amount::from_sat(50_000),
	}];

	let txid = s.wallet.sweep_address(
		&inputs, None, &timeout_key, Some(&escrow.redeem_script), FeeLevel::Normal,
	).await.unwrap();

	let tx = s.source.broadcasts().pop().unwrap();
	assert_eq!(tx.compute_txid(), txid);
	assert_eq!(tx.version, bitcoin::transaction::Version::TWO);
	assert_eq!(Some(tx.input[0].sequence), lock_time_from_redeem_script(&escrow.redeem_script));

	let txn = s.wallet.get_transaction(txid).unwrap();
	assert!(txn.value > SignedAmount::ZERO);
	assert!(!txn.watch_only);
	assert_eq!(s.wallet.balance().unwrap().unconfirmed.to_sat() as i64, txn.value.to_sat());
}

#[tokio::test]
async fn sweep_plain_key_to_given_address() {
	let s = Setup::new();
	let key = keypair(5);
	let script = s.wallet.chain.key_script(&key.public_key());
	let funding = s.source.fund(&script, Amount::from_sat(20_000));
	let inputs = vec![TransactionInput {
		outpoint: OutPoint::new(funding.txid(), 0),
		linked_address: s.wallet.chain.encode_address(&script),
		value: Amount::from_sat(20_000),
	}];

	let address = s.foreign_address(6);
	s.wallet.sweep_address(&inputs, Some(&address), &key, None, FeeLevel::Economic).await.unwrap();
	let tx = s.source.broadcasts().pop().unwrap();
	assert_eq!(tx.output.len(), 1);
	assert_eq!(tx.output[0].script_pubkey, s.script(&address));
}

#[tokio::test]
async fn background_sync_reports_payments() {
	let s = Setup::new();
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	s.wallet.add_transaction_listener(Arc::new(move |cb: &TransactionCallback| {
		let _ = tx.send(cb.clone());
	}));
	s.wallet.start();

	let address = s.wallet.current_address(KeyPurpose::External).unwrap();
	let funding = s.source.fund(&s.script(&address), Amount::from_sat(15_000));
	s.source.notify_transaction(funding.txid());

	let cb = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
	assert_eq!(cb.txid, funding.txid());
	assert_eq!(cb.value, SignedAmount::from_sat(15_000));
	assert_eq!(cb.height, 0);

	s.wallet.stop().await;
}

#[tokio::test]
async fn reorg_is_logged() {
	use std::sync::Mutex;

	use wallet_log::{parse_record, RecordSerializeWrapper, ReorgDetected, SLOG_TARGET};

	struct Capture(Arc<Mutex<Vec<String>>>);

	impl log::Log for Capture {
		fn enabled(&self, _: &log::Metadata) -> bool { true }
		fn log(&self, record: &log::Record) {
			if record.target() == SLOG_TARGET {
				let json = serde_json::to_string(&RecordSerializeWrapper(record)).unwrap();
				self.0.lock().unwrap().push(json);
			}
		}
		fn flush(&self) {}
	}

	let records = Arc::new(Mutex::new(Vec::new()));
	fern::Dispatch::new()
		.level(log::LevelFilter::Trace)
		.chain(Box::new(Capture(records.clone())) as Box<dyn log::Log>)
		.apply().unwrap();

	let s = Setup::new();
	s.receive(10_000, true).await;
	let block = s.source.reorg(1);
	s.wallet.service.process_incoming_block(block).await.unwrap();

	let records = records.lock().unwrap();
	let reorg = records.iter()
		.filter_map(|r| parse_record(r).ok()?.try_as::<ReorgDetected>().ok())
		.find(|m| m.new_hash == block.hash)
		.expect("reorg logged");
	assert_eq!(reorg.coin, "regtest");
	assert_eq!(reorg.new_height, block.height);
	assert!(s.db.get_utxos().unwrap().is_empty());
}
