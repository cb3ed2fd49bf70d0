
pub extern crate escrow;

#[macro_use] extern crate anyhow;
#[macro_use] extern crate log;
#[macro_use] extern crate serde;
#[macro_use] extern crate wallet_log;

pub mod builder;
pub mod chain;
pub mod config;
pub mod fees;
pub mod keys;
pub mod persist;
pub mod serde_util;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

#[cfg(test)]
mod test;

pub use crate::config::Config;
pub use crate::fees::FeeLevel;
pub use crate::persist::{Datastore, KeyPurpose};
pub use crate::persist::memory::MemoryDatastore;
pub use crate::persist::sqlite::SqliteClient;
pub use crate::service::{ChainTip, TransactionCallback, TransactionListener};


use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{consensus, Amount, FeeRate, Script, SignedAmount, Transaction, Txid};
use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{Keypair, PublicKey, SecretKey};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use bitcoin_ext::{BlockHeight, SETTLED_CONFIRMATIONS};
use escrow::{Chain, EscrowScript, EscrowSpend, Signature, TransactionInput, TransactionOutput};
use escrow::multisig;
use escrow::select::Coin;

use crate::builder::{confirmations, TransactionBuilder};
use crate::chain::{ChainDataSource, ChainTransaction};
use crate::fees::FeeEstimator;
use crate::keys::KeyManager;
use crate::service::WalletService;


/// The wallet's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub confirmed: Amount,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub unconfirmed: Amount,
}

impl Default for Balance {
	fn default() -> Balance {
		Balance { confirmed: Amount::ZERO, unconfirmed: Amount::ZERO }
	}
}

/// The confirmation status of a wallet transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
	/// In the mempool.
	Unconfirmed,
	/// Unconfirmed for longer than the configured dead age.
	Dead,
	/// Confirmed, but not deep enough to be considered final.
	Pending,
	Confirmed,
}

impl TxStatus {
	fn new(confirmations: u32, timestamp: DateTime<Utc>, dead_age: Duration) -> TxStatus {
		if confirmations >= SETTLED_CONFIRMATIONS {
			TxStatus::Confirmed
		} else if confirmations > 0 {
			TxStatus::Pending
		} else {
			match chrono::Duration::from_std(dead_age) {
				Ok(age) if Utc::now().signed_duration_since(timestamp) > age => TxStatus::Dead,
				_ => TxStatus::Unconfirmed,
			}
		}
	}
}

/// A transaction touching the wallet, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
	pub txid: Txid,
	pub value: SignedAmount,
	/// 0 while unconfirmed.
	pub height: BlockHeight,
	pub confirmations: u32,
	pub status: TxStatus,
	pub timestamp: DateTime<Utc>,
	pub watch_only: bool,
	pub tx: Transaction,
}

/// Wrap a failed chain source call.
fn network_error(e: anyhow::Error) -> anyhow::Error {
	escrow::Error::Network(format!("{:#}", e)).into()
}

pub struct Wallet {
	config: Config,
	db: Arc<dyn Datastore>,
	chain: Arc<dyn Chain>,
	source: Arc<dyn ChainDataSource>,
	keys: Arc<KeyManager>,
	fees: FeeEstimator,
	builder: TransactionBuilder,
	service: Arc<WalletService>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl Wallet {
	/// Create a wallet for the configured chain.
	///
	/// `account` is the account-level extended key all wallet keys are
	/// derived from.
	pub fn new(
		config: Config,
		account: Xpriv,
		db: Arc<dyn Datastore>,
		source: Arc<dyn ChainDataSource>,
	) -> anyhow::Result<Wallet> {
		let chain = Arc::new(config.chain());
		Wallet::with_chain(config, chain, account, db, source)
	}

	/// Create a wallet with custom chain capabilities.
	pub fn with_chain(
		config: Config,
		chain: Arc<dyn Chain>,
		account: Xpriv,
		db: Arc<dyn Datastore>,
		source: Arc<dyn ChainDataSource>,
	) -> anyhow::Result<Wallet> {
		config.validate().context("invalid wallet config")?;

		let keys = Arc::new(KeyManager::new(db.clone(), chain.clone(), account, config.key_lookahead)
			.context("failed to initialize wallet keys")?);
		let fees = FeeEstimator::new(source.clone(), config.fees.clone());
		let builder = TransactionBuilder::new(db.clone(), keys.clone(), chain.clone(), config.max_inputs);
		let service = Arc::new(WalletService::new(
			db.clone(), keys.clone(), chain.clone(), source.clone(), config.resync_interval,
		));

		Ok(Wallet {
			config, db, chain, source, keys, fees, builder, service,
			task: Mutex::new(None),
		})
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Start syncing in the background.
	///
	/// Does nothing if the wallet is already running.
	pub fn start(&self) {
		let mut task = self.task.lock();
		if task.is_none() {
			info!("Starting {} wallet", self.chain.coin());
			*task = Some(tokio::spawn(self.service.clone().run()));
		}
	}

	/// Stop the background sync and wait for it to finish.
	///
	/// A stopped wallet can't be started again.
	pub async fn stop(&self) {
		self.service.stop();
		let task = self.task.lock().take();
		if let Some(task) = task {
			if let Err(e) = task.await {
				error!("Wallet sync task failed: {}", e);
			}
		}
	}

	/// Run a full reconciliation with the chain source now.
	pub async fn sync(&self) -> anyhow::Result<()> {
		self.service.update_state().await
	}

	pub fn chain_tip(&self) -> ChainTip {
		self.service.chain_tip()
	}

	fn tip_height(&self) -> BlockHeight {
		self.service.chain_tip().height
	}

	/// The confirmed and unconfirmed balance of the spendable outputs.
	///
	/// Unconfirmed change of the wallet's own payments counts as confirmed.
	pub fn balance(&self) -> anyhow::Result<Balance> {
		let mut ret = Balance::default();
		for utxo in self.db.get_utxos()? {
			if utxo.watch_only {
				continue;
			}
			let confirmed = utxo.height > 0 || match self.db.get_txn(utxo.outpoint.txid)? {
				Some(txn) => txn.net_value.is_negative(),
				None => false,
			};
			if confirmed {
				ret.confirmed += utxo.value;
			} else {
				ret.unconfirmed += utxo.value;
			}
		}
		Ok(ret)
	}

	fn wallet_transaction(&self, txn: persist::StoredTxn) -> WalletTransaction {
		let confirmations = confirmations(self.tip_height(), txn.height);
		WalletTransaction {
			txid: txn.txid,
			value: txn.net_value,
			height: txn.height,
			confirmations,
			status: TxStatus::new(confirmations, txn.timestamp, self.config.dead_transaction_age),
			timestamp: txn.timestamp,
			watch_only: txn.watch_only,
			tx: txn.tx,
		}
	}

	/// All non-watch-only transactions of the wallet.
	pub fn transactions(&self) -> anyhow::Result<Vec<WalletTransaction>> {
		Ok(self.db.get_txns(false)?.into_iter().map(|t| self.wallet_transaction(t)).collect())
	}

	pub fn get_transaction(&self, txid: Txid) -> anyhow::Result<WalletTransaction> {
		let txn = self.db.get_txn(txid)?
			.ok_or_else(|| escrow::Error::NotFound(format!("transaction {}", txid)))?;
		Ok(self.wallet_transaction(txn))
	}

	/// The number of confirmations of the transaction and its height.
	pub fn get_confirmations(&self, txid: Txid) -> anyhow::Result<(u32, BlockHeight)> {
		let tx = self.get_transaction(txid)?;
		Ok((tx.confirmations, tx.height))
	}

	fn address_for(&self, key: &Keypair) -> anyhow::Result<String> {
		let script = self.chain.key_script(&key.public_key());
		self.chain.encode_address(&script).context("key script has no address")
	}

	/// The first address of the purpose that hasn't received anything yet.
	pub fn current_address(&self, purpose: KeyPurpose) -> anyhow::Result<String> {
		self.address_for(&self.keys.current_key(purpose)?)
	}

	/// An address that was never handed out before.
	pub fn new_address(&self, purpose: KeyPurpose) -> anyhow::Result<String> {
		self.address_for(&self.keys.fresh_key(purpose)?)
	}

	/// Whether the wallet holds the key for the address.
	pub fn has_key(&self, address: &str) -> anyhow::Result<bool> {
		let script = self.chain.decode_address(address)?;
		Ok(self.keys.key_for_script(&script)?.is_some())
	}

	pub fn import_key(&self, key: SecretKey) -> anyhow::Result<()> {
		self.keys.import_key(key)
	}

	pub async fn fee_rate(&self, level: FeeLevel) -> FeeRate {
		self.fees.fee_rate(level).await
	}

	/// The fee for spending the given plain key inputs to the outputs.
	pub fn estimate_fee(
		&self,
		inputs: &[TransactionInput],
		outputs: &[TransactionOutput],
		fee_rate: FeeRate,
	) -> anyhow::Result<Amount> {
		self.builder.estimate_fee(inputs.len(), outputs, fee_rate)
	}

	/// The fee a payment of `amount` would pay at the fee level.
	pub async fn estimate_spend_fee(&self, amount: Amount, level: FeeLevel) -> anyhow::Result<Amount> {
		let fee_rate = self.fees.fee_rate(level).await;
		self.builder.estimate_spend_fee(amount, fee_rate, self.tip_height())
	}

	/// Hand the transaction to the chain source and ingest it.
	pub async fn broadcast(&self, tx: Transaction) -> anyhow::Result<Txid> {
		let txid = self.source.broadcast(&tx).await.map_err(network_error)?;
		slog!(TransactionBroadcast, txid);
		let ctx = ChainTransaction {
			prevouts: vec![None; tx.input.len()],
			tx,
			confirmations: 0,
			block_time: None,
		};
		self.service.process_incoming_transaction(ctx).await
			.context("failed to ingest broadcast transaction")?;
		Ok(txid)
	}

	/// Pay `amount` to `address`.
	///
	/// With `spend_all` every spendable output goes to the address and
	/// `amount` is ignored.
	pub async fn spend(
		&self,
		amount: Amount,
		address: &str,
		level: FeeLevel,
		reference_id: Option<&str>,
		spend_all: bool,
	) -> anyhow::Result<Txid> {
		let destination = self.chain.decode_address(address)?;
		if !spend_all {
			self.builder.check_dust(amount, &destination)?;
		}

		let fee_rate = self.fees.fee_rate(level).await;
		let tip = self.tip_height();
		let funded = if spend_all {
			self.builder.build_spend_all(destination, fee_rate, tip)?
		} else {
			self.builder.build(amount, destination, fee_rate, tip)?
		};

		if let Some(id) = reference_id {
			info!("Payment {} to {} has reference {}", funded.tx.compute_txid(), address, id);
		}
		self.broadcast(funded.tx).await
	}

	/// Speed up an unconfirmed transaction by spending its outputs with a
	/// high fee child.
	pub async fn bump_fee(&self, txid: Txid) -> anyhow::Result<Txid> {
		let txn = self.db.get_txn(txid)?
			.ok_or_else(|| escrow::Error::NotFound(format!("transaction {}", txid)))?;
		if txn.height > 0 {
			return Err(escrow::Error::AlreadyConfirmed(txid))?;
		}

		let mut coins = Vec::new();
		for utxo in self.db.get_utxos()? {
			if utxo.outpoint.txid != txid || utxo.watch_only || utxo.height > 0 {
				continue;
			}
			if self.keys.key_for_script(&utxo.script_pubkey)?.is_none() {
				continue;
			}
			coins.push(Coin {
				outpoint: utxo.outpoint,
				txout: bitcoin::TxOut { value: utxo.value, script_pubkey: utxo.script_pubkey },
				confirmations: 0,
			});
		}
		if coins.is_empty() {
			return Err(escrow::Error::NotFound(format!("no spendable output of {}", txid)))?;
		}

		let fee_rate = self.fees.fee_rate(FeeLevel::FeeBump).await;
		let key = self.keys.current_key(KeyPurpose::Internal)?;
		let funded = self.builder.build_sweep(&coins, self.chain.key_script(&key.public_key()), fee_rate)?;
		let child_txid = self.broadcast(funded.tx).await?;
		slog!(FeeBumped, txid, child_txid, fee: funded.fee);
		Ok(child_txid)
	}

	/// Move outputs the wallet doesn't track to `address`, or to an internal
	/// address of the wallet.
	///
	/// With a redeem script the inputs are escrow outputs that `key` can
	/// release alone.
	pub async fn sweep_address(
		&self,
		inputs: &[TransactionInput],
		address: Option<&str>,
		key: &Keypair,
		redeem_script: Option<&Script>,
		level: FeeLevel,
	) -> anyhow::Result<Txid> {
		let address = match address {
			Some(a) => a.to_owned(),
			None => self.current_address(KeyPurpose::Internal)?,
		};
		let fee_rate = self.fees.fee_rate(level).await;
		let tx = self.builder.sweep(inputs, &address, key, redeem_script, fee_rate)?;
		self.broadcast(tx).await
	}

	/// Generate an escrow for the keys.
	pub fn generate_multisig_script(
		&self,
		pubkeys: &[PublicKey],
		threshold: usize,
		timeout: Duration,
		timeout_key: Option<PublicKey>,
	) -> Result<EscrowScript, escrow::Error> {
		escrow::script::generate(self.chain.as_ref(), pubkeys, threshold, timeout, timeout_key)
	}

	/// Sign every input of an escrow release through the multisig branch.
	pub fn create_multisig_signature(
		&self,
		inputs: &[TransactionInput],
		outputs: &[TransactionOutput],
		key: &Keypair,
		redeem_script: &Script,
		fee_rate: FeeRate,
	) -> Result<Vec<Signature>, escrow::Error> {
		let spend = EscrowSpend::new(inputs, outputs, redeem_script, fee_rate);
		multisig::create_multisig_signature(self.chain.as_ref(), &spend, key)
	}

	/// Assemble an escrow release from the signatures of two parties.
	///
	/// Returns the serialized transaction, broadcast first if asked for.
	pub async fn multisign(
		&self,
		inputs: &[TransactionInput],
		outputs: &[TransactionOutput],
		sigs_a: &[Signature],
		sigs_b: &[Signature],
		redeem_script: &Script,
		fee_rate: FeeRate,
		broadcast: bool,
	) -> anyhow::Result<Vec<u8>> {
		let spend = EscrowSpend::new(inputs, outputs, redeem_script, fee_rate);
		let tx = multisig::multisign(self.chain.as_ref(), &spend, sigs_a, sigs_b)?;
		let raw = consensus::serialize(&tx);
		if broadcast {
			self.broadcast(tx).await?;
		}
		Ok(raw)
	}

	/// Follow payments to addresses the wallet can't spend from.
	///
	/// Addresses of the wallet's own keys are already followed and skipped.
	pub async fn add_watched_addresses(&self, addresses: &[String]) -> anyhow::Result<()> {
		let mut scripts = Vec::with_capacity(addresses.len());
		for address in addresses {
			let script = self.chain.decode_address(address)?;
			if self.keys.key_for_script(&script)?.is_none() {
				scripts.push(script);
			}
		}
		if scripts.is_empty() {
			return Ok(());
		}
		self.db.put_watched_scripts(&scripts)?;
		self.source.listen_scripts(&scripts).await.map_err(network_error)?;
		Ok(())
	}

	/// Register a callback for every new or re-confirmed wallet transaction.
	pub fn add_transaction_listener(&self, listener: TransactionListener) {
		self.service.add_transaction_listener(listener);
	}
}
