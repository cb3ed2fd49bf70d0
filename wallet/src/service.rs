//! The chain-state sync engine.
//!
//! The [WalletService] keeps the [Datastore] in line with the chain source.
//! It runs a full reconciliation on startup, after every reorg and on a fixed
//! interval, and in between ingests the blocks and transactions the source
//! pushes. Pushed events are handled on their own tasks, so their effects
//! may land in any order. Every write is a keyed upsert, which makes handling
//! the same event twice harmless, and the periodic reconciliation corrects
//! whatever an out-of-order or lost event left behind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{Amount, BlockHash, OutPoint, PubkeyHash, ScriptBuf, SignedAmount, Txid};
use bitcoin::hashes::Hash;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use bitcoin_ext::BlockHeight;
use escrow::{Chain, TransactionInput};

use crate::chain::{confirmed_height, ChainBlock, ChainDataSource, ChainTransaction};
use crate::keys::KeyManager;
use crate::persist::{Datastore, StoredTxn, StoredUtxo};


/// The best block the wallet knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
	pub height: BlockHeight,
	pub hash: BlockHash,
	pub timestamp: DateTime<Utc>,
}

impl ChainTip {
	/// The tip used before anything was synced.
	pub fn unknown() -> ChainTip {
		ChainTip { height: 0, hash: BlockHash::all_zeros(), timestamp: DateTime::<Utc>::default() }
	}
}

impl From<ChainBlock> for ChainTip {
	fn from(block: ChainBlock) -> ChainTip {
		ChainTip { height: block.height, hash: block.hash, timestamp: block.time }
	}
}

/// An output of a transaction reported to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutput {
	pub index: u32,
	pub script_pubkey: ScriptBuf,
	/// The address of the output script, if it has one.
	pub address: Option<String>,
	pub value: Amount,
}

/// A wallet transaction that was first seen or changed height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCallback {
	pub txid: Txid,
	/// The value of inputs whose spent output is unknown is zero.
	pub inputs: Vec<TransactionInput>,
	pub outputs: Vec<CallbackOutput>,
	/// Owned outputs minus owned inputs.
	pub value: SignedAmount,
	/// 0 while unconfirmed.
	pub height: BlockHeight,
	pub timestamp: DateTime<Utc>,
	pub watch_only: bool,
}

pub type TransactionListener = Arc<dyn Fn(&TransactionCallback) + Send + Sync>;

/// A script the wallet follows.
#[derive(Debug, Clone, Copy)]
struct StoredAddress {
	/// Set for watched scripts the wallet can't spend.
	watch_only: bool,
	/// The key paid by the script, if owned.
	key_hash: Option<PubkeyHash>,
}

type StoredAddresses = HashMap<ScriptBuf, StoredAddress>;

fn signed(amount: Amount) -> SignedAmount {
	SignedAmount::from_sat(amount.to_sat() as i64)
}

pub struct WalletService {
	db: Arc<dyn Datastore>,
	keys: Arc<KeyManager>,
	chain: Arc<dyn Chain>,
	source: Arc<dyn ChainDataSource>,

	tip: RwLock<ChainTip>,
	listeners: RwLock<Vec<TransactionListener>>,
	resync_interval: Duration,
	stop: CancellationToken,
}

impl WalletService {
	/// Create the service, restoring the tip checkpoint from the cache.
	pub fn new(
		db: Arc<dyn Datastore>,
		keys: Arc<KeyManager>,
		chain: Arc<dyn Chain>,
		source: Arc<dyn ChainDataSource>,
		resync_interval: Duration,
	) -> WalletService {
		let tip = match db.get_cache(&checkpoint_key(chain.as_ref())) {
			Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
				warn!("Ignoring invalid tip checkpoint: {}", e);
				ChainTip::unknown()
			}),
			Ok(None) => ChainTip::unknown(),
			Err(e) => {
				warn!("Failed to read tip checkpoint: {:#}", e);
				ChainTip::unknown()
			},
		};

		WalletService {
			db, keys, chain, source,
			tip: RwLock::new(tip),
			listeners: RwLock::new(Vec::new()),
			resync_interval,
			stop: CancellationToken::new(),
		}
	}

	pub fn chain_tip(&self) -> ChainTip {
		*self.tip.read()
	}

	fn set_tip(&self, tip: ChainTip) {
		let mut guard = self.tip.write();
		*guard = tip;
		let key = checkpoint_key(self.chain.as_ref());
		let res = serde_json::to_string(&tip).map_err(anyhow::Error::from)
			.and_then(|json| self.db.set_cache(&key, &json));
		if let Err(e) = res {
			warn!("Failed to store tip checkpoint: {:#}", e);
		}
		slog!(TipUpdated, coin: self.chain.coin(), height: tip.height, hash: tip.hash);
	}

	pub fn add_transaction_listener(&self, listener: TransactionListener) {
		self.listeners.write().push(listener);
	}

	fn notify(&self, cb: &TransactionCallback) {
		let listeners = self.listeners.read().clone();
		slog!(ListenerDispatch, txid: cb.txid, nb_listeners: listeners.len(), value: cb.value);
		for listener in listeners {
			listener(cb);
		}
	}

	/// Owned key scripts and watched scripts.
	///
	/// A script that is both owned and watched counts as owned.
	fn stored_addresses(&self) -> anyhow::Result<StoredAddresses> {
		let mut ret = HashMap::new();
		for script in self.db.get_watched_scripts()? {
			ret.insert(script, StoredAddress { watch_only: true, key_hash: None });
		}
		for owned in self.keys.owned_scripts()? {
			ret.insert(owned.script, StoredAddress {
				watch_only: false,
				key_hash: Some(owned.key_hash),
			});
		}
		Ok(ret)
	}

	/// Run the service until [WalletService::stop] is called.
	pub async fn run(self: Arc<Self>) {
		let mut blocks = self.source.block_notify();
		let mut txs = self.source.transaction_notify();

		match self.stored_addresses() {
			Ok(addrs) => {
				let scripts = addrs.into_keys().collect::<Vec<_>>();
				if let Err(e) = self.source.listen_scripts(&scripts).await {
					warn!("Failed to listen for wallet scripts: {:#}", e);
				}
			},
			Err(e) => warn!("Failed to load wallet scripts: {:#}", e),
		}
		if let Err(e) = self.update_state().await {
			warn!("Initial wallet sync failed: {:#}", e);
		}

		let mut resync = tokio::time::interval(self.resync_interval);
		resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
		resync.reset();

		loop {
			tokio::select! {
				_ = self.stop.cancelled() => {
					info!("Wallet service for {} stopped", self.chain.coin());
					break;
				},
				Some(tx) = txs.recv() => {
					let svc = self.clone();
					tokio::spawn(async move {
						let txid = tx.txid();
						if let Err(e) = svc.process_incoming_transaction(tx).await {
							slog!(SyncItemSkipped, item: txid.to_string(), error: format!("{:#}", e));
						}
					});
				},
				Some(block) = blocks.recv() => {
					let svc = self.clone();
					tokio::spawn(async move {
						if let Err(e) = svc.process_incoming_block(block).await {
							slog!(SyncItemSkipped, item: block.hash.to_string(), error: format!("{:#}", e));
						}
					});
				},
				_ = resync.tick() => {
					let svc = self.clone();
					tokio::spawn(async move {
						if let Err(e) = svc.update_state().await {
							slog!(SyncItemSkipped, item: "full sync".into(), error: format!("{:#}", e));
						}
					});
				},
			}
		}
	}

	pub fn stop(&self) {
		self.stop.cancel();
	}

	/// Reconcile the tip, the utxos and the transactions with the source.
	pub async fn update_state(&self) -> anyhow::Result<()> {
		let block = self.source.best_block().await.context("failed to fetch best block")?;
		self.set_tip(block.into());

		let addrs = self.stored_addresses()?;
		let scripts = addrs.keys().cloned().collect::<Vec<_>>();
		slog!(FullSyncStarted, coin: self.chain.coin(), nb_scripts: scripts.len());

		let (utxos, txs) = tokio::join!(
			self.sync_utxos(&addrs, &scripts, block.height),
			self.sync_transactions(&addrs, &scripts, block.height),
		);
		let nb_utxos = utxos?;
		let nb_transactions = txs?;

		slog!(FullSyncFinished, coin: self.chain.coin(), height: block.height, nb_utxos, nb_transactions);
		Ok(())
	}

	async fn sync_utxos(
		&self,
		addrs: &StoredAddresses,
		scripts: &[ScriptBuf],
		tip: BlockHeight,
	) -> anyhow::Result<usize> {
		let fresh = self.source.utxos(scripts).await.context("failed to fetch utxos")?;

		let mut seen = HashSet::with_capacity(fresh.len());
		let mut nb_upserted = 0;
		for utxo in fresh {
			seen.insert(utxo.outpoint);
			let stored = StoredUtxo {
				outpoint: utxo.outpoint,
				value: utxo.value,
				watch_only: addrs.get(&utxo.script_pubkey).map(|a| a.watch_only).unwrap_or(true),
				height: confirmed_height(tip, utxo.confirmations),
				script_pubkey: utxo.script_pubkey,
			};
			match self.db.put_utxo(&stored) {
				Ok(()) => nb_upserted += 1,
				Err(e) => slog!(SyncItemSkipped,
					item: utxo.outpoint.to_string(), error: format!("{:#}", e),
				),
			}
		}

		let mut removed = Vec::new();
		for utxo in self.db.get_utxos()? {
			if !seen.contains(&utxo.outpoint) && self.db.delete_utxo(utxo.outpoint)? {
				removed.push(utxo.outpoint);
			}
		}

		slog!(UtxoReconciled, coin: self.chain.coin(), nb_upserted, removed);
		Ok(seen.len())
	}

	async fn sync_transactions(
		&self,
		addrs: &StoredAddresses,
		scripts: &[ScriptBuf],
		tip: BlockHeight,
	) -> anyhow::Result<usize> {
		let fresh = self.source.transactions(scripts).await.context("failed to fetch transactions")?;

		let mut seen = HashSet::with_capacity(fresh.len());
		let mut nb_upserted = 0;
		for tx in &fresh {
			let txid = tx.txid();
			seen.insert(txid);
			match self.save_transaction(tx, tip, addrs) {
				Ok(_) => nb_upserted += 1,
				Err(e) => slog!(SyncItemSkipped, item: txid.to_string(), error: format!("{:#}", e)),
			}
		}

		let mut removed = Vec::new();
		for txn in self.db.get_txns(true)? {
			if !seen.contains(&txn.txid) && self.db.delete_txn(txn.txid)? {
				removed.push(txn.txid);
			}
		}

		slog!(TransactionsReconciled, coin: self.chain.coin(), nb_upserted, removed);
		Ok(seen.len())
	}

	/// Store the transaction if it touches the wallet.
	///
	/// Listeners are notified when the transaction is new, or when its height
	/// or its relation to the wallet changed. Returns whether that was the case.
	fn save_transaction(
		&self,
		ctx: &ChainTransaction,
		tip: BlockHeight,
		addrs: &StoredAddresses,
	) -> anyhow::Result<bool> {
		let txid = ctx.txid();
		let height = ctx.height(tip);

		let mut relevant = false;
		let mut hits = 0;
		let mut value = SignedAmount::ZERO;

		let mut local_utxos = None;
		let mut inputs = Vec::with_capacity(ctx.tx.input.len());
		for (idx, txin) in ctx.tx.input.iter().enumerate() {
			let prevout = match ctx.prevouts.get(idx).cloned().flatten() {
				Some(p) => Some((p.script_pubkey, p.value)),
				None => {
					// fall back to our own record of the spent output
					if local_utxos.is_none() {
						local_utxos = Some(self.db.get_utxos()?);
					}
					local_utxos.as_ref().and_then(|u| u.iter().find(|u| u.outpoint == txin.previous_output))
						.map(|u| (u.script_pubkey.clone(), u.value))
				},
			};

			if let Some((spk, amount)) = &prevout {
				if let Some(addr) = addrs.get(spk) {
					relevant = true;
					value -= signed(*amount);
					if !addr.watch_only {
						hits += 1;
					}
				}
			}
			inputs.push(TransactionInput {
				outpoint: txin.previous_output,
				linked_address: prevout.as_ref().and_then(|(spk, _)| self.chain.encode_address(spk)),
				value: prevout.map(|(_, v)| v).unwrap_or(Amount::ZERO),
			});
		}

		let mut outputs = Vec::with_capacity(ctx.tx.output.len());
		for (idx, out) in ctx.tx.output.iter().enumerate() {
			if let Some(addr) = addrs.get(&out.script_pubkey) {
				relevant = true;
				value += signed(out.value);
				if !addr.watch_only {
					hits += 1;
				}
				if let Some(hash) = addr.key_hash {
					if let Err(e) = self.keys.mark_key_used(hash) {
						warn!("Failed to mark key {} as used: {:#}", hash, e);
					}
				}
			}
			outputs.push(CallbackOutput {
				index: idx as u32,
				script_pubkey: out.script_pubkey.clone(),
				address: self.chain.encode_address(&out.script_pubkey),
				value: out.value,
			});
		}

		if !relevant {
			trace!("Ignoring transaction {} that doesn't touch the wallet", txid);
			return Ok(false);
		}
		let watch_only = hits == 0;

		let (changed, timestamp) = match self.db.get_txn(txid)? {
			None => {
				let timestamp = ctx.block_time.unwrap_or_else(Utc::now);
				self.db.put_txn(&StoredTxn {
					txid, height, timestamp, watch_only,
					net_value: value,
					tx: ctx.tx.clone(),
				})?;
				(true, timestamp)
			},
			Some(existing) if existing.watch_only != watch_only => {
				// one of our scripts changed hands, like a watched address whose
				// key got imported
				let timestamp = match existing.height != height {
					true => ctx.block_time.unwrap_or(existing.timestamp),
					false => existing.timestamp,
				};
				self.db.put_txn(&StoredTxn { height, timestamp, watch_only, ..existing })?;
				self.reclassify_utxos(txid, addrs)?;
				(true, timestamp)
			},
			Some(existing) if existing.height != height => {
				let timestamp = ctx.block_time.unwrap_or(existing.timestamp);
				self.db.update_txn_height(txid, height, timestamp)?;
				(true, timestamp)
			},
			Some(existing) => (false, existing.timestamp),
		};

		slog!(TransactionIngested, txid, height, net_value: value, watch_only, changed);
		if changed {
			self.notify(&TransactionCallback {
				txid, inputs, outputs, value, height, timestamp, watch_only,
			});
		}
		Ok(changed)
	}

	/// Bring the watch-only flag of the transaction's stored outputs in line
	/// with the current addresses.
	fn reclassify_utxos(&self, txid: Txid, addrs: &StoredAddresses) -> anyhow::Result<()> {
		for utxo in self.db.get_utxos()? {
			if utxo.outpoint.txid != txid {
				continue;
			}
			if let Some(addr) = addrs.get(&utxo.script_pubkey) {
				if addr.watch_only != utxo.watch_only {
					self.db.set_utxo_watch_only(utxo.outpoint, addr.watch_only)?;
				}
			}
		}
		Ok(())
	}

	/// Ingest a transaction pushed by the source or broadcast by the wallet.
	pub async fn process_incoming_transaction(&self, ctx: ChainTransaction) -> anyhow::Result<()> {
		let tip = self.chain_tip().height;
		let addrs = self.stored_addresses()?;
		self.save_transaction(&ctx, tip, &addrs)?;

		let txid = ctx.txid();
		let height = ctx.height(tip);
		for (idx, out) in ctx.tx.output.iter().enumerate() {
			if let Some(addr) = addrs.get(&out.script_pubkey) {
				self.db.put_utxo(&StoredUtxo {
					outpoint: OutPoint::new(txid, idx as u32),
					value: out.value,
					script_pubkey: out.script_pubkey.clone(),
					height,
					watch_only: addr.watch_only,
				})?;
			}
		}

		let spent = ctx.tx.input.iter().map(|i| i.previous_output).collect::<HashSet<_>>();
		for utxo in self.db.get_utxos()? {
			if spent.contains(&utxo.outpoint) && self.db.delete_utxo(utxo.outpoint)? {
				slog!(WatchedUtxoSpent, utxo: utxo.outpoint, amount: utxo.value, spending_txid: txid);
			}
		}
		Ok(())
	}

	/// Advance the tip to a block pushed by the source.
	///
	/// A block that doesn't build on the cached tip means a reorg, which is
	/// handled with a full reconciliation. Otherwise every unconfirmed wallet
	/// transaction is looked up again.
	pub async fn process_incoming_block(&self, block: ChainBlock) -> anyhow::Result<()> {
		let cached = self.chain_tip();
		self.set_tip(block.into());

		if block.prev_hash != cached.hash && block.hash != cached.hash {
			slog!(ReorgDetected,
				coin: self.chain.coin(),
				cached_hash: cached.hash,
				prev_hash: block.prev_hash,
				new_hash: block.hash,
				new_height: block.height,
			);
			return self.update_state().await;
		}

		let addrs = self.stored_addresses()?;
		let unconfirmed = self.db.get_txns(true)?.into_iter()
			.filter(|t| t.height == 0)
			.collect::<Vec<_>>();
		join_all(unconfirmed.iter().map(|t| self.recheck_unconfirmed(t, block.height, &addrs))).await;
		Ok(())
	}

	async fn recheck_unconfirmed(&self, txn: &StoredTxn, tip: BlockHeight, addrs: &StoredAddresses) {
		let res = match self.source.transaction(txn.txid).await {
			Ok(Some(ctx)) if ctx.confirmations > 0 => self.backfill_height(&ctx, tip, addrs),
			Ok(_) => {
				if let Err(e) = self.source.broadcast(&txn.tx).await {
					slog!(RebroadcastFailed, txid: txn.txid, error: format!("{:#}", e));
				}
				Ok(())
			},
			Err(e) => Err(e),
		};
		if let Err(e) = res {
			slog!(SyncItemSkipped, item: txn.txid.to_string(), error: format!("{:#}", e));
		}
	}

	fn backfill_height(
		&self,
		ctx: &ChainTransaction,
		tip: BlockHeight,
		addrs: &StoredAddresses,
	) -> anyhow::Result<()> {
		let txid = ctx.txid();
		let height = confirmed_height(tip, ctx.confirmations);
		self.save_transaction(ctx, tip, addrs)?;
		for mut utxo in self.db.get_utxos()? {
			if utxo.outpoint.txid == txid && utxo.height != height {
				utxo.height = height;
				self.db.put_utxo(&utxo)?;
			}
		}
		slog!(UnconfirmedConfirmed, txid, height);
		Ok(())
	}
}

fn checkpoint_key(chain: &dyn Chain) -> String {
	format!("best-height-{}", chain.coin())
}
