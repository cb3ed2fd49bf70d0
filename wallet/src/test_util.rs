//! A scripted in-memory chain, for testing the wallet without a network.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::{absolute, transaction, Amount, BlockHash, FeeRate, OutPoint, ScriptBuf, Sequence};
use bitcoin::{Transaction, TxIn, TxOut, Txid, Witness};
use bitcoin::hashes::Hash;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use bitcoin_ext::BlockHeight;

use crate::chain::{ChainBlock, ChainDataSource, ChainTransaction, ChainUtxo};


struct MockState {
	/// The blocks of the best chain, indexed by height.
	blocks: Vec<ChainBlock>,
	/// Every known transaction with the height that confirmed it.
	txs: BTreeMap<Txid, (Transaction, Option<BlockHeight>)>,
	fee_estimates: HashMap<u16, FeeRate>,
	listened: Vec<ScriptBuf>,
	broadcasts: Vec<Transaction>,
	offline: bool,
	nonce: u64,
}

impl MockState {
	fn tip(&self) -> BlockHeight {
		self.blocks.len() as BlockHeight - 1
	}

	fn next_nonce(&mut self) -> u64 {
		self.nonce += 1;
		self.nonce
	}

	fn new_block(&mut self) -> ChainBlock {
		let height = self.blocks.len() as BlockHeight;
		let nonce = self.next_nonce();
		let prev_hash = self.blocks.last().map(|b| b.hash).unwrap_or(BlockHash::all_zeros());
		let mut data = height.to_le_bytes().to_vec();
		data.extend(nonce.to_le_bytes());
		let block = ChainBlock {
			height,
			hash: BlockHash::hash(&data),
			prev_hash,
			time: block_time(height),
		};
		self.blocks.push(block);
		block
	}

	fn chain_tx(&self, txid: Txid) -> Option<ChainTransaction> {
		let (tx, height) = self.txs.get(&txid)?;
		let prevouts = tx.input.iter().map(|i| {
			self.txs.get(&i.previous_output.txid)
				.and_then(|(t, _)| t.output.get(i.previous_output.vout as usize).cloned())
		}).collect();
		Some(ChainTransaction {
			tx: tx.clone(),
			prevouts,
			confirmations: height.map(|h| self.tip() - h + 1).unwrap_or(0),
			block_time: height.map(block_time),
		})
	}

	fn is_spent(&self, outpoint: OutPoint) -> bool {
		self.txs.values().any(|(t, _)| t.input.iter().any(|i| i.previous_output == outpoint))
	}
}

fn block_time(height: BlockHeight) -> DateTime<Utc> {
	DateTime::from_timestamp(1_700_000_000 + height as i64 * 600, 0).unwrap_or_default()
}

/// An in-memory [ChainDataSource] driven by the test.
///
/// Transactions added to it sit in its mempool until [MockChainSource::mine_block]
/// confirms them. Every call through the [ChainDataSource] trait is counted.
pub struct MockChainSource {
	state: Mutex<MockState>,
	block_subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainBlock>>>,
	tx_subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainTransaction>>>,
	calls: AtomicUsize,
}

impl MockChainSource {
	pub fn new() -> MockChainSource {
		let mut state = MockState {
			blocks: Vec::new(),
			txs: BTreeMap::new(),
			fee_estimates: HashMap::new(),
			listened: Vec::new(),
			broadcasts: Vec::new(),
			offline: false,
			nonce: 0,
		};
		state.new_block();
		MockChainSource {
			state: Mutex::new(state),
			block_subscribers: Mutex::new(Vec::new()),
			tx_subscribers: Mutex::new(Vec::new()),
			calls: AtomicUsize::new(0),
		}
	}

	fn call(&self) -> anyhow::Result<()> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.state.lock().offline {
			bail!("chain source is offline");
		}
		Ok(())
	}

	/// Number of calls made to the source.
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn set_offline(&self, offline: bool) {
		self.state.lock().offline = offline;
	}

	pub fn set_fee_estimate(&self, blocks: u16, fee_rate: FeeRate) {
		self.state.lock().fee_estimates.insert(blocks, fee_rate);
	}

	pub fn tip(&self) -> ChainBlock {
		*self.state.lock().blocks.last().expect("genesis")
	}

	/// The transactions broadcast through the source.
	pub fn broadcasts(&self) -> Vec<Transaction> {
		self.state.lock().broadcasts.clone()
	}

	pub fn listened_scripts(&self) -> Vec<ScriptBuf> {
		self.state.lock().listened.clone()
	}

	pub fn get(&self, txid: Txid) -> Option<ChainTransaction> {
		self.state.lock().chain_tx(txid)
	}

	/// Add a transaction to the mempool.
	pub fn add_transaction(&self, tx: Transaction) -> ChainTransaction {
		let mut state = self.state.lock();
		let txid = tx.compute_txid();
		state.txs.insert(txid, (tx, None));
		state.chain_tx(txid).expect("just inserted")
	}

	/// Add a mempool transaction paying `value` to `script` from outside the wallet.
	pub fn fund(&self, script: &ScriptBuf, value: Amount) -> ChainTransaction {
		let nonce = self.state.lock().next_nonce();
		let tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::new(Txid::hash(&nonce.to_le_bytes()), 0),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output: vec![TxOut { value, script_pubkey: script.clone() }],
		};
		self.add_transaction(tx)
	}

	/// Forget a transaction, as if it was never seen.
	pub fn drop_transaction(&self, txid: Txid) {
		self.state.lock().txs.remove(&txid);
	}

	/// Mine a block confirming the whole mempool and announce it.
	pub fn mine_block(&self) -> ChainBlock {
		let block = {
			let mut state = self.state.lock();
			let block = state.new_block();
			for (_, height) in state.txs.values_mut() {
				if height.is_none() {
					*height = Some(block.height);
				}
			}
			block
		};
		self.notify_block(block);
		block
	}

	/// Replace the last `depth` blocks by as many new empty blocks.
	///
	/// Transactions confirmed in the removed blocks are dropped. Only the
	/// last new block is announced.
	pub fn reorg(&self, depth: usize) -> ChainBlock {
		let block = {
			let mut state = self.state.lock();
			let fork = state.blocks.len() - depth;
			state.blocks.truncate(fork);
			state.txs.retain(|_, (_, h)| h.map(|h| (h as usize) < fork).unwrap_or(true));
			for _ in 0..depth {
				state.new_block();
			}
			*state.blocks.last().expect("genesis")
		};
		self.notify_block(block);
		block
	}

	pub fn notify_block(&self, block: ChainBlock) {
		self.block_subscribers.lock().retain(|s| s.send(block).is_ok());
	}

	/// Push the transaction to the transaction subscribers.
	pub fn notify_transaction(&self, txid: Txid) {
		if let Some(tx) = self.get(txid) {
			self.tx_subscribers.lock().retain(|s| s.send(tx.clone()).is_ok());
		}
	}
}

#[async_trait]
impl ChainDataSource for MockChainSource {
	async fn best_block(&self) -> anyhow::Result<ChainBlock> {
		self.call()?;
		Ok(self.tip())
	}

	async fn utxos(&self, scripts: &[ScriptBuf]) -> anyhow::Result<Vec<ChainUtxo>> {
		self.call()?;
		let state = self.state.lock();
		let mut ret = Vec::new();
		for (txid, (tx, height)) in &state.txs {
			for (vout, out) in tx.output.iter().enumerate() {
				let outpoint = OutPoint::new(*txid, vout as u32);
				if !scripts.contains(&out.script_pubkey) || state.is_spent(outpoint) {
					continue;
				}
				ret.push(ChainUtxo {
					outpoint,
					value: out.value,
					script_pubkey: out.script_pubkey.clone(),
					confirmations: height.map(|h| state.tip() - h + 1).unwrap_or(0),
				});
			}
		}
		Ok(ret)
	}

	async fn transactions(&self, scripts: &[ScriptBuf]) -> anyhow::Result<Vec<ChainTransaction>> {
		self.call()?;
		let state = self.state.lock();
		Ok(state.txs.keys()
			.filter_map(|txid| state.chain_tx(*txid))
			.filter(|ctx| {
				ctx.tx.output.iter().any(|o| scripts.contains(&o.script_pubkey))
					|| ctx.prevouts.iter().flatten().any(|o| scripts.contains(&o.script_pubkey))
			})
			.collect())
	}

	async fn transaction(&self, txid: Txid) -> anyhow::Result<Option<ChainTransaction>> {
		self.call()?;
		Ok(self.get(txid))
	}

	async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<Txid> {
		self.call()?;
		let mut state = self.state.lock();
		let txid = tx.compute_txid();
		state.broadcasts.push(tx.clone());
		if !state.txs.contains_key(&txid) {
			state.txs.insert(txid, (tx.clone(), None));
		}
		Ok(txid)
	}

	async fn estimate_fee(&self, blocks: u16) -> anyhow::Result<Option<FeeRate>> {
		self.call()?;
		Ok(self.state.lock().fee_estimates.get(&blocks).copied())
	}

	async fn listen_scripts(&self, scripts: &[ScriptBuf]) -> anyhow::Result<()> {
		self.call()?;
		let mut state = self.state.lock();
		for script in scripts {
			if !state.listened.contains(script) {
				state.listened.push(script.clone());
			}
		}
		Ok(())
	}

	fn block_notify(&self) -> mpsc::UnboundedReceiver<ChainBlock> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.block_subscribers.lock().push(tx);
		rx
	}

	fn transaction_notify(&self) -> mpsc::UnboundedReceiver<ChainTransaction> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.tx_subscribers.lock().push(tx);
		rx
	}
}
