//! The source of chain data the wallet syncs from.

use async_trait::async_trait;
use bitcoin::{Amount, BlockHash, FeeRate, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use bitcoin_ext::BlockHeight;


/// A block as announced by the chain source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainBlock {
	pub height: BlockHeight,
	pub hash: BlockHash,
	pub prev_hash: BlockHash,
	pub time: DateTime<Utc>,
}

/// A transaction together with what the source knows about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
	pub tx: Transaction,
	/// The outputs spent by the inputs, in input order, where known.
	pub prevouts: Vec<Option<TxOut>>,
	/// 0 while unconfirmed.
	pub confirmations: u32,
	/// Time of the confirming block.
	pub block_time: Option<DateTime<Utc>>,
}

impl ChainTransaction {
	pub fn txid(&self) -> Txid {
		self.tx.compute_txid()
	}

	/// The height of the confirming block, given the current tip.
	///
	/// Returns 0 while unconfirmed.
	pub fn height(&self, tip: BlockHeight) -> BlockHeight {
		confirmed_height(tip, self.confirmations)
	}
}

/// An unspent output as reported by the chain source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUtxo {
	pub outpoint: OutPoint,
	pub value: Amount,
	pub script_pubkey: ScriptBuf,
	/// 0 while unconfirmed.
	pub confirmations: u32,
}

/// The height of the block with the given number of confirmations.
pub fn confirmed_height(tip: BlockHeight, confirmations: u32) -> BlockHeight {
	if confirmations == 0 {
		0
	} else {
		tip.saturating_sub(confirmations - 1)
	}
}

/// A remote view of the chain.
///
/// Lookups are keyed by output script. The push channels deliver every new
/// block and every new transaction touching a script registered with
/// [ChainDataSource::listen_scripts]. Delivery is at least once.
#[async_trait]
pub trait ChainDataSource: Send + Sync + 'static {
	async fn best_block(&self) -> anyhow::Result<ChainBlock>;

	/// All unspent outputs paying to any of the scripts.
	async fn utxos(&self, scripts: &[ScriptBuf]) -> anyhow::Result<Vec<ChainUtxo>>;

	/// All transactions paying to or spending from any of the scripts.
	async fn transactions(&self, scripts: &[ScriptBuf]) -> anyhow::Result<Vec<ChainTransaction>>;

	async fn transaction(&self, txid: Txid) -> anyhow::Result<Option<ChainTransaction>>;

	async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<Txid>;

	/// The fee rate needed to confirm within the given number of blocks.
	async fn estimate_fee(&self, blocks: u16) -> anyhow::Result<Option<FeeRate>>;

	/// Start pushing transactions touching these scripts.
	async fn listen_scripts(&self, scripts: &[ScriptBuf]) -> anyhow::Result<()>;

	/// Subscribe to new blocks.
	fn block_notify(&self) -> mpsc::UnboundedReceiver<ChainBlock>;

	/// Subscribe to transactions touching the listened scripts.
	fn transaction_notify(&self) -> mpsc::UnboundedReceiver<ChainTransaction>;
}
