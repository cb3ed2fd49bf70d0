
use bitcoin::{Amount, BlockHash, OutPoint, SignedAmount, Txid};
use bitcoin_ext::BlockHeight;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorgDetected {
	pub coin: String,
	/// The best block we knew about.
	pub cached_hash: BlockHash,
	/// The parent of the newly announced block.
	pub prev_hash: BlockHash,
	pub new_hash: BlockHash,
	pub new_height: BlockHeight,
}
impl_slog!(ReorgDetected, Warn, "new block does not build on our tip, resyncing");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncStarted {
	pub coin: String,
	pub nb_scripts: usize,
}
impl_slog!(FullSyncStarted, Debug, "starting full wallet sync");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncFinished {
	pub coin: String,
	pub height: BlockHeight,
	pub nb_utxos: usize,
	pub nb_transactions: usize,
}
impl_slog!(FullSyncFinished, Info, "finished full wallet sync");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionIngested {
	pub txid: Txid,
	/// Zero for an unconfirmed transaction.
	pub height: BlockHeight,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub net_value: SignedAmount,
	pub watch_only: bool,
	/// Whether this observation was new or changed the height.
	pub changed: bool,
}
impl_slog!(TransactionIngested, Debug, "ingested wallet transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoReconciled {
	pub coin: String,
	pub nb_upserted: usize,
	pub removed: Vec<OutPoint>,
}
impl_slog!(UtxoReconciled, Debug, "reconciled utxo set with the chain source");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsReconciled {
	pub coin: String,
	pub nb_upserted: usize,
	pub removed: Vec<Txid>,
}
impl_slog!(TransactionsReconciled, Debug, "reconciled transactions with the chain source");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnconfirmedConfirmed {
	pub txid: Txid,
	pub height: BlockHeight,
}
impl_slog!(UnconfirmedConfirmed, Debug, "previously unconfirmed transaction confirmed");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebroadcastFailed {
	pub txid: Txid,
	pub error: String,
}
impl_slog!(RebroadcastFailed, Debug, "failed to rebroadcast unconfirmed transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItemSkipped {
	/// What was being synced, like a txid or an operation.
	pub item: String,
	pub error: String,
}
impl_slog!(SyncItemSkipped, Warn, "skipped item during sync");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerDispatch {
	pub txid: Txid,
	pub nb_listeners: usize,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub value: SignedAmount,
}
impl_slog!(ListenerDispatch, Trace, "notifying transaction listeners");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedUtxoSpent {
	pub utxo: OutPoint,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub spending_txid: Txid,
}
impl_slog!(WatchedUtxoSpent, Trace, "wallet utxo spent by incoming transaction");
