
use bitcoin::{Amount, Txid};


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendBuilt {
	pub txid: Txid,
	pub nb_inputs: usize,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub fee: Amount,
	pub has_change: bool,
}
impl_slog!(SpendBuilt, Debug, "built and signed spend transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeBumped {
	/// The stuck transaction.
	pub txid: Txid,
	/// The child spending its unspent outputs.
	pub child_txid: Txid,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub fee: Amount,
}
impl_slog!(FeeBumped, Info, "bumped fee of unconfirmed transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSwept {
	pub txid: Txid,
	pub nb_inputs: usize,
	pub escrow: bool,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}
impl_slog!(AddressSwept, Info, "swept inputs to a single output");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionBroadcast {
	pub txid: Txid,
}
impl_slog!(TransactionBroadcast, Debug, "broadcast transaction");
