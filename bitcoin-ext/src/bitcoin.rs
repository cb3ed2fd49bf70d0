
use std::borrow::Borrow;

use cbitcoin::{Amount, FeeRate, Script, Transaction, Weight};


/// Length of the compact size prefix used to encode `n`.
pub fn compact_size_len(n: u64) -> usize {
	match n {
		0..=0xfc => 1,
		0xfd..=0xffff => 3,
		0x10000..=0xffffffff => 5,
		_ => 9,
	}
}


/// Extension trait for [Script].
pub trait ScriptExt: Borrow<Script> {
	/// The serialized size of an output carrying this script.
	fn output_size(&self) -> usize {
		let len = self.borrow().len();
		8 + compact_size_len(len as u64) + len
	}

	/// The smallest non-dust value for an output with this script.
	///
	/// This follows bitcoin core's rule: an output is dust when spending it
	/// would cost more than a third of its value at the dust relay fee.
	fn dust_threshold(&self, dust_relay_fee: FeeRate) -> Amount {
		let script = self.borrow();
		if script.is_op_return() {
			return Amount::ZERO;
		}

		let spend_size = if script.is_witness_program() {
			32 + 4 + 1 + (107 / 4) + 4
		} else {
			32 + 4 + 1 + 107 + 4
		};
		let vb = (self.output_size() + spend_size) as u64;
		Amount::from_sat(dust_relay_fee.to_sat_per_kwu() * 4 * vb / 1_000)
	}
}
impl ScriptExt for Script {}
impl ScriptExt for cbitcoin::ScriptBuf {}


/// Extension trait for [Transaction].
pub trait TransactionExt: Borrow<Transaction> {
	/// Returns total output value of the transaction.
	fn output_value(&self) -> Amount {
		self.borrow().output.iter().map(|o| o.value).sum()
	}
}
impl TransactionExt for Transaction {}


/// Extension trait for [FeeRate].
pub trait FeeRateExt: Borrow<FeeRate> {
	fn from_sat_per_vb_decimal_checked(sat_vb: f64) -> Option<FeeRate> {
		// Convert to sats per Wu then into kWu to maintain precision
		let fee = (sat_vb * 250.0).ceil();
		if fee.is_finite() && fee >= 0.0 && fee <= u64::MAX as f64 {
			Some(FeeRate::from_sat_per_kwu(fee as u64))
		} else {
			None
		}
	}

	/// The fee to pay for the given weight, rounded up to the next satoshi.
	fn fee_for_weight(&self, weight: Weight) -> Amount {
		let msat = self.borrow().to_sat_per_kwu().saturating_mul(weight.to_wu());
		Amount::from_sat((msat + 999) / 1_000)
	}
}
impl FeeRateExt for FeeRate {}
