//! Coin selection and funding of ordinary spends.
//!
//! Coins are picked largest first, oldest first among equal values, until
//! they cover the payment plus a fee computed for the worst-case size of the
//! resulting transaction. Every fee is re-evaluated against the actual number
//! of inputs selected, so the final fee is never an underpayment.

use std::cmp::Ordering;

use bitcoin::{absolute, transaction, Amount, FeeRate, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut};

use bitcoin_ext::FeeRateExt;

use crate::bip69;
use crate::chain::Chain;
use crate::error::Error;
use crate::weight::InputClass;


/// The maximum number of inputs a funded transaction may have.
pub const MAX_INPUTS: usize = 10_000;

/// A spendable output held by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coin {
	pub outpoint: OutPoint,
	pub txout: TxOut,
	/// Zero for an unconfirmed output.
	pub confirmations: u32,
}

/// Largest value first, then most confirmations, then by outpoint.
///
/// This is a total order over distinct coins, which makes selection
/// independent of the order in which coins are listed.
pub fn cmp_coins(a: &Coin, b: &Coin) -> Ordering {
	b.txout.value.cmp(&a.txout.value)
		.then(b.confirmations.cmp(&a.confirmations))
		.then_with(|| a.outpoint.cmp(&b.outpoint))
}

/// Select coins whose sum is at least `target`.
pub fn select_coins(coins: &[Coin], target: Amount, max_inputs: usize) -> Result<Vec<Coin>, Error> {
	let mut sorted = coins.to_vec();
	sorted.sort_by(cmp_coins);

	let mut total = Amount::ZERO;
	let mut ret = Vec::new();
	for coin in sorted.into_iter().take(max_inputs) {
		if total >= target && !ret.is_empty() {
			break;
		}
		total += coin.txout.value;
		ret.push(coin);
	}

	if total < target || ret.is_empty() {
		return Err(Error::InsufficientFunds { needed: target, available: total });
	}
	Ok(ret)
}

/// An unsigned, canonically sorted transaction with its funding details.
#[derive(Debug, Clone)]
pub struct Funded {
	pub tx: Transaction,
	/// The outputs spent by the inputs of `tx`, in input order.
	pub prevouts: Vec<TxOut>,
	pub fee: Amount,
	/// Index of the change output in `tx`, if any.
	pub change: Option<usize>,
}

impl Funded {
	pub fn input_value(&self) -> Amount {
		self.prevouts.iter().map(|o| o.value).sum()
	}
}

fn unsigned_tx(coins: &[Coin], output: Vec<TxOut>) -> (Transaction, Vec<TxOut>) {
	let tx = Transaction {
		version: transaction::Version::TWO,
		lock_time: absolute::LockTime::ZERO,
		input: coins.iter().map(|c| TxIn {
			previous_output: c.outpoint,
			// signal replaceability so the fee can be bumped later
			sequence: Sequence::ZERO,
			..Default::default()
		}).collect(),
		output,
	};
	(tx, coins.iter().map(|c| c.txout.clone()).collect())
}

/// Fund a payment to `outputs` from `coins`.
///
/// Change above the dust threshold goes to `change_script`, anything below it
/// is left to the fee.
pub fn fund_transaction(
	chain: &dyn Chain,
	coins: &[Coin],
	outputs: Vec<TxOut>,
	change_script: &Script,
	fee_rate: FeeRate,
	max_inputs: usize,
) -> Result<Funded, Error> {
	let target = outputs.iter().try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.value))
		.ok_or(Error::InsufficientFunds { needed: Amount::MAX_MONEY, available: Amount::ZERO })?;

	let mut scripts = outputs.iter().map(|o| o.script_pubkey.as_script()).collect::<Vec<_>>();
	scripts.push(change_script);

	let fee_for = |nb_inputs: usize| {
		let inputs = vec![InputClass::Key; nb_inputs];
		fee_rate.fee_for_weight(chain.estimate_weight(&inputs, &scripts))
	};

	let mut target_fee = fee_for(1);
	loop {
		let selected = select_coins(coins, target + target_fee, max_inputs)?;
		let input_value = selected.iter().map(|c| c.txout.value).sum::<Amount>();

		let max_required_fee = fee_for(selected.len());
		let remaining = input_value - target;
		if remaining < max_required_fee {
			trace!("Fee for {} inputs is {}, retrying selection", selected.len(), max_required_fee);
			target_fee = max_required_fee;
			continue;
		}

		let change_value = remaining - max_required_fee;
		let mut output = outputs.clone();
		let change = if change_value > Amount::ZERO && !chain.is_dust(change_value, change_script) {
			output.push(TxOut { value: change_value, script_pubkey: change_script.to_owned() });
			Some(change_value)
		} else {
			None
		};

		let (mut tx, mut prevouts) = unsigned_tx(&selected, output);
		bip69::sort_transaction(&mut tx, &mut prevouts);

		let change = change.and_then(|value| tx.output.iter().position(|o| {
			o.value == value && o.script_pubkey.as_script() == change_script
		}));
		let fee = input_value - tx.output.iter().map(|o| o.value).sum::<Amount>();
		return Ok(Funded { tx, prevouts, fee, change });
	}
}

/// Spend every coin to a single output, the fee deducted from it.
pub fn sweep_coins(
	chain: &dyn Chain,
	coins: &[Coin],
	destination: ScriptBuf,
	fee_rate: FeeRate,
) -> Result<Funded, Error> {
	let inputs = vec![InputClass::Key; coins.len().max(1)];
	let fee = fee_rate.fee_for_weight(chain.estimate_weight(&inputs, &[&destination]));
	let total = coins.iter().map(|c| c.txout.value).sum::<Amount>();

	let value = total.checked_sub(fee)
		.ok_or(Error::InsufficientFunds { needed: fee, available: total })?;
	let threshold = chain.dust_threshold(&destination);
	if value < threshold {
		return Err(Error::DustAmount { amount: value, threshold });
	}

	let (mut tx, mut prevouts) = unsigned_tx(coins, vec![TxOut { value, script_pubkey: destination }]);
	bip69::sort_transaction(&mut tx, &mut prevouts);
	Ok(Funded { tx, prevouts, fee, change: None })
}
