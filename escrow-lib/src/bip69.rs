//! Canonical transaction ordering.
//!
//! Inputs are ordered by the previous txid in its displayed byte order, then
//! by output index. Outputs are ordered by value, then by script bytes.

use std::cmp::Ordering;

use bitcoin::{Transaction, TxIn, TxOut};
use bitcoin::hashes::Hash;


pub fn cmp_inputs(a: &TxIn, b: &TxIn) -> Ordering {
	let a_txid = a.previous_output.txid.to_byte_array();
	let b_txid = b.previous_output.txid.to_byte_array();
	a_txid.iter().rev().cmp(b_txid.iter().rev())
		.then(a.previous_output.vout.cmp(&b.previous_output.vout))
}

pub fn cmp_outputs(a: &TxOut, b: &TxOut) -> Ordering {
	a.value.cmp(&b.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
}

/// Sort the inputs and outputs of the transaction.
///
/// `input_data` holds per-input data that must follow its input around,
/// such as the value of the output it spends.
pub fn sort_transaction<T>(tx: &mut Transaction, input_data: &mut Vec<T>) {
	assert_eq!(tx.input.len(), input_data.len(), "input data must match inputs");

	let mut inputs = tx.input.drain(..).zip(input_data.drain(..)).collect::<Vec<_>>();
	inputs.sort_by(|a, b| cmp_inputs(&a.0, &b.0));
	for (input, data) in inputs {
		tx.input.push(input);
		input_data.push(data);
	}

	tx.output.sort_by(cmp_outputs);
}


#[cfg(test)]
mod test {
	use super::*;

	use std::str::FromStr;

	use bitcoin::{absolute, transaction, Amount, OutPoint, ScriptBuf, Txid};

	fn input(txid: &str, vout: u32) -> TxIn {
		TxIn {
			previous_output: OutPoint::new(Txid::from_str(txid).unwrap(), vout),
			..Default::default()
		}
	}

	fn output(sat: u64, script: &[u8]) -> TxOut {
		TxOut {
			value: Amount::from_sat(sat),
			script_pubkey: ScriptBuf::from_bytes(script.to_vec()),
		}
	}

	#[test]
	fn sorts_inputs_by_displayed_txid_then_vout() {
		let first = "0e53ec5dfb2cb8a71fec32dc9a634a35b7e24799295ddd5278217822e0b31f57";
		let second = "26aa6e6d8b9e49bb0630aac301db6757c02e3619feb4ee0eea81eb1672947024";
		let third = "7d037ceb2ee0dc03e82f17be7935d238b35d1deabf953a892a4507bfbeeb3ba4";

		let mut tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![input(third, 0), input(first, 1), input(second, 0), input(first, 0)],
			output: vec![],
		};
		let mut values = vec![3, 11, 2, 10];
		sort_transaction(&mut tx, &mut values);

		let order = tx.input.iter()
			.map(|i| (i.previous_output.txid.to_string(), i.previous_output.vout))
			.collect::<Vec<_>>();
		assert_eq!(order, vec![
			(first.to_owned(), 0), (first.to_owned(), 1), (second.to_owned(), 0), (third.to_owned(), 0),
		]);
		assert_eq!(values, vec![10, 11, 2, 3]);
	}

	#[test]
	fn sorts_outputs_by_value_then_script() {
		let mut tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![],
			output: vec![output(2000, &[2]), output(1000, &[9]), output(2000, &[1, 5])],
		};
		sort_transaction(&mut tx, &mut Vec::<()>::new());

		assert_eq!(tx.output, vec![output(1000, &[9]), output(2000, &[1, 5]), output(2000, &[2])]);
	}

	#[test]
	fn sorting_is_idempotent() {
		let mut tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![
				input("26aa6e6d8b9e49bb0630aac301db6757c02e3619feb4ee0eea81eb1672947024", 1),
				input("0e53ec5dfb2cb8a71fec32dc9a634a35b7e24799295ddd5278217822e0b31f57", 3),
			],
			output: vec![output(5, &[1]), output(4, &[1])],
		};
		let mut data = vec!['a', 'b'];
		sort_transaction(&mut tx, &mut data);
		let sorted = tx.clone();
		sort_transaction(&mut tx, &mut data);
		assert_eq!(tx, sorted);
		assert_eq!(data, vec!['b', 'a']);
	}
}
