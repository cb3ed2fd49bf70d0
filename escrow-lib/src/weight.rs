//! Worst-case transaction size estimation.
//!
//! Sizes are computed from the largest signature an input of a given class
//! can carry, never from actual signatures, so a fee derived from these
//! estimates is never an underpayment.

use bitcoin::{Script, Weight};

use bitcoin_ext::{compact_size_len, ScriptExt};

use crate::chain::ScriptKind;
use crate::multisig::SpendPath;
use crate::script::EscrowPolicy;


/// A DER-encoded ECDSA signature of maximal length plus the sighash flag.
pub const MAX_SIG_SIZE: usize = 73;

/// A compressed public key.
pub const PUBKEY_SIZE: usize = 33;

/// Serialized size of the outpoint and sequence of an input.
const INPUT_BASE_SIZE: usize = 32 + 4 + 4;

/// The spending conditions of an input, as far as its size is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputClass {
	/// A single-key output.
	Key,
	/// An escrow output spent through its multisig branch.
	Multisig {
		threshold: usize,
		redeem_script_len: usize,
		timelocked: bool,
	},
	/// A timelocked escrow output spent through its timeout branch.
	Timeout {
		redeem_script_len: usize,
	},
}

impl InputClass {
	/// The class of an escrow input spent through the given path.
	pub fn escrow(policy: &EscrowPolicy, redeem_script: &Script, path: SpendPath) -> InputClass {
		match path {
			SpendPath::Multisig => InputClass::Multisig {
				threshold: policy.threshold,
				redeem_script_len: redeem_script.len(),
				timelocked: policy.timeout.is_some(),
			},
			SpendPath::Timeout => InputClass::Timeout {
				redeem_script_len: redeem_script.len(),
			},
		}
	}

	/// Sizes of the unlocking stack elements, bottom first.
	fn stack(&self) -> Vec<usize> {
		match *self {
			InputClass::Key => vec![MAX_SIG_SIZE, PUBKEY_SIZE],
			InputClass::Multisig { threshold, redeem_script_len, timelocked } => {
				let mut ret = Vec::with_capacity(threshold + 3);
				// CHECKMULTISIG pops an extra element
				ret.push(0);
				ret.extend((0..threshold).map(|_| MAX_SIG_SIZE));
				if timelocked {
					ret.push(1);
				}
				ret.push(redeem_script_len);
				ret
			},
			InputClass::Timeout { redeem_script_len } => {
				vec![MAX_SIG_SIZE, 0, redeem_script_len]
			},
		}
	}

	/// Size of the witness carrying the unlocking stack.
	pub fn witness_size(&self) -> usize {
		let stack = self.stack();
		compact_size_len(stack.len() as u64)
			+ stack.iter().map(|len| compact_size_len(*len as u64) + len).sum::<usize>()
	}

	/// Size of a script sig pushing the unlocking stack.
	///
	/// The empty element and the branch selector are pushed as single
	/// opcodes.
	pub fn script_sig_size(&self) -> usize {
		self.stack().into_iter().map(|len| match len {
			0 | 1 => 1,
			2..=75 => 1 + len,
			76..=0xff => 2 + len,
			_ => 3 + len,
		}).sum()
	}
}

/// Estimate the weight of a transaction spending the given inputs to the
/// given output scripts.
pub fn estimate_tx_weight(kind: ScriptKind, inputs: &[InputClass], outputs: &[&Script]) -> Weight {
	// version and locktime
	let mut base = 4 + 4;
	base += compact_size_len(inputs.len() as u64);
	base += compact_size_len(outputs.len() as u64);

	let mut witness = 0;
	for input in inputs {
		match kind {
			ScriptKind::Witness => {
				base += INPUT_BASE_SIZE + 1;
				witness += input.witness_size();
			},
			ScriptKind::Legacy => {
				let script_sig = input.script_sig_size();
				base += INPUT_BASE_SIZE + compact_size_len(script_sig as u64) + script_sig;
			},
		}
	}
	base += outputs.iter().map(|s| s.output_size()).sum::<usize>();

	if witness > 0 {
		// segwit marker and flag
		witness += 2;
	}
	Weight::from_wu((base * 4 + witness) as u64)
}
