//! Two-phase signing of escrow releases.
//!
//! Each party first signs the release independently with
//! [create_multisig_signature]. Anyone holding enough of those signatures
//! then assembles the final transaction with [multisign]. Both steps rebuild
//! the unsigned transaction from the same plain inputs, so parties that
//! disagree on the fee or the outputs end up with signatures that do not
//! verify, which is reported instead of producing an invalid transaction.

use std::collections::BTreeMap;

use bitcoin::{absolute, ecdsa, transaction, Amount, FeeRate, Script, Sequence, Transaction, TxIn, TxOut};
use bitcoin::secp256k1::{Keypair, Message};

use bitcoin_ext::FeeRateExt;

use crate::{bip69, Signature, TransactionInput, TransactionOutput};
use crate::chain::Chain;
use crate::error::Error;
use crate::script::EscrowPolicy;
use crate::sign::{self, SigningScript, StackItem};
use crate::weight::InputClass;


/// Which branch of the escrow script a release spends through.
///
/// Whether the timeout has actually passed is for the caller to judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpendPath {
	/// The threshold of escrow keys signs.
	Multisig,
	/// The timeout key signs alone after the relative lock has passed.
	Timeout,
}

/// The plain description of an escrow release all parties agree on.
#[derive(Debug, Clone, Copy)]
pub struct EscrowSpend<'a> {
	pub inputs: &'a [TransactionInput],
	/// The payouts before fees.
	///
	/// The fee is taken from these outputs in equal parts.
	pub outputs: &'a [TransactionOutput],
	pub redeem_script: &'a Script,
	pub fee_rate: FeeRate,
	pub path: SpendPath,
}

/// The unsigned release with what is needed to sign it.
struct Unsigned {
	tx: Transaction,
	/// The value spent by each input, in input order.
	values: Vec<Amount>,
	policy: EscrowPolicy,
}

impl<'a> EscrowSpend<'a> {
	/// A release through the multisig branch.
	pub fn new(
		inputs: &'a [TransactionInput],
		outputs: &'a [TransactionOutput],
		redeem_script: &'a Script,
		fee_rate: FeeRate,
	) -> EscrowSpend<'a> {
		EscrowSpend { inputs, outputs, redeem_script, fee_rate, path: SpendPath::Multisig }
	}

	pub fn with_path(mut self, path: SpendPath) -> EscrowSpend<'a> {
		self.path = path;
		self
	}

	/// The spending conditions encoded in the redeem script.
	pub fn policy(&self) -> Result<EscrowPolicy, Error> {
		EscrowPolicy::from_redeem_script(self.redeem_script)
			.ok_or_else(|| Error::signing("redeem script is not an escrow script"))
	}

	/// The total fee taken from the outputs.
	pub fn fee(&self, chain: &dyn Chain) -> Result<Amount, Error> {
		let policy = self.policy()?;
		let scripts = self.outputs.iter()
			.map(|o| chain.decode_address(&o.address))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(self.fee_for(chain, &policy, &scripts.iter().map(|s| s.as_script()).collect::<Vec<_>>()))
	}

	fn fee_for(&self, chain: &dyn Chain, policy: &EscrowPolicy, scripts: &[&Script]) -> Amount {
		let class = InputClass::escrow(policy, self.redeem_script, self.path);
		let inputs = vec![class; self.inputs.len()];
		self.fee_rate.fee_for_weight(chain.estimate_weight(&inputs, scripts))
	}

	fn unsigned(&self, chain: &dyn Chain) -> Result<Unsigned, Error> {
		let policy = self.policy()?;
		if self.inputs.is_empty() {
			return Err(Error::signing("release has no inputs"));
		}
		if self.outputs.is_empty() {
			return Err(Error::signing("release has no outputs"));
		}

		let sequence = match self.path {
			SpendPath::Multisig => Sequence::MAX,
			SpendPath::Timeout => policy.timeout
				.ok_or_else(|| Error::signing("escrow has no timeout branch"))?
				.sequence,
		};

		let mut output = self.outputs.iter().map(|o| -> Result<TxOut, Error> {
			Ok(TxOut { value: o.value, script_pubkey: chain.decode_address(&o.address)? })
		}).collect::<Result<Vec<_>, _>>()?;

		let fee = {
			let scripts = output.iter().map(|o| o.script_pubkey.as_script()).collect::<Vec<_>>();
			self.fee_for(chain, &policy, &scripts)
		};
		let nb_outputs = output.len() as u64;
		let fee_per_output = Amount::from_sat((fee.to_sat() + nb_outputs - 1) / nb_outputs);
		for out in output.iter_mut() {
			out.value = out.value.checked_sub(fee_per_output).ok_or(Error::InsufficientFunds {
				needed: fee_per_output,
				available: out.value,
			})?;
		}

		let mut tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: self.inputs.iter().map(|i| TxIn {
				previous_output: i.outpoint,
				sequence,
				..Default::default()
			}).collect(),
			output,
		};
		let mut values = self.inputs.iter().map(|i| i.value).collect::<Vec<_>>();
		bip69::sort_transaction(&mut tx, &mut values);

		Ok(Unsigned { tx, values, policy })
	}

	/// The unsigned release transaction every party signs.
	pub fn unsigned_tx(&self, chain: &dyn Chain) -> Result<Transaction, Error> {
		Ok(self.unsigned(chain)?.tx)
	}
}

impl Unsigned {
	fn messages(&self, chain: &dyn Chain, redeem_script: &Script) -> Result<Vec<Message>, Error> {
		self.values.iter().enumerate().map(|(idx, value)| {
			sign::signature_hash(
				chain.script_kind(), &self.tx, idx, SigningScript::Redeem(redeem_script), *value,
			)
		}).collect()
	}
}

/// Sign every input of the release with the given key.
///
/// Fails if the key cannot sign on the chosen path.
pub fn create_multisig_signature(
	chain: &dyn Chain,
	spend: &EscrowSpend,
	key: &Keypair,
) -> Result<Vec<Signature>, Error> {
	let unsigned = spend.unsigned(chain)?;
	let pubkey = key.public_key();
	match spend.path {
		SpendPath::Multisig => if unsigned.policy.key_position(&pubkey).is_none() {
			return Err(Error::signing(format!("key {} is not an escrow key", pubkey)));
		},
		SpendPath::Timeout => if unsigned.policy.timeout.map(|t| t.pubkey) != Some(pubkey) {
			return Err(Error::signing(format!("key {} is not the timeout key", pubkey)));
		},
	}

	let messages = unsigned.messages(chain, spend.redeem_script)?;
	let ret = messages.iter().enumerate().map(|(idx, msg)| Signature {
		input_index: idx as u32,
		signature: sign::sign(msg, key).to_vec(),
	}).collect::<Vec<_>>();
	debug!("Created {} escrow signatures with key {}", ret.len(), pubkey);
	Ok(ret)
}

fn parse_signature(sig: &Signature) -> Result<ecdsa::Signature, Error> {
	ecdsa::Signature::from_slice(&sig.signature).map_err(|e| {
		Error::signing(format!("malformed signature for input {}: {}", sig.input_index, e))
	})
}

/// Combine the signatures of the parties into the final release.
///
/// Every provided signature must verify against the rebuilt transaction,
/// and each input needs enough distinct signers for the chosen path.
pub fn multisign(
	chain: &dyn Chain,
	spend: &EscrowSpend,
	sigs_a: &[Signature],
	sigs_b: &[Signature],
) -> Result<Transaction, Error> {
	let unsigned = spend.unsigned(chain)?;
	let messages = unsigned.messages(chain, spend.redeem_script)?;
	let Unsigned { mut tx, policy, .. } = unsigned;

	let mut per_input = vec![Vec::new(); messages.len()];
	for sig in sigs_a.iter().chain(sigs_b) {
		let idx = sig.input_index as usize;
		let slot = per_input.get_mut(idx).ok_or_else(|| {
			Error::signing(format!("signature for input {} of a {}-input release", idx, messages.len()))
		})?;
		slot.push(parse_signature(sig)?);
	}

	for (idx, (msg, sigs)) in messages.iter().zip(per_input).enumerate() {
		let stack = match spend.path {
			SpendPath::Multisig => {
				let mut by_key = BTreeMap::new();
				for sig in sigs {
					let pos = policy.pubkeys.iter().position(|pk| sign::verify(msg, &sig, pk))
						.ok_or_else(|| Error::signing(format!(
							"signature for input {} does not match the release", idx,
						)))?;
					by_key.insert(pos, sig);
				}
				if by_key.len() < policy.threshold {
					return Err(Error::signing(format!(
						"input {} has {} of {} required signatures", idx, by_key.len(), policy.threshold,
					)));
				}

				// CHECKMULTISIG wants signatures in key order
				let mut stack = vec![StackItem::Empty];
				stack.extend(by_key.into_values().take(policy.threshold).map(|s| StackItem::Data(s.to_vec())));
				if policy.timeout.is_some() {
					stack.push(StackItem::True);
				}
				stack
			},
			SpendPath::Timeout => {
				let timeout_key = policy.timeout.as_ref()
					.ok_or_else(|| Error::signing("escrow has no timeout branch"))?
					.pubkey;
				let mut found = None;
				for sig in sigs {
					if !sign::verify(msg, &sig, &timeout_key) {
						return Err(Error::signing(format!(
							"signature for input {} does not match the release", idx,
						)));
					}
					found = Some(sig);
				}
				let sig = found.ok_or_else(|| Error::signing(format!(
					"input {} has no signature of the timeout key", idx,
				)))?;
				vec![StackItem::Data(sig.to_vec()), StackItem::Empty]
			},
		};
		sign::fill_escrow_input(chain.script_kind(), &mut tx, idx, &stack, spend.redeem_script)?;
	}

	debug!("Assembled escrow release {} with {} inputs", tx.compute_txid(), tx.input.len());
	Ok(tx)
}

/// Release an escrow with a single key.
///
/// This works for escrows a single key can spend: a 1-of-N multisig or the
/// timeout branch of a timelocked escrow.
pub fn sign_alone(chain: &dyn Chain, spend: &EscrowSpend, key: &Keypair) -> Result<Transaction, Error> {
	let sigs = create_multisig_signature(chain, spend, key)?;
	multisign(chain, spend, &sigs, &[])
}
