//! ECDSA signing of key and escrow inputs.

use bitcoin::{ecdsa, Amount, EcdsaSighashType, Script, ScriptBuf, Transaction, TxOut, Witness};
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Keypair, Message, PublicKey};
use bitcoin::sighash::SighashCache;

use crate::SECP;
use crate::chain::ScriptKind;
use crate::error::Error;


/// The script committed to by the signature hash of an input.
#[derive(Debug, Clone, Copy)]
pub enum SigningScript<'a> {
	/// The output script of a single-key output.
	Key(&'a Script),
	/// The redeem script of an escrow output.
	Redeem(&'a Script),
}

/// The message to sign for the given input.
pub fn signature_hash(
	kind: ScriptKind,
	tx: &Transaction,
	input_idx: usize,
	script: SigningScript,
	value: Amount,
) -> Result<Message, Error> {
	let mut cache = SighashCache::new(tx);
	let sighash_type = EcdsaSighashType::All;
	let digest = match (kind, script) {
		(ScriptKind::Witness, SigningScript::Key(spk)) => {
			cache.p2wpkh_signature_hash(input_idx, spk, value, sighash_type)
				.map_err(|e| Error::signing(format!("input {}: {}", input_idx, e)))?
				.to_byte_array()
		},
		(ScriptKind::Witness, SigningScript::Redeem(redeem)) => {
			cache.p2wsh_signature_hash(input_idx, redeem, value, sighash_type)
				.map_err(|e| Error::signing(format!("input {}: {}", input_idx, e)))?
				.to_byte_array()
		},
		(ScriptKind::Legacy, SigningScript::Key(script))
			| (ScriptKind::Legacy, SigningScript::Redeem(script)) =>
		{
			cache.legacy_signature_hash(input_idx, script, sighash_type.to_u32())
				.map_err(|e| Error::signing(format!("input {}: {}", input_idx, e)))?
				.to_byte_array()
		},
	};
	Ok(Message::from_digest(digest))
}

/// Produce a signature over the given message.
pub fn sign(msg: &Message, key: &Keypair) -> ecdsa::Signature {
	ecdsa::Signature {
		signature: SECP.sign_ecdsa(msg, &key.secret_key()),
		sighash_type: EcdsaSighashType::All,
	}
}

/// Check a signature over the given message.
pub fn verify(msg: &Message, sig: &ecdsa::Signature, pubkey: &PublicKey) -> bool {
	sig.sighash_type == EcdsaSighashType::All
		&& SECP.verify_ecdsa(msg, &sig.signature, pubkey).is_ok()
}

/// Push arbitrary data into a script sig.
pub(crate) fn push_data(builder: Builder, data: &[u8]) -> Result<Builder, Error> {
	let push = PushBytesBuf::try_from(data.to_vec())
		.map_err(|_| Error::signing("data too large to push"))?;
	Ok(builder.push_slice(push))
}

/// Sign the input spending a single-key output and fill in its unlocking data.
pub fn sign_key_input(
	kind: ScriptKind,
	tx: &mut Transaction,
	input_idx: usize,
	prevout: &TxOut,
	key: &Keypair,
) -> Result<(), Error> {
	let msg = signature_hash(kind, tx, input_idx, SigningScript::Key(&prevout.script_pubkey), prevout.value)?;
	let sig = sign(&msg, key);
	let pk = key.public_key();

	let input = tx.input.get_mut(input_idx)
		.ok_or_else(|| Error::signing(format!("no input {}", input_idx)))?;
	match kind {
		ScriptKind::Witness => {
			input.witness = Witness::p2wpkh(&sig, &pk);
		},
		ScriptKind::Legacy => {
			let builder = push_data(Builder::new(), &sig.to_vec())?;
			input.script_sig = builder.push_key(&bitcoin::PublicKey::new(pk)).into_script();
		},
	}
	Ok(())
}

/// The unlocking data of an escrow input, in stack order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StackItem {
	Empty,
	True,
	Data(Vec<u8>),
}

/// Fill in the unlocking data of an escrow input.
pub(crate) fn fill_escrow_input(
	kind: ScriptKind,
	tx: &mut Transaction,
	input_idx: usize,
	stack: &[StackItem],
	redeem_script: &Script,
) -> Result<(), Error> {
	let input = tx.input.get_mut(input_idx)
		.ok_or_else(|| Error::signing(format!("no input {}", input_idx)))?;
	match kind {
		ScriptKind::Witness => {
			let mut witness = Witness::new();
			for item in stack {
				match item {
					StackItem::Empty => witness.push([0u8; 0]),
					StackItem::True => witness.push([1u8]),
					StackItem::Data(d) => witness.push(d),
				}
			}
			witness.push(redeem_script.as_bytes());
			input.witness = witness;
		},
		ScriptKind::Legacy => {
			let mut builder = Builder::new();
			for item in stack {
				builder = match item {
					StackItem::Empty => builder.push_int(0),
					StackItem::True => builder.push_int(1),
					StackItem::Data(d) => push_data(builder, d)?,
				};
			}
			let script: ScriptBuf = push_data(builder, redeem_script.as_bytes())?.into_script();
			input.script_sig = script;
		},
	}
	Ok(())
}


#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::{absolute, transaction, OutPoint, Sequence, TxIn, Txid};

	use crate::test::keypair;
	use crate::chain::{BitcoinChain, ScriptCodec};

	fn spend(prevout_value: Amount) -> Transaction {
		Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::new(Txid::all_zeros(), 0),
				sequence: Sequence::ZERO,
				..Default::default()
			}],
			output: vec![TxOut {
				value: prevout_value - Amount::from_sat(500),
				script_pubkey: ScriptBuf::new(),
			}],
		}
	}

	#[test]
	fn witness_key_input() {
		let key = keypair(7);
		let chain = BitcoinChain::new(bitcoin::Network::Regtest, ScriptKind::Witness);
		let prevout = TxOut { value: Amount::from_sat(10_000), script_pubkey: chain.key_script(&key.public_key()) };
		let mut tx = spend(prevout.value);

		sign_key_input(ScriptKind::Witness, &mut tx, 0, &prevout, &key).unwrap();
		assert!(tx.input[0].script_sig.is_empty());
		assert_eq!(tx.input[0].witness.len(), 2);
		assert_eq!(tx.input[0].witness.nth(1).unwrap(), &key.public_key().serialize()[..]);

		let sig = ecdsa::Signature::from_slice(tx.input[0].witness.nth(0).unwrap()).unwrap();
		let mut unsigned = tx.clone();
		unsigned.input[0].witness = Witness::new();
		let msg = signature_hash(
			ScriptKind::Witness, &unsigned, 0, SigningScript::Key(&prevout.script_pubkey), prevout.value,
		).unwrap();
		assert!(verify(&msg, &sig, &key.public_key()));
		assert!(!verify(&msg, &sig, &keypair(8).public_key()));
	}

	#[test]
	fn legacy_key_input() {
		let key = keypair(9);
		let chain = BitcoinChain::new(bitcoin::Network::Regtest, ScriptKind::Legacy);
		let prevout = TxOut { value: Amount::from_sat(10_000), script_pubkey: chain.key_script(&key.public_key()) };
		let mut tx = spend(prevout.value);

		sign_key_input(ScriptKind::Legacy, &mut tx, 0, &prevout, &key).unwrap();
		assert!(tx.input[0].witness.is_empty());
		assert!(!tx.input[0].script_sig.is_empty());
	}

	#[test]
	fn wrong_script_kind_fails() {
		let key = keypair(7);
		let chain = BitcoinChain::new(bitcoin::Network::Regtest, ScriptKind::Legacy);
		let prevout = TxOut { value: Amount::from_sat(10_000), script_pubkey: chain.key_script(&key.public_key()) };
		let mut tx = spend(prevout.value);

		match sign_key_input(ScriptKind::Witness, &mut tx, 0, &prevout, &key) {
			Err(Error::SigningFailure(_)) => {},
			other => panic!("unexpected: {:?}", other),
		}
		assert!(sign_key_input(ScriptKind::Legacy, &mut tx, 3, &prevout, &key).is_err());
	}
}
