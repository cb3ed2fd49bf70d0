//! Escrow redeem scripts.
//!
//! Every party of an escrow builds the redeem script independently from the
//! same plain inputs, so generation is a pure function of those inputs. Keys
//! are sorted before use, which makes the result independent of the order in
//! which the caller received them.

use std::time::Duration;

use bitcoin::{opcodes, Script, ScriptBuf, Sequence};
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::PublicKey;

use crate::chain::Chain;
use crate::error::Error;


/// The maximum number of keys CHECKMULTISIG accepts.
pub const MAX_MULTISIG_KEYS: usize = 20;

/// Number of blocks expected per hour of timeout.
pub const BLOCKS_PER_HOUR: u64 = 6;

/// The relative timeout branch of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EscrowTimeout {
	/// The relative lock that must have passed before the timeout key alone
	/// can spend.
	pub sequence: Sequence,
	pub pubkey: PublicKey,
}

/// The spending conditions of an escrow output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EscrowPolicy {
	pub threshold: usize,
	/// The multisig keys, in canonical order.
	pub pubkeys: Vec<PublicKey>,
	pub timeout: Option<EscrowTimeout>,
}

/// A generated escrow: its redeem script and where to pay it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EscrowScript {
	pub address: String,
	pub script_pubkey: ScriptBuf,
	pub redeem_script: ScriptBuf,
}

/// Convert a timeout duration into a block-based relative lock.
///
/// Only whole hours count, so anything under an hour is no timeout at all
/// and gives [None].
pub fn timeout_sequence(timeout: Duration) -> Result<Option<Sequence>, Error> {
	let blocks = (timeout.as_secs() / 3600) * BLOCKS_PER_HOUR;
	if blocks == 0 {
		return Ok(None);
	}
	let blocks = u16::try_from(blocks)
		.map_err(|_| Error::script(format!("timeout of {} blocks is too long", blocks)))?;
	Ok(Some(Sequence::from_height(blocks)))
}

impl EscrowPolicy {
	/// Create a policy, checking its parameters and sorting its keys.
	pub fn new(
		mut pubkeys: Vec<PublicKey>,
		threshold: usize,
		timeout: Option<EscrowTimeout>,
	) -> Result<EscrowPolicy, Error> {
		if pubkeys.is_empty() {
			return Err(Error::script("no keys provided"));
		}
		if pubkeys.len() > MAX_MULTISIG_KEYS {
			return Err(Error::script(format!(
				"{} keys exceed the maximum of {}", pubkeys.len(), MAX_MULTISIG_KEYS,
			)));
		}
		if threshold == 0 {
			return Err(Error::script("threshold must be at least one"));
		}
		if threshold > pubkeys.len() {
			return Err(Error::script(format!(
				"threshold of {} is larger than the number of keys ({})", threshold, pubkeys.len(),
			)));
		}

		pubkeys.sort_by_key(|pk| pk.serialize());
		if pubkeys.windows(2).any(|w| w[0] == w[1]) {
			return Err(Error::script("duplicate key"));
		}

		Ok(EscrowPolicy { threshold, pubkeys, timeout })
	}

	fn push_multisig(&self, builder: Builder) -> Builder {
		let mut builder = builder.push_int(self.threshold as i64);
		for pk in &self.pubkeys {
			builder = builder.push_key(&bitcoin::PublicKey::new(*pk));
		}
		builder
			.push_int(self.pubkeys.len() as i64)
			.push_opcode(opcodes::all::OP_CHECKMULTISIG)
	}

	/// The redeem script enforcing this policy.
	pub fn redeem_script(&self) -> ScriptBuf {
		match self.timeout {
			None => self.push_multisig(Builder::new()).into_script(),
			Some(ref timeout) => {
				let builder = self.push_multisig(Builder::new().push_opcode(opcodes::all::OP_IF));
				builder
					.push_opcode(opcodes::all::OP_ELSE)
					.push_int(timeout.sequence.to_consensus_u32() as i64)
					.push_opcode(opcodes::all::OP_CSV)
					.push_opcode(opcodes::all::OP_DROP)
					.push_key(&bitcoin::PublicKey::new(timeout.pubkey))
					.push_opcode(opcodes::all::OP_CHECKSIG)
					.push_opcode(opcodes::all::OP_ENDIF)
					.into_script()
			},
		}
	}

	/// Recover the policy from a redeem script built by [EscrowPolicy::redeem_script].
	pub fn from_redeem_script(script: &Script) -> Option<EscrowPolicy> {
		let ins = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;

		let (multisig, timeout) = if ins.first() == Some(&Instruction::Op(opcodes::all::OP_IF)) {
			if ins.last() != Some(&Instruction::Op(opcodes::all::OP_ENDIF)) {
				return None;
			}
			let else_idx = ins.iter().position(|i| *i == Instruction::Op(opcodes::all::OP_ELSE))?;
			let timeout = match &ins[else_idx + 1..ins.len() - 1] {
				[lock, csv, drop, key, checksig]
					if *csv == Instruction::Op(opcodes::all::OP_CSV)
						&& *drop == Instruction::Op(opcodes::all::OP_DROP)
						&& *checksig == Instruction::Op(opcodes::all::OP_CHECKSIG) =>
				{
					let lock = u32::try_from(read_script_num(lock)?).ok()?;
					EscrowTimeout {
						sequence: Sequence::from_consensus(lock),
						pubkey: read_pubkey(key)?,
					}
				},
				_ => return None,
			};
			(&ins[1..else_idx], Some(timeout))
		} else {
			(&ins[..], None)
		};

		let (first, rest) = multisig.split_first()?;
		let (last, rest) = rest.split_last()?;
		let (nb_keys, keys) = rest.split_last()?;
		if *last != Instruction::Op(opcodes::all::OP_CHECKMULTISIG) {
			return None;
		}
		let threshold = usize::try_from(read_script_num(first)?).ok()?;
		let nb_keys = usize::try_from(read_script_num(nb_keys)?).ok()?;
		let pubkeys = keys.iter().map(read_pubkey).collect::<Option<Vec<_>>>()?;
		if pubkeys.len() != nb_keys || threshold == 0 || threshold > nb_keys {
			return None;
		}

		Some(EscrowPolicy { threshold, pubkeys, timeout })
	}

	/// The position of the key in the multisig, which is also the order in
	/// which its signature must be provided.
	pub fn key_position(&self, pubkey: &PublicKey) -> Option<usize> {
		self.pubkeys.iter().position(|pk| pk == pubkey)
	}
}

fn read_pubkey(ins: &Instruction) -> Option<PublicKey> {
	match ins {
		Instruction::PushBytes(b) if b.len() == 33 => PublicKey::from_slice(b.as_bytes()).ok(),
		_ => None,
	}
}

/// Decode a minimally pushed script number.
fn read_script_num(ins: &Instruction) -> Option<i64> {
	match ins {
		Instruction::Op(op) => {
			let code = op.to_u8();
			let one = opcodes::all::OP_PUSHNUM_1.to_u8();
			let sixteen = opcodes::all::OP_PUSHNUM_16.to_u8();
			if code >= one && code <= sixteen {
				Some((code - one + 1) as i64)
			} else if *op == opcodes::all::OP_PUSHNUM_NEG1 {
				Some(-1)
			} else {
				None
			}
		},
		Instruction::PushBytes(b) => {
			let bytes = b.as_bytes();
			if bytes.len() > 4 {
				return None;
			}
			let mut ret = 0i64;
			for (i, byte) in bytes.iter().enumerate() {
				ret |= (*byte as i64) << (8 * i);
			}
			match bytes.last() {
				Some(last) if last & 0x80 != 0 => {
					let mask = 0x80i64 << (8 * (bytes.len() - 1));
					Some(-(ret & !mask))
				},
				_ => Some(ret),
			}
		},
	}
}

/// The relative lock of the timeout branch of an escrow redeem script.
pub fn lock_time_from_redeem_script(script: &Script) -> Option<Sequence> {
	EscrowPolicy::from_redeem_script(script)?.timeout.map(|t| t.sequence)
}

/// Generate the escrow for the given keys.
///
/// A non-zero `timeout` adds a branch that lets `timeout_key` spend alone
/// once the timeout has passed since the escrow was funded.
pub fn generate(
	chain: &dyn Chain,
	pubkeys: &[PublicKey],
	threshold: usize,
	timeout: Duration,
	timeout_key: Option<PublicKey>,
) -> Result<EscrowScript, Error> {
	let timeout = match (timeout_sequence(timeout)?, timeout_key) {
		(None, _) => None,
		(Some(_), None) => return Err(Error::script("a timeout requires a timeout key")),
		(Some(sequence), Some(pubkey)) => Some(EscrowTimeout { sequence, pubkey }),
	};
	let policy = EscrowPolicy::new(pubkeys.to_vec(), threshold, timeout)?;

	let redeem_script = policy.redeem_script();
	let script_pubkey = chain.escrow_script_pubkey(&redeem_script);
	let address = chain.encode_address(&script_pubkey)
		.ok_or_else(|| Error::script("escrow script has no address on this chain"))?;
	trace!("Generated {}-of-{} escrow at {}", threshold, pubkeys.len(), address);

	Ok(EscrowScript { address, script_pubkey, redeem_script })
}
