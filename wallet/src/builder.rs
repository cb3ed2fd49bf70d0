//! Building and signing the wallet's own spends.
//!
//! The builder never talks to the chain source. Fee rates and the tip height
//! are handed in by the caller, so failures of this module are always
//! decided locally.

use std::sync::Arc;

use anyhow::Context;
use bitcoin::{Amount, Script, ScriptBuf, Transaction, TxOut};
use bitcoin::secp256k1::Keypair;
use bitcoin::FeeRate;

use bitcoin_ext::{BlockHeight, FeeRateExt, TransactionExt};
use escrow::{Chain, EscrowSpend, Error, SpendPath, TransactionInput, TransactionOutput};
use escrow::multisig;
use escrow::select::{self, Coin, Funded};
use escrow::sign::sign_key_input;
use escrow::weight::InputClass;

use crate::keys::KeyManager;
use crate::persist::{Datastore, KeyPurpose};


/// The number of confirmations of an output confirmed at `height`.
pub fn confirmations(tip: BlockHeight, height: BlockHeight) -> u32 {
	if height == 0 || height > tip {
		0
	} else {
		tip - height + 1
	}
}

pub struct TransactionBuilder {
	db: Arc<dyn Datastore>,
	keys: Arc<KeyManager>,
	chain: Arc<dyn Chain>,
	max_inputs: usize,
}

impl TransactionBuilder {
	pub fn new(
		db: Arc<dyn Datastore>,
		keys: Arc<KeyManager>,
		chain: Arc<dyn Chain>,
		max_inputs: usize,
	) -> TransactionBuilder {
		TransactionBuilder { db, keys, chain, max_inputs }
	}

	/// Fail with [Error::DustAmount] if a payment of `amount` to `script`
	/// would not be relayed.
	pub fn check_dust(&self, amount: Amount, script: &Script) -> Result<(), Error> {
		let threshold = self.chain.dust_threshold(script);
		if amount < threshold {
			return Err(Error::DustAmount { amount, threshold });
		}
		Ok(())
	}

	/// The outputs the wallet holds a key for.
	pub fn spendable_coins(&self, tip: BlockHeight) -> anyhow::Result<Vec<Coin>> {
		let mut ret = Vec::new();
		for utxo in self.db.get_utxos()? {
			if utxo.watch_only || self.keys.key_for_script(&utxo.script_pubkey)?.is_none() {
				continue;
			}
			ret.push(Coin {
				outpoint: utxo.outpoint,
				confirmations: confirmations(tip, utxo.height),
				txout: TxOut { value: utxo.value, script_pubkey: utxo.script_pubkey },
			});
		}
		Ok(ret)
	}

	fn change_script(&self) -> anyhow::Result<ScriptBuf> {
		let key = self.keys.current_key(KeyPurpose::Internal)?;
		Ok(self.chain.key_script(&key.public_key()))
	}

	/// Sign every input with the wallet key owning its spent output.
	fn sign(&self, funded: &mut Funded) -> anyhow::Result<()> {
		for (idx, prevout) in funded.prevouts.iter().enumerate() {
			let key = self.keys.key_for_script(&prevout.script_pubkey)?.ok_or_else(|| {
				Error::SigningFailure(format!("no key for input {} ({})", idx, prevout.script_pubkey))
			})?;
			sign_key_input(self.chain.script_kind(), &mut funded.tx, idx, prevout, &key)?;
		}
		Ok(())
	}

	fn log_spend(&self, funded: &Funded, amount: Amount) {
		slog!(SpendBuilt,
			txid: funded.tx.compute_txid(),
			nb_inputs: funded.tx.input.len(),
			amount,
			fee: funded.fee,
			has_change: funded.change.is_some(),
		);
	}

	/// Build and sign a payment of `amount` to `destination`.
	///
	/// Change goes to the current internal key.
	pub fn build(
		&self,
		amount: Amount,
		destination: ScriptBuf,
		fee_rate: FeeRate,
		tip: BlockHeight,
	) -> anyhow::Result<Funded> {
		self.check_dust(amount, &destination)?;
		let coins = self.spendable_coins(tip)?;
		let change = self.change_script()?;
		let output = vec![TxOut { value: amount, script_pubkey: destination }];
		let mut funded = select::fund_transaction(
			self.chain.as_ref(), &coins, output, &change, fee_rate, self.max_inputs,
		)?;
		self.sign(&mut funded)?;
		self.log_spend(&funded, amount);
		Ok(funded)
	}

	/// Build and sign a transaction moving all the given coins to `destination`.
	pub fn build_sweep(
		&self,
		coins: &[Coin],
		destination: ScriptBuf,
		fee_rate: FeeRate,
	) -> anyhow::Result<Funded> {
		let mut funded = select::sweep_coins(self.chain.as_ref(), coins, destination, fee_rate)?;
		self.sign(&mut funded)?;
		self.log_spend(&funded, funded.tx.output_value());
		Ok(funded)
	}

	/// Spend every spendable coin to `destination`.
	pub fn build_spend_all(
		&self,
		destination: ScriptBuf,
		fee_rate: FeeRate,
		tip: BlockHeight,
	) -> anyhow::Result<Funded> {
		let coins = self.spendable_coins(tip)?;
		if coins.is_empty() {
			return Err(Error::InsufficientFunds { needed: Amount::ONE_SAT, available: Amount::ZERO })?;
		}
		self.build_sweep(&coins, destination, fee_rate)
	}

	/// The fee a payment of `amount` would pay, with a maximal-length destination.
	pub fn estimate_spend_fee(
		&self,
		amount: Amount,
		fee_rate: FeeRate,
		tip: BlockHeight,
	) -> anyhow::Result<Amount> {
		let coins = self.spendable_coins(tip)?;
		let change = self.change_script()?;
		let output = vec![TxOut { value: amount, script_pubkey: self.chain.dummy_destination() }];
		let funded = select::fund_transaction(
			self.chain.as_ref(), &coins, output, &change, fee_rate, self.max_inputs,
		)?;
		funded.input_value().checked_sub(funded.tx.output_value())
			.context("transaction outputs exceed its inputs")
	}

	/// The fee for plain key inputs paying the given outputs.
	pub fn estimate_fee(
		&self,
		nb_inputs: usize,
		outputs: &[TransactionOutput],
		fee_rate: FeeRate,
	) -> anyhow::Result<Amount> {
		let scripts = outputs.iter()
			.map(|o| self.chain.decode_address(&o.address))
			.collect::<Result<Vec<_>, _>>()?;
		let scripts = scripts.iter().map(|s| s.as_script()).collect::<Vec<_>>();
		let inputs = vec![InputClass::Key; nb_inputs];
		Ok(fee_rate.fee_for_weight(self.chain.estimate_weight(&inputs, &scripts)))
	}

	/// Spend outputs the wallet doesn't track with a single key.
	///
	/// Without a redeem script the inputs are plain key outputs of `key`.
	/// With one they are escrow outputs, released through the timeout branch
	/// if `key` is the escrow's timeout key and through the multisig branch
	/// otherwise.
	pub fn sweep(
		&self,
		inputs: &[TransactionInput],
		address: &str,
		key: &Keypair,
		redeem_script: Option<&Script>,
		fee_rate: FeeRate,
	) -> anyhow::Result<Transaction> {
		if inputs.is_empty() {
			return Err(Error::NotFound("no inputs to sweep".into()))?;
		}
		let destination = self.chain.decode_address(address)?;

		let tx = match redeem_script {
			None => {
				let key_script = self.chain.key_script(&key.public_key());
				let coins = inputs.iter().map(|i| Coin {
					outpoint: i.outpoint,
					txout: TxOut { value: i.value, script_pubkey: key_script.clone() },
					confirmations: 0,
				}).collect::<Vec<_>>();
				let mut funded = select::sweep_coins(self.chain.as_ref(), &coins, destination, fee_rate)?;
				for (idx, prevout) in funded.prevouts.iter().enumerate() {
					sign_key_input(self.chain.script_kind(), &mut funded.tx, idx, prevout, key)?;
				}
				funded.tx
			},
			Some(redeem) => {
				let total = inputs.iter().map(|i| i.value).sum::<Amount>();
				let outputs = [TransactionOutput { address: address.to_owned(), value: total }];
				let spend = EscrowSpend::new(inputs, &outputs, redeem, fee_rate);
				let policy = spend.policy()?;
				let path = match policy.timeout {
					Some(t) if t.pubkey == key.public_key() => SpendPath::Timeout,
					_ => SpendPath::Multisig,
				};
				let tx = multisig::sign_alone(self.chain.as_ref(), &spend.with_path(path), key)?;
				if let Some(out) = tx.output.first() {
					self.check_dust(out.value, &destination)?;
				}
				tx
			},
		};

		slog!(AddressSwept,
			txid: tx.compute_txid(),
			nb_inputs: tx.input.len(),
			escrow: redeem_script.is_some(),
			amount: tx.output_value(),
		);
		Ok(tx)
	}
}
