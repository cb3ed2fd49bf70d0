
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{FeeRate, Network};
use config::{Environment, File};

use bitcoin_ext::DEFAULT_DUST_RELAY_FEE;
use escrow::{BitcoinChain, ScriptKind};
use escrow::select::MAX_INPUTS;

use crate::serde_util;


/// Fee rates used when the chain source has no estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
	#[serde(with = "serde_util::fee_rate")]
	pub priority: FeeRate,
	#[serde(with = "serde_util::fee_rate")]
	pub normal: FeeRate,
	#[serde(with = "serde_util::fee_rate")]
	pub economic: FeeRate,
	/// No fee rate used by the wallet ever exceeds this.
	#[serde(with = "serde_util::fee_rate")]
	pub max: FeeRate,

	/// Confirmation targets, in blocks, asked for to the chain source.
	pub priority_target: u16,
	pub normal_target: u16,
	pub economic_target: u16,
}

impl Default for FeeConfig {
	fn default() -> FeeConfig {
		FeeConfig {
			priority: FeeRate::from_sat_per_vb_u32(50),
			normal: FeeRate::from_sat_per_vb_u32(40),
			economic: FeeRate::from_sat_per_vb_u32(20),
			max: FeeRate::from_sat_per_vb_u32(200),
			priority_target: 1,
			normal_target: 3,
			economic_target: 6,
		}
	}
}

/// Configuration of a wallet instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
	pub network: Network,
	/// The output script templates used for keys and escrows.
	pub script_kind: ScriptKind,
	#[serde(with = "serde_util::fee_rate")]
	pub dust_relay_fee: FeeRate,
	pub fees: FeeConfig,

	/// Interval between full reconciliations with the chain source.
	#[serde(with = "serde_util::duration")]
	pub resync_interval: Duration,
	/// Age after which an unconfirmed transaction is reported dead.
	#[serde(with = "serde_util::duration")]
	pub dead_transaction_age: Duration,
	/// Number of unused keys kept ahead of the last used one.
	pub key_lookahead: usize,
	pub max_inputs: usize,
}

impl Config {
	pub fn network_default(network: Network) -> Config {
		Config {
			network,
			script_kind: ScriptKind::Witness,
			dust_relay_fee: DEFAULT_DUST_RELAY_FEE,
			fees: FeeConfig::default(),
			resync_interval: Duration::from_secs(10 * 60),
			dead_transaction_age: Duration::from_secs(6 * 60 * 60),
			key_lookahead: 20,
			max_inputs: MAX_INPUTS,
		}
	}

	fn load_with_custom_env(
		network: Network,
		config_file: Option<&Path>,
		#[cfg(test)]
		custom_env: Option<std::collections::HashMap<String, String>>,
	) -> anyhow::Result<Self> {
		// We'll add three layers of config:
		// - the network defaults
		// - the config file passed in this function, if any
		// - environment variables (prefixed with `MWALLET_`)

		let defaults = config::Config::try_from(&Self::network_default(network))
			.context("error serializing default config")?;
		let mut builder = config::Config::builder().add_source(defaults);

		if let Some(file) = config_file {
			builder = builder.add_source(File::from(file));
		}

		let env = Environment::with_prefix("MWALLET")
			.separator("__")
			.try_parsing(true);
		#[cfg(test)]
		let env = env.source(custom_env);
		builder = builder.add_source(env);

		let raw_cfg = builder.build().context("error building config")?;
		let cfg = raw_cfg.try_deserialize::<Config>().context("error parsing config")?;
		cfg.validate()?;
		Ok(cfg)
	}

	/// Load the config for the network, layering the optional config file
	/// and `MWALLET_*` environment variables over the network defaults.
	pub fn load(network: Network, config_file: Option<&Path>) -> anyhow::Result<Self> {
		Self::load_with_custom_env(network, config_file, #[cfg(test)] None)
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		let fees = &self.fees;
		if fees.priority > fees.max || fees.normal > fees.max || fees.economic > fees.max {
			bail!("default fee rates must not exceed the max fee rate of {}", fees.max);
		}
		if fees.priority_target == 0 || fees.normal_target == 0 || fees.economic_target == 0 {
			bail!("fee confirmation targets must be at least one block");
		}
		if self.max_inputs == 0 {
			bail!("max_inputs must be positive");
		}
		if self.resync_interval.is_zero() {
			bail!("resync_interval must be positive");
		}
		Ok(())
	}

	/// The chain capabilities for this configuration.
	pub fn chain(&self) -> BitcoinChain {
		BitcoinChain::new(self.network, self.script_kind)
			.with_dust_relay_fee(self.dust_relay_fee)
	}

	/// Write the config into the writer.
	pub fn write_into(&self, writer: &mut dyn io::Write) -> anyhow::Result<()> {
		let s = toml::to_string_pretty(self).context("config serialization error")?;
		writer.write_all(s.as_bytes()).context("error writing config to writer")?;
		Ok(())
	}
}


#[cfg(test)]
mod test {
	use std::collections::HashMap;

	use super::*;

	const DEFAULT_CONFIG_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/mwallet.default.toml");

	#[test]
	fn parse_validate_default_config_file() {
		let cfg = Config::load(Network::Regtest, Some(Path::new(DEFAULT_CONFIG_PATH)))
			.expect("error loading config");
		assert_eq!(cfg, Config::network_default(Network::Regtest));
	}

	#[test]
	fn defaults_without_file() {
		let cfg = Config::load_with_custom_env(Network::Signet, None, Some(HashMap::new())).unwrap();
		assert_eq!(cfg, Config::network_default(Network::Signet));
	}

	#[test]
	fn environment_overrides() {
		let env = [
			("MWALLET_SCRIPT_KIND", "legacy"),
			("MWALLET_FEES__MAX", "100sat/vb"),
			("MWALLET_FEES__PRIORITY_TARGET", "2"),
			("MWALLET_RESYNC_INTERVAL", "30s"),
			("MWALLET_KEY_LOOKAHEAD", "5"),
		].into_iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect::<HashMap<_, _>>();

		let cfg = Config::load_with_custom_env(Network::Regtest, None, Some(env)).unwrap();
		assert_eq!(cfg.script_kind, ScriptKind::Legacy);
		assert_eq!(cfg.fees.max, FeeRate::from_sat_per_vb_u32(100));
		assert_eq!(cfg.fees.priority_target, 2);
		assert_eq!(cfg.fees.normal, FeeRate::from_sat_per_vb_u32(40));
		assert_eq!(cfg.resync_interval, Duration::from_secs(30));
		assert_eq!(cfg.key_lookahead, 5);
	}

	#[test]
	fn invalid_config_is_rejected() {
		let env = [("MWALLET_FEES__MAX", "10sat/vb")].into_iter()
			.map(|(k, v)| (k.to_owned(), v.to_owned()))
			.collect::<HashMap<_, _>>();
		Config::load_with_custom_env(Network::Regtest, None, Some(env))
			.expect_err("defaults exceed the max fee rate");
	}

	#[test]
	fn write_and_reload() {
		let mut cfg = Config::network_default(Network::Testnet);
		cfg.dead_transaction_age = Duration::from_secs(3600);

		let mut buf = Vec::new();
		cfg.write_into(&mut buf).unwrap();
		let parsed = toml::from_str::<Config>(std::str::from_utf8(&buf).unwrap()).unwrap();
		assert_eq!(parsed, cfg);
	}
}
