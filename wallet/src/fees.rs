//! Fee rates per urgency level.
//!
//! Rates come from the chain source's estimate for the level's block target.
//! When the source has no estimate the configured fallback is used, and no
//! rate ever exceeds the configured maximum.


use std::sync::Arc;

use bitcoin::FeeRate;

use crate::chain::ChainDataSource;
use crate::config::FeeConfig;


/// How urgently a transaction should confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeeLevel {
	Priority,
	Normal,
	Economic,
	/// Twice the priority rate, for child transactions bumping a stuck parent.
	FeeBump,
}

/// Fee rates from the chain source's estimates, bounded by the configuration.
pub struct FeeEstimator {
	source: Arc<dyn ChainDataSource>,
	config: FeeConfig,
}

impl FeeEstimator {
	pub fn new(source: Arc<dyn ChainDataSource>, config: FeeConfig) -> FeeEstimator {
		FeeEstimator { source, config }
	}

	async fn estimate(&self, target: u16, fallback: FeeRate) -> FeeRate {
		let rate = match self.source.estimate_fee(target).await {
			Ok(Some(rate)) => rate,
			Ok(None) => {
				debug!("No fee estimate for a {} block target, using {}", target, fallback);
				fallback
			},
			Err(e) => {
				warn!("Error estimating fee for a {} block target, using {}: {:#}", target, fallback, e);
				fallback
			},
		};
		rate.max(FeeRate::BROADCAST_MIN).min(self.config.max)
	}

	pub async fn fee_rate(&self, level: FeeLevel) -> FeeRate {
		let cfg = &self.config;
		match level {
			FeeLevel::Priority => self.estimate(cfg.priority_target, cfg.priority).await,
			FeeLevel::Normal => self.estimate(cfg.normal_target, cfg.normal).await,
			FeeLevel::Economic => self.estimate(cfg.economic_target, cfg.economic).await,
			FeeLevel::FeeBump => {
				let priority = self.estimate(cfg.priority_target, cfg.priority).await;
				FeeRate::from_sat_per_kwu(priority.to_sat_per_kwu().saturating_mul(2)).min(cfg.max)
			},
		}
	}
}
