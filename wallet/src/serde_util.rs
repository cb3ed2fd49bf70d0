//! Serde helpers for the human-readable values of the config file.

use bitcoin::FeeRate;
use serde::{de, Deserialize, Deserializer, Serializer};

use bitcoin_ext::FeeRateExt;


/// Parse a fee rate written as `<n>sat/vb`, fractions allowed, or as
/// `<n>sat/kwu`.
pub fn parse_fee_rate(s: &str) -> Option<FeeRate> {
	let s = s.trim();
	if let Some(vb) = s.strip_suffix("sat/vb") {
		FeeRate::from_sat_per_vb_decimal_checked(vb.trim().parse().ok()?)
	} else if let Some(kwu) = s.strip_suffix("sat/kwu") {
		kwu.trim().parse().ok().map(FeeRate::from_sat_per_kwu)
	} else {
		None
	}
}

/// Write a fee rate in sat/vb when that's exact and in sat/kwu otherwise.
pub fn format_fee_rate(fee_rate: FeeRate) -> String {
	let kwu = fee_rate.to_sat_per_kwu();
	if kwu % 250 == 0 {
		format!("{}sat/vb", kwu / 250)
	} else {
		format!("{}sat/kwu", kwu)
	}
}

pub mod fee_rate {
	use super::*;

	pub fn serialize<S: Serializer>(fee_rate: &FeeRate, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&format_fee_rate(*fee_rate))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FeeRate, D::Error> {
		let s = String::deserialize(d)?;
		parse_fee_rate(&s).ok_or_else(|| de::Error::custom(format!(
			"invalid fee rate '{}', expected <n>sat/vb or <n>sat/kwu", s,
		)))
	}
}

/// Durations like `10m` or `6h`.
pub mod duration {
	use super::*;

	use std::time::Duration;

	pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&humantime::format_duration(*duration).to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let s = String::deserialize(d)?;
		humantime::parse_duration(&s).map_err(de::Error::custom)
	}
}
