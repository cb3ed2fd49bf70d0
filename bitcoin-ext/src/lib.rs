
extern crate bitcoin as cbitcoin;

mod bitcoin;
pub use bitcoin::{compact_size_len, FeeRateExt, ScriptExt, TransactionExt};


use cbitcoin::FeeRate;


/// Type representing a block height in the bitcoin blockchain.
pub type BlockHeight = u32;

/// Number of confirmations after which a wallet transaction is
/// considered settled.
pub const SETTLED_CONFIRMATIONS: u32 = 6;

/// The dust relay fee bitcoin core uses by default.
pub const DEFAULT_DUST_RELAY_FEE: FeeRate = FeeRate::from_sat_per_kwu(750);
