
mod spend;
pub use self::spend::*;
mod sync;
pub use self::sync::*;


use bitcoin::BlockHash;
use bitcoin_ext::BlockHeight;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipUpdated {
	pub coin: String,
	pub height: BlockHeight,
	pub hash: BlockHash,
}
impl_slog!(TipUpdated, Debug, "the chain tip has been updated");
