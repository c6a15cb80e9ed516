//! Configuration for the NFT indexer

use clap::Parser;

/// NFT ownership indexer for Starknet
///
/// Follows Transfer events, classifies emitting contracts as ERC-721 or
/// not, and maintains a versioned ownership ledger.
#[derive(Parser, Debug)]
#[command(name = "ocelot-indexer")]
#[command(about = "Index ERC-721 ownership on Starknet", long_about = None)]
pub struct Config {
    /// Starknet RPC URL
    #[arg(
        long,
        env = "STARKNET_RPC_URL",
        default_value = "https://api.cartridge.gg/x/starknet/mainnet"
    )]
    pub rpc_url: String,

    /// Database path for the ledger and the stream cursor
    #[arg(long, default_value = "./ocelot.db")]
    pub db_path: String,

    /// Stream index identifier
    #[arg(long, default_value = "ocelot")]
    pub index_id: String,

    /// Block the index starts from when first created
    #[arg(long, default_value = "0")]
    pub from_block: u64,

    /// Event names the stream filters on (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "Transfer")]
    pub filters: Vec<String>,

    /// Create the stream index if it does not exist
    #[arg(long)]
    pub create_index: bool,

    /// Delete and recreate the stream index, restarting from --from-block
    #[arg(long)]
    pub reset: bool,
}
