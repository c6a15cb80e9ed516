//! Ocelot - Starknet NFT ownership indexer
//!
//! Streams Transfer events in block order, classifies the emitting
//! contracts, and maintains a bitemporal ownership ledger in SQLite.
//!
//! # Usage
//!
//! ```bash
//! # First run: create the stream index and follow the chain
//! ocelot-indexer --create-index --from-block 21000
//!
//! # Subsequent runs resume from the last acknowledged block
//! ocelot-indexer
//!
//! # Start over from scratch
//! ocelot-indexer --reset --from-block 21000
//! ```

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config;
use std::sync::Arc;

use ocelot::{
    BlockProcessor, ChainReader, ContractClassifier, LedgerStore, RpcBlockStream, RpcChainReader,
    StreamIndexes,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!("Starting Ocelot NFT indexer");
    tracing::info!("RPC URL: {}", config.rpc_url);
    tracing::info!("Database: {}", config.db_path);
    tracing::info!("Index: {}", config.index_id);

    let ledger = Arc::new(LedgerStore::open(&config.db_path)?);
    let indexes = StreamIndexes::open(&config.db_path)?;

    if config.reset {
        indexes.reset(&config.index_id, config.from_block, &config.filters)?;
        tracing::info!("Stream index reset to block {}", config.from_block);
    } else if config.create_index {
        indexes.create_index(&config.index_id, config.from_block, &config.filters)?;
    }

    let Some(index) = indexes.get_index(&config.index_id)? else {
        bail!(
            "stream index '{}' does not exist; run with --create-index",
            config.index_id
        );
    };

    let provider = Arc::new(starknet::providers::jsonrpc::JsonRpcClient::new(
        starknet::providers::jsonrpc::HttpTransport::new(
            url::Url::parse(&config.rpc_url).context("invalid RPC URL")?,
        ),
    ));

    let chain: Arc<dyn ChainReader> = Arc::new(RpcChainReader::new(provider.clone()));
    let stream = RpcBlockStream::new(provider, indexes, index)?;
    let classifier = ContractClassifier::new(chain.clone(), ledger.clone());
    let mut processor = BlockProcessor::new(stream, chain, classifier, ledger.clone());

    let result = processor.run().await;

    if let Ok(transfer_count) = ledger.count_transfers().await {
        tracing::info!("Total transfers indexed: {}", transfer_count);
    }

    result
}
