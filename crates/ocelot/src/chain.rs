//! Read-only chain access for classification probes and block metadata.
//!
//! The pipeline depends on the [`ChainReader`] capability rather than a
//! concrete RPC client so probes can be scripted in tests. The production
//! implementation wraps the Starknet JSON-RPC provider.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use starknet::core::types::{
    BlockId, BlockTag, Felt, FunctionCall, MaybePreConfirmedBlockWithTxHashes,
};
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::{Provider, ProviderError};
use thiserror::Error;

/// Failure kinds for a read-only contract call.
///
/// The classifier treats every variant as "probe did not succeed"; the
/// split exists so logs can tell a revert from a dead endpoint.
#[derive(Debug, Error)]
pub enum CallError {
    /// The contract rejected the call (revert, missing entry point).
    #[error("contract call failed: {0}")]
    Contract(String),
    /// The call never reached a verdict (network or protocol failure).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Read-only access to the chain: contract calls and block headers.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Invoke a read-only entry point at the latest block.
    async fn call(
        &self,
        contract: Felt,
        selector: Felt,
        calldata: Vec<Felt>,
    ) -> Result<Vec<Felt>, CallError>;

    /// Accepted time of a block, unix seconds.
    async fn block_timestamp(&self, block_hash: Felt) -> Result<i64>;
}

/// [`ChainReader`] over the Starknet JSON-RPC provider.
pub struct RpcChainReader {
    provider: Arc<JsonRpcClient<HttpTransport>>,
}

impl RpcChainReader {
    pub fn new(provider: Arc<JsonRpcClient<HttpTransport>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn call(
        &self,
        contract: Felt,
        selector: Felt,
        calldata: Vec<Felt>,
    ) -> Result<Vec<Felt>, CallError> {
        let request = FunctionCall {
            contract_address: contract,
            entry_point_selector: selector,
            calldata,
        };

        self.provider
            .call(request, BlockId::Tag(BlockTag::Latest))
            .await
            .map_err(|e| match e {
                ProviderError::StarknetError(err) => CallError::Contract(err.to_string()),
                other => CallError::Transport(other.to_string()),
            })
    }

    async fn block_timestamp(&self, block_hash: Felt) -> Result<i64> {
        let block = self
            .provider
            .get_block_with_tx_hashes(BlockId::Hash(block_hash))
            .await
            .with_context(|| format!("fetching block {block_hash:#x}"))?;

        match block {
            MaybePreConfirmedBlockWithTxHashes::Block(b) => Ok(b.timestamp as i64),
            MaybePreConfirmedBlockWithTxHashes::PreConfirmedBlock(_) => {
                anyhow::bail!("block {block_hash:#x} is not accepted yet")
            }
        }
    }
}

/// Decode a string returned by a contract call.
///
/// Two formats appear in the wild: a short string (one felt with the
/// bytes packed big-endian) and a long string (a length prefix followed
/// by that many short-string chunks, concatenated in order).
pub fn decode_string_response(data: &[Felt]) -> Option<String> {
    if data.is_empty() {
        return None;
    }

    if data.len() == 1 {
        return felt_to_short_string(data[0]);
    }

    let len: usize = u64::try_from(data[0]).ok()?.try_into().ok()?;
    if len > data.len() - 1 {
        return None;
    }

    let mut out = String::new();
    for chunk in &data[1..=len] {
        out.push_str(&felt_to_short_string(*chunk)?);
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Convert a felt to a short string (up to 31 bytes packed big-endian).
fn felt_to_short_string(felt: Felt) -> Option<String> {
    if felt == Felt::ZERO {
        return None;
    }

    let bytes = felt.to_bytes_be();
    let start = bytes.iter().position(|&b| b != 0)?;

    match std::str::from_utf8(&bytes[start..]) {
        Ok(s) if !s.is_empty() => Some(s.to_string()),
        _ => None,
    }
}
