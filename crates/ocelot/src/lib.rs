//! Starknet NFT ownership indexer.
//!
//! Consumes `Transfer` events in block order, decides once per contract
//! whether the emitter is an ERC-721, and maintains a bitemporal
//! ownership ledger: every accepted transfer closes the token's current
//! version, inserts its successor, and appends an immutable transfer
//! fact.
//!
//! # Components
//!
//! - [`decode_transfer`]: pure decoding of the two Transfer wire shapes
//! - [`ContractClassifier`]: write-once ERC-721 detection with an LRU
//!   fast cache over the durable `contracts` collection
//! - [`LedgerStore`]: SQLite-backed versioned ownership state
//! - [`BlockProcessor`]: the sequential per-block pipeline
//! - [`RpcBlockStream`] / [`RpcChainReader`]: JSON-RPC collaborators
//!   behind the [`BlockStream`] and [`ChainReader`] seams

pub mod chain;
pub mod classify;
pub mod convert;
pub mod event;
pub mod ledger;
pub mod processor;
pub mod stream;

pub use chain::{CallError, ChainReader, RpcChainReader};
pub use classify::{Contract, ContractClassifier, ContractKind};
pub use event::{decode_transfer, TokenIdKind, Transfer};
pub use ledger::{LedgerError, LedgerStore, TokenVersion, TransferFact};
pub use processor::BlockProcessor;
pub use stream::{
    BlockEvent, BlockStream, IndexRecord, RpcBlockStream, StreamError, StreamIndexes,
    StreamMessage,
};
