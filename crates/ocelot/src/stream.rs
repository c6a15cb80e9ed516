//! Block-stream source: message types, durable delivery cursor, and the
//! JSON-RPC polling implementation.
//!
//! The processor depends only on [`BlockStream`]; [`RpcBlockStream`]
//! synthesizes the message protocol by polling `starknet_getEvents` in
//! ascending block order. Acknowledged progress is persisted per named
//! index, so a restart redelivers everything after the last acked block.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use starknet::core::types::{BlockId, EmittedEvent, EventFilter, Felt};
use starknet::core::utils::get_selector_from_name;
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::Provider;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("stream rpc error: {0}")]
    Rpc(String),
    #[error("cannot ack unknown block {0:#x}")]
    UnknownBlock(Felt),
    #[error("invalid event filter: {0}")]
    InvalidFilter(String),
}

/// A raw event as delivered by the stream source.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub from_address: Felt,
    pub data: Vec<Felt>,
}

/// Notifications delivered in increasing block order.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    NewBlock {
        number: u64,
        hash: Felt,
    },
    NewEvents {
        block_number: u64,
        block_hash: Felt,
        events: Vec<BlockEvent>,
    },
}

/// Ordered source of block notifications.
#[async_trait]
pub trait BlockStream: Send {
    /// Next message in block order. `None` when the stream is exhausted.
    async fn next(&mut self) -> Result<Option<StreamMessage>, StreamError>;

    /// Durably advance the delivery cursor past the given block.
    async fn ack(&mut self, block_hash: Felt) -> Result<(), StreamError>;
}

/// Durable description of a named stream: where it starts, what it
/// filters on, and how far it has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub id: String,
    pub start_block: u64,
    /// Event names the index filters on (e.g. `"Transfer"`).
    pub filters: Vec<String>,
    pub last_acked_block: Option<u64>,
}

/// Registry of stream indexes, stored alongside the ledger.
pub struct StreamIndexes {
    conn: Arc<Mutex<Connection>>,
}

impl StreamIndexes {
    /// Create or open the registry.
    pub fn open(db_path: &str) -> Result<Self, StreamError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS stream_indexes (
                id TEXT PRIMARY KEY,
                start_block INTEGER NOT NULL,
                filters TEXT NOT NULL,
                last_acked_block INTEGER
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the index if it does not exist. Returns the stored record
    /// either way; an existing index keeps its cursor.
    pub fn create_index(
        &self,
        id: &str,
        start_block: u64,
        filters: &[String],
    ) -> Result<IndexRecord, StreamError> {
        let filters_json =
            serde_json::to_string(filters).map_err(|e| StreamError::InvalidFilter(e.to_string()))?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO stream_indexes (id, start_block, filters, last_acked_block)
                 VALUES (?1, ?2, ?3, NULL)",
                params![id, start_block, filters_json],
            )?;
        }
        self.get_index(id)?
            .ok_or(StreamError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get_index(&self, id: &str) -> Result<Option<IndexRecord>, StreamError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT start_block, filters, last_acked_block FROM stream_indexes WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<u64>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((start_block, filters_json, last_acked_block)) => {
                let filters = serde_json::from_str(&filters_json)
                    .map_err(|e| StreamError::InvalidFilter(e.to_string()))?;
                Ok(Some(IndexRecord {
                    id: id.to_string(),
                    start_block,
                    filters,
                    last_acked_block,
                }))
            }
        }
    }

    /// Delete and recreate the index with a fresh cursor.
    pub fn reset(
        &self,
        id: &str,
        start_block: u64,
        filters: &[String],
    ) -> Result<IndexRecord, StreamError> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM stream_indexes WHERE id = ?1", params![id])?;
        }
        self.create_index(id, start_block, filters)
    }

    fn record_ack(&self, id: &str, block_number: u64) -> Result<(), StreamError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE stream_indexes SET last_acked_block = ?2 WHERE id = ?1",
            params![id, block_number],
        )?;
        Ok(())
    }
}

/// Blocks scanned per `starknet_getEvents` window.
const BLOCK_BATCH_SIZE: u64 = 1000;
/// Events per RPC page.
const CHUNK_SIZE: u64 = 1000;
/// Delay between polls once caught up to the chain head.
const HEAD_POLL_DELAY: Duration = Duration::from_secs(5);

/// [`BlockStream`] over `starknet_getEvents`, one `NewEvents` message
/// per block that has matching events.
pub struct RpcBlockStream {
    provider: Arc<JsonRpcClient<HttpTransport>>,
    indexes: StreamIndexes,
    index: IndexRecord,
    /// Event selectors derived from the index filters.
    keys: Vec<Felt>,
    next_block: u64,
    pending: VecDeque<StreamMessage>,
    /// Delivered but not yet acknowledged blocks, by hash.
    delivered: HashMap<Felt, u64>,
}

impl RpcBlockStream {
    pub fn new(
        provider: Arc<JsonRpcClient<HttpTransport>>,
        indexes: StreamIndexes,
        index: IndexRecord,
    ) -> Result<Self, StreamError> {
        let keys = index
            .filters
            .iter()
            .map(|name| {
                get_selector_from_name(name).map_err(|_| StreamError::InvalidFilter(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let next_block = index
            .last_acked_block
            .map_or(index.start_block, |acked| acked + 1);

        tracing::info!(
            target: "ocelot::stream",
            index = %index.id,
            from_block = next_block,
            filters = ?index.filters,
            "stream starting"
        );

        Ok(Self {
            provider,
            indexes,
            index,
            keys,
            next_block,
            pending: VecDeque::new(),
            delivered: HashMap::new(),
        })
    }

    /// Scan the next block window and queue one message per block with
    /// matching events. Sleeps when caught up to the chain head.
    async fn fetch_window(&mut self) -> Result<(), StreamError> {
        let head = self
            .provider
            .block_number()
            .await
            .map_err(|e| StreamError::Rpc(e.to_string()))?;

        if self.next_block > head {
            tokio::time::sleep(HEAD_POLL_DELAY).await;
            return Ok(());
        }

        let to_block = (self.next_block + BLOCK_BATCH_SIZE - 1).min(head);
        let filter = EventFilter {
            from_block: Some(BlockId::Number(self.next_block)),
            to_block: Some(BlockId::Number(to_block)),
            address: None,
            keys: Some(vec![self.keys.clone()]),
        };

        let mut events: Vec<EmittedEvent> = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let page = self
                .provider
                .get_events(filter.clone(), continuation_token, CHUNK_SIZE)
                .await
                .map_err(|e| StreamError::Rpc(e.to_string()))?;
            events.extend(page.events);
            continuation_token = page.continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }

        tracing::debug!(
            target: "ocelot::stream",
            from_block = self.next_block,
            to_block,
            events = events.len(),
            "scanned block window"
        );

        // Group into per-block messages, preserving stream order.
        let mut current: Option<(u64, Felt, Vec<BlockEvent>)> = None;
        for event in events {
            // Events without a block id are not accepted yet.
            let (Some(number), Some(hash)) = (event.block_number, event.block_hash) else {
                continue;
            };
            let block_event = BlockEvent {
                from_address: event.from_address,
                data: event.data,
            };
            match current.as_mut() {
                Some((n, _, block_events)) if *n == number => block_events.push(block_event),
                _ => {
                    if let Some((n, h, block_events)) = current.take() {
                        self.push_block(n, h, block_events);
                    }
                    current = Some((number, hash, vec![block_event]));
                }
            }
        }
        if let Some((n, h, block_events)) = current.take() {
            self.push_block(n, h, block_events);
        }

        self.next_block = to_block + 1;
        Ok(())
    }

    fn push_block(&mut self, number: u64, hash: Felt, events: Vec<BlockEvent>) {
        self.delivered.insert(hash, number);
        self.pending.push_back(StreamMessage::NewEvents {
            block_number: number,
            block_hash: hash,
            events,
        });
    }
}

#[async_trait]
impl BlockStream for RpcBlockStream {
    async fn next(&mut self) -> Result<Option<StreamMessage>, StreamError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            self.fetch_window().await?;
        }
    }

    async fn ack(&mut self, block_hash: Felt) -> Result<(), StreamError> {
        let number = self
            .delivered
            .remove(&block_hash)
            .ok_or(StreamError::UnknownBlock(block_hash))?;
        self.indexes.record_ack(&self.index.id, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> Vec<String> {
        vec!["Transfer".to_string()]
    }

    #[test]
    fn create_index_is_create_if_absent() {
        let indexes = StreamIndexes::open(":memory:").unwrap();

        let created = indexes.create_index("nft", 21_000, &filters()).unwrap();
        assert_eq!(created.start_block, 21_000);
        assert_eq!(created.last_acked_block, None);

        // A second create with different parameters keeps the original.
        let kept = indexes.create_index("nft", 99_000, &filters()).unwrap();
        assert_eq!(kept.start_block, 21_000);
    }

    #[test]
    fn missing_index_reads_as_none() {
        let indexes = StreamIndexes::open(":memory:").unwrap();
        assert_eq!(indexes.get_index("nft").unwrap(), None);
    }

    #[test]
    fn ack_advances_the_durable_cursor() {
        let indexes = StreamIndexes::open(":memory:").unwrap();
        indexes.create_index("nft", 0, &filters()).unwrap();

        indexes.record_ack("nft", 100).unwrap();
        indexes.record_ack("nft", 101).unwrap();

        let record = indexes.get_index("nft").unwrap().unwrap();
        assert_eq!(record.last_acked_block, Some(101));
    }

    #[test]
    fn reset_recreates_with_fresh_cursor() {
        let indexes = StreamIndexes::open(":memory:").unwrap();
        indexes.create_index("nft", 0, &filters()).unwrap();
        indexes.record_ack("nft", 500).unwrap();

        let reset = indexes.reset("nft", 21_000, &filters()).unwrap();
        assert_eq!(reset.start_block, 21_000);
        assert_eq!(reset.last_acked_block, None);
    }

    #[test]
    fn filters_roundtrip_through_storage() {
        let indexes = StreamIndexes::open(":memory:").unwrap();
        let wanted = vec!["Transfer".to_string(), "Approval".to_string()];
        indexes.create_index("nft", 0, &wanted).unwrap();

        let record = indexes.get_index("nft").unwrap().unwrap();
        assert_eq!(record.filters, wanted);
    }
}
