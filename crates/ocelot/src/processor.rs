//! Per-block orchestration: decode, classify, apply, acknowledge.

use std::sync::Arc;

use anyhow::{Context, Result};
use starknet::core::types::Felt;

use crate::chain::ChainReader;
use crate::classify::{ContractClassifier, ContractKind};
use crate::event::decode_transfer;
use crate::ledger::LedgerStore;
use crate::stream::{BlockEvent, BlockStream, StreamMessage};

/// Drives the pipeline: one block at a time, one event at a time.
///
/// Per-event decode rejections and probe failures are contained here;
/// ledger, stream and block-metadata failures terminate the run so the
/// operator restarts from the last acknowledged block.
pub struct BlockProcessor<S> {
    stream: S,
    chain: Arc<dyn ChainReader>,
    classifier: ContractClassifier,
    ledger: Arc<LedgerStore>,
}

impl<S: BlockStream> BlockProcessor<S> {
    pub fn new(
        stream: S,
        chain: Arc<dyn ChainReader>,
        classifier: ContractClassifier,
        ledger: Arc<LedgerStore>,
    ) -> Self {
        Self {
            stream,
            chain,
            classifier,
            ledger,
        }
    }

    /// Consume the stream until it ends. Each delivered block is either
    /// fully applied and acknowledged, or not acknowledged at all.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.stream.next().await? {
                None => {
                    tracing::info!(target: "ocelot::processor", "block stream ended");
                    return Ok(());
                }
                Some(StreamMessage::NewBlock { number, hash }) => {
                    tracing::debug!(
                        target: "ocelot::processor",
                        block_number = number,
                        block_hash = %format!("{hash:#x}"),
                        "new block header"
                    );
                }
                Some(StreamMessage::NewEvents {
                    block_number,
                    block_hash,
                    events,
                }) => {
                    self.process_block(block_number, block_hash, &events).await?;
                    self.stream
                        .ack(block_hash)
                        .await
                        .context("acknowledging block")?;
                }
            }
        }
    }

    async fn process_block(
        &self,
        block_number: u64,
        block_hash: Felt,
        events: &[BlockEvent],
    ) -> Result<()> {
        let timestamp = self
            .chain
            .block_timestamp(block_hash)
            .await
            .with_context(|| format!("fetching timestamp of block {block_number}"))?;

        tracing::debug!(
            target: "ocelot::processor",
            block_number,
            events = events.len(),
            "processing block"
        );

        for event in events {
            let Some(transfer) = decode_transfer(&event.data) else {
                tracing::debug!(
                    target: "ocelot::processor",
                    contract = %format!("{:#x}", event.from_address),
                    data_len = event.data.len(),
                    block_number,
                    "skipping event with unexpected shape"
                );
                continue;
            };

            let kind = self
                .classifier
                .classify(event.from_address, &transfer)
                .await?;
            if kind != ContractKind::Erc721 {
                continue;
            }

            self.ledger
                .apply_transfer(event.from_address, block_number, timestamp, &transfer)
                .await?;
        }

        Ok(())
    }
}
