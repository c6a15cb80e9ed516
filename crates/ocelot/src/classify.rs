//! Write-once contract classification with a bounded fast cache.
//!
//! A contract is classified the first time one of its Transfer events is
//! seen. The decision is cached in a fixed-capacity LRU and persisted in
//! the `contracts` collection; the durable row is the source of truth on
//! every fast-cache miss, so classification survives restarts. A cached
//! address is never probed again, even if a later probe would disagree.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use starknet::core::types::Felt;
use starknet::macros::selector;

use crate::chain::{decode_string_response, ChainReader};
use crate::event::Transfer;
use crate::ledger::LedgerStore;

const SUPPORTS_INTERFACE: Felt = selector!("supportsInterface");
const TOKEN_URI: Felt = selector!("tokenURI");
const NAME: Felt = selector!("name");

/// Default capacity of the in-process fast cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Classification of an emitting contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    /// Never observed before; no durable row exists.
    Unclassified,
    Erc721,
    Other,
}

impl ContractKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::Erc721 => "erc721",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "erc721" => Self::Erc721,
            "other" => Self::Other,
            _ => Self::Unclassified,
        }
    }
}

/// A classified contract as persisted in the `contracts` collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub address: Felt,
    pub kind: ContractKind,
    /// Only ever present for ERC-721 contracts.
    pub name: Option<String>,
}

/// Classifies emitting contracts, memoized per address.
///
/// Lookup order: fast cache, durable store, on-chain probes. The probe
/// result is persisted before it is returned, so a given address is
/// probed at most once for the lifetime of the store.
pub struct ContractClassifier {
    chain: Arc<dyn ChainReader>,
    store: Arc<LedgerStore>,
    cache: Mutex<LruCache<Felt, ContractKind>>,
}

impl ContractClassifier {
    pub fn new(chain: Arc<dyn ChainReader>, store: Arc<LedgerStore>) -> Self {
        Self::with_cache_capacity(chain, store, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        chain: Arc<dyn ChainReader>,
        store: Arc<LedgerStore>,
        capacity: usize,
    ) -> Self {
        Self {
            chain,
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Classify `address`, probing it with the triggering transfer's
    /// token id if no cached decision exists.
    ///
    /// Probe failures are absorbed as negative signals and never
    /// propagate; only durable-store errors do.
    pub async fn classify(&self, address: Felt, transfer: &Transfer) -> Result<ContractKind> {
        if let Some(kind) = self.cache.lock().unwrap().get(&address) {
            return Ok(kind);
        }

        if let Some(contract) = self.store.get_contract(address).await? {
            self.cache.lock().unwrap().insert(address, contract.kind);
            return Ok(contract.kind);
        }

        let contract = self.probe(address, transfer).await;
        self.store.insert_contract(&contract).await?;
        self.cache.lock().unwrap().insert(address, contract.kind);

        tracing::info!(
            target: "ocelot::classify",
            contract = %format!("{address:#x}"),
            kind = contract.kind.as_str(),
            name = ?contract.name,
            "classified contract"
        );

        Ok(contract.kind)
    }

    async fn probe(&self, address: Felt, transfer: &Transfer) -> Contract {
        let is_erc721 = self.supports_erc721_interface(address).await
            || self.token_uri_resolves(address, transfer).await;

        if !is_erc721 {
            return Contract {
                address,
                kind: ContractKind::Other,
                name: None,
            };
        }

        Contract {
            address,
            kind: ContractKind::Erc721,
            name: self.contract_name(address).await,
        }
    }

    /// ERC-165 check: `supportsInterface(0x80ac58cd)` returning exactly
    /// the true sentinel.
    async fn supports_erc721_interface(&self, address: Felt) -> bool {
        let interface_id = Felt::from(0x80ac58cdu64);
        match self
            .chain
            .call(address, SUPPORTS_INTERFACE, vec![interface_id])
            .await
        {
            Ok(ret) => ret == [Felt::ONE],
            Err(e) => {
                tracing::debug!(
                    target: "ocelot::classify",
                    contract = %format!("{address:#x}"),
                    error = %e,
                    "supportsInterface probe failed"
                );
                false
            }
        }
    }

    /// Fallback check: a `tokenURI` call that succeeds at all, using the
    /// token id encoding the triggering event carried.
    async fn token_uri_resolves(&self, address: Felt, transfer: &Transfer) -> bool {
        match self
            .chain
            .call(address, TOKEN_URI, transfer.token_id_calldata())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(
                    target: "ocelot::classify",
                    contract = %format!("{address:#x}"),
                    error = %e,
                    "tokenURI probe failed"
                );
                false
            }
        }
    }

    /// `name()` probe. Failure is tolerated; it is not a classification
    /// signal.
    async fn contract_name(&self, address: Felt) -> Option<String> {
        match self.chain.call(address, NAME, Vec::new()).await {
            Ok(ret) => decode_string_response(&ret),
            Err(e) => {
                tracing::debug!(
                    target: "ocelot::classify",
                    contract = %format!("{address:#x}"),
                    error = %e,
                    "name probe failed"
                );
                None
            }
        }
    }
}

/// Fixed-capacity map with least-recently-used eviction.
///
/// Capacity is small (about a hundred entries), so linear scans are
/// cheaper than maintaining a separate ordering structure.
struct LruCache<K: PartialEq + Copy, V: Copy> {
    capacity: usize,
    entries: VecDeque<(K, V)>,
}

impl<K: PartialEq + Copy, V: Copy> LruCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(pos)?;
        self.entries.push_back(entry);
        Some(entry.1)
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries.remove(pos);
        }
        self.entries.push_back((key, value));
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    #[cfg(test)]
    fn contains(&self, key: &K) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }
}
