//! Bitemporal ownership ledger over SQLite.
//!
//! Four collections: `contracts` (write-once classifications), `tokens`
//! (versioned ownership, one `valid_to IS NULL` row per token),
//! `token_metadata` (placeholders for the external metadata fetcher) and
//! `transfers` (append-only facts). Addresses and token ids are 32-byte
//! big-endian blobs.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use starknet::core::types::{Felt, U256};
use thiserror::Error;

use crate::classify::{Contract, ContractKind};
use crate::convert::{
    blob_to_felt, blob_to_owners, blob_to_u256, felt_to_blob, owners_to_blob, u256_to_blob,
};
use crate::event::Transfer;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// One version of a token's ownership state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenVersion {
    pub owners: Vec<Felt>,
    /// Wall-clock timestamp of the source block, unix seconds.
    pub updated_at: i64,
    pub valid_from: u64,
    /// `None` marks the current version.
    pub valid_to: Option<u64>,
}

/// An immutable transfer fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFact {
    pub contract_address: Felt,
    pub token_id: U256,
    pub from: Felt,
    pub to: Felt,
    pub created_at: i64,
    pub valid_from: u64,
}

/// The shared durable store: ownership ledger plus the `contracts`
/// collection backing the classifier.
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    /// Create or open the database.
    pub fn open(db_path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contracts (
                contract_address BLOB PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_address BLOB NOT NULL,
                token_id BLOB NOT NULL,
                owners BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                valid_from INTEGER NOT NULL,
                valid_to INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_key
                ON tokens(contract_address, token_id, valid_from);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_current
                ON tokens(contract_address, token_id) WHERE valid_to IS NULL;

            CREATE TABLE IF NOT EXISTS token_metadata (
                contract_address BLOB NOT NULL,
                token_id BLOB NOT NULL,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_token_metadata_key
                ON token_metadata(contract_address, token_id);

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_address BLOB NOT NULL,
                token_id BLOB NOT NULL,
                from_addr BLOB NOT NULL,
                to_addr BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                valid_from INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transfers_key
                ON transfers(contract_address, token_id, valid_from);",
        )?;

        tracing::info!(target: "ocelot::ledger", db_path = %db_path, "ledger database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ===== contracts =====

    pub async fn get_contract(&self, address: Felt) -> Result<Option<Contract>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT kind, name FROM contracts WHERE contract_address = ?1",
                params![felt_to_blob(address)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(kind, name)| Contract {
            address,
            kind: ContractKind::parse(&kind),
            name,
        }))
    }

    /// Persist a classification. Write-once: callers only insert for
    /// addresses with no existing row.
    pub async fn insert_contract(&self, contract: &Contract) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO contracts (contract_address, kind, name) VALUES (?1, ?2, ?3)",
            params![
                felt_to_blob(contract.address),
                contract.kind.as_str(),
                contract.name
            ],
        )?;
        Ok(())
    }

    // ===== tokens / transfers =====

    /// Apply one transfer as a single atomic ledger transition.
    ///
    /// Closes the token's current version (if any), inserts the
    /// successor version and the immutable transfer fact. Must be called
    /// in stream order; the block number is the sole ordering authority.
    pub async fn apply_transfer(
        &self,
        contract_address: Felt,
        block_number: u64,
        block_timestamp: i64,
        transfer: &Transfer,
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let contract_blob = felt_to_blob(contract_address);
        let token_blob = u256_to_blob(transfer.token_id);

        // Close the current version, capturing its owners.
        let current: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT id, owners FROM tokens
                 WHERE contract_address = ?1 AND token_id = ?2 AND valid_to IS NULL",
                params![contract_blob, token_blob],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let before_owners = match current {
            Some((id, owners_blob)) => {
                tx.execute(
                    "UPDATE tokens SET valid_to = ?1 WHERE id = ?2",
                    params![block_number, id],
                )?;
                blob_to_owners(&owners_blob)
            }
            None => {
                // First observed activity for this token; leave a marker
                // for the external metadata fetcher.
                tx.execute(
                    "INSERT INTO token_metadata (contract_address, token_id, status)
                     VALUES (?1, ?2, 'missing')",
                    params![contract_blob, token_blob],
                )?;
                Vec::new()
            }
        };

        if before_owners.len() > 1 {
            tracing::warn!(
                target: "ocelot::ledger",
                contract = %format!("{contract_address:#x}"),
                token_id = ?transfer.token_id,
                block_number,
                owners = ?before_owners.iter().map(|o| format!("{o:#x}")).collect::<Vec<_>>(),
                "token has multiple owners"
            );
        }

        // Drop the sender and any stale entry for the recipient, then
        // append the recipient.
        let mut after_owners: Vec<Felt> = before_owners
            .into_iter()
            .filter(|owner| *owner != transfer.from && *owner != transfer.to)
            .collect();
        after_owners.push(transfer.to);

        tx.execute(
            "INSERT INTO tokens (contract_address, token_id, owners, updated_at, valid_from, valid_to)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                contract_blob,
                token_blob,
                owners_to_blob(&after_owners),
                block_timestamp,
                block_number
            ],
        )?;

        tx.execute(
            "INSERT INTO transfers (contract_address, token_id, from_addr, to_addr, created_at, valid_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contract_blob,
                token_blob,
                felt_to_blob(transfer.from),
                felt_to_blob(transfer.to),
                block_timestamp,
                block_number
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// The current (`valid_to IS NULL`) version of a token, if any.
    pub async fn current_token(
        &self,
        contract_address: Felt,
        token_id: U256,
    ) -> Result<Option<TokenVersion>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT owners, updated_at, valid_from, valid_to FROM tokens
                 WHERE contract_address = ?1 AND token_id = ?2 AND valid_to IS NULL",
                params![felt_to_blob(contract_address), u256_to_blob(token_id)],
                Self::token_version_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every version of a token, ordered by `valid_from`.
    pub async fn token_versions(
        &self,
        contract_address: Felt,
        token_id: U256,
    ) -> Result<Vec<TokenVersion>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT owners, updated_at, valid_from, valid_to FROM tokens
             WHERE contract_address = ?1 AND token_id = ?2
             ORDER BY valid_from, id",
        )?;
        let rows = stmt.query_map(
            params![felt_to_blob(contract_address), u256_to_blob(token_id)],
            Self::token_version_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Transfer facts for a token, ordered by `valid_from`.
    pub async fn transfers_for_token(
        &self,
        contract_address: Felt,
        token_id: U256,
    ) -> Result<Vec<TransferFact>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT contract_address, token_id, from_addr, to_addr, created_at, valid_from
             FROM transfers
             WHERE contract_address = ?1 AND token_id = ?2
             ORDER BY valid_from, id",
        )?;
        let rows = stmt.query_map(
            params![felt_to_blob(contract_address), u256_to_blob(token_id)],
            |row| {
                Ok(TransferFact {
                    contract_address: blob_to_felt(&row.get::<_, Vec<u8>>(0)?),
                    token_id: blob_to_u256(&row.get::<_, Vec<u8>>(1)?),
                    from: blob_to_felt(&row.get::<_, Vec<u8>>(2)?),
                    to: blob_to_felt(&row.get::<_, Vec<u8>>(3)?),
                    created_at: row.get(4)?,
                    valid_from: row.get(5)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Total number of transfer facts.
    pub async fn count_transfers(&self) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Metadata placeholder statuses recorded for a token.
    pub async fn metadata_statuses(
        &self,
        contract_address: Felt,
        token_id: U256,
    ) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status FROM token_metadata
             WHERE contract_address = ?1 AND token_id = ?2",
        )?;
        let rows = stmt.query_map(
            params![felt_to_blob(contract_address), u256_to_blob(token_id)],
            |row| row.get(0),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn token_version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenVersion> {
        Ok(TokenVersion {
            owners: blob_to_owners(&row.get::<_, Vec<u8>>(0)?),
            updated_at: row.get(1)?,
            valid_from: row.get(2)?,
            valid_to: row.get(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TokenIdKind;

    fn store() -> LedgerStore {
        LedgerStore::open(":memory:").unwrap()
    }

    fn transfer(from: u64, to: u64, token_id: u64) -> Transfer {
        Transfer {
            from: Felt::from(from),
            to: Felt::from(to),
            token_id: U256::from(token_id),
            kind: TokenIdKind::Narrow,
        }
    }

    const CONTRACT: Felt = Felt::from_hex_unchecked("0xc0ffee");

    #[tokio::test]
    async fn first_transfer_creates_current_version_and_metadata_marker() {
        let ledger = store();
        ledger
            .apply_transfer(CONTRACT, 100, 1_650_000_000, &transfer(0, 1, 16))
            .await
            .unwrap();

        let current = ledger
            .current_token(CONTRACT, U256::from(16u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.owners, vec![Felt::ONE]);
        assert_eq!(current.valid_from, 100);
        assert_eq!(current.valid_to, None);
        assert_eq!(current.updated_at, 1_650_000_000);

        assert_eq!(
            ledger
                .metadata_statuses(CONTRACT, U256::from(16u64))
                .await
                .unwrap(),
            vec!["missing".to_string()]
        );
    }

    #[tokio::test]
    async fn sequence_keeps_single_current_version() {
        let ledger = store();
        let moves = [(0u64, 1u64), (1, 2), (2, 3), (3, 4)];
        for (i, (from, to)) in moves.iter().enumerate() {
            ledger
                .apply_transfer(CONTRACT, 100 + i as u64, 1_650_000_000 + i as i64, &transfer(*from, *to, 7))
                .await
                .unwrap();
        }

        let versions = ledger
            .token_versions(CONTRACT, U256::from(7u64))
            .await
            .unwrap();
        assert_eq!(versions.len(), moves.len());
        assert_eq!(
            versions.iter().filter(|v| v.valid_to.is_none()).count(),
            1
        );

        // Closed versions chain into each other by block number.
        for pair in versions.windows(2) {
            assert_eq!(pair[0].valid_to, Some(pair[1].valid_from));
        }

        let current = versions.last().unwrap();
        assert_eq!(current.owners, vec![Felt::from(4u64)]);

        let facts = ledger
            .transfers_for_token(CONTRACT, U256::from(7u64))
            .await
            .unwrap();
        assert_eq!(facts.len(), moves.len());
        for pair in facts.windows(2) {
            assert!(pair[0].valid_from < pair[1].valid_from);
        }
        assert_eq!(ledger.count_transfers().await.unwrap(), moves.len() as u64);

        // Only the first transfer leaves a metadata marker.
        assert_eq!(
            ledger
                .metadata_statuses(CONTRACT, U256::from(7u64))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn transfer_replaces_sender_with_recipient() {
        let ledger = store();
        ledger
            .apply_transfer(CONTRACT, 10, 1, &transfer(0, 0xa, 1))
            .await
            .unwrap();
        ledger
            .apply_transfer(CONTRACT, 11, 2, &transfer(0xa, 0xb, 1))
            .await
            .unwrap();

        let current = ledger
            .current_token(CONTRACT, U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.owners, vec![Felt::from(0xbu64)]);
    }

    #[tokio::test]
    async fn self_transfer_deduplicates_owner() {
        let ledger = store();
        ledger
            .apply_transfer(CONTRACT, 10, 1, &transfer(0, 0xa, 1))
            .await
            .unwrap();
        ledger
            .apply_transfer(CONTRACT, 11, 2, &transfer(0xa, 0xa, 1))
            .await
            .unwrap();

        let current = ledger
            .current_token(CONTRACT, U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.owners, vec![Felt::from(0xau64)]);
    }

    #[tokio::test]
    async fn mint_over_existing_owner_grows_the_owner_set() {
        // A second mint-like transfer (from 0) while someone already
        // owns the token yields the documented multi-owner anomaly; the
        // next regular transfer shrinks the set again.
        let ledger = store();
        ledger
            .apply_transfer(CONTRACT, 10, 1, &transfer(0, 0xa, 1))
            .await
            .unwrap();
        ledger
            .apply_transfer(CONTRACT, 11, 2, &transfer(0, 0xb, 1))
            .await
            .unwrap();

        let current = ledger
            .current_token(CONTRACT, U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.owners, vec![Felt::from(0xau64), Felt::from(0xbu64)]);

        ledger
            .apply_transfer(CONTRACT, 12, 3, &transfer(0xa, 0xc, 1))
            .await
            .unwrap();
        let current = ledger
            .current_token(CONTRACT, U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.owners, vec![Felt::from(0xbu64), Felt::from(0xcu64)]);
    }

    #[tokio::test]
    async fn replay_doubles_facts_but_not_current_state() {
        // Re-applying an already-applied sequence is the documented
        // idempotency gap: transfer facts double, an extra token version
        // appears, yet the current owners stay correct.
        let ledger = store();
        let sequence = [(0u64, 1u64, 100u64), (1, 2, 101)];

        for pass in 0..2 {
            for (from, to, block) in sequence {
                ledger
                    .apply_transfer(CONTRACT, block, 1_650_000_000, &transfer(from, to, 9))
                    .await
                    .unwrap();
            }

            let facts = ledger
                .transfers_for_token(CONTRACT, U256::from(9u64))
                .await
                .unwrap();
            assert_eq!(facts.len(), sequence.len() * (pass + 1));
        }

        let versions = ledger
            .token_versions(CONTRACT, U256::from(9u64))
            .await
            .unwrap();
        assert_eq!(
            versions.iter().filter(|v| v.valid_to.is_none()).count(),
            1
        );

        let current = ledger
            .current_token(CONTRACT, U256::from(9u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.owners, vec![Felt::from(2u64)]);
    }

    #[tokio::test]
    async fn tokens_are_keyed_per_contract() {
        let other = Felt::from_hex_unchecked("0xdecaf");
        let ledger = store();
        ledger
            .apply_transfer(CONTRACT, 10, 1, &transfer(0, 0xa, 1))
            .await
            .unwrap();
        ledger
            .apply_transfer(other, 10, 1, &transfer(0, 0xb, 1))
            .await
            .unwrap();

        let first = ledger
            .current_token(CONTRACT, U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        let second = ledger
            .current_token(other, U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.owners, vec![Felt::from(0xau64)]);
        assert_eq!(second.owners, vec![Felt::from(0xbu64)]);
    }

    #[tokio::test]
    async fn contract_rows_are_write_once() {
        let ledger = store();
        let contract = Contract {
            address: CONTRACT,
            kind: ContractKind::Erc721,
            name: Some("Cats".into()),
        };
        ledger.insert_contract(&contract).await.unwrap();
        assert!(ledger.insert_contract(&contract).await.is_err());

        let stored = ledger.get_contract(CONTRACT).await.unwrap().unwrap();
        assert_eq!(stored, contract);
        assert!(ledger
            .get_contract(Felt::from(0x404u64))
            .await
            .unwrap()
            .is_none());
    }
}
