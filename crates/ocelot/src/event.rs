//! Transfer event decoding.
//!
//! Starknet contracts emit `Transfer` with one of two data shapes: three
//! field elements with a felt-sized token id, or four with the token id
//! split into two 128-bit limbs (low limb first).

use starknet::core::types::{Felt, U256};

use crate::convert::{felt_to_u256, u256_to_felt};

/// Wire encoding of the token id in the triggering event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenIdKind {
    /// Token id packed into a single felt.
    Narrow,
    /// Token id split into two 128-bit limbs, low first.
    Wide,
}

/// A decoded `Transfer` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: Felt,
    pub to: Felt,
    pub token_id: U256,
    pub kind: TokenIdKind,
}

impl Transfer {
    /// Calldata encoding of the token id, matching the event's own
    /// encoding. Probe calls must use the same shape the contract emits.
    pub fn token_id_calldata(&self) -> Vec<Felt> {
        match self.kind {
            TokenIdKind::Narrow => vec![u256_to_felt(self.token_id)],
            TokenIdKind::Wide => vec![
                Felt::from(self.token_id.low()),
                Felt::from(self.token_id.high()),
            ],
        }
    }
}

/// Decode the data payload of a `Transfer` event.
///
/// Returns `None` for any shape that is not an ERC-721 transfer: wrong
/// arity, or wide limbs that do not fit 128 bits. Never fails otherwise
/// and performs no I/O.
pub fn decode_transfer(data: &[Felt]) -> Option<Transfer> {
    match data {
        [from, to, token_id] => Some(Transfer {
            from: *from,
            to: *to,
            token_id: felt_to_u256(*token_id),
            kind: TokenIdKind::Narrow,
        }),
        [from, to, low, high] => {
            let low: u128 = (*low).try_into().ok()?;
            let high: u128 = (*high).try_into().ok()?;
            Some(Transfer {
                from: *from,
                to: *to,
                token_id: U256::from_words(low, high),
                kind: TokenIdKind::Wide,
            })
        }
        _ => None,
    }
}
