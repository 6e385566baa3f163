//! Blocks: header plus payload, with canonical bytes-for-signing.
//!
//! The block signature IS its proof-of-work: SHA-256 over the canonical
//! byte concatenation of the header fields and the payload-for-signing.
//! The genesis block carries a UTF-8 seed string instead of transactions
//! and points at the all-zero hash.

use catena_crypto::Hash;
use serde::{Deserialize, Serialize};

use crate::pow;
use crate::transaction::Transaction;
use crate::{ChainError, Result, MAX_PAYLOAD_FOR_SIGNING, MAX_TRANSACTIONS_PER_BLOCK};

/// Current block format version.
pub const BLOCK_VERSION: u64 = 1;

/// Block payload: a seed string for genesis, transactions otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Seed(String),
    Transactions(Vec<Transaction>),
}

impl Payload {
    pub fn transactions(&self) -> &[Transaction] {
        match self {
            Payload::Seed(_) => &[],
            Payload::Transactions(transactions) => transactions,
        }
    }
}

/// A proof-of-work-signed container of ordered, signed SQL transactions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub version: u64,
    pub index: u64,
    pub previous: Hash,
    pub miner: Hash,
    pub timestamp: u64,
    pub nonce: u64,
    pub payload: Payload,
    pub signature: Hash,
}

impl Block {
    /// An unmined genesis block for a seed string.
    pub fn genesis(seed: impl Into<String>, miner: Hash, timestamp: u64) -> Self {
        Self {
            version: BLOCK_VERSION,
            index: 0,
            previous: Hash::zero(),
            miner,
            timestamp,
            nonce: 0,
            payload: Payload::Seed(seed.into()),
            signature: Hash::zero(),
        }
    }

    /// An unmined successor of `previous` carrying transactions.
    pub fn next(
        previous: &Block,
        miner: Hash,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            version: BLOCK_VERSION,
            index: previous.index + 1,
            previous: previous.signature,
            miner,
            timestamp,
            nonce: 0,
            payload: Payload::Transactions(transactions),
            signature: Hash::zero(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    /// The payload bytes covered by the signature: the seed for genesis,
    /// the concatenated raw transaction signatures otherwise.
    pub fn payload_for_signing(&self) -> Vec<u8> {
        match &self.payload {
            Payload::Seed(seed) => seed.as_bytes().to_vec(),
            Payload::Transactions(transactions) => {
                let mut out = Vec::with_capacity(transactions.len() * 64);
                for tx in transactions {
                    out.extend_from_slice(&tx.signature.to_bytes());
                }
                out
            }
        }
    }

    /// Canonical bytes the proof-of-work hashes: all integers big-endian
    /// fixed-width, then the previous hash, miner, and payload.
    pub fn bytes_for_signing(&self) -> Vec<u8> {
        let payload = self.payload_for_signing();
        let mut out = Vec::with_capacity(8 * 4 + 32 * 2 + payload.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(self.previous.as_bytes());
        out.extend_from_slice(self.miner.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// The signature the current nonce produces.
    pub fn computed_signature(&self) -> Hash {
        Hash::of(&self.bytes_for_signing())
    }

    /// Full validation: structural limits, proof-of-work, and every
    /// transaction signature.
    pub fn validate(&self, difficulty: u32) -> Result<()> {
        let transactions = self.payload.transactions();
        if transactions.len() > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(ChainError::TooManyTransactions(transactions.len()));
        }
        let payload = self.payload_for_signing();
        if payload.len() > MAX_PAYLOAD_FOR_SIGNING {
            return Err(ChainError::PayloadTooLarge(payload.len()));
        }
        match &self.payload {
            Payload::Seed(_) => {
                if !self.is_genesis() || !self.previous.is_zero() {
                    return Err(ChainError::Format(
                        "seed payload outside the genesis block".into(),
                    ));
                }
            }
            Payload::Transactions(_) => {
                if self.is_genesis() {
                    return Err(ChainError::Format(
                        "genesis block carries transactions".into(),
                    ));
                }
            }
        }
        if !pow::verify(self, difficulty) {
            return Err(ChainError::Signature);
        }
        for tx in transactions {
            tx.verify()?;
        }
        Ok(())
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catena_crypto::KeyPair;
    use catena_sql::parse_statement;

    fn mined_genesis() -> Block {
        let mut block = Block::genesis("seed", Hash::of(b"miner"), 0);
        pow::mine(&mut block, 4, &Default::default());
        block
    }

    fn signed_tx(counter: u64) -> Transaction {
        let kp = KeyPair::from_bytes(&[5u8; 32]);
        let statement = parse_statement("INSERT INTO test (x) VALUES (1);").expect("parse");
        Transaction::new(&kp, "d", counter, statement).expect("sign")
    }

    #[test]
    fn test_genesis_shape() {
        let block = Block::genesis("seed", Hash::of(b"miner"), 0);
        assert!(block.is_genesis());
        assert!(block.previous.is_zero());
        assert_eq!(block.payload_for_signing(), b"seed");
    }

    #[test]
    fn test_bytes_for_signing_layout() {
        let block = Block::genesis("s", Hash::of(b"miner"), 7);
        let bytes = block.bytes_for_signing();
        // version, index, timestamp, nonce: 8 bytes each; two hashes; one
        // seed byte.
        assert_eq!(bytes.len(), 8 * 4 + 32 * 2 + 1);
        assert_eq!(&bytes[0..8], &1u64.to_be_bytes());
    }

    #[test]
    fn test_nonce_changes_signature() {
        let mut block = Block::genesis("s", Hash::of(b"m"), 0);
        let a = block.computed_signature();
        block.nonce += 1;
        let b = block.computed_signature();
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_mined_genesis() {
        mined_genesis().validate(4).expect("valid");
    }

    #[test]
    fn test_validate_rejects_wrong_signature() {
        let mut block = mined_genesis();
        block.signature = Hash::of(b"forged");
        assert!(matches!(block.validate(4), Err(ChainError::Signature)));
    }

    #[test]
    fn test_validate_rejects_too_many_transactions() {
        let genesis = mined_genesis();
        let transactions = (0..=MAX_TRANSACTIONS_PER_BLOCK as u64)
            .map(signed_tx)
            .collect();
        let block = Block::next(&genesis, Hash::of(b"m"), 1, transactions);
        assert!(matches!(
            block.validate(0),
            Err(ChainError::TooManyTransactions(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let mut block = Block::genesis("x".repeat(MAX_PAYLOAD_FOR_SIGNING + 1), Hash::zero(), 0);
        pow::mine(&mut block, 0, &Default::default());
        assert!(matches!(
            block.validate(0),
            Err(ChainError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_validate_rejects_seed_outside_genesis() {
        let genesis = mined_genesis();
        let mut block = Block::next(&genesis, Hash::of(b"m"), 1, vec![]);
        block.payload = Payload::Seed("late seed".into());
        pow::mine(&mut block, 0, &Default::default());
        assert!(matches!(block.validate(0), Err(ChainError::Format(_))));
    }

    #[test]
    fn test_validate_rejects_tampered_transaction() {
        let genesis = mined_genesis();
        let mut tx = signed_tx(0);
        tx.counter = 9;
        let mut block = Block::next(&genesis, Hash::of(b"m"), 1, vec![tx]);
        pow::mine(&mut block, 0, &Default::default());
        assert!(matches!(
            block.validate(0),
            Err(ChainError::PayloadSignature(_))
        ));
    }

    #[test]
    fn test_block_json_roundtrip() {
        let genesis = mined_genesis();
        let json = serde_json::to_string(&genesis).expect("serialize");
        let restored: Block = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(genesis, restored);
        assert_eq!(restored.payload, Payload::Seed("seed".into()));

        let mut block = Block::next(&genesis, Hash::of(b"m"), 1, vec![signed_tx(0)]);
        pow::mine(&mut block, 0, &Default::default());
        let json = serde_json::to_string(&block).expect("serialize");
        let restored: Block = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.payload.transactions().len(), 1);
    }
}
