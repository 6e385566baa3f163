//! A genesis-rooted block sequence.
//!
//! A chain is linear: `order[i]` is the block at index `i`. Branching is
//! modelled by the ledger creating a new chain that copies the shared
//! prefix; blocks are copied into a chain, never shared between chains.

use std::collections::HashMap;

use catena_crypto::Hash;

use crate::block::Block;
use crate::{ChainError, Result};

/// One chain of blocks, identified by its genesis hash.
#[derive(Clone, Debug)]
pub struct Chain {
    blocks: HashMap<Hash, Block>,
    order: Vec<Hash>,
}

impl Chain {
    /// Start a chain from a genesis block.
    pub fn new(genesis: Block) -> Result<Self> {
        if !genesis.is_genesis() {
            return Err(ChainError::Inconsecutive);
        }
        let hash = genesis.signature;
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);
        Ok(Self {
            blocks,
            order: vec![hash],
        })
    }

    /// The genesis hash identifying this chain.
    pub fn genesis_hash(&self) -> Hash {
        self.order[0]
    }

    /// The highest block.
    pub fn highest(&self) -> &Block {
        let hash = self.order.last().expect("chain is never empty");
        &self.blocks[hash]
    }

    /// Height of the head (the head's index).
    pub fn height(&self) -> u64 {
        (self.order.len() - 1) as u64
    }

    pub fn get(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// The block at a given index, if the chain is that tall.
    pub fn at_index(&self, index: u64) -> Option<&Block> {
        self.order
            .get(index as usize)
            .map(|hash| &self.blocks[hash])
    }

    /// Append a block that extends the current head.
    pub fn extend(&mut self, block: Block) -> Result<()> {
        let head = self.highest();
        if block.previous != head.signature || block.index != head.index + 1 {
            return Err(ChainError::Inconsecutive);
        }
        let hash = block.signature;
        self.blocks.insert(hash, block);
        self.order.push(hash);
        Ok(())
    }

    /// Build a new chain sharing this chain's prefix up to the block the
    /// branch block points at, then carrying the branch block. Returns
    /// `None` if the branch's `previous` is not in this chain.
    pub fn branch(&self, block: Block) -> Option<Chain> {
        let parent = self.blocks.get(&block.previous)?;
        if block.index != parent.index + 1 {
            return None;
        }
        let split = parent.index as usize;
        let order: Vec<Hash> = self.order[..=split].to_vec();
        let mut blocks = HashMap::with_capacity(order.len() + 1);
        for hash in &order {
            blocks.insert(*hash, self.blocks[hash].clone());
        }
        let mut chain = Chain { blocks, order };
        chain.blocks.insert(block.signature, block.clone());
        chain.order.push(block.signature);
        Some(chain)
    }

    /// Index of the highest block shared with another chain, if the
    /// chains share a genesis.
    pub fn common_ancestor(&self, other: &Chain) -> Option<u64> {
        if self.genesis_hash() != other.genesis_hash() {
            return None;
        }
        let mut shared = 0usize;
        for (a, b) in self.order.iter().zip(other.order.iter()) {
            if a != b {
                break;
            }
            shared += 1;
        }
        Some((shared - 1) as u64)
    }

    /// Iterate blocks in index order starting at `from`.
    pub fn blocks_from(&self, from: u64) -> impl Iterator<Item = &Block> {
        self.order
            .iter()
            .skip(from as usize)
            .map(move |hash| &self.blocks[hash])
    }
}
