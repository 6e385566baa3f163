//! Gossip message payloads.
//!
//! Every message is a JSON object tagged with `"t"`. `query` expects an
//! `index` response, `fetch` expects `block` or `error`; `block` and
//! `tx` are fire-and-forget forwards.

use catena_chain::{Block, Transaction};
use catena_crypto::{Hash, Signature};
use serde::{Deserialize, Serialize};

/// A gossip message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum GossipMessage {
    /// Ask the peer for its chain index.
    Query,
    /// Ask the peer for one block by hash.
    Fetch { hash: Hash },
    /// Forward a block.
    Block { block: Block },
    /// Forward a pending transaction. The outer signature repeats the
    /// transaction signature so receivers can discard mismatched relays
    /// without parsing the statement.
    Tx {
        tx: Transaction,
        signature: Signature,
    },
    /// Response to `query`: the peer's view of its longest chain.
    Index {
        highest: Hash,
        height: u64,
        genesis: Hash,
        peers: Vec<String>,
    },
    /// Response to a request that cannot be served.
    Error { message: String },
}

impl GossipMessage {
    /// Wrap a transaction for forwarding.
    pub fn tx(tx: Transaction) -> Self {
        let signature = tx.signature;
        GossipMessage::Tx { tx, signature }
    }
}
