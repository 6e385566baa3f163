//! Execution context for a statement.

use std::collections::BTreeMap;

use catena_crypto::{keys, Hash, VerifyingKey};
use catena_sql::Literal;

/// Facts about the block a statement executes inside, exposed to SQL
/// through the built-in `$block*` variables.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub height: u64,
    pub signature: Hash,
    pub previous: Hash,
    pub miner: Hash,
    pub timestamp: u64,
}

impl BlockContext {
    /// A context for read-only evaluation outside any block.
    pub fn unmined() -> Self {
        Self {
            height: 0,
            signature: Hash::zero(),
            previous: Hash::zero(),
            miner: Hash::zero(),
            timestamp: 0,
        }
    }
}

/// Everything the executive needs to run one statement.
#[derive(Clone, Debug)]
pub struct Context {
    /// Database scope. Empty for database-less statements.
    pub database: String,
    /// Public key of the statement's invoker.
    pub invoker: VerifyingKey,
    /// The enclosing block.
    pub block: BlockContext,
    /// Caller-supplied parameter values, applied to unbound parameters.
    pub parameters: BTreeMap<String, Literal>,
}

impl Context {
    pub fn new(database: impl Into<String>, invoker: VerifyingKey, block: BlockContext) -> Self {
        Self {
            database: database.into(),
            invoker,
            block,
            parameters: BTreeMap::new(),
        }
    }

    /// SHA-256 of the invoker's public key.
    pub fn invoker_hash(&self) -> Hash {
        keys::invoker_hash(&self.invoker)
    }

    /// Resolve a built-in `$variable` (names arrive lowercased from the
    /// lexer) to a literal, if it is one of the defined variables.
    pub fn variable(&self, name: &str) -> Option<Literal> {
        Some(match name {
            "invoker" => Literal::Blob(self.invoker_hash().as_bytes().to_vec()),
            "blockheight" => Literal::Int(self.block.height as i64),
            "blocksignature" => Literal::Blob(self.block.signature.as_bytes().to_vec()),
            "previousblocksignature" => Literal::Blob(self.block.previous.as_bytes().to_vec()),
            "blockminer" => Literal::Blob(self.block.miner.as_bytes().to_vec()),
            "blocktimestamp" => Literal::Int(self.block.timestamp as i64),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catena_crypto::KeyPair;

    #[test]
    fn test_builtin_variables() {
        let kp = KeyPair::from_bytes(&[1u8; 32]);
        let mut block = BlockContext::unmined();
        block.height = 12;
        block.timestamp = 99;
        let ctx = Context::new("d", kp.verifying_key.clone(), block);

        assert_eq!(ctx.variable("blockheight"), Some(Literal::Int(12)));
        assert_eq!(ctx.variable("blocktimestamp"), Some(Literal::Int(99)));
        assert_eq!(
            ctx.variable("invoker"),
            Some(Literal::Blob(ctx.invoker_hash().as_bytes().to_vec()))
        );
        assert_eq!(ctx.variable("unknown"), None);
    }
}
