//! Template text and template hash of a statement.
//!
//! The template of a statement is its canonical standard-dialect text
//! with every bound parameter replaced by its unbound form, so two
//! invocations that differ only in bound values share one template. The
//! template hash is SHA-256 over that text.

use catena_crypto::Hash;

use crate::ast::Statement;
use crate::fold::{Fold, Unbinder};
use crate::render::{render_statement, StandardDialect};
use crate::Result;

/// Canonical template text of a statement.
pub fn template_text(statement: &Statement) -> Result<String> {
    let unbound = Unbinder.fold_statement(statement.clone())?;
    render_statement(&unbound, &StandardDialect)
}

/// SHA-256 of the template text.
pub fn template_hash(statement: &Statement) -> Result<Hash> {
    Ok(Hash::of(template_text(statement)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_statement;

    #[test]
    fn test_bound_values_share_template() {
        let a = parse_statement("INSERT INTO t (x) VALUES (?v:1);").expect("parse");
        let b = parse_statement("INSERT INTO t (x) VALUES (?v:99);").expect("parse");
        assert_eq!(template_hash(&a).expect("hash"), template_hash(&b).expect("hash"));
    }

    #[test]
    fn test_unbound_form_matches_bound_form() {
        let bound = parse_statement("INSERT INTO t (x) VALUES (?v:1);").expect("parse");
        let unbound = parse_statement("INSERT INTO t (x) VALUES (?v);").expect("parse");
        assert_eq!(
            template_hash(&bound).expect("hash"),
            template_hash(&unbound).expect("hash")
        );
    }

    #[test]
    fn test_different_shape_different_template() {
        let a = parse_statement("INSERT INTO t (x) VALUES (?v);").expect("parse");
        let b = parse_statement("INSERT INTO t (y) VALUES (?v);").expect("parse");
        assert_ne!(template_hash(&a).expect("hash"), template_hash(&b).expect("hash"));
    }

    #[test]
    fn test_literal_differences_differ() {
        let a = parse_statement("INSERT INTO t (x) VALUES (1);").expect("parse");
        let b = parse_statement("INSERT INTO t (x) VALUES (2);").expect("parse");
        assert_ne!(template_hash(&a).expect("hash"), template_hash(&b).expect("hash"));
    }
}
