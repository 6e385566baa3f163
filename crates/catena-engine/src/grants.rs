//! Dynamic privilege lookup.
//!
//! A privilege set is satisfied only if *every* requested privilege has
//! at least one matching row in the grants table. A row with a NULL user
//! is a public grant matching any invoker; a row's table must equal the
//! requested table, or both must be NULL.

use catena_crypto::Hash;
use catena_db::{Database, Value};
use catena_sql::{Privilege, PrivilegeKind};

use crate::metadata::{sql_blob, sql_text};
use crate::Result;

/// Whether the grants table satisfies all requested privileges for this
/// user in this database.
pub fn check(
    db: &dyn Database,
    privileges: &[Privilege],
    user: &Hash,
    database: &str,
) -> Result<bool> {
    for privilege in privileges {
        if !check_one(db, privilege, user, database)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn check_one(db: &dyn Database, privilege: &Privilege, user: &Hash, database: &str) -> Result<bool> {
    // Nothing grants the never kind.
    if privilege.kind == PrivilegeKind::Never {
        return Ok(false);
    }

    let table_clause = match &privilege.table {
        Some(table) => format!("\"table\" = {}", sql_text(table)),
        None => "\"table\" IS NULL".to_string(),
    };
    let sql = format!(
        "SELECT COUNT(*) FROM grants
         WHERE database = {database}
           AND (user IS NULL OR user = {user})
           AND kind = {kind}
           AND {table_clause}",
        database = sql_text(database),
        user = sql_blob(user.as_bytes()),
        kind = sql_text(&privilege.kind.storage_key()),
    );
    let rs = db.query(&sql)?;
    Ok(matches!(rs.scalar(), Some(Value::Int(n)) if *n > 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use catena_db::SqliteDatabase;

    fn test_db() -> SqliteDatabase {
        let db = SqliteDatabase::open_memory().expect("open");
        Metadata::new(&db).install().expect("install");
        db
    }

    #[test]
    fn test_exact_grant_matches() {
        let db = test_db();
        let user = Hash::of(b"u");
        Metadata::new(&db)
            .add_grant(Some(&user), "insert", Some("test"), "d")
            .expect("grant");
        let p = Privilege::on(PrivilegeKind::Insert, "test");
        assert!(check(&db, &[p.clone()], &user, "d").expect("check"));
        assert!(!check(&db, &[p.clone()], &Hash::of(b"other"), "d").expect("check"));
        assert!(!check(&db, &[p], &user, "other_db").expect("check"));
    }

    #[test]
    fn test_public_grant_matches_anyone() {
        let db = test_db();
        Metadata::new(&db)
            .add_grant(None, "insert", Some("test"), "d")
            .expect("grant");
        let p = Privilege::on(PrivilegeKind::Insert, "test");
        assert!(check(&db, &[p], &Hash::of(b"anyone"), "d").expect("check"));
    }

    #[test]
    fn test_table_must_match() {
        let db = test_db();
        let user = Hash::of(b"u");
        Metadata::new(&db)
            .add_grant(Some(&user), "insert", Some("test"), "d")
            .expect("grant");
        let wrong = Privilege::on(PrivilegeKind::Insert, "other");
        assert!(!check(&db, &[wrong], &user, "d").expect("check"));
        // A table-scoped grant does not satisfy a table-less requirement.
        let global = Privilege::global(PrivilegeKind::Insert);
        assert!(!check(&db, &[global], &user, "d").expect("check"));
    }

    #[test]
    fn test_all_privileges_must_hold() {
        let db = test_db();
        let user = Hash::of(b"u");
        Metadata::new(&db)
            .add_grant(Some(&user), "insert", Some("a"), "d")
            .expect("grant");
        let both = vec![
            Privilege::on(PrivilegeKind::Insert, "a"),
            Privilege::on(PrivilegeKind::Delete, "a"),
        ];
        assert!(!check(&db, &both, &user, "d").expect("check"));
    }

    #[test]
    fn test_never_is_never_granted() {
        let db = test_db();
        let user = Hash::of(b"u");
        Metadata::new(&db)
            .add_grant(Some(&user), "never", None, "d")
            .expect("grant");
        let p = Privilege::global(PrivilegeKind::Never);
        assert!(!check(&db, &[p], &user, "d").expect("check"));
    }

    #[test]
    fn test_template_grant_matches_by_hash() {
        let db = test_db();
        let user = Hash::of(b"u");
        let template = Hash::of(b"statement shape");
        let kind = PrivilegeKind::Template(template);
        Metadata::new(&db)
            .add_grant(Some(&user), &kind.storage_key(), None, "d")
            .expect("grant");
        assert!(check(&db, &[Privilege::global(kind)], &user, "d").expect("check"));
        let other = PrivilegeKind::Template(Hash::of(b"different"));
        assert!(!check(&db, &[Privilege::global(other)], &user, "d").expect("check"));
    }

    #[test]
    fn test_empty_requirement_is_satisfied() {
        let db = test_db();
        assert!(check(&db, &[], &Hash::of(b"u"), "d").expect("check"));
    }
}
