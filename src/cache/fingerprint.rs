//! Query fingerprints used as cache keys.
//!
//! A fingerprint is the SHA-256 of the normalized statement text followed by
//! each parameter's tagged representation, hex-encoded. Normalization
//! collapses whitespace and folds case outside quoted spans (`'...'`,
//! `"..."` and `[...]`), so formatting differences do not split the cache
//! while literals and quoted identifiers keep their case.

use crate::database::types::SqlParam;
use sha2::{Digest, Sha256};

/// Closing delimiter for a quoted span opened by `c`
fn quote_close(c: char) -> Option<char> {
    match c {
        '\'' => Some('\''),
        '"' => Some('"'),
        '[' => Some(']'),
        _ => None,
    }
}

/// Canonical form of a statement for hashing
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut closing: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().trim_end_matches(';').trim_end().chars() {
        if let Some(close) = closing {
            out.push(c);
            if c == close {
                closing = None;
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;

        if let Some(close) = quote_close(c) {
            closing = Some(close);
            out.push(c);
            continue;
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Fingerprint of a statement and its ordered parameters
pub fn fingerprint(sql: &str, params: &[SqlParam]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_sql(sql).as_bytes());
    for param in params {
        hasher.update([0x1f]);
        hasher.update(param.fingerprint_repr().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint prefixed with a key family, e.g. `item:<hash>`, so a whole
/// family can be invalidated with `item:*`
pub fn family_fingerprint(family: &str, sql: &str, params: &[SqlParam]) -> String {
    format!("{family}:{}", fingerprint(sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_ignores_layout_and_case() {
        assert_eq!(
            normalize_sql("  SELECT *\n  FROM   Item\tWHERE sku = ? ;"),
            "select * from item where sku = ?"
        );
    }

    #[test]
    fn test_literals_preserved() {
        assert_eq!(
            normalize_sql("SELECT 'Mixed  Case' FROM t"),
            "select 'Mixed  Case' from t"
        );
        assert_ne!(
            fingerprint("SELECT 'A'", &[]),
            fingerprint("SELECT 'a'", &[])
        );

        assert_eq!(
            normalize_sql("SELECT [Item Descr] FROM Items WHERE Descr = \"Bolt\""),
            "select [Item Descr] from items where descr = \"Bolt\""
        );
        assert_ne!(
            fingerprint("SELECT * FROM Items WHERE Descr = \"Bolt\"", &[]),
            fingerprint("SELECT * FROM Items WHERE Descr = \"bolt\"", &[])
        );
        assert_ne!(
            fingerprint("SELECT [Descr] FROM t", &[]),
            fingerprint("SELECT [DESCR] FROM t", &[])
        );
        assert_eq!(normalize_sql("SELECT 'It''s  X'"), "select 'It''s  X'");
    }

    #[test]
    fn test_params_are_ordered_and_typed() {
        let sql = "SELECT * FROM item WHERE a = ? AND b = ?";
        let ab = fingerprint(sql, &[SqlParam::Int(1), SqlParam::Int(2)]);
        let ba = fingerprint(sql, &[SqlParam::Int(2), SqlParam::Int(1)]);
        assert_ne!(ab, ba);

        let int = fingerprint(sql, &[SqlParam::Int(1)]);
        let text = fingerprint(sql, &[SqlParam::Text("1".into())]);
        assert_ne!(int, text);
    }

    #[test]
    fn test_equivalent_statements_share_fingerprint() {
        let a = fingerprint("select * from item where sku = ?", &["7530110".into()]);
        let b = fingerprint("SELECT *   FROM item\nWHERE sku = ?", &["7530110".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_family_prefix() {
        let key = family_fingerprint("item", "SELECT 1", &[]);
        assert!(key.starts_with("item:"));
    }
}
