//! Concrete wire-protocol drivers.
//!
//! - [`tds`] speaks native TDS through `tiberius` (feature `tds`, default)
//! - [`odbc`] opens ODBC DSN connections through `odbc-api` (feature `odbc`)

#[cfg(feature = "odbc")]
pub mod odbc;
#[cfg(feature = "tds")]
pub mod tds;

#[cfg(feature = "odbc")]
pub use odbc::OdbcDriver;
#[cfg(feature = "tds")]
pub use tds::TdsDriver;

/// Rewrite `?` positional markers into the `@P1, @P2, ...` form used by TDS.
///
/// Markers inside single-quoted literals, bracketed identifiers and comments
/// are left untouched.
pub fn rewrite_positional_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut index = 0;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push(c);
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            out.push('\'');
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '[' => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '?' => {
                index += 1;
                out.push_str("@P");
                out.push_str(&index.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_numbers_markers_in_order() {
        assert_eq!(
            rewrite_positional_placeholders("SELECT * FROM item WHERE sku = ? AND qty > ?"),
            "SELECT * FROM item WHERE sku = @P1 AND qty > @P2"
        );
    }

    #[test]
    fn test_rewrite_skips_literals_and_comments() {
        assert_eq!(
            rewrite_positional_placeholders(
                "SELECT '?', 'it''s ?', [col?] FROM t -- why?\nWHERE a = ?"
            ),
            "SELECT '?', 'it''s ?', [col?] FROM t -- why?\nWHERE a = @P1"
        );
    }

    #[test]
    fn test_rewrite_without_markers_is_identity() {
        let sql = "SELECT 1";
        assert_eq!(rewrite_positional_placeholders(sql), sql);
    }
}
