//! Identifier quoting and literal escaping.
//!
//! DDL cannot be parameterized over the wire, so every statement this tool
//! runs is assembled as text. All quoting funnels through this module:
//! identifiers via `quote_ident`, values via `quote_literal`, and internally
//! generated names through the `safe_ident` allow-list before interpolation.

use anyhow::{Result, bail};

/// Double-quote an identifier, escaping embedded double quotes. Preserves
/// case-sensitive names.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a value for literal embedding. Values captured from the
/// audit table are live application data and may contain quotes, backslashes
/// or arbitrary unicode; backslash-bearing strings use the E'' form so the
/// result is unambiguous regardless of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    if value.contains('\\') {
        format!("E'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Allow-list check for identifiers this tool generates itself (table,
/// trigger and column names derived from user table names plus a hex
/// suffix). Anything outside [a-z0-9_] means name generation went wrong.
pub fn safe_ident(ident: &str) -> Result<&str> {
    if ident.is_empty() || ident.len() > 63 {
        bail!("generated identifier has bad length: {:?}", ident);
    }
    if !ident
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        bail!("generated identifier contains unexpected characters: {:?}", ident);
    }
    Ok(ident)
}
