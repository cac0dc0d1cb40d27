//! Identifier escaping for table and index names.
//!
//! DynamoDB restricts identifiers to `[-a-zA-Z0-9_.]` with a minimum
//! length of 3, so collection and attribute names are escaped into that
//! alphabet. The mapping is stable: the same logical name always yields
//! the same table name.

use std::fmt::Write as _;

/// Escapes characters outside `[-a-zA-Z0-9_.]` as `_uHH` (code points up
/// to 0xFF) or `_UHHHH`, then right-pads with `_` to at least 3 chars.
pub fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => out.push(c),
            c if (c as u32) <= 0xFF => {
                let _ = write!(out, "_u{:02X}", c as u32);
            }
            c => {
                let _ = write!(out, "_U{:04X}", c as u32);
            }
        }
    }
    while out.len() < 3 {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_safe_names_through() {
        assert_eq!(escape_name("users"), "users");
        assert_eq!(escape_name("a-b_c.d"), "a-b_c.d");
    }

    #[test]
    fn escapes_unsafe_characters() {
        assert_eq!(escape_name("a b"), "a_u20b");
        assert_eq!(escape_name("a/b"), "a_u2Fb");
        assert_eq!(escape_name("naïve"), "na_uEFve");
        assert_eq!(escape_name("日記"), "_U65E5_U8A18");
    }

    #[test]
    fn pads_short_names() {
        assert_eq!(escape_name(""), "___");
        assert_eq!(escape_name("a"), "a__");
        assert_eq!(escape_name("ab"), "ab_");
        assert_eq!(escape_name("abc"), "abc");
    }

    #[test]
    fn is_stable() {
        assert_eq!(escape_name("a b"), escape_name("a b"));
    }
}
