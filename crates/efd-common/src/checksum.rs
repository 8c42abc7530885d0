//! MD5 digests used for natural-key deduplication
//!
//! Ledger rows are identified by a digest of their natural key rather than by
//! a composite database index, which keeps the unique constraints narrow and
//! lets the loader deduplicate rows inside a batch before they reach the
//! database.

use std::fmt::Display;

/// Separator between key parts; never appears in ledger fields.
const KEY_SEPARATOR: char = '\u{1f}';

/// Lowercase hex MD5 of arbitrary bytes
pub fn compute_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Digest of a natural key made of several parts.
///
/// Parts are joined with a unit separator so that `("ab", "c")` and
/// `("a", "bc")` produce different keys.
pub fn natural_key<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: Display,
{
    let mut joined = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            joined.push(KEY_SEPARATOR);
        }
        joined.push_str(&part.to_string());
    }
    compute_md5(joined.as_bytes())
}
