//! Content hashing for derived business keys

use sha2::{Digest, Sha256};

/// Compute the hex-encoded SHA-256 digest of a byte slice.
///
/// Used to derive stable business keys for records whose upstream ids are
/// not guaranteed stable (traffic incidents hash their geometry, type, and
/// start time into one key).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute a single hex-encoded SHA-256 digest over several parts.
///
/// Parts are joined with an ASCII unit separator so `["ab", "c"]` and
/// `["a", "bc"]` hash differently.
pub fn sha256_hex_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}
