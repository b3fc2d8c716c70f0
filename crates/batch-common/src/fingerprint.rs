//! SHA-256 fingerprints for run identities and staged files

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const KEY_SEPARATOR: u8 = 0x1f;
const PAIR_SEPARATOR: u8 = 0x1e;

/// Digest an ordered sequence of key/value pairs.
///
/// Callers must supply pairs in a canonical order (e.g. from a `BTreeMap`);
/// the separators keep `("ab", "c")` and `("a", "bc")` apart.
pub fn fingerprint_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (key, value) in pairs {
        hasher.update(key.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(value.as_bytes());
        hasher.update([PAIR_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_checksum_sha256() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = compute_checksum(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_file_checksum_matches_stream_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "hello world").unwrap();

        let from_file = compute_file_checksum(&path).unwrap();
        let from_stream = compute_checksum(&mut Cursor::new(b"hello world")).unwrap();
        assert_eq!(from_file, from_stream);
    }

    #[test]
    fn test_fingerprint_is_stable_and_boundary_aware() {
        let a = fingerprint_pairs([("ab", "c")]);
        let b = fingerprint_pairs([("a", "bc")]);
        assert_ne!(a, b);
        assert_eq!(a, fingerprint_pairs([("ab", "c")]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_values() {
        let first = fingerprint_pairs([("input.file", "a.csv"), ("data.year", "2025")]);
        let second = fingerprint_pairs([("input.file", "a.csv"), ("data.year", "2024")]);
        assert_ne!(first, second);
    }
}
