//! Content Hasher (spec §4.2): a stable, non-cryptographic fingerprint used
//! for change detection, not integrity defense.

use std::fs::File;
use std::hash::Hasher;
use std::io::{self, Read};
use std::path::Path;

use twox_hash::XxHash64;

const SEED: u64 = 0;
const BUF_SIZE: usize = 64 * 1024;

/// Hashes a file's contents, returning a 16-char lowercase hex string.
///
/// Returns an empty string on open/read failure; callers (the differ) treat
/// an empty hash on either side as "not equal".
pub fn hash_file(path: &Path) -> String {
    match hash_file_inner(path) {
        Ok(digest) => digest,
        Err(_) => String::new(),
    }
}

fn hash_file_inner(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = XxHash64::with_seed(SEED);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(format!("{:016x}", hasher.finish()))
}

/// Hashes an in-memory byte slice the same way `hash_file` hashes a stream.
/// Used by tests and by callers that already hold the bytes in memory.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = XxHash64::with_seed(SEED);
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashes_are_stable_and_16_hex_chars() {
        let digest = hash_bytes(b"hello world");
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, hash_bytes(b"hello world"));
    }

    #[test]
    fn different_contents_hash_differently() {
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }

    #[test]
    fn empty_file_has_nonempty_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        let digest = hash_file(&path);
        assert!(!digest.is_empty());
    }

    #[test]
    fn missing_file_hashes_to_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert_eq!(hash_file(&path), "");
    }

    #[test]
    fn file_hash_matches_in_memory_hash_of_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"the quick brown fox").unwrap();
        drop(f);
        assert_eq!(hash_file(&path), hash_bytes(b"the quick brown fox"));
    }
}
