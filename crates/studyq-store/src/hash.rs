//! Blake3 hashing for study manifests

use std::io;
use std::path::Path;

/// Hash a file's contents with blake3.
pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_mmap(path)?;
    Ok(hasher.finalize())
}

/// Hash raw bytes with blake3.
pub fn hash_bytes(data: &[u8]) -> blake3::Hash {
    blake3::hash(data)
}

/// Combine multiple hashes into one by hashing their concatenated bytes.
pub fn combine_hashes(hashes: &[blake3::Hash]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for h in hashes {
        hasher.update(h.as_bytes());
    }
    hasher.finalize()
}

/// First 8 characters of a hex hash string. Input that is not plain hex
/// (a hand-edited manifest) is returned whole rather than cut mid-character.
pub fn short_hex(hex: &str) -> &str {
    hex.get(..8).unwrap_or(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dcm");
        std::fs::write(&path, b"pixel data").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"pixel data"));
    }

    #[test]
    fn combine_order_matters() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        assert_ne!(combine_hashes(&[a, b]), combine_hashes(&[b, a]));
    }

    #[test]
    fn short_hex_truncates() {
        assert_eq!(short_hex("0123456789abcdef"), "01234567");
        assert_eq!(short_hex("abc"), "abc");
    }

    #[test]
    fn short_hex_multibyte_input() {
        // Byte 8 falls inside the second 'é'
        assert_eq!(short_hex("abcdeééé"), "abcdeééé");
        assert_eq!(short_hex("éééé"), "éééé");
        assert_eq!(short_hex("ééééé"), "éééé");
    }
}
