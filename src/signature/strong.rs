//! Strong block digests and whole-file content hashes

use super::StrongSignature;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Length of a block's strong digest in bytes
pub const STRONG_SIGNATURE_LEN: usize = 16;

/// Strong digest of block contents (MD5, 16 bytes)
pub struct StrongHash;

impl StrongHash {
    /// Digest a block
    pub fn digest(block: &[u8]) -> StrongSignature {
        Md5::digest(block).into()
    }
}

/// Block ID for a digest. Block blob IDs must be base64 and of equal length
/// within a blob, which a fixed-size digest gives for free.
pub fn block_id(strong: &StrongSignature) -> String {
    BASE64.encode(strong)
}

/// BLAKE3 hex digest of a whole buffer, recorded with each upload
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// BLAKE3 hex digest of a file, read in 1 MiB chunks
pub fn content_hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io("opening file for hashing", e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| Error::io("reading file for hashing", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_digest_known_value() {
        // RFC 1321 test vector
        assert_eq!(
            hex::encode(StrongHash::digest(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(StrongHash::digest(b"block"), StrongHash::digest(b"block"));
        assert_ne!(StrongHash::digest(b"block"), StrongHash::digest(b"blocK"));
    }

    #[test]
    fn test_block_id_is_fixed_length_base64() {
        let a = block_id(&StrongHash::digest(b"one"));
        let b = block_id(&StrongHash::digest(&[0u8; 4096]));
        assert_eq!(a.len(), 24);
        assert_eq!(b.len(), 24);
        assert_eq!(BASE64.decode(&a).unwrap(), StrongHash::digest(b"one").to_vec());
    }

    #[test]
    fn test_content_hash_file_matches_buffer() {
        let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 253) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(content_hash_file(file.path()).unwrap(), content_hash(&data));
    }
}
