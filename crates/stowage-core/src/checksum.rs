//! Streaming digests over files.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use stowage_schema::{Blake3Hash, Sha256Digest};

/// Read size for hashing and streamed copies.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Size and digests of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub size: u64,
    pub sha256: Sha256Digest,
    pub blake3: Blake3Hash,
}

/// Hash a file in [`CHUNK_SIZE`] reads. Blocking.
pub fn digest_file(path: &Path) -> std::io::Result<Digests> {
    let mut file = std::fs::File::open(path)?;
    let mut sha = Sha256::new();
    let mut b3 = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
        b3.update(&buf[..n]);
        size += n as u64;
    }

    let out: [u8; 32] = sha.finalize().into();
    Ok(Digests {
        size,
        sha256: Sha256Digest::from_bytes(&out),
        blake3: Blake3Hash::from_hasher(&b3),
    })
}

/// SHA-256 of a file. Blocking.
pub fn sha256_file(path: &Path) -> std::io::Result<Sha256Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let out: [u8; 32] = hasher.finalize().into();
    Ok(Sha256Digest::from_bytes(&out))
}

/// [`digest_file`] on the blocking pool.
pub async fn digest_file_async(path: PathBuf) -> std::io::Result<Digests> {
    tokio::task::spawn_blocking(move || digest_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

/// [`sha256_file`] on the blocking pool.
pub async fn sha256_file_async(path: PathBuf) -> std::io::Result<Sha256Digest> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let d = digest_file(&path).unwrap();
        assert_eq!(d.size, 11);
        assert_eq!(
            d.sha256.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(d.blake3, Blake3Hash::compute(b"hello world"));
        assert_eq!(sha256_file(&path).unwrap(), d.sha256);
    }
}
