//! Content digests for layer tars and metadata documents.

use std::io::Read;
use std::path::Path;

use docker_squash_core::error::Result;
use sha2::{Digest, Sha256};

/// Chunk size for hashing streams without holding them in memory.
const HASH_BUF_SIZE: usize = 10 * 1024 * 1024;

/// Compute the hex SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the hex SHA256 digest of a byte stream.
pub fn sha256_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA256 digest of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    sha256_reader(file)
}

/// Compute the hex SHA256 digest of a value's compact JSON form.
///
/// The serialization is the same one the assembler writes, so a digest
/// derived here always matches the on-disk document.
pub fn sha256_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(sha256_bytes(&serde_json::to_vec(value)?))
}

/// Derive chain ids from an ordered list of diff ids (bare hex, bottom
/// layer first).
///
/// The first chain id equals the first diff id; each following one is
/// `sha256("sha256:<parent chain> sha256:<diff>")`.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => sha256_bytes(format!("sha256:{parent} sha256:{diff_id}").as_bytes()),
        };
        chain.push(next);
    }
    chain
}
