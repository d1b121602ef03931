//! Content digests.

use sha2::{Digest, Sha256};

/// Returns the `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Whether a manifest reference is a digest rather than a tag.
pub fn is_digest(reference: &str) -> bool {
    match reference.split_once(':') {
        Some((algorithm, encoded)) => {
            !algorithm.is_empty()
                && !encoded.is_empty()
                && encoded.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Whether `data` hashes to `digest`. Only sha256 digests are understood.
pub fn verify(digest: &str, data: &[u8]) -> bool {
    digest.starts_with("sha256:") && sha256_digest(data) == digest
}
