use sha2::{Digest, Sha256};

/// Lower-case hex SHA-256 of the raw document bytes.
pub fn compute_content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
