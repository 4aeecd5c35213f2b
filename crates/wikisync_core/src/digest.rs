use sha2::{Digest, Sha256};

/// First 8 bytes of SHA-256, hex encoded.
pub fn compute_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
