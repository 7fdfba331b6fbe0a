use std::path::Path;

use rand::{SeedableRng, rngs::StdRng};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the given bytes
pub fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Stable sample identity from its concept and source image path.
pub fn sample_key(concept: &str, image_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(concept.as_bytes());
    hasher.update([0u8]);
    hasher.update(image_path.as_os_str().as_encoded_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Derive a u64 seed from a base seed and a sequence of labelled parts.
pub fn derive_seed(seed: u64, parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// RNG for one sample, variation and (optionally) epoch
pub fn sample_rng(seed: u64, key: &str, variation: u32, epoch: Option<u64>) -> StdRng {
    let variation = variation.to_le_bytes();
    let derived = match epoch {
        Some(epoch) => {
            let epoch = epoch.to_le_bytes();
            derive_seed(seed, &[key.as_bytes(), variation.as_slice(), b"epoch".as_slice(), epoch.as_slice()])
        }
        None => derive_seed(seed, &[key.as_bytes(), variation.as_slice()]),
    };
    StdRng::seed_from_u64(derived)
}
