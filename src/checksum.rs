//! Checksum and hashing utilities.

use anyhow::Result;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Running additive checksum over received bytes (sum of byte values,
/// wrapping at 2^32). Deliberately weak: this is an integrity smoke test
/// against decode/write corruption on a constrained device, not a
/// cryptographic digest. The wire shape leaves room to swap in CRC32.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdditiveChecksum {
    sum: u32,
}

impl AdditiveChecksum {
    pub fn new() -> Self {
        Self { sum: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.sum = self.sum.wrapping_add(b as u32);
        }
    }

    pub fn value(&self) -> u32 {
        self.sum
    }

    pub fn reset(&mut self) {
        self.sum = 0;
    }
}

/// One-shot additive checksum of a byte slice.
pub fn additive_checksum(data: &[u8]) -> u32 {
    let mut c = AdditiveChecksum::new();
    c.update(data);
    c.value()
}

/// Recompute the additive checksum of a stored file in one streaming pass.
/// Used to cross-check the incrementally maintained value after sealing.
pub fn checksum_file(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 16 * 1024];
    let mut sum = AdditiveChecksum::new();
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sum.update(&buffer[..n]);
    }
    Ok(sum.value())
}

/// Strong content hash for post-apply verification (staged vs. installed).
pub fn hash_file_blake3(path: &Path) -> Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut file = File::open(path)?;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}
