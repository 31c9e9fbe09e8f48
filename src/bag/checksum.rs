//! Full-file SHA-256 checksums

use crate::error::{BagError, IoContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const SHA256: &str = "sha256";

const READ_CHUNK: usize = 64 * 1024;

/// Algorithm name plus lowercase hex digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: String,
    pub hash: String,
}

impl Checksum {
    pub fn sha256(hash: impl Into<String>) -> Self {
        Checksum {
            algorithm: SHA256.to_string(),
            hash: hash.into().to_ascii_lowercase(),
        }
    }

    /// Read the checksum out of a descriptive record
    ///
    /// Accepts both `{"algorithm": {"tag": "sha256"}, ...}` and a bare
    /// algorithm string.
    pub fn from_record(record: &Value) -> Option<Self> {
        let cs = record.get("checksum")?;
        let hash = cs.get("hash")?.as_str()?;
        let algorithm = match cs.get("algorithm") {
            Some(Value::String(s)) => s.clone(),
            Some(alg) => alg.get("tag")?.as_str()?.to_string(),
            None => SHA256.to_string(),
        };
        Some(Checksum {
            algorithm,
            hash: hash.to_ascii_lowercase(),
        })
    }
}

/// Hash every byte of a file
///
/// Returns the hex digest and the number of bytes read.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).ctx("open for hashing", path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).ctx("read for hashing", path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Recompute a file's digest and compare it with an expected checksum
pub fn verify_file(path: &Path, expected: &Checksum) -> Result<bool> {
    if expected.algorithm != SHA256 {
        return Err(BagError::invalid(format!(
            "unsupported checksum algorithm '{}' for {}",
            expected.algorithm,
            path.display()
        )));
    }
    let (hash, _) = sha256_file(path)?;
    Ok(hash == expected.hash)
}
