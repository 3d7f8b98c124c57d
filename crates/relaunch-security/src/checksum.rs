use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

pub fn sha256_reader_hex<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns the actual digest alongside the verdict so callers can report it.
pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<(bool, String)> {
    let expected = normalize_digest(expected_hex)?;
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let actual = sha256_reader_hex(&mut file)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok((actual == expected, actual))
}

/// Extracts the digest from `sha256sum`-style output (`<hex>  <file>`) or a
/// bare digest. When several entries exist, the one naming `asset` wins.
pub fn parse_checksum_file(raw: &str, asset: &str) -> Result<String> {
    let mut first = None;
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut fields = line.split_whitespace();
        let Some(digest) = fields.next() else {
            continue;
        };
        let Ok(digest) = normalize_digest(digest) else {
            continue;
        };
        let named = fields
            .next()
            .map(|name| name.trim_start_matches('*'))
            .and_then(|name| name.rsplit('/').next());
        if named == Some(asset) {
            return Ok(digest);
        }
        if first.is_none() {
            first = Some(digest);
        }
    }

    first.ok_or_else(|| anyhow!("no sha256 digest found in checksum file"))
}

fn normalize_digest(value: &str) -> Result<String> {
    let trimmed = value.trim().to_ascii_lowercase();
    if trimmed.len() != 64 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid sha256 digest: '{value}'"));
    }
    Ok(trimmed)
}
