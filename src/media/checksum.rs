use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::BuildError;

/// File name to lowercase hex digest, as listed in a `SHA256SUMS` file.
pub type Checksums = BTreeMap<String, String>;

/// Parse a checksum listing of `<hex> *<file>` (binary) or `<hex>  <file>`
/// (text) lines. Parsing stops at the first empty line.
pub fn extract_checksums(content: &[u8]) -> Result<Checksums, BuildError> {
    let text = String::from_utf8_lossy(content);
    let mut sums = Checksums::new();
    for (index, raw) in text.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            break;
        }
        let (digest, name) = split_line(line).ok_or_else(|| BuildError::MalformedChecksumFile {
            line: index + 1,
            content: line.to_string(),
        })?;
        sums.insert(name.to_string(), digest.to_ascii_lowercase());
    }
    Ok(sums)
}

fn split_line(line: &str) -> Option<(&str, &str)> {
    [" *", "  "].iter().find_map(|sep| {
        let fields: Vec<&str> = line.split(sep).collect();
        match fields.as_slice() {
            [digest, name] if !digest.is_empty() && !name.is_empty() => Some((*digest, *name)),
            _ => None,
        }
    })
}

pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Stream a file through SHA-256 without loading it into memory.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare `actual` against the entry for `file_name` and return the expected digest.
pub fn verify_digest(file_name: &str, actual: &str, sums: &Checksums) -> Result<String, BuildError> {
    let expected = sums
        .get(file_name)
        .ok_or_else(|| BuildError::MissingChecksumEntry(file_name.to_string()))?;
    if !expected.eq_ignore_ascii_case(actual) {
        return Err(BuildError::ChecksumMismatch {
            file: file_name.to_string(),
            expected: expected.clone(),
            actual: actual.to_string(),
        });
    }
    Ok(expected.clone())
}
