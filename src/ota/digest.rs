use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use super::error::OtaError;

pub const SHA256_LEN: usize = 32;

/// A parsed SHA-256 value. Only constructible from exactly 64 hex characters.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sha256Digest([u8; SHA256_LEN]);

impl Sha256Digest {
    pub fn as_bytes(&self) -> &[u8; SHA256_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Sha256Digest {
    type Err = OtaError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.len() != SHA256_LEN * 2 {
            return Err(OtaError::InvalidDigest(format!(
                "expected {} hex characters, got {}",
                SHA256_LEN * 2,
                text.len()
            )));
        }
        let mut out = [0u8; SHA256_LEN];
        hex::decode_to_slice(text, &mut out)
            .map_err(|e| OtaError::InvalidDigest(format!("{}: {}", text, e)))?;
        Ok(Self(out))
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

/// Running digest fed chunk by chunk while a payload streams to disk.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Sha256Digest {
        let mut out = [0u8; SHA256_LEN];
        out.copy_from_slice(&self.inner.finalize());
        Sha256Digest(out)
    }
}

pub fn sha256_bytes(data: &[u8]) -> Sha256Digest {
    let mut hasher = StreamingHasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn sha256_file(path: &Path) -> std::io::Result<Sha256Digest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = StreamingHasher::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn known_vector() {
        assert_eq!(sha256_bytes(b"abc").to_hex(), ABC);
    }

    #[test]
    fn parse_is_case_insensitive() {
        let upper: Sha256Digest = ABC.to_uppercase().parse().unwrap();
        assert_eq!(upper, sha256_bytes(b"abc"));
        assert_eq!(upper.to_hex(), ABC);
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!(matches!(
            ABC[..63].parse::<Sha256Digest>(),
            Err(OtaError::InvalidDigest(_))
        ));
        let mut bad = ABC.to_string();
        bad.replace_range(10..11, "g");
        assert!(matches!(bad.parse::<Sha256Digest>(), Err(OtaError::InvalidDigest(_))));
        assert!("".parse::<Sha256Digest>().is_err());
    }

    #[test]
    fn streaming_equals_one_shot() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"a");
        hasher.update(b"bc");
        assert_eq!(hasher.bytes(), 3);
        assert_eq!(hasher.finalize().to_hex(), ABC);
    }
}
