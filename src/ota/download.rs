//! Hash-verified downloader.
//!
//! The payload streams into `<dest>.part` while the digest is computed chunk by
//! chunk; the file only reaches `<dest>` after the digest matched and the data
//! was synced. Any failure removes the temporary file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::digest::{Sha256Digest, StreamingHasher};
use super::error::{OtaError, Result};
use super::source::{Chunk, HttpClient};

const CHUNK_SIZE: usize = 1024;

/// Whether the downloaded bytes must match a known digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestPolicy {
    Verify(Sha256Digest),
    /// Skip verification. Only for legacy local uploads, never for manifests.
    Unverified,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination_path: PathBuf,
    pub expected_digest: Option<Sha256Digest>,
    pub max_bytes: u64,
    /// Expected length when the manifest advertises one.
    pub expected_size: Option<u64>,
    allow_unverified: bool,
}

/// What a successful download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: Sha256Digest,
}

impl DownloadTask {
    pub fn new(source_url: impl Into<String>, destination_path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            source_url: source_url.into(),
            destination_path: destination_path.into(),
            expected_digest: None,
            max_bytes,
            expected_size: None,
            allow_unverified: false,
        }
    }

    pub fn expect_digest(mut self, digest: Sha256Digest) -> Self {
        self.expected_digest = Some(digest);
        self
    }

    pub fn expect_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    /// Explicitly accept a payload without a digest.
    pub fn allow_unverified(mut self) -> Self {
        self.allow_unverified = true;
        self
    }

    fn policy(&self) -> Result<DigestPolicy> {
        match (self.expected_digest, self.allow_unverified) {
            (Some(d), _) => Ok(DigestPolicy::Verify(d)),
            (None, true) => Ok(DigestPolicy::Unverified),
            (None, false) => Err(OtaError::InvalidDigest(
                "no expected sha256 and unverified download not permitted".into(),
            )),
        }
    }

    pub fn run(&self, client: &dyn HttpClient) -> Result<Downloaded> {
        let policy = self.policy()?;
        if let Some(size) = self.expected_size {
            if size > self.max_bytes {
                return Err(OtaError::SizeExceeded { limit: self.max_bytes });
            }
        }
        download(
            client,
            &self.source_url,
            &self.destination_path,
            policy,
            self.max_bytes,
            self.expected_size,
        )
    }
}

pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Stream `url` to `dest`. See the module docs for the guarantees.
pub fn download(
    client: &dyn HttpClient,
    url: &str,
    dest: &Path,
    policy: DigestPolicy,
    max_bytes: u64,
    expected_size: Option<u64>,
) -> Result<Downloaded> {
    let tmp = part_path(dest);
    log::info!("Downloading {} -> {}", url, dest.display());

    let result = stream_to_file(client, url, &tmp, max_bytes)
        .and_then(|(bytes, actual)| {
            check_integrity(policy, expected_size, bytes, &actual)?;
            Ok((bytes, actual))
        })
        .and_then(|(bytes, actual)| {
            publish(&tmp, dest)?;
            Ok(Downloaded {
                path: dest.to_path_buf(),
                bytes,
                sha256: actual,
            })
        });

    match result {
        Ok(done) => {
            log::info!("Saved {} ({} bytes, sha256 {})", dest.display(), done.bytes, done.sha256);
            Ok(done)
        }
        Err(e) => {
            if tmp.exists() {
                if let Err(rm) = fs::remove_file(&tmp) {
                    log::warn!("Failed to remove {}: {}", tmp.display(), rm);
                }
            }
            log::error!("Download of {} failed: {}", url, e);
            Err(e)
        }
    }
}

fn stream_to_file(
    client: &dyn HttpClient,
    url: &str,
    tmp: &Path,
    max_bytes: u64,
) -> Result<(u64, Sha256Digest)> {
    let mut file = File::create(tmp)?;
    let mut stream = client.get(url)?;
    let mut hasher = StreamingHasher::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = match stream.next_chunk(&mut buf)? {
            Chunk::End => break,
            Chunk::Data(n) => n,
        };
        if hasher.bytes() + n as u64 > max_bytes {
            return Err(OtaError::SizeExceeded { limit: max_bytes });
        }
        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
    }
    drop(stream);

    file.flush()?;
    file.sync_all()?;
    let bytes = hasher.bytes();
    Ok((bytes, hasher.finalize()))
}

fn check_integrity(
    policy: DigestPolicy,
    expected_size: Option<u64>,
    bytes: u64,
    actual: &Sha256Digest,
) -> Result<()> {
    if let Some(size) = expected_size {
        if size != bytes {
            return Err(OtaError::IntegrityMismatch {
                expected: format!("{} bytes", size),
                actual: format!("{} bytes", bytes),
            });
        }
    }
    match policy {
        DigestPolicy::Verify(expected) if expected != *actual => Err(OtaError::IntegrityMismatch {
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        }),
        DigestPolicy::Verify(_) => Ok(()),
        DigestPolicy::Unverified => {
            log::warn!("Accepting unverified download (sha256 {})", actual);
            Ok(())
        }
    }
}

/// Rename into place. If the destination exists and blocks the rename, remove it and retry once.
fn publish(tmp: &Path, dest: &Path) -> Result<()> {
    if fs::rename(tmp, dest).is_ok() {
        return Ok(());
    }
    if dest.is_dir() {
        fs::remove_dir_all(dest)?;
    } else if dest.exists() {
        fs::remove_file(dest)?;
    }
    fs::rename(tmp, dest)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ota::digest::{sha256_bytes, sha256_file};
    use crate::ota::source::{ByteSource, ReaderSource};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves fixed bodies by URL; counts requests.
    #[derive(Default)]
    pub(crate) struct StaticClient {
        pub bodies: HashMap<String, Vec<u8>>,
        pub requests: AtomicUsize,
    }

    impl StaticClient {
        pub(crate) fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.bodies.insert(url.to_string(), body.into());
            self
        }
    }

    impl HttpClient for StaticClient {
        fn get<'a>(&'a self, url: &str) -> Result<Box<dyn ByteSource + 'a>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let body = self
                .bodies
                .get(url)
                .ok_or_else(|| OtaError::Network(format!("connect {} refused", url)))?;
            Ok(Box::new(ReaderSource::new(Cursor::new(body.as_slice()))))
        }
    }

    #[test]
    fn verified_download_lands_at_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fw.zip");
        let payload = vec![7u8; 5000];
        let client = StaticClient::default().with("https://x/fw.zip", payload.clone());

        let done = DownloadTask::new("https://x/fw.zip", &dest, 10_000)
            .expect_digest(sha256_bytes(&payload))
            .run(&client)
            .unwrap();

        assert_eq!(done.bytes, 5000);
        assert_eq!(sha256_file(&dest).unwrap(), sha256_bytes(&payload));
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn mismatch_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.tflite");
        fs::write(&dest, b"old model").unwrap();
        let client = StaticClient::default().with("https://x/m", b"tampered".to_vec());

        let err = DownloadTask::new("https://x/m", &dest, 1024)
            .expect_digest(sha256_bytes(b"genuine"))
            .run(&client)
            .unwrap_err();

        assert!(matches!(err, OtaError::IntegrityMismatch { .. }));
        assert_eq!(fs::read(&dest).unwrap(), b"old model");
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn oversize_stream_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.bin");
        let payload = vec![1u8; 4096];
        let client = StaticClient::default().with("https://x/big", payload.clone());

        let err = DownloadTask::new("https://x/big", &dest, 4095)
            .expect_digest(sha256_bytes(&payload))
            .run(&client)
            .unwrap_err();

        assert!(matches!(err, OtaError::SizeExceeded { limit: 4095 }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn advertised_size_checked_before_and_after() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fw.zip");
        let client = StaticClient::default().with("https://x/fw", b"12345".to_vec());

        let err = DownloadTask::new("https://x/fw", &dest, 100)
            .expect_digest(sha256_bytes(b"12345"))
            .expect_size(Some(1000))
            .run(&client)
            .unwrap_err();
        assert!(matches!(err, OtaError::SizeExceeded { .. }));
        assert_eq!(client.requests.load(Ordering::SeqCst), 0);

        let err = DownloadTask::new("https://x/fw", &dest, 100)
            .expect_digest(sha256_bytes(b"12345"))
            .expect_size(Some(6))
            .run(&client)
            .unwrap_err();
        assert!(matches!(err, OtaError::IntegrityMismatch { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn missing_digest_requires_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("legacy.bin");
        let client = StaticClient::default().with("http://lan/legacy.bin", b"abc".to_vec());

        let err = DownloadTask::new("http://lan/legacy.bin", &dest, 100)
            .run(&client)
            .unwrap_err();
        assert!(matches!(err, OtaError::InvalidDigest(_)));
        assert_eq!(client.requests.load(Ordering::SeqCst), 0);

        DownloadTask::new("http://lan/legacy.bin", &dest, 100)
            .allow_unverified()
            .run(&client)
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
    }

    #[test]
    fn network_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fw.zip");
        let client = StaticClient::default();
        let err = DownloadTask::new("https://down/fw.zip", &dest, 100)
            .expect_digest(sha256_bytes(b""))
            .run(&client)
            .unwrap_err();
        assert!(matches!(err, OtaError::Network(_)));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn existing_directory_at_destination_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fw.zip");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("stale"), b"x").unwrap();
        let client = StaticClient::default().with("https://x/fw.zip", b"zip".to_vec());

        DownloadTask::new("https://x/fw.zip", &dest, 100)
            .expect_digest(sha256_bytes(b"zip"))
            .run(&client)
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"zip");
    }

    proptest::proptest! {
        #[test]
        fn any_single_byte_flip_is_rejected(
            payload in proptest::collection::vec(proptest::num::u8::ANY, 1..2048),
            index in proptest::num::usize::ANY,
            flip in 1u8..=255,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("fw.bin");
            let mut tampered = payload.clone();
            let i = index % tampered.len();
            tampered[i] ^= flip;
            let client = StaticClient::default().with("https://x/fw.bin", tampered);

            let result = DownloadTask::new("https://x/fw.bin", &dest, 4096)
                .expect_digest(sha256_bytes(&payload))
                .run(&client);

            let is_mismatch = matches!(result, Err(OtaError::IntegrityMismatch { .. }));
            proptest::prop_assert!(is_mismatch);
            proptest::prop_assert!(!dest.exists());
        }
    }
}
