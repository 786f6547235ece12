//! Update manifest: where to fetch a firmware bundle or a model, and its sha256.
//!
//! ```json
//! {"update": {"url": "...", "sha256": "<64 hex>", "tag": "v16.0.0", "size": 1234},
//!  "models": [{"name": "dig.tflite", "url": "...", "sha256": "<64 hex>"}]}
//! ```

use serde::Deserialize;

use super::digest::Sha256Digest;
use super::error::{OtaError, Result};
use super::source::{Chunk, HttpClient};

const READ_CHUNK: usize = 512;

/// A manifest entry that passed validation: both fields present, digest well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub url: String,
    pub sha256: Sha256Digest,
    pub tag: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateManifest {
    #[serde(default)]
    pub update: Option<RawEntry>,
    #[serde(default)]
    pub models: Option<Vec<RawEntry>>,
}

/// Entry as it appears on the wire. Unknown fields are ignored; type
/// mismatches on the known ones make the whole manifest invalid.
#[derive(Debug, Default, Deserialize)]
pub struct RawEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl UpdateManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: UpdateManifest = serde_json::from_str(text)?;
        Ok(manifest)
    }
}

impl RawEntry {
    fn into_record(self, what: &str) -> Result<ManifestRecord> {
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| OtaError::InvalidManifest(format!("{} entry has no url", what)))?;
        let sha256 = self
            .sha256
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| OtaError::InvalidManifest(format!("{} entry has no sha256", what)))?;
        let sha256 = sha256.trim().parse::<Sha256Digest>()?;
        Ok(ManifestRecord {
            url: url.trim().to_string(),
            sha256,
            tag: self.tag,
            size: self.size,
        })
    }
}

/// Stream a manifest into memory, refusing to grow past `max_bytes`.
pub fn fetch_manifest(client: &dyn HttpClient, url: &str, max_bytes: usize) -> Result<String> {
    let mut stream = client.get(url)?;
    let mut body = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.next_chunk(&mut buf)? {
            Chunk::End => break,
            Chunk::Data(n) => {
                if body.len() + n > max_bytes {
                    log::error!("Manifest {} exceeds {} bytes", url, max_bytes);
                    return Err(OtaError::SizeExceeded {
                        limit: max_bytes as u64,
                    });
                }
                body.extend_from_slice(&buf[..n]);
            }
        }
    }
    String::from_utf8(body).map_err(|_| OtaError::InvalidManifest("manifest is not UTF-8".into()))
}

/// Firmware bundle entry (`update.url`, `update.sha256`).
pub fn parse_update(text: &str) -> Result<ManifestRecord> {
    let manifest = UpdateManifest::parse(text)?;
    manifest
        .update
        .ok_or_else(|| OtaError::NotFound("manifest has no update entry".into()))?
        .into_record("update")
}

/// Model entry matched by exact name. Entries without a name are skipped.
pub fn parse_model(text: &str, name: &str) -> Result<ManifestRecord> {
    let manifest = UpdateManifest::parse(text)?;
    let models = manifest
        .models
        .ok_or_else(|| OtaError::NotFound("manifest has no models list".into()))?;
    models
        .into_iter()
        .find(|m| m.name.as_deref() == Some(name))
        .ok_or_else(|| OtaError::NotFound(format!("model {} not in manifest", name)))?
        .into_record("model")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn update_entry_with_extra_fields() {
        let text = format!(
            r#"{{"generated_at":"2024-01-01","repo":"o/r",
                "update":{{"url":"https://x/fw.zip","sha256":"{}","tag":"v1","size":42,"extra":true}}}}"#,
            SHA
        );
        let rec = parse_update(&text).unwrap();
        assert_eq!(rec.url, "https://x/fw.zip");
        assert_eq!(rec.sha256.to_hex(), SHA);
        assert_eq!(rec.tag.as_deref(), Some("v1"));
        assert_eq!(rec.size, Some(42));
    }

    #[test]
    fn missing_update_is_not_found() {
        assert!(matches!(parse_update(r#"{"models":[]}"#), Err(OtaError::NotFound(_))));
    }

    #[test]
    fn update_without_sha_is_invalid() {
        let err = parse_update(r#"{"update":{"url":"https://x/fw.zip"}}"#).unwrap_err();
        assert!(matches!(err, OtaError::InvalidManifest(_)));
        let err = parse_update(r#"{"update":{"url":"","sha256":"00"}}"#).unwrap_err();
        assert!(matches!(err, OtaError::InvalidManifest(_)));
    }

    #[test]
    fn short_digest_is_invalid_digest() {
        let text = format!(r#"{{"update":{{"url":"https://x/fw.zip","sha256":"{}"}}}}"#, &SHA[..63]);
        assert!(matches!(parse_update(&text), Err(OtaError::InvalidDigest(_))));
    }

    #[test]
    fn garbage_is_invalid_manifest() {
        assert!(matches!(parse_update("not json"), Err(OtaError::InvalidManifest(_))));
        assert!(matches!(parse_update("[1,2]"), Err(OtaError::InvalidManifest(_))));
    }

    #[test]
    fn model_lookup_by_name() {
        let text = format!(
            r#"{{"models":[{{"url":"https://x/nameless","sha256":"{sha}"}},
                 {{"name":"dig-class100.tflite","url":"https://x/a.tflite","sha256":"{sha}"}},
                 {{"name":"ana-cont.tflite","url":"https://x/b.tflite","sha256":"{sha}"}}]}}"#,
            sha = SHA
        );
        let rec = parse_model(&text, "ana-cont.tflite").unwrap();
        assert_eq!(rec.url, "https://x/b.tflite");
        assert!(matches!(parse_model(&text, "missing.tfl"), Err(OtaError::NotFound(_))));
        assert!(matches!(parse_model("{}", "a"), Err(OtaError::NotFound(_))));
    }
}
