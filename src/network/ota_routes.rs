// /ota request handling, independent of the HTTP server in use

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::OtaConfig;
use crate::network::validators;
use crate::ota::archive::{remove_dir_if_exists, ArchiveInstaller};
use crate::ota::download::DownloadTask;
use crate::ota::manifest::{fetch_manifest, parse_model, parse_update};
use crate::ota::marker::{InstallKind, UpdateMarker};
use crate::ota::source::HttpClient;
use crate::ota::OtaError;

pub const UPDATE_BUNDLE_NAME: &str = "github_update.zip";
pub const HTML_BUNDLE_NAME: &str = "html.zip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaResponse {
    pub status: u16,
    pub body: String,
}

impl OtaResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

#[derive(Debug)]
enum RouteError {
    BadRequest(String),
    Forbidden(String),
    Ota(OtaError),
}

impl RouteError {
    fn status(&self) -> u16 {
        match self {
            RouteError::BadRequest(_) => 400,
            RouteError::Forbidden(_) => 403,
            RouteError::Ota(e) => e.http_status(),
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::BadRequest(msg) | RouteError::Forbidden(msg) => f.write_str(msg),
            RouteError::Ota(e) => write!(f, "{}", e),
        }
    }
}

impl From<OtaError> for RouteError {
    fn from(err: OtaError) -> Self {
        RouteError::Ota(err)
    }
}

impl From<io::Error> for RouteError {
    fn from(err: io::Error) -> Self {
        RouteError::Ota(OtaError::Io(err))
    }
}

type RouteResult = std::result::Result<String, RouteError>;

/// Decode `application/x-www-form-urlencoded` text. Malformed escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let mut byte = [0u8; 1];
                match hex::decode_to_slice(&bytes[i + 1..i + 3], &mut byte) {
                    Ok(()) => {
                        out.push(byte[0]);
                        i += 2;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parsed `/ota` query. The first occurrence of a key wins.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OtaQuery {
    pub task: Option<String>,
    pub manifest: Option<String>,
    pub model: Option<String>,
    pub file: Option<String>,
    pub delete: Option<String>,
}

impl OtaQuery {
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut parsed = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let slot = match percent_decode(key).as_str() {
                "task" => &mut parsed.task,
                "manifest" => &mut parsed.manifest,
                "model" => &mut parsed.model,
                "file" => &mut parsed.file,
                "delete" => &mut parsed.delete,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(percent_decode(value));
            }
        }
        parsed
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub struct OtaService {
    config: OtaConfig,
    client: Arc<dyn HttpClient>,
    marker: UpdateMarker,
    installer: ArchiveInstaller,
}

impl OtaService {
    pub fn new(config: OtaConfig, client: Arc<dyn HttpClient>) -> Self {
        Self {
            marker: UpdateMarker::new(&config.update_marker),
            installer: ArchiveInstaller::new(config.asset_layout()),
            config,
            client,
        }
    }

    pub fn handle(&self, query: &str) -> OtaResponse {
        let query = OtaQuery::parse(query);
        log::debug!("handler_ota_update: {:?}", query);

        let result = match query.task.as_deref() {
            Some("download_update") => self.download_update(&query),
            Some("download_model") => self.download_model(&query),
            Some("emptyfirmwaredir") => self.empty_firmware_dir(),
            Some("update") => self.update(&query),
            Some("unziphtml") => self.unzip_html(),
            Some(other) if query.delete.is_none() => {
                Err(RouteError::BadRequest(format!("Unknown task '{}'", other)))
            }
            _ => match non_empty(&query.delete) {
                Some(name) => self.delete(name),
                None => Err(RouteError::BadRequest("ota without parameter".into())),
            },
        };

        match result {
            Ok(body) => OtaResponse::ok(body),
            Err(e) => {
                let status = e.status();
                if status >= 500 {
                    log::error!("OTA request failed ({}): {}", status, e);
                } else {
                    log::warn!("OTA request rejected ({}): {}", status, e);
                }
                OtaResponse {
                    status,
                    body: format!("{}\n", e),
                }
            }
        }
    }

    fn download_update(&self, query: &OtaQuery) -> RouteResult {
        let manifest_url = non_empty(&query.manifest)
            .ok_or_else(|| RouteError::BadRequest("Missing manifest URL (?manifest=...)".into()))?;
        validators::validate_url(manifest_url).map_err(|e| RouteError::BadRequest(e.to_string()))?;

        log::info!("Downloading update manifest: {}", manifest_url);
        let text = fetch_manifest(
            self.client.as_ref(),
            manifest_url,
            self.config.max_update_manifest_bytes,
        )?;
        let record = parse_update(&text)?;
        if let Some(tag) = &record.tag {
            log::info!("Manifest offers release {}", tag);
        }

        fs::create_dir_all(&self.config.firmware_dir)?;
        let dest = self.config.firmware_dir.join(UPDATE_BUNDLE_NAME);
        log::info!("Downloading update: {}", record.url);
        DownloadTask::new(&record.url, &dest, self.config.max_update_bytes)
            .expect_digest(record.sha256)
            .expect_size(record.size)
            .run(self.client.as_ref())?;

        self.marker.schedule(&dest, InstallKind::Update)?;
        Ok("reboot\n".into())
    }

    fn download_model(&self, query: &OtaQuery) -> RouteResult {
        let (manifest_url, model) = match (non_empty(&query.manifest), non_empty(&query.model)) {
            (Some(m), Some(n)) => (m, n),
            _ => {
                return Err(RouteError::BadRequest(
                    "Missing manifest URL or model name (?manifest=...&model=...)".into(),
                ))
            }
        };
        validators::validate_model_name(model)
            .map_err(|e| RouteError::Ota(OtaError::InvalidPath(e.to_string())))?;
        validators::validate_url(manifest_url).map_err(|e| RouteError::BadRequest(e.to_string()))?;

        log::info!("Downloading model manifest: {}", manifest_url);
        let text = fetch_manifest(
            self.client.as_ref(),
            manifest_url,
            self.config.max_model_manifest_bytes,
        )?;
        let record = parse_model(&text, model)?;

        fs::create_dir_all(&self.config.config_dir)?;
        let dest = self.config.config_dir.join(model);
        log::info!("Downloading model: {}", record.url);
        DownloadTask::new(&record.url, &dest, self.config.max_model_bytes)
            .expect_digest(record.sha256)
            .expect_size(record.size)
            .run(self.client.as_ref())?;
        Ok("ok\n".into())
    }

    fn empty_firmware_dir(&self) -> RouteResult {
        let dir = &self.config.firmware_dir;
        let mut removed = 0;
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.is_dir() {
                        remove_dir_if_exists(&path)?;
                    } else {
                        fs::remove_file(&path)?;
                    }
                    removed += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        log::info!("Emptied {} ({} entries)", dir.display(), removed);
        Ok("firmware directory deleted\n".into())
    }

    fn uploaded_file(&self, name: &str) -> std::result::Result<PathBuf, RouteError> {
        validators::validate_filename(name)
            .map_err(|e| RouteError::Ota(OtaError::InvalidPath(e.to_string())))?;
        Ok(self.config.firmware_dir.join(name))
    }

    fn update(&self, query: &OtaQuery) -> RouteResult {
        let name = non_empty(&query.file).ok_or_else(|| {
            RouteError::BadRequest("Update failed - no file specified (zip, bin, tfl, tflite)".into())
        })?;
        let path = self.uploaded_file(name)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "tfl" | "tflite" => {
                self.install_model_upload(&path, name)?;
                Ok("Neural Network File copied.\n".into())
            }
            "zip" | "bin" => {
                if !self.config.allow_unverified_local_update {
                    return Err(RouteError::Forbidden(
                        "Unverified local updates are disabled; use task=download_update".into(),
                    ));
                }
                if !path.is_file() {
                    return Err(OtaError::NotFound(path.display().to_string()).into());
                }
                log::warn!("Scheduling unverified local update {}", path.display());
                self.marker.schedule(&path, InstallKind::Update)?;
                Ok("reboot\n".into())
            }
            _ => Err(RouteError::BadRequest(
                "Update failed - no valid file specified (zip, bin, tfl, tflite)".into(),
            )),
        }
    }

    fn install_model_upload(&self, upload: &Path, name: &str) -> std::result::Result<(), RouteError> {
        if !upload.is_file() {
            return Err(OtaError::NotFound(upload.display().to_string()).into());
        }
        fs::create_dir_all(&self.config.config_dir)?;
        let out = self.config.config_dir.join(name);
        if out.exists() {
            fs::remove_file(&out)?;
        }
        fs::copy(upload, &out)?;
        fs::remove_file(upload)?;
        log::info!("Model {} installed", out.display());
        Ok(())
    }

    fn unzip_html(&self) -> RouteResult {
        let bundle = self.config.firmware_dir.join(HTML_BUNDLE_NAME);
        let files = self.installer.unzip_html(&bundle)?;
        Ok(format!(
            "Web interface updated ({} files)\nNo reboot necessary\n",
            files
        ))
    }

    fn delete(&self, name: &str) -> RouteResult {
        let path = self.uploaded_file(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Deleted {}", path.display());
                Ok("file deleted\n".into())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::error!("File does not exist: {}", path.display());
                Err(OtaError::NotFound(path.display().to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
