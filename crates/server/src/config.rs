use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use lifecycle::{UploadPolicy, DEFAULT_ANALYSIS_TIMEOUT};
use serde::Deserialize;

const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub blob_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub accepted_formats: Vec<String>,
    /// Base URL of the detection service. `None` runs the scripted detector.
    pub detection_url: Option<String>,
    pub analysis_timeout: Duration,
    pub upload_chunk_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let policy = UploadPolicy::default();
        Self {
            server_bind: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/videos.db".into(),
            blob_dir: PathBuf::from("./data/blobs"),
            max_upload_bytes: policy.max_bytes,
            accepted_formats: policy.accepted_formats,
            detection_url: None,
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
            upload_chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl Settings {
    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_bytes: self.max_upload_bytes,
            accepted_formats: self.accepted_formats.clone(),
        }
    }
}

/// Keys accepted in `server.toml`. Everything is optional; missing keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    blob_dir: Option<PathBuf>,
    max_upload_bytes: Option<u64>,
    accepted_formats: Option<Vec<String>>,
    detection_url: Option<String>,
    analysis_timeout_seconds: Option<u64>,
    upload_chunk_bytes: Option<usize>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new("server.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then the optional TOML file at `path`, then environment variables looked up
/// through `env`.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__BLOB_DIR") {
        settings.blob_dir = PathBuf::from(v);
    }

    if let Some(v) = env("APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = v
            .trim()
            .parse()
            .with_context(|| format!("APP__MAX_UPLOAD_BYTES is not a byte count: '{v}'"))?;
    }

    if let Some(v) = env("APP__ACCEPTED_FORMATS") {
        settings.accepted_formats = parse_formats(v.split(','));
    }

    if let Some(v) = env("APP__DETECTION_URL") {
        let v = v.trim();
        settings.detection_url = (!v.is_empty()).then(|| v.to_string());
    }

    if let Some(v) = env("APP__ANALYSIS_TIMEOUT_SECONDS") {
        let seconds: u64 = v
            .trim()
            .parse()
            .with_context(|| format!("APP__ANALYSIS_TIMEOUT_SECONDS is not a number: '{v}'"))?;
        settings.analysis_timeout = Duration::from_secs(seconds);
    }

    if let Some(v) = env("APP__UPLOAD_CHUNK_BYTES") {
        settings.upload_chunk_bytes = v
            .trim()
            .parse()
            .with_context(|| format!("APP__UPLOAD_CHUNK_BYTES is not a byte count: '{v}'"))?;
    }

    if settings.accepted_formats.is_empty() {
        anyhow::bail!("at least one accepted container format is required");
    }
    if settings.analysis_timeout.is_zero() {
        anyhow::bail!("analysis timeout must be positive");
    }

    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.blob_dir {
        settings.blob_dir = v;
    }
    if let Some(v) = file_cfg.max_upload_bytes {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = file_cfg.accepted_formats {
        settings.accepted_formats = parse_formats(v.iter().map(String::as_str));
    }
    if let Some(v) = file_cfg.detection_url {
        settings.detection_url = Some(v);
    }
    if let Some(v) = file_cfg.analysis_timeout_seconds {
        settings.analysis_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.upload_chunk_bytes {
        settings.upload_chunk_bytes = v;
    }
}

fn parse_formats<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    raw.map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .collect()
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
