//! Configuration parsing – reads a KEY=VALUE file (`snapcam.conf`), with
//! every key overridable from the environment.
//!
//! Both binaries load the same file; each ignores fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::pipeline::{Resolution, ResolutionSet};

/// Every key the loader understands.  Only these are looked up in the
/// environment, so unrelated variables never leak into the config.
const KNOWN_KEYS: &[&str] = &[
    "BUCKET_NAME",
    "BUCKET_ROOT",
    "BROKER_URL",
    "TLS_ROOT_CA",
    "TLS_CLIENT_CERT",
    "TLS_CLIENT_KEY",
    "COMMAND_TOPIC",
    "PREVIEW_TOPIC",
    "ACK_TOPIC",
    "OFFLINE_QUEUE_DEPTH",
    "DRAIN_HZ",
    "CONNECT_TIMEOUT_SECS",
    "OPERATION_TIMEOUT_SECS",
    "CAMERA_SOURCE",
    "TRANSIENT_DIR",
    "RESOLUTIONS",
    "STORED_RESOLUTION",
    "THUMBNAIL_RESOLUTION",
    "JPEG_QUALITY",
    "PENDING_TTL_SECS",
    "MAX_PENDING",
    "NACK_UNKNOWN_SAVES",
    "STATUS_LISTEN_ADDR",
    "PREVIEW_TIMEOUT_SECS",
    "ACK_TIMEOUT_SECS",
    "RETRY_BACKOFF_SECS",
];

const DEFAULT_RESOLUTIONS: &str = "1080p=1920x1080,720p=1280x720,480p=858x480,training=300x300";

/// Mutual-TLS material for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub root_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Application configuration, shared between the capture agent and the
/// trigger controller.
#[derive(Debug, Clone)]
pub struct Config {
    // ── broker (both) ────────────────────────────────────────────────
    pub broker_url: String,
    pub tls: Option<TlsFiles>,
    pub command_topic: String,
    pub preview_topic: String,
    pub ack_topic: String,
    /// Offline publish queue depth; 0 means unbounded.
    pub offline_queue_depth: usize,
    /// Messages per second when draining the offline queue.
    pub drain_hz: u32,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,

    // ── storage (capture) ────────────────────────────────────────────
    pub bucket_name: Option<String>,
    pub bucket_root: PathBuf,
    pub transient_dir: PathBuf,

    // ── camera / pipeline (capture) ──────────────────────────────────
    pub camera_source: String,
    pub resolutions: ResolutionSet,
    pub stored_resolution: String,
    pub thumbnail_resolution: String,
    pub jpeg_quality: u8,

    // ── pending registry (capture) ───────────────────────────────────
    pub pending_ttl: Duration,
    pub max_pending: usize,
    pub nack_unknown_saves: bool,

    // ── status server (capture) ──────────────────────────────────────
    pub status_listen_addr: String,

    // ── controller (trigger) ─────────────────────────────────────────
    pub preview_timeout: Duration,
    /// Zero disables waiting for the save acknowledgment.
    pub ack_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/snapcam/snapcam.conf"
    }

    /// The bucket name is mandatory on the device side.
    pub fn require_bucket(&self) -> Result<&str> {
        self.bucket_name
            .as_deref()
            .context("BUCKET_NAME is not set (required by the capture agent)")
    }

    /// Resolution used for the stored full image.
    pub fn stored(&self) -> Result<Resolution> {
        Ok(self.resolutions.get(&self.stored_resolution)?.clone())
    }

    /// Resolution used for the preview thumbnail.
    pub fn thumbnail(&self) -> Result<Resolution> {
        Ok(self.resolutions.get(&self.thumbnail_resolution)?.clone())
    }
}

/// Load the config file at `path` (if it exists) and apply environment
/// overrides on top.
pub fn load(path: &Path) -> Result<Config> {
    let mut map = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        parse_conf(&text)
    } else {
        warn!(
            "Config file {} not found – using environment and defaults",
            path.display()
        );
        HashMap::new()
    };

    for key in KNOWN_KEYS {
        if let Ok(val) = std::env::var(key) {
            map.insert((*key).to_string(), val);
        }
    }

    from_map(&map)
}

/// Build a [`Config`] from already-parsed key/value pairs.
pub fn from_map(map: &HashMap<String, String>) -> Result<Config> {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_secs = |key: &str, default: u64| Duration::from_secs(get_u64(key, default));
    let get_bool = |key: &str, default: bool| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(default)
    };

    let tls = match (get("TLS_ROOT_CA"), get("TLS_CLIENT_CERT"), get("TLS_CLIENT_KEY")) {
        (Some(ca), Some(cert), Some(key)) => Some(TlsFiles {
            root_ca: PathBuf::from(ca),
            client_cert: PathBuf::from(cert),
            client_key: PathBuf::from(key),
        }),
        (None, None, None) => None,
        _ => anyhow::bail!(
            "TLS_ROOT_CA, TLS_CLIENT_CERT and TLS_CLIENT_KEY must be set together"
        ),
    };

    let resolutions = ResolutionSet::parse(
        &get("RESOLUTIONS").unwrap_or_else(|| DEFAULT_RESOLUTIONS.into()),
    )
    .context("Invalid RESOLUTIONS")?;

    let config = Config {
        broker_url: get("BROKER_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
        tls,
        command_topic: get("COMMAND_TOPIC").unwrap_or_else(|| "trigger/snap".into()),
        preview_topic: get("PREVIEW_TOPIC").unwrap_or_else(|| "trigger/thumbnail".into()),
        ack_topic: get("ACK_TOPIC").unwrap_or_else(|| "snap/keys".into()),
        offline_queue_depth: get_u64("OFFLINE_QUEUE_DEPTH", 0) as usize,
        drain_hz: get_u64("DRAIN_HZ", 2).max(1) as u32,
        connect_timeout: get_secs("CONNECT_TIMEOUT_SECS", 5),
        operation_timeout: get_secs("OPERATION_TIMEOUT_SECS", 5),

        bucket_name: get("BUCKET_NAME"),
        bucket_root: PathBuf::from(get("BUCKET_ROOT").unwrap_or_else(|| "/data/buckets".into())),
        transient_dir: PathBuf::from(get("TRANSIENT_DIR").unwrap_or_else(|| "/tmp/snapcam".into())),

        camera_source: get("CAMERA_SOURCE").unwrap_or_else(|| "/opt/snapcam/frame.jpg".into()),
        resolutions,
        stored_resolution: get("STORED_RESOLUTION").unwrap_or_else(|| "training".into()),
        thumbnail_resolution: get("THUMBNAIL_RESOLUTION").unwrap_or_else(|| "training".into()),
        jpeg_quality: get_u64("JPEG_QUALITY", 90).clamp(1, 100) as u8,

        pending_ttl: get_secs("PENDING_TTL_SECS", 300),
        max_pending: get_u64("MAX_PENDING", 16).max(1) as usize,
        nack_unknown_saves: get_bool("NACK_UNKNOWN_SAVES", true),

        status_listen_addr: get("STATUS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8089".into()),

        preview_timeout: get_secs("PREVIEW_TIMEOUT_SECS", 10),
        ack_timeout: get_secs("ACK_TIMEOUT_SECS", 10),
        retry_backoff: get_secs("RETRY_BACKOFF_SECS", 5),
    };

    // Fail early on names that are not part of the resolution set.
    config.stored()?;
    config.thumbnail()?;

    Ok(config)
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
