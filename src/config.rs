//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use serde::Deserialize;
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};
use config::{Config, File, FileFormat};
use url::Url;

use crate::errors::IndexerError;
use crate::schema::IndexSchema;
use crate::snapshot::SnapshotFormat;

/// tantivy refuses writer budgets below this per indexing thread.
pub const MIN_WRITER_HEAP_BYTES: usize = 15_000_000;

/// Top-level application settings loaded from `Config.toml`
/// and then overridden (where applicable) by environment variables.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    /// The index server: HTTP surface, schema and snapshot file
    pub server: ServerSettings,

    /// The log-shipping transport
    pub transport: TransportSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    /// HTTP bind address (e.g. "127.0.0.1:6200")
    pub bind: String,

    /// Prefix every index route is mounted under (e.g. "/logs")
    pub prefix: String,

    /// Tracing filter used when `RUST_LOG` is not set
    pub log_level: String,

    /// Fields handed to the index at creation time
    pub schema: IndexSchema,

    pub snapshot: SnapshotSettings,

    /// Memory budget of the index writer, in bytes
    pub writer_heap_bytes: usize,

    /// Largest request body accepted by the index routes, in bytes
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "127.0.0.1:6200".into(),
            prefix: "/".into(),
            log_level: "info".into(),
            schema: IndexSchema::default(),
            snapshot: SnapshotSettings::default(),
            writer_heap_bytes: 50_000_000,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Where and how the index is persisted on shutdown.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotSettings {
    pub path: PathBuf,
    pub format: SnapshotFormat,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        SnapshotSettings {
            path: PathBuf::from("./logs.snapshot"),
            format: SnapshotFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportSettings {
    /// Base URL of the index server, prefix included
    pub url: String,

    /// Records per batch; a full buffer is shipped immediately
    pub batch_size: usize,

    /// Longest a partial batch waits before it is shipped (e.g. "5s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Extra attempts after the first failed submission
    pub max_retries: u32,

    /// Pause between attempts (e.g. "1s")
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            url: "http://127.0.0.1:6200".into(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 5,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `APP__SERVER_BIND`, `APP__SERVER_PREFIX`, `APP__LOG_LEVEL`
    /// - `APP__SNAPSHOT_PATH`, `APP__SNAPSHOT_FORMAT`, `APP__MAX_BODY_BYTES`
    /// - `APP__TRANSPORT_URL`, `APP__BATCH_SIZE`, `APP__FLUSH_INTERVAL`,
    ///   `APP__MAX_RETRIES`, `APP__RETRY_INTERVAL`
    pub fn new() -> Result<Self, IndexerError> {
        let cfg = Config::builder()
            .add_source(File::with_name("Config").required(false))
            .build()?;

        let mut settings: Settings = cfg.try_deserialize()?;
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text, without touching the environment.
    pub fn from_toml(text: &str) -> Result<Self, IndexerError> {
        let cfg = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `APP__…` overrides, reading each variable through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), IndexerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("APP__SERVER_BIND") {
            self.server.bind = val;
        }
        if let Some(val) = lookup("APP__SERVER_PREFIX") {
            self.server.prefix = val;
        }
        if let Some(val) = lookup("APP__LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Some(val) = lookup("APP__SNAPSHOT_PATH") {
            self.server.snapshot.path = PathBuf::from(val);
        }
        if let Some(val) = lookup("APP__SNAPSHOT_FORMAT") {
            self.server.snapshot.format = val.parse()?;
        }
        if let Some(val) = lookup("APP__MAX_BODY_BYTES") {
            self.server.max_body_bytes = val
                .parse()
                .map_err(|e| IndexerError::InvalidSetting("server.max_body_bytes", format!("{e}")))?;
        }
        if let Some(val) = lookup("APP__TRANSPORT_URL") {
            self.transport.url = val;
        }
        if let Some(val) = lookup("APP__BATCH_SIZE") {
            self.transport.batch_size = val
                .parse()
                .map_err(|e| IndexerError::InvalidSetting("transport.batch_size", format!("{e}")))?;
        }
        if let Some(val) = lookup("APP__FLUSH_INTERVAL") {
            self.transport.flush_interval = parse_duration("transport.flush_interval", &val)?;
        }
        if let Some(val) = lookup("APP__MAX_RETRIES") {
            self.transport.max_retries = val
                .parse()
                .map_err(|e| IndexerError::InvalidSetting("transport.max_retries", format!("{e}")))?;
        }
        if let Some(val) = lookup("APP__RETRY_INTERVAL") {
            self.transport.retry_interval = parse_duration("transport.retry_interval", &val)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        self.server.validate()?;
        self.transport.validate()
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> Result<SocketAddr, IndexerError> {
        self.bind
            .parse()
            .map_err(|e| IndexerError::InvalidSetting("server.bind", format!("{e}")))
    }

    /// The prefix with a leading slash and no trailing slash; `""` for the root.
    pub fn route_prefix(&self) -> String {
        let trimmed = self.prefix.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }

    fn validate(&self) -> Result<(), IndexerError> {
        self.bind_addr()?;
        self.schema.check()?;
        if self.writer_heap_bytes < MIN_WRITER_HEAP_BYTES {
            return Err(IndexerError::InvalidSetting(
                "server.writer_heap_bytes",
                format!("must be at least {MIN_WRITER_HEAP_BYTES}"),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(IndexerError::InvalidSetting(
                "server.max_body_bytes",
                "must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl TransportSettings {
    /// Full URL of the bulk-insert route.
    pub fn bulk_url(&self) -> Result<Url, IndexerError> {
        let base = self.url.trim_end_matches('/');
        let bulk = format!("{base}/bulk");
        Url::parse(&bulk).map_err(|e| IndexerError::Url(bulk, e))
    }

    fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::InvalidSetting(
                "transport.batch_size",
                "must be at least 1".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(IndexerError::InvalidSetting(
                "transport.flush_interval",
                "must be greater than zero".into(),
            ));
        }
        self.bulk_url().map(|_| ())
    }
}

fn parse_duration(key: &'static str, val: &str) -> Result<Duration, IndexerError> {
    humantime::parse_duration(val).map_err(|e| IndexerError::InvalidSetting(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::schema::FieldKind;

    #[test]
    fn defaults_apply_without_a_file() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.server.bind, "127.0.0.1:6200");
        assert_eq!(settings.server.route_prefix(), "");
        assert_eq!(settings.server.schema, IndexSchema::default());
        assert_eq!(settings.server.snapshot.format, SnapshotFormat::Json);
        assert_eq!(settings.transport.batch_size, 100);
        assert_eq!(settings.transport.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn toml_sections_are_read() {
        let settings = Settings::from_toml(
            r#"
            [server]
            bind = "0.0.0.0:7000"
            prefix = "/logs/"

            [server.snapshot]
            path = "/var/lib/logs/index.msgpack"
            format = "binary"

            [server.schema]
            msg = "string"
            level = "number"
            sampled = "boolean"

            [transport]
            url = "http://collector:7000/logs"
            batch_size = 10
            flush_interval = "250ms"
            max_retries = 2
            retry_interval = "100ms"
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.route_prefix(), "/logs");
        assert_eq!(settings.server.snapshot.format, SnapshotFormat::Binary);
        assert_eq!(settings.server.schema.get("sampled"), Some(FieldKind::Boolean));
        assert_eq!(settings.server.schema.len(), 3);
        assert_eq!(settings.transport.flush_interval, Duration::from_millis(250));
        assert_eq!(
            settings.transport.bulk_url().unwrap().as_str(),
            "http://collector:7000/logs/bulk"
        );
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("APP__SERVER_BIND", "127.0.0.1:9999"),
            ("APP__SNAPSHOT_FORMAT", "binary"),
            ("APP__BATCH_SIZE", "7"),
            ("APP__FLUSH_INTERVAL", "2s"),
            ("APP__MAX_BODY_BYTES", "4096"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.server.bind, "127.0.0.1:9999");
        assert_eq!(settings.server.snapshot.format, SnapshotFormat::Binary);
        assert_eq!(settings.transport.batch_size, 7);
        assert_eq!(settings.transport.flush_interval, Duration::from_secs(2));
        assert_eq!(settings.server.max_body_bytes, 4096);
    }

    #[test]
    fn bad_override_is_reported() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|key| (key == "APP__MAX_RETRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, IndexerError::InvalidSetting("transport.max_retries", _)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::from_toml("[transport]\nbatch_size = 0").is_err());
        assert!(Settings::from_toml("[transport]\nflush_interval = \"0s\"").is_err());
        assert!(Settings::from_toml("[transport]\nurl = \"not a url\"").is_err());
        assert!(Settings::from_toml("[server]\nbind = \"nowhere\"").is_err());
        assert!(Settings::from_toml("[server]\nwriter_heap_bytes = 1024").is_err());
        assert!(Settings::from_toml("[server]\nmax_body_bytes = 0").is_err());
    }
}
