//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    collections::BTreeSet, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::gateway::{DEFAULT_FALLBACK_PATH, DEFAULT_WRITE_CACHE, Manifest, labels_of};

pub use cli::{
    CliArgs, Command, LoggingOverrides, OriginOverrides, PrefetchArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachegate";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_INDEX_FILE: &str = "demo.html";
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// `None` when neither `origin.base_url` nor `origin.directory` is configured.
    pub source: Option<OriginSource>,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginSource {
    Http(Url),
    Directory { root: PathBuf, index_file: String },
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub write_cache: String,
    pub fallback_path: String,
    pub whitelist: BTreeSet<String>,
    pub manifest: Manifest,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("CACHEGATE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Prefetch(args)) => {
            raw.apply_origin_overrides(&args.origin);
            raw.apply_logging_overrides(&args.logging);
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    gateway: RawGatewaySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        self.apply_origin_overrides(&overrides.origin);
        self.apply_logging_overrides(&overrides.logging);
    }

    /// A CLI origin replaces whichever origin kind the files configured.
    fn apply_origin_overrides(&mut self, overrides: &OriginOverrides) {
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.base_url = Some(url.clone());
            self.origin.directory = None;
        }
        if let Some(dir) = overrides.origin_dir.as_ref() {
            self.origin.directory = Some(dir.clone());
            self.origin.base_url = None;
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            gateway,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            origin: build_origin_settings(origin)?,
            gateway: build_gateway_settings(gateway)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let candidate = format!("{host}:{port}");
    let addr = candidate.parse::<SocketAddr>().map_err(|err| {
        LoadError::invalid("server.addr", format!("invalid address `{candidate}`: {err}"))
    })?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let base_url = non_blank(origin.base_url);
    let directory = origin
        .directory
        .filter(|path| !path.as_os_str().is_empty());

    let source = match (base_url, directory) {
        (Some(_), Some(_)) => {
            return Err(LoadError::invalid(
                "origin",
                "set only one of `base_url` or `directory`",
            ));
        }
        (Some(url), None) => {
            let parsed = Url::parse(&url).map_err(|err| {
                LoadError::invalid("origin.base_url", format!("invalid url `{url}`: {err}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "origin.base_url",
                    "scheme must be http or https",
                ));
            }
            Some(OriginSource::Http(parsed))
        }
        (None, Some(root)) => {
            let index_file = non_blank(origin.index_file)
                .unwrap_or_else(|| DEFAULT_INDEX_FILE.to_string());
            Some(OriginSource::Directory { root, index_file })
        }
        (None, None) => None,
    };

    let timeout_secs = origin
        .timeout_seconds
        .unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "origin.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let max_body_bytes = origin.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    if max_body_bytes == 0 {
        return Err(LoadError::invalid(
            "origin.max_body_bytes",
            "must be greater than zero",
        ));
    }
    let max_body_bytes = usize::try_from(max_body_bytes).map_err(|_| {
        LoadError::invalid(
            "origin.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(OriginSettings {
        source,
        timeout: Duration::from_secs(timeout_secs),
        max_body_bytes,
    })
}

fn build_gateway_settings(gateway: RawGatewaySettings) -> Result<GatewaySettings, LoadError> {
    let write_cache =
        non_blank(gateway.write_cache).unwrap_or_else(|| DEFAULT_WRITE_CACHE.to_string());

    let fallback_path =
        non_blank(gateway.fallback_path).unwrap_or_else(|| DEFAULT_FALLBACK_PATH.to_string());
    if !fallback_path.starts_with('/') {
        return Err(LoadError::invalid(
            "gateway.fallback_path",
            "path must start with `/`",
        ));
    }

    let manifest = gateway.manifest.unwrap_or_else(Manifest::offline_default);
    manifest
        .validate()
        .map_err(|reason| LoadError::invalid("gateway.manifest", reason))?;

    // Labels are kept verbatim; a whitelist that omits a manifest label is honored as written.
    let whitelist = match gateway.whitelist {
        Some(labels) => labels.into_iter().collect(),
        None => labels_of(&manifest),
    };

    Ok(GatewaySettings {
        write_cache,
        fallback_path,
        whitelist,
        manifest,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    base_url: Option<String>,
    directory: Option<PathBuf>,
    index_file: Option<String>,
    timeout_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGatewaySettings {
    write_cache: Option<String>,
    fallback_path: Option<String>,
    whitelist: Option<Vec<String>>,
    manifest: Option<Manifest>,
}
