//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{CliArgs, Command, GenerateArgs, GeneratorOverrides, ServeArgs, ServeOverrides};

use crate::application::identity::DEFAULT_PLATFORM_HEADER;
use crate::cache::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECONDS};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "qrverse";
const ENV_PREFIX: &str = "QRVERSE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_GENERATOR_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_GENERATOR_MODEL: &str = "gpt-4o-mini";
const DEFAULT_GENERATOR_TIMEOUT_SECS: u64 = 30;
const DEFAULT_GENERATOR_TEMPERATURE: f32 = 1.0;
const MAX_GENERATOR_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub identity: IdentitySettings,
    pub generator: GeneratorSettings,
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
pub struct CacheSettings {
    pub ttl: time::Duration,
    pub max_entries: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub platform_header: HeaderName,
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub api_base: Url,
    pub model: String,
    /// Needed to serve or generate; loading succeeds without it.
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Generate(args)) => raw.apply_generator_overrides(&args.generator),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

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
    cache: RawCacheSettings,
    identity: RawIdentitySettings,
    generator: RawGeneratorSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }

        self.apply_generator_overrides(&overrides.generator);
    }

    fn apply_generator_overrides(&mut self, overrides: &GeneratorOverrides) {
        if let Some(model) = overrides.model.as_ref() {
            self.generator.model = Some(model.clone());
        }
        if let Some(api_base) = overrides.api_base.as_ref() {
            self.generator.api_base = Some(api_base.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            identity,
            generator,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            identity: build_identity_settings(identity)?,
            generator: build_generator_settings(generator)?,
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

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl_seconds = cache.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);
    if ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.ttl_seconds",
            "must be greater than zero",
        ));
    }
    let ttl_seconds = i64::try_from(ttl_seconds)
        .map_err(|_| LoadError::invalid("cache.ttl_seconds", "value is too large"))?;

    let max_entries = cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
    let max_entries = NonZeroUsize::new(max_entries)
        .ok_or_else(|| LoadError::invalid("cache.max_entries", "must be greater than zero"))?;

    Ok(CacheSettings {
        ttl: time::Duration::seconds(ttl_seconds),
        max_entries,
    })
}

fn build_identity_settings(identity: RawIdentitySettings) -> Result<IdentitySettings, LoadError> {
    let name = identity
        .platform_header
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_PLATFORM_HEADER.to_string());

    let platform_header = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
        LoadError::invalid(
            "identity.platform_header",
            format!("`{name}` is not a valid header name: {err}"),
        )
    })?;

    Ok(IdentitySettings { platform_header })
}

fn build_generator_settings(
    generator: RawGeneratorSettings,
) -> Result<GeneratorSettings, LoadError> {
    let raw_base = generator
        .api_base
        .unwrap_or_else(|| DEFAULT_GENERATOR_API_BASE.to_string());
    let api_base = Url::parse(raw_base.trim()).map_err(|err| {
        LoadError::invalid("generator.api_base", format!("failed to parse: {err}"))
    })?;
    if !matches!(api_base.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "generator.api_base",
            "scheme must be http or https",
        ));
    }

    let model = generator
        .model
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_GENERATOR_MODEL.to_string());
    if model.is_empty() {
        return Err(LoadError::invalid("generator.model", "must not be empty"));
    }

    let api_key = generator.api_key.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let timeout_secs = generator
        .timeout_seconds
        .unwrap_or(DEFAULT_GENERATOR_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "generator.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let temperature = generator
        .temperature
        .unwrap_or(DEFAULT_GENERATOR_TEMPERATURE);
    if !(0.0..=MAX_GENERATOR_TEMPERATURE).contains(&temperature) {
        return Err(LoadError::invalid(
            "generator.temperature",
            format!("must be between 0 and {MAX_GENERATOR_TEMPERATURE}"),
        ));
    }

    Ok(GeneratorSettings {
        api_base,
        model,
        api_key,
        timeout: Duration::from_secs(timeout_secs),
        temperature,
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
struct RawCacheSettings {
    ttl_seconds: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdentitySettings {
    platform_header: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGeneratorSettings {
    api_base: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_seconds: Option<u64>,
    temperature: Option<f32>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
