//! Application settings and configuration management

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::client::traits::ClientConfig;
use crate::client::types::{ApiVersion, GenerationRequest, ImageSize, Quality, Style};
use crate::error::Result;
use crate::queue::DispatcherConfig;

/// Settings file read when nothing else is specified
pub const DEFAULT_SETTINGS_PATH: &str = "settings.json";

/// Env var naming an alternative settings file
pub const SETTINGS_PATH_ENV: &str = "DALLE_STUDIO_SETTINGS";

const ENV_PREFIX: &str = "DALLE_STUDIO";

/// Root configuration structure
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub connection: ConnectionSettings,
    pub generation: GenerationDefaults,
    pub save_dir: PathBuf,
    pub timeout_ms: u64,
    pub dispatch_margin_ms: u64,
    pub max_queue_size: usize,
    /// Job records kept before the oldest finished ones are forgotten
    pub max_jobs: usize,
}

/// Server configuration
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Prefill values for the connection form
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSettings {
    #[serde(skip_serializing)]
    pub key: String,
    pub endpoint: String,
    pub deployment: String,
    pub api_version: ApiVersion,
    pub rpm: u32,
}

/// Prefill values for the generation form
#[derive(Debug, Clone, Serialize)]
pub struct GenerationDefaults {
    pub num: u32,
    pub style: Style,
    pub quality: Quality,
    pub size: ImageSize,
    pub as_is: bool,
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("./saved_images")
}

fn default_deployment() -> String {
    "Dalle3".to_string()
}

fn default_rpm() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_dispatch_margin_ms() -> u64 {
    1_000
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_jobs() -> usize {
    500
}

impl Settings {
    /// Load settings from the default file (or `DALLE_STUDIO_SETTINGS`) and
    /// environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(SETTINGS_PATH_ENV)
            .unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load settings from a specific file.
    ///
    /// A missing file is fine. A file that cannot be parsed is ignored with a
    /// warning, and every invalid value falls back to its default.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            info!(path = %path.display(), "Found setting file");
        }

        let config = match Self::builder(Some(path))?.build() {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse setting file, using defaults");
                Self::builder(None)?.build()?
            }
        };

        Ok(Self::from_config(&config))
    }

    fn builder(path: Option<&Path>) -> Result<ConfigBuilder<DefaultState>> {
        let mut builder = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        // Override with environment variables (prefixed with DALLE_STUDIO__)
        Ok(builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        ))
    }

    /// Pick every field out of a built config, falling back per field
    pub fn from_config(config: &Config) -> Self {
        let server = ServerConfig {
            host: config
                .get_string("server.host")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: read_or(config, "server.port", 8080u16, |v: i64| u16::try_from(v).ok()),
        };

        let logging = LoggingConfig {
            level: config
                .get_string("logging.level")
                .unwrap_or_else(|_| "info".to_string()),
            format: read_choice(config, "logging.format", LogFormat::Pretty),
        };

        let connection = ConnectionSettings {
            key: config.get_string("key").unwrap_or_default(),
            endpoint: config.get_string("endpoint").unwrap_or_default(),
            deployment: config
                .get_string("deployment")
                .ok()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(default_deployment),
            api_version: read_choice(config, "api_version", ApiVersion::default()),
            rpm: read_or(config, "rpm", default_rpm(), |v: i64| {
                u32::try_from(v).ok().filter(|v| *v > 0)
            }),
        };

        let generation = GenerationDefaults {
            num: read_num(config),
            style: read_choice(config, "style", Style::default()),
            quality: read_choice(config, "quality", Quality::default()),
            size: read_choice(config, "size", ImageSize::default()),
            as_is: read_bool(config, "as_is"),
        };

        let save_dir = config
            .get_string("save_dir")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_save_dir);

        Self {
            server,
            logging,
            connection,
            generation,
            save_dir,
            timeout_ms: read_or(config, "timeout_ms", default_timeout_ms(), |v: i64| {
                u64::try_from(v).ok().filter(|v| *v > 0)
            }),
            dispatch_margin_ms: read_or(
                config,
                "dispatch_margin_ms",
                default_dispatch_margin_ms(),
                |v: i64| u64::try_from(v).ok(),
            ),
            max_queue_size: read_or(config, "max_queue_size", default_max_queue_size(), |v: i64| {
                usize::try_from(v).ok().filter(|v| *v > 0)
            }),
            max_jobs: read_or(config, "max_jobs", default_max_jobs(), |v: i64| {
                usize::try_from(v).ok().filter(|v| *v > 0)
            }),
        }
    }

    /// Connection built from the file, if it carries enough to connect
    pub fn client_config(&self) -> Option<ClientConfig> {
        let c = &self.connection;
        if c.key.trim().is_empty() || c.endpoint.trim().is_empty() {
            return None;
        }
        Some(ClientConfig {
            key: c.key.clone(),
            endpoint: c.endpoint.clone(),
            deployment: c.deployment.clone(),
            api_version: c.api_version,
        })
    }

    /// Dispatcher settings for the given requests-per-minute
    pub fn dispatcher_config(&self, rpm: u32) -> DispatcherConfig {
        DispatcherConfig {
            rpm,
            margin: Duration::from_millis(self.dispatch_margin_ms),
            call_timeout: self.call_timeout(),
            max_queue_size: self.max_queue_size,
            ..DispatcherConfig::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// A request prefilled with the generation defaults
    pub fn request_template(&self, prompt: impl Into<String>) -> GenerationRequest {
        let g = &self.generation;
        GenerationRequest {
            prompt: prompt.into(),
            num: g.num,
            style: g.style,
            quality: g.quality,
            size: g.size,
            as_is: g.as_is,
        }
    }
}

fn read_choice<T>(config: &Config, key: &str, default: T) -> T
where
    T: FromStr,
{
    match config.get_string(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Invalid setting value, using default");
                default
            }
        },
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!(key, error = %e, "Unreadable setting value, using default");
            default
        }
    }
}

fn read_or<T, F>(config: &Config, key: &str, default: T, convert: F) -> T
where
    F: Fn(i64) -> Option<T>,
{
    match config.get_int(key) {
        Ok(raw) => convert(raw).unwrap_or_else(|| {
            warn!(key, value = raw, "Setting value out of range, using default");
            default
        }),
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!(key, error = %e, "Invalid setting value, using default");
            default
        }
    }
}

/// `num` accepts fractional values and truncates them
/// Truncate a user-supplied number to a positive count, as `int(float(x))`
/// would; `None` if nothing positive is left.
pub fn positive_count(raw: f64) -> Option<u32> {
    (raw.is_finite() && raw >= 1.0 && raw <= u32::MAX as f64).then(|| raw.trunc() as u32)
}

fn read_num(config: &Config) -> u32 {
    match config.get_float("num") {
        Ok(raw) => positive_count(raw).unwrap_or_else(|| {
            warn!(value = raw, "Num must be a positive integer, using 1");
            1
        }),
        Err(ConfigError::NotFound(_)) => 1,
        Err(e) => {
            warn!(error = %e, "Invalid num setting, using 1");
            1
        }
    }
}

fn read_bool(config: &Config, key: &str) -> bool {
    match config.get_bool(key) {
        Ok(value) => value,
        Err(ConfigError::NotFound(_)) => false,
        Err(e) => {
            warn!(key, error = %e, "Invalid boolean setting, using false");
            false
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            connection: ConnectionSettings {
                key: String::new(),
                endpoint: String::new(),
                deployment: default_deployment(),
                api_version: ApiVersion::default(),
                rpm: default_rpm(),
            },
            generation: GenerationDefaults {
                num: 1,
                style: Style::default(),
                quality: Quality::default(),
                size: ImageSize::default(),
                as_is: false,
            },
            save_dir: default_save_dir(),
            timeout_ms: default_timeout_ms(),
            dispatch_margin_ms: default_dispatch_margin_ms(),
            max_queue_size: default_max_queue_size(),
            max_jobs: default_max_jobs(),
        }
    }
}
