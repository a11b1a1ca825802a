//! Configuration loading. Search order for the optional file: ./novelscrape.toml, then
//! $XDG_CONFIG_HOME/novelscrape/config.toml (or ~/.config/novelscrape/config.toml).
//!
//! Environment variables are applied on top of the file, and the CLI applies its flags
//! last. The result is an immutable [Settings] that is built once and passed by
//! reference into the fetch layer; nothing below the CLI reads the environment.

use crate::fetch::proxy::parse_proxy_list;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default block-page signatures, matched case-insensitively against the start of the body.
pub const DEFAULT_BLOCK_SIGNALS: [&str; 7] = [
    "captcha",
    "access denied",
    "forbidden",
    "cloudflare",
    "ddos protection",
    "verify you are human",
    "just a moment",
];

const DEFAULT_QUARANTINE_THRESHOLD: i32 = -3;
const DEFAULT_HEALTH_CEILING: i32 = 3;
const DEFAULT_QUARANTINE_SECS: u64 = 600;
const DEFAULT_MAX_QUARANTINES: u32 = 3;
const DEFAULT_BACKOFF_BASE_SECS: f64 = 0.6;
const DEFAULT_MAX_BACKOFF_SECS: f64 = 4.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SCAN_CHARS: usize = 8000;
const DEFAULT_MIN_CONTENT_BYTES: usize = 200;
const DEFAULT_ADAPTIVE_MIN_CONTENT_BYTES: usize = 4000;
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Cannot read proxy list {path}: {source}")]
    ProxyList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct FileConfig {
    /// Directory for generated EPUB/JSON files.
    pub output_dir: Option<PathBuf>,
    /// Worker count; 0 means strict sequential execution.
    pub workers: Option<usize>,
    /// Chapters per EPUB volume (default 500).
    pub chapters_per_book: Option<usize>,
    /// Extra rounds for chapters whose fetch failed (default 2).
    pub retry_rounds: Option<u32>,
    pub user_agent: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Proxy addresses, `scheme://host:port` or `host:port`.
    pub proxies: Option<Vec<String>>,
    /// Plain text or CSV proxy list (see README).
    pub proxy_list_file: Option<PathBuf>,
    /// Single proxy used for every request when set.
    pub primary_proxy: Option<String>,
    pub disable_public_proxies: Option<bool>,
    pub min_proxy_health: Option<i32>,
    pub proxy_health_ceiling: Option<i32>,
    pub quarantine_secs: Option<u64>,
    pub max_quarantines: Option<u32>,
    pub never_reuse_failed_proxy: Option<bool>,
    /// Use a direct connection when no healthy proxy remains (default true).
    pub allow_direct: Option<bool>,
    pub retry_backoff_base: Option<f64>,
    pub max_backoff: Option<f64>,
    pub max_attempts: Option<u32>,
    pub jitter: Option<bool>,
    pub enable_block_detect: Option<bool>,
    pub short_circuit_on_first_block: Option<bool>,
    pub lenient_accept_on_block: Option<bool>,
    pub adaptive_accept: Option<bool>,
    pub adaptive_min_content_bytes: Option<usize>,
    /// Comma-separated keywords expected on genuine chapter pages.
    pub expected_content_keywords: Option<String>,
    pub min_block_signal_hits: Option<usize>,
    pub min_content_bytes: Option<usize>,
    pub accept_if_metadata_present: Option<bool>,
    pub block_signals: Option<Vec<String>>,
}

/// Search order: (1) ./novelscrape.toml, (2) $XDG_CONFIG_HOME/novelscrape/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<FileConfig>, ConfigError> {
    let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
    let mut paths = vec![cwd.join("novelscrape.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("novelscrape").join("config.toml"));
    }
    for path in &paths {
        if path.exists() {
            return load_config_from(path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_config_from(path: &Path) -> Result<FileConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Single proxy that replaces pool selection entirely.
    pub override_proxy: Option<String>,
    /// Normalized proxy addresses for the pool.
    pub proxies: Vec<String>,
    /// Health at or below this value quarantines the proxy.
    pub quarantine_threshold: i32,
    pub health_ceiling: i32,
    pub quarantine: Duration,
    /// Quarantines after which a proxy is retired for good.
    pub max_quarantines: u32,
    /// Retire on the first quarantine instead of waiting out the window.
    pub never_reuse_failed: bool,
    pub allow_direct: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            override_proxy: None,
            proxies: Vec::new(),
            quarantine_threshold: DEFAULT_QUARANTINE_THRESHOLD,
            health_ceiling: DEFAULT_HEALTH_CEILING,
            quarantine: Duration::from_secs(DEFAULT_QUARANTINE_SECS),
            max_quarantines: DEFAULT_MAX_QUARANTINES,
            never_reuse_failed: false,
            allow_direct: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub base: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
    /// Give up on a URL after its first blocked verdict.
    pub short_circuit_on_block: bool,
    /// Return the last body instead of failing when the budget ends on a block.
    pub lenient_accept_on_block: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs_f64(DEFAULT_BACKOFF_BASE_SECS),
            max_backoff: Duration::from_secs_f64(DEFAULT_MAX_BACKOFF_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: true,
            short_circuit_on_block: true,
            lenient_accept_on_block: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub enabled: bool,
    /// Lower-cased signatures of block pages.
    pub block_signals: Vec<String>,
    /// Only this many leading characters are scanned for signals.
    pub scan_chars: usize,
    pub min_block_signal_hits: usize,
    /// Bodies shorter than this with no expected keyword are treated as blocked.
    pub min_content_bytes: usize,
    pub adaptive_accept: bool,
    pub adaptive_min_content_bytes: usize,
    /// Lower-cased keywords that genuine content pages contain.
    pub expected_keywords: Vec<String>,
    pub accept_if_metadata_present: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            block_signals: DEFAULT_BLOCK_SIGNALS.iter().map(|s| s.to_string()).collect(),
            scan_chars: DEFAULT_SCAN_CHARS,
            min_block_signal_hits: 1,
            min_content_bytes: DEFAULT_MIN_CONTENT_BYTES,
            adaptive_accept: false,
            adaptive_min_content_bytes: DEFAULT_ADAPTIVE_MIN_CONTENT_BYTES,
            expected_keywords: Vec::new(),
            accept_if_metadata_present: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    /// Fixed User-Agent; when None a browser-like one is rotated per request.
    pub user_agent: Option<String>,
    pub max_redirects: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: None,
            max_redirects: MAX_REDIRECTS,
        }
    }
}

/// Fully resolved fetch-layer configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub proxy: ProxySettings,
    pub retry: RetrySettings,
    pub detection: DetectionSettings,
    pub http: HttpSettings,
}

impl Settings {
    /// Merge defaults, the optional config file, and environment variables (read through
    /// `env` so tests never touch the process environment).
    pub fn resolve<F>(file: Option<&FileConfig>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        if let Some(file) = file {
            settings.apply_file(file)?;
        }
        settings.apply_env(&env)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve against the real process environment.
    pub fn from_env(file: Option<&FileConfig>) -> Result<Self, ConfigError> {
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    fn apply_file(&mut self, c: &FileConfig) -> Result<(), ConfigError> {
        if let Some(ref ua) = c.user_agent {
            self.http.user_agent = Some(ua.clone());
        }
        if let Some(t) = c.timeout_secs {
            self.http.timeout = Duration::from_secs(t);
        }
        if let Some(ref list) = c.proxies {
            self.proxy
                .proxies
                .extend(parse_proxy_list(&list.join("\n")));
        }
        if let Some(ref path) = c.proxy_list_file {
            self.load_proxy_file(path)?;
        }
        if let Some(ref p) = c.primary_proxy {
            self.proxy.override_proxy = Some(p.clone());
        }
        if c.disable_public_proxies == Some(true) {
            self.proxy.proxies.clear();
        }
        set(&mut self.proxy.quarantine_threshold, c.min_proxy_health);
        set(&mut self.proxy.health_ceiling, c.proxy_health_ceiling);
        if let Some(s) = c.quarantine_secs {
            self.proxy.quarantine = Duration::from_secs(s);
        }
        set(&mut self.proxy.max_quarantines, c.max_quarantines);
        set(&mut self.proxy.never_reuse_failed, c.never_reuse_failed_proxy);
        set(&mut self.proxy.allow_direct, c.allow_direct);
        if let Some(b) = c.retry_backoff_base {
            self.retry.base = secs_f64("retry_backoff_base", b)?;
        }
        if let Some(m) = c.max_backoff {
            self.retry.max_backoff = secs_f64("max_backoff", m)?;
        }
        set(&mut self.retry.max_attempts, c.max_attempts);
        set(&mut self.retry.jitter, c.jitter);
        set(
            &mut self.retry.short_circuit_on_block,
            c.short_circuit_on_first_block,
        );
        set(
            &mut self.retry.lenient_accept_on_block,
            c.lenient_accept_on_block,
        );
        set(&mut self.detection.enabled, c.enable_block_detect);
        set(&mut self.detection.adaptive_accept, c.adaptive_accept);
        set(
            &mut self.detection.adaptive_min_content_bytes,
            c.adaptive_min_content_bytes,
        );
        if let Some(ref k) = c.expected_content_keywords {
            self.detection.expected_keywords = split_keywords(k);
        }
        set(
            &mut self.detection.min_block_signal_hits,
            c.min_block_signal_hits,
        );
        set(&mut self.detection.min_content_bytes, c.min_content_bytes);
        set(
            &mut self.detection.accept_if_metadata_present,
            c.accept_if_metadata_present,
        );
        if let Some(ref signals) = c.block_signals {
            self.detection.block_signals = signals
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get("PROXY_LIST_FILE") {
            self.load_proxy_file(Path::new(&path))?;
        }
        if let Some(p) = get("PRIMARY_PROXY") {
            self.proxy.override_proxy = Some(p);
        }
        if let Some(v) = get("DISABLE_PUBLIC_PROXIES") {
            if env_flag("DISABLE_PUBLIC_PROXIES", &v)? {
                self.proxy.proxies.clear();
            }
        }
        if let Some(v) = get("SCRAPER_UA") {
            self.http.user_agent = Some(v);
        }
        if let Some(v) = get("MIN_PROXY_HEALTH") {
            self.proxy.quarantine_threshold = env_parse("MIN_PROXY_HEALTH", &v)?;
        }
        if let Some(v) = get("NEVER_REUSE_FAILED_PROXY") {
            self.proxy.never_reuse_failed = env_flag("NEVER_REUSE_FAILED_PROXY", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_BASE") {
            let secs: f64 = env_parse("RETRY_BACKOFF_BASE", &v)?;
            self.retry.base = secs_f64("RETRY_BACKOFF_BASE", secs)?;
        }
        if let Some(v) = get("MAX_BACKOFF") {
            let secs: f64 = env_parse("MAX_BACKOFF", &v)?;
            self.retry.max_backoff = secs_f64("MAX_BACKOFF", secs)?;
        }
        if let Some(v) = get("SHORT_CIRCUIT_ON_FIRST_403") {
            self.retry.short_circuit_on_block = env_flag("SHORT_CIRCUIT_ON_FIRST_403", &v)?;
        }
        if let Some(v) = get("LENIENT_ACCEPT_ON_BLOCK") {
            self.retry.lenient_accept_on_block = env_flag("LENIENT_ACCEPT_ON_BLOCK", &v)?;
        }
        if let Some(v) = get("ENABLE_BLOCK_DETECT") {
            self.detection.enabled = env_flag("ENABLE_BLOCK_DETECT", &v)?;
        }
        if let Some(v) = get("ADAPTIVE_ACCEPT") {
            self.detection.adaptive_accept = env_flag("ADAPTIVE_ACCEPT", &v)?;
        }
        if let Some(v) = get("ADAPTIVE_MIN_CONTENT_BYTES") {
            self.detection.adaptive_min_content_bytes =
                env_parse("ADAPTIVE_MIN_CONTENT_BYTES", &v)?;
        }
        if let Some(v) = get("EXPECTED_CONTENT_KEYWORDS") {
            self.detection.expected_keywords = split_keywords(&v);
        }
        if let Some(v) = get("MIN_BLOCK_SIGNAL_HITS") {
            self.detection.min_block_signal_hits = env_parse("MIN_BLOCK_SIGNAL_HITS", &v)?;
        }
        if let Some(v) = get("ACCEPT_IF_METADATA_PRESENT") {
            self.detection.accept_if_metadata_present =
                env_flag("ACCEPT_IF_METADATA_PRESENT", &v)?;
        }
        Ok(())
    }

    fn load_proxy_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ProxyList {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.proxy.proxies.extend(parse_proxy_list(&text));
        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        if self.proxy.health_ceiling <= self.proxy.quarantine_threshold {
            return Err(ConfigError::Invalid(format!(
                "proxy health ceiling ({}) must be above the quarantine threshold ({})",
                self.proxy.health_ceiling, self.proxy.quarantine_threshold
            )));
        }
        if self.retry.max_backoff < self.retry.base {
            self.retry.max_backoff = self.retry.base;
        }
        let mut seen = std::collections::HashSet::new();
        self.proxy.proxies.retain(|p| seen.insert(p.clone()));
        Ok(())
    }
}

fn set<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn secs_f64(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidEnv {
        name,
        value: secs.to_string(),
        reason: e.to_string(),
    })
}

fn env_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
            reason: "expected 1 or 0".to_string(),
        }),
    }
}

fn env_parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn split_keywords(s: &str) -> Vec<String> {
    s.split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
