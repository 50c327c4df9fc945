use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RewindError};
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Retention window of the origin: chunks older than this are gone.
pub const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(6 * 24 * 3600 + 23 * 3600);

/// Top-level engine configuration, shared by every component of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    pub http: HttpConfig,
    pub probe: ProbeConfig,
    pub locate: LocateConfig,
    pub fetch: FetchConfig,
    pub general: GeneralConfig,
}

impl RewindConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_concurrent_fetches == 0 {
            return Err(RewindError::configuration(
                "fetch.max_concurrent_fetches must be at least 1",
            ));
        }
        if self.http.timeout.is_zero() {
            return Err(RewindError::configuration(
                "http.timeout must be positive; requests may not block indefinitely",
            ));
        }
        if self.probe.partial_size == 0 {
            return Err(RewindError::configuration(
                "probe.partial_size must be positive",
            ));
        }
        if let Some(0) = self.locate.max_iterations {
            return Err(RewindError::configuration(
                "locate.max_iterations must be positive",
            ));
        }
        Ok(())
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Overall timeout of a single request
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    pub user_agent: String,

    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,

    /// Explicit proxy URL (`http://`, `https://` or `socks5://`)
    pub proxy: Option<String>,

    /// Whether to use system proxy settings when no explicit proxy is set
    pub use_system_proxy: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    #[serde(with = "secs")]
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: BTreeMap::new(),
            proxy: None,
            use_system_proxy: true,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                RewindError::configuration(format!("invalid header name `{name}`: {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                RewindError::configuration(format!("invalid value for header `{name}`: {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Build the HTTP client used by probes and fetches.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        install_rustls_provider();

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(self.header_map()?)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout);

        if let Some(url) = self.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(url).map_err(|e| {
                RewindError::configuration(format!("invalid proxy URL `{url}`: {e}"))
            })?;
            builder = builder.proxy(proxy);
        } else if !self.use_system_proxy {
            builder = builder.no_proxy();
        }

        builder
            .build()
            .map_err(|e| RewindError::configuration(format!("failed to build HTTP client: {e}")))
    }
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Settings for the cheap ingestion-time probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub retry: RetryPolicy,

    /// Bytes requested from the start of a segment; enough to cover the
    /// metadata header of every known format.
    pub partial_size: u64,

    /// Number of probed ingestion times kept in memory per stream
    pub cache_capacity: u64,

    /// How long a fetched head position is reused
    #[serde(with = "secs")]
    pub head_ttl: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            partial_size: 2000,
            cache_capacity: 4096,
            head_ttl: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateConfig {
    /// Hard cap on probes per locate; derived from the window size when unset.
    pub max_iterations: Option<u32>,

    /// Slack allowed between a chunk's nominal end and the target before the
    /// target is considered to fall into a gap.
    #[serde(with = "millis")]
    pub gap_tolerance: Duration,
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            gap_tolerance: Duration::from_millis(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Concurrent segment downloads per stream
    pub max_concurrent_fetches: usize,

    pub retry: RetryPolicy,

    /// Keep the resume state after a fully successful run
    pub retain_state: bool,

    /// Remove a leftover run lock instead of refusing to start
    pub force_unlock: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            retry: RetryPolicy {
                max_retries: 5,
                ..RetryPolicy::default()
            },
            retain_state: false,
            force_unlock: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Minimum excerpt length in preview mode
    #[serde(with = "secs")]
    pub preview_duration: Duration,

    #[serde(with = "secs")]
    pub retention_window: Duration,

    /// Location of the stream metadata cache; caching is off when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            preview_duration: Duration::from_secs(10),
            retention_window: DEFAULT_RETENTION_WINDOW,
            cache_dir: None,
        }
    }
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
