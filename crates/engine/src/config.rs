//! Engine configuration

use crossrun_common::{Error, Result, RetryPolicy, Vendor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Vendor account
    pub credentials: Credentials,

    /// Endpoint overrides, mostly for tests and proxies
    #[serde(default)]
    pub endpoints: Endpoints,

    /// Tunnel configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Retry budgets
    #[serde(default)]
    pub retry: RetryConfig,
}

impl EngineConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            store_path: crossrun_common::default_store_path(),
            credentials,
            endpoints: Endpoints::default(),
            tunnel: TunnelConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the tunnel binary directory
    pub fn bin_path(&self) -> PathBuf {
        self.tunnel
            .bin_dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("bin"))
    }
}

/// Vendor account used for REST calls and tunnel authentication
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub access_key: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            access_key: access_key.into(),
        }
    }

    /// Read the vendor's conventional environment variables
    pub fn from_env(vendor: Vendor) -> Result<Self> {
        let (user_var, key_var) = Self::env_vars(vendor);
        let read = |var: &str| {
            std::env::var(var)
                .map_err(|_| Error::InvalidConfig(format!("{} is not set", var)))
        };
        Ok(Self {
            username: read(user_var)?,
            access_key: read(key_var)?,
        })
    }

    pub fn env_vars(vendor: Vendor) -> (&'static str, &'static str) {
        match vendor {
            Vendor::BrowserStack => ("BROWSERSTACK_USERNAME", "BROWSERSTACK_ACCESS_KEY"),
            Vendor::SauceLabs => ("SAUCE_USERNAME", "SAUCE_ACCESS_KEY"),
            Vendor::CrossBrowserTesting => ("CBT_USERNAME", "CBT_AUTHKEY"),
        }
    }
}

// The access key must never reach a log line.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("access_key", &"***")
            .finish()
    }
}

/// REST and WebDriver hub base URLs; `None` means the vendor default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoints {
    pub api_base: Option<String>,
    pub hub_url: Option<String>,
}

/// Tunnel-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Use this executable instead of the cached vendor download
    pub binary_path: Option<PathBuf>,

    /// Tunnel binary cache directory
    pub bin_dir: Option<PathBuf>,

    /// Give up waiting for the readiness marker after this long
    pub ready_timeout_secs: u64,

    /// Creation attempts when the tunnel fails with a transient bring-up error
    pub connect_attempts: u32,

    /// Tunnel-health monitor tick
    pub monitor_interval_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            bin_dir: None,
            ready_timeout_secs: 120,
            connect_attempts: 3,
            monitor_interval_ms: 5000,
        }
    }
}

/// Retry budgets, one per call site family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Waiting for a two-phase ticket to become decidable right after creation
    pub job_creation: RetryPolicy,

    /// Waiting for a ticket to promote before stopping a job
    pub ticket_promotion: RetryPolicy,

    /// Waiting for a tunnel process to exit after SIGTERM
    pub tunnel_stop: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            job_creation: RetryPolicy::exponential(6, 1000, 1.5),
            ticket_promotion: RetryPolicy::exponential(8, 2000, 1.5),
            tunnel_stop: RetryPolicy::fixed(60, 500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = Credentials::new("alice", "s3cret");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_roundtrip_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("crossrun.toml");

        let mut config = EngineConfig::new(Credentials::new("alice", "key"));
        config.tunnel.connect_attempts = 5;
        config.endpoints.api_base = Some("http://127.0.0.1:1".to_string());
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.tunnel.connect_attempts, 5);
        assert_eq!(loaded.endpoints.api_base.as_deref(), Some("http://127.0.0.1:1"));
        assert_eq!(loaded.retry.tunnel_stop, RetryPolicy::fixed(60, 500));
    }

    #[test]
    fn test_bin_path_defaults_under_store() {
        let mut config = EngineConfig::new(Credentials::new("a", "b"));
        config.store_path = PathBuf::from("/tmp/crossrun");
        assert_eq!(config.bin_path(), PathBuf::from("/tmp/crossrun/bin"));
    }
}
