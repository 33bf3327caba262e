use crate::connection::Network;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DOCUMENT_ROOT: &str = "/opt/omegaup/frontend/www";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub load: LoadConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless before any worker starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target.address.trim().is_empty() {
            anyhow::bail!("target.address must not be empty");
        }
        if self.request.script.trim().is_empty() {
            anyhow::bail!("request.script must not be empty");
        }
        self.load.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Socket kind to dial: "tcp" (host:port) or "unix" (filesystem path)
    pub network: Network,
    /// Address of the FastCGI responder
    pub address: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: "localhost:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Directory the script path is resolved against
    pub document_root: String,
    /// Script to execute, relative to the document root
    pub script: String,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            document_root: DEFAULT_DOCUMENT_ROOT.to_string(),
            script: "index.php".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Number of concurrent workers, each with its own connection
    pub workers: usize,
    /// Global requests per second shared by all workers
    pub rate: f64,
    /// Measurement duration in milliseconds
    pub duration_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            rate: 10.0,
            duration_ms: 30_000,
        }
    }
}

impl LoadConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("load.workers must be at least 1");
        }
        if !self.rate.is_finite() || self.rate <= 0.0 {
            anyhow::bail!("load.rate must be a positive number (got {})", self.rate);
        }
        match Duration::try_from_secs_f64(1.0 / self.rate) {
            Ok(period) if !period.is_zero() => {}
            _ => anyhow::bail!("load.rate {} is out of range for a tick interval", self.rate),
        }
        if self.duration_ms == 0 {
            anyhow::bail!("load.duration_ms must be greater than zero");
        }
        Ok(())
    }
}
