use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::network::subnet::SubnetClassifier;
use crate::{FlowStatsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub extraction: ExtractionConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// CIDR blocks treated as the locally administered side of a flow.
    pub local_subnets: Vec<String>,
    /// Inclusive local port window accepted without a DNS match.
    pub service_port_range: [u16; 2],
    /// Packets kept per flow, 0 keeps everything.
    pub max_packets_per_flow: usize,
    pub dns_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrent_files: usize,
    pub capture_extension: String,
    pub output_suffix: String,
    pub dns_cache_file: String,
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            local_subnets: vec![
                "192.168.0.0/16".to_string(),
                "172.16.0.0/12".to_string(),
                "10.0.0.0/8".to_string(),
                "149.171.0.0/16".to_string(),
            ],
            service_port_range: [49000, 49100],
            max_packets_per_flow: 0,
            dns_port: 53,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: 24,
            capture_extension: "pcapng".to_string(),
            output_suffix: "_packetStats.json".to_string(),
            dns_cache_file: "dns_map.json".to_string(),
            read_buffer_size: 65536,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        SubnetClassifier::from_cidrs(&self.extraction.local_subnets)?;

        let [low, high] = self.extraction.service_port_range;
        if low > high {
            return Err(FlowStatsError::Config(format!(
                "service port range is inverted: {}..{}", low, high
            )));
        }
        if self.batch.max_concurrent_files == 0 {
            return Err(FlowStatsError::Config(
                "max_concurrent_files must be at least 1".to_string(),
            ));
        }
        if self.batch.read_buffer_size < 64 {
            return Err(FlowStatsError::Config(format!(
                "read_buffer_size {} is too small", self.batch.read_buffer_size
            )));
        }
        if self.batch.capture_extension.is_empty() || self.batch.output_suffix.is_empty() {
            return Err(FlowStatsError::Config(
                "capture extension and output suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
