//! Agent configuration, loaded from an optional YAML file overlaid with
//! environment variables (`__` separates nesting, e.g.
//! `DISCOVERY__POLL_INTERVAL_SECS=10`).

use anyhow::{Result, bail};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use std::collections::HashMap;

use crate::discover::matcher::Criterion;
use crate::ebpf::EbpfConfig;
use crate::ebpf::large_buffer::LargeBufferConfig;
use crate::export::attr_select::InclusionLists;
use crate::export::otel::TracesConfig;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Ordered selection rules; the first match wins.
    pub services: Vec<Criterion>,
    /// Processes matching any of these are never promoted, even when an
    /// include criterion matches.
    pub exclude_services: Vec<Criterion>,
    pub poll_interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            services: Vec::new(),
            exclude_services: Vec::new(),
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AttributeSettings {
    /// Metric-name glob → include/exclude lists for exported attributes.
    pub select: HashMap<String, InclusionLists>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub discovery: DiscoverySettings,
    pub ebpf: EbpfConfig,
    pub large_buffer: LargeBufferConfig,
    pub otel: TracesConfig,
    pub attributes: AttributeSettings,
    /// Node whose pods the informer watches. Defaults to the NODE_NAME
    /// env injected by the downward API.
    pub node_name: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env if present, then the optional config file, then the
        // environment on top.
        dotenvy::dotenv().ok();
        Self::load(std::env::var("SPANTAP_CONFIG").ok().as_deref())
    }

    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }
        let source = builder
            .add_source(Environment::default().separator("__"))
            .build()?;

        let mut settings: Settings = source.try_deserialize()?;
        settings.apply_env_fallbacks();
        Ok(settings)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let source = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        source.try_deserialize()
    }

    /// Standard OTEL env vars win only where the config file left gaps;
    /// explicit config stays authoritative.
    fn apply_env_fallbacks(&mut self) {
        if self.otel.common_endpoint.is_empty()
            && let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        {
            self.otel.common_endpoint = endpoint;
        }
        if self.otel.traces_endpoint.is_empty()
            && let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT")
        {
            self.otel.traces_endpoint = endpoint;
        }
        if self.node_name.is_none()
            && let Ok(node) = std::env::var("NODE_NAME")
        {
            self.node_name = Some(node);
        }
    }

    /// Reject configurations the pipeline cannot run with. Called once,
    /// before any stage starts.
    pub fn validate(&self) -> Result<()> {
        for criterion in self
            .discovery
            .services
            .iter()
            .chain(&self.discovery.exclude_services)
        {
            if !criterion.has_predicates() {
                bail!(
                    "discovery criterion {:?} has no predicates and would match every process",
                    criterion.get_name()
                );
            }
        }
        if self.large_buffer.max_bytes == 0 || self.large_buffer.max_entries == 0 {
            bail!("large_buffer limits must be non-zero");
        }
        Ok(())
    }
}
