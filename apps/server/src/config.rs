//! Configuration management for the terminology server

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub stores: StoresConfig,
    pub operations: OperationsConfig,
    pub hgvs: HgvsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of FHIR JSON resources (CodeSystem/ValueSet/ConceptMap)
    /// loaded into the in-memory store at startup.
    #[serde(default)]
    pub resources_dir: Option<String>,
}

/// Importer-produced SQLite stores, opened read-only at startup.
///
/// A missing path leaves that provider unregistered; the server still serves
/// every other code system.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoresConfig {
    pub snomed: Option<String>,
    pub loinc: Option<String>,
    pub rxnorm: Option<String>,
    pub ndc: Option<String>,
    pub cpt: Option<String>,
    pub omop: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationsConfig {
    /// Per-operation wall-clock budget in milliseconds; 0 disables the check
    /// (the debugger escape hatch).
    #[serde(default = "default_time_budget_ms")]
    pub time_budget_ms: u64,
    /// Cap on ECL wildcard materialization.
    #[serde(default = "default_wildcard_cap")]
    pub wildcard_cap: usize,
    /// Default page size for $expand when the client sends no `count`.
    #[serde(default = "default_expansion_count")]
    pub default_expansion_count: usize,
    /// Expansions faster than this are not worth caching.
    #[serde(default = "default_min_cache_time_ms")]
    pub min_cache_time_ms: u64,
    /// Expansion cache capacity (entries).
    #[serde(default = "default_expansion_cache_size")]
    pub expansion_cache_size: usize,
    /// Entry count above which the expansion cache sheds its oldest half.
    #[serde(default = "default_memory_pressure_entries")]
    pub memory_pressure_entries: usize,
    /// Resource-cache entries older than this are dropped by `prune`.
    #[serde(default = "default_resource_cache_max_age_secs")]
    pub resource_cache_max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HgvsConfig {
    /// Remote validator endpoint; unset disables the HGVS provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout; must stay below the operation budget.
    #[serde(default = "default_hgvs_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_time_budget_ms() -> u64 {
    30_000
}

fn default_wildcard_cap() -> usize {
    1000
}

fn default_expansion_count() -> usize {
    1000
}

fn default_min_cache_time_ms() -> u64 {
    250
}

fn default_expansion_cache_size() -> usize {
    1000
}

fn default_memory_pressure_entries() -> usize {
    800
}

fn default_resource_cache_max_age_secs() -> u64 {
    3600
}

fn default_hgvs_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("operations.time_budget_ms", default_time_budget_ms())?
            .set_default("operations.wildcard_cap", default_wildcard_cap() as i64)?
            .set_default(
                "operations.default_expansion_count",
                default_expansion_count() as i64,
            )?
            .set_default("operations.min_cache_time_ms", default_min_cache_time_ms())?
            .set_default(
                "operations.expansion_cache_size",
                default_expansion_cache_size() as i64,
            )?
            .set_default(
                "operations.memory_pressure_entries",
                default_memory_pressure_entries() as i64,
            )?
            .set_default(
                "operations.resource_cache_max_age_secs",
                default_resource_cache_max_age_secs(),
            )?
            .set_default("hgvs.timeout_ms", default_hgvs_timeout_ms())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables: TX__SERVER__PORT etc.
            .add_source(
                config::Environment::with_prefix("TX")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        Ok(addr.parse()?)
    }

    pub fn time_budget(&self) -> Option<Duration> {
        match self.operations.time_budget_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                resources_dir: None,
            },
            stores: StoresConfig::default(),
            operations: OperationsConfig {
                time_budget_ms: default_time_budget_ms(),
                wildcard_cap: default_wildcard_cap(),
                default_expansion_count: default_expansion_count(),
                min_cache_time_ms: default_min_cache_time_ms(),
                expansion_cache_size: default_expansion_cache_size(),
                memory_pressure_entries: default_memory_pressure_entries(),
                resource_cache_max_age_secs: default_resource_cache_max_age_secs(),
            },
            hgvs: HgvsConfig {
                endpoint: None,
                timeout_ms: default_hgvs_timeout_ms(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                json: false,
            },
        }
    }
}
