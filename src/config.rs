//! WolfBatch Configuration
//!
//! This module provides configuration structures for the extraction
//! and batching engine, plus the immutable per-session settings that
//! are derived from them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::platform::DialectInfo;

/// Main WolfBatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfBatchConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Staging area configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Extraction configuration
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// External identifier (embedded in templated table names)
    #[serde(default)]
    pub external_id: Option<String>,

    /// Node group this node belongs to
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Engine name, used to key caches shared between sessions
    #[serde(default = "default_engine_name")]
    pub engine_name: String,
}

/// Staging area configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory for staged batch files
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,

    /// Bytes held in memory before a staged resource spills to disk
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: usize,

    /// Age after which finished resources are purged
    #[serde(default = "default_purge_ttl_secs")]
    pub purge_ttl_secs: u64,
}

/// Extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Rows per batch before the staging writer moves to the next batch
    #[serde(default = "default_max_rows_per_batch")]
    pub max_rows_per_batch: u64,

    /// Interval between progress log lines
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,

    /// Order reloads of self-referencing tables parent-first
    #[serde(default = "default_true")]
    pub self_ref_ordering: bool,

    /// Largest row (estimated) that may be extracted (0 = unlimited)
    #[serde(default)]
    pub max_row_size_bytes: u64,

    /// Multiplier applied to a row's character length to estimate its size
    #[serde(default = "default_row_size_factor")]
    pub row_size_factor: u64,

    /// Prefix of the engine's own tables
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Strip column defaults from regenerated table definitions
    #[serde(default)]
    pub create_table_without_defaults: bool,

    /// Strip foreign keys from regenerated table definitions
    #[serde(default)]
    pub create_table_without_fks: bool,

    /// Strip indexes from regenerated table definitions
    #[serde(default)]
    pub create_table_without_indexes: bool,

    /// Strip primary keys from regenerated table definitions
    #[serde(default)]
    pub create_table_without_pks: bool,

    /// Pass reloaded rows through non-default routers
    #[serde(default = "default_true")]
    pub route_reload_rows: bool,

    /// Rows fetched per query when reading a table (0 = one query per table)
    #[serde(default = "default_query_page_rows")]
    pub query_page_rows: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_group_id() -> String {
    "default".to_string()
}

fn default_engine_name() -> String {
    "wolfbatch".to_string()
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfbatch/staging")
}

fn default_memory_threshold() -> usize {
    256 * 1024
}

fn default_purge_ttl_secs() -> u64 {
    3600
}

fn default_max_rows_per_batch() -> u64 {
    10_000
}

fn default_query_page_rows() -> usize {
    1000
}

fn default_log_interval_secs() -> u64 {
    30
}

fn default_row_size_factor() -> u64 {
    2
}

fn default_table_prefix() -> String {
    "wolf".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            memory_threshold_bytes: default_memory_threshold(),
            purge_ttl_secs: default_purge_ttl_secs(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_rows_per_batch: default_max_rows_per_batch(),
            log_interval_secs: default_log_interval_secs(),
            self_ref_ordering: true,
            max_row_size_bytes: 0,
            row_size_factor: default_row_size_factor(),
            table_prefix: default_table_prefix(),
            create_table_without_defaults: false,
            create_table_without_fks: false,
            create_table_without_indexes: false,
            create_table_without_pks: false,
            route_reload_rows: true,
            query_page_rows: default_query_page_rows(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfBatchConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfBatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.engine_name.is_empty() {
            return Err(crate::Error::Config("node.engine_name cannot be empty".into()));
        }

        if self.extract.max_rows_per_batch == 0 {
            return Err(crate::Error::Config(
                "extract.max_rows_per_batch must be greater than zero".into(),
            ));
        }

        if self.extract.table_prefix.is_empty() {
            return Err(crate::Error::Config("extract.table_prefix cannot be empty".into()));
        }

        Ok(())
    }

    /// Get purge TTL as Duration
    pub fn purge_ttl(&self) -> Duration {
        Duration::from_secs(self.staging.purge_ttl_secs)
    }

    /// Build the settings handed to each extraction session
    pub fn extract_settings(&self, dialect: DialectInfo) -> ExtractSettings {
        ExtractSettings {
            node_id: self.node.id.clone(),
            node_external_id: self.node.external_id.clone(),
            node_group_id: self.node.group_id.clone(),
            engine_name: self.node.engine_name.clone(),
            max_rows_per_batch: self.extract.max_rows_per_batch,
            log_interval: Duration::from_secs(self.extract.log_interval_secs),
            self_ref_ordering: self.extract.self_ref_ordering,
            max_row_size_bytes: match self.extract.max_row_size_bytes {
                0 => None,
                n => Some(n),
            },
            row_size_factor: self.extract.row_size_factor,
            table_prefix: self.extract.table_prefix.clone(),
            definition_options: DefinitionOptions {
                without_defaults: self.extract.create_table_without_defaults,
                without_fks: self.extract.create_table_without_fks,
                without_indexes: self.extract.create_table_without_indexes,
                without_pks: self.extract.create_table_without_pks,
            },
            route_reload_rows: self.extract.route_reload_rows,
            query_page_rows: self.extract.query_page_rows,
            dialect,
        }
    }
}

/// Which parts of a table definition to leave out when regenerating one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefinitionOptions {
    pub without_defaults: bool,
    pub without_fks: bool,
    pub without_indexes: bool,
    pub without_pks: bool,
}

/// Immutable settings for one extraction session
///
/// Passed by value into every source and writer of a session; nothing
/// in the pipeline mutates it.
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub node_id: String,
    pub node_external_id: Option<String>,
    pub node_group_id: String,
    pub engine_name: String,
    pub max_rows_per_batch: u64,
    pub log_interval: Duration,
    pub self_ref_ordering: bool,
    pub max_row_size_bytes: Option<u64>,
    pub row_size_factor: u64,
    pub table_prefix: String,
    pub definition_options: DefinitionOptions,
    pub route_reload_rows: bool,
    pub query_page_rows: usize,
    pub dialect: DialectInfo,
}

impl ExtractSettings {
    /// Settings with defaults for the given node, mostly useful in tests
    pub fn for_node(node_id: &str) -> Self {
        let config = WolfBatchConfig {
            node: NodeConfig {
                id: node_id.to_string(),
                external_id: None,
                group_id: default_group_id(),
                engine_name: default_engine_name(),
            },
            staging: StagingConfig::default(),
            extract: ExtractConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.extract_settings(DialectInfo::default())
    }

    /// Whether a table belongs to the engine itself rather than the application
    pub fn is_internal_table(&self, table_name: &str) -> bool {
        let prefix = format!("{}_", self.table_prefix.to_lowercase());
        table_name.to_lowercase().starts_with(&prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "corp-000"
external_id = "000"
group_id = "corp"

[staging]
dir = "/tmp/wolfbatch"
memory_threshold_bytes = 1024

[extract]
max_rows_per_batch = 100
max_row_size_bytes = 4096
create_table_without_fks = true
"#;

        let config = WolfBatchConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "corp-000");
        assert_eq!(config.node.engine_name, "wolfbatch");
        assert_eq!(config.staging.memory_threshold_bytes, 1024);
        assert_eq!(config.extract.max_rows_per_batch, 100);
        assert!(config.extract.self_ref_ordering);

        let settings = config.extract_settings(DialectInfo::default());
        assert_eq!(settings.max_row_size_bytes, Some(4096));
        assert!(settings.definition_options.without_fks);
        assert!(!settings.definition_options.without_pks);
    }

    #[test]
    fn test_zero_row_limit_rejected() {
        let toml = r#"
[node]
id = "corp-000"

[extract]
max_rows_per_batch = 0
"#;
        assert!(WolfBatchConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_internal_table_prefix() {
        let settings = ExtractSettings::for_node("n1");
        assert!(settings.is_internal_table("wolf_node"));
        assert!(settings.is_internal_table("WOLF_DATA"));
        assert!(!settings.is_internal_table("wolfhound"));
        assert!(!settings.is_internal_table("customer"));
    }
}
