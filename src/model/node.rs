//! Nodes and Routers

use serde::{Deserialize, Serialize};

/// Router setting that clears a target catalog or schema
pub const NONE_TOKEN: &str = "$(none)";

/// Router type that sends every row to every candidate node
pub const DEFAULT_ROUTER_TYPE: &str = "default";

/// A participating database instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    pub external_id: String,
}

impl Node {
    pub fn new(
        node_id: impl Into<String>,
        node_group_id: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            external_id: external_id.into(),
        }
    }
}

/// Router configuration, read-only to extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub router_id: String,
    #[serde(default = "default_router_type")]
    pub router_type: String,
    pub router_expression: Option<String>,
    pub target_catalog_name: Option<String>,
    pub target_schema_name: Option<String>,
    pub target_table_name: Option<String>,
    #[serde(default)]
    pub use_source_catalog_schema: bool,
}

fn default_router_type() -> String {
    DEFAULT_ROUTER_TYPE.to_string()
}

impl RouterConfig {
    /// Default router without any target remapping
    pub fn new(router_id: impl Into<String>) -> Self {
        Self {
            router_id: router_id.into(),
            router_type: default_router_type(),
            router_expression: None,
            target_catalog_name: None,
            target_schema_name: None,
            target_table_name: None,
            use_source_catalog_schema: false,
        }
    }

    pub fn is_default(&self) -> bool {
        self.router_type.eq_ignore_ascii_case(DEFAULT_ROUTER_TYPE)
    }
}
