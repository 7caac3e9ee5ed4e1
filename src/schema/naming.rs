//! Target Table Naming
//!
//! Router-driven remapping of catalog, schema and table name for the
//! target side of a change.

use crate::model::{Node, RouterConfig, Table, NONE_TOKEN};

/// Substitute node and source-location variables in a router setting
pub fn replace_variables(
    template: &str,
    source: &Node,
    target: &Node,
    source_catalog: Option<&str>,
    source_schema: Option<&str>,
) -> String {
    let replacements = [
        ("$(sourceNodeId)", source.node_id.as_str()),
        ("$(sourceExternalId)", source.external_id.as_str()),
        ("$(sourceNodeGroupId)", source.node_group_id.as_str()),
        ("$(targetNodeId)", target.node_id.as_str()),
        ("$(targetExternalId)", target.external_id.as_str()),
        ("$(targetNodeGroupId)", target.node_group_id.as_str()),
        ("$(sourceCatalogName)", source_catalog.unwrap_or("")),
        ("$(sourceSchemaName)", source_schema.unwrap_or("")),
    ];

    let mut value = template.to_string();
    for (token, replacement) in replacements {
        if value.contains(token) {
            value = value.replace(token, replacement);
        }
    }
    value
}

/// Rewrite one location part (catalog or schema) according to a router override
fn remap_part(
    configured: Option<&str>,
    source_value: Option<String>,
    use_source: bool,
    substitute: impl Fn(&str) -> String,
) -> Option<String> {
    match configured.map(str::trim) {
        Some(NONE_TOKEN) => None,
        Some(value) if !value.is_empty() => Some(substitute(value)),
        _ if use_source => source_value,
        _ => None,
    }
}

/// Apply a router's target catalog, schema and table name to a table
pub fn apply_target_name(table: &mut Table, router: &RouterConfig, source: &Node, target: &Node) {
    let source_catalog = table.catalog.clone();
    let source_schema = table.schema.clone();
    let substitute = |value: &str| {
        replace_variables(
            value,
            source,
            target,
            source_catalog.as_deref(),
            source_schema.as_deref(),
        )
    };

    table.catalog = remap_part(
        router.target_catalog_name.as_deref(),
        source_catalog.clone(),
        router.use_source_catalog_schema,
        substitute,
    );
    table.schema = remap_part(
        router.target_schema_name.as_deref(),
        source_schema.clone(),
        router.use_source_catalog_schema,
        substitute,
    );

    if let Some(name) = router.target_table_name.as_deref().map(str::trim) {
        if !name.is_empty() {
            table.name = substitute(name);
        }
    }
}
