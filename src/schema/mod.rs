//! Schema Reconciler
//!
//! Turns the capture-time shape recorded in a trigger history into a
//! table description usable for extraction, optionally checked against
//! the live database and remapped to the router's target name.
//!
//! Resolved tables are cached per session. Tables whose name embeds the
//! target node's external id are also cached engine-wide as a template, so
//! a family of per-node tables costs one metadata lookup.

mod definition;
mod naming;

pub use definition::table_definition;
pub use naming::{apply_target_name, replace_variables};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::config::ExtractSettings;
use crate::error::{Error, Result};
use crate::model::{Column, Node, RouterConfig, Table, TriggerHistory};
use crate::platform::Platform;
use crate::store::ConfigurationService;

/// Placeholder standing in for the external id in templated table names
const EXTERNAL_ID_TOKEN: &str = "$(targetExternalId)";

/// Options that change the shape of a resolved table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResolveFlags {
    /// Apply the router's target catalog, schema and table name
    pub target_name: bool,
    /// Take column definitions from the live database
    pub live_schema: bool,
    /// Keep captured columns the live table no longer has
    pub backfill_missing: bool,
}

impl ResolveFlags {
    /// Shape taken from the trigger history alone
    pub fn history() -> Self {
        Self::default()
    }

    /// Live column definitions, source naming
    pub fn live() -> Self {
        Self {
            live_schema: true,
            ..Self::default()
        }
    }

    pub fn with_target_name(mut self) -> Self {
        self.target_name = true;
        self
    }

    pub fn with_backfill(mut self) -> Self {
        self.backfill_missing = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    router_id: String,
    trigger_hist_id: i64,
    flags: ResolveFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TemplateKey {
    engine_name: String,
    router_id: String,
    template_name: String,
    column_names: Vec<String>,
    pk_column_names: Vec<String>,
    live_schema: bool,
    backfill_missing: bool,
}

static TEMPLATES: LazyLock<DashMap<TemplateKey, Arc<Table>>> = LazyLock::new(DashMap::new);

/// Session-scoped schema reconciler
pub struct SchemaReconciler {
    source_platform: Arc<dyn Platform>,
    target_platform: Arc<dyn Platform>,
    config: Arc<dyn ConfigurationService>,
    settings: ExtractSettings,
    source_node: Node,
    target_node: Node,
    cache: Mutex<HashMap<SessionKey, Arc<Table>>>,
}

impl SchemaReconciler {
    /// Create a reconciler whose target tables live on the source platform
    pub fn new(
        platform: Arc<dyn Platform>,
        config: Arc<dyn ConfigurationService>,
        settings: ExtractSettings,
        target_node: Node,
    ) -> Self {
        let source_node = Node::new(
            settings.node_id.clone(),
            settings.node_group_id.clone(),
            settings
                .node_external_id
                .clone()
                .unwrap_or_else(|| settings.node_id.clone()),
        );
        Self {
            target_platform: Arc::clone(&platform),
            source_platform: platform,
            config,
            settings,
            source_node,
            target_node,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Use a separate platform for application tables
    pub fn with_target_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.target_platform = platform;
        self
    }

    pub fn settings(&self) -> &ExtractSettings {
        &self.settings
    }

    pub fn source_node(&self) -> &Node {
        &self.source_node
    }

    pub fn target_node(&self) -> &Node {
        &self.target_node
    }

    /// The platform application rows are selected from
    pub fn platform_for(&self, table_name: &str) -> &Arc<dyn Platform> {
        if self.settings.is_internal_table(table_name) {
            &self.source_platform
        } else {
            &self.target_platform
        }
    }

    /// Resolve the table shape for a router and trigger history
    pub fn resolve(
        &self,
        router_id: &str,
        hist: &TriggerHistory,
        flags: ResolveFlags,
    ) -> Result<Arc<Table>> {
        let key = SessionKey {
            router_id: router_id.to_string(),
            trigger_hist_id: hist.trigger_hist_id,
            flags,
        };
        if let Some(table) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(table));
        }

        let table = Arc::new(self.build(router_id, hist, flags, false)?);
        self.cache.lock().insert(key, Arc::clone(&table));
        Ok(table)
    }

    /// Resolve again from a fresh live description, replacing any cached entry
    pub fn refresh(
        &self,
        router_id: &str,
        hist: &TriggerHistory,
        flags: ResolveFlags,
    ) -> Result<Arc<Table>> {
        let key = SessionKey {
            router_id: router_id.to_string(),
            trigger_hist_id: hist.trigger_hist_id,
            flags,
        };
        let table = Arc::new(self.build(router_id, hist, flags, true)?);
        self.cache.lock().insert(key, Arc::clone(&table));
        Ok(table)
    }

    /// Forget every table resolved in this session
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    /// Resolve a table whose name embeds the target node's external id.
    ///
    /// The shape is resolved once per engine for the name with the id
    /// stripped, then cloned and renamed for each concrete table. Names
    /// without the id go through [`SchemaReconciler::resolve`].
    pub fn lookup_table_expanded(
        &self,
        router_id: &str,
        hist: &TriggerHistory,
        flags: ResolveFlags,
    ) -> Result<Arc<Table>> {
        let external_id = self.target_node.external_id.as_str();
        if external_id.is_empty() || !hist.source_table_name.contains(external_id) {
            return self.resolve(router_id, hist, flags);
        }

        let template_name = hist.source_table_name.replacen(external_id, EXTERNAL_ID_TOKEN, 1);
        let key = TemplateKey {
            engine_name: self.settings.engine_name.clone(),
            router_id: router_id.to_string(),
            template_name: template_name.to_lowercase(),
            column_names: lowercased(&hist.column_names),
            pk_column_names: lowercased(&hist.pk_column_names),
            live_schema: flags.live_schema,
            backfill_missing: flags.backfill_missing,
        };

        let template = match TEMPLATES.get(&key) {
            Some(template) => Arc::clone(template.value()),
            None => {
                tracing::debug!(
                    "Resolving template {} for engine {}",
                    template_name,
                    self.settings.engine_name
                );
                let mut table = self.build(router_id, hist, flags.without_target_name(), false)?;
                table.name = template_name.clone();
                let table = Arc::new(table);
                TEMPLATES
                    .entry(key)
                    .or_insert_with(|| Arc::clone(&table))
                    .value()
                    .clone()
            }
        };

        let mut table = (*template).clone();
        table.name = template.name.replace(EXTERNAL_ID_TOKEN, external_id);
        if flags.target_name {
            let router = self.router(router_id);
            apply_target_name(&mut table, &router, &self.source_node, &self.target_node);
        }
        Ok(Arc::new(table))
    }

    fn router(&self, router_id: &str) -> RouterConfig {
        self.config
            .get_router(router_id, false)
            .unwrap_or_else(|| RouterConfig::new(router_id))
    }

    fn build(
        &self,
        router_id: &str,
        hist: &TriggerHistory,
        flags: ResolveFlags,
        force_refresh: bool,
    ) -> Result<Table> {
        let mut table = if flags.live_schema {
            self.live_table(hist, flags.backfill_missing, force_refresh)?
        } else {
            history_table(hist)
        };

        if flags.target_name {
            let router = self.router(router_id);
            apply_target_name(&mut table, &router, &self.source_node, &self.target_node);
        }
        Ok(table)
    }

    fn live_table(
        &self,
        hist: &TriggerHistory,
        backfill_missing: bool,
        force_refresh: bool,
    ) -> Result<Table> {
        let platform = self.platform_for(&hist.source_table_name);
        let catalog = hist.source_catalog_name.as_deref();
        let schema = hist.source_schema_name.as_deref();
        let name = hist.source_table_name.as_str();

        let mut table = platform.describe_table(catalog, schema, name, force_refresh)?;
        if !force_refresh {
            if let Some(described) = &table {
                if described.column_count() < hist.column_count() {
                    tracing::debug!(
                        "Cached definition of {} has {} columns, expected {}; refreshing",
                        hist.fully_qualified_table_name(),
                        described.column_count(),
                        hist.column_count()
                    );
                    table = platform.describe_table(catalog, schema, name, true)?;
                }
            }
        }

        let table = table.ok_or_else(|| Error::TableNotFound(hist.fully_qualified_table_name()))?;
        let mut filtered = table.copy_and_filter_columns(
            &hist.column_names,
            &hist.pk_column_names,
            true,
            backfill_missing,
        );
        filtered.catalog = hist.source_catalog_name.clone();
        filtered.schema = hist.source_schema_name.clone();
        Ok(filtered)
    }
}

impl ResolveFlags {
    fn without_target_name(mut self) -> Self {
        self.target_name = false;
        self
    }
}

fn lowercased(names: &[String]) -> Vec<String> {
    names.iter().map(|name| name.to_lowercase()).collect()
}

/// Table shape taken only from the names a trigger history recorded
fn history_table(hist: &TriggerHistory) -> Table {
    let columns = hist
        .column_names
        .iter()
        .map(|name| {
            let column = Column::named(name.clone());
            if hist
                .pk_column_names
                .iter()
                .any(|pk| pk.eq_ignore_ascii_case(name))
            {
                column.primary()
            } else {
                column
            }
        })
        .collect();

    let mut table = Table::new(hist.source_table_name.clone()).with_columns(columns);
    table.catalog = hist.source_catalog_name.clone();
    table.schema = hist.source_schema_name.clone();
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{DialectInfo, RowCursor, SqlitePlatform};
    use crate::store::MemoryConfiguration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts describe calls made against the wrapped platform
    struct CountingPlatform {
        inner: SqlitePlatform,
        describes: AtomicUsize,
    }

    impl Platform for CountingPlatform {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn dialect(&self) -> DialectInfo {
            self.inner.dialect()
        }

        fn describe_table(
            &self,
            catalog: Option<&str>,
            schema: Option<&str>,
            name: &str,
            force_refresh: bool,
        ) -> Result<Option<Table>> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            self.inner.describe_table(catalog, schema, name, force_refresh)
        }

        fn query(&self, sql: &str) -> Result<RowCursor> {
            self.inner.query(sql)
        }
    }

    fn platform(sql: &str) -> Arc<CountingPlatform> {
        let inner = SqlitePlatform::open_in_memory().unwrap();
        inner.execute_batch(sql).unwrap();
        Arc::new(CountingPlatform {
            inner,
            describes: AtomicUsize::new(0),
        })
    }

    fn reconciler(platform: Arc<CountingPlatform>, config: MemoryConfiguration, engine: &str) -> SchemaReconciler {
        let mut settings = ExtractSettings::for_node("corp-000");
        settings.engine_name = engine.to_string();
        SchemaReconciler::new(
            platform,
            Arc::new(config),
            settings,
            Node::new("store-001", "store", "001"),
        )
    }

    #[test]
    fn test_history_shape() {
        let platform = platform("CREATE TABLE unrelated (id INTEGER)");
        let reconciler = reconciler(platform.clone(), MemoryConfiguration::new(), "history");
        let hist = TriggerHistory::new(1, "customer", "customer", &["id", "name"], &["id"]);

        let table = reconciler.resolve("r1", &hist, ResolveFlags::history()).unwrap();
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert_eq!(table.primary_key_names(), vec!["id"]);
        assert_eq!(platform.describes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_live_schema_reorders_and_caches() {
        let platform = platform("CREATE TABLE customer (name TEXT, id INTEGER PRIMARY KEY)");
        let reconciler = reconciler(platform.clone(), MemoryConfiguration::new(), "live");
        let hist = TriggerHistory::new(1, "customer", "customer", &["id", "name"], &["id"]);

        let first = reconciler.resolve("r1", &hist, ResolveFlags::live()).unwrap();
        let second = reconciler.resolve("r1", &hist, ResolveFlags::live()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.column_names(), vec!["id", "name"]);
        assert!(first.columns[1].column_type.is_lob());
        assert_eq!(platform.describes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_table_is_fatal() {
        let platform = platform("CREATE TABLE unrelated (id INTEGER)");
        let reconciler = reconciler(platform, MemoryConfiguration::new(), "missing");
        let hist = TriggerHistory::new(1, "gone", "gone", &["id"], &["id"]);

        match reconciler.resolve("r1", &hist, ResolveFlags::live()) {
            Err(Error::TableNotFound(name)) => assert_eq!(name, "gone"),
            other => panic!("expected TableNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_description_refreshed() {
        let platform = platform("CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT)");
        let reconciler = reconciler(platform.clone(), MemoryConfiguration::new(), "stale");
        let old = TriggerHistory::new(1, "customer", "customer", &["id", "name"], &["id"]);
        reconciler.resolve("r1", &old, ResolveFlags::live()).unwrap();

        platform
            .inner
            .execute_batch("ALTER TABLE customer ADD COLUMN email TEXT")
            .unwrap();
        let new = TriggerHistory::new(2, "customer", "customer", &["id", "name", "email"], &["id"]);
        let table = reconciler.resolve("r1", &new, ResolveFlags::live()).unwrap();
        assert_eq!(table.column_names(), vec!["id", "name", "email"]);
    }

    #[test]
    fn test_backfill_flag_is_part_of_cache_key() {
        let platform = platform("CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT)");
        let reconciler = reconciler(platform, MemoryConfiguration::new(), "backfill");
        let hist = TriggerHistory::new(1, "customer", "customer", &["id", "name", "email"], &["id"]);

        let plain = reconciler.resolve("r1", &hist, ResolveFlags::live()).unwrap();
        let backfilled = reconciler
            .resolve("r1", &hist, ResolveFlags::live().with_backfill())
            .unwrap();
        assert!(!Arc::ptr_eq(&plain, &backfilled));
        assert_eq!(plain.column_count(), 2);
        assert_eq!(backfilled.column_names(), vec!["id", "name", "email"]);
    }

    #[test]
    fn test_target_name_from_router() {
        let platform = platform("CREATE TABLE customer (id INTEGER PRIMARY KEY)");
        let config = MemoryConfiguration::new();
        let mut router = RouterConfig::new("r1");
        router.target_schema_name = Some("store_$(targetExternalId)".into());
        router.target_table_name = Some("client".into());
        config.add_router(router);
        let reconciler = reconciler(platform, config, "target");
        let hist = TriggerHistory::new(1, "customer", "customer", &["id"], &["id"]);

        let source = reconciler.resolve("r1", &hist, ResolveFlags::live()).unwrap();
        let target = reconciler
            .resolve("r1", &hist, ResolveFlags::live().with_target_name())
            .unwrap();
        assert_eq!(source.qualified_name(), "customer");
        assert_eq!(target.qualified_name(), "store_001.client");
    }

    #[test]
    fn test_expanded_tables_share_one_lookup() {
        let platform = platform(
            "CREATE TABLE sale_001 (id INTEGER PRIMARY KEY, total NUMERIC);
             CREATE TABLE sale_002 (id INTEGER PRIMARY KEY, total NUMERIC);",
        );
        let hist = TriggerHistory::new(1, "sale", "sale_001", &["id", "total"], &["id"]);
        let first = reconciler(platform.clone(), MemoryConfiguration::new(), "expanded-test");
        let table = first
            .lookup_table_expanded("r1", &hist, ResolveFlags::live())
            .unwrap();
        assert_eq!(table.name, "sale_001");

        let mut settings = ExtractSettings::for_node("corp-000");
        settings.engine_name = "expanded-test".into();
        let second = SchemaReconciler::new(
            platform.clone(),
            Arc::new(MemoryConfiguration::new()),
            settings,
            Node::new("store-002", "store", "002"),
        );
        let hist = TriggerHistory::new(2, "sale", "sale_002", &["id", "total"], &["id"]);
        let table = second
            .lookup_table_expanded("r1", &hist, ResolveFlags::live())
            .unwrap();
        assert_eq!(table.name, "sale_002");
        assert_eq!(table.column_names(), vec!["id", "total"]);
        assert_eq!(platform.describes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expanded_template_follows_history_columns() {
        let platform = platform("CREATE TABLE sale_001 (id INTEGER PRIMARY KEY, total NUMERIC, note TEXT)");
        let reconciler = reconciler(platform, MemoryConfiguration::new(), "expanded-columns");
        let narrow = TriggerHistory::new(1, "sale", "sale_001", &["id", "total"], &["id"]);
        let wide = TriggerHistory::new(2, "sale", "sale_001", &["id", "total", "note"], &["id"]);

        let table = reconciler
            .lookup_table_expanded("r1", &narrow, ResolveFlags::live())
            .unwrap();
        assert_eq!(table.column_names(), vec!["id", "total"]);

        let table = reconciler
            .lookup_table_expanded("r1", &wide, ResolveFlags::live())
            .unwrap();
        assert_eq!(table.column_names(), vec!["id", "total", "note"]);
    }
}
