//! End-to-end extraction through the public API: SQLite tables and an
//! in-memory change log extracted into on-disk staging.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tempfile::{tempdir, TempDir};

use wolfbatch::config::ExtractSettings;
use wolfbatch::error::Error;
use wolfbatch::extract::DataExtractor;
use wolfbatch::model::{
    csv, BatchStatus, BatchType, ChangeRecord, DataEventType, ExtractRequest, Node, OutgoingBatch,
    ReloadTable, RouterConfig, TriggerHistory,
};
use wolfbatch::platform::{DialectInfo, SqlitePlatform};
use wolfbatch::staging::{ResourceState, StagingManager, OUTGOING};
use wolfbatch::store::{BatchStore, MemoryBatchStore, MemoryChangeLog, MemoryConfiguration};

struct Env {
    _dir: TempDir,
    extractor: DataExtractor,
    staging: Arc<StagingManager>,
    store: Arc<MemoryBatchStore>,
    log: Arc<MemoryChangeLog>,
}

struct Setup<'a> {
    sql: &'a str,
    histories: Vec<TriggerHistory>,
    max_rows: u64,
    dialect: DialectInfo,
}

impl<'a> Setup<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            sql,
            histories: Vec::new(),
            max_rows: 10_000,
            dialect: DialectInfo::default(),
        }
    }

    fn history(mut self, hist: TriggerHistory) -> Self {
        self.histories.push(hist);
        self
    }

    fn max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = max_rows;
        self
    }

    fn dialect(mut self, dialect: DialectInfo) -> Self {
        self.dialect = dialect;
        self
    }

    fn build(self) -> Env {
        let platform = SqlitePlatform::open_in_memory().unwrap().with_dialect(self.dialect);
        platform.execute_batch(self.sql).unwrap();

        let config = MemoryConfiguration::new();
        config.add_router(RouterConfig::new("r1"));
        config.add_node(Node::new("nodeA", "store", "A"));
        config.add_node(Node::new("nodeB", "store", "B"));
        for hist in self.histories {
            config.add_trigger_history(hist);
        }

        let mut settings = ExtractSettings::for_node("corp-000");
        settings.max_rows_per_batch = self.max_rows;
        settings.dialect = self.dialect;

        let dir = tempdir().unwrap();
        let staging = Arc::new(StagingManager::new(dir.path(), 512));
        let store = Arc::new(MemoryBatchStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let extractor = DataExtractor::new(
            Arc::new(platform),
            Arc::new(config),
            store.clone(),
            log.clone(),
            staging.clone(),
            settings,
        );

        Env {
            _dir: dir,
            extractor,
            staging,
            store,
            log,
        }
    }
}

impl Env {
    fn payload(&self, node: &str, batch_id: i64) -> String {
        let resource = self.staging.find(OUTGOING, node, batch_id).unwrap().unwrap();
        assert_eq!(resource.state(), ResourceState::Done);
        resource.read_to_string().unwrap()
    }
}

fn customers(rows: u32) -> String {
    format!(
        r#"
        CREATE TABLE customer (id INTEGER PRIMARY KEY, name VARCHAR(40));
        WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < {rows})
        INSERT INTO customer SELECT i, 'customer ' || i FROM n WHERE {rows} > 0;
        "#
    )
}

fn customer_history() -> TriggerHistory {
    TriggerHistory::new(1, "customer", "customer", &["id", "name"], &["id"])
}

fn reload(request_id: i64, node: &str, start: i64, end: i64, hist_id: i64) -> ExtractRequest {
    let mut request = ExtractRequest::new(request_id, node, "reload", start, end);
    request.tables.push(ReloadTable {
        trigger_hist_id: hist_id,
        router_id: "r1".into(),
        initial_load_select: None,
    });
    request
}

fn first_fields(payload: &str, token: &str) -> Vec<String> {
    let prefix = format!("{},", token);
    payload
        .lines()
        .filter_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|row| csv::parse(row).unwrap()[0].clone().unwrap())
        .collect()
}

#[test]
fn test_reload_splits_and_copies_to_child() {
    let env = Setup::new(&customers(150)).history(customer_history()).max_rows(100).build();

    let mut request = reload(1, "nodeA", 1001, 1002, 1);
    request.child_requests.push(ExtractRequest::new(2, "nodeB", "reload", 2001, 2002));

    let sealed = env.extractor.extract(&request, "corp-000", Vec::new()).unwrap();
    assert_eq!(sealed.len(), 2);
    assert_eq!(sealed[0].data_row_count, 100);
    assert_eq!(sealed[1].data_row_count, 50);

    for (parent, child) in [(1001, 2001), (1002, 2002)] {
        let parent_payload = env.payload("nodeA", parent);
        let child_payload = env.payload("nodeB", child);
        let expected = parent_payload
            .replace(&format!("batch,{}\n", parent), &format!("batch,{}\n", child))
            .replace(&format!("commit,{}\n", parent), &format!("commit,{}\n", child));
        assert_eq!(child_payload, expected);

        let stored = env.store.find_batch(child, "nodeB").unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::New);
        assert_eq!(stored.byte_count, child_payload.len() as u64);
    }

    let ids = first_fields(&env.payload("nodeA", 1001), "insert");
    assert_eq!(ids.first().map(String::as_str), Some("1"));
    assert_eq!(ids.last().map(String::as_str), Some("100"));
}

#[test]
fn test_reextraction_is_identical() {
    let env = Setup::new(&customers(30)).history(customer_history()).max_rows(12).build();
    let mut request = reload(3, "nodeA", 10, 12, 1);
    request.child_requests.push(ExtractRequest::new(4, "nodeB", "reload", 20, 22));

    let first = env.extractor.extract(&request, "corp-000", Vec::new()).unwrap();
    let payloads: Vec<String> = (10..=12).map(|id| env.payload("nodeA", id)).collect();

    for resource in env.staging.resources() {
        resource.delete().unwrap();
    }
    assert!(env.staging.find(OUTGOING, "nodeA", 10).unwrap().is_none());

    let second = env.extractor.extract(&request, "corp-000", Vec::new()).unwrap();
    let again: Vec<String> = (10..=12).map(|id| env.payload("nodeA", id)).collect();
    assert_eq!(payloads, again);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.data_row_count, b.data_row_count);
        assert_eq!(a.byte_count, b.byte_count);
    }
}

#[test]
fn test_rows_are_neither_lost_nor_duplicated_when_split() {
    let mut rng = rand::thread_rng();

    for round in 0..20 {
        let rows: u32 = rng.gen_range(0..=60);
        let limit: u64 = rng.gen_range(1..=20);
        let batches: i64 = rng.gen_range(1..=5);

        let env = Setup::new(&customers(rows)).history(customer_history()).max_rows(limit).build();
        let request = reload(100 + round, "nodeA", 1, batches, 1);
        let sealed = env.extractor.extract(&request, "corp-000", Vec::new()).unwrap();
        assert_eq!(sealed.len() as i64, batches);

        let total: u64 = sealed.iter().map(|b| b.data_row_count).sum();
        assert_eq!(total, rows as u64, "rows={} limit={} batches={}", rows, limit, batches);

        let mut seen = HashSet::new();
        for batch in &sealed {
            for id in first_fields(&env.payload("nodeA", batch.batch_id), "insert") {
                assert!(seen.insert(id), "row emitted twice");
            }
        }
        assert_eq!(seen.len(), rows as usize);
    }
}

#[test]
fn test_parents_emitted_before_children() {
    let mut rng = rand::thread_rng();
    let mut ids: Vec<u32> = (1..=40).collect();
    ids.shuffle(&mut rng);

    let mut sql = String::from(
        "CREATE TABLE folder (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES folder(id), name VARCHAR(20));\n",
    );
    let mut parents = HashMap::new();
    for (i, id) in ids.iter().enumerate() {
        let parent = match i {
            0 => None,
            _ if rng.gen_bool(0.1) => Some(*id),
            _ => Some(ids[rng.gen_range(0..i)]),
        };
        parents.insert(id.to_string(), parent.map(|p| p.to_string()));
        let parent_sql = parent.map_or("NULL".to_string(), |p| p.to_string());
        sql.push_str(&format!("INSERT INTO folder VALUES ({}, {}, 'f{}');\n", id, parent_sql, id));
    }

    let env = Setup::new(&sql)
        .history(TriggerHistory::new(2, "folder", "folder", &["id", "parent_id", "name"], &["id"]))
        .build();
    env.extractor.extract(&reload(5, "nodeA", 1, 1, 2), "corp-000", Vec::new()).unwrap();

    let order = first_fields(&env.payload("nodeA", 1), "insert");
    assert_eq!(order.len(), 40);
    let position: HashMap<&str, usize> = order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    for id in &order {
        if let Some(parent) = &parents[id] {
            if parent != id {
                assert!(position[parent.as_str()] < position[id.as_str()], "{} before parent {}", id, parent);
            }
        }
    }
}

#[test]
fn test_two_pass_lob_covers_every_row_twice() {
    let sql = r#"
        CREATE TABLE doc (id INTEGER PRIMARY KEY, title VARCHAR(20), body TEXT);
        INSERT INTO doc VALUES (1, 'one', 'first body');
        INSERT INTO doc VALUES (2, 'two', NULL);
        INSERT INTO doc VALUES (3, 'three', 'third body');
    "#;
    let dialect = DialectInfo {
        two_pass_lob: true,
        ..DialectInfo::default()
    };
    let env = Setup::new(sql)
        .history(TriggerHistory::new(3, "doc", "doc", &["id", "title", "body"], &["id"]))
        .dialect(dialect)
        .build();
    let sealed = env.extractor.extract(&reload(6, "nodeA", 1, 1, 3), "corp-000", Vec::new()).unwrap();
    assert_eq!(sealed[0].data_insert_row_count, 3);
    assert_eq!(sealed[0].data_update_row_count, 3);

    let payload = env.payload("nodeA", 1);
    let mut columns: HashSet<String> = HashSet::new();
    for line in payload.lines().filter_map(|l| l.strip_prefix("columns,")) {
        for name in csv::parse(line).unwrap().into_iter().flatten() {
            columns.insert(name);
        }
    }
    let expected: HashSet<String> = ["id", "title", "body"].iter().map(|s| s.to_string()).collect();
    assert_eq!(columns, expected);

    assert_eq!(first_fields(&payload, "insert"), vec!["1", "2", "3"]);
    assert_eq!(first_fields(&payload, "update"), vec!["1", "2", "3"]);
}

#[test]
fn test_cancelled_batch_stops_session() {
    let env = Setup::new(&customers(150)).history(customer_history()).max_rows(100).build();
    let mut done = OutgoingBatch::new(1002, "nodeA", "reload", BatchType::Reload);
    done.status = BatchStatus::Ignored;
    env.store.insert_batch(&done).unwrap();

    let err = env
        .extractor
        .extract(&reload(7, "nodeA", 1001, 1002, 1), "corp-000", Vec::new())
        .unwrap_err();
    assert!(err.is_cancellation());
    assert!(!err.is_fatal_to_session());

    assert_eq!(env.store.find_batch(1001, "nodeA").unwrap().unwrap().status, BatchStatus::New);
    assert_eq!(first_fields(&env.payload("nodeA", 1001), "insert").len(), 100);
    assert!(env.staging.find(OUTGOING, "nodeA", 1002).unwrap().is_none());
}

#[test]
fn test_missing_table_leaves_nothing_staged() {
    let env = Setup::new(&customers(3))
        .history(TriggerHistory::new(9, "dropped", "dropped", &["id"], &["id"]))
        .build();
    let err = env
        .extractor
        .extract(&reload(8, "nodeA", 1, 1, 9), "corp-000", Vec::new())
        .unwrap_err();
    assert!(matches!(err, Error::TableNotFound(_)));
    assert!(err.is_fatal_to_session());
    assert!(env.staging.find(OUTGOING, "nodeA", 1).unwrap().is_none());
}

#[test]
fn test_unresolved_router_records_are_skipped() {
    let env = Setup::new(&customers(2)).history(customer_history()).build();
    for (id, router) in [("1", "r1"), ("2", "gone"), ("3", "r1"), ("4", "gone")] {
        let row = csv::encode(&[Some(id.into()), Some(format!("c{}", id))]);
        let record = ChangeRecord::new(DataEventType::Insert, "customer", 1, "default", Some(row)).with_router(router);
        let data_id = env.log.insert(record);
        env.log.assign(77, data_id, Some(router));
    }

    let batch = OutgoingBatch::new(77, "nodeA", "default", BatchType::Extract);
    let sealed = env.extractor.extract_batch(batch).unwrap();
    assert_eq!(sealed.data_row_count, 2);
    assert_eq!(first_fields(&env.payload("nodeA", 77), "insert"), vec!["1", "3"]);
}

#[test]
fn test_finished_batches_touched_while_session_runs() {
    let env = Setup::new(&customers(9)).history(customer_history()).max_rows(3).build();
    let sealed = env
        .extractor
        .extract(&reload(9, "nodeA", 1, 3, 1), "corp-000", Vec::new())
        .unwrap();
    assert_eq!(sealed.len(), 3);

    let first = env.staging.find(OUTGOING, "nodeA", 1).unwrap().unwrap();
    let second_started = sealed[1].extract_start_time.unwrap();
    assert!(first.last_update() >= second_started);
}

#[tokio::test]
async fn test_sessions_run_concurrently() {
    let env = Setup::new(&customers(40)).history(customer_history()).max_rows(10).build();
    let extractor = Arc::new(env.extractor);

    let mut handles = Vec::new();
    for (i, node) in ["nodeA", "nodeB"].iter().enumerate() {
        let extractor = Arc::clone(&extractor);
        let request = reload(200 + i as i64, node, 1, 4, 1);
        handles.push(tokio::spawn(async move {
            extractor.extract_async(request, "corp-000".into(), Vec::new()).await
        }));
    }
    for handle in handles {
        let sealed = handle.await.unwrap().unwrap();
        assert_eq!(sealed.iter().map(|b| b.data_row_count).sum::<u64>(), 40);
    }
}
