use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use crate::buffered_store::BufferedStore;
use crate::common::{Action, Rid, Value, Write};
use crate::database::Database;
use crate::inventory::Inventory;
use crate::limbo::Queue;
use crate::transporter::{Transporter, TransporterConfig};

fn open_store(dir: &std::path::Path) -> Arc<BufferedStore> {
    let inventory = Arc::new(Inventory::open(dir.join("inventory")).unwrap());
    let db = Database::open(dir, inventory).unwrap();
    Arc::new(BufferedStore::new(Arc::new(Queue::new()), Arc::new(db)))
}

#[test]
fn drains_pending_writes_into_the_durable_side() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store
        .accept(Write::new("name", Value::Str("alice".into()), Rid::new(1), Action::Add), false)
        .unwrap();

    let config = TransporterConfig {
        workers: 1,
        idle_sleep: Duration::from_millis(1),
        max_idle_sleep: Duration::from_millis(4),
        busy_sleep: Duration::from_millis(1),
        supervisor_interval: Duration::from_secs(60),
        ..TransporterConfig::default()
    };
    let transporter = Transporter::start(Arc::clone(&store), config);

    let mut drained = false;
    for _ in 0..200 {
        std::thread::sleep(Duration::from_millis(5));
        if store.limbo().is_empty() {
            drained = true;
            break;
        }
    }
    assert!(drained, "transporter never drained the pending write");

    let record = store.select(Rid::new(1), crate::lock::Locking::Default).unwrap();
    assert!(!record.is_empty());

    transporter.shutdown();
}

#[test]
fn stats_report_at_least_one_pass_per_worker() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let config = TransporterConfig {
        workers: 2,
        idle_sleep: Duration::from_millis(1),
        max_idle_sleep: Duration::from_millis(4),
        busy_sleep: Duration::from_millis(1),
        supervisor_interval: Duration::from_secs(60),
        ..TransporterConfig::default()
    };
    let transporter = Transporter::start(store, config);
    std::thread::sleep(Duration::from_millis(50));

    let stats = transporter.stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.passes > 0));

    transporter.shutdown();
}

#[test]
fn restart_replaces_the_worker_pool_and_keeps_running() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let config = TransporterConfig {
        workers: 1,
        idle_sleep: Duration::from_millis(1),
        max_idle_sleep: Duration::from_millis(4),
        busy_sleep: Duration::from_millis(1),
        supervisor_interval: Duration::from_secs(60),
        ..TransporterConfig::default()
    };
    let transporter = Transporter::start(store, config);
    std::thread::sleep(Duration::from_millis(20));
    transporter.restart();
    std::thread::sleep(Duration::from_millis(20));

    let stats = transporter.stats();
    assert_eq!(stats.len(), 1);

    transporter.shutdown();
}
