mod support;

use std::time::Duration;

use entityrepo::prelude::*;
use entityrepo::transaction::{SQLITE_BUSY, TransactionOptions};
use futures::FutureExt;
use support::*;
use tempfile::TempDir;

fn file_config(dir: &TempDir) -> RepositoryConfig {
    let path = dir.path().join("repo.db");
    RepositoryConfig::new(&format!("sqlite://{}", path.display()))
        .deadlock_retry_wait_ms(10)
        .isolation_level(IsolationLevel::Serializable)
}

fn open(config: &RepositoryConfig) -> SqliteSession {
    let session = SqliteSession::open(config).unwrap();
    session
        .ensure_schema(&[
            Widget::descriptor(),
            WidgetArchive::descriptor(),
            AuditEntry::descriptor(),
        ])
        .unwrap();
    session
}

#[tokio::test]
async fn test_crud_against_file_database() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir);
    let mut repo = Repository::new(open(&config), config.clone()).unwrap();

    repo.save(&Widget::new(1, "bolt", 10), "r").await.unwrap();
    let changes = repo.save(&Widget::new(1, "bolt", 12), "r").await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].field_changed, "price");

    repo.insert(&Widget::new(2, "nut", 2), "r").await.unwrap();
    repo.delete_by_surrogate_key_with_tombstone::<Widget, WidgetArchive>(2i64, "r")
        .await
        .unwrap();

    let logged = repo
        .insert(&AuditEntry::aged("boot", chrono::Duration::days(30)), "r")
        .await
        .unwrap();
    assert_eq!(logged.new_value, Value::Integer(1));
    repo.insert(&AuditEntry::aged("ready", chrono::Duration::minutes(1)), "r")
        .await
        .unwrap();

    let purged = repo
        .delete_older_than::<AuditEntry>("created_at", chrono::Duration::days(7), "r")
        .await
        .unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].surrogate_key, Value::Integer(1));

    assert!(repo.sql_table_exists("widgets").await.unwrap());
    assert!(!repo.sql_table_exists("gizmos").await.unwrap());
    drop(repo);

    // a second connection sees the committed state
    let mut reopened = Repository::new(open(&config), config).unwrap();
    let widgets: Vec<Widget> = reopened.get_all_entities().await.unwrap();
    assert_eq!(widgets, vec![Widget::new(1, "bolt", 12)]);
    let archive: WidgetArchive = reopened.require_entity_by_surrogate_key(2i64).await.unwrap();
    assert_eq!(archive.name, "nut");
    assert_eq!(reopened.get_total_count::<AuditEntry>().await.unwrap(), 1);
}

#[derive(Debug, Clone, Default, PartialEq, Entity)]
#[entity(table = "events")]
struct Event {
    #[sql(key)]
    id: i64,
    at: chrono::DateTime<chrono::Utc>,
}

#[tokio::test]
async fn test_resaving_unchanged_timestamp_reports_nothing() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir);
    let session = open(&config);
    session.ensure_schema(&[Event::descriptor()]).unwrap();
    let mut repo = Repository::new(session, config).unwrap();

    let at = chrono::DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
    let event = Event { id: 1, at };

    repo.save(&event, "r").await.unwrap();
    let changes = repo.save(&event, "r").await.unwrap();
    assert!(changes.is_empty(), "{changes:?}");

    let stored: Event = repo.require_entity_by_surrogate_key(1i64).await.unwrap();
    assert_eq!(stored.at, at);
}

#[tokio::test]
async fn test_busy_database_is_retried_until_writer_commits() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir)
        .command_timeout(Duration::ZERO)
        .deadlock_retry_count(50);

    let mut holder = open(&config);
    let mut repo = Repository::new(open(&config), config).unwrap();
    holder
        .begin_transaction(&TransactionOptions::new(IsolationLevel::Serializable))
        .await
        .unwrap();
    let releaser = tokio::spawn(async move {
        pause(50).await;
        holder.commit_transaction().await.unwrap();
    });

    let outcome = repo
        .insert_in_transaction(&[Widget::new(1, "bolt", 10)], "r")
        .await;
    releaser.await.unwrap();

    assert!(outcome.is_success(), "{:?}", outcome.message());
    assert_eq!(repo.get_total_count::<Widget>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_busy_database_exhausts_retry_budget() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir)
        .command_timeout(Duration::ZERO)
        .deadlock_retry_count(2);

    let mut holder = open(&config);
    let mut repo = Repository::new(open(&config), config).unwrap();
    holder
        .begin_transaction(&TransactionOptions::new(IsolationLevel::Serializable))
        .await
        .unwrap();
    let outcome = repo
        .insert_in_transaction(&[Widget::new(1, "bolt", 10)], "r")
        .await;

    match outcome {
        OperationResult::Failure { attempts, message, .. } => {
            assert_eq!(attempts, 2);
            assert!(message.contains(&SQLITE_BUSY.to_string()), "{message}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    holder.rollback_transaction().await.unwrap();
}

#[tokio::test]
async fn test_transaction_timeout_applies_to_blocking_work() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir).transaction_timeout(Duration::from_secs(1));
    let mut repo = Repository::new(open(&config), config).unwrap();

    let outcome = repo
        .in_transaction(|repo| {
            async move {
                repo.insert(&Widget::new(1, "bolt", 10), "r").await?;
                // stands in for rusqlite blocking the thread past the limit
                std::thread::sleep(Duration::from_millis(1200));
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(
        matches!(outcome, OperationResult::Fatal(RepoError::TransactionTimeout(_))),
        "{:?}",
        outcome.message()
    );
    assert!(!repo.session().in_transaction());
    assert_eq!(repo.get_total_count::<Widget>().await.unwrap(), 0);
}
