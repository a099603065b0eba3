mod common;

use codegraph_core::{IndexerConfig, PoolConfig};
use codegraph_indexer::{
    ErrorKind, FullReindexReason, IndexError, IndexingCoordinator, MemoryStorage, WriteMode,
};
use codegraph_queue::QueueError;
use common::{init_logging, source, test_config, ToyParser};
use std::sync::Arc;

fn coordinator(
    config: IndexerConfig,
    storage: MemoryStorage,
) -> (IndexingCoordinator<MemoryStorage>, Arc<ToyParser>) {
    let parser = ToyParser::new();
    let coordinator =
        IndexingCoordinator::new(config, parser.clone(), Arc::new(storage)).unwrap();
    (coordinator, parser)
}

fn symbol_id(storage: &MemoryStorage, path: &str, name: &str) -> u64 {
    storage
        .symbols(path)
        .into_iter()
        .find(|r| r.symbol.name == name)
        .map(|r| r.id)
        .unwrap()
}

#[tokio::test]
async fn test_unbounded_retry_count_is_rejected() {
    let mut config = test_config();
    config.pool.max_retries = u32::MAX;
    let result = IndexingCoordinator::new(config, ToyParser::new(), Arc::new(MemoryStorage::new()));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_first_index_is_full() {
    init_logging();
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    let content = format!("use std::io;\n{}", source(&[("foo", "1"), ("bar", "2")]));

    let report = coordinator.index_file("/src/lib.rs", &content).await.unwrap();
    assert_eq!(report.mode, WriteMode::Full);
    assert_eq!(report.full_reindex_reason, Some(FullReindexReason::NoPreviousVersion));
    assert_eq!(report.added, 2);
    assert_eq!(report.parse_attempts, 1);
    assert!(!report.cache_hit);
    // Two symbol chunks plus the `use` line.
    assert_eq!(report.chunks_written, 3);

    let storage = coordinator.storage();
    assert_eq!(storage.symbols("/src/lib.rs").len(), 2);
    assert_eq!(storage.chunks("/src/lib.rs").len(), 3);
    assert_eq!(storage.file("/src/lib.rs").unwrap().content, content);
    assert_eq!(storage.commit_count(), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_added_function_is_written_incrementally() -> anyhow::Result<()> {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    coordinator
        .index_file("/lib.rs", &source(&[("foo", "1")]))
        .await?;
    let foo_id = symbol_id(coordinator.storage(), "/lib.rs", "foo");

    let report = coordinator
        .index_file("/lib.rs", &source(&[("foo", "1"), ("bar", "2")]))
        .await?;

    assert_eq!(report.mode, WriteMode::Incremental);
    assert_eq!(report.full_reindex_reason, None);
    assert_eq!((report.added, report.removed, report.modified, report.unchanged), (1, 0, 0, 1));
    assert_eq!(report.chunks_written, 1);

    let storage = coordinator.storage();
    // The untouched symbol keeps its row.
    assert_eq!(symbol_id(storage, "/lib.rs", "foo"), foo_id);
    assert_eq!(storage.symbols("/lib.rs").len(), 2);
    assert_eq!(storage.chunks("/lib.rs").len(), 2);
    coordinator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unrelated_rewrite_is_full() {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    coordinator
        .index_file("/lib.rs", &source(&[("a", "1"), ("b", "2")]))
        .await
        .unwrap();

    let report = coordinator
        .index_file("/lib.rs", &source(&[("x", "1"), ("y", "2"), ("z", "3")]))
        .await
        .unwrap();

    assert_eq!(report.mode, WriteMode::Full);
    assert_eq!(report.full_reindex_reason, Some(FullReindexReason::ChangeRatio));
    assert_eq!((report.added, report.removed), (3, 2));

    let names: Vec<String> = coordinator
        .storage()
        .symbols("/lib.rs")
        .into_iter()
        .map(|r| r.symbol.name)
        .collect();
    assert_eq!(names, vec!["x", "y", "z"]);
    assert_eq!(coordinator.storage().chunks("/lib.rs").len(), 3);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_modified_symbol_is_replaced_and_removed_symbol_deleted() {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    let v1 = source(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")]);
    coordinator.index_file("/lib.rs", &v1).await.unwrap();
    let storage = coordinator.storage();
    let a_id = symbol_id(storage, "/lib.rs", "a");
    let b_id = symbol_id(storage, "/lib.rs", "b");

    let v2 = source(&[("a", "1"), ("b", "20"), ("c", "3"), ("d", "4")]);
    let report = coordinator.index_file("/lib.rs", &v2).await.unwrap();
    assert_eq!(report.mode, WriteMode::Incremental);
    assert_eq!((report.added, report.removed, report.modified, report.unchanged), (0, 1, 1, 3));

    assert_eq!(symbol_id(storage, "/lib.rs", "a"), a_id);
    assert_ne!(symbol_id(storage, "/lib.rs", "b"), b_id);
    assert!(storage.symbols("/lib.rs").iter().all(|r| r.symbol.name != "e"));
    let chunks = storage.chunks("/lib.rs");
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.symbol_id != Some(b_id)));
    assert!(chunks.iter().any(|c| c.chunk.content.contains("20")));
    assert_eq!(storage.file("/lib.rs").unwrap().content, v2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_top_level_edit_refreshes_file_level_chunks() {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    let body = source(&[("foo", "1"), ("bar", "2")]);
    coordinator
        .index_file("/lib.rs", &format!("use alpha;\n{}", body))
        .await
        .unwrap();
    let storage = coordinator.storage();
    let foo_id = symbol_id(storage, "/lib.rs", "foo");

    let v2 = format!("use omega;\n{}", body);
    let report = coordinator.index_file("/lib.rs", &v2).await.unwrap();
    assert_eq!(report.mode, WriteMode::Incremental);
    assert_eq!((report.added, report.removed, report.modified, report.unchanged), (0, 0, 0, 2));
    assert_eq!(report.chunks_written, 1);

    // Symbol rows survive; the top-level chunk follows the stored content.
    assert_eq!(symbol_id(storage, "/lib.rs", "foo"), foo_id);
    let top_level: Vec<String> = storage
        .chunks("/lib.rs")
        .into_iter()
        .filter(|c| c.symbol_id.is_none())
        .map(|c| c.chunk.content)
        .collect();
    assert_eq!(top_level, vec!["use omega;".to_string()]);
    assert_eq!(storage.chunks("/lib.rs").len(), 3);
    assert_eq!(storage.file("/lib.rs").unwrap().content, v2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_unchanged_content_is_skipped() {
    let (coordinator, parser) = coordinator(test_config(), MemoryStorage::new());
    let content = source(&[("foo", "1")]);
    coordinator.index_file("/lib.rs", &content).await.unwrap();

    let report = coordinator.index_file("/lib.rs", &content).await.unwrap();
    assert_eq!(report.mode, WriteMode::Skipped);
    assert_eq!(report.unchanged, 1);
    assert_eq!(parser.calls(), 1);
    assert_eq!(coordinator.storage().commit_count(), 1);
    assert_eq!(coordinator.stats().skipped, 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_storage_failure_is_reported_and_retry_hits_cache() {
    let storage = MemoryStorage::new();
    storage.fail_writes_for("/lib.rs");
    let (coordinator, parser) = coordinator(test_config(), storage);
    let content = source(&[("foo", "1")]);

    let err = coordinator.index_file("/lib.rs", &content).await.unwrap_err();
    match &err {
        IndexError::StorageWriteFailure { path, mode, .. } => {
            assert_eq!(path, "/lib.rs");
            assert_eq!(*mode, WriteMode::Full);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::StorageWriteFailure);
    assert!(err.is_retryable());
    assert_eq!(coordinator.storage().file_count(), 0);
    assert!(coordinator.storage().symbols("/lib.rs").is_empty());

    coordinator.storage().clear_failures();
    let report = coordinator.index_file("/lib.rs", &content).await.unwrap();
    assert!(report.cache_hit);
    assert_eq!(report.parse_attempts, 0);
    assert_eq!(parser.calls(), 1);

    let stats = coordinator.stats();
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.files_failed, 1);
    assert_eq!(stats.files_indexed, 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_commit_drops_stale_cache_entries() {
    let (coordinator, parser) = coordinator(test_config(), MemoryStorage::new());
    let v1 = source(&[("foo", "1")]);
    let v2 = source(&[("foo", "2")]);

    coordinator.index_file("/lib.rs", &v1).await.unwrap();
    coordinator.index_file("/lib.rs", &v2).await.unwrap();
    assert_eq!(coordinator.stats().cache.size, 1);

    // v1 is no longer cached, so going back parses again.
    let report = coordinator.index_file("/lib.rs", &v1).await.unwrap();
    assert!(!report.cache_hit);
    assert_eq!(parser.calls(), 3);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_timeout_is_retried_once_then_fails() {
    let config = IndexerConfig {
        pool: PoolConfig {
            worker_count: 1,
            task_timeout_ms: 100,
            max_retries: 1,
        },
        ..IndexerConfig::default()
    };
    let (coordinator, parser) = coordinator(config, MemoryStorage::new());

    let err = coordinator
        .index_file("/slow.rs", &source(&[("f", "1")]))
        .await
        .unwrap_err();
    match &err {
        IndexError::ParseFailure { attempts, source, .. } => {
            assert_eq!(*attempts, 2);
            assert_eq!(*source, QueueError::Timeout);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::WorkerTimeout);
    assert_eq!(parser.calls(), 2);

    let stats = coordinator.stats();
    assert_eq!(stats.pool.timed_out, 2);
    assert_eq!(stats.pool.workers, 1);

    // Replacement workers keep serving other files.
    let report = coordinator
        .index_file("/ok.rs", &source(&[("g", "1")]))
        .await
        .unwrap();
    assert_eq!(report.mode, WriteMode::Full);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_crash_is_retried_on_fresh_worker() {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());

    let report = coordinator
        .index_file("/flaky.rs", &source(&[("f", "1")]))
        .await
        .unwrap();
    assert_eq!(report.parse_attempts, 2);
    assert_eq!(coordinator.stats().pool.crashed, 1);

    let err = coordinator
        .index_file("/panic.rs", &source(&[("f", "1")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerCrashed);
    assert_eq!(coordinator.stats().pool.workers, 2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_parse_error_is_not_retried() {
    let (coordinator, parser) = coordinator(test_config(), MemoryStorage::new());

    let err = coordinator
        .index_file("/notes.txt", "fn nothing() {}")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParseFailure);
    assert!(!err.is_retryable());
    assert_eq!(parser.calls(), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_for_one_path_are_serialized() {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    let v1 = source(&[("a", "1")]);
    let v2 = source(&[("a", "2")]);

    let (first, second) = tokio::join!(
        coordinator.index_file("/sleepy.rs", &v1),
        coordinator.index_file("/sleepy.rs", &v2),
    );
    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathBusy);
    assert!(err.is_retryable());

    // The lease is released once the first request is done.
    assert!(coordinator.index_file("/sleepy.rs", &v2).await.is_ok());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_batch_collects_successes_and_failures() {
    init_logging();
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    let files = vec![
        ("/a.rs".to_string(), source(&[("a", "1")])),
        ("/b.rs".to_string(), source(&[("b", "1")])),
        ("/readme.txt".to_string(), "hello".to_string()),
        ("/c.rs".to_string(), source(&[("c", "1")])),
        ("/a.rs".to_string(), source(&[("a", "2")])),
    ];

    let report = coordinator.index_batch(files).await;
    assert_eq!(report.total(), 5);
    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failure("/readme.txt").unwrap().kind, ErrorKind::ParseFailure);
    assert!(report
        .failed
        .iter()
        .any(|f| f.path == "/a.rs" && f.kind == ErrorKind::PathBusy));

    let storage = coordinator.storage();
    assert_eq!(storage.commit_count(), 1);
    assert_eq!(storage.file_count(), 3);
    assert_eq!(storage.file("/a.rs").unwrap().content, source(&[("a", "1")]));

    let stats = coordinator.stats();
    assert_eq!(stats.files_indexed, 3);
    assert_eq!(stats.files_failed, 2);
    assert_eq!(stats.full_writes, 3);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_batch_write_failure_rolls_back_only_that_file() {
    let storage = MemoryStorage::new();
    storage.fail_writes_for("/b.rs");
    let (coordinator, _) = coordinator(test_config(), storage);
    let files = vec![
        ("/a.rs".to_string(), source(&[("a", "1")])),
        ("/b.rs".to_string(), source(&[("b", "1")])),
        ("/c.rs".to_string(), source(&[("c", "1")])),
    ];

    let report = coordinator.index_batch(files).await;
    assert_eq!(report.succeeded.len(), 2);
    let failure = report.failure("/b.rs").unwrap();
    assert_eq!(failure.kind, ErrorKind::StorageWriteFailure);

    let storage = coordinator.storage();
    assert!(storage.file("/a.rs").is_some());
    assert!(storage.file("/b.rs").is_none());
    assert!(storage.file("/c.rs").is_some());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_batch_without_savepoints_is_all_or_nothing() {
    let storage = MemoryStorage::without_savepoints();
    storage.fail_writes_for("/b.rs");
    let (coordinator, _) = coordinator(test_config(), storage);
    let files = vec![
        ("/a.rs".to_string(), source(&[("a", "1")])),
        ("/b.rs".to_string(), source(&[("b", "1")])),
        ("/c.rs".to_string(), source(&[("c", "1")])),
    ];

    let report = coordinator.index_batch(files).await;
    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed.len(), 3);
    assert!(report
        .failed
        .iter()
        .all(|f| f.kind == ErrorKind::StorageWriteFailure));
    assert_eq!(coordinator.storage().file_count(), 0);
    assert_eq!(coordinator.storage().commit_count(), 0);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_later_parses() {
    let (coordinator, _) = coordinator(test_config(), MemoryStorage::new());
    coordinator
        .index_file("/a.rs", &source(&[("a", "1")]))
        .await
        .unwrap();
    coordinator.shutdown().await;
    coordinator.shutdown().await;
    assert_eq!(coordinator.stats().cache.size, 0);

    let err = coordinator
        .index_file("/b.rs", &source(&[("b", "1")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolShutdown);
    assert!(!err.is_retryable());
}
