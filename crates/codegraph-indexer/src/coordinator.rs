use crate::analyzer::{ChangeAnalyzer, DiffResult};
use crate::chunker::SymbolChunker;
use crate::error::{IndexError, Result};
use crate::report::{BatchReport, CoordinatorStats, FileFailure, FileIndexReport, WriteMode};
use codegraph_cache::AstCache;
use codegraph_core::{
    Chunker, CodeGraphError, ContentHash, FileRecord, IndexStorage, IndexerConfig, ParseResult,
    SourceParser, StorageTransaction, Symbol,
};
use codegraph_queue::{TaskInput, WorkerPool};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct CoordinatorCounters {
    files_indexed: AtomicU64,
    files_failed: AtomicU64,
    full_writes: AtomicU64,
    incremental_writes: AtomicU64,
    skipped: AtomicU64,
}

/// Marks a path as mid-flight; released on drop.
struct PathLease<'a> {
    paths: &'a Mutex<HashSet<String>>,
    path: String,
}

impl Drop for PathLease<'_> {
    fn drop(&mut self) {
        self.paths.lock().remove(&self.path);
    }
}

/// A file that went through cache check, parsing and diffing and is ready
/// to be written.
struct PreparedFile {
    path: String,
    content: String,
    content_hash: ContentHash,
    previous: Option<FileRecord>,
    old_symbol_count: usize,
    parsed: Arc<ParseResult>,
    diff: DiffResult,
    cache_hit: bool,
    parse_attempts: u32,
    started: Instant,
}

impl PreparedFile {
    fn mode(&self) -> WriteMode {
        if self.diff.needs_full_reindex || self.previous.is_none() {
            WriteMode::Full
        } else {
            WriteMode::Incremental
        }
    }

    fn report(&self, chunks_written: usize) -> FileIndexReport {
        let diff = &self.diff;
        // A full write replaces every stored row.
        let (added, removed, modified, unchanged) = match self.mode() {
            WriteMode::Full => (self.parsed.symbols.len(), self.old_symbol_count, 0, 0),
            _ => (
                diff.added.len(),
                diff.removed.len(),
                diff.modified.len(),
                diff.unchanged.len(),
            ),
        };
        FileIndexReport {
            path: self.path.clone(),
            mode: self.mode(),
            cache_hit: self.cache_hit,
            parse_attempts: self.parse_attempts,
            added,
            removed,
            modified,
            unchanged,
            chunks_written,
            full_reindex_reason: diff.reason,
            duration: self.started.elapsed(),
        }
    }

    fn write_failure(&self, source: CodeGraphError) -> IndexError {
        IndexError::StorageWriteFailure {
            path: self.path.clone(),
            mode: self.mode(),
            source,
        }
    }
}

enum Prepared {
    Skipped(FileIndexReport),
    Ready(PreparedFile),
}

/// Runs the per-file pipeline: cache check, parse on the worker pool,
/// symbol diff, then one storage transaction per file (or per batch).
///
/// The cache lock is never held across an await; requests for a path that
/// is already being indexed are rejected with [`IndexError::PathBusy`].
pub struct IndexingCoordinator<S: IndexStorage> {
    pool: WorkerPool,
    cache: Mutex<AstCache>,
    storage: Arc<S>,
    analyzer: ChangeAnalyzer,
    chunker: Arc<dyn Chunker>,
    config: IndexerConfig,
    in_flight: Mutex<HashSet<String>>,
    counters: CoordinatorCounters,
}

impl<S: IndexStorage> IndexingCoordinator<S> {
    /// Must be called inside a Tokio runtime; starts the worker pool.
    pub fn new(
        config: IndexerConfig,
        parser: Arc<dyn SourceParser>,
        storage: Arc<S>,
    ) -> codegraph_core::Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(&config.pool, parser).map_err(|e| {
            CodeGraphError::InvalidOperation(format!("Failed to start worker pool: {}", e))
        })?;

        info!(
            workers = config.pool.worker_count,
            cache_max_size = config.cache.max_size,
            "Indexing coordinator ready"
        );

        Ok(Self {
            pool,
            cache: Mutex::new(AstCache::new(&config.cache)),
            storage,
            analyzer: ChangeAnalyzer::new(config.incremental.clone()),
            chunker: Arc::new(SymbolChunker::new(&config.chunking)),
            config,
            in_flight: Mutex::new(HashSet::new()),
            counters: CoordinatorCounters::default(),
        })
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn analyzer(&self) -> &ChangeAnalyzer {
        &self.analyzer
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.cache.lock().stats(),
            pool: self.pool.stats(),
            files_indexed: self.counters.files_indexed.load(Ordering::Relaxed),
            files_failed: self.counters.files_failed.load(Ordering::Relaxed),
            full_writes: self.counters.full_writes.load(Ordering::Relaxed),
            incremental_writes: self.counters.incremental_writes.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached parse result for `path`.
    pub fn invalidate(&self, path: &str) -> usize {
        self.cache.lock().invalidate(path)
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.cache.lock().clear();
        info!("Indexing coordinator shut down");
    }

    /// Index one revision of a file.
    pub async fn index_file(&self, path: &str, content: &str) -> Result<FileIndexReport> {
        let _lease = self.lease(path)?;
        let outcome = self.index_leased(path, content).await;
        match &outcome {
            Ok(report) => self.record_success(report),
            Err(e) => {
                self.counters.files_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Indexing {} failed: {}", path, e);
            }
        }
        outcome
    }

    async fn index_leased(&self, path: &str, content: &str) -> Result<FileIndexReport> {
        let file = match self.prepare(path, content).await? {
            Prepared::Skipped(report) => return Ok(report),
            Prepared::Ready(file) => file,
        };

        let mut tx = self
            .storage
            .begin()
            .await
            .map_err(|e| file.write_failure(e))?;

        let chunks = match self.apply(&mut tx, &file).await {
            Ok(chunks) => chunks,
            Err(e) => {
                error!("Write of {} failed, rolling back: {}", path, e);
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback of {} also failed: {}", path, rb);
                }
                return Err(file.write_failure(e));
            }
        };
        tx.commit().await.map_err(|e| file.write_failure(e))?;

        self.cache.lock().invalidate_stale(path, file.content_hash);
        debug!("{} -> Done ({})", path, file.mode());
        Ok(file.report(chunks))
    }

    /// Index many files. Parsing runs in parallel on the pool; all writes
    /// share one transaction with a savepoint per file when the store has them.
    pub async fn index_batch(&self, files: Vec<(String, String)>) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport::default();

        let mut leased = Vec::with_capacity(files.len());
        for (path, content) in files {
            match self.lease(&path) {
                Ok(lease) => leased.push((lease, path, content)),
                Err(e) => report.failed.push(FileFailure::from(e)),
            }
        }

        let mut ready = Vec::new();
        {
            let mut pending: FuturesUnordered<_> = leased
                .iter()
                .map(|(_, path, content)| self.prepare(path, content))
                .collect();
            while let Some(outcome) = pending.next().await {
                match outcome {
                    Ok(Prepared::Skipped(file_report)) => report.succeeded.push(file_report),
                    Ok(Prepared::Ready(file)) => ready.push(file),
                    Err(e) => report.failed.push(FileFailure::from(e)),
                }
            }
        }

        if !ready.is_empty() {
            self.write_batch(ready, &mut report).await;
        }
        drop(leased);

        for file_report in &report.succeeded {
            self.record_success(file_report);
        }
        self.counters
            .files_failed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        report.duration = started.elapsed();

        info!(
            "Indexed batch of {} files: {} succeeded, {} failed in {:?}",
            report.total(),
            report.succeeded.len(),
            report.failed.len(),
            report.duration
        );
        report
    }

    async fn write_batch(&self, files: Vec<PreparedFile>, report: &mut BatchReport) {
        let mut tx = match self.storage.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Cannot open batch transaction: {}", e);
                let reason = e.to_string();
                for file in files {
                    let err = file.write_failure(CodeGraphError::Storage(reason.clone()));
                    report.failed.push(err.into());
                }
                return;
            }
        };

        let mut savepoints = true;
        let mut written: Vec<(PreparedFile, usize)> = Vec::with_capacity(files.len());
        let mut remaining = files.into_iter().enumerate();

        while let Some((index, file)) = remaining.next() {
            let name = format!("file_{}", index);
            if savepoints {
                savepoints = match tx.savepoint(&name).await {
                    Ok(supported) => supported,
                    Err(e) => {
                        warn!("Savepoint failed, batch is now all-or-nothing: {}", e);
                        false
                    }
                };
            }

            let err = match self.apply(&mut tx, &file).await {
                Ok(chunks) => {
                    written.push((file, chunks));
                    continue;
                }
                Err(e) => e,
            };

            if savepoints {
                match tx.rollback_to_savepoint(&name).await {
                    Ok(()) => {
                        warn!("Write of {} rolled back to its savepoint: {}", file.path, err);
                        report.failed.push(file.write_failure(err).into());
                        continue;
                    }
                    Err(rb) => warn!("Rollback to savepoint {} failed: {}", name, rb),
                }
            }

            error!("Write of {} failed; rolling back the whole batch: {}", file.path, err);
            if let Err(rb) = tx.rollback().await {
                warn!("Batch rollback failed: {}", rb);
            }
            let reason = format!("batch rolled back after {} failed: {}", file.path, err);
            report.failed.push(file.write_failure(err).into());
            for other in written
                .into_iter()
                .map(|(f, _)| f)
                .chain(remaining.map(|(_, f)| f))
            {
                let err = other.write_failure(CodeGraphError::Storage(reason.clone()));
                report.failed.push(err.into());
            }
            return;
        }

        if let Err(e) = tx.commit().await {
            error!("Batch commit failed: {}", e);
            let reason = e.to_string();
            for (file, _) in written {
                let err = file.write_failure(CodeGraphError::Storage(reason.clone()));
                report.failed.push(err.into());
            }
            return;
        }

        let mut cache = self.cache.lock();
        for (file, chunks) in written {
            cache.invalidate_stale(&file.path, file.content_hash);
            report.succeeded.push(file.report(chunks));
        }
    }

    fn lease(&self, path: &str) -> Result<PathLease<'_>> {
        if !self.in_flight.lock().insert(path.to_string()) {
            return Err(IndexError::PathBusy(path.to_string()));
        }
        Ok(PathLease {
            paths: &self.in_flight,
            path: path.to_string(),
        })
    }

    /// CacheCheck, Parsing and Diffing for one file.
    async fn prepare(&self, path: &str, content: &str) -> Result<Prepared> {
        let started = Instant::now();
        let content_hash = ContentHash::of(content);
        let read_failure = |source: CodeGraphError| IndexError::StorageRead {
            path: path.to_string(),
            source,
        };

        let previous = self
            .storage
            .find_file_by_path(path)
            .await
            .map_err(read_failure)?;
        let old_symbols = match &previous {
            Some(file) => self
                .storage
                .find_symbols_by_file_id(file.id)
                .await
                .map_err(read_failure)?,
            None => Vec::new(),
        };

        if previous
            .as_ref()
            .is_some_and(|file| file.content_hash == content_hash)
        {
            debug!("{} unchanged ({}); skipping", path, content_hash);
            return Ok(Prepared::Skipped(FileIndexReport {
                path: path.to_string(),
                mode: WriteMode::Skipped,
                cache_hit: false,
                parse_attempts: 0,
                added: 0,
                removed: 0,
                modified: 0,
                unchanged: old_symbols.len(),
                chunks_written: 0,
                full_reindex_reason: None,
                duration: started.elapsed(),
            }));
        }

        debug!("{} -> CacheCheck", path);
        let cached = self.cache.lock().get(path, content);
        let (parsed, cache_hit, parse_attempts) = match cached {
            Some(parsed) => {
                debug!("{} cache hit", path);
                (parsed, true, 0)
            }
            None => {
                debug!("{} -> Parsing", path);
                let (parsed, attempts) = self.parse_with_retry(path, content).await?;
                self.cache.lock().set(path, content, parsed.clone());
                (parsed, false, attempts)
            }
        };

        debug!("{} -> Diffing", path);
        let diff = self.analyzer.diff(
            previous
                .as_ref()
                .map(|file| (file.content.as_str(), old_symbols.as_slice())),
            content,
            &parsed.symbols,
        );
        if let Some(reason) = diff.reason {
            debug!("{} needs a full re-index: {}", path, reason);
        }

        Ok(Prepared::Ready(PreparedFile {
            path: path.to_string(),
            content: content.to_string(),
            content_hash,
            previous,
            old_symbol_count: old_symbols.len(),
            parsed,
            diff,
            cache_hit,
            parse_attempts,
            started,
        }))
    }

    /// Timeouts and crashes are retried on a fresh worker; parse errors are not.
    async fn parse_with_retry(&self, path: &str, content: &str) -> Result<(Arc<ParseResult>, u32)> {
        let max_attempts = self.config.pool.max_retries.saturating_add(1);
        let input = TaskInput::new(path, content);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let handle = self
                .pool
                .submit(input.clone())
                .map_err(|source| IndexError::ParseFailure {
                    path: path.to_string(),
                    attempts,
                    source,
                })?;

            match handle.await.into_result() {
                Ok(parsed) => return Ok((parsed, attempts)),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    warn!("Parse of {} failed ({}); retrying", path, e);
                }
                Err(source) => {
                    return Err(IndexError::ParseFailure {
                        path: path.to_string(),
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    /// Issue the writes for one file inside `tx`; returns the number of chunks written.
    async fn apply(
        &self,
        tx: &mut S::Tx,
        file: &PreparedFile,
    ) -> codegraph_core::Result<usize> {
        match (file.mode(), &file.previous) {
            (WriteMode::Incremental, Some(previous)) => {
                debug!("{} -> WritingIncremental", file.path);
                let diff = &file.diff;
                for id in diff
                    .affected_symbol_ids
                    .iter()
                    .chain(&diff.replaced_symbol_ids)
                {
                    tx.delete_chunks_by_symbol_id(*id).await?;
                    tx.delete_symbol_by_id(*id).await?;
                }

                let symbols: Vec<Symbol> = diff
                    .added
                    .iter()
                    .chain(&diff.modified)
                    .cloned()
                    .collect();
                let mut chunks = self
                    .write_symbols(tx, previous.id, &file.content, &symbols, false)
                    .await?;
                chunks += self
                    .refresh_file_level_chunks(tx, previous.id, &file.content, &file.parsed.symbols)
                    .await?;
                tx.upsert_file(&file.path, &file.content).await?;
                Ok(chunks)
            }
            _ => {
                debug!("{} -> WritingFull", file.path);
                let file_id = tx.upsert_file(&file.path, &file.content).await?;
                tx.delete_file_contents(file_id).await?;
                self.write_symbols(tx, file_id, &file.content, &file.parsed.symbols, true)
                    .await
            }
        }
    }

    /// Top-level code can change while every symbol stays the same, so the
    /// file-level chunks are rebuilt on each incremental write.
    async fn refresh_file_level_chunks(
        &self,
        tx: &mut S::Tx,
        file_id: codegraph_core::FileId,
        content: &str,
        symbols: &[Symbol],
    ) -> codegraph_core::Result<usize> {
        tx.delete_file_level_chunks(file_id).await?;
        let chunks: Vec<_> = self
            .chunker
            .chunk_file(content, symbols)
            .into_iter()
            .filter(|chunk| chunk.symbol_index.is_none())
            .collect();
        if chunks.is_empty() {
            return Ok(0);
        }
        let owners: Vec<Option<codegraph_core::SymbolId>> = vec![None; chunks.len()];
        tx.insert_chunks_batch(file_id, &chunks, &owners).await?;
        Ok(chunks.len())
    }

    async fn write_symbols(
        &self,
        tx: &mut S::Tx,
        file_id: codegraph_core::FileId,
        content: &str,
        symbols: &[Symbol],
        include_top_level: bool,
    ) -> codegraph_core::Result<usize> {
        if symbols.is_empty() && !include_top_level {
            return Ok(0);
        }
        let ids = tx.insert_symbols_batch(file_id, symbols).await?;

        let chunks: Vec<_> = self
            .chunker
            .chunk_file(content, symbols)
            .into_iter()
            .filter(|chunk| include_top_level || chunk.symbol_index.is_some())
            .collect();
        let owners: Vec<_> = chunks
            .iter()
            .map(|chunk| chunk.symbol_index.and_then(|i| ids.get(i).copied()))
            .collect();
        tx.insert_chunks_batch(file_id, &chunks, &owners).await?;
        Ok(chunks.len())
    }

    fn record_success(&self, report: &FileIndexReport) {
        self.counters.files_indexed.fetch_add(1, Ordering::Relaxed);
        let counter = match report.mode {
            WriteMode::Full => &self.counters.full_writes,
            WriteMode::Incremental => &self.counters.incremental_writes,
            WriteMode::Skipped => &self.counters.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
