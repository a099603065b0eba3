use async_trait::async_trait;
use chrono::Utc;
use codegraph_core::{
    Chunk, CodeGraphError, ContentHash, FileId, FileRecord, IndexStorage, Result,
    StorageTransaction, Symbol, SymbolId, SymbolRecord,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

pub type ChunkId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub file_id: FileId,
    pub symbol_id: Option<SymbolId>,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    files: HashMap<FileId, FileRecord>,
    paths: HashMap<String, FileId>,
    symbols: BTreeMap<SymbolId, SymbolRecord>,
    chunks: BTreeMap<ChunkId, StoredChunk>,
    next_file_id: FileId,
    next_symbol_id: SymbolId,
    next_chunk_id: ChunkId,
}

impl StoreState {
    fn symbols_of(&self, file_id: FileId) -> Vec<SymbolRecord> {
        let mut records: Vec<SymbolRecord> = self
            .symbols
            .values()
            .filter(|r| r.file_id == file_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.symbol.start_line, r.symbol.start_column, r.id));
        records
    }
}

/// In-memory [`IndexStorage`] with serialized transactions and savepoints.
///
/// Reads see the last committed state. A transaction works on a private copy
/// and holds the writer lock until it commits or is dropped.
pub struct MemoryStorage {
    committed: Arc<RwLock<StoreState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    failing_paths: Arc<Mutex<HashSet<String>>>,
    savepoints_enabled: bool,
    commits: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            committed: Arc::new(RwLock::new(StoreState::default())),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            failing_paths: Arc::new(Mutex::new(HashSet::new())),
            savepoints_enabled: true,
            commits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A store whose transactions report savepoints as unsupported.
    pub fn without_savepoints() -> Self {
        Self {
            savepoints_enabled: false,
            ..Self::new()
        }
    }

    /// Make every write touching `path` fail until [`Self::clear_failures`].
    pub fn fail_writes_for(&self, path: &str) {
        self.failing_paths.lock().insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_paths.lock().clear();
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<FileRecord> {
        let state = self.committed.read();
        state
            .paths
            .get(path)
            .and_then(|id| state.files.get(id))
            .cloned()
    }

    pub fn symbols(&self, path: &str) -> Vec<SymbolRecord> {
        let state = self.committed.read();
        match state.paths.get(path) {
            Some(id) => state.symbols_of(*id),
            None => Vec::new(),
        }
    }

    pub fn chunks(&self, path: &str) -> Vec<StoredChunk> {
        let state = self.committed.read();
        let Some(file_id) = state.paths.get(path) else {
            return Vec::new();
        };
        state
            .chunks
            .values()
            .filter(|c| c.file_id == *file_id)
            .cloned()
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.committed.read().files.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStorage for MemoryStorage {
    type Tx = MemoryTransaction;

    async fn find_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.file(path))
    }

    async fn find_symbols_by_file_id(&self, file_id: FileId) -> Result<Vec<SymbolRecord>> {
        Ok(self.committed.read().symbols_of(file_id))
    }

    async fn begin(&self) -> Result<MemoryTransaction> {
        let guard = self.writer.clone().lock_owned().await;
        let working = self.committed.read().clone();
        Ok(MemoryTransaction {
            _guard: guard,
            committed: self.committed.clone(),
            commits: self.commits.clone(),
            failing_paths: self.failing_paths.clone(),
            savepoints_enabled: self.savepoints_enabled,
            working,
            savepoints: Vec::new(),
        })
    }
}

pub struct MemoryTransaction {
    _guard: OwnedMutexGuard<()>,
    committed: Arc<RwLock<StoreState>>,
    commits: Arc<AtomicU64>,
    failing_paths: Arc<Mutex<HashSet<String>>>,
    savepoints_enabled: bool,
    working: StoreState,
    savepoints: Vec<(String, StoreState)>,
}

impl MemoryTransaction {
    fn check_path(&self, path: &str) -> Result<()> {
        if self.failing_paths.lock().contains(path) {
            return Err(CodeGraphError::Storage(format!(
                "write rejected for {}",
                path
            )));
        }
        Ok(())
    }

    fn check_file(&self, file_id: FileId) -> Result<()> {
        let file = self.working.files.get(&file_id).ok_or_else(|| {
            CodeGraphError::Storage(format!("unknown file id {}", file_id))
        })?;
        self.check_path(&file.path)
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn upsert_file(&mut self, path: &str, content: &str) -> Result<FileId> {
        self.check_path(path)?;
        let state = &mut self.working;
        let record = FileRecord {
            id: 0,
            path: path.to_string(),
            content: content.to_string(),
            content_hash: ContentHash::of(content),
            indexed_at: Utc::now(),
        };

        if let Some(id) = state.paths.get(path).copied() {
            state.files.insert(id, FileRecord { id, ..record });
            return Ok(id);
        }

        state.next_file_id += 1;
        let id = state.next_file_id;
        state.paths.insert(path.to_string(), id);
        state.files.insert(id, FileRecord { id, ..record });
        Ok(id)
    }

    async fn insert_symbols_batch(
        &mut self,
        file_id: FileId,
        symbols: &[Symbol],
    ) -> Result<Vec<SymbolId>> {
        self.check_file(file_id)?;
        let state = &mut self.working;
        let mut ids = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            state.next_symbol_id += 1;
            let id = state.next_symbol_id;
            state.symbols.insert(
                id,
                SymbolRecord {
                    id,
                    file_id,
                    symbol: symbol.clone(),
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn delete_symbol_by_id(&mut self, symbol_id: SymbolId) -> Result<()> {
        self.working.symbols.remove(&symbol_id);
        Ok(())
    }

    async fn delete_chunks_by_symbol_id(&mut self, symbol_id: SymbolId) -> Result<()> {
        self.working
            .chunks
            .retain(|_, c| c.symbol_id != Some(symbol_id));
        Ok(())
    }

    async fn delete_file_contents(&mut self, file_id: FileId) -> Result<()> {
        self.check_file(file_id)?;
        self.working.symbols.retain(|_, r| r.file_id != file_id);
        self.working.chunks.retain(|_, c| c.file_id != file_id);
        Ok(())
    }

    async fn delete_file_level_chunks(&mut self, file_id: FileId) -> Result<()> {
        self.check_file(file_id)?;
        self.working
            .chunks
            .retain(|_, c| c.file_id != file_id || c.symbol_id.is_some());
        Ok(())
    }

    async fn insert_chunks_batch(
        &mut self,
        file_id: FileId,
        chunks: &[Chunk],
        symbol_ids: &[Option<SymbolId>],
    ) -> Result<()> {
        self.check_file(file_id)?;
        if chunks.len() != symbol_ids.len() {
            return Err(CodeGraphError::InvalidOperation(format!(
                "{} chunks but {} owner ids",
                chunks.len(),
                symbol_ids.len()
            )));
        }
        let state = &mut self.working;
        for (chunk, symbol_id) in chunks.iter().zip(symbol_ids) {
            state.next_chunk_id += 1;
            let id = state.next_chunk_id;
            state.chunks.insert(
                id,
                StoredChunk {
                    id,
                    file_id,
                    symbol_id: *symbol_id,
                    chunk: chunk.clone(),
                },
            );
        }
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<bool> {
        if !self.savepoints_enabled {
            return Ok(false);
        }
        self.savepoints
            .push((name.to_string(), self.working.clone()));
        Ok(true)
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                CodeGraphError::InvalidOperation(format!("No savepoint named {}", name))
            })?;
        self.working = self.savepoints[position].1.clone();
        self.savepoints.truncate(position + 1);
        debug!("Rolled back to savepoint {}", name);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        *self.committed.write() = self.working;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        debug!("Transaction rolled back");
        Ok(())
    }
}
