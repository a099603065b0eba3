use crate::{Chunk, FileId, FileRecord, ParseResult, ParserError, Result, Symbol, SymbolId, SymbolRecord};
use async_trait::async_trait;

/// Language front-end turning raw text into symbols.
///
/// Implementations are synchronous and may be CPU heavy; the worker pool runs
/// them on dedicated threads.
pub trait SourceParser: Send + Sync {
    fn parse(&self, content: &str, file_path: &str) -> std::result::Result<ParseResult, ParserError>;
}

/// Splits a file into searchable chunks for the given symbols.
pub trait Chunker: Send + Sync {
    fn chunk_file(&self, content: &str, symbols: &[Symbol]) -> Vec<Chunk>;
}

/// Read side of the index store plus the entry point for transactions.
#[async_trait]
pub trait IndexStorage: Send + Sync {
    type Tx: StorageTransaction;

    async fn find_file_by_path(&self, path: &str) -> Result<Option<FileRecord>>;

    async fn find_symbols_by_file_id(&self, file_id: FileId) -> Result<Vec<SymbolRecord>>;

    /// Start a transaction. Nothing written through the returned handle is
    /// visible until [`StorageTransaction::commit`] succeeds.
    async fn begin(&self) -> Result<Self::Tx>;
}

/// Write side of the index store. Dropping a transaction without committing
/// discards its writes.
#[async_trait]
pub trait StorageTransaction: Send {
    /// Insert the file if unknown, otherwise replace its content and hash.
    async fn upsert_file(&mut self, path: &str, content: &str) -> Result<FileId>;

    /// Returns the new ids in the order of `symbols`.
    async fn insert_symbols_batch(
        &mut self,
        file_id: FileId,
        symbols: &[Symbol],
    ) -> Result<Vec<SymbolId>>;

    async fn delete_symbol_by_id(&mut self, symbol_id: SymbolId) -> Result<()>;

    async fn delete_chunks_by_symbol_id(&mut self, symbol_id: SymbolId) -> Result<()>;

    /// Remove every symbol and chunk stored for the file.
    async fn delete_file_contents(&mut self, file_id: FileId) -> Result<()>;

    /// Remove the file's chunks that have no owning symbol.
    async fn delete_file_level_chunks(&mut self, file_id: FileId) -> Result<()>;

    /// `symbol_ids[i]` is the owner of `chunks[i]`, `None` for file-level chunks.
    async fn insert_chunks_batch(
        &mut self,
        file_id: FileId,
        chunks: &[Chunk],
        symbol_ids: &[Option<SymbolId>],
    ) -> Result<()>;

    /// Mark a point that [`Self::rollback_to_savepoint`] can return to.
    /// Stores without savepoints return `Ok(false)`.
    async fn savepoint(&mut self, name: &str) -> Result<bool>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
