#![allow(dead_code)]

use codegraph_core::{
    IndexStorage, IndexerConfig, ParseResult, ParserError, PoolConfig, SourceParser,
    StorageTransaction, Symbol, SymbolKind,
};
use codegraph_indexer::MemoryStorage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Parser for a toy language where every `fn name` line opens a function.
///
/// A function ends on the same line when the line ends with `}`, otherwise at
/// the next line that is exactly `}`. Paths drive failure behaviour:
/// `slow` sleeps past any short timeout, `sleepy` sleeps briefly, `panic`
/// always panics, `flaky` panics on its first parse only, `.txt` is rejected.
#[derive(Default)]
pub struct ToyParser {
    calls: AtomicUsize,
    crashed_once: Mutex<HashSet<String>>,
}

impl ToyParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceParser for ToyParser {
    fn parse(&self, content: &str, file_path: &str) -> Result<ParseResult, ParserError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if file_path.ends_with(".txt") {
            return Err(ParserError::NoParserForExtension {
                path: file_path.to_string(),
                extension: "txt".to_string(),
            });
        }
        if file_path.contains("slow") {
            std::thread::sleep(Duration::from_millis(600));
        }
        if file_path.contains("sleepy") {
            std::thread::sleep(Duration::from_millis(100));
        }
        if file_path.contains("panic") {
            panic!("toy parser crashed on {}", file_path);
        }
        if file_path.contains("flaky") && self.crashed_once.lock().insert(file_path.to_string()) {
            panic!("toy parser crashed once on {}", file_path);
        }

        Ok(ParseResult {
            symbols: parse_functions(content),
            parse_time_ms: 0,
        })
    }
}

pub fn parse_functions(content: &str) -> Vec<Symbol> {
    let lines: Vec<&str> = content.lines().collect();
    let mut symbols = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some(rest) = line.trim_start().strip_prefix("fn ") else {
            continue;
        };
        let name = rest
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let start = i as u32 + 1;
        let end = if line.trim_end().ends_with('}') {
            start
        } else {
            lines
                .iter()
                .enumerate()
                .skip(i + 1)
                .find(|(_, l)| l.trim() == "}")
                .map(|(j, _)| j as u32 + 1)
                .unwrap_or(start)
        };
        symbols.push(Symbol::new(name, SymbolKind::Function, start, end));
    }
    symbols
}

/// One-line functions `fn name() { body }`, one per line.
pub fn source(functions: &[(&str, &str)]) -> String {
    functions
        .iter()
        .map(|(name, body)| format!("fn {}() {{ {} }}", name, body))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn test_config() -> IndexerConfig {
    IndexerConfig {
        pool: PoolConfig {
            worker_count: 2,
            task_timeout_ms: 2_000,
            max_retries: 1,
        },
        ..IndexerConfig::default()
    }
}

/// Store `content` as the committed revision of `path` with its toy symbols.
pub async fn seed(storage: &MemoryStorage, path: &str, content: &str) {
    let mut tx = storage.begin().await.unwrap();
    let file_id = tx.upsert_file(path, content).await.unwrap();
    tx.insert_symbols_batch(file_id, &parse_functions(content))
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("codegraph_indexer=debug,codegraph_queue=debug")
        .try_init();
}
