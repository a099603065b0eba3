use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub type FileId = u64;
pub type SymbolId = u64;

/// Truncated SHA-256 digest of a file's full text.
///
/// Eight bytes are plenty for cache keys and change detection; this is not a
/// security boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub u64);

impl ContentHash {
    pub fn of(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        ContentHash(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Interface,
    Trait,
    Module,
    Variable,
    Constant,
    Type,
    Other(String),
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Class => "class",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Interface => "interface",
            SymbolKind::Trait => "trait",
            SymbolKind::Module => "module",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Type => "type",
            SymbolKind::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "function" => Ok(SymbolKind::Function),
            "method" => Ok(SymbolKind::Method),
            "class" => Ok(SymbolKind::Class),
            "struct" => Ok(SymbolKind::Struct),
            "enum" => Ok(SymbolKind::Enum),
            "interface" => Ok(SymbolKind::Interface),
            "trait" => Ok(SymbolKind::Trait),
            "module" => Ok(SymbolKind::Module),
            "variable" => Ok(SymbolKind::Variable),
            "constant" => Ok(SymbolKind::Constant),
            "type" => Ok(SymbolKind::Type),
            other => Ok(SymbolKind::Other(other.to_string())),
        }
    }
}

/// A named code element within one file.
///
/// Lines are 1-based and inclusive; columns are 0-based character offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, start_line: u32, end_line: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            start_line,
            start_column: 0,
            end_line,
            end_column: u32::MAX,
        }
    }

    pub fn with_columns(mut self, start_column: u32, end_column: u32) -> Self {
        self.start_column = start_column;
        self.end_column = end_column;
        self
    }

    /// Identity used when diffing two revisions of the same file.
    pub fn key(&self) -> SymbolKey {
        SymbolKey {
            kind: self.kind.clone(),
            name: self.name.clone(),
            start_line: self.start_line,
        }
    }

    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// `(kind, name, start_line)`: the start line breaks ties between symbols
/// sharing a name, e.g. overloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolKey {
    pub kind: SymbolKind,
    pub name: String,
    pub start_line: u32,
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.kind, self.name, self.start_line)
    }
}

/// Output of the parser collaborator for one file revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub symbols: Vec<Symbol>,
    pub parse_time_ms: u64,
}

/// Stored state of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub content: String,
    pub content_hash: ContentHash,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub id: SymbolId,
    pub file_id: FileId,
    pub symbol: Symbol,
}

/// A searchable slice of a file.
///
/// `symbol_index` points into the symbol slice handed to the chunker; chunks
/// without one cover top-level code outside any symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub symbol_index: Option<usize>,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
}
