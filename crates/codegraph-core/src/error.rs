use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodeGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParserError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, CodeGraphError>;

/// Failures reported by a [`crate::SourceParser`] for a single file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    #[error("No parser registered for extension '{extension}' ({path})")]
    NoParserForExtension { path: String, extension: String },

    #[error("Syntax error in {path}: {message}")]
    Syntax { path: String, message: String },

    #[error("{0}")]
    Other(String),
}
