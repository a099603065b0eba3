//! Shared types, collaborator traits, errors and configuration for the
//! CodeGraph incremental indexer.

pub mod config;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use logging::init_tracing;
pub use traits::*;
pub use types::*;
