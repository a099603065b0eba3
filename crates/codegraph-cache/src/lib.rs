//! Content-addressed parse-result cache for the incremental indexer.

pub mod cache;

pub use cache::*;
