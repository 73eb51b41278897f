#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod embedder;
pub mod ingest;
pub mod reindexer;

pub use embedder::Embedder;
pub use ingest::{IngestParams, IngestionService};
pub use reindexer::{ReindexOutcome, Reindexer};
