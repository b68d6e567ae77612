//! Smart routing: a semantic index over tool and prompt descriptions.
//!
//! - `embedding`: provider contract and the OpenAI-compatible HTTP provider
//! - `index`: incremental vector index keyed by namespaced capability key
//! - `router`: coalesced rebuilds and thresholded top-K queries

pub mod embedding;
pub mod errors;
pub mod index;
pub mod router;

pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider};
pub use errors::SmartError;
pub use index::{ScoredCapability, SemanticIndex, SemanticIndexEntry};
pub use router::{SmartRouter, SmartStatus};
