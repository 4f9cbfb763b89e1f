//! # Vettore - Embedded Vector Database
//!
//! Vettore stores high-dimensional float vectors with attached metadata
//! under named collections, persists them in a paged, checksummed on-disk
//! format, and answers k-nearest-neighbor queries with either an exact flat
//! scan or an HNSW graph.
//!
//! ## Quick Start
//!
//! ```rust
//! use vettore::{CancelToken, CollectionSpec, Config, Engine, Metric, SearchRequest, VectorRecord};
//!
//! # fn main() -> vettore::Result<()> {
//! # let dir = tempfile::tempdir().unwrap();
//! let engine = Engine::open(dir.path(), Config::default())?;
//! engine.create_collection(CollectionSpec::new("docs", 4, Metric::Cosine))?;
//! engine.insert("docs", VectorRecord::new("a", vec![1.0, 0.0, 0.0, 0.0]))?;
//!
//! let request = SearchRequest::new(vec![1.0, 0.0, 0.0, 0.0], 1);
//! let hits = engine.search("docs", &request, &CancelToken::new())?;
//! assert_eq!(hits[0].id, "a");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Layered, leaves first:
//! - **Pager + Page Cache**: fixed-size pages over one file per collection,
//!   CRC32C-checksummed, cached process-wide with LRU eviction and a
//!   read-only mmap fast path.
//! - **Vector Store**: durable record chains with id and slot maps rebuilt
//!   by scanning at open.
//! - **Indexes**: exact flat scan and an HNSW graph with deterministic,
//!   seeded construction.
//! - **Search Executor**: parallel multi-collection fan-out, a bounded
//!   result cache keyed by request fingerprint, request coalescing.
//! - **Engine**: collection lifecycle, quarantine of damaged collections,
//!   flush and shutdown.

pub mod cancel;
pub mod codec;
pub mod collection;
pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod index;
pub mod model;
pub mod pager;
pub mod search;
pub mod store;
pub mod types;

pub use crate::cancel::CancelToken;
pub use crate::collection::{Collection, CollectionInfo, CollectionStats};
pub use crate::config::{Config, SyncPolicy};
pub use crate::distance::Metric;
pub use crate::engine::{Engine, EngineStats};
pub use crate::error::{CorruptionKind, Result, VettoreError};
pub use crate::model::{
    CollectionSpec, HnswParams, IndexKind, Metadata, MetadataValue, SearchHit, SearchRequest,
    VectorRecord,
};
pub use crate::types::{Epoch, PageId, Slot};
