//! Data model for vector records and collection specs.
//!
//! A [`VectorRecord`] is a caller-supplied string id, a fixed-dimension
//! vector, and a small typed metadata map. A [`CollectionSpec`] freezes the
//! attributes a collection is created with; only counters mutate afterwards.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::distance::Metric;
use crate::error::{Result, VettoreError};

/// Longest allowed collection name.
pub const MAX_NAME_LEN: usize = 64;

/// Largest accepted vector dimensionality.
pub const MAX_DIMENSIONS: usize = 65_536;

/// Upper bound on `k` and `ef_search` per query.
pub const MAX_SEARCH_K: usize = 10_000;

/// Typed scalar stored under a metadata key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Metadata map attached to a record. `BTreeMap` keeps the encoded byte
/// representation stable across round trips.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// One stored vector with its metadata and internal bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    /// Nanosecond wall-clock timestamp assigned at insert time.
    pub created_at: u64,
    pub tombstone: bool,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: Metadata::new(),
            created_at: 0,
            tombstone: false,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Which index structure a collection uses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Flat,
    Hnsw,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Flat => "flat",
            IndexKind::Hnsw => "hnsw",
        }
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            IndexKind::Flat => 0,
            IndexKind::Hnsw => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(IndexKind::Flat),
            1 => Some(IndexKind::Hnsw),
            _ => None,
        }
    }
}

/// Build- and query-time parameters for an HNSW collection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct HnswParams {
    /// Neighbors kept per node per level above 0; level 0 keeps `2 * m`.
    pub m: usize,
    /// Candidate-list size while building the graph.
    pub ef_construction: usize,
    /// Default candidate-list size at query time; overridable per query.
    pub ef_search: usize,
    /// Hard cap on the level a node may be assigned.
    pub max_level: u8,
    /// Seed for the deterministic level PRNG.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            max_level: 16,
            seed: 0,
        }
    }
}

impl HnswParams {
    /// Level-0 neighbor bound.
    pub fn m0(&self) -> usize {
        self.m * 2
    }

    /// Level-assignment constant `1 / ln(m)`.
    pub fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}

/// Immutable attributes sealed into `collection.meta` at creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSpec {
    pub name: String,
    pub dimensions: usize,
    pub metric: Metric,
    pub index: IndexKind,
    pub page_size: u32,
    pub hnsw: HnswParams,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, dimensions: usize, metric: Metric) -> Self {
        Self {
            name: name.into(),
            dimensions,
            metric,
            index: IndexKind::Flat,
            page_size: 4096,
            hnsw: HnswParams::default(),
        }
    }

    pub fn with_index(mut self, index: IndexKind) -> Self {
        self.index = index;
        self
    }

    pub fn with_hnsw_params(mut self, params: HnswParams) -> Self {
        self.index = IndexKind::Hnsw;
        self.hnsw = params;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.dimensions == 0 || self.dimensions > MAX_DIMENSIONS {
            return Err(VettoreError::InvalidSpec(format!(
                "dimensions must be in 1..={MAX_DIMENSIONS}, got {}",
                self.dimensions
            )));
        }
        if !self.page_size.is_power_of_two() || !(512..=65_536).contains(&self.page_size) {
            return Err(VettoreError::InvalidSpec(format!(
                "page size must be a power of two in [512, 65536], got {}",
                self.page_size
            )));
        }
        if self.index == IndexKind::Hnsw {
            if self.hnsw.m < 2 {
                return Err(VettoreError::InvalidSpec(format!(
                    "hnsw m must be at least 2, got {}",
                    self.hnsw.m
                )));
            }
            if self.hnsw.ef_construction < self.hnsw.m {
                return Err(VettoreError::InvalidSpec(format!(
                    "hnsw ef_construction must be at least m, got {}",
                    self.hnsw.ef_construction
                )));
            }
            if self.hnsw.ef_search == 0 || self.hnsw.ef_search > MAX_SEARCH_K {
                return Err(VettoreError::InvalidSpec(format!(
                    "hnsw ef_search must be in 1..={MAX_SEARCH_K}, got {}",
                    self.hnsw.ef_search
                )));
            }
            if self.hnsw.max_level == 0 {
                return Err(VettoreError::InvalidSpec(
                    "hnsw max_level must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Collection names travel through file paths; the accepted alphabet keeps
/// them portable across filesystems.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(VettoreError::InvalidSpec(format!(
            "collection name must be 1..={MAX_NAME_LEN} characters, got {}",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(VettoreError::InvalidSpec(format!(
            "collection name contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Query parameters accepted by `search` and `search_multi`.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: Vec<f32>,
    pub k: usize,
    /// Overrides the collection's `ef_search` when set.
    pub ef_search: Option<usize>,
    /// Drops hits whose similarity score falls below this after ranking.
    pub min_score: Option<f32>,
    pub include_metadata: bool,
    /// Conjunction of exact-match predicates over metadata keys.
    pub filter: Metadata,
}

impl SearchRequest {
    pub fn new(query: Vec<f32>, k: usize) -> Self {
        Self {
            query,
            k,
            ef_search: None,
            min_score: None,
            include_metadata: true,
            filter: Metadata::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > MAX_SEARCH_K {
            return Err(VettoreError::InvalidSpec(format!(
                "k must be in 1..={MAX_SEARCH_K}, got {}",
                self.k
            )));
        }
        if let Some(ef) = self.ef_search {
            if ef == 0 || ef > MAX_SEARCH_K {
                return Err(VettoreError::InvalidSpec(format!(
                    "ef_search must be in 1..={MAX_SEARCH_K}, got {ef}"
                )));
            }
        }
        Ok(())
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub collection: String,
    pub id: String,
    /// Metric distance to the query; smaller is more similar for every metric.
    pub distance: f32,
    /// Similarity score derived from the distance; larger is more similar.
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip)]
    pub(crate) slot: u64,
}
