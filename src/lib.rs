//! # viewcache: incremental aggregation and result caching
//!
//! viewcache sits between database clients and a document database and
//! answers read-heavy aggregation queries without recomputing them:
//! - **Materialized views** - group-by aggregations kept current from change events
//! - **Eligibility matching** - a query is served from a view only when that is provably correct
//! - **Result cache** - frequency-evicting, byte-bounded, with a TTL
//! - **Pipeline engine** - match / group / limit over plain JSON documents
//!
//! ## Quick Start
//!
//! ```ignore
//! use viewcache::prelude::*;
//!
//! let engine = ViewCache::default();
//! let movies = Namespace::new("db", "movies");
//!
//! engine.create_view(
//!     ViewDefinition::new("by_genre", movies.clone(), Expression::field("genre"))
//!         .with_accumulator(AccumulatorDefinition::sum("total", Expression::field("score"))),
//! )?;
//! engine.load_view("by_genre", &[
//!     json!({"_id": 1, "genre": "action", "score": 10}),
//!     json!({"_id": 2, "genre": "drama", "score": 7}),
//! ])?;
//!
//! // Keep the view current
//! engine.apply_change(&ChangeEvent::insert(
//!     movies.clone(),
//!     json!({"_id": 3, "genre": "action", "score": 5}),
//! ));
//!
//! // Served from the view, no database round trip
//! let request = QueryRequest::aggregate(1, "db", "movies", json!([
//!     {"$group": {"_id": "$genre", "total": {"$sum": "$score"}}}
//! ]));
//! let response = engine.handle(&request, |pipeline| run_against_database(pipeline))?;
//! ```
//!
//! ## Architecture
//!
//! Leaf to root:
//!
//! 1. **Expressions** (`expression`, `parser`) - evaluation and content hashing
//! 2. **Accumulators** (`accumulator`) - batch and incremental reductions
//! 3. **Views** (`views`) - per-group accumulator state and its registry
//! 4. **Pipelines** (`pipeline`, `eligibility`) - uncached execution and view matching
//! 5. **Cache** (`cache`) - results of queries no view can answer
//! 6. **Engine** (`core`, `changes`) - query answering and change consumption
//!
//! ## Thread Safety
//!
//! Views keep their groups in a sharded map and update all accumulators of
//! a group under one lock, so readers never observe a half-applied event.
//! The cache guards its entries with a single mutex. A `ViewCache` clones
//! cheaply and clones share state.

// Internal modules
mod core;
mod error;
mod types;

pub mod accumulator;
pub mod cache;
pub mod changes;
pub mod config;
pub mod eligibility;
pub mod expression;
pub mod parser;
pub mod pipeline;
pub mod views;

// Public API exports
pub use crate::core::{
    Answer, ChangeSummary, EngineStats, QueryCommand, QueryRequest, QueryResponse, ViewCache,
};
pub use error::{CacheError, CacheResult};
pub use types::{
    ContentHash, Namespace, OrderedValue, canonical_key, compare_values, get_path, is_truthy,
    total_cmp,
};

// Component exports
pub use accumulator::{
    Accumulator, AccumulatorDefinition, AccumulatorId, AccumulatorKind, BasicAccumulator,
    CachedAccumulator, CachedValue,
};
pub use cache::{CacheKey, CacheStats, ResultCache};
pub use changes::{ChangeEvent, DocumentShadow, Mutation, OperationType, UpdateDescription};
pub use config::{CacheConfig, EngineConfig};
pub use eligibility::is_eligible;
pub use expression::{Expression, Operator, resolve_fields_by_hash};
pub use parser::{parse_expression, parse_pipeline};
pub use pipeline::{Pipeline, Stage, StageDefinition, StageKind, create_pipeline, execute_pipeline};
pub use views::{MaterializedView, ViewDefinition, ViewInfo, ViewManager, ViewState};

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use viewcache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{Answer, ChangeSummary, QueryRequest, QueryResponse, ViewCache};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::types::Namespace;
    pub use serde_json::{Value as JsonValue, json};

    pub use crate::accumulator::{AccumulatorDefinition, AccumulatorKind};
    pub use crate::cache::ResultCache;
    pub use crate::changes::{ChangeEvent, OperationType, UpdateDescription};
    pub use crate::config::{CacheConfig, EngineConfig};
    pub use crate::expression::{Expression, Operator};
    pub use crate::pipeline::{Pipeline, StageDefinition, create_pipeline, execute_pipeline};
    pub use crate::views::{ViewDefinition, ViewInfo, ViewState};
}
