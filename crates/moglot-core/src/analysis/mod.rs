//! Derived intelligence over stored slow queries: shape hashing,
//! pattern aggregation, and index suggestions.

pub mod patterns;
pub mod shape;
pub mod suggest;

pub use patterns::{
    OptimizationPotential, PatternAccumulator, QueryPattern, aggregate_records, group_key,
    sort_by_impact,
};
pub use suggest::{CollectionIndexReport, IndexField, IndexSuggestion, suggest_indexes};
