//! Embedded storage: schema, bulk-load/normal store modes, read-side
//! aggregates, and the deferred index build worker.

mod indexer;
mod queries;
pub mod schema;
mod store;

pub use indexer::{DEFAULT_IDLE_TIMEOUT, IndexBuildService};
pub use queries::{
    DashboardStats, Page, PatternGrouping, PatternRow, PlanFilter, QueryFilters, ResourceTopRow,
    ResourceTotals, ResourceWorkload, SlowQueryRow, TopOperation, TopSource,
};
pub use store::{AuthBinding, LogStore, StoreMode};
