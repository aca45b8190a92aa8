//! Storage layer
//!
//! Optional persistence for plans, run records, the lineage graph and the
//! retrospect job table, so a coordinator can pick up where a previous
//! process left off.

pub mod sled_store;

pub use sled_store::{SledStore, StoreStats};

use async_trait::async_trait;

use crate::coord::ExecutionResult;
use crate::core::errors::Result;
use crate::lineage::LineageSnapshot;
use crate::plan::Plan;
use crate::retrospect::RetrospectJob;

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a plan; an older version never overwrites a newer one
    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    /// Newest stored version of a plan
    async fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>>;

    async fn load_plans(&self) -> Result<Vec<Plan>>;

    async fn save_run(&self, result: &ExecutionResult) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<Option<ExecutionResult>>;

    async fn save_lineage(&self, snapshot: &LineageSnapshot) -> Result<()>;

    async fn load_lineage(&self) -> Result<Option<LineageSnapshot>>;

    /// Upsert jobs by id
    async fn save_retrospects(&self, jobs: &[RetrospectJob]) -> Result<()>;

    async fn load_retrospects(&self) -> Result<Vec<RetrospectJob>>;
}
