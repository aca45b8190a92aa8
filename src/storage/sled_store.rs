//! sled-backed persistence; every value is zstd-compressed JSON

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::path::Path;
use tracing::{debug, info};

use super::Persistence;
use crate::coord::ExecutionResult;
use crate::core::errors::Result;
use crate::lineage::LineageSnapshot;
use crate::plan::Plan;
use crate::retrospect::RetrospectJob;

const PLANS: &str = "hindsight_plans";
const RUNS: &str = "hindsight_runs";
const LINEAGE: &str = "hindsight_lineage";
const RETROSPECTS: &str = "hindsight_retrospects";
const LATEST: &[u8] = b"latest";

/// Entry counts per tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub plans: usize,
    pub runs: usize,
    pub retrospects: usize,
    pub has_lineage: bool,
}

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    level: i32,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!("Opened sled store at {}", path.as_ref().display());
        Ok(Self { db, level: 3 })
    }

    /// In-memory store removed on drop, for tests and demos
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, level: 3 })
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(value)?;
        Ok(zstd::encode_all(&*serialized, self.level)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let raw = zstd::decode_all(bytes)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn get<T: DeserializeOwned>(&self, tree: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.open_tree(tree)?.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn all<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for entry in self.db.open_tree(tree)?.iter() {
            let (_, bytes) = entry?;
            values.push(Self::decode(&bytes)?);
        }
        Ok(values)
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            plans: self.db.open_tree(PLANS)?.len(),
            runs: self.db.open_tree(RUNS)?.len(),
            retrospects: self.db.open_tree(RETROSPECTS)?.len(),
            has_lineage: self.db.open_tree(LINEAGE)?.contains_key(LATEST)?,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for SledStore {
    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        if let Some(stored) = self.get::<Plan>(PLANS, plan.plan_id.as_bytes())? {
            if stored.version > plan.version {
                debug!(
                    "Keeping stored plan {} v{} over v{}",
                    plan.plan_id, stored.version, plan.version
                );
                return Ok(());
            }
        }
        let bytes = self.encode(plan)?;
        self.db.open_tree(PLANS)?.insert(plan.plan_id.as_bytes(), bytes)?;
        debug!("Saved plan {} v{}", plan.plan_id, plan.version);
        Ok(())
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        self.get(PLANS, plan_id.as_bytes())
    }

    async fn load_plans(&self) -> Result<Vec<Plan>> {
        self.all(PLANS)
    }

    async fn save_run(&self, result: &ExecutionResult) -> Result<()> {
        let bytes = self.encode(result)?;
        self.db.open_tree(RUNS)?.insert(result.run_id.as_bytes(), bytes)?;
        debug!("Saved run {} ({})", result.run_id, result.status);
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<ExecutionResult>> {
        self.get(RUNS, run_id.as_bytes())
    }

    async fn save_lineage(&self, snapshot: &LineageSnapshot) -> Result<()> {
        let bytes = self.encode(snapshot)?;
        self.db.open_tree(LINEAGE)?.insert(LATEST, bytes)?;
        info!("Saved lineage with {} artifacts", snapshot.nodes.len());
        Ok(())
    }

    async fn load_lineage(&self) -> Result<Option<LineageSnapshot>> {
        self.get(LINEAGE, LATEST)
    }

    async fn save_retrospects(&self, jobs: &[RetrospectJob]) -> Result<()> {
        let tree = self.db.open_tree(RETROSPECTS)?;
        for job in jobs {
            tree.insert(job.id.as_bytes(), self.encode(job)?)?;
        }
        debug!("Saved {} retrospect jobs", jobs.len());
        Ok(())
    }

    async fn load_retrospects(&self) -> Result<Vec<RetrospectJob>> {
        self.all(RETROSPECTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ContractBuilder, PlanBuilder, TaskBrief};

    fn plan(version: u64) -> Plan {
        PlanBuilder::new("etl", TaskBrief::new("load data"))
            .version(version)
            .step(ContractBuilder::new("ingest", "echo"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_plan_versions_never_regress() {
        let store = SledStore::temporary().unwrap();
        store.save_plan(&plan(2)).await.unwrap();
        store.save_plan(&plan(1)).await.unwrap();

        let loaded = store.load_plan("etl").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(store.load_plans().await.unwrap().len(), 1);
        assert!(store.load_plan("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lineage_snapshot_survives() {
        let store = SledStore::temporary().unwrap();
        assert!(store.load_lineage().await.unwrap().is_none());

        let snapshot = LineageSnapshot {
            edges: vec![("a".into(), "b".into())],
            next_seq: 7,
            ..Default::default()
        };
        store.save_lineage(&snapshot).await.unwrap();

        assert_eq!(store.load_lineage().await.unwrap(), Some(snapshot));
        let stats = store.get_stats().unwrap();
        assert!(stats.has_lineage);
        assert_eq!(stats.runs, 0);
    }
}
