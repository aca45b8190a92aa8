//! Planner capability
//!
//! The planner that turns a brief into a plan is an external collaborator;
//! this crate only depends on the trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{Plan, TaskBrief};

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce an acyclic plan whose input references all resolve
    async fn plan(&self, brief: &TaskBrief) -> anyhow::Result<Plan>;

    /// Produce a replacement for `previous`, typically because a gate on
    /// `target` asked for one. The coordinator re-stamps the version.
    async fn replan(
        &self,
        brief: &TaskBrief,
        previous: &Plan,
        target: &str,
        reason: &str,
    ) -> anyhow::Result<Plan> {
        let _ = (brief, target);
        Err(anyhow::anyhow!(
            "planner does not support replanning plan '{}': {}",
            previous.plan_id,
            reason
        ))
    }
}

/// Planner that hands out pre-built plans in order; the last one repeats
pub struct StaticPlanner {
    plans: Mutex<VecDeque<Plan>>,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self::sequence(vec![plan])
    }

    pub fn sequence(plans: Vec<Plan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
        }
    }

    fn next_plan(&self) -> anyhow::Result<Plan> {
        let mut plans = self.plans.lock();
        match plans.len() {
            0 => Err(anyhow::anyhow!("static planner has no plans left")),
            1 => Ok(plans[0].clone()),
            _ => plans
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("static planner has no plans left")),
        }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _brief: &TaskBrief) -> anyhow::Result<Plan> {
        self.next_plan()
    }

    async fn replan(
        &self,
        _brief: &TaskBrief,
        _previous: &Plan,
        _target: &str,
        _reason: &str,
    ) -> anyhow::Result<Plan> {
        self.next_plan()
    }
}
