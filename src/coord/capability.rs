//! External executor capabilities
//!
//! A capability is whatever actually performs a step: an agent, a tool, a
//! service call. It only computes; recording, gating and scheduling stay
//! with the coordinator.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::budget::Usage;
use crate::plan::ActionContract;

/// Context for one execution attempt (immutable, clonable)
#[derive(Debug, Clone)]
pub struct StepCtx {
    pub run_id: String,
    pub plan_id: String,
    pub plan_version: u64,
    pub step_id: String,
    /// Input slots resolved against the brief and upstream artifacts
    pub inputs: Value,
    /// Static parameters with any replay patch merged in
    pub params: Map<String, Value>,
    /// Zero for the first attempt
    pub attempt: u32,
}

impl StepCtx {
    /// Get input value by key
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .inputs
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))
    }

    /// Get optional input value
    pub fn get_input_opt<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.inputs.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }

    pub fn param<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Result of a successful execution
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub output: Value,
    /// Effects actually performed. `None` means the declared tags apply.
    pub side_effects: Option<Vec<String>>,
    pub usage: Usage,
    pub confidence: Option<f64>,
}

impl StepOutput {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_side_effects(mut self, effects: Vec<String>) -> Self {
        self.side_effects = Some(effects);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// An agent or tool a step can be bound to
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, contract: &ActionContract, ctx: &StepCtx) -> anyhow::Result<StepOutput>;
}

/// Returns its resolved inputs unchanged
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, _contract: &ActionContract, ctx: &StepCtx) -> anyhow::Result<StepOutput> {
        tracing::info!("Echo capability: {} with inputs: {}", ctx.step_id, ctx.inputs);
        Ok(StepOutput::success(ctx.inputs.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_returns_inputs() {
        let ctx = StepCtx {
            run_id: "run".into(),
            plan_id: "p".into(),
            plan_version: 1,
            step_id: "s".into(),
            inputs: json!({"path": "x.csv", "limit": 3}),
            params: Map::new(),
            attempt: 0,
        };
        let out = EchoCapability
            .execute(&ActionContract::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.output["path"], "x.csv");
        assert!(out.side_effects.is_none());

        let limit: u32 = ctx.get_input("limit").unwrap();
        assert_eq!(limit, 3);
        assert!(ctx.get_input_opt::<String>("missing").unwrap().is_none());
        assert!(ctx.get_input::<String>("missing").is_err());
    }
}
