use anyhow::{anyhow, Result};
use hindsight::plan::ActionContract;
use hindsight::{
    async_trait, init_tracing, Capability, CheckInput, CheckVerdict, ContractBuilder, Coordinator,
    CoordinatorConfig, FnCheck, PlanBuilder, RetrospectSpec, StepCtx, StepOutput, TaskBrief, Usage,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// Loads a few customer rows, one of them carrying an ssn column
struct Loader;

#[async_trait]
impl Capability for Loader {
    fn name(&self) -> &str {
        "loader"
    }

    async fn execute(&self, _contract: &ActionContract, ctx: &StepCtx) -> anyhow::Result<StepOutput> {
        let path: String = ctx.get_input("path")?;
        info!("Loading {}", path);
        let rows = json!([
            {"name": "ada", "city": "london", "ssn": "123-45-6789"},
            {"name": "grace", "city": "arlington"},
        ]);
        Ok(StepOutput::success(json!({ "rows": rows })).with_usage(Usage::cost(0.001)))
    }
}

// Drops known PII keys; only the ssn column when run with strict=true
struct Sanitizer;

#[async_trait]
impl Capability for Sanitizer {
    fn name(&self) -> &str {
        "sanitizer"
    }

    async fn execute(&self, _contract: &ActionContract, ctx: &StepCtx) -> anyhow::Result<StepOutput> {
        let strict = ctx.param::<bool>("strict").unwrap_or(false);
        let mut rows: Vec<Value> = ctx.get_input("rows")?;
        for row in rows.iter_mut() {
            let obj = row
                .as_object_mut()
                .ok_or_else(|| anyhow!("row is not an object"))?;
            obj.remove("email");
            if strict {
                obj.remove("ssn");
            }
        }
        Ok(StepOutput::success(json!({ "rows": rows })).with_usage(Usage::cost(0.002)))
    }
}

struct Reporter;

#[async_trait]
impl Capability for Reporter {
    fn name(&self) -> &str {
        "reporter"
    }

    async fn execute(&self, _contract: &ActionContract, ctx: &StepCtx) -> anyhow::Result<StepOutput> {
        let rows: Vec<Value> = ctx.get_input("rows")?;
        let cities: Vec<&str> = rows.iter().filter_map(|r| r["city"].as_str()).collect();
        Ok(StepOutput::success(json!({
            "report": format!("{} customers in {}", rows.len(), cities.join(", ")),
        })))
    }
}

fn pii_scan(input: &CheckInput) -> CheckVerdict {
    if input.output.to_string().contains("ssn") {
        CheckVerdict::fail("ssn column present in sanitized rows")
    } else {
        CheckVerdict::pass()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,hindsight=debug");

    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .capability(Arc::new(Loader))
        .capability(Arc::new(Sanitizer))
        .capability(Arc::new(Reporter))
        .check(Arc::new(FnCheck::new("deep_pii_scan", pii_scan)))
        .build()?;

    let brief = TaskBrief::new("Publish a customer report without PII")
        .with_input("path", json!("customers.csv"))
        .with_required_output("report", "string")
        .with_budget(Some(0.05), None);

    let plan = PlanBuilder::new("customer_report", brief)
        .step(
            ContractBuilder::new("ingest", "loader")
                .intent("load raw rows")
                .input_ref("path", "inputs.path")
                .postcondition("len(output.rows) > 0"),
        )
        .step(
            ContractBuilder::new("sanitize", "sanitizer")
                .intent("strip PII")
                .after("ingest")
                .input_ref("rows", "{{ ingest.rows }}")
                .retrospect(
                    RetrospectSpec::new("deep_pii_scan", vec!["deep_pii_scan".into()])
                        .invalidating(Some("sanitize".into()), Some(json!({ "strict": true }))),
                ),
        )
        .step(
            ContractBuilder::new("report", "reporter")
                .intent("summarize")
                .after("sanitize")
                .input_ref("rows", "sanitize.rows")
                .output("report", "string"),
        )
        .build()?;

    let result = coordinator.execute_task(plan).await;
    println!("First run: {} -> {:?}", result.status, result.outputs.get("report"));

    // The scan runs behind the plan; give it time to report
    let stats = coordinator.retrospects().wait_idle(Duration::from_secs(5)).await?;
    if stats.failed > 0 {
        // Failure handling queues the replay right after the job settles
        for _ in 0..50 {
            if coordinator.replays().has_pending() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    for replayed in coordinator.process_replays().await {
        println!(
            "Replay v{}: {} (reused {:?}, executed {:?})",
            replayed.plan_version().unwrap_or_default(),
            replayed.status,
            replayed.steps_reused,
            replayed.steps_executed
        );
        println!("{}", serde_json::to_string_pretty(&replayed.artifacts)?);
    }

    coordinator.retrospects().wait_idle(Duration::from_secs(5)).await?;
    println!("{}", coordinator.lineage().to_dot());
    println!("{:#?}", coordinator.retrospects().get_stats());

    Ok(())
}
