use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::core::errors::{CoordError, Result};

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Budget thresholds for one run. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<u64>,
    pub max_tokens: Option<u64>,
}

impl BudgetLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(cost) = self.cost_usd {
            if !cost.is_finite() || cost < 0.0 {
                return Err(CoordError::configuration_field(
                    "cost limit must be a non-negative number",
                    "cost_usd",
                ));
            }
        }
        Ok(())
    }
}

/// Resource usage reported for a single step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub cost_usd: f64,
    /// Executor-reported latency; wall-clock time is used when absent
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

impl Usage {
    pub fn cost(cost_usd: f64) -> Self {
        Self {
            cost_usd,
            ..Default::default()
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// Add another attempt's usage to this one
    pub fn absorb(&mut self, other: &Usage) {
        self.cost_usd += other.cost_usd;
        self.latency_ms = match (self.latency_ms, other.latency_ms) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
    }
}

/// Accumulated metrics of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Budget usage tracker. A charge that would cross a limit is rejected
/// whole, so charged metrics never exceed the limits. Usage carried over
/// from artifacts paid for by earlier runs is counted as is.
#[derive(Debug)]
pub struct BudgetTracker {
    limits: BudgetLimits,
    enforce: bool,

    cost_micros: AtomicU64,
    latency_ms: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,

    total_charges: AtomicU64,
    total_limit_violations: AtomicU64,

    /// Artifact ids whose usage is already in the totals
    accounted: Mutex<HashSet<String>>,
}

impl BudgetTracker {
    pub fn new(limits: BudgetLimits, enforce: bool) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            limits,
            enforce,
            cost_micros: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            tokens_in: AtomicU64::new(0),
            tokens_out: AtomicU64::new(0),
            total_charges: AtomicU64::new(0),
            total_limit_violations: AtomicU64::new(0),
            accounted: Mutex::new(HashSet::new()),
        })
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Charge one step's usage. `wall_clock_ms` is used as latency when the
    /// executor did not report its own.
    pub fn charge(&self, usage: &Usage, wall_clock_ms: u64) -> Result<()> {
        let latency = usage.latency_ms.unwrap_or(wall_clock_ms);
        let cost_now = self.cost_micros.load(Ordering::Relaxed);
        let latency_now = self.latency_ms.load(Ordering::Relaxed);
        let tokens_now =
            self.tokens_in.load(Ordering::Relaxed) + self.tokens_out.load(Ordering::Relaxed);

        let cost_next = cost_now + to_micros(usage.cost_usd);
        let latency_next = latency_now + latency;
        let tokens_next = tokens_now + usage.tokens_in + usage.tokens_out;

        if self.enforce {
            if let Some(limit) = self.limits.cost_usd {
                if cost_next > to_micros(limit) {
                    return Err(self.violation(
                        "cost_usd",
                        from_micros(cost_now),
                        from_micros(cost_next),
                        limit,
                    ));
                }
            }
            if let Some(limit) = self.limits.latency_ms {
                if latency_next > limit {
                    return Err(self.violation(
                        "latency_ms",
                        latency_now as f64,
                        latency_next as f64,
                        limit as f64,
                    ));
                }
            }
            if let Some(limit) = self.limits.max_tokens {
                if tokens_next > limit {
                    return Err(self.violation(
                        "tokens",
                        tokens_now as f64,
                        tokens_next as f64,
                        limit as f64,
                    ));
                }
            }
        }

        self.cost_micros.store(cost_next, Ordering::Relaxed);
        self.latency_ms.store(latency_next, Ordering::Relaxed);
        self.tokens_in.fetch_add(usage.tokens_in, Ordering::Relaxed);
        self.tokens_out.fetch_add(usage.tokens_out, Ordering::Relaxed);
        self.total_charges.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Charged ${:.4} / {}ms, totals: ${:.4} / {}ms",
            usage.cost_usd,
            latency,
            from_micros(cost_next),
            latency_next
        );
        Ok(())
    }

    /// Mark an artifact as paid for by a charge of this tracker
    pub fn account(&self, artifact_id: &str) {
        self.accounted.lock().insert(artifact_id.to_string());
    }

    /// Add the recorded usage of a reused artifact. Never rejected; an
    /// artifact is counted once per tracker.
    pub fn carry(&self, artifact_id: &str, usage: &Usage) -> bool {
        if !self.accounted.lock().insert(artifact_id.to_string()) {
            return false;
        }
        self.cost_micros
            .fetch_add(to_micros(usage.cost_usd), Ordering::Relaxed);
        self.latency_ms
            .fetch_add(usage.latency_ms.unwrap_or(0), Ordering::Relaxed);
        self.tokens_in.fetch_add(usage.tokens_in, Ordering::Relaxed);
        self.tokens_out.fetch_add(usage.tokens_out, Ordering::Relaxed);
        debug!("Carried ${:.4} of {}", usage.cost_usd, artifact_id);
        true
    }

    /// Fails once carried usage is already past a limit
    pub fn check(&self) -> Result<()> {
        if !self.enforce {
            return Ok(());
        }
        let metrics = self.metrics();
        let tokens = metrics.tokens_in + metrics.tokens_out;
        if let Some(limit) = self.limits.cost_usd {
            if self.cost_micros.load(Ordering::Relaxed) > to_micros(limit) {
                return Err(self.violation("cost_usd", metrics.cost_usd, metrics.cost_usd, limit));
            }
        }
        if let Some(limit) = self.limits.latency_ms {
            if metrics.latency_ms > limit {
                return Err(self.violation(
                    "latency_ms",
                    metrics.latency_ms as f64,
                    metrics.latency_ms as f64,
                    limit as f64,
                ));
            }
        }
        if let Some(limit) = self.limits.max_tokens {
            if tokens > limit {
                return Err(self.violation("tokens", tokens as f64, tokens as f64, limit as f64));
            }
        }
        Ok(())
    }

    fn violation(&self, resource: &str, used: f64, attempted: f64, limit: f64) -> CoordError {
        self.total_limit_violations.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Budget limit on {} reached: used {}, attempted {}, limit {}",
            resource, used, attempted, limit
        );
        CoordError::budget(resource, used, attempted, limit)
    }

    pub fn metrics(&self) -> RunMetrics {
        RunMetrics {
            cost_usd: from_micros(self.cost_micros.load(Ordering::Relaxed)),
            latency_ms: self.latency_ms.load(Ordering::Relaxed),
            tokens_in: self.tokens_in.load(Ordering::Relaxed),
            tokens_out: self.tokens_out.load(Ordering::Relaxed),
        }
    }

    pub fn violations(&self) -> u64 {
        self.total_limit_violations.load(Ordering::Relaxed)
    }

    pub fn charges(&self) -> u64 {
        self.total_charges.load(Ordering::Relaxed)
    }
}

fn to_micros(usd: f64) -> u64 {
    if usd <= 0.0 || !usd.is_finite() {
        return 0;
    }
    (usd * MICROS_PER_USD).round() as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}
