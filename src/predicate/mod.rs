//! Sandboxed assertion evaluation
//!
//! Assertions such as `len(output.data) > 0` or
//! `retro_green('R1') AND retro_green('R2')` are parsed into a small typed
//! expression tree and evaluated against a JSON context document. There is
//! no way to call out to anything beyond the fixed function set:
//! `len`, `exists`, `contains`, `file_exists`, `retro_green`.

pub mod parser;

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

use crate::core::errors::{CoordError, Result};
use crate::retrospect::JobStatus;
pub use parser::{CmpOp, Expr, PathSeg};

/// Pluggable assertion evaluator shared by gates and retrospects
pub trait PredicateEvaluator: Send + Sync {
    fn evaluate(&self, assertion: &str, ctx: &PredicateContext) -> Result<bool>;

    /// Retrospect ids an assertion depends on through `retro_green`
    fn referenced_retros(&self, assertion: &str) -> Vec<String> {
        let _ = assertion;
        Vec::new()
    }
}

/// Everything an assertion can see: a JSON document addressed by dotted
/// paths (`inputs`, `output`, `artifacts`, `brief`, `step`, ...) plus the
/// current retrospect statuses of the plan.
#[derive(Debug, Clone, Default)]
pub struct PredicateContext {
    document: Map<String, Value>,
    retro_status: HashMap<String, JobStatus>,
}

impl PredicateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.document.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.document.insert(key.into(), value);
    }

    pub fn with_retro_status(mut self, statuses: HashMap<String, JobStatus>) -> Self {
        self.retro_status = statuses;
        self
    }

    pub fn set_retro_status(&mut self, statuses: HashMap<String, JobStatus>) {
        self.retro_status = statuses;
    }

    pub fn retro_status(&self, retro_id: &str) -> Option<JobStatus> {
        self.retro_status.get(retro_id).copied()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    /// Resolve a path; missing fields resolve to null
    pub fn resolve(&self, path: &[PathSeg]) -> Value {
        let mut segs = path.iter();
        let mut current = match segs.next() {
            Some(PathSeg::Key(key)) => match self.document.get(key) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
        for seg in segs {
            let next = match (seg, current) {
                (PathSeg::Key(key), Value::Object(map)) => map.get(key),
                (PathSeg::Index(i), Value::Array(items)) => items.get(*i),
                (PathSeg::Key(key), Value::Array(items)) => {
                    key.parse::<usize>().ok().and_then(|i| items.get(i))
                }
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

/// Parsed expressions kept per evaluator
const MAX_CACHED: usize = 1024;

/// Default evaluator over the built-in expression grammar. Parsed
/// expressions are cached by assertion text, up to `MAX_CACHED` of them.
#[derive(Debug, Default)]
pub struct ExprEvaluator {
    sandbox_root: Option<PathBuf>,
    cache: DashMap<String, Arc<Expr>>,
}

impl ExprEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = Some(root.into());
        self
    }

    pub fn parse(&self, assertion: &str) -> Result<Arc<Expr>> {
        if let Some(expr) = self.cache.get(assertion) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(
            parser::parse(assertion).map_err(|msg| CoordError::predicate(assertion, msg))?,
        );
        if self.cache.len() < MAX_CACHED {
            self.cache.insert(assertion.to_string(), expr.clone());
        }
        Ok(expr)
    }

    pub fn cached_expressions(&self) -> usize {
        self.cache.len()
    }

    fn eval(&self, expr: &Expr, ctx: &PredicateContext) -> std::result::Result<Value, String> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(ctx.resolve(path)),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner, ctx)?)),
            Expr::And(l, r) => {
                Ok(Value::Bool(self.eval_bool(l, ctx)? && self.eval_bool(r, ctx)?))
            }
            Expr::Or(l, r) => Ok(Value::Bool(self.eval_bool(l, ctx)? || self.eval_bool(r, ctx)?)),
            Expr::Compare(op, l, r) => {
                let left = self.eval(l, ctx)?;
                let right = self.eval(r, ctx)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Expr::Call(name, args) => self.call(name, args, ctx),
        }
    }

    fn eval_bool(&self, expr: &Expr, ctx: &PredicateContext) -> std::result::Result<bool, String> {
        match self.eval(expr, ctx)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(format!("expected a boolean, found {}", other)),
        }
    }

    fn call(
        &self,
        name: &str,
        args: &[Expr],
        ctx: &PredicateContext,
    ) -> std::result::Result<Value, String> {
        let arity = |n: usize| -> std::result::Result<(), String> {
            if args.len() == n {
                Ok(())
            } else {
                Err(format!("{}() takes {} argument(s), got {}", name, n, args.len()))
            }
        };
        match name {
            "len" => {
                arity(1)?;
                let n = match self.eval(&args[0], ctx)? {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::Null => 0,
                    other => return Err(format!("len() of non-collection {}", other)),
                };
                Ok(Value::from(n as u64))
            }
            "exists" => {
                arity(1)?;
                Ok(Value::Bool(!self.eval(&args[0], ctx)?.is_null()))
            }
            "contains" => {
                arity(2)?;
                let haystack = self.eval(&args[0], ctx)?;
                let needle = self.eval(&args[1], ctx)?;
                let found = match (&haystack, &needle) {
                    (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
                    (Value::Array(items), n) => items.iter().any(|item| values_equal(item, n)),
                    (Value::Object(map), Value::String(key)) => map.contains_key(key),
                    (Value::Null, _) => false,
                    _ => return Err(format!("contains() cannot search {} for {}", haystack, needle)),
                };
                Ok(Value::Bool(found))
            }
            "file_exists" => {
                arity(1)?;
                match self.eval(&args[0], ctx)? {
                    Value::String(path) => self.file_exists(&path).map(Value::Bool),
                    other => Err(format!("file_exists() expects a path string, got {}", other)),
                }
            }
            "retro_green" => {
                arity(1)?;
                match self.eval(&args[0], ctx)? {
                    Value::String(id) => Ok(Value::Bool(ctx.retro_status(&id) == Some(JobStatus::Ok))),
                    other => Err(format!("retro_green() expects a retrospect id, got {}", other)),
                }
            }
            _ => Err(format!("unknown function '{}'", name)),
        }
    }

    fn file_exists(&self, raw: &str) -> std::result::Result<bool, String> {
        let path = Path::new(raw);
        if path.is_absolute() || raw.starts_with('/') || raw.starts_with('\\') {
            return Err(format!("absolute path '{}' is outside the sandbox", raw));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
        {
            return Err(format!("path '{}' escapes the sandbox", raw));
        }
        let resolved = match &self.sandbox_root {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        };
        Ok(resolved.exists())
    }
}

impl PredicateEvaluator for ExprEvaluator {
    fn evaluate(&self, assertion: &str, ctx: &PredicateContext) -> Result<bool> {
        let expr = self.parse(assertion)?;
        let result = self
            .eval_bool(&expr, ctx)
            .map_err(|msg| CoordError::predicate(assertion, msg))?;
        trace!("assertion '{}' -> {}", assertion, result);
        Ok(result)
    }

    fn referenced_retros(&self, assertion: &str) -> Vec<String> {
        self.parse(assertion)
            .map(|expr| expr.referenced_retros())
            .unwrap_or_default()
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> std::result::Result<bool, String> {
    match op {
        CmpOp::Eq => return Ok(values_equal(left, right)),
        CmpOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            l.partial_cmp(&r)
                .ok_or_else(|| format!("cannot order {} and {}", l, r))?
        }
        (Value::String(l), Value::String(r)) => l.cmp(r),
        _ => return Err(format!("cannot order {} and {}", left, right)),
    };
    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
    })
}
