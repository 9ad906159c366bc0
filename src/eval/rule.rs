//! Sandboxed classification rules.
//!
//! A rule is a Rhai script that sees the raw measurement as plain variables
//! and returns `#{status: "...", latency: ...}`, or `()` for no result.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use thiserror::Error;

use super::Evaluation;
use crate::db::Status;
use crate::probe::RawResult;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule failed to compile: {0}")]
    Compile(String),
    #[error("rule failed at runtime: {0}")]
    Runtime(String),
    #[error("rule returned an invalid result: {0}")]
    Output(String),
    #[error("rule cache lock poisoned")]
    Poisoned,
}

pub struct RuleEngine {
    engine: Engine,
    // monitor tag -> (source, compiled)
    cache: RwLock<HashMap<String, (String, AST)>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();

        // No file imports and no dynamic code
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.set_max_operations(100_000);
        engine.set_max_call_levels(16);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(64 * 1024);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(1_000);

        engine.on_print(|x| {
            tracing::debug!("RULE: {}", x);
        });
        engine.on_debug(|x, _, _| {
            tracing::debug!("RULE: {}", x);
        });

        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Compile `source` for `tag`, reusing the cached AST when unchanged.
    pub fn compile(&self, tag: &str, source: &str) -> Result<AST, RuleError> {
        {
            let cache = self.cache.read().map_err(|_| RuleError::Poisoned)?;
            if let Some((cached_source, ast)) = cache.get(tag) {
                if cached_source == source {
                    return Ok(ast.clone());
                }
            }
        }

        let ast = self
            .engine
            .compile(source)
            .map_err(|e| RuleError::Compile(e.to_string()))?;
        self.cache
            .write()
            .map_err(|_| RuleError::Poisoned)?
            .insert(tag.to_string(), (source.to_string(), ast.clone()));
        Ok(ast)
    }

    pub fn forget(&self, tag: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(tag);
        }
    }

    /// Run the rule for `tag` against a raw result.
    pub fn evaluate(
        &self,
        tag: &str,
        source: &str,
        raw: &RawResult,
        measured_latency: f64,
    ) -> Result<Option<Evaluation>, RuleError> {
        let ast = self.compile(tag, source)?;

        let mut scope = Scope::new();
        scope.push("latency", measured_latency);
        push_inputs(&mut scope, raw)?;

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| RuleError::Runtime(e.to_string()))?;

        if result.is_unit() {
            return Ok(None);
        }
        parse_output(result, measured_latency).map(Some)
    }
}

fn push_inputs(scope: &mut Scope, raw: &RawResult) -> Result<(), RuleError> {
    match raw {
        RawResult::Http { status_code, response_time, body } => {
            scope.push("status_code", *status_code as i64);
            scope.push("response_time", *response_time);
            scope.push("body", body.clone());
        }
        RawResult::Probes(probes) => {
            scope.push("probes", to_dynamic(probes)?);
        }
        RawResult::Dns { records, response_time, .. } => {
            scope.push("records", to_dynamic(records)?);
            scope.push("response_time", *response_time);
        }
        RawResult::Certificate { valid, hours_remaining, response_time } => {
            scope.push("valid", *valid);
            scope.push("hours_remaining", *hours_remaining);
            scope.push("response_time", *response_time);
        }
        RawResult::Sql { ok, rows, response_time, .. } => {
            scope.push("ok", *ok);
            scope.push("rows", *rows as i64);
            scope.push("response_time", *response_time);
        }
        RawResult::Heartbeat { last_signal, window_minutes } => {
            let age = last_signal
                .map(|ts| (chrono::Utc::now() - ts).num_minutes())
                .map(Dynamic::from)
                .unwrap_or(Dynamic::UNIT);
            scope.push("signal_age_minutes", age);
            scope.push("window_minutes", *window_minutes);
        }
        RawResult::Group { children } => {
            scope.push("children", to_dynamic(children)?);
        }
    }
    Ok(())
}

fn to_dynamic<T: serde::Serialize>(value: &T) -> Result<Dynamic, RuleError> {
    rhai::serde::to_dynamic(value).map_err(|e| RuleError::Runtime(e.to_string()))
}

fn parse_output(result: Dynamic, measured_latency: f64) -> Result<Evaluation, RuleError> {
    let type_name = result.type_name();
    let map = result
        .try_cast::<Map>()
        .ok_or_else(|| RuleError::Output(format!("expected a map, got {}", type_name)))?;

    let status = map
        .get("status")
        .and_then(|s| s.clone().into_string().ok())
        .ok_or_else(|| RuleError::Output("missing status".to_string()))?;
    let status = Status::from_str(&status).map_err(RuleError::Output)?;

    let latency = match map.get("latency") {
        None => measured_latency,
        Some(v) => v
            .as_float()
            .or_else(|_| v.as_int().map(|i| i as f64))
            .map_err(|t| RuleError::Output(format!("latency must be a number, got {}", t)))?,
    };
    if latency < 0.0 {
        return Err(RuleError::Output("latency must not be negative".to_string()));
    }

    Ok(Evaluation { status, latency })
}
