// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host-facing interpreter: collect policy modules, a base document and
//! an input document, compile them into a bundle per query, evaluate, and
//! shape the result set.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::ast::FreshNames;
use crate::builtins::{Behavior, Decl, Registry};
use crate::bundle::Bundle;
use crate::compiler::{ModuleInput, RegoToBundle};
use crate::lexer::Source;
use crate::reader::Reader;
use crate::value::Value;
use anyhow::{anyhow, bail, Result};
use serde::Serialize;

/// One query result: the expression values produced along an evaluation
/// path, plus any variable bindings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueryResult {
    pub expressions: Vec<Value>,
    #[serde(skip_serializing_if = "Value::is_empty_object")]
    pub bindings: Value,
}

/// Structured output of a query evaluation.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Output {
    pub result: Vec<QueryResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Compiles and evaluates policies.
///
/// The interpreter holds modules, data and input between queries; each
/// query compiles a complete bundle and runs its query plan.
pub struct Interpreter {
    modules: Vec<Source>,
    data: Value,
    input: Value,
    registry: Registry,
    wf_checks: bool,
    budget: Option<Duration>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            modules: vec![],
            data: Value::new_object(),
            input: Value::new_object(),
            registry: Registry::standard(),
            wf_checks: cfg!(debug_assertions),
            budget: None,
        }
    }

    /// Enable or disable per-pass well-formedness validation.
    pub fn well_formed_checks_enabled(mut self, enabled: bool) -> Self {
        self.wf_checks = enabled;
        self
    }

    /// Bound the wall-clock time of each evaluation.
    pub fn set_eval_budget(&mut self, budget: Duration) {
        self.budget = Some(budget);
    }

    pub fn add_module(&mut self, name: &str, contents: &str) -> Result<()> {
        let source = Source::from_contents(name.to_string(), contents.to_string())?;
        self.modules.push(source);
        Ok(())
    }

    pub fn add_module_file<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        self.modules.push(Source::from_file(path)?);
        Ok(())
    }

    /// Merge a data document into the base document. Overlapping non-object
    /// values are a conflict.
    pub fn add_data(&mut self, data: Value) -> Result<()> {
        self.data = merge_data(&self.data, &data)?;
        Ok(())
    }

    pub fn add_data_json(&mut self, json: &str) -> Result<()> {
        self.add_data(Value::from_json_str(json)?)
    }

    pub fn add_data_json_file<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        self.add_data_json(&contents)
    }

    pub fn set_input(&mut self, input: Value) {
        self.input = input;
    }

    pub fn set_input_json(&mut self, json: &str) -> Result<()> {
        self.input = Value::from_json_str(json)?;
        Ok(())
    }

    pub fn register_builtin(&mut self, name: &str, decl: Decl, behavior: Behavior) -> Result<()> {
        self.registry.register_builtin(name, decl, behavior)
    }

    pub fn set_strict_errors(&mut self, strict: bool) {
        self.registry.set_strict_errors(strict);
    }

    /// Compile the collected modules plus a query into a bundle.
    pub fn compile_query(&self, query_expr: &str) -> Result<Bundle> {
        let reader = Reader::new().well_formed_checks(self.wf_checks);
        let mut fresh = FreshNames::default();

        let mut modules = vec![];
        for source in &self.modules {
            let result = reader.read_module(source, fresh);
            let (top, returned_fresh, strict) = result.into_node()?;
            fresh = returned_fresh;
            modules.push(ModuleInput {
                top,
                source: source.clone(),
                strict,
            });
        }

        let query_source = Source::synthetic("query", query_expr.to_string());
        let result = reader.read_query(&query_source, fresh);
        let (query_top, fresh, _) = result.into_node()?;

        RegoToBundle::new(&self.registry, self.data.clone())
            .compile(modules, Some((query_top, query_source)), fresh)
            .map_err(anyhow::Error::new)
    }

    /// Compile the collected modules without a query, e.g. to save the
    /// bundle for later evaluation.
    pub fn compile(&self) -> Result<Bundle> {
        let reader = Reader::new().well_formed_checks(self.wf_checks);
        let mut fresh = FreshNames::default();

        let mut modules = vec![];
        for source in &self.modules {
            let result = reader.read_module(source, fresh);
            let (top, returned_fresh, strict) = result.into_node()?;
            fresh = returned_fresh;
            modules.push(ModuleInput {
                top,
                source: source.clone(),
                strict,
            });
        }

        RegoToBundle::new(&self.registry, self.data.clone())
            .compile(modules, None, fresh)
            .map_err(anyhow::Error::new)
    }

    /// Evaluate a query and return its result set as JSON text.
    pub fn query(&mut self, query_expr: &str) -> Result<String> {
        let results = self.eval_query_values(query_expr)?;
        Ok(serde_json::to_string_pretty(&results)?)
    }

    /// Evaluate a query against an already-compiled bundle.
    pub fn query_bundle(&mut self, bundle: &Bundle) -> Result<Vec<Value>> {
        self.registry.freeze();
        let index = bundle
            .query_plan
            .ok_or_else(|| anyhow!("bundle has no query plan"))?;
        let mut machine = crate::vm::Machine::new(bundle, &self.registry, self.input.clone());
        if let Some(budget) = self.budget {
            machine.set_budget(budget);
        }
        machine.eval_plan(index)
    }

    /// Evaluate a query and return the raw result-set values.
    pub fn eval_query_values(&mut self, query_expr: &str) -> Result<Vec<Value>> {
        let bundle = self.compile_query(query_expr)?;
        self.query_bundle(&bundle)
    }

    /// Evaluate a query into the structured output shape.
    pub fn raw_query(&mut self, query_expr: &str) -> Result<Output> {
        let values = self.eval_query_values(query_expr)?;
        let mut output = Output::default();
        for element in values {
            let inner = element["result"].clone();
            let bindings = match &inner {
                Value::Object(map)
                    if !map.is_empty()
                        && map.keys().all(|k| matches!(k, Value::String(_))) =>
                {
                    inner.clone()
                }
                _ => Value::new_object(),
            };
            output.result.push(QueryResult {
                expressions: vec![inner],
                bindings,
            });
        }
        Ok(output)
    }
}

/// Merge two base documents; a non-object collision is an error.
fn merge_data(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut out: BTreeMap<Value, Value> = ma.as_ref().clone();
            for (k, v) in mb.iter() {
                let merged = match out.get(k) {
                    Some(existing) => merge_data(existing, v)?,
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Ok(Value::from(out))
        }
        _ if a == b => Ok(a.clone()),
        _ => bail!("rego_compile_error: data documents conflict"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merging_data_documents() {
        let a = Value::from_json_str(r#"{"x": {"y": 1}}"#).unwrap();
        let b = Value::from_json_str(r#"{"x": {"z": 2}}"#).unwrap();
        let merged = merge_data(&a, &b).unwrap();
        assert_eq!(
            serde_json::to_string(&merged).unwrap(),
            r#"{"x":{"y":1,"z":2}}"#
        );

        let c = Value::from_json_str(r#"{"x": {"y": 9}}"#).unwrap();
        assert!(merge_data(&a, &c).is_err());
    }
}
