// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::builtins::Registry;
use crate::bundle::{Block, Bundle, Operand, Statement, StatementKind};
use crate::number::Number;
use crate::value::Value;
use anyhow::{anyhow, bail, Result};
use core::str::FromStr;

// Recursion through the virtual document is illegal in the language; the
// depth guard turns runaway call chains into a runtime error instead of
// exhausting the native stack.
const MAX_CALL_DEPTH: usize = 256;

// How often the wall-clock budget is polled.
const BUDGET_CHECK_INTERVAL: usize = 1024;

/// Control flow of one statement or block.
enum Flow {
    Ok,
    /// The statement failed; the remainder of the enclosing block is
    /// skipped.
    Fail,
    /// Exit the n-th enclosing block.
    Break(usize),
    /// The function returns this value.
    Return(Value),
}

/// Evaluates plans of one bundle against an input document.
///
/// Single-threaded and deterministic; one machine evaluates one plan at a
/// time. The memoization table for cacheable functions lives for a single
/// plan evaluation so `with` overlays are honoured.
pub struct Machine<'a> {
    bundle: &'a Bundle,
    registry: &'a Registry,
    input: Value,
    data: Value,
    /// Interned strings as values, index-aligned with `bundle.strings`.
    strings: Vec<Value>,
    results: Vec<Value>,
    memo: BTreeMap<usize, Value>,
    overlay_depth: usize,
    call_depth: usize,
    budget: Option<(Instant, Duration)>,
    statements_executed: usize,
}

impl<'a> Machine<'a> {
    pub fn new(bundle: &'a Bundle, registry: &'a Registry, input: Value) -> Self {
        Self {
            bundle,
            registry,
            input,
            data: bundle.data.clone(),
            strings: bundle
                .strings
                .iter()
                .map(|s| Value::String(s.as_str().into()))
                .collect(),
            results: vec![],
            memo: BTreeMap::new(),
            overlay_depth: 0,
            call_depth: 0,
            budget: None,
            statements_executed: 0,
        }
    }

    /// Bound wall-clock time for the next evaluation; checked between
    /// statements.
    pub fn set_budget(&mut self, budget: Duration) {
        self.budget = Some((Instant::now(), budget));
    }

    /// Run one plan to completion and return its result set.
    pub fn eval_plan(&mut self, index: usize) -> Result<Vec<Value>> {
        let bundle = self.bundle;
        let plan = bundle
            .plans
            .get(index)
            .ok_or_else(|| anyhow!("plan index {index} out of range"))?;

        if let Some((start, _)) = &mut self.budget {
            *start = Instant::now();
        }
        self.results.clear();
        self.memo.clear();

        let mut frame = self.new_frame();
        for block in &plan.blocks {
            match self.run_block(&mut frame, block)? {
                Flow::Ok | Flow::Fail => (),
                Flow::Break(_) | Flow::Return(_) => break,
            }
        }
        Ok(std::mem::take(&mut self.results))
    }

    pub fn eval_plan_by_name(&mut self, name: &str) -> Result<Vec<Value>> {
        match self.bundle.find_plan(name) {
            Some(index) => self.eval_plan(index),
            None => bail!("unknown plan {name}"),
        }
    }

    fn new_frame(&self) -> Vec<Value> {
        let mut frame = vec![Value::Undefined; self.bundle.local_count.max(2)];
        frame[0] = self.input.clone();
        frame[1] = self.data.clone();
        frame
    }

    fn check_budget(&mut self) -> Result<()> {
        self.statements_executed += 1;
        if self.statements_executed % BUDGET_CHECK_INTERVAL != 0 {
            return Ok(());
        }
        if let Some((start, budget)) = &self.budget {
            if start.elapsed() > *budget {
                bail!("runtime_error: evaluation exceeded its time budget");
            }
        }
        Ok(())
    }

    fn operand(&self, frame: &[Value], operand: &Operand) -> Result<Value> {
        Ok(match operand {
            Operand::Local(index) => frame
                .get(*index)
                .cloned()
                .ok_or_else(|| anyhow!("runtime_error: local {index} out of range"))?,
            Operand::String(index) => self
                .strings
                .get(*index)
                .cloned()
                .ok_or_else(|| anyhow!("runtime_error: string {index} out of range"))?,
            Operand::Bool(b) => Value::Bool(*b),
            Operand::Value(v) => Value::from(*v),
            Operand::Index(i) => Value::from(*i as u64),
            Operand::None => Value::Undefined,
        })
    }

    fn string(&self, index: usize) -> Result<&str> {
        self.bundle.string(index)
    }

    fn run_block(&mut self, frame: &mut Vec<Value>, block: &Block) -> Result<Flow> {
        for statement in block {
            match self.exec(frame, statement)? {
                Flow::Ok => (),
                Flow::Fail => return Ok(Flow::Fail),
                Flow::Break(0) => return Ok(Flow::Ok),
                Flow::Break(n) => return Ok(Flow::Break(n - 1)),
                Flow::Return(v) => return Ok(Flow::Return(v)),
            }
        }
        Ok(Flow::Ok)
    }

    fn exec(&mut self, frame: &mut Vec<Value>, statement: &Statement) -> Result<Flow> {
        self.check_budget()?;

        match &statement.kind {
            StatementKind::MakeObject { target } => {
                frame[*target] = Value::new_object();
            }
            StatementKind::MakeArray { target, .. } => {
                frame[*target] = Value::new_array();
            }
            StatementKind::MakeSet { target } => {
                frame[*target] = Value::new_set();
            }
            StatementKind::MakeNull { target } => {
                frame[*target] = Value::Null;
            }
            StatementKind::MakeNumberInt { value, target }
            | StatementKind::AssignInt { value, target } => {
                frame[*target] = Value::from(*value);
            }
            StatementKind::MakeNumberRef { index, target } => {
                let text = self.string(*index)?;
                match Number::from_str(text) {
                    Ok(n) => frame[*target] = Value::Number(n),
                    Err(_) => bail!("runtime_error: invalid number literal {text:?}"),
                }
            }
            StatementKind::AssignVar { source, target } => {
                frame[*target] = self.operand(frame, source)?;
            }
            StatementKind::AssignVarOnce { source, target } => {
                let value = self.operand(frame, source)?;
                if value.is_undefined() {
                    return Ok(Flow::Fail);
                }
                if frame[*target].is_undefined() {
                    frame[*target] = value;
                } else if frame[*target] != value {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::ResetLocal { target } => {
                frame[*target] = Value::Undefined;
            }
            StatementKind::IsDefined { source } => {
                if frame[*source].is_undefined() {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::IsUndefined { source } => {
                if !frame[*source].is_undefined() {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::ReturnLocal { source } => {
                return Ok(Flow::Return(frame[*source].clone()));
            }
            StatementKind::ResultSetAdd { value } => {
                let v = frame[*value].clone();
                if v.is_undefined() {
                    return Ok(Flow::Fail);
                }
                self.results.push(v);
            }
            StatementKind::Len { source, target } => {
                let value = self.operand(frame, source)?;
                match value.len() {
                    Some(n) => frame[*target] = Value::from(n as u64),
                    None => return Ok(Flow::Fail),
                }
            }
            StatementKind::IsObject { source } => {
                if !matches!(self.operand(frame, source)?, Value::Object(_)) {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::IsArray { source } => {
                if !matches!(self.operand(frame, source)?, Value::Array(_)) {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::IsSet { source } => {
                if !matches!(self.operand(frame, source)?, Value::Set(_)) {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::Equal { a, b } => {
                let a = self.operand(frame, a)?;
                let b = self.operand(frame, b)?;
                if a.is_undefined() || b.is_undefined() || a != b {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::NotEqual { a, b } => {
                let a = self.operand(frame, a)?;
                let b = self.operand(frame, b)?;
                if a.is_undefined() || b.is_undefined() || a == b {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::ObjectInsert { key, value, object } => {
                let key = self.operand(frame, key)?;
                let value = self.operand(frame, value)?;
                if key.is_undefined() || value.is_undefined() {
                    return Ok(Flow::Fail);
                }
                frame[*object].as_object_mut()?.insert(key, value);
            }
            StatementKind::ObjectInsertOnce { key, value, object } => {
                let key = self.operand(frame, key)?;
                let value = self.operand(frame, value)?;
                if key.is_undefined() || value.is_undefined() {
                    return Ok(Flow::Fail);
                }
                let map = frame[*object].as_object_mut()?;
                if let Some(existing) = map.get(&key) {
                    if existing != &value {
                        bail!("eval_conflict_error: object keys must be unique");
                    }
                } else {
                    map.insert(key, value);
                }
            }
            StatementKind::ObjectMerge { a, b, target } => {
                let merged = merge_values(&frame[*a], &frame[*b]);
                frame[*target] = merged;
            }
            StatementKind::ArrayAppend { value, array } => {
                let value = self.operand(frame, value)?;
                if value.is_undefined() {
                    return Ok(Flow::Fail);
                }
                frame[*array].as_array_mut()?.push(value);
            }
            StatementKind::SetAdd { value, set } => {
                let value = self.operand(frame, value)?;
                if value.is_undefined() {
                    return Ok(Flow::Fail);
                }
                frame[*set].as_set_mut()?.insert(value);
            }
            StatementKind::Dot { source, key, target } => {
                let source = self.operand(frame, source)?;
                let key = self.operand(frame, key)?;
                if source.is_undefined() || key.is_undefined() {
                    return Ok(Flow::Fail);
                }
                let value = source[&key].clone();
                if value.is_undefined() {
                    return Ok(Flow::Fail);
                }
                frame[*target] = value;
            }
            StatementKind::Call { func, args, result } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.operand(frame, arg)?);
                }
                match self.call(func, values)? {
                    Value::Undefined => return Ok(Flow::Fail),
                    value => frame[*result] = value,
                }
            }
            StatementKind::CallDynamic { path, args, result } => {
                let mut name = String::from("g0");
                for op in path {
                    let segment = self.operand(frame, op)?;
                    match segment {
                        Value::String(s) => {
                            name.push('.');
                            name.push_str(&s);
                        }
                        _ => return Ok(Flow::Fail),
                    }
                }
                let Some(index) = self.bundle.find_function(&name) else {
                    return Ok(Flow::Fail);
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.operand(frame, arg)?);
                }
                match self.call_function(index, values)? {
                    Value::Undefined => return Ok(Flow::Fail),
                    value => frame[*result] = value,
                }
            }
            StatementKind::Block { blocks } => {
                // Alternatives: the first block to succeed wins; failure of
                // every alternative does not fail the enclosing block.
                for block in blocks {
                    match self.run_block(frame, block)? {
                        Flow::Ok => break,
                        Flow::Fail => (),
                        Flow::Break(n) => return Ok(Flow::Break(n)),
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                    }
                }
            }
            StatementKind::Not { block } => {
                // The nested block runs on a frame snapshot; bindings it
                // makes do not escape.
                let mut snapshot = frame.clone();
                match self.run_block(&mut snapshot, block)? {
                    Flow::Fail => (),
                    Flow::Ok => return Ok(Flow::Fail),
                    Flow::Break(n) => return Ok(Flow::Break(n)),
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                }
            }
            StatementKind::Scan {
                source,
                key,
                value,
                block,
            } => {
                let collection = frame[*source].clone();
                let entries: Vec<(Value, Value)> = match &collection {
                    Value::Array(items) => items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (Value::from(i as u64), v.clone()))
                        .collect(),
                    Value::Object(map) => {
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    Value::Set(items) => {
                        items.iter().map(|v| (v.clone(), v.clone())).collect()
                    }
                    _ => return Ok(Flow::Fail),
                };

                let mut succeeded = false;
                for (k, v) in entries {
                    frame[*key] = k;
                    frame[*value] = v;
                    match self.run_block(frame, block)? {
                        Flow::Ok => succeeded = true,
                        Flow::Fail => (),
                        Flow::Break(n) => return Ok(Flow::Break(n)),
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                    }
                }
                if !succeeded {
                    return Ok(Flow::Fail);
                }
            }
            StatementKind::With {
                local,
                path,
                value,
                block,
            } => {
                let value = self.operand(frame, value)?;
                let saved = frame[*local].clone();
                let mut segments = Vec::with_capacity(path.len());
                for index in path {
                    segments.push(self.string(*index)?.to_string());
                }
                frame[*local] = overlay(&saved, &segments, value);
                self.overlay_depth += 1;
                let flow = self.run_block(frame, block);
                self.overlay_depth -= 1;
                frame[*local] = saved;
                match flow? {
                    Flow::Ok => (),
                    other => return Ok(other),
                }
            }
            StatementKind::Break { index } => return Ok(Flow::Break(*index)),
            StatementKind::Nop => (),
        }

        Ok(Flow::Ok)
    }

    /// Dispatch a call: built-ins receive the user-visible arguments, rule
    /// functions receive `(input, data, …)` and may be memoized.
    fn call(&mut self, func: &str, args: Vec<Value>) -> Result<Value> {
        if let Some(index) = self.bundle.find_function(func) {
            return self.call_function(index, args);
        }

        if self.registry.is_builtin(func) {
            if args.iter().any(Value::is_undefined) {
                return Ok(Value::Undefined);
            }
            return match self.registry.call(func, &args) {
                Ok(value) => Ok(value),
                Err(e) => {
                    if self.registry.strict_errors() {
                        Err(e)
                    } else {
                        Ok(Value::Undefined)
                    }
                }
            };
        }

        bail!("runtime_error: unknown function {func}");
    }

    fn call_function(&mut self, index: usize, args: Vec<Value>) -> Result<Value> {
        let bundle = self.bundle;
        let function = &bundle.functions[index];
        if args.len() != function.parameters.len() {
            bail!(
                "eval_type_error: {} expects {} argument(s), got {}",
                function.name,
                function.parameters.len(),
                args.len()
            );
        }

        // Memoization is sound only while no overlay is active.
        let cacheable = function.cacheable && self.overlay_depth == 0;
        if cacheable {
            if let Some(value) = self.memo.get(&index) {
                return Ok(value.clone());
            }
        }

        if self.call_depth >= MAX_CALL_DEPTH {
            bail!("runtime_error: call depth limit exceeded");
        }
        self.call_depth += 1;

        let mut frame = vec![Value::Undefined; self.bundle.local_count.max(2)];
        for (param, arg) in function.parameters.iter().zip(args) {
            frame[*param] = arg;
        }

        let mut result = Value::Undefined;
        for block in &function.blocks {
            match self.run_block(&mut frame, block) {
                Ok(Flow::Return(value)) => {
                    result = value;
                    break;
                }
                Ok(_) => (),
                Err(e) => {
                    self.call_depth -= 1;
                    return Err(e);
                }
            }
        }
        self.call_depth -= 1;

        if cacheable {
            self.memo.insert(index, result.clone());
        }
        Ok(result)
    }
}

/// Deep merge: objects merge recursively, sets union, equal values keep,
/// anything else conflicts and yields undefined.
fn merge_values(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut out = ma.as_ref().clone();
            for (k, v) in mb.iter() {
                let merged = match out.get(k) {
                    Some(existing) => merge_values(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::from(out)
        }
        (Value::Set(sa), Value::Set(sb)) => {
            Value::from(sa.union(sb).cloned().collect::<std::collections::BTreeSet<_>>())
        }
        _ if a == b => a.clone(),
        (Value::Undefined, _) => b.clone(),
        (_, Value::Undefined) => a.clone(),
        _ => Value::Undefined,
    }
}

/// A copy of `base` with `value` substituted at `path`, building objects
/// along the way. The base document itself is never mutated.
fn overlay(base: &Value, path: &[String], value: Value) -> Value {
    if path.is_empty() {
        return value;
    }
    let mut map = match base {
        Value::Object(m) => m.as_ref().clone(),
        _ => BTreeMap::new(),
    };
    let key = Value::from(path[0].as_str());
    let child = map.get(&key).cloned().unwrap_or(Value::Undefined);
    map.insert(key, overlay(&child, &path[1..], value));
    Value::from(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Function, Plan};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_standard_builtins().unwrap();
        registry
    }

    /// A bundle with one function returning its sole computed value and one
    /// plan wrapping it as {"result": ...}.
    fn bundle_with(blocks: Vec<Block>, local_count: usize) -> Bundle {
        let mut bundle = Bundle {
            strings: vec!["result".to_string()],
            local_count: local_count.max(8),
            data: Value::new_object(),
            ..Bundle::default()
        };
        bundle.functions.push(Function {
            name: "g0.data.t.r".to_string(),
            path: vec!["g0".into(), "data".into(), "t".into(), "r".into()],
            parameters: vec![0, 1],
            result: 2,
            arity: 2,
            cacheable: true,
            blocks,
        });
        bundle.name_to_func.insert("g0.data.t.r".to_string(), 0);
        bundle.plans.push(Plan {
            name: "t/r".to_string(),
            blocks: vec![vec![
                Statement::new(StatementKind::Call {
                    func: "g0.data.t.r".to_string(),
                    args: vec![Operand::Local(0), Operand::Local(1)],
                    result: 2,
                }),
                Statement::new(StatementKind::IsDefined { source: 2 }),
                Statement::new(StatementKind::MakeObject { target: 3 }),
                Statement::new(StatementKind::ObjectInsert {
                    key: Operand::String(0),
                    value: Operand::Local(2),
                    object: 3,
                }),
                Statement::new(StatementKind::ResultSetAdd { value: 3 }),
            ]],
        });
        bundle.name_to_plan.insert("t/r".to_string(), 0);
        bundle
    }

    #[test]
    fn evaluates_simple_function_plan() {
        let bundle = bundle_with(
            vec![
                vec![Statement::new(StatementKind::AssignVarOnce {
                    source: Operand::Bool(true),
                    target: 2,
                })],
                vec![Statement::new(StatementKind::ReturnLocal { source: 2 })],
            ],
            8,
        );
        let registry = registry();
        let mut machine = Machine::new(&bundle, &registry, Value::new_object());
        let results = machine.eval_plan(0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["result"], Value::Bool(true));
    }

    #[test]
    fn failed_blocks_leave_no_results() {
        let bundle = bundle_with(
            vec![
                vec![
                    // 1 == 2 fails the definition block.
                    Statement::new(StatementKind::MakeNumberInt { value: 1, target: 3 }),
                    Statement::new(StatementKind::MakeNumberInt { value: 2, target: 4 }),
                    Statement::new(StatementKind::Equal {
                        a: Operand::Local(3),
                        b: Operand::Local(4),
                    }),
                    Statement::new(StatementKind::AssignVarOnce {
                        source: Operand::Bool(true),
                        target: 2,
                    }),
                ],
                vec![Statement::new(StatementKind::ReturnLocal { source: 2 })],
            ],
            8,
        );
        let registry = registry();
        let mut machine = Machine::new(&bundle, &registry, Value::new_object());
        assert!(machine.eval_plan(0).unwrap().is_empty());
    }

    #[test]
    fn scan_accumulates_into_sets() {
        // r := { v | v := [1,2,3][_]; v > 1 } style accumulation.
        let blocks = vec![
            vec![Statement::new(StatementKind::MakeSet { target: 2 })],
            vec![
                Statement::new(StatementKind::MakeArray {
                    capacity: 3,
                    target: 3,
                }),
                Statement::new(StatementKind::MakeNumberInt { value: 1, target: 4 }),
                Statement::new(StatementKind::ArrayAppend {
                    value: Operand::Local(4),
                    array: 3,
                }),
                Statement::new(StatementKind::MakeNumberInt { value: 2, target: 4 }),
                Statement::new(StatementKind::ArrayAppend {
                    value: Operand::Local(4),
                    array: 3,
                }),
                Statement::new(StatementKind::MakeNumberInt { value: 3, target: 4 }),
                Statement::new(StatementKind::ArrayAppend {
                    value: Operand::Local(4),
                    array: 3,
                }),
                Statement::new(StatementKind::Scan {
                    source: 3,
                    key: 5,
                    value: 6,
                    block: vec![
                        Statement::new(StatementKind::MakeNumberInt { value: 1, target: 7 }),
                        Statement::new(StatementKind::Call {
                            func: "gt".to_string(),
                            args: vec![Operand::Local(6), Operand::Local(7)],
                            result: 8,
                        }),
                        Statement::new(StatementKind::Equal {
                            a: Operand::Local(8),
                            b: Operand::Bool(true),
                        }),
                        Statement::new(StatementKind::SetAdd {
                            value: Operand::Local(6),
                            set: 2,
                        }),
                    ],
                }),
            ],
            vec![Statement::new(StatementKind::ReturnLocal { source: 2 })],
        ];
        let bundle = bundle_with(blocks, 10);
        let registry = registry();
        let mut machine = Machine::new(&bundle, &registry, Value::new_object());
        let results = machine.eval_plan(0).unwrap();
        assert_eq!(
            serde_json::to_string(&results[0]["result"]).unwrap(),
            "[2,3]"
        );
    }

    #[test]
    fn with_overlay_restores_on_exit() {
        // Inside the overlay input.x is 42; outside it is 1.
        let bundle = bundle_with(
            vec![
                vec![
                    Statement::new(StatementKind::MakeNumberInt {
                        value: 42,
                        target: 3,
                    }),
                    Statement::new(StatementKind::With {
                        local: 0,
                        path: vec![1],
                        value: Operand::Local(3),
                        block: vec![
                            Statement::new(StatementKind::Dot {
                                source: Operand::Local(0),
                                key: Operand::String(1),
                                target: 4,
                            }),
                            Statement::new(StatementKind::AssignVarOnce {
                                source: Operand::Local(4),
                                target: 2,
                            }),
                        ],
                    }),
                    Statement::new(StatementKind::Dot {
                        source: Operand::Local(0),
                        key: Operand::String(1),
                        target: 5,
                    }),
                ],
                vec![Statement::new(StatementKind::ReturnLocal { source: 2 })],
            ],
            8,
        );
        let mut bundle = bundle;
        bundle.strings.push("x".to_string());
        let registry = registry();
        let input = Value::from_json_str(r#"{"x": 1}"#).unwrap();
        let mut machine = Machine::new(&bundle, &registry, input);
        let results = machine.eval_plan(0).unwrap();
        assert_eq!(results[0]["result"], Value::from(42u64));
    }

    #[test]
    fn not_runs_on_a_snapshot() {
        let bundle = bundle_with(
            vec![
                vec![
                    Statement::new(StatementKind::Not {
                        block: vec![
                            // Binds local 4, then fails; the binding must
                            // not leak.
                            Statement::new(StatementKind::MakeNumberInt {
                                value: 9,
                                target: 4,
                            }),
                            Statement::new(StatementKind::Equal {
                                a: Operand::Bool(true),
                                b: Operand::Bool(false),
                            }),
                        ],
                    }),
                    Statement::new(StatementKind::IsUndefined { source: 4 }),
                    Statement::new(StatementKind::AssignVarOnce {
                        source: Operand::Bool(true),
                        target: 2,
                    }),
                ],
                vec![Statement::new(StatementKind::ReturnLocal { source: 2 })],
            ],
            8,
        );
        let registry = registry();
        let mut machine = Machine::new(&bundle, &registry, Value::new_object());
        let results = machine.eval_plan(0).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn conflict_on_object_insert_once_is_fatal() {
        let bundle = bundle_with(
            vec![
                vec![
                    Statement::new(StatementKind::MakeObject { target: 2 }),
                    Statement::new(StatementKind::MakeNumberInt { value: 1, target: 3 }),
                    Statement::new(StatementKind::MakeNumberInt { value: 2, target: 4 }),
                    Statement::new(StatementKind::ObjectInsertOnce {
                        key: Operand::String(0),
                        value: Operand::Local(3),
                        object: 2,
                    }),
                    Statement::new(StatementKind::ObjectInsertOnce {
                        key: Operand::String(0),
                        value: Operand::Local(4),
                        object: 2,
                    }),
                ],
                vec![Statement::new(StatementKind::ReturnLocal { source: 2 })],
            ],
            8,
        );
        let registry = registry();
        let mut machine = Machine::new(&bundle, &registry, Value::new_object());
        let err = machine.eval_plan(0).unwrap_err().to_string();
        assert!(err.contains("eval_conflict_error"));
    }

    #[test]
    fn merge_semantics() {
        let a = Value::from_json_str(r#"{"x": {"y": 1}}"#).unwrap();
        let b = Value::from_json_str(r#"{"x": {"z": 2}, "w": 3}"#).unwrap();
        let merged = merge_values(&a, &b);
        assert_eq!(
            serde_json::to_string(&merged).unwrap(),
            r#"{"w":3,"x":{"y":1,"z":2}}"#
        );
        // Conflicting scalars yield undefined.
        let c = Value::from_json_str(r#"{"x": 1}"#).unwrap();
        let d = Value::from_json_str(r#"{"x": 2}"#).unwrap();
        assert!(merge_values(&c, &d)["x"].is_undefined());
    }
}
