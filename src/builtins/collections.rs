// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;

use super::{Arg, BuiltinType, Decl, Registry};
use crate::value::Value;
use anyhow::{bail, Result};

fn set_arg<'a>(value: &'a Value, op: &str, index: usize) -> Result<&'a BTreeSet<Value>> {
    match value {
        Value::Set(s) => Ok(s),
        _ => bail!("eval_type_error: {op}: operand {index} must be set"),
    }
}

/// Set intersection; the IR spells `x & y` as a call to `and`.
fn and(args: &[Value]) -> Result<Value> {
    let a = set_arg(&args[0], "and", 1)?;
    let b = set_arg(&args[1], "and", 2)?;
    Ok(Value::from(
        a.intersection(b).cloned().collect::<BTreeSet<_>>(),
    ))
}

/// Set union; the IR spells `x | y` as a call to `or`.
fn or(args: &[Value]) -> Result<Value> {
    let a = set_arg(&args[0], "or", 1)?;
    let b = set_arg(&args[1], "or", 2)?;
    Ok(Value::from(a.union(b).cloned().collect::<BTreeSet<_>>()))
}

/// `x in c` membership for arrays (values), sets (members) and objects
/// (values).
fn member_2(args: &[Value]) -> Result<Value> {
    let found = match &args[1] {
        Value::Array(a) => a.contains(&args[0]),
        Value::Set(s) => s.contains(&args[0]),
        Value::Object(o) => o.values().any(|v| v == &args[0]),
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn array_concat(args: &[Value]) -> Result<Value> {
    let a = match &args[0] {
        Value::Array(a) => a,
        _ => bail!("eval_type_error: array.concat: operand 1 must be array"),
    };
    let b = match &args[1] {
        Value::Array(b) => b,
        _ => bail!("eval_type_error: array.concat: operand 2 must be array"),
    };
    let mut out = a.as_ref().clone();
    out.extend(b.iter().cloned());
    Ok(Value::from(out))
}

/// All nested `[path, value]` pairs of a document, in depth-first order.
fn walk(args: &[Value]) -> Result<Value> {
    let mut pairs: Vec<Value> = vec![];
    let mut stack: Vec<(Vec<Value>, Value)> = vec![(vec![], args[0].clone())];
    while let Some((path, value)) = stack.pop() {
        pairs.push(Value::from(vec![
            Value::from(path.clone()),
            value.clone(),
        ]));
        match &value {
            Value::Array(a) => {
                for (i, v) in a.iter().enumerate().rev() {
                    let mut p = path.clone();
                    p.push(Value::from(i as u64));
                    stack.push((p, v.clone()));
                }
            }
            Value::Object(o) => {
                for (k, v) in o.iter().rev() {
                    let mut p = path.clone();
                    p.push(k.clone());
                    stack.push((p, v.clone()));
                }
            }
            Value::Set(s) => {
                for v in s.iter().rev() {
                    let mut p = path.clone();
                    p.push(v.clone());
                    stack.push((p, v.clone()));
                }
            }
            _ => (),
        }
    }
    Ok(Value::from(pairs))
}

/// The `print` sink. Output routing belongs to the host; evaluation treats
/// it as an always-true statement.
fn print(_args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(true))
}

pub fn register(registry: &mut Registry) -> Result<()> {
    let set_set = || {
        Decl::function(
            vec![
                Arg::new("x", BuiltinType::Set(Box::new(BuiltinType::Any))),
                Arg::new("y", BuiltinType::Set(Box::new(BuiltinType::Any))),
            ],
            Arg::new("z", BuiltinType::Set(Box::new(BuiltinType::Any))),
        )
    };
    registry.register_builtin("and", set_set(), and)?;
    registry.register_builtin("or", set_set(), or)?;
    registry.register_builtin(
        "internal.member_2",
        Decl::function(
            vec![
                Arg::new("x", BuiltinType::Any),
                Arg::new("collection", BuiltinType::Any),
            ],
            Arg::new("found", BuiltinType::Boolean),
        ),
        member_2,
    )?;
    registry.register_builtin(
        "array.concat",
        Decl::function(
            vec![
                Arg::new(
                    "x",
                    BuiltinType::DynamicArray(Box::new(BuiltinType::Any)),
                ),
                Arg::new(
                    "y",
                    BuiltinType::DynamicArray(Box::new(BuiltinType::Any)),
                ),
            ],
            Arg::new("z", BuiltinType::DynamicArray(Box::new(BuiltinType::Any))),
        ),
        array_concat,
    )?;
    registry.register_builtin(
        "walk",
        Decl::function(
            vec![Arg::new("x", BuiltinType::Any)],
            Arg::new(
                "output",
                BuiltinType::DynamicArray(Box::new(BuiltinType::StaticArray(vec![
                    BuiltinType::DynamicArray(Box::new(BuiltinType::Any)),
                    BuiltinType::Any,
                ]))),
            ),
        ),
        walk,
    )?;
    registry.register_builtin(
        "print",
        Decl::varargs(Arg::new("ok", BuiltinType::Boolean)),
        print,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let arr = Value::from_json_str("[1, 2, 3]").unwrap();
        assert_eq!(
            member_2(&[Value::from(2u64), arr.clone()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            member_2(&[Value::from(9u64), arr]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn walk_visits_all_nodes() {
        let doc = Value::from_json_str(r#"{"a": [1]}"#).unwrap();
        let pairs = walk(&[doc]).unwrap();
        let pairs = pairs.as_array().unwrap();
        // root, .a, .a[0]
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0][0], Value::new_array());
    }
}
