// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{Arg, BuiltinType, Decl, Registry};
use crate::number::Number;
use crate::value::Value;
use anyhow::{bail, Result};

fn any_to_number() -> Decl {
    Decl::function(
        vec![Arg::new("collection", BuiltinType::Any)],
        Arg::new("n", BuiltinType::Number),
    )
}

fn count(args: &[Value]) -> Result<Value> {
    match args[0].len() {
        Some(n) => Ok(Value::from(n as u64)),
        None => bail!("eval_type_error: count: operand 1 must be one of {{array, object, set, string}}"),
    }
}

fn numbers(value: &Value, op: &str) -> Result<Vec<Number>> {
    let items: Vec<&Value> = match value {
        Value::Array(a) => a.iter().collect(),
        Value::Set(s) => s.iter().collect(),
        _ => bail!("eval_type_error: {op}: operand 1 must be one of {{array, set}}"),
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::Number(n) => Ok(n.clone()),
            _ => bail!("eval_type_error: {op}: operand must be number"),
        })
        .collect()
}

fn sum(args: &[Value]) -> Result<Value> {
    let mut acc = Number::from(0u64);
    for n in numbers(&args[0], "sum")? {
        acc = acc.add(&n)?;
    }
    Ok(Value::Number(acc))
}

fn product(args: &[Value]) -> Result<Value> {
    let mut acc = Number::from(1u64);
    for n in numbers(&args[0], "product")? {
        acc = acc.mul(&n)?;
    }
    Ok(Value::Number(acc))
}

fn extreme(args: &[Value], op: &str, want_max: bool) -> Result<Value> {
    let items: Vec<&Value> = match &args[0] {
        Value::Array(a) => a.iter().collect(),
        Value::Set(s) => s.iter().collect(),
        _ => bail!("eval_type_error: {op}: operand 1 must be one of {{array, set}}"),
    };
    if items.is_empty() {
        return Ok(Value::Undefined);
    }
    let mut result = items[0];
    for item in &items[1..] {
        let better = if want_max { *item > result } else { *item < result };
        if better {
            result = *item;
        }
    }
    Ok(result.clone())
}

fn max(args: &[Value]) -> Result<Value> {
    extreme(args, "max", true)
}

fn min(args: &[Value]) -> Result<Value> {
    extreme(args, "min", false)
}

pub fn register(registry: &mut Registry) -> Result<()> {
    registry.register_builtin("count", any_to_number(), count)?;
    registry.register_builtin("sum", any_to_number(), sum)?;
    registry.register_builtin("product", any_to_number(), product)?;
    registry.register_builtin(
        "max",
        Decl::function(
            vec![Arg::new("collection", BuiltinType::Any)],
            Arg::new("value", BuiltinType::Any),
        ),
        max,
    )?;
    registry.register_builtin(
        "min",
        Decl::function(
            vec![Arg::new("collection", BuiltinType::Any)],
            Arg::new("value", BuiltinType::Any),
        ),
        min,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates() {
        let arr = Value::from_json_str("[1, 2, 3]").unwrap();
        assert_eq!(count(&[arr.clone()]).unwrap(), Value::from(3u64));
        assert_eq!(sum(&[arr.clone()]).unwrap(), Value::from(6u64));
        assert_eq!(product(&[arr.clone()]).unwrap(), Value::from(6u64));
        assert_eq!(max(&[arr.clone()]).unwrap(), Value::from(3u64));
        assert_eq!(min(&[arr]).unwrap(), Value::from(1u64));
        assert_eq!(
            count(&[Value::from("abc")]).unwrap(),
            Value::from(3u64)
        );
        assert!(sum(&[Value::from(1u64)]).is_err());
    }

    #[test]
    fn extremes_of_empty_are_undefined() {
        let empty = Value::new_array();
        assert!(max(&[empty.clone()]).unwrap().is_undefined());
        assert!(min(&[empty]).unwrap().is_undefined());
    }
}
