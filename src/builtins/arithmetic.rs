// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{Arg, BuiltinType, Decl, Registry};
use crate::number::Number;
use crate::value::Value;
use anyhow::{bail, Result};

fn number_arg(value: &Value, op: &str, index: usize) -> Result<Number> {
    match value {
        Value::Number(n) => Ok(n.clone()),
        _ => bail!("eval_type_error: {op}: operand {index} must be number"),
    }
}

fn binary_decl() -> Decl {
    Decl::function(
        vec![
            Arg::new("x", BuiltinType::Number),
            Arg::new("y", BuiltinType::Number),
        ],
        Arg::new("z", BuiltinType::Number),
    )
}

fn plus(args: &[Value]) -> Result<Value> {
    let a = number_arg(&args[0], "plus", 1)?;
    let b = number_arg(&args[1], "plus", 2)?;
    Ok(Value::Number(a.add(&b)?))
}

/// `minus` subtracts numbers and also computes set difference.
fn minus(args: &[Value]) -> Result<Value> {
    match (&args[0], &args[1]) {
        (Value::Set(a), Value::Set(b)) => {
            Ok(Value::from(a.difference(b).cloned().collect::<std::collections::BTreeSet<_>>()))
        }
        _ => {
            let a = number_arg(&args[0], "minus", 1)?;
            let b = number_arg(&args[1], "minus", 2)?;
            Ok(Value::Number(a.sub(&b)?))
        }
    }
}

fn mul(args: &[Value]) -> Result<Value> {
    let a = number_arg(&args[0], "mul", 1)?;
    let b = number_arg(&args[1], "mul", 2)?;
    Ok(Value::Number(a.mul(&b)?))
}

fn div(args: &[Value]) -> Result<Value> {
    let a = number_arg(&args[0], "div", 1)?;
    let b = number_arg(&args[1], "div", 2)?;
    match a.divide(&b) {
        Ok(n) => Ok(Value::Number(n)),
        Err(_) => bail!("eval_builtin_error: div: divide by zero"),
    }
}

fn rem(args: &[Value]) -> Result<Value> {
    let a = number_arg(&args[0], "rem", 1)?;
    let b = number_arg(&args[1], "rem", 2)?;
    match a.modulo(&b) {
        Ok(n) => Ok(Value::Number(n)),
        Err(e) => bail!("eval_builtin_error: rem: {e}"),
    }
}

fn abs(args: &[Value]) -> Result<Value> {
    let a = number_arg(&args[0], "abs", 1)?;
    Ok(Value::Number(a.abs()))
}

pub fn register(registry: &mut Registry) -> Result<()> {
    registry.register_builtin("plus", binary_decl(), plus)?;
    registry.register_builtin("minus", binary_decl(), minus)?;
    registry.register_builtin("mul", binary_decl(), mul)?;
    registry.register_builtin("div", binary_decl(), div)?;
    registry.register_builtin("rem", binary_decl(), rem)?;
    registry.register_builtin(
        "abs",
        Decl::function(
            vec![Arg::new("x", BuiltinType::Number)],
            Arg::new("y", BuiltinType::Number),
        ),
        abs,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        assert_eq!(
            plus(&[Value::from(40u64), Value::from(2u64)]).unwrap(),
            Value::from(42u64)
        );
        assert_eq!(
            div(&[Value::from(3u64), Value::from(2u64)]).unwrap(),
            Value::from(1.5)
        );
        assert!(div(&[Value::from(1u64), Value::from(0u64)]).is_err());
        assert!(plus(&[Value::from("x"), Value::from(1u64)]).is_err());
    }

    #[test]
    fn minus_is_also_set_difference() {
        let a = Value::from_json_str("[1, 2, 3]").unwrap();
        let set_a: Value = a
            .as_array()
            .unwrap()
            .iter()
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into();
        let set_b: Value = vec![Value::from(2u64)]
            .into_iter()
            .collect::<std::collections::BTreeSet<_>>()
            .into();
        let diff = minus(&[set_a, set_b]).unwrap();
        assert_eq!(serde_json::to_string(&diff).unwrap(), "[1,3]");
    }
}
