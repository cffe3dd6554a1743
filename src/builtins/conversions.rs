// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::str::FromStr;

use super::{Arg, BuiltinType, Decl, Registry};
use crate::number::Number;
use crate::value::Value;
use anyhow::{bail, Result};

fn to_number(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Null => Ok(Value::from(0u64)),
        Value::Bool(b) => Ok(Value::from(u64::from(*b))),
        Value::Number(n) => Ok(Value::Number(n.clone())),
        Value::String(s) => match Number::from_str(s.trim()) {
            Ok(n) => Ok(Value::Number(n)),
            Err(_) => bail!("eval_builtin_error: to_number: invalid number {s:?}"),
        },
        _ => bail!("eval_type_error: to_number: operand 1 must be one of {{null, boolean, number, string}}"),
    }
}

pub fn register(registry: &mut Registry) -> Result<()> {
    registry.register_builtin(
        "to_number",
        Decl::function(
            vec![Arg::new("x", BuiltinType::Any)],
            Arg::new("n", BuiltinType::Number),
        ),
        to_number,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts() {
        assert_eq!(to_number(&[Value::from("42")]).unwrap(), Value::from(42u64));
        assert_eq!(to_number(&[Value::Bool(true)]).unwrap(), Value::from(1u64));
        assert_eq!(to_number(&[Value::Null]).unwrap(), Value::from(0u64));
        assert!(to_number(&[Value::from("4x")]).is_err());
    }
}
