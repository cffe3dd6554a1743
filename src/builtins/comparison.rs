// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{Arg, BuiltinType, Decl, Registry};
use crate::value::Value;
use anyhow::Result;

fn decl() -> Decl {
    Decl::function(
        vec![
            Arg::new("x", BuiltinType::Any),
            Arg::new("y", BuiltinType::Any),
        ],
        Arg::new("z", BuiltinType::Boolean),
    )
}

fn equal(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0] == args[1]))
}

fn neq(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0] != args[1]))
}

fn lt(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0] < args[1]))
}

fn lte(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0] <= args[1]))
}

fn gt(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0] > args[1]))
}

fn gte(args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(args[0] >= args[1]))
}

pub fn register(registry: &mut Registry) -> Result<()> {
    registry.register_builtin("equal", decl(), equal)?;
    registry.register_builtin("neq", decl(), neq)?;
    registry.register_builtin("lt", decl(), lt)?;
    registry.register_builtin("lte", decl(), lte)?;
    registry.register_builtin("gt", decl(), gt)?;
    registry.register_builtin("gte", decl(), gte)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_numbers_across_representations() {
        assert_eq!(
            equal(&[Value::from(2u64), Value::from(2.0)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            lt(&[Value::from(1u64), Value::from(1.5)]).unwrap(),
            Value::Bool(true)
        );
    }
}
