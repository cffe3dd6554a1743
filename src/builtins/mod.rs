// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The built-in function registry.
//!
//! Maps a dotted built-in name to its typed declaration and behavior. The
//! declaration schema is what the bundle serializers persist; the behavior
//! runs during evaluation. The registry freezes at the first plan execution
//! so evaluation never races registration.

mod aggregates;
mod arithmetic;
mod collections;
mod comparison;
mod conversions;

use std::collections::BTreeMap;

use crate::value::Value;
use anyhow::{bail, Result};
use lazy_static::lazy_static;

lazy_static! {
    static ref STANDARD: Registry = {
        let mut registry = Registry::new();
        // Registration over a fresh registry cannot fail.
        let _ = registry.register_standard_builtins();
        registry
    };
}

/// Indicates that a built-in can receive any number of arguments.
pub const ANY_ARITY: usize = usize::MAX;

/// The type language of built-in signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinType {
    Any,
    Number,
    String,
    Boolean,
    Null,
    DynamicArray(Box<BuiltinType>),
    StaticArray(Vec<BuiltinType>),
    DynamicObject(Box<BuiltinType>, Box<BuiltinType>),
    StaticObject(Vec<(BuiltinType, BuiltinType)>),
    HybridObject {
        key: Box<BuiltinType>,
        value: Box<BuiltinType>,
        entries: Vec<(BuiltinType, BuiltinType)>,
    },
    Set(Box<BuiltinType>),
    TypeSeq(Vec<BuiltinType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: String,
    pub description: String,
    pub ty: BuiltinType,
}

impl Arg {
    pub fn new(name: &str, ty: BuiltinType) -> Self {
        Self {
            name: name.to_string(),
            description: String::default(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclArgs {
    VarArgs,
    Args(Vec<Arg>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclResult {
    Void,
    Result(Arg),
}

/// The serialized signature of a built-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decl {
    pub args: DeclArgs,
    pub result: DeclResult,
}

impl Decl {
    pub fn function(args: Vec<Arg>, result: Arg) -> Self {
        Self {
            args: DeclArgs::Args(args),
            result: DeclResult::Result(result),
        }
    }

    pub fn varargs(result: Arg) -> Self {
        Self {
            args: DeclArgs::VarArgs,
            result: DeclResult::Result(result),
        }
    }

    pub fn arity(&self) -> usize {
        match &self.args {
            DeclArgs::VarArgs => ANY_ARITY,
            DeclArgs::Args(args) => args.len(),
        }
    }
}

/// The implementation of a built-in: user-visible arguments in, value out.
pub type Behavior = fn(&[Value]) -> Result<Value>;

#[derive(Clone)]
pub struct BuiltIn {
    pub decl: Decl,
    pub behavior: Behavior,
}

impl core::fmt::Debug for BuiltIn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BuiltIn").field("decl", &self.decl).finish()
    }
}

/// Checks the actual argument count against a declaration.
///
/// Returns an `eval_type_error`-style failure on mismatch; variadic
/// built-ins accept anything.
pub fn check_arity(name: &str, decl: &Decl, args: &[Value]) -> Result<()> {
    let arity = decl.arity();
    if arity != ANY_ARITY && args.len() != arity {
        bail!(
            "eval_type_error: {name}: expected {arity} argument(s), got {}",
            args.len()
        );
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    builtins: BTreeMap<String, BuiltIn>,
    strict_errors: bool,
    standard_registered: bool,
    frozen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the standard library registry, ready for further
    /// registrations.
    pub fn standard() -> Self {
        STANDARD.clone()
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&BuiltIn> {
        self.builtins.get(name)
    }

    pub fn strict_errors(&self) -> bool {
        self.strict_errors
    }

    pub fn set_strict_errors(&mut self, strict: bool) {
        self.strict_errors = strict;
    }

    /// No registrations are accepted after the first plan runs.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn register_builtin(&mut self, name: &str, decl: Decl, behavior: Behavior) -> Result<()> {
        if self.frozen {
            bail!("cannot register built-in {name}: registry is frozen");
        }
        self.builtins
            .insert(name.to_string(), BuiltIn { decl, behavior });
        Ok(())
    }

    /// Registers the standard library. Idempotent.
    pub fn register_standard_builtins(&mut self) -> Result<()> {
        if self.standard_registered {
            return Ok(());
        }
        if self.frozen {
            bail!("cannot register built-ins: registry is frozen");
        }
        arithmetic::register(self)?;
        comparison::register(self)?;
        aggregates::register(self)?;
        collections::register(self)?;
        conversions::register(self)?;
        self.standard_registered = true;
        Ok(())
    }

    /// Invoke a built-in with already-evaluated arguments.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let builtin = match self.builtins.get(name) {
            Some(b) => b,
            None => bail!("unknown built-in {name}"),
        };
        check_arity(name, &builtin.decl, args)?;
        (builtin.behavior)(args)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BuiltIn)> {
        self.builtins.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registration_is_idempotent() {
        let mut registry = Registry::new();
        registry.register_standard_builtins().unwrap();
        let count = registry.iter().count();
        registry.register_standard_builtins().unwrap();
        assert_eq!(registry.iter().count(), count);
        assert!(registry.is_builtin("plus"));
        assert!(registry.is_builtin("count"));
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut registry = Registry::new();
        registry.freeze();
        assert!(registry.register_standard_builtins().is_err());
    }

    #[test]
    fn arity_is_checked() {
        let mut registry = Registry::new();
        registry.register_standard_builtins().unwrap();
        let err = registry
            .call("plus", &[Value::from(1u64)])
            .unwrap_err()
            .to_string();
        assert!(err.contains("eval_type_error"));
    }

    #[test]
    fn calls_dispatch() {
        let mut registry = Registry::new();
        registry.register_standard_builtins().unwrap();
        let result = registry
            .call("plus", &[Value::from(1u64), Value::from(2u64)])
            .unwrap();
        assert_eq!(result, Value::from(3u64));
    }
}
