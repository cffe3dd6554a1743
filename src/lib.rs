// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A compiler and evaluator for the Rego policy language.
//!
//! Policy modules and a JSON base document compile through a staged
//! term-rewriting pipeline into an IR [`Bundle`] — static tables, plans and
//! functions — which a frame-based stack machine evaluates against a JSON
//! input to produce a result set. Bundles serialize to a human-readable
//! JSON form and to the compact `REGOBUND` binary form with CRC-protected
//! sections.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let mut rego = regobund::Interpreter::new();
//! rego.add_module("policy.rego", "package p\n\nallow := input.role == \"admin\"")?;
//! rego.set_input_json(r#"{"role": "admin"}"#)?;
//! let results = rego.query("data.p.allow")?;
//! # Ok(())
//! # }
//! ```

mod ast;
mod builtins;
mod bundle;
mod compiler;
mod depgraph;
mod engine;
mod errors;
mod lexer;
mod number;
mod parser;
mod reader;
mod value;
mod vm;
mod wf;

pub use builtins::{
    check_arity, Arg, Behavior, BuiltinType, Decl, DeclArgs, DeclResult, Registry, ANY_ARITY,
};
pub use bundle::{Block, Bundle, Function, IrLocation, Operand, Plan, Statement, StatementKind};
pub use compiler::{ModuleInput, RegoToBundle};
pub use engine::{Interpreter, Output, QueryResult};
pub use errors::{Diagnostic, ErrorKind, ErrorSeq};
pub use lexer::{Source, Span};
pub use number::Number;
pub use reader::Reader;
pub use value::Value;
pub use vm::Machine;

#[cfg(feature = "arc")]
pub(crate) use std::sync::Arc as Rc;

#[cfg(not(feature = "arc"))]
pub(crate) use std::rc::Rc;

/// Items in `unstable` are likely to change.
#[doc(hidden)]
pub mod unstable {
    pub use crate::ast::*;
    pub use crate::parser::parse;
    pub use crate::wf::Wellformed;
}
