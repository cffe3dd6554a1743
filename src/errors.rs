// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use crate::lexer::Span;
use thiserror::Error;

/// The user-facing error categories.
///
/// Rendered as the snake_case codes that appear in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// An internal pass invariant was broken; either a compiler bug or
    /// malformed input that slipped through earlier passes.
    #[error("wellformed_error")]
    WellFormed,
    #[error("rego_parse_error")]
    RegoParse,
    #[error("rego_compile_error")]
    RegoCompile,
    #[error("rego_type_error")]
    RegoType,
    #[error("eval_type_error")]
    EvalType,
    #[error("eval_builtin_error")]
    EvalBuiltIn,
    #[error("eval_conflict_error")]
    EvalConflict,
    #[error("runtime_error")]
    Runtime,
}

/// A single error with its source location.
///
/// The caret excerpt is rendered eagerly so diagnostics carry no handles
/// into source buffers and travel freely across threads.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    rendered: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Option<Span>) -> Self {
        let message = message.into();
        let rendered = span.map(|span| span.message(&kind.to_string(), &message));
        Self {
            kind,
            message,
            rendered,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rendered {
            Some(text) => write!(f, "{text}"),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Diagnostic {}

/// Errors collected across a pass. One error does not suppress the others
/// raised by the same pass.
#[derive(Debug, Clone, Default)]
pub struct ErrorSeq {
    pub errors: Vec<Diagnostic>,
}

impl ErrorSeq {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.errors.push(diagnostic);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

impl fmt::Display for ErrorSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorSeq {}
