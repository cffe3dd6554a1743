// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reader pipeline.
//!
//! Lowers the parse tree produced by [`crate::parser`] to the canonical
//! module AST consumed by the compiler. Each pass is a total `Node → Node`
//! rewrite; the driver validates the output of every pass against that
//! pass's well-formedness grammar when checks are enabled, and collects
//! diagnostics without letting one error suppress the rest of the pass.

mod groups;
mod prep;
mod refs;
mod rules;
mod some_every;
mod stmts;
mod terms;

use crate::ast::{FreshNames, Node, Tag};
use crate::errors::{Diagnostic, ErrorKind, ErrorSeq};
use crate::lexer::Source;
use crate::wf::{self, Wellformed};
use anyhow::Result;

/// Shared state threaded through the reader passes.
pub struct ReaderCtx {
    pub errors: ErrorSeq,
    pub fresh: FreshNames,
    /// Module declares `rego.v1` (strict mode).
    pub strict: bool,
    /// Names enabled as keywords in the current module.
    pub keywords: Vec<&'static str>,
}

impl ReaderCtx {
    fn new() -> Self {
        Self {
            errors: ErrorSeq::default(),
            fresh: FreshNames::default(),
            strict: false,
            keywords: vec![],
        }
    }

    pub fn error(&mut self, kind: ErrorKind, message: impl Into<String>, node: &Node) {
        self.errors
            .push(Diagnostic::new(kind, message, node.location()));
    }

    pub fn keyword_enabled(&self, name: &str) -> bool {
        self.keywords.iter().any(|k| *k == name)
    }
}

/// The reader frontend.
pub struct Reader {
    wf_checks: bool,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Self {
            wf_checks: cfg!(debug_assertions),
        }
    }

    pub fn well_formed_checks(mut self, enabled: bool) -> Self {
        self.wf_checks = enabled;
        self
    }

    /// Lower one module file to the canonical module AST.
    ///
    /// Returns the module tree plus whether the module is strict (`rego.v1`),
    /// along with the fresh-name state so later stages keep minting unique
    /// names.
    pub fn read_module(&self, source: &Source, fresh: FreshNames) -> ReadResult {
        let parsed = match crate::parser::parse(source) {
            Ok(node) => node,
            Err(e) => {
                let mut errors = ErrorSeq::default();
                errors.push(Diagnostic::new(ErrorKind::RegoParse, e.to_string(), None));
                return ReadResult {
                    node: None,
                    strict: false,
                    fresh,
                    errors,
                };
            }
        };
        self.run(parsed, false, fresh)
    }

    /// Lower an ad-hoc query string to `Top(Query(UnifyBody))`.
    pub fn read_query(&self, source: &Source, fresh: FreshNames) -> ReadResult {
        let parsed = match crate::parser::parse(source) {
            Ok(node) => node,
            Err(e) => {
                let mut errors = ErrorSeq::default();
                errors.push(Diagnostic::new(ErrorKind::RegoParse, e.to_string(), None));
                return ReadResult {
                    node: None,
                    strict: false,
                    fresh,
                    errors,
                };
            }
        };
        self.run(parsed, true, fresh)
    }

    fn run(&self, parsed: Node, is_query: bool, fresh: FreshNames) -> ReadResult {
        let mut ctx = ReaderCtx::new();
        ctx.fresh = fresh;
        // `in`, `contains`, `every` and `if` are keywords by default; the
        // `rego.v1` import additionally turns on strict checks.
        ctx.keywords = vec!["in", "contains", "every", "if"];

        let passes: Vec<(fn(&mut ReaderCtx, Node) -> Node, Wellformed)> = vec![
            (
                if is_query {
                    prep::prep_query
                } else {
                    prep::prep
                },
                wf::prep(),
            ),
            (prep::keywords, wf::keywords()),
            (some_every::some_every, wf::some_every()),
            (refs::ref_args, wf::ref_args()),
            (refs::refs, wf::refs()),
            (groups::groups, wf::groups()),
            (terms::terms, wf::terms()),
            (terms::unary, wf::precedence()),
            (terms::arith_bin_first, wf::precedence()),
            (terms::arith_bin_second, wf::precedence()),
            (terms::comparison, wf::precedence()),
            (stmts::membership, wf::precedence()),
            (stmts::assign, wf::precedence()),
            (stmts::else_not, wf::precedence()),
            (stmts::collections, wf::collections_pass()),
            (stmts::lines, wf::collections_pass()),
            (rules::rules, wf::rules_pass()),
            (rules::literals, wf::literals_pass()),
            (rules::structure, wf::structure()),
        ];

        let mut node = parsed;
        for (pass, grammar) in passes {
            node = pass(&mut ctx, node);
            if !ctx.errors.is_empty() {
                return ReadResult {
                    node: None,
                    strict: ctx.strict,
                    fresh: ctx.fresh,
                    errors: ctx.errors,
                };
            }
            if self.wf_checks {
                if let Err(diagnostic) = grammar.validate(&node) {
                    tracing::debug!(pass = grammar.name(), "well-formedness violation");
                    ctx.errors.push(diagnostic);
                    return ReadResult {
                        node: None,
                        strict: ctx.strict,
                        fresh: ctx.fresh,
                        errors: ctx.errors,
                    };
                }
            }
        }

        ReadResult {
            node: Some(node),
            strict: ctx.strict,
            fresh: ctx.fresh,
            errors: ctx.errors,
        }
    }
}

pub struct ReadResult {
    pub node: Option<Node>,
    pub strict: bool,
    pub fresh: FreshNames,
    pub errors: ErrorSeq,
}

impl ReadResult {
    pub fn into_node(self) -> Result<(Node, FreshNames, bool)> {
        match self.node {
            Some(node) => Ok((node, self.fresh, self.strict)),
            None => Err(anyhow::Error::new(self.errors)),
        }
    }
}

/// The module (or query) under a `Top`.
pub fn unwrap_top(top: &Node) -> &Node {
    top.front()
}

/// Rebuild a node with children mapped through `f`.
pub(crate) fn map_children(node: &Node, f: impl FnMut(&Node) -> Node) -> Node {
    let children = node.children().iter().map(f).collect();
    crate::ast::NodeDef::with_children(node, children)
}

/// True for the operator tags that can precede an expression operand.
pub(crate) fn is_operator(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::Assign
            | Tag::Unify
            | Tag::Equals
            | Tag::NotEquals
            | Tag::LessThan
            | Tag::GreaterThan
            | Tag::LessThanOrEquals
            | Tag::GreaterThanOrEquals
            | Tag::Add
            | Tag::Subtract
            | Tag::Multiply
            | Tag::Divide
            | Tag::Modulo
            | Tag::And
            | Tag::Or
            | Tag::Colon
            | Tag::IsIn
            | Tag::Not
            | Tag::As
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FreshNames;
    use crate::lexer::Source;

    fn read(contents: &str) -> Node {
        let source = Source::from_contents("test.rego".to_string(), contents.to_string()).unwrap();
        let result = Reader::new().read_module(&source, FreshNames::default());
        match result.node {
            Some(node) => node,
            None => panic!("read failed: {}", result.errors),
        }
    }

    fn read_err(contents: &str) -> ErrorSeq {
        let source = Source::from_contents("test.rego".to_string(), contents.to_string()).unwrap();
        let result = Reader::new().read_module(&source, FreshNames::default());
        assert!(result.node.is_none(), "expected errors");
        result.errors
    }

    #[test]
    fn reads_minimal_module() {
        let top = read("package p\n\nallow := true");
        let module = unwrap_top(&top);
        assert!(module.is(Tag::Module));
        let policy = module.expect(Tag::Policy);
        assert_eq!(policy.len(), 1);
        let rule = policy.front();
        let head = rule.expect(Tag::RuleHead);
        assert!(head.field(Tag::RuleHeadComp).is_some());
    }

    #[test]
    fn reads_function_rule() {
        let top = read("package p\n\nf(x) := x * 2");
        let rule = unwrap_top(&top).expect(Tag::Policy).front();
        let head = rule.expect(Tag::RuleHead);
        let func = head.expect(Tag::RuleHeadFunc);
        assert_eq!(func.expect(Tag::RuleArgs).len(), 1);
    }

    #[test]
    fn reads_partial_set_rule() {
        let top = read("package p\nimport rego.v1\n\ng contains x if { some x in [1, 2, 3] }");
        let rule = unwrap_top(&top).expect(Tag::Policy).front();
        let head = rule.expect(Tag::RuleHead);
        assert!(head.field(Tag::RuleHeadSet).is_some());
        let body = rule.expect(Tag::UnifyBody);
        let literal = body.front();
        assert!(literal.front().is(Tag::SomeExpr));
    }

    #[test]
    fn reads_else_chain() {
        let top = read("package p\n\np := 1 {\n false\n} else := 2 {\n true\n}");
        let rule = unwrap_top(&top).expect(Tag::Policy).front();
        let elseseq = rule.expect(Tag::ElseSeq);
        assert_eq!(elseseq.len(), 1);
    }

    #[test]
    fn reads_with_modifier() {
        let top = read("package p\n\nq := x { x := input.a with input as {\"a\": 1} }");
        let rule = unwrap_top(&top).expect(Tag::Policy).front();
        let body = rule.expect(Tag::UnifyBody);
        let withseq = body.front().expect(Tag::WithSeq);
        assert_eq!(withseq.len(), 1);
    }

    #[test]
    fn strict_mode_requires_if() {
        let errors = read_err("package p\nimport rego.v1\n\nallow { input.x == 1 }");
        assert!(errors
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::RegoParse));
    }

    #[test]
    fn strict_mode_rejects_input_assignment() {
        let errors = read_err("package p\nimport rego.v1\n\np if { input := 1 }");
        assert!(errors
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::RegoCompile));
    }

    #[test]
    fn keyword_imports_are_exclusive() {
        let errors = read_err("package p\nimport rego.v1\nimport future.keywords.in\n\np := 1");
        assert!(!errors.is_empty());
    }

    #[test]
    fn reads_query() {
        let source = Source::from_contents("query".to_string(), "data.p.allow".to_string()).unwrap();
        let result = Reader::new().read_query(&source, FreshNames::default());
        let top = result.node.expect("query read");
        let query = unwrap_top(&top);
        assert!(query.is(Tag::Query));
        assert_eq!(query.expect(Tag::UnifyBody).len(), 1);
    }

    #[test]
    fn reads_every_expression() {
        let top =
            read("package p\nimport rego.v1\n\nok if { every x in input.xs { x > 0 } }");
        let body = unwrap_top(&top).expect(Tag::Policy).front().expect(Tag::UnifyBody);
        let every = body.front().front().front();
        assert!(every.is(Tag::ExprEvery));
        assert_eq!(every.expect(Tag::VarSeq).len(), 1);
    }

    #[test]
    fn reads_comprehensions() {
        let top = read("package p\n\nxs := [x | x := 1]\nys := {x | x := 2}\nzs := {k: 1 | k := \"a\"}");
        let policy = unwrap_top(&top).expect(Tag::Policy);
        let kinds: Vec<Tag> = policy
            .children()
            .iter()
            .map(|rule| {
                rule.expect(Tag::RuleHead)
                    .expect(Tag::RuleHeadComp)
                    .expect(Tag::Expr)
                    .front()
                    .front()
                    .tag()
            })
            .collect();
        assert_eq!(kinds, vec![Tag::ArrayCompr, Tag::SetCompr, Tag::ObjectCompr]);
    }
}
