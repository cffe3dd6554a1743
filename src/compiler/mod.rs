// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Rego→bundle compiler.
//!
//! Runs the remaining passes on top of the reader's canonical module AST:
//! rule-head normalization (*refheads*), rule reshaping (*rules*), implicit
//! scan introduction (*implicit_scans*), module merging (*merge*),
//! unification scheduling (*unify*), statement emission
//! (*expr_to_opblock* / *lift_functions*), `with` expansion (*with_rules*),
//! plan assembly (*add_plans*) and string/local interning
//! (*index_strings_locals*, folded into emission via the shared tables).

mod functions;
mod opblock;
mod plans;
mod rules;
mod scans;
mod unify;
mod with;

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{FreshNames, Node};
use crate::builtins::Registry;
use crate::bundle::Bundle;
use crate::errors::{Diagnostic, ErrorKind, ErrorSeq};
use crate::lexer::Source;
use crate::value::Value;
use indexmap::IndexMap;

/// One module as produced by the reader.
pub struct ModuleInput {
    pub top: Node,
    pub source: Source,
    pub strict: bool,
}

/// The four rule shapes after reshaping, plus the synthesized query rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Complete,
    Function,
    PartialSet,
    PartialObject,
    /// Rule refs ending in a variable bracket; the path is dynamic.
    DynamicObject,
    DynamicSet,
    Query,
}

/// One head+body alternative contributed by a single rule statement.
#[derive(Debug, Clone)]
pub struct RuleBodyDef {
    /// Output value (complete/function/object rules).
    pub value: Option<Node>,
    /// Output key (partial object) or item (partial set).
    pub key: Option<Node>,
    /// Dynamic path segments for dynamic heads.
    pub dynamic_path: Vec<Node>,
    /// The scheduled body, `None` for bodiless rules.
    pub body: Option<Node>,
    /// `else` alternatives: (value, body).
    pub elses: Vec<(Option<Node>, Option<Node>)>,
}

/// Everything known about one rule identifier. All heads sharing the
/// identifier contribute body definitions to the same function.
#[derive(Debug, Clone)]
pub struct RuleDef {
    /// Globally unique identifier, e.g. `data.p.allow`.
    pub ident: String,
    /// Path under the virtual document, e.g. `["data", "p", "allow"]`.
    pub path: Vec<String>,
    pub kind: RuleKind,
    /// Argument terms, for functions. All definitions must agree on arity.
    pub args: Vec<Node>,
    pub defs: Vec<RuleBodyDef>,
    /// The default value expression, if a default clause exists.
    pub default: Option<Node>,
    /// Index into the compilation's file table.
    pub file: usize,
    /// Function-name prefix; `g0` for source rules, `gN` for `with` clones.
    pub prefix: String,
}

/// What the emitter needs to know to resolve a name to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSig {
    /// User-visible arity; zero for non-function rules.
    pub arity: usize,
    pub function: bool,
}

impl RuleDef {
    pub fn is_function(&self) -> bool {
        self.kind == RuleKind::Function
    }
}

/// Shared state for one compilation.
pub struct CompileCtx<'a> {
    pub registry: &'a Registry,
    pub fresh: FreshNames,
    pub errors: ErrorSeq,
    /// Rule identifier → definition, insertion-ordered for determinism.
    pub rules: IndexMap<String, RuleDef>,
    /// Interned strings, in first-use order.
    pub strings: IndexMap<String, usize>,
    pub files: Vec<Source>,
    /// Function-name prefixes minted for `with` clones; `g0` is the base
    /// space.
    pub clone_count: usize,
    /// Rule identifier → signature, frozen before emission.
    pub signatures: BTreeMap<String, FuncSig>,
}

impl<'a> CompileCtx<'a> {
    pub fn error(&mut self, kind: ErrorKind, message: impl Into<String>, node: &Node) {
        self.errors
            .push(Diagnostic::new(kind, message, node.location()));
    }

    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(index) = self.strings.get(s) {
            return *index;
        }
        let index = self.strings.len();
        self.strings.insert(s.to_string(), index);
        index
    }

    /// Rule idents reachable from a package, used for name resolution.
    pub fn package_rule_names(&self, package: &[String]) -> BTreeSet<String> {
        let prefix = package.join(".");
        self.rules
            .keys()
            .filter_map(|ident| {
                let rest = ident.strip_prefix(&prefix)?.strip_prefix('.')?;
                if rest.contains('.') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }
}

/// The full compiler: modules plus an optional query and a base document in,
/// bundle out.
pub struct RegoToBundle<'a> {
    pub registry: &'a Registry,
    pub data: Value,
}

impl<'a> RegoToBundle<'a> {
    pub fn new(registry: &'a Registry, data: Value) -> Self {
        Self { registry, data }
    }

    pub fn compile(
        self,
        modules: Vec<ModuleInput>,
        query: Option<(Node, Source)>,
        fresh: FreshNames,
    ) -> Result<Bundle, ErrorSeq> {
        let mut ctx = CompileCtx {
            registry: self.registry,
            fresh,
            errors: ErrorSeq::default(),
            rules: IndexMap::new(),
            strings: IndexMap::new(),
            files: vec![],
            clone_count: 0,
            signatures: BTreeMap::new(),
        };

        // refheads + rules + merge: absorb every module into the rule map.
        for module in &modules {
            let file = ctx.files.len();
            ctx.files.push(module.source.clone());
            rules::absorb_module(&mut ctx, module, file);
        }

        let query_source = query.as_ref().map(|(_, source)| source.clone());
        if let Some((top, source)) = &query {
            let file = ctx.files.len();
            ctx.files.push(source.clone());
            rules::absorb_query(&mut ctx, top, file);
        }

        rules::check_data_conflicts(&mut ctx, &self.data);

        tracing::debug!(
            rules = ctx.rules.len(),
            files = ctx.files.len(),
            "modules merged into the virtual document"
        );

        if !ctx.errors.is_empty() {
            return Err(ctx.errors);
        }

        // implicit_scans + unify, per rule body.
        let idents: Vec<String> = ctx.rules.keys().cloned().collect();
        for ident in &idents {
            let mut rule = ctx.rules.get(ident).expect("rule").clone();
            scans::implicit_scans(&mut ctx, &mut rule);
            unify::schedule_rule(&mut ctx, &mut rule);
            ctx.rules.insert(ident.clone(), rule);
        }

        if !ctx.errors.is_empty() {
            return Err(ctx.errors);
        }

        // Freeze rule signatures for name resolution during emission.
        ctx.signatures = ctx
            .rules
            .values()
            .map(|r| {
                (
                    r.ident.clone(),
                    FuncSig {
                        arity: r.args.len(),
                        function: r.is_function(),
                    },
                )
            })
            .collect();

        // with_rules: expand overrides, cloning rules where needed.
        with::with_rules(&mut ctx);

        if !ctx.errors.is_empty() {
            return Err(ctx.errors);
        }

        // expr_to_opblock + lift_functions.
        let mut bundle = Bundle {
            data: self.data,
            query: query_source,
            ..Bundle::default()
        };
        functions::lift_functions(&mut ctx, &mut bundle);

        // add_plans.
        plans::add_plans(&mut ctx, &mut bundle);

        if !ctx.errors.is_empty() {
            return Err(ctx.errors);
        }

        // index_strings_locals: freeze the tables.
        bundle.strings = ctx.strings.keys().cloned().collect();
        bundle.files = ctx.files.clone();
        for (name, builtin) in self.registry.iter() {
            bundle.builtin_funcs.insert(name.clone(), builtin.decl.clone());
        }

        Ok(bundle)
    }
}

/// Dotted path of a package or rule ref: head var plus dotted/bracketed
/// constant segments. Returns `None` when a segment is not a constant
/// string.
pub fn ref_to_path(ref_node: &Node) -> Option<Vec<String>> {
    use crate::ast::Tag;
    let mut path = vec![];
    let head = ref_node.field(Tag::RefHead)?;
    if !head.front().is(Tag::Var) {
        return None;
    }
    path.push(head.front().text().to_string());
    for arg in ref_node.field(Tag::RefArgSeq)?.children() {
        match arg.tag() {
            Tag::RefArgDot => path.push(arg.front().text().to_string()),
            Tag::RefArgBrack => {
                let expr = arg.front();
                let scalar = expr.find_first(Tag::JsonString)?;
                path.push(unquote(scalar.text()));
            }
            _ => return None,
        }
    }
    Some(path)
}

/// Strip the quotes of a JSON string token and unescape its contents.
pub fn unquote(text: &str) -> String {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let mut code = 0u32;
                for _ in 0..4 {
                    if let Some(h) = chars.next().and_then(|c| c.to_digit(16)) {
                        code = code * 16 + h;
                    }
                }
                if let Some(c) = char::from_u32(code) {
                    out.push(c);
                }
            }
            Some(other) => out.push(other),
            None => (),
        }
    }
    out
}

/// Text of a raw string token, without the backticks.
pub fn unquote_raw(text: &str) -> String {
    text.strip_prefix('`')
        .and_then(|t| t.strip_suffix('`'))
        .unwrap_or(text)
        .to_string()
}

/// Map of alias → target ref for a module's imports.
pub fn import_aliases(importseq: &Node) -> BTreeMap<String, Node> {
    use crate::ast::Tag;
    let mut aliases = BTreeMap::new();
    for import in importseq.children() {
        let path = import.front();
        let alias = import.back();
        let name = if alias.is(Tag::Var) {
            alias.text().to_string()
        } else {
            // Unaliased imports bind their last segment.
            match ref_to_path(path) {
                Some(segments) if segments.len() > 1 => {
                    segments.last().expect("segments").clone()
                }
                _ => continue,
            }
        };
        aliases.insert(name, path.clone());
    }
    aliases
}
