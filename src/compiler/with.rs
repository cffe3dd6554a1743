// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *with_rules* pass: expand `with` overrides whose target is a rule or
//! a built-in. Overrides of `input`/`data` paths stay in the literal's
//! `WithSeq` and become runtime overlays; rule and built-in targets are
//! resolved at compile time by substituting the replacement at every call
//! site inside the scoped statement, cloning any rule the statement reaches
//! that itself depends on the target. Clones live under fresh `gN` name
//! prefixes and inherit the substitution, so overrides apply transitively.

use std::collections::{BTreeMap, BTreeSet};

use super::{ref_to_path, CompileCtx, RuleDef};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;

#[derive(Debug, Clone)]
enum Replacement {
    /// A constant value substituted at every read or call.
    Constant(Node),
    /// Another rule; reads and calls re-target its function.
    Rule(String),
    /// Another built-in.
    Builtin(String),
}

pub fn with_rules(ctx: &mut CompileCtx) {
    let idents: Vec<String> = ctx.rules.keys().cloned().collect();
    let references = build_reference_map(ctx);

    for ident in idents {
        let mut rule = ctx.rules.get(&ident).expect("rule").clone();
        let package: Vec<String> = rule.path[..rule.path.len().saturating_sub(1)].to_vec();

        let mut defs = std::mem::take(&mut rule.defs);
        for def in &mut defs {
            if let Some(body) = &def.body {
                def.body = Some(rewrite_body(ctx, body, &package, &references));
            }
            for (_, else_body) in &mut def.elses {
                if let Some(body) = else_body {
                    *body = rewrite_body(ctx, body, &package, &references);
                }
            }
        }
        rule.defs = defs;
        ctx.rules.insert(ident, rule);
    }
}

/// Rule ident → rule idents and built-in names it references.
fn build_reference_map(ctx: &CompileCtx) -> BTreeMap<String, BTreeSet<String>> {
    let mut map = BTreeMap::new();
    for rule in ctx.rules.values() {
        let package: Vec<String> = rule.path[..rule.path.len().saturating_sub(1)].to_vec();
        let mut refs = BTreeSet::new();
        for def in &rule.defs {
            for node in [&def.body, &def.value, &def.key]
                .into_iter()
                .flatten()
            {
                collect_references(ctx, node, &package, &mut refs);
            }
            for (value, body) in &def.elses {
                for node in [value, body].into_iter().flatten() {
                    collect_references(ctx, node, &package, &mut refs);
                }
            }
        }
        map.insert(rule.ident.clone(), refs);
    }
    map
}

/// Resolve a dotted name against rules (by ident or package-relative name)
/// and built-ins.
fn resolve_target(
    ctx: &CompileCtx,
    path: &[String],
    package: &[String],
) -> Option<String> {
    let name = path.join(".");
    if name.starts_with("data.") {
        // Longest prefix naming a rule.
        for k in (1..=path.len()).rev() {
            let ident = path[..k].join(".");
            if ctx.signatures.contains_key(&ident) {
                return Some(ident);
            }
        }
        return None;
    }
    if ctx.registry.is_builtin(&name) {
        return Some(name);
    }
    let ident = format!("{}.{}", package.join("."), name);
    if ctx.signatures.contains_key(&ident) {
        return Some(ident);
    }
    None
}

fn collect_references(
    ctx: &CompileCtx,
    node: &Node,
    package: &[String],
    refs: &mut BTreeSet<String>,
) {
    match node.tag() {
        Tag::ExprCall => {
            if let Some(path) = ref_to_path(node.front()) {
                if let Some(target) = resolve_target(ctx, &path, package) {
                    refs.insert(target);
                }
            }
            collect_references(ctx, node.back(), package, refs);
        }
        Tag::Ref => {
            if let Some(path) = ref_to_path(node) {
                if let Some(target) = resolve_target(ctx, &path, package) {
                    refs.insert(target);
                }
            }
            for child in node.children() {
                collect_references(ctx, child, package, refs);
            }
        }
        Tag::Var => {
            if let Some(target) = resolve_target(ctx, &[node.text().to_string()], package) {
                refs.insert(target);
            }
        }
        _ => {
            for child in node.children() {
                collect_references(ctx, child, package, refs);
            }
        }
    }
}

fn rewrite_body(
    ctx: &mut CompileCtx,
    body: &Node,
    package: &[String],
    references: &BTreeMap<String, BTreeSet<String>>,
) -> Node {
    let mut literals = vec![];
    for lit in body.children() {
        literals.push(rewrite_literal(ctx, lit, package, references));
    }
    NodeDef::node(Tag::UnifyBody, literals)
}

fn rewrite_literal(
    ctx: &mut CompileCtx,
    lit: &Node,
    package: &[String],
    references: &BTreeMap<String, BTreeSet<String>>,
) -> Node {
    // Nested scan bodies carry their own literals.
    let payload = lit.front();
    let payload = if payload.is(Tag::ExprScan) && payload.len() > 3 {
        let nested = rewrite_body(ctx, payload.back(), package, references);
        NodeDef::node(
            Tag::ExprScan,
            vec![
                payload.child(0).clone(),
                payload.child(1).clone(),
                payload.child(2).clone(),
                nested,
            ],
        )
    } else {
        payload.clone()
    };

    let withseq = lit.back();
    if !withseq.is(Tag::WithSeq) || withseq.is_empty() {
        return NodeDef::node(Tag::Literal, vec![payload, withseq.clone()]);
    }

    let mut kept: Vec<Node> = vec![];
    let mut subs: BTreeMap<String, Replacement> = BTreeMap::new();

    for with in withseq.children() {
        let target = with.front();
        let path = match target.front().tag() {
            Tag::Var => Some(vec![target.front().text().to_string()]),
            Tag::Ref => ref_to_path(target.front()),
            _ => None,
        };
        let Some(path) = path else {
            ctx.error(ErrorKind::RegoCompile, "invalid `with` target", target);
            continue;
        };

        // Overlays of input/data paths are handled at runtime, unless the
        // path names a rule.
        let overlays_document =
            path[0] == "input" || (path[0] == "data" && resolve_target(ctx, &path, package).is_none());
        if overlays_document {
            kept.push(with.clone());
            continue;
        }

        let Some(target_key) = resolve_target(ctx, &path, package) else {
            ctx.error(
                ErrorKind::RegoCompile,
                "`with` target is not input, data, a rule or a built-in",
                target,
            );
            continue;
        };

        match classify_replacement(ctx, with.back(), package) {
            Some(replacement) => {
                subs.insert(target_key, replacement);
            }
            None => {
                ctx.error(
                    ErrorKind::RegoCompile,
                    "`with` values for rules and built-ins must be constants, rules or built-ins",
                    with.back(),
                );
            }
        }
    }

    let payload = if subs.is_empty() {
        payload
    } else {
        let mut overrider = Overrider {
            ctx,
            package: package.to_vec(),
            references,
            subs,
            prefix: String::default(),
            cloned: BTreeMap::new(),
        };
        overrider.prefix = {
            overrider.ctx.clone_count += 1;
            format!("g{}", overrider.ctx.clone_count)
        };
        overrider.rewrite(&payload)
    };

    NodeDef::node(
        Tag::Literal,
        vec![payload, NodeDef::node(Tag::WithSeq, kept)],
    )
}

fn classify_replacement(
    ctx: &CompileCtx,
    value: &Node,
    package: &[String],
) -> Option<Replacement> {
    if super::rules::is_constant(value) {
        return Some(Replacement::Constant(value.clone()));
    }
    let inner = value.front();
    if inner.is(Tag::Term) {
        let term = inner.front();
        let path = match term.tag() {
            Tag::Var => Some(vec![term.text().to_string()]),
            Tag::Ref => ref_to_path(term),
            _ => None,
        };
        if let Some(path) = path {
            if let Some(target) = resolve_target(ctx, &path, package) {
                if ctx.registry.is_builtin(&target) {
                    return Some(Replacement::Builtin(target));
                }
                return Some(Replacement::Rule(target));
            }
        }
    }
    None
}

struct Overrider<'a, 'b, 'c> {
    ctx: &'a mut CompileCtx<'b>,
    package: Vec<String>,
    references: &'c BTreeMap<String, BTreeSet<String>>,
    subs: BTreeMap<String, Replacement>,
    prefix: String,
    /// Original ident → registry key of its clone.
    cloned: BTreeMap<String, String>,
}

impl<'a, 'b, 'c> Overrider<'a, 'b, 'c> {
    /// Whether a rule (transitively) depends on any overridden target.
    fn is_affected(&self, ident: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![ident.to_string()];
        while let Some(current) = frontier.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(refs) = self.references.get(&current) {
                for r in refs {
                    if self.subs.contains_key(r) {
                        return true;
                    }
                    frontier.push(r.clone());
                }
            }
        }
        false
    }

    fn marker(&self, func_name: &str) -> Node {
        NodeDef::node(
            Tag::Term,
            vec![NodeDef::synthetic(Tag::Var, format!("call${func_name}"))],
        )
    }

    /// Clone a rule into the override's name space, substitutions applied.
    fn clone_rule(&mut self, ident: &str) -> String {
        if let Some(name) = self.cloned.get(ident) {
            return name.clone();
        }
        let func_name = format!("{}.{}", self.prefix, ident);
        self.cloned.insert(ident.to_string(), func_name.clone());

        let Some(original) = self.ctx.rules.get(ident).cloned() else {
            return func_name;
        };
        let mut clone = RuleDef {
            prefix: self.prefix.clone(),
            ..original
        };

        let package: Vec<String> = clone.path[..clone.path.len().saturating_sub(1)].to_vec();
        let outer_package = std::mem::replace(&mut self.package, package);

        let mut defs = std::mem::take(&mut clone.defs);
        for def in &mut defs {
            if let Some(body) = &def.body {
                def.body = Some(self.rewrite(body));
            }
            if let Some(value) = &def.value {
                def.value = Some(self.rewrite(value));
            }
            if let Some(key) = &def.key {
                def.key = Some(self.rewrite(key));
            }
            for segment in &mut def.dynamic_path {
                *segment = self.rewrite(segment);
            }
            for (value, body) in &mut def.elses {
                if let Some(v) = value {
                    *v = self.rewrite(v);
                }
                if let Some(b) = body {
                    *b = self.rewrite(b);
                }
            }
        }
        clone.defs = defs;
        self.package = outer_package;

        let key = format!("{}|{}", self.prefix, ident);
        self.ctx.rules.insert(key, clone);
        func_name
    }

    fn replacement_term(&mut self, replacement: &Replacement, at: &Node) -> Node {
        match replacement {
            Replacement::Constant(value) => value.front().clone(),
            Replacement::Rule(ident) => {
                let func_name = if self.is_affected(ident) {
                    self.clone_rule(ident)
                } else {
                    format!("g0.{ident}")
                };
                self.marker(&func_name)
            }
            Replacement::Builtin(_) => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    "a built-in cannot be read as a value",
                    at,
                );
                at.clone()
            }
        }
    }

    fn rewrite(&mut self, node: &Node) -> Node {
        match node.tag() {
            Tag::ExprCall => self.rewrite_call(node),
            Tag::Term => {
                let term = node.front();
                let path = match term.tag() {
                    Tag::Var => Some(vec![term.text().to_string()]),
                    Tag::Ref => ref_to_path(term),
                    _ => None,
                };
                if let Some(path) = path {
                    if let Some(target) = resolve_target(self.ctx, &path, &self.package) {
                        if let Some(replacement) = self.subs.get(&target).cloned() {
                            return self.replacement_term(&replacement, node);
                        }
                        if !self.ctx.registry.is_builtin(&target) && self.is_affected(&target) {
                            let func_name = self.clone_rule(&target);
                            return self.marker(&func_name);
                        }
                    }
                }
                self.rewrite_children(node)
            }
            _ => self.rewrite_children(node),
        }
    }

    fn rewrite_children(&mut self, node: &Node) -> Node {
        if node.is_empty() {
            return node.clone();
        }
        let children = node.children().iter().map(|c| self.rewrite(c)).collect();
        NodeDef::with_children(node, children)
    }

    fn rewrite_call(&mut self, call: &Node) -> Node {
        let args: Vec<Node> = call
            .back()
            .children()
            .iter()
            .map(|a| self.rewrite(a))
            .collect();
        let exprseq = NodeDef::node(Tag::ExprSeq, args);

        let path = ref_to_path(call.front());
        if let Some(path) = path {
            if let Some(target) = resolve_target(self.ctx, &path, &self.package) {
                if let Some(replacement) = self.subs.get(&target).cloned() {
                    return match replacement {
                        // A constant override makes every call return it.
                        Replacement::Constant(value) => value.front().clone(),
                        Replacement::Rule(ident) => {
                            let func_name = if self.is_affected(&ident) {
                                self.clone_rule(&ident)
                            } else {
                                format!("g0.{ident}")
                            };
                            self.call_to(&func_name, exprseq)
                        }
                        Replacement::Builtin(name) => {
                            let callee = NodeDef::node(
                                Tag::Ref,
                                vec![
                                    NodeDef::node(
                                        Tag::RefHead,
                                        vec![NodeDef::synthetic(Tag::Var, name.as_str())],
                                    ),
                                    NodeDef::node(Tag::RefArgSeq, vec![]),
                                ],
                            );
                            NodeDef::node(Tag::ExprCall, vec![callee, exprseq])
                        }
                    };
                }
                if !self.ctx.registry.is_builtin(&target) && self.is_affected(&target) {
                    let func_name = self.clone_rule(&target);
                    return self.call_to(&func_name, exprseq);
                }
            }
        }
        NodeDef::node(Tag::ExprCall, vec![call.front().clone(), exprseq])
    }

    fn call_to(&self, func_name: &str, exprseq: Node) -> Node {
        let callee = NodeDef::node(
            Tag::Ref,
            vec![
                NodeDef::node(
                    Tag::RefHead,
                    vec![NodeDef::synthetic(Tag::Var, format!("call${func_name}"))],
                ),
                NodeDef::node(Tag::RefArgSeq, vec![]),
            ],
        );
        NodeDef::node(Tag::ExprCall, vec![callee, exprseq])
    }
}
