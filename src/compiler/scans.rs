// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *implicit_scans* pass: iteration by reference enumeration.
//!
//! `some x in e` declarations, reads of refs whose brackets hold unbound
//! variables (including the `_` placeholder, which the reader already turned
//! into fresh unused vars), and two-argument `walk` calls all become
//! explicit `ExprScan` literals over a materialized source local, with fresh
//! `scanindex$`/`scanvalue$` slots where the policy did not name them.

use std::collections::BTreeSet;

use super::rules::is_constant;
use super::{CompileCtx, RuleDef};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;

fn term_var(name: &str) -> Node {
    NodeDef::node(Tag::Term, vec![NodeDef::synthetic(Tag::Var, name)])
}

fn expr_term_var(name: &str) -> Node {
    NodeDef::node(Tag::Expr, vec![term_var(name)])
}

fn assign_literal(name: &str, rhs: Node, withseq: &Node) -> Node {
    NodeDef::node(
        Tag::Literal,
        vec![
            NodeDef::node(
                Tag::ExprAssign,
                vec![NodeDef::synthetic(Tag::AssignVar, name), rhs],
            ),
            withseq.clone(),
        ],
    )
}

fn scan_literal(source: &str, key: &str, value: &str, withseq: &Node) -> Node {
    NodeDef::node(
        Tag::Literal,
        vec![
            NodeDef::node(
                Tag::ExprScan,
                vec![
                    expr_term_var(source),
                    NodeDef::node(Tag::Key, vec![NodeDef::synthetic(Tag::Var, key)]),
                    NodeDef::node(Tag::Val, vec![NodeDef::synthetic(Tag::Var, value)]),
                ],
            ),
            withseq.clone(),
        ],
    )
}

/// Convert `:=` and `=` infixes into their planning forms. `:=` with a
/// simple variable target becomes `ExprAssign`; everything else that can
/// bind becomes `ExprUnify`; constant `=` constant degrades to equality.
pub fn convert_assignments(ctx: &mut CompileCtx, node: &Node) -> Node {
    if node.is(Tag::Literal) {
        let payload = node.front();
        let withseq = node.back().clone();
        if payload.is(Tag::Expr) && payload.front().is(Tag::ExprInfix) {
            let infix = payload.front();
            let op_wrapper = infix.expect(Tag::InfixOperator).front();
            if op_wrapper.is(Tag::AssignOperator) {
                let op = op_wrapper.front().tag();
                let lhs = infix.front().clone();
                let rhs = infix.back().clone();
                let payload = lower_assignment(ctx, op, &lhs, &rhs);
                return NodeDef::node(Tag::Literal, vec![payload, withseq]);
            }
        }
    }
    if node.is_empty() {
        return node.clone();
    }
    let children = node
        .children()
        .iter()
        .map(|c| convert_assignments(ctx, c))
        .collect();
    NodeDef::with_children(node, children)
}

fn lower_assignment(ctx: &mut CompileCtx, op: Tag, lhs: &Node, rhs: &Node) -> Node {
    let lhs = convert_assignments(ctx, lhs);
    let rhs = convert_assignments(ctx, rhs);
    let lhs_inner = lhs.front();

    if op == Tag::Assign {
        if lhs_inner.is(Tag::Term) && lhs_inner.front().is(Tag::Var) {
            return NodeDef::node(
                Tag::ExprAssign,
                vec![
                    NodeDef::synthetic(Tag::AssignVar, lhs_inner.front().text()),
                    rhs,
                ],
            );
        }
        return NodeDef::node(Tag::ExprUnify, vec![lhs, rhs]);
    }

    // `=`: two constants degrade to an equality check.
    if is_constant(&lhs) && is_constant(&rhs) {
        let infix = NodeDef::node(
            Tag::ExprInfix,
            vec![
                lhs,
                NodeDef::node(
                    Tag::InfixOperator,
                    vec![NodeDef::node(
                        Tag::BoolOperator,
                        vec![NodeDef::synthetic(Tag::Equals, "==")],
                    )],
                ),
                rhs,
            ],
        );
        return NodeDef::node(Tag::Expr, vec![infix]);
    }

    NodeDef::node(Tag::ExprUnify, vec![lhs, rhs])
}

/// Variables a body may bind, used to decide whether a bracket var scans or
/// looks up. Vars inside refs never bind through unification.
fn potential_writes(body: &Node, written: &mut BTreeSet<String>) {
    for lit in body.children() {
        let payload = lit.front();
        match payload.tag() {
            Tag::ExprAssign => {
                written.insert(payload.front().text().to_string());
            }
            Tag::SomeDecl => {
                for var in payload.front().children() {
                    written.insert(var.text().to_string());
                }
            }
            Tag::SomeExpr => {
                if payload.front().is(Tag::Expr) {
                    if let Some(var) = payload.front().find_first(Tag::Var) {
                        written.insert(var.text().to_string());
                    }
                }
                if let Some(var) = payload.child(1).find_first(Tag::Var) {
                    written.insert(var.text().to_string());
                }
            }
            Tag::ExprScan => {
                written.insert(payload.expect(Tag::Key).front().text().to_string());
                written.insert(payload.expect(Tag::Val).front().text().to_string());
            }
            Tag::ExprUnify => {
                unify_write_candidates(payload.front(), written);
                unify_write_candidates(payload.back(), written);
            }
            Tag::Expr if payload.front().is(Tag::ExprEvery) => {
                for var in payload.front().front().children() {
                    written.insert(var.text().to_string());
                }
            }
            _ => (),
        }
    }
}

fn unify_write_candidates(node: &Node, written: &mut BTreeSet<String>) {
    match node.tag() {
        // Inside a ref everything is a read.
        Tag::Ref | Tag::ExprCall => (),
        Tag::Var => {
            written.insert(node.text().to_string());
        }
        _ => {
            for child in node.children() {
                unify_write_candidates(child, written);
            }
        }
    }
}

struct ScanRewriter<'a, 'b> {
    ctx: &'a mut CompileCtx<'b>,
    written: BTreeSet<String>,
    globals: BTreeSet<String>,
    /// Literals to emit before the one being rewritten.
    prefix: Vec<Node>,
    withseq: Node,
}

impl<'a, 'b> ScanRewriter<'a, 'b> {
    fn is_scannable_var(&self, name: &str) -> bool {
        name != "input"
            && name != "data"
            && !self.written.contains(name)
            && !self.globals.contains(name)
    }

    /// Materialize an expression into a named local usable as a scan source.
    fn materialize(&mut self, expr: Node) -> String {
        if expr.is(Tag::Expr) && expr.front().is(Tag::Term) && expr.front().front().is(Tag::Var) {
            let name = expr.front().front().text();
            if self.written.contains(name) {
                return name.to_string();
            }
        }
        let name = self.ctx.fresh.fresh("scansource");
        self.prefix
            .push(assign_literal(&name, expr, &self.withseq));
        self.written.insert(name.to_string());
        name.to_string()
    }

    /// Rewrite the refs of an expression tree, introducing scans.
    fn rewrite(&mut self, node: &Node) -> Node {
        match node.tag() {
            Tag::Term if node.front().is(Tag::Ref) => {
                let rewritten = self.rewrite_ref(node.front());
                NodeDef::node(Tag::Term, vec![rewritten])
            }
            // Nested bodies handle their own scans.
            Tag::UnifyBody => node.clone(),
            _ => {
                if node.is_empty() {
                    return node.clone();
                }
                let children = node.children().iter().map(|c| self.rewrite(c)).collect();
                NodeDef::with_children(node, children)
            }
        }
    }

    /// Split a ref at its first scannable bracket.
    fn rewrite_ref(&mut self, ref_node: &Node) -> Node {
        let head = ref_node.expect(Tag::RefHead).front().clone();
        let args = ref_node.expect(Tag::RefArgSeq).children().to_vec();

        let mut scan_at: Option<(usize, String)> = None;
        for (i, arg) in args.iter().enumerate() {
            if arg.is(Tag::RefArgBrack) {
                let expr = arg.front();
                if expr.is(Tag::Expr) && expr.front().is(Tag::Term) {
                    let inner = expr.front().front();
                    if inner.is(Tag::Var) && self.is_scannable_var(inner.text()) {
                        scan_at = Some((i, inner.text().to_string()));
                        break;
                    }
                }
            }
        }

        let Some((index, key_var)) = scan_at else {
            // Still rewrite nested bracket expressions.
            let args = args
                .iter()
                .map(|a| {
                    if a.is(Tag::RefArgBrack) {
                        NodeDef::node(Tag::RefArgBrack, vec![self.rewrite(a.front())])
                    } else {
                        a.clone()
                    }
                })
                .collect();
            return NodeDef::node(
                Tag::Ref,
                vec![
                    ref_node.expect(Tag::RefHead).clone(),
                    NodeDef::node(Tag::RefArgSeq, args),
                ],
            );
        };

        // The prefix ref becomes the scan source.
        let prefix_ref = if index == 0 && head.is(Tag::Var) {
            NodeDef::node(Tag::Expr, vec![NodeDef::node(Tag::Term, vec![head.clone()])])
        } else {
            NodeDef::node(
                Tag::Expr,
                vec![NodeDef::node(
                    Tag::Term,
                    vec![NodeDef::node(
                        Tag::Ref,
                        vec![
                            NodeDef::node(Tag::RefHead, vec![head.clone()]),
                            NodeDef::node(Tag::RefArgSeq, args[..index].to_vec()),
                        ],
                    )],
                )],
            )
        };

        let source = self.materialize(prefix_ref);
        let value = self.ctx.fresh.fresh("scanvalue");
        self.prefix
            .push(scan_literal(&source, &key_var, &value, &self.withseq));
        self.written.insert(key_var);
        self.written.insert(value.to_string());

        let rest = &args[index + 1..];
        if rest.is_empty() {
            NodeDef::node(
                Tag::Ref,
                vec![
                    NodeDef::node(
                        Tag::RefHead,
                        vec![NodeDef::synthetic(Tag::Var, value.as_ref())],
                    ),
                    NodeDef::node(Tag::RefArgSeq, vec![]),
                ],
            )
        } else {
            let remainder = NodeDef::node(
                Tag::Ref,
                vec![
                    NodeDef::node(
                        Tag::RefHead,
                        vec![NodeDef::synthetic(Tag::Var, value.as_ref())],
                    ),
                    NodeDef::node(Tag::RefArgSeq, rest.to_vec()),
                ],
            );
            self.rewrite_ref(&remainder)
        }
    }
}

pub fn implicit_scans(ctx: &mut CompileCtx, rule: &mut RuleDef) {
    let globals: BTreeSet<String> = {
        let package: Vec<String> = rule.path[..rule.path.len().saturating_sub(1)].to_vec();
        ctx.package_rule_names(&package)
    };

    let mut preassigned: BTreeSet<String> = BTreeSet::new();
    for i in 0..rule.args.len() {
        preassigned.insert(format!("funcarg${i}"));
    }

    let mut defs = std::mem::take(&mut rule.defs);
    for def in &mut defs {
        if let Some(body) = &def.body {
            def.body = Some(process_body(ctx, body, &preassigned, &globals));
        }
        // Comprehension bodies inside head expressions iterate too.
        if let Some(value) = &def.value {
            def.value = Some(rewrite_nested_bodies(ctx, value, &preassigned, &globals));
        }
        if let Some(key) = &def.key {
            def.key = Some(rewrite_nested_bodies(ctx, key, &preassigned, &globals));
        }
        for segment in &mut def.dynamic_path {
            *segment = rewrite_nested_bodies(ctx, segment, &preassigned, &globals);
        }
        for (value, else_body) in &mut def.elses {
            if let Some(v) = value {
                *v = rewrite_nested_bodies(ctx, v, &preassigned, &globals);
            }
            if let Some(body) = else_body {
                *else_body = Some(process_body(ctx, body, &preassigned, &globals));
            }
        }
    }
    rule.defs = defs;
}

pub fn process_body(
    ctx: &mut CompileCtx,
    body: &Node,
    outer_written: &BTreeSet<String>,
    globals: &BTreeSet<String>,
) -> Node {
    let mut written = outer_written.clone();
    potential_writes(body, &mut written);

    let mut out: Vec<Node> = vec![];
    for lit in body.children() {
        // Nested bodies first, with the current binding context.
        let lit = rewrite_nested_bodies(ctx, lit, &written, globals);

        let payload = lit.front().clone();
        let withseq = lit.back().clone();

        match payload.tag() {
            Tag::SomeExpr => {
                let key = payload.child(0);
                let val = payload.child(1);
                let domain = payload.child(2);

                let mut rewriter = ScanRewriter {
                    ctx: &mut *ctx,
                    written: written.clone(),
                    globals: globals.clone(),
                    prefix: vec![],
                    withseq: withseq.clone(),
                };
                let domain = rewriter.rewrite(domain);
                let source = rewriter.materialize(domain);
                written.extend(rewriter.written.iter().cloned());
                out.extend(rewriter.prefix);

                let key_name = if key.is(Tag::Undefined) {
                    ctx.fresh.fresh("scanindex").to_string()
                } else {
                    match key.find_first(Tag::Var) {
                        Some(var) => var.text().to_string(),
                        None => ctx.fresh.fresh("scanindex").to_string(),
                    }
                };
                let val_name = match val.find_first(Tag::Var) {
                    Some(var) => var.text().to_string(),
                    None => {
                        ctx.error(
                            ErrorKind::RegoCompile,
                            "expected a variable in `some ... in`",
                            &payload,
                        );
                        continue;
                    }
                };
                written.insert(key_name.clone());
                written.insert(val_name.clone());
                out.push(scan_literal(&source, &key_name, &val_name, &withseq));
            }
            Tag::SomeDecl => {
                // Pure declarations carry through for the scheduler.
                out.push(lit.clone());
            }
            _ => {
                // `walk(x, [p, v])` iterates all nested nodes.
                let lit = rewrite_walk_calls(ctx, &lit, &mut written, globals, &withseq, &mut out);

                let mut rewriter = ScanRewriter {
                    ctx: &mut *ctx,
                    written: written.clone(),
                    globals: globals.clone(),
                    prefix: vec![],
                    withseq: withseq.clone(),
                };
                let payload = rewriter.rewrite(lit.front());
                written.extend(rewriter.written.iter().cloned());
                out.extend(rewriter.prefix);
                out.push(NodeDef::node(Tag::Literal, vec![payload, withseq]));
            }
        }
    }

    NodeDef::node(Tag::UnifyBody, out)
}

fn rewrite_nested_bodies(
    ctx: &mut CompileCtx,
    node: &Node,
    written: &BTreeSet<String>,
    globals: &BTreeSet<String>,
) -> Node {
    match node.tag() {
        Tag::ArrayCompr | Tag::SetCompr | Tag::ObjectCompr => {
            let mut children: Vec<Node> = node.children().to_vec();
            let last = children.len() - 1;
            children[last] = process_body(ctx, &children[last], written, globals);
            NodeDef::with_children(node, children)
        }
        Tag::ExprEvery => {
            let mut inner = written.clone();
            for var in node.front().children() {
                inner.insert(var.text().to_string());
            }
            let body = process_body(ctx, node.child(1), &inner, globals);
            NodeDef::node(
                Tag::ExprEvery,
                vec![node.front().clone(), body, node.back().clone()],
            )
        }
        _ => {
            if node.is_empty() {
                return node.clone();
            }
            let children = node
                .children()
                .iter()
                .map(|c| rewrite_nested_bodies(ctx, c, written, globals))
                .collect();
            NodeDef::with_children(node, children)
        }
    }
}

/// Rewrite `walk(x, pattern)` into a scan over `walk(x)`.
fn rewrite_walk_calls(
    ctx: &mut CompileCtx,
    lit: &Node,
    written: &mut BTreeSet<String>,
    _globals: &BTreeSet<String>,
    withseq: &Node,
    out: &mut Vec<Node>,
) -> Node {
    let payload = lit.front();
    if !payload.is(Tag::Expr) || !payload.front().is(Tag::ExprCall) {
        return lit.clone();
    }
    let call = payload.front();
    let callee = super::ref_to_path(call.front());
    if callee.as_deref() != Some(&["walk".to_string()][..]) {
        return lit.clone();
    }
    let args = call.back();
    if args.len() != 2 {
        return lit.clone();
    }

    let pairs = ctx.fresh.fresh("walkpairs");
    let single_call = NodeDef::node(
        Tag::Expr,
        vec![NodeDef::node(
            Tag::ExprCall,
            vec![
                call.front().clone(),
                NodeDef::node(Tag::ExprSeq, vec![args.front().clone()]),
            ],
        )],
    );
    out.push(assign_literal(&pairs, single_call, withseq));
    written.insert(pairs.to_string());

    let index = ctx.fresh.fresh("scanindex");
    let value = ctx.fresh.fresh("scanvalue");
    out.push(scan_literal(&pairs, &index, &value, withseq));
    written.insert(index.to_string());
    written.insert(value.to_string());

    NodeDef::node(
        Tag::Literal,
        vec![
            NodeDef::node(
                Tag::ExprUnify,
                vec![args.back().clone(), expr_term_var(&value)],
            ),
            withseq.clone(),
        ],
    )
}
