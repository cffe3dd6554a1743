// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *unify* pass: run the dependency graph over every rule body, bottom
//! up through nested comprehension and `every` bodies, so each body executes
//! in assignment-before-use order. Nested bodies get their locals renamed to
//! fresh names so they never collide with enclosing frames.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use super::{CompileCtx, RuleDef};
use crate::ast::{Node, NodeDef, Tag};
use crate::depgraph::{BodyScope, DependencyGraph};

pub fn schedule_rule(ctx: &mut CompileCtx, rule: &mut RuleDef) {
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
            def.body = Some(schedule_body(ctx, body, &globals, &preassigned));
        }
        for (value, else_body) in &mut def.elses {
            if let Some(body) = else_body {
                *else_body = Some(schedule_body(ctx, body, &globals, &preassigned));
            }
            if let Some(v) = value {
                *v = schedule_expr(ctx, v, &globals);
            }
        }
        if let Some(value) = &def.value {
            def.value = Some(schedule_expr(ctx, value, &globals));
        }
        if let Some(key) = &def.key {
            def.key = Some(schedule_expr(ctx, key, &globals));
        }
        for segment in &mut def.dynamic_path {
            *segment = schedule_expr(ctx, segment, &globals);
        }
    }
    rule.defs = defs;

    if let Some(default) = &rule.default {
        rule.default = Some(schedule_expr(ctx, default, &globals));
    }
}

/// Schedule the nested bodies inside an expression tree.
fn schedule_expr(ctx: &mut CompileCtx, expr: &Node, globals: &BTreeSet<String>) -> Node {
    match expr.tag() {
        Tag::ArrayCompr | Tag::SetCompr | Tag::ObjectCompr => {
            let mut children: Vec<Node> = expr
                .children()
                .iter()
                .map(|c| schedule_expr(ctx, c, globals))
                .collect();
            let last = children.len() - 1;
            children[last] = schedule_body(ctx, &children[last], globals, &BTreeSet::new());
            // Rename the body's own locals across the whole comprehension,
            // value expressions included.
            let mut own = BTreeSet::new();
            collect_written(&children[last], &mut own);
            rename_locals(ctx, &NodeDef::with_children(expr, children), own, globals)
        }
        Tag::ExprEvery => {
            let varseq = expr.front().clone();
            let mut bound = BTreeSet::new();
            for var in varseq.children() {
                bound.insert(var.text().to_string());
            }
            let body = schedule_body(ctx, expr.child(1), globals, &bound);
            let domain = schedule_expr(ctx, expr.back(), globals);
            let mut own = bound;
            collect_written(&body, &mut own);
            rename_locals(
                ctx,
                &NodeDef::node(Tag::ExprEvery, vec![varseq, body, domain]),
                own,
                globals,
            )
        }
        _ => {
            if expr.is_empty() {
                return expr.clone();
            }
            let children = expr
                .children()
                .iter()
                .map(|c| schedule_expr(ctx, c, globals))
                .collect();
            NodeDef::with_children(expr, children)
        }
    }
}

fn schedule_body(
    ctx: &mut CompileCtx,
    body: &Node,
    globals: &BTreeSet<String>,
    preassigned: &BTreeSet<String>,
) -> Node {
    // Inner bodies first.
    let mut literals: Vec<Node> = vec![];
    let mut declared: BTreeSet<String> = BTreeSet::new();
    for lit in body.children() {
        let payload = lit.front();
        if payload.is(Tag::SomeDecl) {
            for var in payload.front().children() {
                declared.insert(var.text().to_string());
            }
            continue;
        }
        let payload = schedule_expr(ctx, payload, globals);
        literals.push(NodeDef::node(
            Tag::Literal,
            vec![payload, lit.back().clone()],
        ));
    }

    let mut scope = BodyScope {
        globals,
        preassigned: preassigned.clone(),
        declared,
        fresh: &mut ctx.fresh,
    };
    match DependencyGraph::new(&mut scope, &literals).sort() {
        Ok(sorted) => {
            tracing::trace!(
                literals = sorted.body.len(),
                captures = sorted.captures.len(),
                "scheduled body"
            );
            if cfg!(debug_assertions) {
                if let Err(diagnostic) = crate::wf::compiled_rules().validate(&sorted.body) {
                    ctx.errors.push(diagnostic);
                }
            }
            sorted.body
        }
        Err(errors) => {
            for e in errors.errors {
                ctx.errors.push(e);
            }
            NodeDef::node(Tag::UnifyBody, literals)
        }
    }
}

/// Rename a nested scope's own locals so they cannot collide with the
/// enclosing frame's slots.
fn rename_locals(
    ctx: &mut CompileCtx,
    node: &Node,
    own: BTreeSet<String>,
    globals: &BTreeSet<String>,
) -> Node {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for name in own {
        if globals.contains(&name) || name.contains('$') {
            continue;
        }
        map.insert(name.clone(), ctx.fresh.fresh(&name).to_string());
    }
    if map.is_empty() {
        return node.clone();
    }
    rename(node, &map)
}

fn collect_written(body: &Node, written: &mut BTreeSet<String>) {
    for lit in body.children() {
        let payload = lit.front();
        match payload.tag() {
            Tag::ExprAssign | Tag::ExprAssignFromArray | Tag::ExprAssignFromObject => {
                written.insert(payload.front().text().to_string());
            }
            Tag::ExprScan => {
                written.insert(payload.expect(Tag::Key).front().text().to_string());
                written.insert(payload.expect(Tag::Val).front().text().to_string());
                if payload.len() > 3 {
                    collect_written(payload.back(), written);
                }
            }
            _ => (),
        }
    }
}

fn rename(node: &Node, map: &BTreeMap<String, String>) -> Node {
    match node.tag() {
        Tag::Var | Tag::AssignVar | Tag::Ident => match map.get(node.text()) {
            Some(new_name) => NodeDef::synthetic(node.tag(), new_name.as_str()),
            None => node.clone(),
        },
        Tag::RefArgDot => node.clone(),
        _ => {
            if node.is_empty() {
                return node.clone();
            }
            let children = node.children().iter().map(|c| rename(c, map)).collect();
            NodeDef::with_children(node, children)
        }
    }
}
