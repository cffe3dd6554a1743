// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *refheads*, *rules* and *merge* passes: normalize rule heads
//! (including dynamic refs), reshape every rule statement into a
//! [`RuleDef`] keyed by its global identifier, expand import aliases, and
//! check the virtual document against the base document.

use super::{import_aliases, ref_to_path, unquote, CompileCtx, ModuleInput, RuleBodyDef, RuleDef, RuleKind};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;
use crate::value::Value;
use std::collections::BTreeMap;

/// A rule-ref segment: a constant path element or a dynamic expression.
enum Segment {
    Const(String),
    Dynamic(Node),
}

fn string_expr(text: &str) -> Node {
    NodeDef::node(
        Tag::Expr,
        vec![NodeDef::node(
            Tag::Term,
            vec![NodeDef::node(
                Tag::Scalar,
                vec![NodeDef::synthetic(
                    Tag::JsonString,
                    format!("\"{text}\""),
                )],
            )],
        )],
    )
}

fn rule_ref_segments(ctx: &mut CompileCtx, rule_ref: &Node) -> Vec<Segment> {
    let target = rule_ref.front();
    match target.tag() {
        Tag::Var => vec![Segment::Const(target.text().to_string())],
        Tag::Ref => {
            let mut segments = vec![];
            let head = target.expect(Tag::RefHead).front();
            segments.push(Segment::Const(head.text().to_string()));
            for arg in target.expect(Tag::RefArgSeq).children() {
                match arg.tag() {
                    Tag::RefArgDot => {
                        segments.push(Segment::Const(arg.front().text().to_string()))
                    }
                    Tag::RefArgBrack => {
                        let expr = arg.front();
                        match expr.find_first(Tag::JsonString) {
                            Some(s) if is_constant(expr) => {
                                segments.push(Segment::Const(unquote(s.text())))
                            }
                            _ => segments.push(Segment::Dynamic(expr.clone())),
                        }
                    }
                    _ => {
                        ctx.error(ErrorKind::RegoCompile, "invalid rule reference", arg);
                    }
                }
            }
            segments
        }
        _ => {
            ctx.error(ErrorKind::RegoCompile, "invalid rule reference", rule_ref);
            vec![]
        }
    }
}

/// A term made only of scalars and literal aggregates of scalars.
pub fn is_constant(node: &Node) -> bool {
    match node.tag() {
        Tag::Var | Tag::Ref | Tag::ExprCall | Tag::ExprInfix | Tag::ExprEvery | Tag::Membership
        | Tag::UnaryExpr | Tag::ArrayCompr | Tag::ObjectCompr | Tag::SetCompr => false,
        _ => node.children().iter().all(is_constant),
    }
}

/// Replace import aliases with their targets throughout a rule.
fn expand_aliases(aliases: &BTreeMap<String, Node>, node: &Node) -> Node {
    if aliases.is_empty() {
        return node.clone();
    }
    match node.tag() {
        Tag::Term if node.front().is(Tag::Var) => {
            match aliases.get(node.front().text()) {
                Some(target) => NodeDef::node(Tag::Term, vec![target.clone()]),
                None => node.clone(),
            }
        }
        Tag::Ref => {
            let head = node.expect(Tag::RefHead).front();
            let argseq = node.expect(Tag::RefArgSeq);
            let args: Vec<Node> = argseq
                .children()
                .iter()
                .map(|a| expand_aliases(aliases, a))
                .collect();
            if head.is(Tag::Var) {
                if let Some(target) = aliases.get(head.text()) {
                    let mut merged: Vec<Node> =
                        target.expect(Tag::RefArgSeq).children().to_vec();
                    merged.extend(args);
                    return NodeDef::node(
                        Tag::Ref,
                        vec![
                            target.expect(Tag::RefHead).clone(),
                            NodeDef::node(Tag::RefArgSeq, merged),
                        ],
                    );
                }
            }
            NodeDef::node(
                Tag::Ref,
                vec![
                    NodeDef::with_children(node.expect(Tag::RefHead), vec![expand_aliases(aliases, head)]),
                    NodeDef::node(Tag::RefArgSeq, args),
                ],
            )
        }
        _ => {
            if node.is_empty() {
                return node.clone();
            }
            let children = node
                .children()
                .iter()
                .map(|c| expand_aliases(aliases, c))
                .collect();
            NodeDef::with_children(node, children)
        }
    }
}

fn else_alternatives(ctx: &mut CompileCtx, rule: &Node) -> Vec<(Option<Node>, Option<Node>)> {
    let mut elses = vec![];
    for e in rule.expect(Tag::ElseSeq).children() {
        let value = if e.front().is(Tag::Empty) {
            None
        } else {
            Some(e.front().clone())
        };
        let body = if e.back().is(Tag::Empty) {
            None
        } else {
            Some(e.back().clone())
        };
        if value.is_none() && body.is_none() {
            ctx.error(ErrorKind::RegoCompile, "empty else clause", e);
        }
        elses.push((value, body));
    }
    elses
}

pub fn absorb_module(ctx: &mut CompileCtx, module: &ModuleInput, file: usize) {
    let inner = module.top.front();
    if !inner.is(Tag::Module) {
        return;
    }

    let package = match ref_to_path(inner.expect(Tag::Package).front()) {
        Some(path) => {
            let mut p = vec!["data".to_string()];
            p.extend(path);
            p
        }
        None => {
            ctx.error(
                ErrorKind::RegoCompile,
                "invalid package name",
                inner.expect(Tag::Package),
            );
            return;
        }
    };

    let aliases = import_aliases(inner.expect(Tag::ImportSeq));

    for rule in inner.expect(Tag::Policy).children() {
        let rule = expand_aliases(&aliases, rule);
        let rule = super::scans::convert_assignments(ctx, &rule);
        absorb_rule(ctx, &rule, &package, file);
    }
}

fn absorb_rule(ctx: &mut CompileCtx, rule: &Node, package: &[String], file: usize) {
    let is_default = rule.front().is(Tag::Default);
    let head = rule.expect(Tag::RuleHead);
    let head_type = head.child(1);
    let body = if rule.child(2).is(Tag::Empty) {
        None
    } else {
        Some(rule.child(2).clone())
    };
    let elses = else_alternatives(ctx, rule);

    let segments = rule_ref_segments(ctx, head.expect(Tag::RuleRef));
    if segments.is_empty() {
        return;
    }

    // Split the path at the first dynamic segment, if any.
    let mut path: Vec<String> = package.to_vec();
    let mut dynamic_path: Vec<Node> = vec![];
    let mut dynamic = false;
    for segment in segments {
        match segment {
            Segment::Const(s) if !dynamic => path.push(s),
            Segment::Const(s) => dynamic_path.push(string_expr(&s)),
            Segment::Dynamic(expr) => {
                if !dynamic {
                    dynamic = true;
                }
                dynamic_path.push(expr);
            }
        }
    }

    let ident = path.join(".");

    let (kind, key, value, args) = match head_type.tag() {
        Tag::RuleHeadComp => {
            let value = head_type.expect(Tag::Expr).clone();
            if dynamic {
                (RuleKind::DynamicObject, None, Some(value), vec![])
            } else {
                (RuleKind::Complete, None, Some(value), vec![])
            }
        }
        Tag::RuleHeadFunc => {
            let value = head_type.back().clone();
            let args = head_type.expect(Tag::RuleArgs).children().to_vec();
            (RuleKind::Function, None, Some(value), args)
        }
        Tag::RuleHeadSet => {
            let item = head_type.front().clone();
            if dynamic {
                (RuleKind::DynamicSet, Some(item), None, vec![])
            } else {
                (RuleKind::PartialSet, Some(item), None, vec![])
            }
        }
        Tag::RuleHeadObj => {
            let key = head_type.front().clone();
            let value = head_type.back().clone();
            if dynamic {
                // The key is one more dynamic segment.
                dynamic_path.push(key.clone());
                (RuleKind::DynamicObject, None, Some(value), vec![])
            } else {
                (RuleKind::PartialObject, Some(key), Some(value), vec![])
            }
        }
        other => {
            ctx.error(
                ErrorKind::RegoCompile,
                format!("unsupported rule head {other}"),
                head_type,
            );
            return;
        }
    };

    if !matches!(kind, RuleKind::Complete | RuleKind::Function) && !elses.is_empty() {
        ctx.error(
            ErrorKind::RegoCompile,
            "the `else` keyword only applies to complete and function rules",
            rule,
        );
        return;
    }

    if is_default {
        let value = match value {
            Some(v) if body.is_none() => v,
            _ => {
                ctx.error(ErrorKind::RegoCompile, "invalid default rule", rule);
                return;
            }
        };
        if !is_constant(&value) {
            ctx.error(
                ErrorKind::RegoCompile,
                "default rule values must be constant",
                &value,
            );
            return;
        }
        let entry = ctx.rules.entry(ident.clone()).or_insert_with(|| RuleDef {
            ident: ident.clone(),
            path: path.clone(),
            kind: kind.clone(),
            args: args.clone(),
            defs: vec![],
            default: None,
            file,
            prefix: "g0".to_string(),
        });
        if entry.default.is_some() {
            ctx.error(
                ErrorKind::RegoCompile,
                format!("multiple default rules named {ident}"),
                rule,
            );
            return;
        }
        entry.default = Some(value);
        return;
    }

    // Function arguments unify against the canonical parameter slots.
    let (body, elses) = if kind == RuleKind::Function {
        let mut literals: Vec<Node> = vec![];
        for (i, pattern) in args.iter().enumerate() {
            let slot = format!("funcarg${i}");
            literals.push(NodeDef::node(
                Tag::Literal,
                vec![
                    NodeDef::node(
                        Tag::ExprUnify,
                        vec![
                            NodeDef::node(Tag::Expr, vec![pattern.clone()]),
                            NodeDef::node(
                                Tag::Expr,
                                vec![NodeDef::node(
                                    Tag::Term,
                                    vec![NodeDef::synthetic(Tag::Var, slot)],
                                )],
                            ),
                        ],
                    ),
                    NodeDef::node(Tag::WithSeq, vec![]),
                ],
            ));
        }
        let body = match body {
            Some(b) => {
                let mut children = literals.clone();
                children.extend(b.children().iter().cloned());
                Some(NodeDef::node(Tag::UnifyBody, children))
            }
            None if literals.is_empty() => None,
            None => Some(NodeDef::node(Tag::UnifyBody, literals.clone())),
        };
        // else bodies also destructure the arguments.
        let elses = elses
            .into_iter()
            .map(|(value, else_body)| {
                let else_body = match else_body {
                    Some(b) => {
                        let mut children = literals.clone();
                        children.extend(b.children().iter().cloned());
                        Some(NodeDef::node(Tag::UnifyBody, children))
                    }
                    None if literals.is_empty() => None,
                    None => Some(NodeDef::node(Tag::UnifyBody, literals.clone())),
                };
                (value, else_body)
            })
            .collect();
        (body, elses)
    } else {
        (body, elses)
    };

    let def = RuleBodyDef {
        value,
        key,
        dynamic_path,
        body,
        elses,
    };

    match ctx.rules.get_mut(&ident) {
        Some(existing) => {
            let compatible = existing.kind == kind
                || matches!(
                    (&existing.kind, &kind),
                    (RuleKind::DynamicObject, RuleKind::DynamicSet)
                );
            if !compatible {
                ctx.error(
                    ErrorKind::RegoCompile,
                    format!("rule {ident} defined with conflicting types"),
                    rule,
                );
                return;
            }
            if existing.kind == RuleKind::Function && existing.args.len() != args.len() {
                ctx.error(
                    ErrorKind::RegoCompile,
                    format!("function {ident} defined with conflicting arities"),
                    rule,
                );
                return;
            }
            existing.defs.push(def);
        }
        None => {
            ctx.rules.insert(
                ident.clone(),
                RuleDef {
                    ident,
                    path,
                    kind,
                    args,
                    defs: vec![def],
                    default: None,
                    file,
                    prefix: "g0".to_string(),
                },
            );
        }
    }
}

pub fn absorb_query(ctx: &mut CompileCtx, top: &Node, file: usize) {
    let query = top.front();
    if !query.is(Tag::Query) {
        return;
    }
    let body = super::scans::convert_assignments(ctx, query.expect(Tag::UnifyBody));
    let ident = "query$0".to_string();
    ctx.rules.insert(
        ident.clone(),
        RuleDef {
            ident: ident.clone(),
            path: vec![ident],
            kind: RuleKind::Query,
            args: vec![],
            defs: vec![RuleBodyDef {
                value: None,
                key: None,
                dynamic_path: vec![],
                body: Some(body),
                elses: vec![],
            }],
            default: None,
            file,
            prefix: "g0".to_string(),
        },
    );
}

/// The virtual document must not collide with a base-document scalar along
/// any rule's package path.
pub fn check_data_conflicts(ctx: &mut CompileCtx, data: &Value) {
    let idents: Vec<(String, Vec<String>)> = ctx
        .rules
        .values()
        .filter(|r| r.kind != RuleKind::Query)
        .map(|r| (r.ident.clone(), r.path.clone()))
        .collect();
    for (ident, path) in idents {
        let mut current = data.clone();
        // Skip the leading `data` segment.
        for segment in &path[1..] {
            match current {
                Value::Object(_) => {
                    current = current[segment.as_str()].clone();
                }
                Value::Undefined => break,
                _ => {
                    ctx.errors.push(crate::errors::Diagnostic::new(
                        ErrorKind::RegoCompile,
                        format!("rule {ident} conflicts with the base document"),
                        None,
                    ));
                    break;
                }
            }
        }
    }
}
