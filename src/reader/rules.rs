// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pass 14, *rules*: classify each top-level expression of a module as one
//! of the rule shapes (complete, function, partial set, partial object,
//! default) based on its head syntax. Pass 15, *literals*: wrap body
//! statements as `Literal(statement, WithSeq)`. Pass 16, *structure*:
//! normalize package and imports and enforce the final module grammar.

use super::{map_children, ReaderCtx};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;
use crate::reader::terms::to_expr;

fn empty() -> Node {
    NodeDef::synthetic(Tag::Empty, "")
}

fn true_expr() -> Node {
    NodeDef::node(
        Tag::Expr,
        vec![NodeDef::node(
            Tag::Term,
            vec![NodeDef::node(
                Tag::Scalar,
                vec![NodeDef::synthetic(Tag::True, "true")],
            )],
        )],
    )
}

fn assign_op(tag: Tag) -> Node {
    NodeDef::node(Tag::AssignOperator, vec![NodeDef::synthetic(tag, tag.name())])
}

pub fn rules(ctx: &mut ReaderCtx, top: Node) -> Node {
    let inner = top.front();
    let rebuilt = match inner.tag() {
        Tag::Module => {
            let policy = inner.expect(Tag::Policy);
            let rules: Vec<Node> = policy
                .children()
                .iter()
                .filter_map(|g| classify_rule(ctx, g))
                .collect();
            let children: Vec<Node> = inner
                .children()
                .iter()
                .map(|c| {
                    if c.is(Tag::Policy) {
                        NodeDef::node(Tag::Policy, rules.clone())
                    } else {
                        c.clone()
                    }
                })
                .collect();
            NodeDef::with_children(inner, children)
        }
        Tag::Query => NodeDef::node(
            Tag::Query,
            vec![NodeDef::node(Tag::UnifyBody, inner.children().to_vec())],
        ),
        _ => inner.clone(),
    };
    NodeDef::node(Tag::Top, vec![rebuilt])
}

fn is_operand(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::Term | Tag::ExprCall | Tag::ExprInfix | Tag::UnaryExpr | Tag::Membership | Tag::Expr
    )
}

/// Whether a ref's final argument is a bracket, splitting it into prefix and
/// key for partial rules.
fn split_trailing_bracket(ref_node: &Node) -> Option<(Node, Node)> {
    let argseq = ref_node.expect(Tag::RefArgSeq);
    let last = argseq.children().last()?;
    if !last.is(Tag::RefArgBrack) {
        return None;
    }
    let prefix_args = argseq.children()[..argseq.len() - 1].to_vec();
    let prefix = NodeDef::node(
        Tag::Ref,
        vec![
            ref_node.expect(Tag::RefHead).clone(),
            NodeDef::node(Tag::RefArgSeq, prefix_args),
        ],
    );
    Some((prefix, last.front().clone()))
}

/// The rule ref for a head term, reduced to `Var` when the ref is bare.
fn to_rule_ref(term: &Node) -> Node {
    let inner = term.front();
    match inner.tag() {
        Tag::Ref => {
            if inner.expect(Tag::RefArgSeq).is_empty() {
                NodeDef::node(Tag::RuleRef, vec![inner.expect(Tag::RefHead).front().clone()])
            } else {
                NodeDef::node(Tag::RuleRef, vec![inner.clone()])
            }
        }
        _ => NodeDef::node(Tag::RuleRef, vec![inner.clone()]),
    }
}

struct Head {
    rule_ref: Node,
    head_type: Node,
}

fn classify_head(ctx: &mut ReaderCtx, expr: &Node, op_tag: Tag, value: Node) -> Option<Head> {
    let inner = match expr.tag() {
        Tag::Expr => expr.front(),
        _ => expr,
    };

    match inner.tag() {
        Tag::Term => {
            let term = inner;
            match term.front().tag() {
                Tag::Var => Some(Head {
                    rule_ref: to_rule_ref(term),
                    head_type: NodeDef::node(
                        Tag::RuleHeadComp,
                        vec![assign_op(op_tag), value],
                    ),
                }),
                Tag::Ref => {
                    let ref_node = term.front();
                    match split_trailing_bracket(ref_node) {
                        Some((prefix, key)) if op_tag != Tag::Empty => {
                            // `p[k] := v` and friends: a partial object.
                            Some(Head {
                                rule_ref: to_rule_ref(&NodeDef::node(
                                    Tag::Term,
                                    vec![prefix],
                                )),
                                head_type: NodeDef::node(
                                    Tag::RuleHeadObj,
                                    vec![key, assign_op(op_tag), value],
                                ),
                            })
                        }
                        _ => Some(Head {
                            rule_ref: to_rule_ref(term),
                            head_type: NodeDef::node(
                                Tag::RuleHeadComp,
                                vec![
                                    assign_op(if op_tag == Tag::Empty {
                                        Tag::Assign
                                    } else {
                                        op_tag
                                    }),
                                    value,
                                ],
                            ),
                        }),
                    }
                }
                _ => {
                    ctx.error(ErrorKind::RegoParse, "invalid rule head", term);
                    None
                }
            }
        }
        Tag::ExprCall => {
            let callee = inner.front();
            let exprseq = inner.back();
            let mut args = vec![];
            for arg in exprseq.children() {
                let arg_inner = if arg.is(Tag::Expr) { arg.front() } else { arg };
                if arg_inner.is(Tag::Term) {
                    args.push(arg_inner.clone());
                } else {
                    ctx.error(
                        ErrorKind::RegoParse,
                        "function arguments must be terms",
                        arg,
                    );
                }
            }
            Some(Head {
                rule_ref: to_rule_ref(&NodeDef::node(Tag::Term, vec![callee.clone()])),
                head_type: NodeDef::node(
                    Tag::RuleHeadFunc,
                    vec![
                        NodeDef::node(Tag::RuleArgs, args),
                        assign_op(if op_tag == Tag::Empty { Tag::Assign } else { op_tag }),
                        value,
                    ],
                ),
            })
        }
        _ => {
            ctx.error(ErrorKind::RegoParse, "invalid rule head", inner);
            None
        }
    }
}

fn classify_rule(ctx: &mut ReaderCtx, group: &Node) -> Option<Node> {
    let children = group.children();
    if children.is_empty() {
        return None;
    }

    let mut i = 0;
    let mut default_flag = empty();
    if children[0].is(Tag::Default) {
        default_flag = NodeDef::synthetic(Tag::Default, "default");
        i = 1;
    }

    if i >= children.len() {
        ctx.error(ErrorKind::RegoParse, "expected rule after `default`", group);
        return None;
    }

    // Head: either `x contains v ...` or a single head expression.
    let head = if children[i].is(Tag::Term)
        && matches!(children.get(i + 1), Some(c) if c.is(Tag::Contains))
    {
        let term = &children[i];
        let item = match children.get(i + 2) {
            Some(item) if is_operand(item.tag()) => to_expr(item),
            _ => {
                ctx.error(
                    ErrorKind::RegoParse,
                    "expected value after `contains`",
                    &children[i + 1],
                );
                return None;
            }
        };
        i += 3;
        Some(Head {
            rule_ref: to_rule_ref(term),
            head_type: NodeDef::node(Tag::RuleHeadSet, vec![item]),
        })
    } else {
        let head_expr = &children[i];
        i += 1;
        match head_expr.tag() {
            Tag::ExprInfix => {
                let op = head_expr.expect(Tag::InfixOperator).front();
                if op.is(Tag::AssignOperator) {
                    let op_tag = op.front().tag();
                    classify_head(
                        ctx,
                        head_expr.front(),
                        op_tag,
                        head_expr.back().clone(),
                    )
                } else {
                    ctx.error(ErrorKind::RegoParse, "invalid rule head", head_expr);
                    None
                }
            }
            Tag::Term => {
                // `p[x]` without a value is a v0 partial set.
                let term = head_expr;
                if term.front().is(Tag::Ref) {
                    if let Some((prefix, key)) = split_trailing_bracket(term.front()) {
                        Some(Head {
                            rule_ref: to_rule_ref(&NodeDef::node(Tag::Term, vec![prefix])),
                            head_type: NodeDef::node(Tag::RuleHeadSet, vec![key]),
                        })
                    } else {
                        classify_head(ctx, head_expr, Tag::Empty, true_expr())
                    }
                } else {
                    classify_head(ctx, head_expr, Tag::Empty, true_expr())
                }
            }
            Tag::ExprCall => classify_head(ctx, head_expr, Tag::Empty, true_expr()),
            _ => {
                ctx.error(ErrorKind::RegoParse, "invalid rule", head_expr);
                None
            }
        }
    };
    let head = head?;

    let mut has_if = false;
    if matches!(children.get(i), Some(c) if c.is(Tag::If)) {
        has_if = true;
        i += 1;
    }

    let mut body = empty();
    if let Some(next) = children.get(i) {
        if next.is(Tag::UnifyBody) {
            body = next.clone();
            i += 1;
            if ctx.strict && !has_if && default_flag.is(Tag::Empty) {
                ctx.error(
                    ErrorKind::RegoParse,
                    "`if` keyword is required before rule body",
                    group,
                );
            }
        } else if has_if && is_operand(next.tag()) {
            // `p if x == 1`: a braceless single-statement body.
            let mut stmt = vec![next.clone()];
            if matches!(children.get(i + 1), Some(w) if w.is(Tag::WithSeq)) {
                stmt.push(children[i + 1].clone());
                i += 1;
            }
            body = NodeDef::node(Tag::UnifyBody, vec![NodeDef::node(Tag::Group, stmt)]);
            i += 1;
        }
    }

    if has_if && body.is(Tag::Empty) {
        ctx.error(ErrorKind::RegoParse, "expected rule body after `if`", group);
    }

    let mut elses = vec![];
    while matches!(children.get(i), Some(c) if c.is(Tag::Else)) {
        elses.push(children[i].clone());
        i += 1;
    }

    // A bodiless rule may carry `with` modifiers; they scope the head value,
    // which moves into a synthesized body.
    let mut head = head;
    if matches!(children.get(i), Some(c) if c.is(Tag::WithSeq)) {
        let withseq = children[i].clone();
        i += 1;
        if !body.is(Tag::Empty) || !elses.is_empty() {
            ctx.error(
                ErrorKind::RegoParse,
                "`with` modifiers only apply to bodiless rules or body statements",
                &withseq,
            );
        } else {
            match lower_head_with(ctx, &mut head, withseq) {
                Some(with_body) => body = with_body,
                None => (),
            }
        }
    }

    if i != children.len() {
        ctx.error(
            ErrorKind::RegoParse,
            "unexpected tokens after rule",
            &children[i],
        );
    }

    if !default_flag.is(Tag::Empty) && !body.is(Tag::Empty) {
        ctx.error(
            ErrorKind::RegoParse,
            "default rules must not have a body",
            group,
        );
    }

    Some(NodeDef::node(
        Tag::Rule,
        vec![
            default_flag,
            NodeDef::node(Tag::RuleHead, vec![head.rule_ref, head.head_type]),
            body,
            NodeDef::node(Tag::ElseSeq, elses),
        ],
    ))
}

/// `v := E with T as W`: the head value evaluates under the overlay, so it
/// moves into a synthesized body that binds a fresh local.
fn lower_head_with(ctx: &mut ReaderCtx, head: &mut Head, withseq: Node) -> Option<Node> {
    let head_type = head.head_type.clone();
    if !matches!(head_type.tag(), Tag::RuleHeadComp | Tag::RuleHeadFunc) {
        ctx.error(
            ErrorKind::RegoParse,
            "`with` modifiers are not supported on partial rule heads",
            &withseq,
        );
        return None;
    }

    let value = head_type.back().clone();
    let holder = ctx.fresh.fresh_var("withvalue");

    let mut children: Vec<Node> = head_type.children().to_vec();
    let last = children.len() - 1;
    children[last] = to_expr(&NodeDef::node(Tag::Term, vec![holder.clone()]));
    head.head_type = NodeDef::with_children(&head_type, children);

    let assign = NodeDef::node(
        Tag::ExprInfix,
        vec![
            to_expr(&NodeDef::node(Tag::Term, vec![holder])),
            NodeDef::node(
                Tag::InfixOperator,
                vec![assign_op(Tag::Assign)],
            ),
            value,
        ],
    );
    Some(NodeDef::node(
        Tag::UnifyBody,
        vec![NodeDef::node(
            Tag::Literal,
            vec![NodeDef::node(Tag::Expr, vec![assign]), withseq],
        )],
    ))
}

/// Pass 15, *literals*.
pub fn literals(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| literals(ctx, child.clone()));
    if !node.is(Tag::UnifyBody) {
        return node;
    }

    if node.is_empty() {
        ctx.error(ErrorKind::RegoParse, "empty body", &node);
    }

    let mut out = vec![];
    for group in node.children() {
        if group.is(Tag::Literal) {
            out.push(group.clone());
            continue;
        }
        if !group.is(Tag::Group) {
            // A bare statement node, e.g. a SomeDecl hoisted directly.
            out.push(NodeDef::node(
                Tag::Literal,
                vec![group.clone(), NodeDef::node(Tag::WithSeq, vec![])],
            ));
            continue;
        }

        let mut payload: Option<Node> = None;
        let mut withseq = NodeDef::node(Tag::WithSeq, vec![]);
        for child in group.children() {
            match child.tag() {
                Tag::WithSeq => withseq = child.clone(),
                Tag::Group if child.len() == 1 => {
                    set_payload(ctx, &mut payload, child.front(), group)
                }
                _ => set_payload(ctx, &mut payload, child, group),
            }
        }

        let payload = match payload {
            Some(p) => p,
            None => {
                ctx.error(ErrorKind::RegoParse, "expected statement", group);
                continue;
            }
        };

        out.push(NodeDef::node(Tag::Literal, vec![payload, withseq]));
    }

    NodeDef::with_children(&node, out)
}

fn set_payload(ctx: &mut ReaderCtx, payload: &mut Option<Node>, child: &Node, group: &Node) {
    if payload.is_some() {
        ctx.error(ErrorKind::RegoParse, "expected a single statement", group);
        return;
    }
    let node = match child.tag() {
        Tag::ExprInfix
        | Tag::Term
        | Tag::ExprCall
        | Tag::Membership
        | Tag::UnaryExpr
        | Tag::ExprEvery => to_expr(child),
        Tag::Expr | Tag::NotExpr | Tag::SomeDecl | Tag::SomeExpr => child.clone(),
        _ => {
            ctx.error(ErrorKind::RegoParse, "invalid statement", child);
            return;
        }
    };
    *payload = Some(node);
}

/// Pass 16, *structure*.
pub fn structure(ctx: &mut ReaderCtx, top: Node) -> Node {
    let inner = top.front();
    if !inner.is(Tag::Module) {
        return top;
    }

    let children: Vec<Node> = inner
        .children()
        .iter()
        .map(|child| match child.tag() {
            Tag::Package => normalize_package(ctx, child),
            Tag::ImportSeq => {
                let imports: Vec<Node> = child
                    .children()
                    .iter()
                    .filter_map(|import| normalize_import(ctx, import))
                    .collect();
                NodeDef::node(Tag::ImportSeq, imports)
            }
            _ => child.clone(),
        })
        .collect();

    NodeDef::node(Tag::Top, vec![NodeDef::with_children(inner, children)])
}

fn to_ref(node: &Node) -> Option<Node> {
    let inner = if node.is(Tag::Term) { node.front() } else { node };
    match inner.tag() {
        Tag::Ref => Some(inner.clone()),
        Tag::Var => Some(NodeDef::node(
            Tag::Ref,
            vec![
                NodeDef::node(Tag::RefHead, vec![inner.clone()]),
                NodeDef::node(Tag::RefArgSeq, vec![]),
            ],
        )),
        _ => None,
    }
}

fn normalize_package(ctx: &mut ReaderCtx, package: &Node) -> Node {
    let group = package.front();
    if group.is(Tag::Ref) {
        return package.clone();
    }
    if group.len() == 1 {
        if let Some(r) = to_ref(group.front()) {
            return NodeDef::node(Tag::Package, vec![r]);
        }
    }
    ctx.error(ErrorKind::RegoParse, "invalid package name", package);
    NodeDef::node(
        Tag::Package,
        vec![NodeDef::node(
            Tag::Ref,
            vec![
                NodeDef::node(Tag::RefHead, vec![NodeDef::synthetic(Tag::Var, "error")]),
                NodeDef::node(Tag::RefArgSeq, vec![]),
            ],
        )],
    )
}

fn normalize_import(ctx: &mut ReaderCtx, import: &Node) -> Option<Node> {
    let group = import.front();
    let children = group.children();

    let path = match children.first().and_then(to_ref) {
        Some(path) => path,
        None => {
            ctx.error(ErrorKind::RegoParse, "invalid import path", import);
            return None;
        }
    };

    let root = path.expect(Tag::RefHead).front().text().to_string();
    if root != "data" && root != "input" {
        ctx.error(
            ErrorKind::RegoCompile,
            format!("unexpected import path: {root}"),
            import,
        );
        return None;
    }

    let alias = match children.get(1) {
        Some(as_tok) if as_tok.is(Tag::As) => match children.get(2) {
            Some(alias) => {
                let inner = if alias.is(Tag::Term) {
                    alias.front()
                } else {
                    alias
                };
                if inner.is(Tag::Var) {
                    inner.clone()
                } else {
                    ctx.error(ErrorKind::RegoParse, "invalid import alias", import);
                    return None;
                }
            }
            None => {
                ctx.error(ErrorKind::RegoParse, "expected alias after `as`", import);
                return None;
            }
        },
        Some(other) => {
            ctx.error(ErrorKind::RegoParse, "invalid import", other);
            return None;
        }
        None => NodeDef::synthetic(Tag::Undefined, ""),
    };

    Some(NodeDef::node(Tag::Import, vec![path, alias]))
}
