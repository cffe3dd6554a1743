// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Passes 9–13: lower membership (`x in e`), classify assignment operators,
//! fold `else` chains and `not`, collapse leftover groups into expressions,
//! and lower `with` modifiers onto their statements.

use super::{map_children, ReaderCtx};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;
use crate::reader::terms::to_expr;

fn is_operand(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::Term
            | Tag::ExprCall
            | Tag::ExprInfix
            | Tag::UnaryExpr
            | Tag::Group
            | Tag::ExprEvery
            | Tag::Membership
            | Tag::Expr
    )
}

/// Pass 9, *membership*: `x in e` becomes a `Membership` expression.
pub fn membership(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| membership(ctx, child.clone()));
    if !node.is(Tag::Group) {
        return node;
    }

    let mut children: Vec<Node> = node.children().to_vec();
    loop {
        let mut folded = false;
        for i in 1..children.len().saturating_sub(1) {
            if children[i].is(Tag::IsIn)
                && is_operand(children[i - 1].tag())
                && is_operand(children[i + 1].tag())
            {
                let m = NodeDef::node(
                    Tag::Membership,
                    vec![
                        NodeDef::synthetic(Tag::Undefined, ""),
                        to_expr(&children[i - 1]),
                        to_expr(&children[i + 1]),
                    ],
                );
                children.splice(i - 1..=i + 1, [m]);
                folded = true;
                break;
            }
        }
        if !folded {
            return NodeDef::with_children(&node, children);
        }
    }
}

/// Pass 10, *assign*: classify `:=` and `=` into assignment infixes.
pub fn assign(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| assign(ctx, child.clone()));
    if !node.is(Tag::Group) {
        return node;
    }

    let mut children: Vec<Node> = node.children().to_vec();
    loop {
        let mut folded = false;
        for i in 1..children.len().saturating_sub(1) {
            if matches!(children[i].tag(), Tag::Assign | Tag::Unify)
                && is_operand(children[i - 1].tag())
                && is_operand(children[i + 1].tag())
            {
                let infix = NodeDef::node(
                    Tag::ExprInfix,
                    vec![
                        to_expr(&children[i - 1]),
                        NodeDef::node(
                            Tag::InfixOperator,
                            vec![NodeDef::node(Tag::AssignOperator, vec![children[i].clone()])],
                        ),
                        to_expr(&children[i + 1]),
                    ],
                );
                children.splice(i - 1..=i + 1, [infix]);
                folded = true;
                break;
            }
        }
        if !folded {
            return NodeDef::with_children(&node, children);
        }
    }
}

/// The variable a simple assignment target starts with, if any.
fn assign_target_root(expr: &Node) -> Option<String> {
    let mut node = expr.clone();
    loop {
        match node.tag() {
            Tag::Expr | Tag::Term => {
                node = node.front().clone();
            }
            Tag::Var => return Some(node.text().to_string()),
            Tag::Ref => {
                node = node.expect(Tag::RefHead).front().clone();
            }
            _ => return None,
        }
    }
}

/// Pass 11, *else_not*: fold `else [:= e] [if body]` segments and statement
/// negation; reject shadowing of `input`/`data` in strict mode.
pub fn else_not(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| else_not(ctx, child.clone()));

    // Strict-mode shadowing check on every assignment infix.
    if node.is(Tag::ExprInfix) && ctx.strict {
        let op = node.expect(Tag::InfixOperator).front();
        if op.is(Tag::AssignOperator) {
            if let Some(root) = assign_target_root(node.front()) {
                if root == "input" || root == "data" {
                    ctx.error(
                        ErrorKind::RegoCompile,
                        format!("variables must not shadow {root} (use a different variable name)"),
                        &node,
                    );
                }
            }
        }
    }

    if !node.is(Tag::Group) {
        return node;
    }

    let children = node.children();
    let mut out: Vec<Node> = vec![];
    let mut i = 0;

    while i < children.len() {
        let child = &children[i];

        // `not e`, optionally followed by `with` modifiers.
        if child.is(Tag::Not) && i == 0 {
            match children.get(i + 1) {
                Some(next) if is_operand(next.tag()) => {
                    out.push(NodeDef::node(Tag::NotExpr, vec![to_expr(next)]));
                    i += 2;
                    continue;
                }
                _ => {
                    ctx.error(ErrorKind::RegoParse, "expected expression after `not`", child);
                    i += 1;
                    continue;
                }
            }
        }

        if child.is(Tag::Else) {
            let mut j = i + 1;
            let mut value = NodeDef::synthetic(Tag::Empty, "");
            if matches!(children.get(j), Some(c) if matches!(c.tag(), Tag::Assign | Tag::Unify)) {
                match children.get(j + 1) {
                    Some(v) if is_operand(v.tag()) => {
                        value = to_expr(v);
                        j += 2;
                    }
                    _ => {
                        ctx.error(
                            ErrorKind::RegoParse,
                            "expected value after `else :=`",
                            child,
                        );
                        j += 1;
                    }
                }
            }
            if matches!(children.get(j), Some(c) if c.is(Tag::If)) {
                j += 1;
            }
            let mut body = NodeDef::synthetic(Tag::Empty, "");
            if matches!(children.get(j), Some(c) if c.is(Tag::UnifyBody)) {
                body = children[j].clone();
                j += 1;
            }
            if value.is(Tag::Empty) && body.is(Tag::Empty) {
                ctx.error(
                    ErrorKind::RegoParse,
                    "expected value or body after `else`",
                    child,
                );
            }
            out.push(NodeDef::node(Tag::Else, vec![value, body]));
            i = j;
            continue;
        }

        out.push(child.clone());
        i += 1;
    }

    NodeDef::with_children(&node, out)
}

/// A group that should hold exactly one expression.
fn group_to_expr(ctx: &mut ReaderCtx, group: &Node) -> Node {
    let mut node = group.clone();
    while node.is(Tag::Group) {
        match node.len() {
            1 => node = node.front().clone(),
            0 => {
                ctx.error(ErrorKind::RegoParse, "expected an expression", group);
                return NodeDef::node(
                    Tag::Expr,
                    vec![NodeDef::node(
                        Tag::Term,
                        vec![NodeDef::node(
                            Tag::Scalar,
                            vec![NodeDef::synthetic(Tag::True, "true")],
                        )],
                    )],
                );
            }
            _ => {
                ctx.error(
                    ErrorKind::RegoParse,
                    "expected a single expression",
                    group,
                );
                node = node.front().clone();
            }
        }
    }
    to_expr(&node)
}

/// Pass 12, *collections*: every container position that still holds a raw
/// group becomes an explicit expression; `some ... in` declarations become
/// `SomeExpr` iteration nodes; `every` takes its final shape.
pub fn collections(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| collections(ctx, child.clone()));

    match node.tag() {
        Tag::Array | Tag::Set => {
            let children = node
                .children()
                .iter()
                .map(|g| {
                    if g.is(Tag::Group) {
                        group_to_expr(ctx, g)
                    } else {
                        g.clone()
                    }
                })
                .collect();
            NodeDef::with_children(&node, children)
        }
        Tag::ObjectItem | Tag::ExprSeq => {
            let children = node
                .children()
                .iter()
                .map(|g| {
                    if g.is(Tag::Group) {
                        group_to_expr(ctx, g)
                    } else {
                        g.clone()
                    }
                })
                .collect();
            NodeDef::with_children(&node, children)
        }
        Tag::RefArgBrack => {
            if node.front().is(Tag::Group) {
                NodeDef::node(Tag::RefArgBrack, vec![group_to_expr(ctx, node.front())])
            } else {
                node
            }
        }
        Tag::RefHead => {
            // Parenthesized ref heads resolve to their inner expression.
            if node.front().is(Tag::Group) {
                let expr = group_to_expr(ctx, node.front());
                let mut head = expr.front().clone();
                if head.is(Tag::Term) {
                    head = head.front().clone();
                }
                NodeDef::node(Tag::RefHead, vec![head])
            } else {
                node
            }
        }
        Tag::ArrayCompr | Tag::SetCompr | Tag::ObjectCompr => {
            let children = node
                .children()
                .iter()
                .map(|c| {
                    if c.is(Tag::Group) {
                        group_to_expr(ctx, c)
                    } else {
                        c.clone()
                    }
                })
                .collect();
            NodeDef::with_children(&node, children)
        }
        Tag::SomeDecl => {
            let varseq = node.child(0);
            let domain = node.child(1);
            if domain.is(Tag::Undefined) {
                return NodeDef::node(Tag::SomeDecl, vec![varseq.clone()]);
            }
            let domain = if domain.is(Tag::Group) {
                group_to_expr(ctx, domain)
            } else {
                to_expr(domain)
            };
            let vars = varseq.children();
            let (key, val) = match vars.len() {
                1 => (
                    NodeDef::synthetic(Tag::Undefined, ""),
                    to_expr(&NodeDef::node(Tag::Term, vec![vars[0].clone()])),
                ),
                2 => (
                    to_expr(&NodeDef::node(Tag::Term, vec![vars[0].clone()])),
                    to_expr(&NodeDef::node(Tag::Term, vec![vars[1].clone()])),
                ),
                _ => {
                    ctx.error(
                        ErrorKind::RegoParse,
                        "`some ... in` takes one or two variables",
                        &node,
                    );
                    (
                        NodeDef::synthetic(Tag::Undefined, ""),
                        to_expr(&NodeDef::node(
                            Tag::Term,
                            vec![vars.first().cloned().unwrap_or_else(|| {
                                NodeDef::synthetic(Tag::Var, "error")
                            })],
                        )),
                    )
                }
            };
            NodeDef::node(Tag::SomeExpr, vec![key, val, domain])
        }
        Tag::ExprEvery => {
            // (VarSeq, domain group, body) -> (VarSeq, body, domain expr)
            if node.child(1).is(Tag::Group) {
                let varseq = node.child(0).clone();
                let domain = group_to_expr(ctx, node.child(1));
                let body = node.child(2).clone();
                NodeDef::node(Tag::ExprEvery, vec![varseq, body, domain])
            } else {
                node
            }
        }
        Tag::Expr => {
            // Flatten nested parenthesized groups.
            if node.len() == 1 && node.front().is(Tag::Group) {
                group_to_expr(ctx, node.front())
            } else {
                node
            }
        }
        _ => node,
    }
}

/// Pass 13, *lines*: attach `with T as E` modifier chains to their
/// statements as a `WithSeq`.
pub fn lines(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| lines(ctx, child.clone()));
    if !node.is(Tag::Group) {
        return node;
    }

    let children = node.children();
    let Some(first_with) = children.iter().position(|c| c.is(Tag::With)) else {
        return node;
    };

    let core: Vec<Node> = children[..first_with].to_vec();
    let mut withs: Vec<Node> = vec![];
    let mut i = first_with;
    while i < children.len() {
        if !children[i].is(Tag::With) {
            ctx.error(
                ErrorKind::RegoParse,
                "expected `with` modifier",
                &children[i],
            );
            break;
        }
        let target = match children.get(i + 1) {
            Some(t) if t.is(Tag::Term) => t.clone(),
            _ => {
                ctx.error(
                    ErrorKind::RegoParse,
                    "expected target after `with`",
                    &children[i],
                );
                break;
            }
        };
        if !matches!(children.get(i + 2), Some(a) if a.is(Tag::As)) {
            ctx.error(
                ErrorKind::RegoParse,
                "expected `as` in `with` modifier",
                &children[i],
            );
            break;
        }
        let value = match children.get(i + 3) {
            Some(v) if is_operand(v.tag()) => to_expr(v),
            _ => {
                ctx.error(
                    ErrorKind::RegoParse,
                    "expected value after `as`",
                    &children[i],
                );
                break;
            }
        };
        withs.push(NodeDef::node(Tag::With, vec![target, value]));
        i += 4;
    }

    let mut out = core;
    out.push(NodeDef::node(Tag::WithSeq, withs));
    NodeDef::with_children(&node, out)
}
