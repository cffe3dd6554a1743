// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pass 6, *groups*: resolve the remaining `Brace`/`Square`/`Paren`
//! containers. Neighbouring tokens decide between set literal and query
//! block; a `|` splitting value from body marks a comprehension.

use super::{is_operator, ReaderCtx};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;

pub fn groups(ctx: &mut ReaderCtx, top: Node) -> Node {
    let inner = top.front();
    let rebuilt = match inner.tag() {
        Tag::Module => {
            let policy = inner.expect(Tag::Policy);
            let rules: Vec<Node> = policy
                .children()
                .iter()
                .map(|g| rewrite_group(ctx, g, true))
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
        Tag::Query => {
            let stmts: Vec<Node> = inner
                .children()
                .iter()
                .map(|g| rewrite_group(ctx, g, false))
                .collect();
            NodeDef::with_children(inner, stmts)
        }
        _ => inner.clone(),
    };
    NodeDef::node(Tag::Top, vec![rebuilt])
}

fn rewrite_group(ctx: &mut ReaderCtx, group: &Node, top_level: bool) -> Node {
    let mut out: Vec<Node> = vec![];
    for child in group.children() {
        let body_allowed = top_level
            && out
                .last()
                .map(|p| !is_operator(p.tag()))
                .unwrap_or(false);
        out.push(resolve(ctx, child, body_allowed));
    }
    NodeDef::with_children(group, out)
}

fn resolve(ctx: &mut ReaderCtx, node: &Node, body_allowed: bool) -> Node {
    match node.tag() {
        Tag::Brace => resolve_brace(ctx, node, body_allowed),
        Tag::Square => resolve_square(ctx, node),
        Tag::Paren => {
            if node.len() == 1 && node.front().is(Tag::Group) {
                rewrite_group(ctx, node.front(), false)
            } else {
                ctx.error(
                    ErrorKind::RegoParse,
                    "expected a single expression inside `(...)`",
                    node,
                );
                NodeDef::node(Tag::Group, vec![])
            }
        }
        Tag::EmptySet => NodeDef::node(Tag::Set, vec![]),
        Tag::ExprEvery => {
            // every-domains are expressions; every-bodies are always bodies.
            let varseq = node.child(0).clone();
            let domain = rewrite_group(ctx, node.child(1), false);
            let body = match node.child(2).tag() {
                Tag::Brace => brace_to_body(ctx, node.child(2)),
                _ => node.child(2).clone(),
            };
            NodeDef::node(Tag::ExprEvery, vec![varseq, domain, body])
        }
        Tag::SomeDecl => {
            let varseq = node.child(0).clone();
            let domain = match node.child(1).tag() {
                Tag::Group => rewrite_group(ctx, node.child(1), false),
                _ => node.child(1).clone(),
            };
            NodeDef::node(Tag::SomeDecl, vec![varseq, domain])
        }
        Tag::Ref => {
            let head = node.expect(Tag::RefHead);
            let head = NodeDef::node(Tag::RefHead, vec![resolve(ctx, head.front(), false)]);
            let args: Vec<Node> = node
                .expect(Tag::RefArgSeq)
                .children()
                .iter()
                .map(|arg| {
                    if arg.is(Tag::RefArgBrack) {
                        NodeDef::node(
                            Tag::RefArgBrack,
                            vec![rewrite_group(ctx, arg.front(), false)],
                        )
                    } else {
                        arg.clone()
                    }
                })
                .collect();
            NodeDef::node(Tag::Ref, vec![head, NodeDef::node(Tag::RefArgSeq, args)])
        }
        Tag::ExprCall => {
            let callee = resolve(ctx, node.front(), false);
            let exprseq: Vec<Node> = node
                .back()
                .children()
                .iter()
                .map(|g| rewrite_group(ctx, g, false))
                .collect();
            NodeDef::node(
                Tag::ExprCall,
                vec![callee, NodeDef::node(Tag::ExprSeq, exprseq)],
            )
        }
        Tag::Group => rewrite_group(ctx, node, false),
        _ => node.clone(),
    }
}

/// Element groups of a container, flattening a `List` child.
fn elements(container: &Node) -> (Vec<Node>, bool) {
    let mut elems = vec![];
    let mut had_list = false;
    for child in container.children() {
        match child.tag() {
            Tag::List => {
                had_list = true;
                elems.extend(child.children().iter().cloned());
            }
            _ => elems.push(child.clone()),
        }
    }
    (elems, had_list)
}

fn has_toplevel(group: &Node, tag: Tag) -> bool {
    group.children().iter().any(|c| c.is(tag))
}

/// Split `value | body-start` at the first top-level `|`.
fn split_comprehension(group: &Node) -> Option<(Vec<Node>, Vec<Node>)> {
    let pos = group.children().iter().position(|c| c.is(Tag::Or))?;
    let value = group.children()[..pos].to_vec();
    let body = group.children()[pos + 1..].to_vec();
    Some((value, body))
}

fn resolve_brace(ctx: &mut ReaderCtx, brace: &Node, body_allowed: bool) -> Node {
    let (elems, had_list) = elements(brace);

    // Comprehension: the first group carries `value | body`.
    if !had_list && !elems.is_empty() {
        if let Some((value, body_start)) = split_comprehension(&elems[0]) {
            let mut body_groups = vec![NodeDef::node(Tag::Group, body_start)];
            body_groups.extend(elems[1..].iter().cloned());
            let body = NodeDef::node(
                Tag::UnifyBody,
                body_groups
                    .iter()
                    .map(|g| rewrite_group(ctx, g, false))
                    .collect(),
            );

            let value_group = NodeDef::node(Tag::Group, value);
            if let Some(colon) = value_group.children().iter().position(|c| c.is(Tag::Colon)) {
                let key = NodeDef::node(Tag::Group, value_group.children()[..colon].to_vec());
                let val = NodeDef::node(Tag::Group, value_group.children()[colon + 1..].to_vec());
                return NodeDef::node(
                    Tag::ObjectCompr,
                    vec![
                        rewrite_group(ctx, &key, false),
                        rewrite_group(ctx, &val, false),
                        body,
                    ],
                );
            }
            return NodeDef::node(
                Tag::SetCompr,
                vec![rewrite_group(ctx, &value_group, false), body],
            );
        }
    }

    // Object: every element is a `key: value` group.
    if !elems.is_empty() && elems.iter().all(|g| has_toplevel(g, Tag::Colon)) {
        let mut items = vec![];
        for elem in &elems {
            let colon = elem
                .children()
                .iter()
                .position(|c| c.is(Tag::Colon))
                .unwrap_or(0);
            let key = NodeDef::node(Tag::Group, elem.children()[..colon].to_vec());
            let val = NodeDef::node(Tag::Group, elem.children()[colon + 1..].to_vec());
            items.push(NodeDef::node(
                Tag::ObjectItem,
                vec![
                    rewrite_group(ctx, &key, false),
                    rewrite_group(ctx, &val, false),
                ],
            ));
        }
        return NodeDef::node(Tag::Object, items);
    }

    if body_allowed && !had_list {
        return brace_to_body(ctx, brace);
    }

    if elems.is_empty() {
        // `{}` is the empty object; the empty set is spelled `set()`.
        return NodeDef::node(Tag::Object, vec![]);
    }

    NodeDef::node(
        Tag::Set,
        elems.iter().map(|g| rewrite_group(ctx, g, false)).collect(),
    )
}

fn brace_to_body(ctx: &mut ReaderCtx, brace: &Node) -> Node {
    let (elems, _) = elements(brace);
    NodeDef::node(
        Tag::UnifyBody,
        elems.iter().map(|g| rewrite_group(ctx, g, false)).collect(),
    )
}

fn resolve_square(ctx: &mut ReaderCtx, square: &Node) -> Node {
    let (elems, had_list) = elements(square);

    if !had_list && !elems.is_empty() {
        if let Some((value, body_start)) = split_comprehension(&elems[0]) {
            let mut body_groups = vec![NodeDef::node(Tag::Group, body_start)];
            body_groups.extend(elems[1..].iter().cloned());
            let body = NodeDef::node(
                Tag::UnifyBody,
                body_groups
                    .iter()
                    .map(|g| rewrite_group(ctx, g, false))
                    .collect(),
            );
            let value_group = NodeDef::node(Tag::Group, value);
            return NodeDef::node(
                Tag::ArrayCompr,
                vec![rewrite_group(ctx, &value_group, false), body],
            );
        }
    }

    NodeDef::node(
        Tag::Array,
        elems.iter().map(|g| rewrite_group(ctx, g, false)).collect(),
    )
}
