// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pass 4, *ref_args*: attach dotted (`.x`) and bracketed (`[e]`) arguments
//! to the token that carries them. Pass 5, *refs*: reassemble carrier and
//! argument runs into `Ref(RefHead, RefArgSeq)` and call syntax into
//! `ExprCall(Ref, ExprSeq)`, leaving bare vars alone.

use super::{map_children, ReaderCtx};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;

fn is_carrier(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::Var | Tag::Square | Tag::Brace | Tag::Paren | Tag::EmptySet
    )
}

fn is_ref_arg(tag: Tag) -> bool {
    matches!(tag, Tag::RefArgDot | Tag::RefArgBrack)
}

pub fn ref_args(ctx: &mut ReaderCtx, node: Node) -> Node {
    if node.is(Tag::Group) {
        return rewrite_group(ctx, &node);
    }
    map_children(&node, |child| ref_args(ctx, child.clone()))
}

fn rewrite_group(ctx: &mut ReaderCtx, group: &Node) -> Node {
    let children = group.children();
    let mut out: Vec<Node> = vec![];
    let mut i = 0;

    while i < children.len() {
        let child = &children[i];
        let prev_attaches = out
            .last()
            .map(|p| is_carrier(p.tag()) || is_ref_arg(p.tag()))
            .unwrap_or(false);

        if child.is(Tag::Dot) && prev_attaches {
            match children.get(i + 1) {
                Some(next) if next.is(Tag::Var) => {
                    out.push(NodeDef::node(Tag::RefArgDot, vec![next.clone()]));
                    i += 2;
                    continue;
                }
                _ => {
                    ctx.error(ErrorKind::RegoParse, "expected identifier after `.`", child);
                    i += 1;
                    continue;
                }
            }
        }

        if child.is(Tag::Square) && prev_attaches {
            out.push(to_bracket(ctx, child));
            i += 1;
            continue;
        }

        out.push(ref_args(ctx, child.clone()));
        i += 1;
    }

    NodeDef::with_children(group, out)
}

fn to_bracket(ctx: &mut ReaderCtx, square: &Node) -> Node {
    if square.len() != 1 || !square.front().is(Tag::Group) {
        ctx.error(
            ErrorKind::RegoParse,
            "expected a single expression inside `[...]`",
            square,
        );
        return NodeDef::node(Tag::RefArgBrack, vec![NodeDef::node(Tag::Group, vec![])]);
    }
    let inner = ref_args(ctx, square.front().clone());
    NodeDef::node(Tag::RefArgBrack, vec![inner])
}

pub fn refs(ctx: &mut ReaderCtx, node: Node) -> Node {
    // Assemble bottom-up so nested groups are finished first.
    let node = map_children(&node, |child| refs(ctx, child.clone()));
    if !node.is(Tag::Group) {
        return node;
    }

    let children = node.children();
    let mut out: Vec<Node> = vec![];
    let mut i = 0;

    while i < children.len() {
        let child = &children[i];
        if !is_carrier(child.tag()) {
            out.push(child.clone());
            i += 1;
            continue;
        }

        let head = child.clone();
        i += 1;

        let mut args: Vec<Node> = vec![];
        while i < children.len() && is_ref_arg(children[i].tag()) {
            args.push(children[i].clone());
            i += 1;
        }

        // A parenthesized argument list directly after the name is a call.
        let assembled = if i < children.len()
            && children[i].is(Tag::Paren)
            && head.is(Tag::Var)
        {
            let callee = NodeDef::node(
                Tag::Ref,
                vec![
                    NodeDef::node(Tag::RefHead, vec![head]),
                    NodeDef::node(Tag::RefArgSeq, args),
                ],
            );
            let exprseq = paren_to_exprseq(ctx, &children[i]);
            i += 1;
            let call = NodeDef::node(Tag::ExprCall, vec![callee, exprseq]);

            // The call result itself may carry further ref arguments.
            let mut post: Vec<Node> = vec![];
            while i < children.len() && is_ref_arg(children[i].tag()) {
                post.push(children[i].clone());
                i += 1;
            }
            if post.is_empty() {
                call
            } else {
                NodeDef::node(
                    Tag::Ref,
                    vec![
                        NodeDef::node(Tag::RefHead, vec![call]),
                        NodeDef::node(Tag::RefArgSeq, post),
                    ],
                )
            }
        } else if args.is_empty() {
            head
        } else {
            NodeDef::node(
                Tag::Ref,
                vec![
                    NodeDef::node(Tag::RefHead, vec![head]),
                    NodeDef::node(Tag::RefArgSeq, args),
                ],
            )
        };

        out.push(assembled);
    }

    NodeDef::with_children(&node, out)
}

fn paren_to_exprseq(ctx: &mut ReaderCtx, paren: &Node) -> Node {
    let mut groups: Vec<Node> = vec![];
    for child in paren.children() {
        match child.tag() {
            Tag::List => groups.extend(child.children().iter().cloned()),
            Tag::Group => groups.push(child.clone()),
            _ => ctx.error(ErrorKind::RegoParse, "malformed argument list", paren),
        }
    }
    NodeDef::node(Tag::ExprSeq, groups)
}
