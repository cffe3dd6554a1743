// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pass 3, *some_every*: fold `some x, y [in e]` and
//! `every k, v in e { body }` into typed nodes carrying a `VarSeq`.

use super::{map_children, ReaderCtx};
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;

pub fn some_every(ctx: &mut ReaderCtx, node: Node) -> Node {
    if node.is(Tag::Group) {
        return rewrite_group(ctx, &node);
    }
    map_children(&node, |child| some_every(ctx, child.clone()))
}

fn rewrite_group(ctx: &mut ReaderCtx, group: &Node) -> Node {
    let children = group.children();
    let mut out: Vec<Node> = vec![];
    let mut i = 0;

    while i < children.len() {
        let child = &children[i];
        match child.tag() {
            Tag::Some => {
                let (decl, consumed) = fold_some(ctx, &children[i..]);
                out.push(decl);
                i += consumed;
            }
            Tag::Every => {
                let (every, consumed) = fold_every(ctx, &children[i..]);
                out.push(every);
                i += consumed;
            }
            _ => {
                out.push(some_every(ctx, child.clone()));
                i += 1;
            }
        }
    }

    NodeDef::with_children(group, out)
}

/// `some x, y` or `some x, y in e`; the tail after `in` is the domain group.
fn fold_some(ctx: &mut ReaderCtx, tokens: &[Node]) -> (Node, usize) {
    let mut vars: Vec<Node> = vec![];
    let mut i = 1;
    while i < tokens.len() && tokens[i].is(Tag::Var) {
        vars.push(tokens[i].clone());
        i += 1;
    }

    if vars.is_empty() {
        ctx.error(
            ErrorKind::RegoParse,
            "expected at least one variable after `some`",
            &tokens[0],
        );
    }

    let varseq = NodeDef::node(Tag::VarSeq, vars);

    if i < tokens.len() && tokens[i].is(Tag::IsIn) {
        let domain: Vec<Node> = tokens[i + 1..]
            .iter()
            .map(|t| some_every(ctx, t.clone()))
            .collect();
        if domain.is_empty() {
            ctx.error(
                ErrorKind::RegoParse,
                "expected a collection after `in`",
                &tokens[i],
            );
        }
        let decl = NodeDef::node(
            Tag::SomeDecl,
            vec![varseq, NodeDef::node(Tag::Group, domain)],
        );
        (decl, tokens.len())
    } else {
        if i != tokens.len() {
            ctx.error(
                ErrorKind::RegoParse,
                "unexpected token in `some` declaration",
                &tokens[i],
            );
        }
        let decl = NodeDef::node(
            Tag::SomeDecl,
            vec![varseq, NodeDef::synthetic(Tag::Undefined, "")],
        );
        (decl, tokens.len())
    }
}

/// `every v in e { body }` or `every k, v in e { body }`.
fn fold_every(ctx: &mut ReaderCtx, tokens: &[Node]) -> (Node, usize) {
    let mut vars: Vec<Node> = vec![];
    let mut i = 1;
    while i < tokens.len() && tokens[i].is(Tag::Var) {
        vars.push(tokens[i].clone());
        i += 1;
    }

    if vars.is_empty() || vars.len() > 2 {
        ctx.error(
            ErrorKind::RegoParse,
            "`every` takes one or two variables",
            &tokens[0],
        );
    }

    if i >= tokens.len() || !tokens[i].is(Tag::IsIn) {
        ctx.error(ErrorKind::RegoParse, "expected `in` after `every`", &tokens[0]);
        return (NodeDef::node(Tag::Group, vec![]), tokens.len());
    }
    i += 1;

    let mut domain: Vec<Node> = vec![];
    while i < tokens.len() && !tokens[i].is(Tag::Brace) {
        domain.push(some_every(ctx, tokens[i].clone()));
        i += 1;
    }

    if i >= tokens.len() {
        ctx.error(
            ErrorKind::RegoParse,
            "expected a body after `every`",
            &tokens[0],
        );
        return (NodeDef::node(Tag::Group, vec![]), tokens.len());
    }

    let body = some_every(ctx, tokens[i].clone());
    i += 1;

    let every = NodeDef::node(
        Tag::ExprEvery,
        vec![
            NodeDef::node(Tag::VarSeq, vars),
            NodeDef::node(Tag::Group, domain),
            body,
        ],
    );
    (every, i)
}
