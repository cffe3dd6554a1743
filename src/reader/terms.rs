// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pass 7, *terms*: wrap terminals in `Term`/`Scalar`. Passes 8–11 apply
//! operator precedence by iteratively grouping operands into `ExprInfix`:
//! unary minus first, then `* / % &`, then `+ - |`, then comparisons.

use super::{is_operator, map_children, ReaderCtx};
use crate::ast::{Node, NodeDef, Tag};

pub fn terms(ctx: &mut ReaderCtx, node: Node) -> Node {
    if node.is(Tag::Group) {
        let children = node
            .children()
            .iter()
            .map(|child| wrap(ctx, child))
            .collect();
        return NodeDef::with_children(&node, children);
    }
    map_children(&node, |child| terms(ctx, child.clone()))
}

fn wrap(ctx: &mut ReaderCtx, child: &Node) -> Node {
    match child.tag() {
        Tag::Int | Tag::Float | Tag::JsonString | Tag::RawString | Tag::True | Tag::False
        | Tag::Null => NodeDef::node(
            Tag::Term,
            vec![NodeDef::node(Tag::Scalar, vec![child.clone()])],
        ),
        Tag::Var => NodeDef::node(Tag::Term, vec![child.clone()]),
        // A placeholder is an anonymous variable nothing else mentions.
        Tag::Placeholder => NodeDef::node(Tag::Term, vec![ctx.fresh.fresh_var("unused")]),
        Tag::Ref
        | Tag::Array
        | Tag::Object
        | Tag::Set
        | Tag::ArrayCompr
        | Tag::ObjectCompr
        | Tag::SetCompr => NodeDef::node(Tag::Term, vec![terms(ctx, child.clone())]),
        _ => terms(ctx, child.clone()),
    }
}

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

pub(crate) fn to_expr(node: &Node) -> Node {
    if node.is(Tag::Expr) {
        return node.clone();
    }
    NodeDef::node(Tag::Expr, vec![node.clone()])
}

fn operator_wrapper(op: Tag) -> Tag {
    match op {
        Tag::Add | Tag::Subtract | Tag::Multiply | Tag::Divide | Tag::Modulo => Tag::ArithOperator,
        Tag::And | Tag::Or => Tag::BinOperator,
        Tag::Assign | Tag::Unify => Tag::AssignOperator,
        _ => Tag::BoolOperator,
    }
}

fn fold_infix(group: &Node, ops: &[Tag]) -> Node {
    let mut children: Vec<Node> = group.children().to_vec();
    loop {
        let mut folded = false;
        for i in 1..children.len().saturating_sub(1) {
            if ops.contains(&children[i].tag())
                && is_operand(children[i - 1].tag())
                && is_operand(children[i + 1].tag())
            {
                let op = children[i].clone();
                let infix = NodeDef::node(
                    Tag::ExprInfix,
                    vec![
                        to_expr(&children[i - 1]),
                        NodeDef::node(
                            Tag::InfixOperator,
                            vec![NodeDef::node(operator_wrapper(op.tag()), vec![op])],
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
            return NodeDef::with_children(group, children);
        }
    }
}

fn precedence_pass(ctx: &mut ReaderCtx, node: Node, ops: &'static [Tag]) -> Node {
    let node = map_children(&node, |child| {
        precedence_pass(ctx, child.clone(), ops)
    });
    if node.is(Tag::Group) {
        return fold_infix(&node, ops);
    }
    node
}

pub fn unary(ctx: &mut ReaderCtx, node: Node) -> Node {
    let node = map_children(&node, |child| unary(ctx, child.clone()));
    if !node.is(Tag::Group) {
        return node;
    }

    let children = node.children();
    let mut out: Vec<Node> = vec![];
    let mut i = 0;
    while i < children.len() {
        let child = &children[i];
        let prefix_position = out
            .last()
            .map(|p| is_operator(p.tag()))
            .unwrap_or(true);
        if child.is(Tag::Subtract)
            && prefix_position
            && matches!(children.get(i + 1), Some(next) if is_operand(next.tag()))
        {
            out.push(NodeDef::node(
                Tag::UnaryExpr,
                vec![to_expr(&children[i + 1])],
            ));
            i += 2;
            continue;
        }
        out.push(child.clone());
        i += 1;
    }
    NodeDef::with_children(&node, out)
}

pub fn arith_bin_first(ctx: &mut ReaderCtx, node: Node) -> Node {
    precedence_pass(ctx, node, &[Tag::Multiply, Tag::Divide, Tag::Modulo, Tag::And])
}

pub fn arith_bin_second(ctx: &mut ReaderCtx, node: Node) -> Node {
    precedence_pass(ctx, node, &[Tag::Add, Tag::Subtract, Tag::Or])
}

pub fn comparison(ctx: &mut ReaderCtx, node: Node) -> Node {
    precedence_pass(
        ctx,
        node,
        &[
            Tag::Equals,
            Tag::NotEquals,
            Tag::LessThan,
            Tag::GreaterThan,
            Tag::LessThanOrEquals,
            Tag::GreaterThanOrEquals,
        ],
    )
}
