// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *lift_functions* pass: emit exactly one IR function per rule
//! identifier. Every head of the rule (including `else` chains and partial
//! accumulations) contributes blocks to that function; a default clause adds
//! a final guarded block; the function always ends by returning its result
//! local. Functions take `(input, data, …args)`.

use std::collections::BTreeSet;

use super::opblock::FuncEmitter;
use super::{CompileCtx, RuleBodyDef, RuleDef, RuleKind};
use crate::ast::{Node, NodeDef, Tag};
use crate::bundle::{Block, Bundle, Function, Operand, Statement, StatementKind};

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

pub fn lift_functions(ctx: &mut CompileCtx, bundle: &mut Bundle) {
    let idents: Vec<String> = ctx.rules.keys().cloned().collect();
    for ident in idents {
        let rule = ctx.rules.get(&ident).expect("rule").clone();
        let function = emit_function(ctx, &rule, bundle);
        let index = bundle.functions.len();
        bundle.name_to_func.insert(function.name.clone(), index);
        bundle.functions.push(function);
    }
}

fn emit_function(ctx: &mut CompileCtx, rule: &RuleDef, bundle: &mut Bundle) -> Function {
    let package: Vec<String> = rule.path[..rule.path.len().saturating_sub(1)].to_vec();
    let mut emitter = FuncEmitter::new(ctx, package, rule.file);

    let mut parameters = vec![0, 1];
    for i in 0..rule.args.len() {
        parameters.push(emitter.slot(&format!("funcarg${i}")));
    }

    let value_hint = match rule.kind {
        RuleKind::Complete => "compvalue$",
        RuleKind::Function => "funcvalue$",
        RuleKind::PartialSet | RuleKind::DynamicSet => "setvalue$",
        RuleKind::PartialObject | RuleKind::DynamicObject => "objvalue$",
        RuleKind::Query => "queryvalue$",
    };
    let result = emitter.slot(value_hint);

    let mut blocks: Vec<Block> = vec![];

    // Aggregate heads start from an empty collection.
    match rule.kind {
        RuleKind::PartialSet => {
            blocks.push(vec![Statement::new(StatementKind::MakeSet { target: result })]);
        }
        RuleKind::PartialObject | RuleKind::DynamicObject | RuleKind::DynamicSet => {
            blocks.push(vec![Statement::new(StatementKind::MakeObject {
                target: result,
            })]);
        }
        RuleKind::Query => {
            blocks.push(vec![Statement::new(StatementKind::MakeArray {
                capacity: 0,
                target: result,
            })]);
        }
        _ => (),
    }

    for def in &rule.defs {
        blocks.push(emit_definition(&mut emitter, rule, def, result));
    }

    // The default value applies only when nothing else produced one.
    if let Some(default) = &rule.default {
        let mut block: Block = vec![Statement::new(StatementKind::IsUndefined { source: result })];
        let op = emitter.emit_expr(default, &mut block);
        block.push(Statement::new(StatementKind::AssignVar {
            source: op,
            target: result,
        }));
        blocks.push(block);
    }

    blocks.push(vec![Statement::new(StatementKind::ReturnLocal {
        source: result,
    })]);

    bundle.local_count = bundle.local_count.max(emitter.locals.len());

    let name = format!("{}.{}", rule.prefix, rule.ident);
    let mut path = vec![rule.prefix.clone()];
    path.extend(rule.path.iter().cloned());
    let arity = parameters.len();
    Function {
        name,
        path,
        parameters: parameters.clone(),
        result,
        arity,
        cacheable: arity == 2,
        blocks,
    }
}

fn emit_definition(
    emitter: &mut FuncEmitter,
    rule: &RuleDef,
    def: &RuleBodyDef,
    result: usize,
) -> Block {
    match rule.kind {
        RuleKind::Complete | RuleKind::Function => {
            if def.elses.is_empty() {
                emit_value_alternative(emitter, def.value.clone(), def.body.as_ref(), result)
            } else {
                // The first alternative that succeeds wins.
                let mut alternatives = vec![emit_value_alternative(
                    emitter,
                    def.value.clone(),
                    def.body.as_ref(),
                    result,
                )];
                for (value, body) in &def.elses {
                    alternatives.push(emit_value_alternative(
                        emitter,
                        value.clone(),
                        body.as_ref(),
                        result,
                    ));
                }
                vec![Statement::new(StatementKind::Block {
                    blocks: alternatives,
                })]
            }
        }
        RuleKind::PartialSet => {
            let item = def.key.clone().unwrap_or_else(true_expr);
            let mut block: Block = vec![];
            let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                let op = em.emit_expr(&item, b);
                b.push(Statement::new(StatementKind::SetAdd {
                    value: op,
                    set: result,
                }));
            };
            emit_with_tail(emitter, def.body.as_ref(), &mut block, &mut tail);
            block
        }
        RuleKind::PartialObject => {
            let key = def.key.clone().unwrap_or_else(true_expr);
            let value = def.value.clone().unwrap_or_else(true_expr);
            let mut block: Block = vec![];
            let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                let key_op = em.emit_expr(&key, b);
                let value_op = em.emit_expr(&value, b);
                b.push(Statement::new(StatementKind::ObjectInsertOnce {
                    key: key_op,
                    value: value_op,
                    object: result,
                }));
            };
            emit_with_tail(emitter, def.body.as_ref(), &mut block, &mut tail);
            block
        }
        RuleKind::DynamicObject | RuleKind::DynamicSet => {
            let path = def.dynamic_path.clone();
            let value = def.value.clone();
            let key = def.key.clone();
            let is_set = rule.kind == RuleKind::DynamicSet;
            let mut block: Block = vec![];
            let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                emit_dynamic_insert(em, &path, value.as_ref(), key.as_ref(), is_set, result, b);
            };
            emit_with_tail(emitter, def.body.as_ref(), &mut block, &mut tail);
            block
        }
        RuleKind::Query => emit_query_definition(emitter, def, result),
    }
}

fn emit_with_tail<'a, 'b, F: FnMut(&mut FuncEmitter<'a, 'b>, &mut Block)>(
    emitter: &mut FuncEmitter<'a, 'b>,
    body: Option<&Node>,
    block: &mut Block,
    tail: &mut F,
) {
    match body {
        Some(body) => emitter.emit_body(body, block, Some(tail)),
        None => tail(emitter, block),
    }
}

fn emit_value_alternative(
    emitter: &mut FuncEmitter,
    value: Option<Node>,
    body: Option<&Node>,
    result: usize,
) -> Block {
    let value = value.unwrap_or_else(true_expr);
    let mut block: Block = vec![];
    let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
        let op = em.emit_expr(&value, b);
        b.push(Statement::new(StatementKind::AssignVarOnce {
            source: op,
            target: result,
        }));
    };
    emit_with_tail(emitter, body, &mut block, &mut tail);
    block
}

/// Insert a value at a computed path, by building the nested object for
/// this iteration and deep-merging it into the accumulated result.
fn emit_dynamic_insert(
    emitter: &mut FuncEmitter,
    path: &[Node],
    value: Option<&Node>,
    key: Option<&Node>,
    is_set: bool,
    result: usize,
    block: &mut Block,
) {
    let mut segment_ops = vec![];
    for segment in path {
        segment_ops.push(emitter.emit_expr(segment, block));
    }

    // The innermost value: either the rule's value, or a singleton set.
    let mut current = if is_set {
        let set = emitter.temp("dynset");
        block.push(Statement::new(StatementKind::MakeSet { target: set }));
        if let Some(key) = key {
            let item = emitter.emit_expr(key, block);
            block.push(Statement::new(StatementKind::SetAdd {
                value: item,
                set,
            }));
        }
        Operand::Local(set)
    } else {
        match value {
            Some(value) => emitter.emit_expr(value, block),
            None => Operand::Bool(true),
        }
    };

    for segment in segment_ops.into_iter().rev() {
        let object = emitter.temp("dynobj");
        block.push(Statement::new(StatementKind::MakeObject { target: object }));
        block.push(Statement::new(StatementKind::ObjectInsert {
            key: segment,
            value: current,
            object,
        }));
        current = Operand::Local(object);
    }

    let wrapped = match current {
        Operand::Local(slot) => slot,
        _ => {
            let slot = emitter.temp("dynobj");
            block.push(Statement::new(StatementKind::AssignVar {
                source: current,
                target: slot,
            }));
            slot
        }
    };
    block.push(Statement::new(StatementKind::ObjectMerge {
        a: result,
        b: wrapped,
        target: result,
    }));
}

/// The synthesized query rule returns an array with one element per
/// successful evaluation path: the query expression's value, the bindings
/// object, or `true`.
fn emit_query_definition(emitter: &mut FuncEmitter, def: &RuleBodyDef, result: usize) -> Block {
    let body = match &def.body {
        Some(body) => body.clone(),
        None => return vec![],
    };

    let mut bindings: BTreeSet<String> = BTreeSet::new();
    collect_bindings(&body, &mut bindings);

    let mut block: Block = vec![];
    if bindings.is_empty() {
        if let Some((body, value_lit)) = extract_query_value(&body) {
            let value_expr = value_lit.front().clone();
            let withseq = value_lit.back().clone();
            let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                let overlays = em.collect_overlays(&withseq, b);
                let mut core: Block = vec![];
                let op = em.emit_expr(&value_expr, &mut core);
                core.push(Statement::new(StatementKind::ArrayAppend {
                    value: op,
                    array: result,
                }));
                b.extend(em.wrap_overlays(overlays, core, &value_expr));
            };
            emitter.emit_body(&body, &mut block, Some(&mut tail));
            return block;
        }
        let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
            let _ = em;
            b.push(Statement::new(StatementKind::ArrayAppend {
                value: Operand::Bool(true),
                array: result,
            }));
        };
        emitter.emit_body(&body, &mut block, Some(&mut tail));
        return block;
    }

    let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
        let element = em.temp("binding");
        b.push(Statement::new(StatementKind::MakeObject { target: element }));
        for name in &bindings {
            let key = Operand::String(em.ctx.intern(name));
            let slot = em.slot(name);
            b.push(Statement::new(StatementKind::ObjectInsert {
                key,
                value: Operand::Local(slot),
                object: element,
            }));
        }
        b.push(Statement::new(StatementKind::ArrayAppend {
            value: Operand::Local(element),
            array: result,
        }));
    };
    emitter.emit_body(&body, &mut block, Some(&mut tail));
    block
}

/// User-visible names a query binds, at any nesting depth.
fn collect_bindings(body: &Node, bindings: &mut BTreeSet<String>) {
    for lit in body.children() {
        let payload = lit.front();
        match payload.tag() {
            Tag::ExprAssign => {
                let name = payload.front().text();
                if !name.contains('$') {
                    bindings.insert(name.to_string());
                }
            }
            Tag::ExprScan => {
                for slot in [payload.expect(Tag::Key), payload.expect(Tag::Val)] {
                    let name = slot.front().text();
                    if !name.contains('$') {
                        bindings.insert(name.to_string());
                    }
                }
                if payload.len() > 3 {
                    collect_bindings(payload.back(), bindings);
                }
            }
            _ => (),
        }
    }
}

/// For a pure value query, remove the innermost trailing expression literal
/// and return it (with its `with` modifiers) alongside the remaining body.
fn extract_query_value(body: &Node) -> Option<(Node, Node)> {
    let literals = body.children();
    let last = literals.last()?;
    let payload = last.front();

    if payload.is(Tag::ExprScan) && payload.len() > 3 {
        let (nested, value) = extract_query_value(payload.back())?;
        let scan = NodeDef::node(
            Tag::ExprScan,
            vec![
                payload.child(0).clone(),
                payload.child(1).clone(),
                payload.child(2).clone(),
                nested,
            ],
        );
        let lit = NodeDef::node(Tag::Literal, vec![scan, last.back().clone()]);
        let mut children = literals[..literals.len() - 1].to_vec();
        children.push(lit);
        return Some((NodeDef::node(Tag::UnifyBody, children), value));
    }

    if payload.is(Tag::Expr) {
        let inner = payload.front();
        let value_like = match inner.tag() {
            Tag::Term | Tag::ExprCall | Tag::UnaryExpr => true,
            Tag::ExprInfix => {
                let op = inner.expect(Tag::InfixOperator).front();
                op.is(Tag::ArithOperator) || op.is(Tag::BinOperator)
            }
            _ => false,
        };
        if value_like {
            let children = literals[..literals.len() - 1].to_vec();
            return Some((NodeDef::node(Tag::UnifyBody, children), last.clone()));
        }
    }
    None
}
