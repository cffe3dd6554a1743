// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *expr_to_opblock* pass: lower scheduled bodies and expressions to IR
//! statements. Every expression compiles to an operand plus the block of
//! statements that computes it; statements at literal position additionally
//! assert their own truth. Infix arithmetic becomes built-in calls,
//! comparisons become `Equal`/`NotEqual` statements or `equal`-family calls
//! depending on context, negation nests a block under `Not`, iteration
//! nests under `Scan`, and `with` modifiers wrap their statement in `With`
//! overlays.

use super::{unquote, unquote_raw, CompileCtx};
use crate::ast::{Node, Tag};
use crate::bundle::{Block, IrLocation, Operand, Statement, StatementKind};
use crate::errors::ErrorKind;
use indexmap::IndexMap;

/// The no-op tail type for bodies with nothing to append at the innermost
/// nesting level.
pub type NoTail<'a, 'b> = fn(&mut FuncEmitter<'a, 'b>, &mut Block);

pub struct FuncEmitter<'a, 'b> {
    pub ctx: &'a mut CompileCtx<'b>,
    pub locals: IndexMap<String, usize>,
    /// Package path for bare-name resolution, e.g. `["data", "p"]`.
    pub package: Vec<String>,
    pub file: usize,
}

impl<'a, 'b> FuncEmitter<'a, 'b> {
    pub fn new(ctx: &'a mut CompileCtx<'b>, package: Vec<String>, file: usize) -> Self {
        let mut locals = IndexMap::new();
        locals.insert("input".to_string(), 0);
        locals.insert("data".to_string(), 1);
        Self {
            ctx,
            locals,
            package,
            file,
        }
    }

    pub fn slot(&mut self, name: &str) -> usize {
        if let Some(index) = self.locals.get(name) {
            return *index;
        }
        let index = self.locals.len();
        self.locals.insert(name.to_string(), index);
        index
    }

    pub fn temp(&mut self, hint: &str) -> usize {
        let name = self.ctx.fresh.fresh(hint);
        self.slot(&name)
    }

    fn loc(&self, node: &Node) -> Option<IrLocation> {
        node.location().map(|span| IrLocation {
            file: self.file,
            pos: span.start,
            len: (span.end - span.start),
        })
    }

    fn push(&mut self, block: &mut Block, kind: StatementKind, node: &Node) {
        block.push(Statement::at(kind, self.loc(node)));
    }

    // -- values --------------------------------------------------------------

    pub fn emit_expr(&mut self, expr: &Node, block: &mut Block) -> Operand {
        let inner = if expr.is(Tag::Expr) { expr.front() } else { expr };
        match inner.tag() {
            Tag::Term => self.emit_term(inner, block),
            Tag::Var => self.resolve_var(inner, block),
            Tag::Ref => self.emit_ref(inner, block),
            Tag::Scalar => self.emit_scalar(inner, block),
            Tag::ExprCall => self.emit_call(inner, block),
            Tag::ExprInfix => self.emit_infix_value(inner, block),
            Tag::UnaryExpr => {
                let zero = self.temp("zero");
                self.push(
                    block,
                    StatementKind::MakeNumberInt {
                        value: 0,
                        target: zero,
                    },
                    inner,
                );
                let operand = self.emit_expr(inner.front(), block);
                let result = self.temp("neg");
                self.push(
                    block,
                    StatementKind::Call {
                        func: "minus".to_string(),
                        args: vec![Operand::Local(zero), operand],
                        result,
                    },
                    inner,
                );
                Operand::Local(result)
            }
            Tag::Membership => {
                let item = self.emit_expr(inner.child(1), block);
                let collection = self.emit_expr(inner.child(2), block);
                let result = self.temp("member");
                self.push(
                    block,
                    StatementKind::Call {
                        func: "internal.member_2".to_string(),
                        args: vec![item, collection],
                        result,
                    },
                    inner,
                );
                Operand::Local(result)
            }
            Tag::Array | Tag::Object | Tag::Set | Tag::ArrayCompr | Tag::SetCompr
            | Tag::ObjectCompr => self.emit_aggregate(inner, block),
            Tag::Expr => self.emit_expr(inner, block),
            other => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    format!("expression {other} cannot produce a value"),
                    inner,
                );
                Operand::Bool(false)
            }
        }
    }

    fn emit_term(&mut self, term: &Node, block: &mut Block) -> Operand {
        let inner = term.front();
        match inner.tag() {
            Tag::Var => self.resolve_var(inner, block),
            Tag::Ref => self.emit_ref(inner, block),
            Tag::Scalar => self.emit_scalar(inner, block),
            _ => self.emit_aggregate(inner, block),
        }
    }

    fn emit_scalar(&mut self, scalar: &Node, block: &mut Block) -> Operand {
        let leaf = scalar.front();
        match leaf.tag() {
            Tag::True => Operand::Bool(true),
            Tag::False => Operand::Bool(false),
            Tag::Null => {
                let target = self.temp("null");
                self.push(block, StatementKind::MakeNull { target }, scalar);
                Operand::Local(target)
            }
            Tag::JsonString => {
                let index = self.ctx.intern(&unquote(leaf.text()));
                Operand::String(index)
            }
            Tag::RawString => {
                let index = self.ctx.intern(&unquote_raw(leaf.text()));
                Operand::String(index)
            }
            Tag::Int => {
                let target = self.temp("num");
                match leaf.text().parse::<i64>() {
                    Ok(value) => {
                        self.push(block, StatementKind::MakeNumberInt { value, target }, scalar)
                    }
                    Err(_) => {
                        // Out of 64-bit range: keep the digits in the string
                        // table.
                        let index = self.ctx.intern(leaf.text());
                        self.push(block, StatementKind::MakeNumberRef { index, target }, scalar)
                    }
                }
                Operand::Local(target)
            }
            Tag::Float => {
                let index = self.ctx.intern(leaf.text());
                let target = self.temp("num");
                self.push(block, StatementKind::MakeNumberRef { index, target }, scalar);
                Operand::Local(target)
            }
            other => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    format!("invalid scalar {other}"),
                    scalar,
                );
                Operand::Bool(false)
            }
        }
    }

    fn package_ident(&self, name: &str) -> String {
        let mut ident = self.package.join(".");
        ident.push('.');
        ident.push_str(name);
        ident
    }

    fn resolve_var(&mut self, var: &Node, block: &mut Block) -> Operand {
        let name = var.text();
        match name {
            "input" => Operand::Local(0),
            "data" => Operand::Local(1),
            _ => {
                if let Some(target) = name.strip_prefix("call$") {
                    let result = self.temp("callresult");
                    self.push(
                        block,
                        StatementKind::Call {
                            func: target.to_string(),
                            args: vec![Operand::Local(0), Operand::Local(1)],
                            result,
                        },
                        var,
                    );
                    return Operand::Local(result);
                }
                let ident = self.package_ident(name);
                if let Some(sig) = self.ctx.signatures.get(&ident) {
                    if !sig.function {
                        let result = self.temp("callresult");
                        self.push(
                            block,
                            StatementKind::Call {
                                func: format!("g0.{ident}"),
                                args: vec![Operand::Local(0), Operand::Local(1)],
                                result,
                            },
                            var,
                        );
                        return Operand::Local(result);
                    }
                }
                Operand::Local(self.slot(name))
            }
        }
    }

    fn emit_ref(&mut self, ref_node: &Node, block: &mut Block) -> Operand {
        let head = ref_node.expect(Tag::RefHead).front();
        let args: Vec<Node> = ref_node.expect(Tag::RefArgSeq).children().to_vec();

        if head.is(Tag::Var) && head.text() == "data" {
            return self.emit_data_ref(ref_node, &args, block);
        }

        let base = match head.tag() {
            Tag::Var => self.resolve_var(head, block),
            Tag::ExprCall => self.emit_call(head, block),
            _ => self.emit_aggregate(head, block),
        };
        self.apply_ref_args(base, &args, block, ref_node)
    }

    /// A ref rooted at `data`: resolve the longest constant prefix against
    /// the virtual document, falling back to the base document.
    fn emit_data_ref(&mut self, ref_node: &Node, args: &[Node], block: &mut Block) -> Operand {
        // Constant leading segments after `data`.
        let mut segments: Vec<String> = vec!["data".to_string()];
        let mut consumed = 0;
        for arg in args {
            match arg.tag() {
                Tag::RefArgDot => {
                    segments.push(arg.front().text().to_string());
                    consumed += 1;
                }
                Tag::RefArgBrack => {
                    let expr = arg.front();
                    match expr.find_first(Tag::JsonString) {
                        Some(s) if super::rules::is_constant(expr) => {
                            segments.push(unquote(s.text()));
                            consumed += 1;
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }

        // Longest prefix that names a rule wins.
        for k in (1..=consumed).rev() {
            let ident = segments[..=k].join(".");
            if let Some(sig) = self.ctx.signatures.get(&ident) {
                if sig.function {
                    self.ctx.error(
                        ErrorKind::RegoCompile,
                        format!("function {ident} referenced without arguments"),
                        ref_node,
                    );
                    return Operand::Bool(false);
                }
                let result = self.temp("callresult");
                self.push(
                    block,
                    StatementKind::Call {
                        func: format!("g0.{ident}"),
                        args: vec![Operand::Local(0), Operand::Local(1)],
                        result,
                    },
                    ref_node,
                );
                return self.apply_ref_args(
                    Operand::Local(result),
                    &args[k..],
                    block,
                    ref_node,
                );
            }
        }

        // Longest prefix that names a package materializes that package.
        for k in (1..=consumed).rev() {
            let prefix = segments[..=k].join(".");
            let is_package = self
                .ctx
                .signatures
                .keys()
                .any(|ident| ident.starts_with(&format!("{prefix}.")));
            if is_package {
                let package = self.materialize_package(&prefix, block, ref_node);
                return self.apply_ref_args(package, &args[k..], block, ref_node);
            }
        }

        // Purely base-document data.
        self.apply_ref_args(Operand::Local(1), args, block, ref_node)
    }

    /// Build the object holding every rule and subpackage under `prefix`,
    /// merged over the base document's subtree at the same path.
    fn materialize_package(
        &mut self,
        prefix: &str,
        block: &mut Block,
        at: &Node,
    ) -> Operand {
        let object = self.temp("pkgobj");
        self.push(block, StatementKind::MakeObject { target: object }, at);

        let mut children: Vec<(String, bool)> = vec![];
        for ident in self.ctx.signatures.keys() {
            if let Some(rest) = ident.strip_prefix(&format!("{prefix}.")) {
                let name = match rest.split_once('.') {
                    Some((first, _)) => (first.to_string(), false),
                    None => (rest.to_string(), true),
                };
                if !children.contains(&name) {
                    children.push(name);
                }
            }
        }

        for (name, is_rule) in children {
            let child_ident = format!("{prefix}.{name}");
            let key = Operand::String(self.ctx.intern(&name));
            if is_rule {
                if self
                    .ctx
                    .signatures
                    .get(&child_ident)
                    .map(|sig| sig.function)
                    .unwrap_or(false)
                {
                    // Functions have no document value.
                    continue;
                }
                let result = self.temp("callresult");
                let mut inner: Block = vec![];
                self.push(
                    &mut inner,
                    StatementKind::Call {
                        func: format!("g0.{child_ident}"),
                        args: vec![Operand::Local(0), Operand::Local(1)],
                        result,
                    },
                    at,
                );
                self.push(
                    &mut inner,
                    StatementKind::ObjectInsert {
                        key,
                        value: Operand::Local(result),
                        object,
                    },
                    at,
                );
                // An undefined rule simply stays absent.
                self.push(block, StatementKind::Block { blocks: vec![inner] }, at);
            } else {
                let child = self.materialize_package(&child_ident, block, at);
                self.push(
                    block,
                    StatementKind::ObjectInsert {
                        key,
                        value: child,
                        object,
                    },
                    at,
                );
            }
        }

        // Base-document subtree at the same path, overridden by the rules.
        let base = self.temp("pkgbase");
        self.push(block, StatementKind::MakeObject { target: base }, at);
        let mut lookup: Block = vec![];
        let mut current = Operand::Local(1);
        for segment in prefix.split('.').skip(1) {
            let key = Operand::String(self.ctx.intern(segment));
            let target = self.temp("dot");
            self.push(
                &mut lookup,
                StatementKind::Dot {
                    source: current,
                    key,
                    target,
                },
                at,
            );
            current = Operand::Local(target);
        }
        self.push(
            &mut lookup,
            StatementKind::IsObject {
                source: current.clone(),
            },
            at,
        );
        self.push(
            &mut lookup,
            StatementKind::AssignVar {
                source: current,
                target: base,
            },
            at,
        );
        self.push(block, StatementKind::Block { blocks: vec![lookup] }, at);

        let merged = self.temp("pkgmerged");
        self.push(
            block,
            StatementKind::ObjectMerge {
                a: base,
                b: object,
                target: merged,
            },
            at,
        );
        Operand::Local(merged)
    }

    fn apply_ref_args(
        &mut self,
        base: Operand,
        args: &[Node],
        block: &mut Block,
        at: &Node,
    ) -> Operand {
        let mut current = base;
        for arg in args {
            let key = match arg.tag() {
                Tag::RefArgDot => Operand::String(self.ctx.intern(arg.front().text())),
                Tag::RefArgBrack => self.emit_expr(arg.front(), block),
                other => {
                    self.ctx.error(
                        ErrorKind::RegoCompile,
                        format!("invalid ref argument {other}"),
                        arg,
                    );
                    return Operand::Bool(false);
                }
            };
            let target = self.temp("dot");
            self.push(
                block,
                StatementKind::Dot {
                    source: current,
                    key,
                    target,
                },
                at,
            );
            current = Operand::Local(target);
        }
        current
    }

    fn emit_call(&mut self, call: &Node, block: &mut Block) -> Operand {
        let callee = call.front();
        let exprseq = call.back();

        let path = match super::ref_to_path(callee) {
            Some(path) => path,
            None => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    "invalid function reference",
                    callee,
                );
                return Operand::Bool(false);
            }
        };
        let name = path.join(".");

        let mut args = vec![];
        for arg in exprseq.children() {
            args.push(self.emit_expr(arg, block));
        }

        if let Some(target) = name.strip_prefix("call$") {
            let result = self.temp("callresult");
            let mut call_args = vec![Operand::Local(0), Operand::Local(1)];
            call_args.extend(args);
            self.push(
                block,
                StatementKind::Call {
                    func: target.to_string(),
                    args: call_args,
                    result,
                },
                call,
            );
            return Operand::Local(result);
        }

        if self.ctx.registry.is_builtin(&name) {
            let result = self.temp("callresult");
            self.push(
                block,
                StatementKind::Call {
                    func: name,
                    args,
                    result,
                },
                call,
            );
            return Operand::Local(result);
        }

        let ident = if name.starts_with("data.") {
            name.clone()
        } else {
            self.package_ident(&name)
        };
        match self.ctx.signatures.get(&ident) {
            Some(sig) if sig.function => {
                if sig.arity != args.len() {
                    self.ctx.error(
                        ErrorKind::RegoType,
                        format!(
                            "function {ident} expects {} argument(s), got {}",
                            sig.arity,
                            args.len()
                        ),
                        call,
                    );
                }
                let result = self.temp("callresult");
                let mut call_args = vec![Operand::Local(0), Operand::Local(1)];
                call_args.extend(args);
                self.push(
                    block,
                    StatementKind::Call {
                        func: format!("g0.{ident}"),
                        args: call_args,
                        result,
                    },
                    call,
                );
                Operand::Local(result)
            }
            _ => {
                // Unknown callee: resolve through the virtual document at
                // runtime.
                if name.starts_with("data.") {
                    let mut path_ops = vec![];
                    for segment in path {
                        path_ops.push(Operand::String(self.ctx.intern(&segment)));
                    }
                    let result = self.temp("callresult");
                    let mut call_args = vec![Operand::Local(0), Operand::Local(1)];
                    call_args.extend(args);
                    self.push(
                        block,
                        StatementKind::CallDynamic {
                            path: path_ops,
                            args: call_args,
                            result,
                        },
                        call,
                    );
                    Operand::Local(result)
                } else {
                    self.ctx.error(
                        ErrorKind::RegoCompile,
                        format!("unknown function {name}"),
                        call,
                    );
                    Operand::Bool(false)
                }
            }
        }
    }

    fn arith_builtin(op: Tag) -> Option<&'static str> {
        Some(match op {
            Tag::Add => "plus",
            Tag::Subtract => "minus",
            Tag::Multiply => "mul",
            Tag::Divide => "div",
            Tag::Modulo => "rem",
            Tag::And => "and",
            Tag::Or => "or",
            _ => return None,
        })
    }

    fn bool_builtin(op: Tag) -> Option<&'static str> {
        Some(match op {
            Tag::Equals => "equal",
            Tag::NotEquals => "neq",
            Tag::LessThan => "lt",
            Tag::LessThanOrEquals => "lte",
            Tag::GreaterThan => "gt",
            Tag::GreaterThanOrEquals => "gte",
            _ => return None,
        })
    }

    fn emit_infix_value(&mut self, infix: &Node, block: &mut Block) -> Operand {
        let op = infix.expect(Tag::InfixOperator).front().front();
        let lhs = self.emit_expr(infix.front(), block);
        let rhs = self.emit_expr(infix.back(), block);

        let func = match Self::arith_builtin(op.tag()).or_else(|| Self::bool_builtin(op.tag())) {
            Some(func) => func,
            None => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    format!("operator {} cannot produce a value", op.tag()),
                    infix,
                );
                return Operand::Bool(false);
            }
        };
        let result = self.temp("callresult");
        self.push(
            block,
            StatementKind::Call {
                func: func.to_string(),
                args: vec![lhs, rhs],
                result,
            },
            infix,
        );
        Operand::Local(result)
    }

    fn emit_aggregate(&mut self, node: &Node, block: &mut Block) -> Operand {
        match node.tag() {
            Tag::Array => {
                let target = self.temp("array");
                self.push(
                    block,
                    StatementKind::MakeArray {
                        capacity: node.len() as i32,
                        target,
                    },
                    node,
                );
                for element in node.children() {
                    let value = self.emit_expr(element, block);
                    self.push(
                        block,
                        StatementKind::ArrayAppend {
                            value,
                            array: target,
                        },
                        element,
                    );
                }
                Operand::Local(target)
            }
            Tag::Set => {
                let target = self.temp("set");
                self.push(block, StatementKind::MakeSet { target }, node);
                for element in node.children() {
                    let value = self.emit_expr(element, block);
                    self.push(block, StatementKind::SetAdd { value, set: target }, element);
                }
                Operand::Local(target)
            }
            Tag::Object => {
                let target = self.temp("object");
                self.push(block, StatementKind::MakeObject { target }, node);
                for item in node.children() {
                    let key = self.emit_expr(item.front(), block);
                    let value = self.emit_expr(item.back(), block);
                    self.push(
                        block,
                        StatementKind::ObjectInsert {
                            key,
                            value,
                            object: target,
                        },
                        item,
                    );
                }
                Operand::Local(target)
            }
            Tag::ArrayCompr => {
                let target = self.temp("arraycompr");
                self.push(
                    block,
                    StatementKind::MakeArray {
                        capacity: 0,
                        target,
                    },
                    node,
                );
                let value_expr = node.front().clone();
                let mut inner: Block = vec![];
                let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                    let value = em.emit_expr(&value_expr, b);
                    em.push(
                        b,
                        StatementKind::ArrayAppend {
                            value,
                            array: target,
                        },
                        &value_expr,
                    );
                };
                self.emit_body(node.back(), &mut inner, Some(&mut tail));
                self.push(block, StatementKind::Block { blocks: vec![inner] }, node);
                Operand::Local(target)
            }
            Tag::SetCompr => {
                let target = self.temp("setcompr");
                self.push(block, StatementKind::MakeSet { target }, node);
                let value_expr = node.front().clone();
                let mut inner: Block = vec![];
                let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                    let value = em.emit_expr(&value_expr, b);
                    em.push(b, StatementKind::SetAdd { value, set: target }, &value_expr);
                };
                self.emit_body(node.back(), &mut inner, Some(&mut tail));
                self.push(block, StatementKind::Block { blocks: vec![inner] }, node);
                Operand::Local(target)
            }
            Tag::ObjectCompr => {
                let target = self.temp("objectcompr");
                self.push(block, StatementKind::MakeObject { target }, node);
                let key_expr = node.front().clone();
                let value_expr = node.child(1).clone();
                let mut inner: Block = vec![];
                let mut tail = |em: &mut FuncEmitter, b: &mut Block| {
                    let key = em.emit_expr(&key_expr, b);
                    let value = em.emit_expr(&value_expr, b);
                    em.push(
                        b,
                        StatementKind::ObjectInsertOnce {
                            key,
                            value,
                            object: target,
                        },
                        &value_expr,
                    );
                };
                self.emit_body(node.back(), &mut inner, Some(&mut tail));
                self.push(block, StatementKind::Block { blocks: vec![inner] }, node);
                Operand::Local(target)
            }
            other => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    format!("cannot emit {other} as a value"),
                    node,
                );
                Operand::Bool(false)
            }
        }
    }

    // -- statements ----------------------------------------------------------

    /// Emit a scheduled body. The `tail` runs at the innermost nesting
    /// level, inside the deepest scan; rule heads and comprehension outputs
    /// are emitted this way.
    pub fn emit_body<F: FnMut(&mut Self, &mut Block)>(
        &mut self,
        body: &Node,
        block: &mut Block,
        tail: Option<&mut F>,
    ) {
        let mut tail = tail;
        let literals = body.children();
        for (i, lit) in literals.iter().enumerate() {
            let is_last = i + 1 == literals.len();
            let passed_tail = if is_last { tail.take() } else { None };
            self.emit_literal(lit, block, passed_tail);
        }
        if let Some(tail) = tail {
            tail(self, block);
        }
    }

    fn emit_literal<F: FnMut(&mut Self, &mut Block)>(
        &mut self,
        lit: &Node,
        block: &mut Block,
        tail: Option<&mut F>,
    ) {
        let payload = lit.front();
        let withseq = lit.back();

        let overlays = self.collect_overlays(withseq, block);

        let mut core: Block = vec![];
        self.emit_payload(payload, &mut core, tail);

        let wrapped = self.wrap_overlays(overlays, core, lit);
        block.extend(wrapped);
    }

    /// Evaluate the values of a statement's `with` modifiers in the
    /// enclosing context, before any overlay applies.
    pub fn collect_overlays(
        &mut self,
        withseq: &Node,
        block: &mut Block,
    ) -> Vec<(usize, Vec<usize>, Operand)> {
        let mut overlays = vec![];
        if withseq.is(Tag::WithSeq) {
            for with in withseq.children() {
                if let Some(overlay) = self.emit_with_target(with, block) {
                    overlays.push(overlay);
                }
            }
        }
        overlays
    }

    /// Nest a block under its overlays; the innermost overlay is the last in
    /// source order.
    pub fn wrap_overlays(
        &self,
        overlays: Vec<(usize, Vec<usize>, Operand)>,
        mut core: Block,
        at: &Node,
    ) -> Block {
        for (local, path, value) in overlays.into_iter().rev() {
            let wrapped = core;
            core = vec![Statement::at(
                StatementKind::With {
                    local,
                    path,
                    value,
                    block: wrapped,
                },
                self.loc(at),
            )];
        }
        core
    }

    /// Resolve a `with` target to an overlayable path of `input`/`data`.
    /// Function and built-in overrides were rewritten away before emission.
    fn emit_with_target(
        &mut self,
        with: &Node,
        block: &mut Block,
    ) -> Option<(usize, Vec<usize>, Operand)> {
        let target = with.front();
        let value = self.emit_expr(with.back(), block);

        let path = match target.front().tag() {
            Tag::Var => Some(vec![target.front().text().to_string()]),
            Tag::Ref => super::ref_to_path(target.front()),
            _ => None,
        };
        let Some(path) = path else {
            self.ctx.error(
                ErrorKind::RegoCompile,
                "invalid `with` target",
                target,
            );
            return None;
        };

        let local = match path[0].as_str() {
            "input" => 0,
            "data" => 1,
            _ => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    format!("`with` target {} is not input, data or a function", path[0]),
                    target,
                );
                return None;
            }
        };
        let indices = path[1..]
            .iter()
            .map(|segment| self.ctx.intern(segment))
            .collect();
        Some((local, indices, value))
    }

    fn emit_payload<F: FnMut(&mut Self, &mut Block)>(
        &mut self,
        payload: &Node,
        block: &mut Block,
        tail: Option<&mut F>,
    ) {
        match payload.tag() {
            Tag::ExprScan => self.emit_scan(payload, block, tail),
            _ => {
                self.emit_statement(payload, block);
                if let Some(tail) = tail {
                    tail(self, block);
                }
            }
        }
    }

    fn emit_scan<F: FnMut(&mut Self, &mut Block)>(
        &mut self,
        scan: &Node,
        block: &mut Block,
        tail: Option<&mut F>,
    ) {
        let domain = scan.front();
        let source = match domain.front().front().tag() {
            Tag::Var => self.slot(domain.front().front().text()),
            _ => {
                let op = self.emit_expr(domain, block);
                let slot = self.temp("scansource");
                self.push(
                    block,
                    StatementKind::AssignVar {
                        source: op,
                        target: slot,
                    },
                    domain,
                );
                slot
            }
        };
        let key = self.slot(scan.expect(Tag::Key).front().text());
        let value = self.slot(scan.expect(Tag::Val).front().text());

        let mut inner: Block = vec![];
        if scan.len() > 3 {
            self.emit_body(scan.back(), &mut inner, tail);
        } else if let Some(tail) = tail {
            tail(self, &mut inner);
        }

        self.push(
            block,
            StatementKind::Scan {
                source,
                key,
                value,
                block: inner,
            },
            scan,
        );
    }

    pub fn emit_statement(&mut self, payload: &Node, block: &mut Block) {
        match payload.tag() {
            Tag::Expr => self.emit_statement_expr(payload.front(), block),
            Tag::NotExpr => {
                let mut inner: Block = vec![];
                self.emit_statement_expr(payload.front().front(), &mut inner);
                self.push(block, StatementKind::Not { block: inner }, payload);
            }
            Tag::ExprAssign => {
                let target = self.slot(payload.front().text());
                let source = self.emit_expr(payload.back(), block);
                self.push(block, StatementKind::AssignVar { source, target }, payload);
            }
            Tag::ExprIsArray => {
                let source = self.slot(payload.front().text());
                self.push(
                    block,
                    StatementKind::IsArray {
                        source: Operand::Local(source),
                    },
                    payload,
                );
                self.emit_len_check(source, payload.back().text(), payload, block);
            }
            Tag::ExprIsObject => {
                let source = self.slot(payload.front().text());
                self.push(
                    block,
                    StatementKind::IsObject {
                        source: Operand::Local(source),
                    },
                    payload,
                );
                self.emit_len_check(source, payload.back().text(), payload, block);
            }
            Tag::ExprAssignFromArray => {
                let target = self.slot(payload.front().text());
                let source = self.slot(payload.child(1).text());
                let index = self.temp("idx");
                let value: i64 = payload.back().text().parse().unwrap_or_default();
                self.push(
                    block,
                    StatementKind::MakeNumberInt {
                        value,
                        target: index,
                    },
                    payload,
                );
                self.push(
                    block,
                    StatementKind::Dot {
                        source: Operand::Local(source),
                        key: Operand::Local(index),
                        target,
                    },
                    payload,
                );
            }
            Tag::ExprAssignFromObject => {
                let target = self.slot(payload.front().text());
                let source = self.slot(payload.child(1).text());
                let key = self.emit_expr(payload.back(), block);
                self.push(
                    block,
                    StatementKind::Dot {
                        source: Operand::Local(source),
                        key,
                        target,
                    },
                    payload,
                );
            }
            other => {
                self.ctx.error(
                    ErrorKind::RegoCompile,
                    format!("cannot emit literal {other}"),
                    payload,
                );
            }
        }
    }

    fn emit_len_check(&mut self, source: usize, len_text: &str, at: &Node, block: &mut Block) {
        let actual = self.temp("len");
        self.push(
            block,
            StatementKind::Len {
                source: Operand::Local(source),
                target: actual,
            },
            at,
        );
        let expected = self.temp("len");
        let value: i64 = len_text.parse().unwrap_or_default();
        self.push(
            block,
            StatementKind::MakeNumberInt {
                value,
                target: expected,
            },
            at,
        );
        self.push(
            block,
            StatementKind::Equal {
                a: Operand::Local(actual),
                b: Operand::Local(expected),
            },
            at,
        );
    }

    fn emit_statement_expr(&mut self, inner: &Node, block: &mut Block) {
        match inner.tag() {
            Tag::ExprInfix => {
                let op = inner.expect(Tag::InfixOperator).front().front().tag();
                match op {
                    Tag::Equals | Tag::NotEquals => {
                        let a = self.emit_expr(inner.front(), block);
                        let b = self.emit_expr(inner.back(), block);
                        let kind = if op == Tag::Equals {
                            StatementKind::Equal { a, b }
                        } else {
                            StatementKind::NotEqual { a, b }
                        };
                        self.push(block, kind, inner);
                    }
                    Tag::LessThan
                    | Tag::LessThanOrEquals
                    | Tag::GreaterThan
                    | Tag::GreaterThanOrEquals => {
                        let result = self.emit_infix_value(inner, block);
                        self.push(
                            block,
                            StatementKind::Equal {
                                a: result,
                                b: Operand::Bool(true),
                            },
                            inner,
                        );
                    }
                    _ => {
                        // Arithmetic at statement position asserts
                        // definedness of its result.
                        let result = self.emit_infix_value(inner, block);
                        self.push(
                            block,
                            StatementKind::NotEqual {
                                a: result,
                                b: Operand::Bool(false),
                            },
                            inner,
                        );
                    }
                }
            }
            Tag::ExprEvery => self.emit_every(inner, block),
            _ => {
                let operand = self.emit_expr(inner, block);
                if operand == Operand::Bool(true) {
                    return;
                }
                self.push(
                    block,
                    StatementKind::NotEqual {
                        a: operand,
                        b: Operand::Bool(false),
                    },
                    inner,
                );
            }
        }
    }

    /// `every` lowers to a reset/scan pattern: collect the keys of the
    /// iterations whose body succeeded and require them to cover the whole
    /// domain.
    fn emit_every(&mut self, every: &Node, block: &mut Block) {
        let varseq = every.front();
        let body = every.child(1);
        let domain_expr = every.back();

        let domain = self.emit_expr(domain_expr, block);
        let all = self.temp("everyall");
        self.push(
            block,
            StatementKind::Call {
                func: "count".to_string(),
                args: vec![domain.clone()],
                result: all,
            },
            every,
        );

        let source = match &domain {
            Operand::Local(slot) => *slot,
            _ => {
                let slot = self.temp("everysource");
                self.push(
                    block,
                    StatementKind::AssignVar {
                        source: domain,
                        target: slot,
                    },
                    every,
                );
                slot
            }
        };

        let seen = self.temp("everyseen");
        self.push(block, StatementKind::MakeSet { target: seen }, every);

        let (key, value) = match varseq.len() {
            1 => {
                let key = self.temp("scanindex");
                let value = self.slot(varseq.front().text());
                (key, value)
            }
            _ => {
                let key = self.slot(varseq.front().text());
                let value = self.slot(varseq.back().text());
                (key, value)
            }
        };

        let mut inner: Block = vec![];
        self.emit_body(body, &mut inner, None::<&mut NoTail>);
        inner.push(Statement::at(
            StatementKind::SetAdd {
                value: Operand::Local(key),
                set: seen,
            },
            self.loc(every),
        ));

        let scan = Statement::at(
            StatementKind::Scan {
                source,
                key,
                value,
                block: inner,
            },
            self.loc(every),
        );
        // The scan may find no successful iteration; that only matters for
        // the final count comparison.
        self.push(
            block,
            StatementKind::Block {
                blocks: vec![vec![scan]],
            },
            every,
        );

        let count = self.temp("everycount");
        self.push(
            block,
            StatementKind::Len {
                source: Operand::Local(seen),
                target: count,
            },
            every,
        );
        self.push(
            block,
            StatementKind::Equal {
                a: Operand::Local(count),
                b: Operand::Local(all),
            },
            every,
        );
    }
}
