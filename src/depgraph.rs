// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The unification and dependency engine.
//!
//! For one rule body, builds a bipartite graph between literals and the
//! locals they read and write, plans unifications (`=`) into assignments,
//! equality checks and destructuring tests, detects cycles, and emits a
//! topologically ordered body that respects assignment-before-use. Literals
//! that follow a scan are nested inside the scan's body, which is exactly
//! the iteration semantics of the language.
//!
//! Three reserved name suffixes thread through the graph: `name#empty`
//! marks the declaration of a local so an assignment can wait for it, and
//! `name#array` / `name#object` mark that a structural test has happened so
//! destructuring reads are safe.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::ast::{FreshNames, Node, NodeDef, Tag};
use crate::errors::{Diagnostic, ErrorKind, ErrorSeq};

/// Name resolution for one rule body.
pub struct BodyScope<'a> {
    /// Names that resolve outside the body: rules, imports, built-ins.
    pub globals: &'a BTreeSet<String>,
    /// Names assigned before the body runs: function arguments, `every`
    /// bindings in the enclosing scope.
    pub preassigned: BTreeSet<String>,
    /// Names declared but not yet assigned (`some x`).
    pub declared: BTreeSet<String>,
    pub fresh: &'a mut FreshNames,
}

impl<'a> BodyScope<'a> {
    /// Whether a name unifies as a body-local variable.
    fn is_unify_var(&self, name: &str) -> bool {
        name != "input" && name != "data" && !self.globals.contains(name)
    }
}

#[derive(Debug)]
struct LiteralNode {
    literal: Node,
    in_edges: BTreeSet<String>,
    out_edges: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct LocalNode {
    in_edge: Option<usize>,
    out_edges: Vec<usize>,
    captured: bool,
}

pub struct SortedBody {
    pub body: Node,
    /// Names read from the enclosing scope.
    pub captures: Vec<String>,
    /// Local names this body binds, for rule-local inference.
    pub locals: BTreeSet<String>,
}

pub struct DependencyGraph<'a, 'b> {
    scope: &'b mut BodyScope<'a>,
    literals: Vec<LiteralNode>,
    locals: BTreeMap<String, LocalNode>,
    worklist: VecDeque<Node>,
    captures: Vec<String>,
    needs_sort: bool,
    errors: ErrorSeq,
}

fn expr_of(node: &Node) -> Node {
    match node.tag() {
        Tag::Expr => node.clone(),
        Tag::Term => NodeDef::node(Tag::Expr, vec![node.clone()]),
        Tag::Var | Tag::Ref | Tag::Scalar | Tag::Array | Tag::Object | Tag::Set
        | Tag::ArrayCompr | Tag::ObjectCompr | Tag::SetCompr => NodeDef::node(
            Tag::Expr,
            vec![NodeDef::node(Tag::Term, vec![node.clone()])],
        ),
        _ => NodeDef::node(Tag::Expr, vec![node.clone()]),
    }
}

fn decl(name: &str) -> Node {
    NodeDef::node(Tag::Local, vec![NodeDef::synthetic(Tag::Ident, name)])
}

fn literal(payload: Node, withseq: Node) -> Node {
    NodeDef::node(Tag::Literal, vec![payload, withseq])
}

fn empty_withseq() -> Node {
    NodeDef::node(Tag::WithSeq, vec![])
}

impl<'a, 'b> DependencyGraph<'a, 'b> {
    pub fn new(scope: &'b mut BodyScope<'a>, body_literals: &[Node]) -> Self {
        let mut graph = DependencyGraph {
            scope,
            literals: vec![],
            locals: BTreeMap::new(),
            worklist: VecDeque::new(),
            captures: vec![],
            needs_sort: false,
            errors: ErrorSeq::default(),
        };
        graph.seed_scope_locals();
        graph.add_body_literals(body_literals);
        graph.resolve_unify_literals();
        graph.add_captures();
        graph
    }

    /// Analyze a nested body just for the names it captures.
    fn subgraph_captures(scope: &mut BodyScope<'_>, body: &Node) -> BTreeSet<String> {
        let mut sub = BodyScope {
            globals: scope.globals,
            preassigned: scope.preassigned.clone(),
            declared: BTreeSet::new(),
            fresh: &mut *scope.fresh,
        };
        let graph = DependencyGraph::new(&mut sub, body.children());
        graph.captures.into_iter().collect()
    }

    fn seed_scope_locals(&mut self) {
        for name in self.scope.preassigned.clone() {
            self.add_literal(decl(&name), true);
        }
        for name in self.scope.declared.clone() {
            self.add_literal(decl(&name), false);
        }
    }

    fn add_body_literals(&mut self, body_literals: &[Node]) {
        for lit in body_literals {
            debug_assert!(lit.is(Tag::Literal));
            let payload = lit.front();
            if payload.is(Tag::ExprUnify) {
                self.needs_sort = true;
                self.worklist.push_back(lit.clone());
                continue;
            }
            if payload.is(Tag::ExprScan) {
                self.needs_sort = true;
            }
            self.add_plain_literal(lit.clone());
        }
    }

    /// Free body-local variables mentioned by a subtree.
    fn add_locals(scope: &mut BodyScope<'_>, names: &mut BTreeSet<String>, node: &Node) {
        match node.tag() {
            Tag::Var => {
                let name = node.text();
                if scope.is_unify_var(name) {
                    names.insert(name.to_string());
                }
            }
            // Dotted ref arguments are field names, not variables.
            Tag::RefArgDot => (),
            Tag::ArrayCompr | Tag::ObjectCompr | Tag::SetCompr => {
                let body = node.back();
                names.extend(Self::subgraph_captures(scope, body));
            }
            Tag::ExprEvery => {
                // Bindings are local to the every; the domain and any other
                // captured names are reads.
                let mut bound: BTreeSet<String> = BTreeSet::new();
                for var in node.front().children() {
                    bound.insert(var.text().to_string());
                }
                let mut inner = BTreeSet::new();
                Self::add_locals(scope, &mut inner, node.back());
                let mut sub = BodyScope {
                    globals: scope.globals,
                    preassigned: {
                        let mut p = scope.preassigned.clone();
                        p.extend(bound.iter().cloned());
                        p
                    },
                    declared: BTreeSet::new(),
                    fresh: &mut *scope.fresh,
                };
                let body_graph = DependencyGraph::new(&mut sub, node.child(1).children());
                inner.extend(body_graph.captures);
                for name in inner {
                    if !bound.contains(&name) {
                        names.insert(name);
                    }
                }
            }
            Tag::ExprCall => {
                Self::add_locals(scope, names, node.back());
            }
            _ => {
                for child in node.children() {
                    Self::add_locals(scope, names, child);
                }
            }
        }
    }

    fn update_edges(&mut self, node: &mut LiteralNode) {
        let lit = node.literal.clone();
        if let Some(withseq) = lit.field(Tag::WithSeq) {
            let mut names = BTreeSet::new();
            Self::add_locals(self.scope, &mut names, withseq);
            node.in_edges.extend(names);
        }

        let expr = lit.front().clone();
        match expr.tag() {
            Tag::Local => {
                let name = expr.front().text().to_string();
                if self.scope.preassigned.contains(&name) {
                    node.out_edges.insert(name);
                } else {
                    node.out_edges.insert(format!("{name}#empty"));
                }
            }
            Tag::ExprAssign => {
                let name = expr.front().text().to_string();
                node.in_edges.insert(format!("{name}#empty"));
                node.out_edges.insert(name);
                let mut names = BTreeSet::new();
                Self::add_locals(self.scope, &mut names, expr.back());
                node.in_edges.extend(names);
            }
            Tag::ExprScan => {
                let key = expr.expect(Tag::Key).front().text().to_string();
                let val = expr.expect(Tag::Val).front().text().to_string();
                node.in_edges.insert(format!("{key}#empty"));
                node.in_edges.insert(format!("{val}#empty"));
                let mut names = BTreeSet::new();
                Self::add_locals(self.scope, &mut names, expr.front());
                // An already-nested body (re-analysis of a scheduled body)
                // reads its captures, except what the scan itself binds.
                if expr.len() > 3 {
                    for name in Self::subgraph_captures(self.scope, expr.back()) {
                        if name != key && name != val {
                            names.insert(name);
                        }
                    }
                }
                node.out_edges.insert(key);
                node.out_edges.insert(val);
                node.in_edges.extend(names);
            }
            Tag::ExprEvery => {
                let mut names = BTreeSet::new();
                Self::add_locals(self.scope, &mut names, &expr);
                node.in_edges.extend(names);
            }
            Tag::Expr | Tag::NotExpr => {
                let mut names = BTreeSet::new();
                Self::add_locals(self.scope, &mut names, &expr);
                node.in_edges.extend(names);
            }
            Tag::ExprIsArray => {
                let name = expr.front().text().to_string();
                node.out_edges.insert(format!("{name}#array"));
                node.in_edges.insert(name);
            }
            Tag::ExprAssignFromArray => {
                let target = expr.front().text().to_string();
                let source = expr.child(1).text().to_string();
                node.in_edges.insert(format!("{source}#array"));
                node.in_edges.insert(format!("{target}#empty"));
                node.out_edges.insert(target);
            }
            Tag::ExprIsObject => {
                let name = expr.front().text().to_string();
                node.out_edges.insert(format!("{name}#object"));
                node.in_edges.insert(name);
            }
            Tag::ExprAssignFromObject => {
                let target = expr.front().text().to_string();
                let source = expr.child(1).text().to_string();
                node.in_edges.insert(format!("{source}#object"));
                node.in_edges.insert(format!("{target}#empty"));
                node.out_edges.insert(target);
                let mut names = BTreeSet::new();
                Self::add_locals(self.scope, &mut names, expr.back());
                node.in_edges.extend(names);
            }
            other => {
                self.errors.push(Diagnostic::new(
                    ErrorKind::WellFormed,
                    format!("unrecognized literal expression {other}"),
                    lit.location(),
                ));
            }
        }
    }

    fn add_plain_literal(&mut self, lit: Node) {
        self.add_literal_node(lit, false);
    }

    fn add_literal(&mut self, payload: Node, _assigned: bool) {
        let lit = if payload.is(Tag::Literal) {
            payload
        } else {
            literal(payload, empty_withseq())
        };
        self.add_literal_node(lit, false);
    }

    fn add_capture_literal(&mut self, name: &str) {
        let index = self.literals.len();
        let mut node = LiteralNode {
            literal: literal(
                NodeDef::node(Tag::Local, vec![NodeDef::synthetic(Tag::Ident, name)]),
                empty_withseq(),
            ),
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
        };
        node.out_edges.insert(name.to_string());
        self.record_edges(index, &node, true);
        self.literals.push(node);
    }

    fn add_literal_node(&mut self, lit: Node, captured: bool) {
        let index = self.literals.len();
        let mut node = LiteralNode {
            literal: lit,
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
        };
        self.update_edges(&mut node);
        self.record_edges(index, &node, captured);
        self.literals.push(node);
    }

    fn record_edges(&mut self, index: usize, node: &LiteralNode, captured: bool) {
        for name in &node.in_edges {
            let entry = self.locals.entry(name.clone()).or_default();
            entry.captured |= captured;
            entry.out_edges.push(index);
        }
        for name in &node.out_edges {
            let entry = self.locals.entry(name.clone()).or_default();
            entry.captured |= captured;
            if entry.in_edge.is_some() {
                self.errors.push(Diagnostic::new(
                    ErrorKind::RegoCompile,
                    format!("var {} assigned above", name.trim_end_matches("#empty")),
                    node.literal.location(),
                ));
            }
            entry.in_edge = Some(index);
        }
    }

    fn is_assigned(&self, name: &str) -> bool {
        match self.locals.get(name) {
            Some(local) => local.in_edge.is_some(),
            None => false,
        }
    }

    /// The unify vars mentioned anywhere inside a subtree.
    fn unify_vars(&mut self, node: &Node) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        Self::add_locals(self.scope, &mut names, node);
        names
    }

    fn any_unassigned(&mut self, node: &Node) -> bool {
        self.unify_vars(node)
            .iter()
            .any(|name| !self.is_assigned(name))
    }

    // -- unification planning ------------------------------------------------

    fn add_assign(&mut self, name: &str, rhs: Node, withseq: Node) {
        let name_empty = format!("{name}#empty");
        if !self.locals.contains_key(&name_empty) && !self.is_assigned(name) {
            self.add_literal(decl(name), false);
        }
        self.add_literal(
            literal(
                NodeDef::node(
                    Tag::ExprAssign,
                    vec![NodeDef::synthetic(Tag::AssignVar, name), expr_of(&rhs)],
                ),
                withseq,
            ),
            false,
        );
    }

    fn add_equals(&mut self, lhs: Node, rhs: Node, withseq: Node) {
        let infix = NodeDef::node(
            Tag::ExprInfix,
            vec![
                expr_of(&lhs),
                NodeDef::node(
                    Tag::InfixOperator,
                    vec![NodeDef::node(
                        Tag::BoolOperator,
                        vec![NodeDef::synthetic(Tag::Equals, "==")],
                    )],
                ),
                expr_of(&rhs),
            ],
        );
        self.add_literal(
            literal(NodeDef::node(Tag::Expr, vec![infix]), withseq),
            false,
        );
    }

    /// Unify two terms. Returns true while still unresolved.
    fn add_terms(&mut self, lhs_term: &Node, rhs_term: &Node, withseq: &Node) -> bool {
        let lhs = lhs_term.front().clone();
        let rhs = rhs_term.front().clone();

        let lhs_uvar = lhs.is(Tag::Var) && self.scope.is_unify_var(lhs.text());
        let rhs_uvar = rhs.is(Tag::Var) && self.scope.is_unify_var(rhs.text());

        if lhs_uvar {
            let lhs_name = lhs.text().to_string();
            if rhs_uvar {
                let rhs_name = rhs.text().to_string();
                let lhs_assigned = self.is_assigned(&lhs_name);
                let rhs_assigned = self.is_assigned(&rhs_name);
                return match (lhs_assigned, rhs_assigned) {
                    (true, true) => {
                        self.add_equals(lhs, rhs, withseq.clone());
                        false
                    }
                    (true, false) => {
                        self.add_assign(&rhs_name, lhs, withseq.clone());
                        false
                    }
                    (false, true) => {
                        self.add_assign(&lhs_name, rhs, withseq.clone());
                        false
                    }
                    (false, false) => true,
                };
            }
            return self.add_unifyvar_term(&lhs, rhs_term, withseq);
        }

        if rhs_uvar {
            return self.add_unifyvar_term(&rhs, lhs_term, withseq);
        }

        // A ref on either side evaluates to a fresh local first.
        if lhs.is(Tag::Ref) {
            let name = self.scope.fresh.fresh("ref");
            self.add_assign(&name, lhs, withseq.clone());
            return self.add_term_var(rhs_term, &name, withseq);
        }
        if rhs.is(Tag::Ref) {
            let name = self.scope.fresh.fresh("ref");
            self.add_assign(&name, rhs, withseq.clone());
            return self.add_term_var(lhs_term, &name, withseq);
        }

        match (lhs.tag(), rhs.tag()) {
            (Tag::Array, Tag::Array) => self.add_array_array(&lhs, &rhs, withseq),
            (Tag::Object, Tag::Object) => self.add_object_object(&lhs, &rhs, withseq),
            (Tag::Array, Tag::ArrayCompr) => {
                let name = self.scope.fresh.fresh("arraycompr");
                self.add_assign(&name, rhs_term.clone(), withseq.clone());
                self.add_array_var(&lhs, &name, withseq)
            }
            (Tag::ArrayCompr, Tag::Array) => {
                let name = self.scope.fresh.fresh("arraycompr");
                self.add_assign(&name, lhs_term.clone(), withseq.clone());
                self.add_array_var(&rhs, &name, withseq)
            }
            (Tag::Object, Tag::ObjectCompr) => {
                let name = self.scope.fresh.fresh("objectcompr");
                self.add_assign(&name, rhs_term.clone(), withseq.clone());
                self.add_object_var(&lhs, &name, withseq)
            }
            _ => {
                self.add_equals(lhs, rhs, withseq.clone());
                false
            }
        }
    }

    /// Unify a known unify var against a term.
    fn add_unifyvar_term(&mut self, var: &Node, term: &Node, withseq: &Node) -> bool {
        let name = var.text().to_string();
        let assigned = self.is_assigned(&name);
        let rhs_unassigned = self.any_unassigned(term);

        if !rhs_unassigned {
            if assigned {
                self.add_equals(var.clone(), term.clone(), withseq.clone());
            } else {
                self.add_assign(&name, term.clone(), withseq.clone());
            }
            return false;
        }

        if assigned {
            // The var is known; destructure the term against it.
            return self.add_term_var(term, &name, withseq);
        }

        true
    }

    /// Unify a term against an assigned variable name.
    fn add_term_var(&mut self, term: &Node, var_name: &str, withseq: &Node) -> bool {
        let inner = term.front().clone();
        let var = NodeDef::synthetic(Tag::Var, var_name);

        if inner.is(Tag::Var) && self.scope.is_unify_var(inner.text()) {
            let name = inner.text().to_string();
            if self.is_assigned(&name) {
                self.add_equals(inner, var, withseq.clone());
            } else {
                self.add_assign(&name, var, withseq.clone());
            }
            return false;
        }

        match inner.tag() {
            Tag::Var | Tag::Ref | Tag::Scalar => {
                self.add_equals(term.clone(), var, withseq.clone());
                false
            }
            Tag::Array => self.add_array_var(&inner, var_name, withseq),
            Tag::Object => self.add_object_var(&inner, var_name, withseq),
            _ => {
                self.add_equals(term.clone(), var, withseq.clone());
                false
            }
        }
    }

    fn add_array_var(&mut self, array: &Node, var_name: &str, withseq: &Node) -> bool {
        self.add_literal(
            NodeDef::node(
                Tag::ExprIsArray,
                vec![
                    NodeDef::synthetic(Tag::Var, var_name),
                    NodeDef::synthetic(Tag::Int, array.len().to_string()),
                ],
            ),
            false,
        );
        for (i, element) in array.children().iter().enumerate() {
            let slot = self.scope.fresh.fresh("arraydot");
            self.add_literal(decl(&slot), false);
            self.add_literal(
                NodeDef::node(
                    Tag::ExprAssignFromArray,
                    vec![
                        NodeDef::synthetic(Tag::AssignVar, slot.as_ref()),
                        NodeDef::synthetic(Tag::Var, var_name),
                        NodeDef::synthetic(Tag::Int, i.to_string()),
                    ],
                ),
                false,
            );
            let element_term = match element.tag() {
                Tag::Expr => element.front().clone(),
                _ => element.clone(),
            };
            self.add_term_var(&element_term, &slot, withseq);
        }
        false
    }

    fn add_array_array(&mut self, lhs: &Node, rhs: &Node, withseq: &Node) -> bool {
        if lhs.len() != rhs.len() {
            self.errors.push(Diagnostic::new(
                ErrorKind::EvalType,
                "cannot unify arrays of different size",
                rhs.location(),
            ));
            return false;
        }

        let all_assigned = !self.any_unassigned(lhs) && !self.any_unassigned(rhs);
        if all_assigned {
            self.add_equals(lhs.clone(), rhs.clone(), withseq.clone());
            return false;
        }

        for (l, r) in lhs.children().iter().zip(rhs.children().iter()) {
            let lt = if l.is(Tag::Expr) { l.front().clone() } else { l.clone() };
            let rt = if r.is(Tag::Expr) { r.front().clone() } else { r.clone() };
            self.add_terms(&lt, &rt, withseq);
        }
        false
    }

    fn add_object_var(&mut self, object: &Node, var_name: &str, withseq: &Node) -> bool {
        self.add_literal(
            NodeDef::node(
                Tag::ExprIsObject,
                vec![
                    NodeDef::synthetic(Tag::Var, var_name),
                    NodeDef::synthetic(Tag::Int, object.len().to_string()),
                ],
            ),
            false,
        );
        for item in object.children() {
            let key = item.front().clone();
            if self.any_unassigned(&key) {
                self.errors.push(Diagnostic::new(
                    ErrorKind::RegoCompile,
                    "cannot unify object keys containing unbound variables",
                    key.location(),
                ));
                continue;
            }
            let slot = self.scope.fresh.fresh("objectdot");
            self.add_literal(decl(&slot), false);
            self.add_literal(
                NodeDef::node(
                    Tag::ExprAssignFromObject,
                    vec![
                        NodeDef::synthetic(Tag::AssignVar, slot.as_ref()),
                        NodeDef::synthetic(Tag::Var, var_name),
                        key.clone(),
                    ],
                ),
                false,
            );
            let value = item.back();
            let value_term = if value.is(Tag::Expr) {
                value.front().clone()
            } else {
                value.clone()
            };
            self.add_term_var(&value_term, &slot, withseq);
        }
        false
    }

    /// Unify two object literals by matching constant keys first.
    fn add_object_object(&mut self, lhs: &Node, rhs: &Node, withseq: &Node) -> bool {
        if lhs.len() != rhs.len() {
            self.errors.push(Diagnostic::new(
                ErrorKind::EvalType,
                "cannot unify objects of different size",
                rhs.location(),
            ));
            return false;
        }

        if !self.any_unassigned(lhs) && !self.any_unassigned(rhs) {
            self.add_equals(lhs.clone(), rhs.clone(), withseq.clone());
            return false;
        }

        let key_of = |item: &Node| item.front().to_sexp();
        let mut rhs_items: BTreeMap<String, Node> = BTreeMap::new();
        for item in rhs.children() {
            rhs_items.insert(key_of(item), item.clone());
        }

        let mut unresolved = false;
        for item in lhs.children() {
            if self.any_unassigned(item.front()) {
                // Keys must resolve before values can unify.
                return true;
            }
            match rhs_items.remove(&key_of(item)) {
                Some(rhs_item) => {
                    let lt = item.back().front().clone();
                    let rt = rhs_item.back().front().clone();
                    self.add_terms(&lt, &rt, withseq);
                }
                None => unresolved = true,
            }
        }
        unresolved || !rhs_items.is_empty()
    }

    fn resolve_unify_literals(&mut self) {
        while !self.worklist.is_empty() {
            let size = self.worklist.len();
            for _ in 0..size {
                let lit = match self.worklist.pop_front() {
                    Some(l) => l,
                    None => break,
                };
                let unify = lit.front();
                let withseq = lit
                    .field(Tag::WithSeq)
                    .cloned()
                    .unwrap_or_else(empty_withseq);
                let lhs = unify.front();
                let rhs = unify.back();
                let lt = if lhs.is(Tag::Expr) { lhs.front().clone() } else { lhs.clone() };
                let rt = if rhs.is(Tag::Expr) { rhs.front().clone() } else { rhs.clone() };

                let unresolved = match (lt.is(Tag::Term), rt.is(Tag::Term)) {
                    (true, true) => self.add_terms(&lt, &rt, &withseq),
                    (true, false) => self.add_term_expr(&lt, &rhs.clone(), &withseq),
                    (false, true) => self.add_term_expr(&rt, &lhs.clone(), &withseq),
                    (false, false) => {
                        self.add_equals(lt.clone(), rt.clone(), withseq.clone());
                        false
                    }
                };
                if unresolved {
                    self.worklist.push_back(lit);
                }
            }

            if self.worklist.len() == size && size > 0 {
                for lit in self.worklist.clone() {
                    self.errors.push(Diagnostic::new(
                        ErrorKind::RegoCompile,
                        "unable to unify due to cycle",
                        lit.location(),
                    ));
                }
                self.worklist.clear();
                return;
            }
        }
    }

    /// Unify a term against a general (non-term) expression.
    fn add_term_expr(&mut self, term: &Node, expr: &Node, withseq: &Node) -> bool {
        if self.any_unassigned(expr) {
            return true;
        }

        let inner = term.front().clone();
        if inner.is(Tag::Var) && self.scope.is_unify_var(inner.text()) {
            let name = inner.text().to_string();
            if self.is_assigned(&name) {
                self.add_equals(term.clone(), expr.clone(), withseq.clone());
            } else {
                self.add_assign(&name, expr.clone(), withseq.clone());
            }
            return false;
        }

        match inner.tag() {
            Tag::Scalar | Tag::Var | Tag::Ref => {
                self.add_equals(term.clone(), expr.clone(), withseq.clone());
                false
            }
            Tag::Array | Tag::Object => {
                let slot = self.scope.fresh.fresh("expr");
                self.add_assign(&slot, expr.clone(), withseq.clone());
                self.add_term_var(term, &slot, withseq)
            }
            _ => {
                self.add_equals(term.clone(), expr.clone(), withseq.clone());
                false
            }
        }
    }

    fn add_captures(&mut self) {
        let names: Vec<String> = self
            .locals
            .iter()
            .filter(|(_, local)| local.in_edge.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Some(stripped) = name.strip_suffix("#empty") {
                self.add_literal(decl(stripped), false);
            } else if name.ends_with("#array") || name.ends_with("#object") {
                // Structural markers without a test mean the destructure was
                // planned against a capture; treat like a capture.
                self.add_capture_literal(&name);
            } else {
                self.captures.push(name.clone());
                self.add_capture_literal(&name);
            }
        }
    }

    /// Kahn's algorithm with a deterministic tiebreak, nesting literals that
    /// follow a scan inside the scan's body.
    pub fn sort(mut self) -> Result<SortedBody, ErrorSeq> {
        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let inferred = self.inferred_locals();

        if !self.needs_sort {
            let body: Vec<Node> = self
                .literals
                .iter()
                .filter(|n| !is_decl(&n.literal))
                .map(|n| n.literal.clone())
                .collect();
            return Ok(SortedBody {
                body: NodeDef::node(Tag::UnifyBody, ensure_nonempty(body)),
                captures: self.captures,
                locals: inferred,
            });
        }

        let mut visited_locals: BTreeSet<String> = BTreeSet::new();
        let mut visited: BTreeSet<usize> = BTreeSet::new();
        let mut frontier: VecDeque<usize> = (0..self.literals.len())
            .filter(|i| self.literals[*i].in_edges.is_empty())
            .collect();

        // Levels of nesting; a scan opens a level that becomes its body.
        let mut levels: Vec<(Vec<Node>, Option<Node>)> = vec![(vec![], None)];

        while let Some(index) = frontier.pop_front() {
            if visited.contains(&index) {
                continue;
            }
            visited.insert(index);

            let node = &self.literals[index];
            let lit = node.literal.clone();

            if !is_decl(&lit) {
                if lit.front().is(Tag::ExprScan) {
                    levels.push((vec![], Some(lit)));
                } else {
                    levels.last_mut().expect("level stack").0.push(lit);
                }
            }

            visited_locals.extend(node.out_edges.iter().cloned());

            let mut ready: Vec<usize> = vec![];
            for name in &node.out_edges {
                if let Some(local) = self.locals.get(name) {
                    for next in &local.out_edges {
                        if visited.contains(next) {
                            continue;
                        }
                        let in_edges = &self.literals[*next].in_edges;
                        if in_edges.iter().all(|n| visited_locals.contains(n)) {
                            ready.push(*next);
                        }
                    }
                }
            }
            ready.sort_unstable();
            ready.dedup();
            frontier.extend(ready);
        }

        if visited.len() != self.literals.len() {
            // Unreached literals read locals nothing writes.
            for (i, node) in self.literals.iter().enumerate() {
                if !visited.contains(&i) {
                    self.errors.push(Diagnostic::new(
                        ErrorKind::RegoCompile,
                        format!(
                            "var {} is unsafe",
                            node.in_edges
                                .iter()
                                .find(|n| !visited_locals.contains(*n))
                                .cloned()
                                .unwrap_or_default()
                        ),
                        node.literal.location(),
                    ));
                }
            }
            return Err(self.errors);
        }

        // Unwind: each inner level becomes the body of its scan.
        while levels.len() > 1 {
            let (body, scan) = levels.pop().expect("level stack");
            let scan = scan.expect("scan literal");
            let scan_expr = scan.front();
            let nested = NodeDef::node(Tag::UnifyBody, ensure_nonempty(body));
            let new_scan_expr = NodeDef::node(
                Tag::ExprScan,
                vec![
                    scan_expr.child(0).clone(),
                    scan_expr.child(1).clone(),
                    scan_expr.child(2).clone(),
                    nested,
                ],
            );
            let new_literal = NodeDef::node(
                Tag::Literal,
                vec![
                    new_scan_expr,
                    scan.field(Tag::WithSeq).cloned().unwrap_or_else(empty_withseq),
                ],
            );
            levels.last_mut().expect("level stack").0.push(new_literal);
        }

        let (body, _) = levels.pop().expect("level stack");
        Ok(SortedBody {
            body: NodeDef::node(Tag::UnifyBody, ensure_nonempty(body)),
            captures: self.captures,
            locals: inferred,
        })
    }

    fn inferred_locals(&self) -> BTreeSet<String> {
        self.locals
            .keys()
            .filter(|name| {
                !name.contains('#')
                    && !self.locals[*name].captured
                    && self.scope.is_unify_var(name)
            })
            .cloned()
            .collect()
    }
}

fn is_decl(lit: &Node) -> bool {
    matches!(
        lit.front().tag(),
        Tag::Local | Tag::EveryLocal
    )
}

fn ensure_nonempty(body: Vec<Node>) -> Vec<Node> {
    if body.is_empty() {
        vec![literal(
            NodeDef::node(
                Tag::Expr,
                vec![NodeDef::node(
                    Tag::Term,
                    vec![NodeDef::node(
                        Tag::Scalar,
                        vec![NodeDef::synthetic(Tag::True, "true")],
                    )],
                )],
            ),
            empty_withseq(),
        )]
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term_var(name: &str) -> Node {
        NodeDef::node(Tag::Term, vec![NodeDef::synthetic(Tag::Var, name)])
    }

    fn scalar_int(text: &str) -> Node {
        NodeDef::node(
            Tag::Term,
            vec![NodeDef::node(
                Tag::Scalar,
                vec![NodeDef::synthetic(Tag::Int, text)],
            )],
        )
    }

    fn unify_lit(lhs: Node, rhs: Node) -> Node {
        literal(
            NodeDef::node(Tag::ExprUnify, vec![expr_of(&lhs), expr_of(&rhs)]),
            empty_withseq(),
        )
    }

    fn sort(literals: Vec<Node>) -> SortedBody {
        let globals = BTreeSet::new();
        let mut fresh = FreshNames::default();
        let mut scope = BodyScope {
            globals: &globals,
            preassigned: BTreeSet::new(),
            declared: BTreeSet::new(),
            fresh: &mut fresh,
        };
        DependencyGraph::new(&mut scope, &literals)
            .sort()
            .expect("sort")
    }

    fn payload_kinds(body: &Node) -> Vec<Tag> {
        body.children().iter().map(|l| l.front().tag()).collect()
    }

    #[test]
    fn assignment_is_symmetric() {
        // `x = 1` and `1 = x` produce identical assignments.
        for (lhs, rhs) in [
            (term_var("x"), scalar_int("1")),
            (scalar_int("1"), term_var("x")),
        ] {
            let sorted = sort(vec![unify_lit(lhs, rhs)]);
            assert_eq!(payload_kinds(&sorted.body), vec![Tag::ExprAssign]);
            let assign = sorted.body.front().front();
            assert_eq!(assign.front().text(), "x");
            assert!(sorted.locals.contains("x"));
        }
    }

    #[test]
    fn chained_unification_orders_by_dependency() {
        // `y = x; x = 1` must assign x first.
        let literals = vec![
            unify_lit(term_var("y"), term_var("x")),
            unify_lit(term_var("x"), scalar_int("1")),
        ];
        let sorted = sort(literals);
        let kinds = payload_kinds(&sorted.body);
        assert_eq!(kinds, vec![Tag::ExprAssign, Tag::ExprAssign]);
        assert_eq!(sorted.body.child(0).front().front().text(), "x");
        assert_eq!(sorted.body.child(1).front().front().text(), "y");
    }

    #[test]
    fn unify_cycle_is_reported() {
        // `x = y; y = x` with neither assigned.
        let literals = vec![
            unify_lit(term_var("x"), term_var("y")),
            unify_lit(term_var("y"), term_var("x")),
        ];
        let globals = BTreeSet::new();
        let mut fresh = FreshNames::default();
        let mut scope = BodyScope {
            globals: &globals,
            preassigned: BTreeSet::new(),
            declared: BTreeSet::new(),
            fresh: &mut fresh,
        };
        let result = DependencyGraph::new(&mut scope, &literals).sort();
        let errors = result.err().expect("cycle error");
        assert!(errors
            .errors
            .iter()
            .any(|e| e.message.contains("unable to unify due to cycle")));
    }

    #[test]
    fn array_destructuring_plans_structural_tests() {
        // `[a, b] = c` with c preassigned.
        let array = NodeDef::node(
            Tag::Array,
            vec![expr_of(&term_var("a")), expr_of(&term_var("b"))],
        );
        let literals = vec![unify_lit(
            NodeDef::node(Tag::Term, vec![array]),
            term_var("c"),
        )];
        let globals = BTreeSet::new();
        let mut fresh = FreshNames::default();
        let mut scope = BodyScope {
            globals: &globals,
            preassigned: ["c".to_string()].into_iter().collect(),
            declared: BTreeSet::new(),
            fresh: &mut fresh,
        };
        let sorted = DependencyGraph::new(&mut scope, &literals)
            .sort()
            .expect("sort");
        let kinds = payload_kinds(&sorted.body);
        assert!(kinds.contains(&Tag::ExprIsArray));
        assert!(kinds.contains(&Tag::ExprAssignFromArray));
        assert!(sorted.locals.contains("a"));
        assert!(sorted.locals.contains("b"));
    }

    #[test]
    fn double_assignment_is_an_error() {
        let literals = vec![
            literal(
                NodeDef::node(
                    Tag::ExprAssign,
                    vec![NodeDef::synthetic(Tag::AssignVar, "x"), expr_of(&scalar_int("1"))],
                ),
                empty_withseq(),
            ),
            literal(
                NodeDef::node(
                    Tag::ExprAssign,
                    vec![NodeDef::synthetic(Tag::AssignVar, "x"), expr_of(&scalar_int("2"))],
                ),
                empty_withseq(),
            ),
        ];
        let globals = BTreeSet::new();
        let mut fresh = FreshNames::default();
        let mut scope = BodyScope {
            globals: &globals,
            preassigned: BTreeSet::new(),
            declared: BTreeSet::new(),
            fresh: &mut fresh,
        };
        let result = DependencyGraph::new(&mut scope, &literals).sort();
        assert!(result.is_err());
    }

    #[test]
    fn literals_after_scan_nest_inside_it() {
        let scan = literal(
            NodeDef::node(
                Tag::ExprScan,
                vec![
                    expr_of(&term_var("xs")),
                    NodeDef::node(Tag::Key, vec![NodeDef::synthetic(Tag::Var, "i")]),
                    NodeDef::node(Tag::Val, vec![NodeDef::synthetic(Tag::Var, "x")]),
                ],
            ),
            empty_withseq(),
        );
        let filter = literal(
            NodeDef::node(Tag::Expr, vec![term_var("x")]),
            empty_withseq(),
        );
        let globals = BTreeSet::new();
        let mut fresh = FreshNames::default();
        let mut scope = BodyScope {
            globals: &globals,
            preassigned: ["xs".to_string()].into_iter().collect(),
            declared: BTreeSet::new(),
            fresh: &mut fresh,
        };
        let sorted = DependencyGraph::new(&mut scope, &[scan, filter])
            .sort()
            .expect("sort");
        assert_eq!(sorted.body.len(), 1);
        let scan_lit = sorted.body.front();
        assert!(scan_lit.front().is(Tag::ExprScan));
        let nested = scan_lit.front().back();
        assert!(nested.is(Tag::UnifyBody));
        assert_eq!(nested.len(), 1);
    }

    #[test]
    fn empty_body_becomes_literal_true() {
        let sorted = sort(vec![]);
        assert_eq!(sorted.body.len(), 1);
        let lit = sorted.body.front();
        assert_eq!(lit.front().find_first(Tag::True).unwrap().text(), "true");
    }
}
