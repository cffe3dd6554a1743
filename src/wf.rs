// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Well-formedness grammars.
//!
//! Every pass declares the shape its output tree must have: a mapping from
//! tag to an allowed child sequence. The pipeline driver validates the tree
//! after each pass; a mismatch is a fatal `wellformed_error` and indicates a
//! compiler bug or malformed input that slipped through an earlier pass.
//!
//! Grammars build on each other the same way the passes do: each pass's
//! grammar is the previous one extended with entries for the tags the pass
//! introduces or reshapes.

use std::collections::BTreeMap;

use crate::ast::{Node, Tag};
use crate::errors::{Diagnostic, ErrorKind};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rep {
    One,
    Opt,
    Star,
    Plus,
}

#[derive(Clone)]
pub struct Pat {
    tags: Vec<Tag>,
    rep: Rep,
}

pub fn one(tags: &[Tag]) -> Pat {
    Pat {
        tags: tags.to_vec(),
        rep: Rep::One,
    }
}

pub fn opt(tags: &[Tag]) -> Pat {
    Pat {
        tags: tags.to_vec(),
        rep: Rep::Opt,
    }
}

pub fn star(tags: &[Tag]) -> Pat {
    Pat {
        tags: tags.to_vec(),
        rep: Rep::Star,
    }
}

pub fn plus(tags: &[Tag]) -> Pat {
    Pat {
        tags: tags.to_vec(),
        rep: Rep::Plus,
    }
}

#[derive(Clone)]
enum Accept {
    /// Must have no children.
    Leaf,
    /// Children are unconstrained at this level.
    Any,
    Seq(Vec<Pat>),
}

/// A well-formedness grammar for one pass.
#[derive(Clone)]
pub struct Wellformed {
    name: &'static str,
    rules: BTreeMap<Tag, Accept>,
}

impl Wellformed {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rules: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rule(mut self, tag: Tag, pats: Vec<Pat>) -> Self {
        self.rules.insert(tag, Accept::Seq(pats));
        self
    }

    pub fn leaf(mut self, tags: &[Tag]) -> Self {
        for tag in tags {
            self.rules.insert(*tag, Accept::Leaf);
        }
        self
    }

    pub fn any(mut self, tags: &[Tag]) -> Self {
        for tag in tags {
            self.rules.insert(*tag, Accept::Any);
        }
        self
    }

    /// Derive the next pass's grammar from this one.
    pub fn extend(&self, name: &'static str) -> Self {
        Self {
            name,
            rules: self.rules.clone(),
        }
    }

    pub fn remove(mut self, tag: Tag) -> Self {
        self.rules.remove(&tag);
        self
    }

    /// Validate the whole tree, reporting the first violation.
    pub fn validate(&self, node: &Node) -> Result<(), Diagnostic> {
        if let std::option::Option::Some(accept) = self.rules.get(&node.tag()) {
            match accept {
                Accept::Leaf => {
                    if !node.is_empty() {
                        return Err(self.violation(node, "expected a leaf"));
                    }
                }
                Accept::Any => (),
                Accept::Seq(pats) => self.match_children(node, &pats)?,
            }
        }
        for child in node.children() {
            self.validate(child)?;
        }
        Ok(())
    }

    fn match_children(&self, node: &Node, pats: &[Pat]) -> Result<(), Diagnostic> {
        let children = node.children();
        let mut index = 0;
        for pat in pats {
            match pat.rep {
                Rep::One => {
                    match children.get(index) {
                        std::option::Option::Some(c) if pat.tags.contains(&c.tag()) => index += 1,
                        std::option::Option::Some(c) => {
                            return Err(self.violation(
                                node,
                                &format!("unexpected {} child at {}", c.tag(), index),
                            ))
                        }
                        None => {
                            return Err(
                                self.violation(node, &format!("missing child at {}", index))
                            )
                        }
                    };
                }
                Rep::Opt => {
                    if let std::option::Option::Some(c) = children.get(index) {
                        if pat.tags.contains(&c.tag()) {
                            index += 1;
                        }
                    }
                }
                Rep::Star | Rep::Plus => {
                    let start = index;
                    while let std::option::Option::Some(c) = children.get(index) {
                        if pat.tags.contains(&c.tag()) {
                            index += 1;
                        } else {
                            break;
                        }
                    }
                    if pat.rep == Rep::Plus && index == start {
                        return Err(self.violation(
                            node,
                            &format!("expected at least one child at {}", index),
                        ));
                    }
                }
            }
        }
        if index != children.len() {
            return Err(self.violation(
                node,
                &format!(
                    "unexpected trailing {} child at {}",
                    children[index].tag(),
                    index
                ),
            ));
        }
        Ok(())
    }

    fn violation(&self, node: &Node, detail: &str) -> Diagnostic {
        Diagnostic::new(
            ErrorKind::WellFormed,
            format!(
                "pass {}: malformed {} node: {}\n{}",
                self.name,
                node.tag(),
                detail,
                node.to_sexp()
            ),
            node.location(),
        )
    }
}

use Tag::*;

const PARSE_TOKENS: &[Tag] = &[
    Var,
    Int,
    Float,
    JsonString,
    RawString,
    True,
    False,
    Null,
    Placeholder,
    EmptySet,
    Assign,
    Unify,
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessThanOrEquals,
    GreaterThanOrEquals,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    Dot,
    Colon,
    Package,
    Import,
    As,
    With,
    Default,
    Some,
    Else,
    Not,
    IsIn,
    Contains,
    Every,
    If,
    Brace,
    Square,
    Paren,
];

const SCALARS: &[Tag] = &[JsonString, RawString, Int, Float, True, False, Null];

const TERM_TYPES: &[Tag] = &[
    Ref, Var, Scalar, Array, Object, Set, ArrayCompr, ObjectCompr, SetCompr,
];

const EXPR_TYPES: &[Tag] = &[
    Term, ExprInfix, ExprCall, ExprEvery, Membership, UnaryExpr,
];

/// Grammar of the parse tree produced by the grouping parser.
pub fn parser() -> Wellformed {
    Wellformed::new("parse")
        .rule(Top, vec![one(&[File])])
        .rule(File, vec![star(&[Group])])
        .rule(Group, vec![star(PARSE_TOKENS)])
        .rule(Brace, vec![star(&[Group, List])])
        .rule(Square, vec![star(&[Group, List])])
        .rule(Paren, vec![star(&[Group, List])])
        .rule(List, vec![star(&[Group])])
        .leaf(&[
            Var,
            Int,
            Float,
            JsonString,
            RawString,
            True,
            False,
            Null,
            Placeholder,
            EmptySet,
        ])
}

/// After *prep*: the file splits into a module or query skeleton.
pub fn prep() -> Wellformed {
    parser()
        .extend("prep")
        .remove(Top)
        .rule(Top, vec![one(&[Module, Query])])
        .rule(
            Module,
            vec![one(&[Package]), one(&[Version]), one(&[ImportSeq]), one(&[Policy])],
        )
        .rule(Package, vec![one(&[Group])])
        .rule(ImportSeq, vec![star(&[Import])])
        .rule(Import, vec![one(&[Group])])
        .rule(Policy, vec![star(&[Group])])
        .rule(Query, vec![star(&[Group])])
        .leaf(&[Version])
}

fn extend_tokens(base: &[Tag], extra: &[Tag]) -> Vec<Tag> {
    let mut tokens = base.to_vec();
    tokens.extend_from_slice(extra);
    tokens
}

/// After *keywords*: keyword imports are absorbed into the version.
pub fn keywords() -> Wellformed {
    prep().extend("keywords")
}

/// After *some_every*: `some`/`every` folded into typed nodes.
pub fn some_every() -> Wellformed {
    keywords()
        .extend("some_every")
        .rule(
            Group,
            vec![star(&extend_tokens(PARSE_TOKENS, &[SomeDecl, ExprEvery]))],
        )
        .rule(SomeDecl, vec![one(&[VarSeq]), opt(&[Group, Undefined])])
        .rule(ExprEvery, vec![one(&[VarSeq]), one(&[Group]), one(&[Brace])])
        .rule(VarSeq, vec![star(&[Var])])
        .leaf(&[Undefined])
}

/// After *ref_args*: dotted and bracketed arguments attach to carriers.
pub fn ref_args() -> Wellformed {
    some_every()
        .extend("ref_args")
        .rule(
            Group,
            vec![star(&extend_tokens(
                PARSE_TOKENS,
                &[SomeDecl, ExprEvery, RefArgDot, RefArgBrack],
            ))],
        )
        .rule(RefArgDot, vec![one(&[Var])])
        .rule(RefArgBrack, vec![one(&[Group, List]), star(&[Group])])
}

/// After *refs*: `Ref` and `ExprCall` reassembled.
pub fn refs() -> Wellformed {
    ref_args()
        .extend("refs")
        .rule(
            Group,
            vec![star(&extend_tokens(
                PARSE_TOKENS,
                &[SomeDecl, ExprEvery, Ref, ExprCall],
            ))],
        )
        .rule(Ref, vec![one(&[RefHead]), one(&[RefArgSeq])])
        .rule(
            RefHead,
            vec![one(&[
                Var, Square, Brace, Paren, EmptySet, Array, Object, Set, ArrayCompr, ObjectCompr,
                SetCompr, ExprCall,
            ])],
        )
        .rule(RefArgSeq, vec![star(&[RefArgDot, RefArgBrack])])
        .rule(ExprCall, vec![one(&[Ref]), one(&[ExprSeq])])
        .rule(ExprSeq, vec![star(&[Group, Expr])])
}

/// After *groups*: braces/squares disambiguated into collections,
/// comprehensions and bodies.
pub fn groups() -> Wellformed {
    refs()
        .extend("groups")
        .any(&[Group])
        .rule(
            ExprEvery,
            vec![one(&[VarSeq]), one(&[Group, UnifyBody]), one(&[UnifyBody, Expr])],
        )
        .rule(UnifyBody, vec![star(&[Group, SomeDecl])])
        .rule(Array, vec![star(&[Group])])
        .rule(Set, vec![star(&[Group])])
        .rule(Object, vec![star(&[ObjectItem])])
        .rule(ObjectItem, vec![one(&[Group]), one(&[Group])])
        .rule(ArrayCompr, vec![one(&[Group]), one(&[UnifyBody])])
        .rule(SetCompr, vec![one(&[Group]), one(&[UnifyBody])])
        .rule(
            ObjectCompr,
            vec![one(&[Group]), one(&[Group]), one(&[UnifyBody])],
        )
}

/// After *terms*: terminals wrapped in `Term`/`Scalar`.
pub fn terms() -> Wellformed {
    groups()
        .extend("terms")
        .rule(Term, vec![one(TERM_TYPES)])
        .rule(Scalar, vec![one(SCALARS)])
}

/// After the precedence passes: infix grouping complete.
pub fn precedence() -> Wellformed {
    terms()
        .extend("precedence")
        .rule(UnaryExpr, vec![one(&[Expr])])
        .rule(ExprInfix, vec![one(&[Expr]), one(&[InfixOperator]), one(&[Expr])])
        .rule(
            InfixOperator,
            vec![one(&[BoolOperator, ArithOperator, BinOperator, AssignOperator])],
        )
        .rule(
            BoolOperator,
            vec![one(&[
                Equals,
                NotEquals,
                LessThan,
                GreaterThan,
                LessThanOrEquals,
                GreaterThanOrEquals,
            ])],
        )
        .rule(
            ArithOperator,
            vec![one(&[Add, Subtract, Multiply, Divide, Modulo])],
        )
        .rule(BinOperator, vec![one(&[And, Or])],)
        .rule(AssignOperator, vec![one(&[Assign, Unify])])
        .rule(Expr, vec![plus(&[
            Term, ExprInfix, ExprCall, ExprEvery, Membership, UnaryExpr, Group, SomeDecl,
            SomeExpr, Add, Subtract, Multiply, Divide, Modulo, And, Or, Equals, NotEquals,
            LessThan, GreaterThan, LessThanOrEquals, GreaterThanOrEquals, Assign, Unify,
        ])])
}

/// After *collections* and *lines*: container positions hold explicit
/// expressions instead of raw groups.
pub fn collections_pass() -> Wellformed {
    precedence()
        .extend("collections")
        .rule(Array, vec![star(&[Group, Expr])])
        .rule(Set, vec![star(&[Group, Expr])])
        .rule(Object, vec![star(&[ObjectItem])])
        .rule(ObjectItem, vec![one(&[Group, Expr]), one(&[Group, Expr])])
        .rule(ArrayCompr, vec![one(&[Group, Expr]), one(&[UnifyBody])])
        .rule(SetCompr, vec![one(&[Group, Expr]), one(&[UnifyBody])])
        .rule(
            ObjectCompr,
            vec![one(&[Group, Expr]), one(&[Group, Expr]), one(&[UnifyBody])],
        )
        .rule(RefArgBrack, vec![one(&[Group, List, Expr]), star(&[Group])])
        .rule(
            SomeExpr,
            vec![one(&[Expr, Undefined]), one(&[Expr]), one(&[Expr])],
        )
        .rule(With, vec![one(&[Term]), one(&[Expr])])
        .rule(WithSeq, vec![star(&[With])])
}

/// After the *rules* pass: rule shapes exist, but package/import groups and
/// body literals are not yet normalized.
pub fn rules_pass() -> Wellformed {
    structure()
        .extend("rules")
        .any(&[Group, UnifyBody])
        .rule(Package, vec![one(&[Ref, Group])])
        .rule(Import, vec![one(&[Group])])
}

/// After the *literals* pass: bodies hold literals; package/imports are
/// still raw groups.
pub fn literals_pass() -> Wellformed {
    structure()
        .extend("literals")
        .rule(Package, vec![one(&[Ref, Group])])
        .rule(Import, vec![one(&[Group])])
}

/// The canonical module AST consumed by the compiler.
pub fn structure() -> Wellformed {
    Wellformed::new("structure")
        .rule(Top, vec![one(&[Module, Query])])
        .rule(
            Module,
            vec![one(&[Package]), one(&[Version]), one(&[ImportSeq]), one(&[Policy])],
        )
        .rule(Package, vec![one(&[Ref])])
        .rule(ImportSeq, vec![star(&[Import])])
        .rule(Import, vec![one(&[Ref]), one(&[Var, Undefined])])
        .rule(Policy, vec![star(&[Rule])])
        .rule(Query, vec![one(&[UnifyBody])])
        .rule(
            Rule,
            vec![
                one(&[Default, Empty]),
                one(&[RuleHead]),
                one(&[UnifyBody, Empty]),
                one(&[ElseSeq]),
            ],
        )
        .rule(
            RuleHead,
            vec![
                one(&[RuleRef]),
                one(&[RuleHeadComp, RuleHeadFunc, RuleHeadSet, RuleHeadObj]),
            ],
        )
        .rule(RuleRef, vec![one(&[Ref, Var])])
        .rule(RuleHeadComp, vec![one(&[AssignOperator]), one(&[Expr])])
        .rule(
            RuleHeadFunc,
            vec![one(&[RuleArgs]), one(&[AssignOperator]), one(&[Expr])],
        )
        .rule(RuleHeadSet, vec![one(&[Expr])])
        .rule(
            RuleHeadObj,
            vec![one(&[Expr]), one(&[AssignOperator]), one(&[Expr])],
        )
        .rule(RuleArgs, vec![star(&[Term])])
        .rule(ElseSeq, vec![star(&[Else])])
        .rule(Else, vec![one(&[Expr, Empty]), one(&[UnifyBody, Empty])])
        .rule(UnifyBody, vec![plus(&[Literal])])
        .rule(
            Literal,
            vec![one(&[Expr, SomeDecl, SomeExpr, NotExpr]), one(&[WithSeq])],
        )
        .rule(NotExpr, vec![one(&[Expr])])
        .rule(WithSeq, vec![star(&[With])])
        .rule(With, vec![one(&[Term]), one(&[Expr])])
        .rule(SomeDecl, vec![one(&[VarSeq])])
        .rule(
            SomeExpr,
            vec![one(&[Expr, Undefined]), one(&[Expr]), one(&[Expr])],
        )
        .rule(VarSeq, vec![star(&[Var])])
        .rule(Expr, vec![one(EXPR_TYPES)])
        .rule(ExprInfix, vec![one(&[Expr]), one(&[InfixOperator]), one(&[Expr])])
        .rule(
            InfixOperator,
            vec![one(&[BoolOperator, ArithOperator, BinOperator, AssignOperator])],
        )
        .rule(
            BoolOperator,
            vec![one(&[
                Equals,
                NotEquals,
                LessThan,
                GreaterThan,
                LessThanOrEquals,
                GreaterThanOrEquals,
            ])],
        )
        .rule(
            ArithOperator,
            vec![one(&[Add, Subtract, Multiply, Divide, Modulo])],
        )
        .rule(BinOperator, vec![one(&[And, Or])])
        .rule(AssignOperator, vec![one(&[Assign, Unify])])
        .rule(ExprCall, vec![one(&[Ref]), one(&[ExprSeq])])
        .rule(ExprSeq, vec![star(&[Expr])])
        .rule(ExprEvery, vec![one(&[VarSeq]), one(&[UnifyBody]), one(&[Expr])])
        .rule(
            Membership,
            vec![one(&[Expr, Undefined]), one(&[Expr]), one(&[Expr])],
        )
        .rule(UnaryExpr, vec![one(&[Expr])])
        .rule(Term, vec![one(TERM_TYPES)])
        .rule(Ref, vec![one(&[RefHead]), one(&[RefArgSeq])])
        .rule(
            RefHead,
            vec![one(&[
                Var, Array, Object, Set, ArrayCompr, ObjectCompr, SetCompr, ExprCall,
            ])],
        )
        .rule(RefArgSeq, vec![star(&[RefArgDot, RefArgBrack])])
        .rule(RefArgDot, vec![one(&[Var])])
        .rule(RefArgBrack, vec![one(&[Expr, Placeholder])])
        .rule(Scalar, vec![one(SCALARS)])
        .rule(Array, vec![star(&[Expr])])
        .rule(Set, vec![star(&[Expr])])
        .rule(Object, vec![star(&[ObjectItem])])
        .rule(ObjectItem, vec![one(&[Expr]), one(&[Expr])])
        .rule(ArrayCompr, vec![one(&[Expr]), one(&[UnifyBody])])
        .rule(SetCompr, vec![one(&[Expr]), one(&[UnifyBody])])
        .rule(
            ObjectCompr,
            vec![one(&[Expr]), one(&[Expr]), one(&[UnifyBody])],
        )
        .leaf(&[
            Var,
            Int,
            Float,
            JsonString,
            RawString,
            True,
            False,
            Null,
            Placeholder,
            Version,
            Undefined,
            Empty,
            Default,
        ])
        .leaf(&[
            Assign,
            Unify,
            Equals,
            NotEquals,
            LessThan,
            GreaterThan,
            LessThanOrEquals,
            GreaterThanOrEquals,
            Add,
            Subtract,
            Multiply,
            Divide,
            Modulo,
            And,
            Or,
        ])
}

/// The compiler's module AST after rule reshaping: rules carry identifiers,
/// locals, unification bodies.
pub fn compiled_rules() -> Wellformed {
    structure()
        .extend("rules")
        .remove(Rule)
        .rule(
            Rule,
            vec![
                one(&[Ident]),
                one(&[RuleRef]),
                one(&[LocalSeq]),
                one(&[Default, Empty]),
                one(&[RuleHead]),
                one(&[RuleBodySeq]),
            ],
        )
        .rule(Default, vec![one(&[Expr])])
        .rule(RuleBodySeq, vec![star(&[UnifyBody])])
        .rule(LocalSeq, vec![star(&[Local, EveryLocal])])
        .rule(Local, vec![one(&[Ident])])
        .rule(EveryLocal, vec![one(&[Ident])])
        .rule(
            RuleHead,
            vec![
                one(&[RuleRef]),
                one(&[
                    RuleHeadComp,
                    RuleHeadFunc,
                    RuleHeadSet,
                    RuleHeadObj,
                    RuleHeadSetDynamic,
                    RuleHeadObjDynamic,
                ]),
            ],
        )
        .rule(RuleHeadSetDynamic, vec![one(&[ExprSeq]), one(&[Expr])])
        .rule(
            RuleHeadObjDynamic,
            vec![one(&[ExprSeq]), one(&[Expr]), one(&[Expr])],
        )
        .rule(
            Literal,
            vec![
                one(&[
                    Expr, SomeDecl, SomeExpr, NotExpr, ExprAssign, ExprUnify, ExprScan,
                    ExprIsArray, ExprIsObject, ExprAssignFromArray, ExprAssignFromObject, Local,
                ]),
                one(&[WithSeq]),
            ],
        )
        .rule(ExprAssign, vec![one(&[AssignVar]), one(&[Expr])])
        .rule(ExprUnify, vec![one(&[Expr]), one(&[Expr])])
        .rule(
            ExprScan,
            vec![one(&[Expr]), one(&[Key]), one(&[Val]), opt(&[UnifyBody])],
        )
        .rule(Key, vec![one(&[Var])])
        .rule(Val, vec![one(&[Var])])
        .leaf(&[Ident, AssignVar])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeDef;

    #[test]
    fn accepts_wellformed_tree() {
        let tree = NodeDef::node(
            Tag::Top,
            vec![NodeDef::node(
                Tag::File,
                vec![NodeDef::node(
                    Tag::Group,
                    vec![NodeDef::synthetic(Tag::Var, "x")],
                )],
            )],
        );
        assert!(parser().validate(&tree).is_ok());
    }

    #[test]
    fn rejects_malformed_tree() {
        // A File directly holding a Var violates (File <<= Group*).
        let tree = NodeDef::node(
            Tag::Top,
            vec![NodeDef::node(
                Tag::File,
                vec![NodeDef::synthetic(Tag::Var, "x")],
            )],
        );
        let err = parser().validate(&tree).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WellFormed);
        assert!(err.message.contains("malformed file node"));
    }

    #[test]
    fn rejects_nonleaf_terminal() {
        let tree = NodeDef::node(
            Tag::Top,
            vec![NodeDef::node(
                Tag::File,
                vec![NodeDef::node(
                    Tag::Group,
                    vec![NodeDef::node(
                        Tag::Var,
                        vec![NodeDef::synthetic(Tag::Var, "x")],
                    )],
                )],
            )],
        );
        assert!(parser().validate(&tree).is_err());
    }
}
