// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pass 1, *prep*: split the file into a module skeleton (package, imports,
//! policy) or a query. Pass 2, *keywords*: absorb `rego.v1` and
//! `future.keywords` imports into the module version and enable the affected
//! keywords for the rest of the pipeline.

use super::ReaderCtx;
use crate::ast::{Node, NodeDef, Tag};
use crate::errors::ErrorKind;

pub fn prep(ctx: &mut ReaderCtx, top: Node) -> Node {
    let file = top.front();

    let mut package: Option<Node> = None;
    let mut imports: Vec<Node> = vec![];
    let mut policy: Vec<Node> = vec![];

    for group in file.children() {
        if group.is_empty() {
            continue;
        }
        let first = group.front();
        match first.tag() {
            Tag::Package => {
                let rest: Vec<Node> = group.children()[1..].to_vec();
                if rest.is_empty() {
                    ctx.error(ErrorKind::RegoParse, "expected package name", group);
                    continue;
                }
                if package.is_some() {
                    ctx.error(ErrorKind::RegoParse, "duplicate package declaration", group);
                    continue;
                }
                if !imports.is_empty() || !policy.is_empty() {
                    ctx.error(
                        ErrorKind::RegoParse,
                        "package declaration must come first",
                        group,
                    );
                    continue;
                }
                package = Some(NodeDef::node(
                    Tag::Package,
                    vec![NodeDef::node(Tag::Group, rest)],
                ));
            }
            Tag::Import => {
                if !policy.is_empty() {
                    ctx.error(ErrorKind::RegoParse, "imports must precede rules", group);
                    continue;
                }
                let rest: Vec<Node> = group.children()[1..].to_vec();
                if rest.is_empty() {
                    ctx.error(ErrorKind::RegoParse, "expected import path", group);
                    continue;
                }
                imports.push(NodeDef::node(
                    Tag::Import,
                    vec![NodeDef::node(Tag::Group, rest)],
                ));
            }
            _ => policy.push(group.clone()),
        }
    }

    let package = match package {
        Some(p) => p,
        None => {
            ctx.error(ErrorKind::RegoParse, "missing package declaration", file);
            NodeDef::node(
                Tag::Package,
                vec![NodeDef::node(
                    Tag::Group,
                    vec![NodeDef::synthetic(Tag::Var, "error")],
                )],
            )
        }
    };

    let module = NodeDef::node(
        Tag::Module,
        vec![
            package,
            NodeDef::synthetic(Tag::Version, "v0"),
            NodeDef::node(Tag::ImportSeq, imports),
            NodeDef::node(Tag::Policy, policy),
        ],
    );
    NodeDef::node(Tag::Top, vec![module])
}

pub fn prep_query(_ctx: &mut ReaderCtx, top: Node) -> Node {
    let file = top.front();
    let groups: Vec<Node> = file
        .children()
        .iter()
        .filter(|g| !g.is_empty())
        .cloned()
        .collect();
    NodeDef::node(Tag::Top, vec![NodeDef::node(Tag::Query, groups)])
}

/// The dotted path of a keyword import group, e.g. `["future", "keywords", "in"]`.
fn import_path(group: &Node) -> Vec<String> {
    let mut path = vec![];
    for child in group.children() {
        match child.tag() {
            Tag::Var => path.push(child.text().to_string()),
            Tag::Dot => (),
            // Anything else (brackets, aliases) makes this a regular import.
            _ => return vec![],
        }
    }
    path
}

pub fn keywords(ctx: &mut ReaderCtx, top: Node) -> Node {
    let module = top.front();
    if !module.is(Tag::Module) {
        return top;
    }

    let importseq = module.expect(Tag::ImportSeq);
    let mut kept: Vec<Node> = vec![];
    let mut rego_v1 = false;
    let mut future_keywords = false;

    for import in importseq.children() {
        let path = import_path(import.front());
        match path.as_slice() {
            [a, b] if a == "rego" && b == "v1" => {
                rego_v1 = true;
                for kw in ["in", "contains", "every", "if"] {
                    if !ctx.keyword_enabled(kw) {
                        ctx.keywords.push(kw);
                    }
                }
            }
            [a, b] if a == "future" && b == "keywords" => {
                future_keywords = true;
                for kw in ["in", "contains", "every", "if"] {
                    if !ctx.keyword_enabled(kw) {
                        ctx.keywords.push(kw);
                    }
                }
            }
            [a, b, kw] if a == "future" && b == "keywords" => {
                future_keywords = true;
                match kw.as_str() {
                    "in" | "contains" | "every" | "if" => {
                        let kw: &'static str = match kw.as_str() {
                            "in" => "in",
                            "contains" => "contains",
                            "every" => "every",
                            _ => "if",
                        };
                        if !ctx.keyword_enabled(kw) {
                            ctx.keywords.push(kw);
                        }
                    }
                    _ => {
                        ctx.error(ErrorKind::RegoCompile, "unknown future keyword", import);
                    }
                }
            }
            _ => kept.push(import.clone()),
        }
    }

    if rego_v1 && future_keywords {
        ctx.error(
            ErrorKind::RegoCompile,
            "the `rego.v1` import cannot be used alongside `future.keywords` imports",
            importseq,
        );
    }

    ctx.strict = rego_v1;

    let version = NodeDef::synthetic(Tag::Version, if rego_v1 { "v1" } else { "v0" });

    let package = module.expect(Tag::Package).clone();
    let policy = enable_keywords(ctx, module.expect(Tag::Policy));

    let module = NodeDef::node(
        Tag::Module,
        vec![package, version, NodeDef::node(Tag::ImportSeq, kept), policy],
    );
    NodeDef::node(Tag::Top, vec![module])
}

/// Rewrite enabled keyword vars into their keyword tags. A var immediately
/// following a dot is a ref argument and never a keyword.
fn enable_keywords(ctx: &ReaderCtx, node: &Node) -> Node {
    if node.is_empty() {
        return node.clone();
    }
    let mut children: Vec<Node> = vec![];
    let mut prev_dot = false;
    for child in node.children() {
        let rewritten = if child.is(Tag::Var) && !prev_dot {
            match child.text() {
                "in" if ctx.keyword_enabled("in") => NodeDef::retag(child, Tag::IsIn),
                "contains" if ctx.keyword_enabled("contains") => {
                    NodeDef::retag(child, Tag::Contains)
                }
                "every" if ctx.keyword_enabled("every") => NodeDef::retag(child, Tag::Every),
                "if" if ctx.keyword_enabled("if") => NodeDef::retag(child, Tag::If),
                _ => child.clone(),
            }
        } else {
            enable_keywords(ctx, child)
        };
        prev_dot = child.is(Tag::Dot);
        children.push(rewritten);
    }
    NodeDef::with_children(node, children)
}
