// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The grouping parser.
//!
//! Tokenizes a source and produces the initial parse tree: `Top → File →
//! Group*`, where each group is a flat token sequence and braces, squares and
//! parens are nested container nodes holding groups. A bare newline
//! terminates the current group unless the container is a list context;
//! explicit `;` terminates a group everywhere and `,` additionally switches
//! the container into list mode.

use crate::ast::{Node, NodeDef, Tag};
use crate::lexer::{Lexer, Source, Span, Token, TokenKind};
use anyhow::Result;

pub fn parse(source: &Source) -> Result<Node> {
    let tokens = Lexer::new(source).tokens()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
    };
    let file = parser.container(Tag::File, None)?;
    Ok(NodeDef::node(Tag::Top, vec![file]))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

struct Container {
    tag: Tag,
    span: Span,
    groups: Vec<Node>,
    current: Vec<Node>,
    current_span: Option<Span>,
    is_list: bool,
    last_line: u32,
}

impl Container {
    fn push_token(&mut self, node: Node, span: Span, line: u32) {
        if self.current.is_empty() {
            self.current_span = Some(span);
        }
        self.current.push(node);
        self.last_line = line;
    }

    fn end_group(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let children = core::mem::take(&mut self.current);
        let group = match self.current_span.take() {
            Some(span) => NodeDef::node_at(Tag::Group, span, children),
            None => NodeDef::node(Tag::Group, children),
        };
        self.groups.push(group);
    }

    fn finish(mut self) -> Node {
        self.end_group();
        let children = if self.is_list && !self.groups.is_empty() {
            vec![NodeDef::node(Tag::List, self.groups)]
        } else {
            self.groups
        };
        NodeDef::node_at(self.tag, self.span, children)
    }
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    /// Parse the contents of a container up to (and consuming) its closer.
    /// `closer` is None for the file level, which runs to Eof.
    fn container(&mut self, tag: Tag, closer: Option<&str>) -> Result<Node> {
        let newline_terminates = matches!(tag, Tag::File | Tag::Brace);
        let open_span = self.peek().span.clone();
        let mut container = Container {
            tag,
            span: open_span,
            groups: vec![],
            current: vec![],
            current_span: None,
            is_list: false,
            last_line: self.peek().line,
        };

        loop {
            let tok = self.peek().clone();

            if tok.kind == TokenKind::Eof {
                if let Some(c) = closer {
                    return Err(tok.span.error(&format!("expected {c}")));
                }
                self.advance();
                return Ok(container.finish());
            }

            // A newline between tokens ends the group, except in list
            // contexts and except before `else`, which continues the rule it
            // belongs to.
            if newline_terminates
                && tok.line > container.last_line
                && !container.current.is_empty()
                && !tok.is_ident("else")
            {
                container.end_group();
            }
            container.last_line = tok.line;

            if let Some(c) = closer {
                if tok.is_symbol(c) {
                    self.advance();
                    return Ok(container.finish());
                }
            }

            match tok.kind {
                TokenKind::Symbol => match tok.text() {
                    ";" => {
                        self.advance();
                        container.end_group();
                    }
                    "," => {
                        self.advance();
                        // Commas after `some`/`every` separate declared
                        // variables inside one group rather than starting a
                        // list element.
                        let quantified = matches!(
                            container.current.first(),
                            Some(first) if first.is(Tag::Some)
                                || (first.is(Tag::Var) && first.text() == "every")
                        );
                        if !quantified {
                            container.end_group();
                            container.is_list = true;
                        }
                    }
                    "{" => {
                        self.advance();
                        let child = self.container(Tag::Brace, Some("}"))?;
                        let line = self.last_consumed_line();
                        container.push_token(child, tok.span, line);
                    }
                    "[" => {
                        self.advance();
                        let child = self.container(Tag::Square, Some("]"))?;
                        let line = self.last_consumed_line();
                        container.push_token(child, tok.span, line);
                    }
                    "(" => {
                        self.advance();
                        let child = self.container(Tag::Paren, Some(")"))?;
                        let line = self.last_consumed_line();
                        container.push_token(child, tok.span, line);
                    }
                    "}" | "]" | ")" => {
                        return Err(tok.span.error(&format!("unexpected {}", tok.text())));
                    }
                    _ => {
                        let tag = symbol_tag(tok.text())
                            .ok_or_else(|| tok.span.error("unexpected operator"))?;
                        self.advance();
                        let line = tok.line;
                        container.push_token(NodeDef::leaf(tag, tok.span.clone()), tok.span, line);
                    }
                },
                TokenKind::Ident => {
                    // `set()` is the empty set literal.
                    if tok.is_ident("set") && self.is_empty_parens_ahead() {
                        self.advance();
                        self.advance();
                        let close = self.advance();
                        let span = Span::new(tok.span.source.clone(), tok.span.start, close.span.end);
                        container.push_token(
                            NodeDef::leaf(Tag::EmptySet, span.clone()),
                            span,
                            close.line,
                        );
                        continue;
                    }
                    let tag = ident_tag(tok.text());
                    self.advance();
                    let line = tok.line;
                    container.push_token(NodeDef::leaf(tag, tok.span.clone()), tok.span, line);
                }
                TokenKind::Number => {
                    let tag = if crate::number::Number::text_is_int(tok.text()) {
                        Tag::Int
                    } else {
                        Tag::Float
                    };
                    self.advance();
                    let line = tok.line;
                    container.push_token(NodeDef::leaf(tag, tok.span.clone()), tok.span, line);
                }
                TokenKind::String => {
                    self.advance();
                    let line = tok.line;
                    container.push_token(
                        NodeDef::leaf(Tag::JsonString, tok.span.clone()),
                        tok.span,
                        line,
                    );
                }
                TokenKind::RawString => {
                    self.advance();
                    let line = tok.line;
                    container.push_token(
                        NodeDef::leaf(Tag::RawString, tok.span.clone()),
                        tok.span,
                        line,
                    );
                }
                TokenKind::Eof => unreachable!(),
            }
        }
    }

    fn last_consumed_line(&self) -> u32 {
        if self.pos == 0 {
            return 1;
        }
        self.tokens[self.pos - 1].line
    }

    fn is_empty_parens_ahead(&self) -> bool {
        matches!(
            (self.tokens.get(self.pos + 1), self.tokens.get(self.pos + 2)),
            (Some(a), Some(b)) if a.is_symbol("(") && b.is_symbol(")")
        )
    }
}

fn symbol_tag(text: &str) -> Option<Tag> {
    Some(match text {
        ":=" => Tag::Assign,
        "=" => Tag::Unify,
        "==" => Tag::Equals,
        "!=" => Tag::NotEquals,
        "<" => Tag::LessThan,
        ">" => Tag::GreaterThan,
        "<=" => Tag::LessThanOrEquals,
        ">=" => Tag::GreaterThanOrEquals,
        "+" => Tag::Add,
        "-" => Tag::Subtract,
        "*" => Tag::Multiply,
        "/" => Tag::Divide,
        "%" => Tag::Modulo,
        "&" => Tag::And,
        "|" => Tag::Or,
        "." => Tag::Dot,
        ":" => Tag::Colon,
        _ => return None,
    })
}

fn ident_tag(text: &str) -> Tag {
    match text {
        "true" => Tag::True,
        "false" => Tag::False,
        "null" => Tag::Null,
        "package" => Tag::Package,
        "import" => Tag::Import,
        "as" => Tag::As,
        "with" => Tag::With,
        "default" => Tag::Default,
        "some" => Tag::Some,
        "else" => Tag::Else,
        "not" => Tag::Not,
        "_" => Tag::Placeholder,
        // `in`, `contains`, `every` and `if` stay vars until the keywords
        // pass decides whether the module enables them.
        _ => Tag::Var,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(contents: &str) -> Node {
        let source = Source::from_contents("test.rego".to_string(), contents.to_string()).unwrap();
        parse(&source).unwrap()
    }

    fn file(node: &Node) -> &Node {
        node.front()
    }

    #[test]
    fn groups_split_on_newlines() {
        let top = parse_str("package p\nallow := true\ndeny := false");
        let groups = file(&top).children();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].front().tag(), Tag::Package);
        assert_eq!(groups[1].children()[1].tag(), Tag::Assign);
    }

    #[test]
    fn brace_bodies_hold_groups() {
        let top = parse_str("p if { x := 1\n y := 2; z := 3 }");
        let group = &file(&top).children()[0];
        let brace = group.back();
        assert_eq!(brace.tag(), Tag::Brace);
        assert_eq!(brace.len(), 3);
        assert!(brace.children().iter().all(|g| g.is(Tag::Group)));
    }

    #[test]
    fn commas_create_lists() {
        let top = parse_str("a := [1, 2, 3]");
        let group = &file(&top).children()[0];
        let square = group.back();
        assert_eq!(square.tag(), Tag::Square);
        assert_eq!(square.len(), 1);
        let list = square.front();
        assert_eq!(list.tag(), Tag::List);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn newlines_do_not_split_lists() {
        let top = parse_str("a := [\n 1,\n 2\n]");
        let square = file(&top).children()[0].back();
        assert_eq!(square.front().len(), 2);
    }

    #[test]
    fn empty_set_literal() {
        let top = parse_str("x := set()");
        let group = &file(&top).children()[0];
        assert_eq!(group.back().tag(), Tag::EmptySet);
    }

    #[test]
    fn else_continues_previous_group() {
        let top = parse_str("p := 1 {\n false\n}\nelse := 2 {\n true\n}");
        let groups = file(&top).children();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].children().iter().any(|t| t.is(Tag::Else)));
    }

    #[test]
    fn unbalanced_brace_is_an_error() {
        let source =
            Source::from_contents("test.rego".to_string(), "p { x := 1".to_string()).unwrap();
        assert!(parse(&source).is_err());
    }

    #[test]
    fn parse_tree_is_wellformed() {
        let top = parse_str("package p\nimport data.q\nallow if { input.x == 1 }");
        assert!(crate::wf::parser().validate(&top).is_ok());
    }
}
