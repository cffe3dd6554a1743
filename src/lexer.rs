// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::cmp;
use core::fmt::{self, Debug, Formatter};
use core::iter::Peekable;
use core::str::CharIndices;

use crate::Rc;
use anyhow::{anyhow, bail, Result};

#[derive(Clone)]
struct SourceInternal {
    pub file: String,
    pub contents: String,
    // (start, end) byte offsets of each line, excluding the newline.
    pub lines: Vec<(u32, u32)>,
}

/// A policy file or synthetic source string.
#[derive(Clone)]
pub struct Source {
    src: Rc<SourceInternal>,
}

impl Source {
    pub fn from_contents(file: String, contents: String) -> Result<Source> {
        if contents.len() > u32::MAX as usize {
            bail!("{file} exceeds maximum allowed source size");
        }
        let mut lines = vec![];
        let mut prev_ch = ' ';
        let mut prev_pos = 0u32;
        let mut start = 0u32;
        for (i, ch) in contents.char_indices() {
            let i = i as u32;
            if ch == '\n' {
                let end = match prev_ch {
                    '\r' => prev_pos,
                    _ => i,
                };
                lines.push((start, end));
                start = i + 1;
            }
            prev_ch = ch;
            prev_pos = i;
        }

        if (start as usize) < contents.len() {
            lines.push((start, contents.len() as u32));
        } else if contents.is_empty() {
            lines.push((0, 0));
        }

        Ok(Self {
            src: Rc::new(SourceInternal {
                file,
                contents,
                lines,
            }),
        })
    }

    /// A source that exists only in memory, e.g. the query string or a file
    /// reconstituted from a binary bundle.
    pub fn synthetic(origin: &str, contents: String) -> Source {
        // Synthetic contents are produced internally and stay within bounds.
        Self::from_contents(origin.to_string(), contents).unwrap_or_else(|_| Source {
            src: Rc::new(SourceInternal {
                file: origin.to_string(),
                contents: String::default(),
                lines: vec![(0, 0)],
            }),
        })
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Source> {
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => bail!("Failed to read {}. {e}", path.as_ref().display()),
        };
        Self::from_contents(path.as_ref().to_string_lossy().to_string(), contents)
    }

    pub fn file(&self) -> &String {
        &self.src.file
    }

    pub fn contents(&self) -> &String {
        &self.src.contents
    }

    pub fn line(&self, idx: u32) -> &str {
        match self.src.lines.get(idx as usize) {
            Some(&(start, end)) => self
                .src
                .contents
                .get(start as usize..end as usize)
                .unwrap_or(""),
            None => "",
        }
    }

    /// Line (1-based) and column (1-based) of a byte offset.
    pub fn line_col(&self, pos: u32) -> (u32, u32) {
        let lines = &self.src.lines;
        let idx = match lines.binary_search_by(|&(start, _)| start.cmp(&pos)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let (start, _) = lines.get(idx).copied().unwrap_or((0, 0));
        (idx as u32 + 1, pos.saturating_sub(start) + 1)
    }

    pub fn message(&self, line: u32, col: u32, kind: &str, msg: &str) -> String {
        if line as usize > self.src.lines.len() {
            return format!("{}: invalid line {} specified", self.src.file, line);
        }

        let line_str = format!("{line}");
        let line_num_width = line_str.len() + 1;
        let col_spaces = (col as usize).saturating_sub(1);

        format!(
            "\n--> {}:{}:{}\n{:<line_num_width$}|\n\
	     {:<line_num_width$}| {}\n\
	     {:<line_num_width$}| {:<col_spaces$}^\n\
	     {}: {}",
            self.src.file,
            line,
            col,
            "",
            line,
            self.line(line.saturating_sub(1)),
            "",
            "",
            kind,
            msg
        )
    }

    pub fn error(&self, line: u32, col: u32, msg: &str) -> anyhow::Error {
        anyhow!(self.message(line, col, "error", msg))
    }
}

impl cmp::Ord for Source {
    fn cmp(&self, other: &Source) -> cmp::Ordering {
        Rc::as_ptr(&self.src).cmp(&Rc::as_ptr(&other.src))
    }
}

impl cmp::PartialOrd for Source {
    fn partial_cmp(&self, other: &Source) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        Rc::as_ptr(&self.src) == Rc::as_ptr(&other.src)
    }
}

impl cmp::Eq for Source {}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.src.file.fmt(f)
    }
}

/// A view into a [`Source`]: byte offset plus length.
///
/// Two spans compare equal when their string contents compare equal, which
/// lets names minted from different files coincide.
#[derive(Clone)]
pub struct Span {
    pub source: Source,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub const fn new(source: Source, start: u32, end: u32) -> Self {
        Self { source, start, end }
    }

    pub fn text(&self) -> &str {
        self.source
            .contents()
            .get(self.start as usize..self.end as usize)
            .unwrap_or("<invalid-span>")
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn line_col(&self) -> (u32, u32) {
        self.source.line_col(self.start)
    }

    pub fn message(&self, kind: &str, msg: &str) -> String {
        let (line, col) = self.line_col();
        self.source.message(line, col, kind, msg)
    }

    pub fn error(&self, msg: &str) -> anyhow::Error {
        let (line, col) = self.line_col();
        self.source.error(line, col, msg)
    }
}

impl cmp::PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        self.text() == other.text()
    }
}

impl cmp::Eq for Span {}

impl cmp::PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for Span {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.text().cmp(other.text())
    }
}

impl core::hash::Hash for Span {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.text().hash(state);
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let t = self.text().escape_debug().to_string();
        let max = 32;
        let (txt, trailer) = if t.len() > max {
            (&t[0..max], "...")
        } else {
            (t.as_str(), "")
        };
        let (line, col) = self.line_col();
        f.write_fmt(format_args!("{}:{}, \"{}{}\"", line, col, txt, trailer))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self.text(), f)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TokenKind {
    Symbol,
    String,
    RawString,
    Number,
    Ident,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Line the token starts on. The grouping parser uses line changes to
    /// terminate groups outside list contexts.
    pub line: u32,
}

impl Token {
    pub fn text(&self) -> &str {
        self.span.text()
    }

    pub fn is_symbol(&self, s: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text() == s
    }

    pub fn is_ident(&self, s: &str) -> bool {
        self.kind == TokenKind::Ident && self.text() == s
    }
}

pub struct Lexer<'source> {
    source: Source,
    iter: Peekable<CharIndices<'source>>,
    line: u32,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source Source) -> Self {
        Self {
            source: source.clone(),
            iter: source.contents().char_indices().peekable(),
            line: 1,
        }
    }

    fn offset(&mut self) -> u32 {
        match self.iter.peek() {
            Some((i, _)) => *i as u32,
            None => self.source.contents().len() as u32,
        }
    }

    fn token(&self, kind: TokenKind, start: u32, end: u32) -> Token {
        Token {
            kind,
            span: Span::new(self.source.clone(), start, end),
            line: self.line,
        }
    }

    fn read_ident(&mut self, start: u32) -> Token {
        while let Some((_, c)) = self.iter.peek() {
            if c.is_alphanumeric() || *c == '_' {
                self.iter.next();
            } else {
                break;
            }
        }
        let end = self.offset();
        self.token(TokenKind::Ident, start, end)
    }

    fn read_digits(&mut self) {
        while let Some((_, c)) = self.iter.peek() {
            if c.is_ascii_digit() {
                self.iter.next();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self, start: u32) -> Result<Token> {
        self.read_digits();

        if let Some((_, '.')) = self.iter.peek() {
            // Distinguish `1.5` from the ref `a[1].b`: a dot not followed by
            // a digit belongs to the enclosing group.
            let mut ahead = self.iter.clone();
            ahead.next();
            if matches!(ahead.peek(), Some((_, c)) if c.is_ascii_digit()) {
                self.iter.next();
                self.read_digits();
            }
        }

        if matches!(self.iter.peek(), Some((_, 'e' | 'E'))) {
            self.iter.next();
            if matches!(self.iter.peek(), Some((_, '+' | '-'))) {
                self.iter.next();
            }
            if !matches!(self.iter.peek(), Some((_, c)) if c.is_ascii_digit()) {
                let end = self.offset();
                let span = Span::new(self.source.clone(), start, end);
                return Err(span.error("missing exponent"));
            }
            self.read_digits();
        }

        let end = self.offset();
        Ok(self.token(TokenKind::Number, start, end))
    }

    fn read_string(&mut self, start: u32) -> Result<Token> {
        // Opening quote already consumed.
        loop {
            match self.iter.next() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match self.iter.next() {
                    Some((_, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't')) => (),
                    Some((_, 'u')) => {
                        for _ in 0..4 {
                            match self.iter.next() {
                                Some((_, c)) if c.is_ascii_hexdigit() => (),
                                _ => {
                                    let end = self.offset();
                                    let span = Span::new(self.source.clone(), start, end);
                                    return Err(span.error("invalid unicode escape"));
                                }
                            }
                        }
                    }
                    _ => {
                        let end = self.offset();
                        let span = Span::new(self.source.clone(), start, end);
                        return Err(span.error("invalid escape sequence"));
                    }
                },
                Some((_, '\n')) | None => {
                    let span = Span::new(self.source.clone(), start, start + 1);
                    return Err(span.error("unmatched \""));
                }
                Some((_, _)) => (),
            }
        }
        let end = self.offset();
        Ok(self.token(TokenKind::String, start, end))
    }

    fn read_raw_string(&mut self, start: u32) -> Result<Token> {
        loop {
            match self.iter.next() {
                Some((_, '`')) => break,
                Some((_, '\n')) => {
                    self.line += 1;
                }
                Some((_, _)) => (),
                None => {
                    let span = Span::new(self.source.clone(), start, start + 1);
                    return Err(span.error("unmatched `"));
                }
            }
        }
        let end = self.offset();
        Ok(self.token(TokenKind::RawString, start, end))
    }

    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            let start = self.offset();
            match self.iter.next() {
                None => {
                    return Ok(self.token(TokenKind::Eof, start, start));
                }
                Some((_, '\n')) => {
                    self.line += 1;
                }
                Some((_, c)) if c.is_whitespace() => (),
                Some((_, '#')) => {
                    // Comment runs to end of line.
                    while let Some((_, c)) = self.iter.peek() {
                        if *c == '\n' {
                            break;
                        }
                        self.iter.next();
                    }
                }
                Some((_, '"')) => return self.read_string(start),
                Some((_, '`')) => return self.read_raw_string(start),
                Some((_, c)) if c.is_ascii_digit() => return self.read_number(start),
                Some((_, c)) if c.is_alphabetic() || c == '_' => {
                    return Ok(self.read_ident(start))
                }
                Some((_, c)) => {
                    // Two-character operators first.
                    let two = matches!(
                        (c, self.iter.peek()),
                        (':', Some((_, '=')))
                            | ('=', Some((_, '=')))
                            | ('!', Some((_, '=')))
                            | ('<', Some((_, '=')))
                            | ('>', Some((_, '=')))
                    );
                    if two {
                        self.iter.next();
                        let end = self.offset();
                        return Ok(self.token(TokenKind::Symbol, start, end));
                    }

                    match c {
                        '{' | '}' | '[' | ']' | '(' | ')' | ',' | ';' | ':' | '.' | '=' | '<'
                        | '>' | '+' | '-' | '*' | '/' | '%' | '&' | '|' | '!' => {
                            let end = self.offset();
                            return Ok(self.token(TokenKind::Symbol, start, end));
                        }
                        _ => {
                            let span = Span::new(self.source.clone(), start, start + 1);
                            return Err(span.error(&format!("unexpected character {c:?}")));
                        }
                    }
                }
            }
        }
    }

    /// Tokenize the whole source, ending with an Eof token.
    pub fn tokens(mut self) -> Result<Vec<Token>> {
        let mut tokens = vec![];
        loop {
            let tok = self.next_token()?;
            let eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if eof {
                return Ok(tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(contents: &str) -> Vec<Token> {
        let source = Source::from_contents("test.rego".to_string(), contents.to_string()).unwrap();
        Lexer::new(&source).tokens().unwrap()
    }

    #[test]
    fn tokenizes_rule() {
        let tokens = lex("allow := true");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text()).collect();
        assert_eq!(texts, vec!["allow", ":=", "true", ""]);
        assert_eq!(tokens[0].kind, TokenKind::Ident);
        assert_eq!(tokens[1].kind, TokenKind::Symbol);
    }

    #[test]
    fn tokenizes_numbers_and_refs() {
        let tokens = lex("a[1].b == 1.5e3");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text()).collect();
        assert_eq!(texts, vec!["a", "[", "1", "]", ".", "b", "==", "1.5e3", ""]);
    }

    #[test]
    fn tracks_lines_and_skips_comments() {
        let tokens = lex("a = 1 # one\nb = 2");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text()).collect();
        assert_eq!(texts, vec!["a", "=", "1", "b", "=", "2", ""]);
        assert_eq!(tokens[2].line, 1);
        assert_eq!(tokens[3].line, 2);
    }

    #[test]
    fn strings_and_raw_strings() {
        let tokens = lex(r#"x := "a\nb"; y := `raw`"#);
        assert_eq!(tokens[2].kind, TokenKind::String);
        assert_eq!(tokens[2].text(), r#""a\nb""#);
        assert_eq!(tokens[6].kind, TokenKind::RawString);
    }

    #[test]
    fn rejects_unterminated_string() {
        let source =
            Source::from_contents("test.rego".to_string(), "x := \"abc".to_string()).unwrap();
        assert!(Lexer::new(&source).tokens().is_err());
    }

    #[test]
    fn span_equality_is_textual() {
        let a = lex("foo bar foo");
        assert_eq!(a[0].span, a[2].span);
        assert_ne!(a[0].span, a[1].span);
    }
}
