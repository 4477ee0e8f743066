//! Source text → token stream.
//!
//! The lexer runs to completion before parsing starts and produces a flat
//! `Vec<Token>` with byte spans and line/column positions. Interpolated
//! strings are segmented here: `"a${x}b"` lexes as
//! `StrSegment("a) InterpStart Identifier(x) InterpEnd StrSegment(b")`,
//! which lets the single-pass compiler emit concatenation code without
//! re-scanning. Tokens tile the source exactly (interleaved only with
//! whitespace and comments), so diagnostics can always point back at the
//! original text.

use crate::{
    error::{Diagnostic, ErrorKind},
    token::{Token, TokenKind},
};

/// Lexes `source`, returning the token stream and any lex diagnostics.
///
/// Errors do not abort lexing: an unterminated string or unknown character
/// produces an `Error` token (so downstream consumers still have a position)
/// and lexing continues where possible.
pub fn lex(source: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lexer = Lexer::new(source);
    lexer.run();
    (lexer.tokens, lexer.diagnostics)
}

/// Open interpolation hole: which string form it belongs to and how many
/// unmatched `{` have been seen inside the hole.
struct InterpFrame {
    triple: bool,
    brace_depth: u32,
}

struct Lexer<'src> {
    source: &'src str,
    pos: usize,
    line: u32,
    col: u32,
    tokens: Vec<Token>,
    diagnostics: Vec<Diagnostic>,
    interp: Vec<InterpFrame>,
}

impl<'src> Lexer<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            diagnostics: Vec::new(),
            interp: Vec::new(),
        }
    }

    fn run(&mut self) {
        loop {
            self.skip_trivia();
            if self.at_end() {
                break;
            }
            self.scan_token();
        }
        let eof = Token {
            kind: TokenKind::Eof,
            start: self.pos as u32,
            len: 0,
            line: self.line,
            col: self.col,
        };
        self.tokens.push(eof);
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> char {
        let c = self.peek().expect("advance past end of source");
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        c
    }

    /// Consumes the next character if it equals `expected`.
    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Position marker taken before scanning a token.
    fn mark(&self) -> (usize, u32, u32) {
        (self.pos, self.line, self.col)
    }

    fn push_token(&mut self, kind: TokenKind, mark: (usize, u32, u32)) {
        let (start, line, col) = mark;
        self.tokens.push(Token {
            kind,
            start: start as u32,
            len: (self.pos - start) as u32,
            line,
            col,
        });
    }

    fn error_at(&mut self, message: impl Into<String>, mark: (usize, u32, u32)) {
        let (start, line, col) = mark;
        let token = Token {
            kind: TokenKind::Error,
            start: start as u32,
            len: (self.pos - start) as u32,
            line,
            col,
        };
        self.tokens.push(token);
        self.diagnostics.push(Diagnostic::new(ErrorKind::Lex, message, token));
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let mark = self.mark();
                    self.advance();
                    self.advance();
                    // Block comments do not nest; the first `*/` terminates.
                    loop {
                        if self.at_end() {
                            self.error_at("unterminated block comment", mark);
                            return;
                        }
                        if self.peek() == Some('*') && self.peek_second() == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn scan_token(&mut self) {
        let mark = self.mark();
        let c = self.advance();
        match c {
            '(' => self.push_token(TokenKind::LeftParen, mark),
            ')' => self.push_token(TokenKind::RightParen, mark),
            '[' => self.push_token(TokenKind::LeftBracket, mark),
            ']' => self.push_token(TokenKind::RightBracket, mark),
            ',' => self.push_token(TokenKind::Comma, mark),
            '.' => self.push_token(TokenKind::Dot, mark),
            ';' => self.push_token(TokenKind::Semicolon, mark),
            ':' => self.push_token(TokenKind::Colon, mark),
            '+' => self.push_token(TokenKind::Plus, mark),
            '*' => self.push_token(TokenKind::Star, mark),
            '/' => self.push_token(TokenKind::Slash, mark),
            '%' => self.push_token(TokenKind::Percent, mark),
            '-' => {
                let kind = if self.matches('>') { TokenKind::Arrow } else { TokenKind::Minus };
                self.push_token(kind, mark);
            }
            '!' => {
                let kind = if self.matches('=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.push_token(kind, mark);
            }
            '=' => {
                let kind = if self.matches('=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.push_token(kind, mark);
            }
            '<' => {
                let kind = if self.matches('=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.push_token(kind, mark);
            }
            '>' => {
                let kind = if self.matches('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.push_token(kind, mark);
            }
            '?' => {
                let kind = if self.matches('.') {
                    TokenKind::QuestionDot
                } else {
                    TokenKind::Question
                };
                self.push_token(kind, mark);
            }
            '{' => {
                if let Some(frame) = self.interp.last_mut() {
                    frame.brace_depth += 1;
                }
                self.push_token(TokenKind::LeftBrace, mark);
            }
            '}' => match self.interp.last_mut() {
                Some(frame) if frame.brace_depth == 0 => {
                    let triple = frame.triple;
                    self.interp.pop();
                    self.push_token(TokenKind::InterpEnd, mark);
                    self.scan_string_body(triple, None);
                }
                Some(frame) => {
                    frame.brace_depth -= 1;
                    self.push_token(TokenKind::RightBrace, mark);
                }
                None => self.push_token(TokenKind::RightBrace, mark),
            },
            '"' => {
                let triple = self.peek() == Some('"') && self.peek_second() == Some('"');
                if triple {
                    self.advance();
                    self.advance();
                }
                self.scan_string_body(triple, Some(mark));
            }
            c if c.is_ascii_digit() => self.scan_number(mark),
            c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier(mark),
            c => self.error_at(format!("unknown character {c:?}"), mark),
        }
    }

    /// Scans a string from just past the opening quotes (`opening` carries
    /// the mark of the opening quote) or from just after an interpolation's
    /// closing `}` (`opening == None`).
    fn scan_string_body(&mut self, triple: bool, opening: Option<(usize, u32, u32)>) {
        // Segment spans start at the opening quote when this is the first
        // segment of the literal.
        let mark = opening.unwrap_or_else(|| self.mark());
        loop {
            if self.at_end() {
                self.error_at("unterminated string", mark);
                return;
            }
            let c = self.peek().expect("checked not at end");
            if !triple && c == '\n' {
                self.error_at("unterminated string", mark);
                return;
            }
            if c == '\\' {
                self.advance();
                if !self.at_end() {
                    self.advance();
                }
                continue;
            }
            if c == '$' && self.peek_second() == Some('{') {
                self.push_token(TokenKind::StrSegment, mark);
                let interp_mark = self.mark();
                self.advance();
                self.advance();
                self.push_token(TokenKind::InterpStart, interp_mark);
                self.interp.push(InterpFrame {
                    triple,
                    brace_depth: 0,
                });
                return;
            }
            if c == '"' {
                if triple {
                    if self.peek_second() == Some('"') && {
                        let mut chars = self.source[self.pos..].chars();
                        chars.next();
                        chars.next();
                        chars.next() == Some('"')
                    } {
                        self.advance();
                        self.advance();
                        self.advance();
                        let kind = if opening.is_some() { TokenKind::Str } else { TokenKind::StrSegment };
                        self.push_token(kind, mark);
                        return;
                    }
                    // A lone quote inside a triple-quoted string is literal.
                    self.advance();
                    continue;
                }
                self.advance();
                let kind = if opening.is_some() { TokenKind::Str } else { TokenKind::StrSegment };
                self.push_token(kind, mark);
                return;
            }
            self.advance();
        }
    }

    fn scan_number(&mut self, mark: (usize, u32, u32)) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let after = self.peek_second();
            let signed = matches!(after, Some('+' | '-'));
            let digits_follow = if signed {
                let mut chars = self.source[self.pos..].chars();
                chars.next();
                chars.next();
                chars.next().is_some_and(|c| c.is_ascii_digit())
            } else {
                after.is_some_and(|c| c.is_ascii_digit())
            };
            if digits_follow {
                self.advance();
                if signed {
                    self.advance();
                }
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        self.push_token(TokenKind::Number, mark);
    }

    fn scan_identifier(&mut self, mark: (usize, u32, u32)) {
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.advance();
        }
        let text = &self.source[mark.0..self.pos];
        let kind = TokenKind::keyword(text).unwrap_or(TokenKind::Identifier);
        self.push_token(kind, mark);
    }
}

/// Decodes the escape sequences of a string segment's raw text.
///
/// `raw` is the segment text with quotes already stripped. Unknown escapes
/// keep the escaped character as written.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, diagnostics) = lex(source);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators_and_keywords() {
        use TokenKind::*;
        assert_eq!(
            kinds("let x = a ?. b != 2;"),
            vec![Let, Identifier, Equal, Identifier, QuestionDot, Identifier, BangEqual, Number, Semicolon, Eof]
        );
    }

    #[test]
    fn interpolation_segments() {
        use TokenKind::*;
        assert_eq!(
            kinds(r#""a${x + 3}b""#),
            vec![StrSegment, InterpStart, Identifier, Plus, Number, InterpEnd, StrSegment, Eof]
        );
    }

    #[test]
    fn plain_string_is_one_token() {
        let (tokens, diagnostics) = lex(r#""hello\n""#);
        assert!(diagnostics.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].len, 9);
    }

    #[test]
    fn nested_braces_inside_interpolation() {
        use TokenKind::*;
        assert_eq!(
            kinds(r#""v=${ {"k": 1} }""#),
            vec![
                StrSegment,
                InterpStart,
                LeftBrace,
                Str,
                Colon,
                Number,
                RightBrace,
                InterpEnd,
                StrSegment,
                Eof
            ]
        );
    }

    #[test]
    fn triple_quoted_preserves_newlines_and_quotes() {
        let source = "\"\"\"line \"one\"\nline two\"\"\"";
        let (tokens, diagnostics) = lex(source);
        assert!(diagnostics.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text(source), source);
    }

    #[test]
    fn comments_are_trivia() {
        use TokenKind::*;
        assert_eq!(kinds("1 // line\n/* block */ 2"), vec![Number, Number, Eof]);
    }

    #[test]
    fn block_comment_ends_at_first_terminator() {
        use TokenKind::*;
        // `/* a /* b */` terminates at the first `*/`; the rest lexes normally.
        assert_eq!(kinds("/* a /* b */ c"), vec![Identifier, Eof]);
    }

    #[test]
    fn unterminated_string_reports_and_recovers() {
        let (tokens, diagnostics) = lex("let s = \"oops");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, crate::error::ErrorKind::Lex);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
    }

    #[test]
    fn tokens_tile_the_source() {
        let source = "fun f(a, b) { return \"x${a}y\" + b; } // tail\n";
        let (tokens, diagnostics) = lex(source);
        assert!(diagnostics.is_empty());
        // Concatenating token text with the skipped trivia in between
        // reconstructs the source exactly.
        let mut rebuilt = String::new();
        let mut cursor = 0usize;
        for token in &tokens {
            let start = token.start as usize;
            rebuilt.push_str(&source[cursor..start]);
            rebuilt.push_str(token.text(source));
            cursor = start + token.len as usize;
        }
        rebuilt.push_str(&source[cursor..]);
        assert_eq!(rebuilt, source);
    }

    #[test]
    fn unescape_handles_known_escapes() {
        assert_eq!(unescape(r"a\nb\t\\\x"), "a\nb\t\\x");
    }

    #[test]
    fn number_forms() {
        use TokenKind::*;
        assert_eq!(kinds("1 2.5 1e9 3.5e-2 1.foo"), vec![
            Number, Number, Number, Number, Number, Dot, Identifier, Eof
        ]);
    }
}
