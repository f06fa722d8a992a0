//! Hand-written scanner: byte cursor over source text, producing tokens on
//! demand with no heap allocation.
//!
//! Grounded on `examples/cartman-fr-vitte/crates/vitte-compiler/src/lib.rs`'s
//! `Lexer` for overall shape (cursor over `CharIndices`, line tracking,
//! `peek`/`peek2`/`bump`), generalized to the full clox token set and
//! semantics: two-character operator lookahead, a keyword trie instead of a
//! handful of `match` arms, and no string escapes (clox doesn't have them).

use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Identifier,
    String,
    Number,
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    Error,
    Eof,
}

/// A token: its kind, the exact source slice it spans, and the line it
/// starts on. `lexeme` borrows from the source string the [`Scanner`] was
/// built over, so scanning itself never allocates.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

pub struct Scanner<'src> {
    source: &'src str,
    chars: CharIndices<'src>,
    /// Byte offset of the token currently being scanned.
    start: usize,
    /// Byte offset of the next unconsumed character.
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self { source, chars: source.char_indices(), start: 0, current: 0, line: 1 }
    }

    /// Scans and returns the next token. Returns an `Error` token (not a
    /// `Result`) on lexical errors, matching clox: the compiler decides what
    /// to do with error tokens, the scanner never aborts.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        let Some(c) = self.advance() else {
            return self.make(TokenKind::Eof);
        };

        match c {
            '(' => self.make(TokenKind::LeftParen),
            ')' => self.make(TokenKind::RightParen),
            '{' => self.make(TokenKind::LeftBrace),
            '}' => self.make(TokenKind::RightBrace),
            ',' => self.make(TokenKind::Comma),
            '.' => self.make(TokenKind::Dot),
            '-' => self.make(TokenKind::Minus),
            '+' => self.make(TokenKind::Plus),
            ';' => self.make(TokenKind::Semicolon),
            '*' => self.make(TokenKind::Star),
            '/' => self.make(TokenKind::Slash),
            '!' => {
                let k = if self.matches('=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make(k)
            }
            '=' => {
                let k = if self.matches('=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make(k)
            }
            '<' => {
                let k = if self.matches('=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make(k)
            }
            '>' => {
                let k =
                    if self.matches('=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make(k)
            }
            '"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if is_ident_start(c) => self.identifier(),
            _ => self.error("unexpected character"),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if c == '"' {
                break;
            }
            if c == '\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.peek().is_none() {
            return self.error("unterminated string");
        }
        self.advance(); // closing quote
        self.make(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.advance(); // '.'
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_some_and(is_ident_continue) {
            self.advance();
        }
        let kind = keyword_kind(self.lexeme()).unwrap_or(TokenKind::Identifier);
        self.make(kind)
    }

    fn lexeme(&self) -> &'src str {
        &self.source[self.start..self.current]
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, lexeme: self.lexeme(), line: self.line }
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, lexeme: message, line: self.line }
    }

    fn advance(&mut self) -> Option<char> {
        let (i, c) = self.chars.next()?;
        self.current = i + c.len_utf8();
        Some(c)
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next().map(|(_, c)| c)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.clone().nth(n).map(|(_, c)| c)
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Keyword lookup, organized as a trie on the first character like clox's
/// `checkKeyword`, rather than one flat string-equality chain.
fn keyword_kind(s: &str) -> Option<TokenKind> {
    let mut chars = s.chars();
    let first = chars.next()?;
    let rest = chars.as_str();
    match first {
        'a' => keyword("nd", rest, TokenKind::And),
        'c' => keyword("lass", rest, TokenKind::Class),
        'e' => keyword("lse", rest, TokenKind::Else),
        'f' => match rest.chars().next() {
            Some('a') => keyword("alse", rest, TokenKind::False),
            Some('o') => keyword("or", rest, TokenKind::For),
            Some('u') => keyword("un", rest, TokenKind::Fun),
            _ => None,
        },
        'i' => keyword("f", rest, TokenKind::If),
        'n' => keyword("il", rest, TokenKind::Nil),
        'o' => keyword("r", rest, TokenKind::Or),
        'p' => keyword("rint", rest, TokenKind::Print),
        'r' => keyword("eturn", rest, TokenKind::Return),
        's' => keyword("uper", rest, TokenKind::Super),
        't' => match rest.chars().next() {
            Some('h') => keyword("his", rest, TokenKind::This),
            Some('r') => keyword("rue", rest, TokenKind::True),
            _ => None,
        },
        'v' => keyword("ar", rest, TokenKind::Var),
        'w' => keyword("hile", rest, TokenKind::While),
        _ => None,
    }
}

fn keyword(expected_rest: &str, actual_rest: &str, kind: TokenKind) -> Option<TokenKind> {
    (expected_rest == actual_rest).then_some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut s = Scanner::new(src);
        let mut out = Vec::new();
        loop {
            let t = s.scan_token();
            let done = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_punctuation_and_operators() {
        assert_eq!(
            kinds("(){},.-+;*/! != = == < <= > >="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        assert_eq!(
            kinds("and class foo forever fun function"),
            vec![
                TokenKind::And,
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Fun,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_numbers_and_strings() {
        let mut s = Scanner::new(r#"1 2.5 "hello world""#);
        let a = s.scan_token();
        assert_eq!(a.kind, TokenKind::Number);
        assert_eq!(a.lexeme, "1");
        let b = s.scan_token();
        assert_eq!(b.kind, TokenKind::Number);
        assert_eq!(b.lexeme, "2.5");
        let c = s.scan_token();
        assert_eq!(c.kind, TokenKind::String);
        assert_eq!(c.lexeme, "\"hello world\"");
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut s = Scanner::new("\"no closing quote");
        let t = s.scan_token();
        assert_eq!(t.kind, TokenKind::Error);
    }

    #[test]
    fn line_comments_are_skipped() {
        assert_eq!(kinds("// a comment\nvar"), vec![TokenKind::Var, TokenKind::Eof]);
    }

    #[test]
    fn tracks_line_numbers_across_newlines() {
        let mut s = Scanner::new("var\n\nx");
        let v = s.scan_token();
        assert_eq!(v.line, 1);
        let x = s.scan_token();
        assert_eq!(x.line, 3);
    }
}
