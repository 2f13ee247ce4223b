//! # Source Syntax
//!
//! Lexer and token cursor shared by the schema parser and the query parser.

pub mod lexer;

pub use lexer::{Spanned, Token, tokenize};

use crate::FactDbError;
use crate::primitives::MAX_NESTING_DEPTH;

/// A cursor over a token stream.
///
/// The stream always ends with [`Token::Eof`], so `peek` never runs off the end.
#[derive(Debug, Clone)]
pub struct Cursor {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Cursor {
    /// Tokenize `source` and position the cursor at the first token.
    pub fn new(source: &str) -> Result<Self, FactDbError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        })
    }

    fn at(&self, offset: usize) -> &Spanned {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    /// The current token.
    pub fn peek(&self) -> &Token {
        &self.at(0).token
    }

    /// The token after the current one.
    pub fn peek_second(&self) -> &Token {
        &self.at(1).token
    }

    /// Consume and return the current token.
    pub fn bump(&mut self) -> Token {
        let token = self.at(0).token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    /// Consume the current token if it equals `token`.
    pub fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Consume the given keyword (a bare name) if present.
    pub fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Token::Name(n) if n == keyword) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Require `token` at the cursor.
    pub fn expect(&mut self, token: &Token) -> Result<(), FactDbError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token}, found {}", self.peek())))
        }
    }

    /// Require the keyword at the cursor.
    pub fn expect_keyword(&mut self, keyword: &str) -> Result<(), FactDbError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{keyword}`, found {}", self.peek())))
        }
    }

    /// Require a name token and return it.
    pub fn expect_name(&mut self) -> Result<String, FactDbError> {
        match self.peek().clone() {
            Token::Name(name) => {
                self.bump();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found {other}"))),
        }
    }

    /// Whether the cursor is at end of input.
    pub fn at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    /// Enter one level of nesting. Fails past [`MAX_NESTING_DEPTH`] so that
    /// recursive descent cannot exhaust the stack.
    pub fn nest(&mut self) -> Result<(), FactDbError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING_DEPTH} levels")));
        }
        self.depth += 1;
        Ok(())
    }

    /// Leave a level entered with [`Cursor::nest`].
    pub fn unnest(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// A parse error at the current token.
    pub fn error(&self, message: impl Into<String>) -> FactDbError {
        let here = self.at(0);
        FactDbError::Parse {
            line: here.line,
            col: here.col,
            message: message.into(),
        }
    }
}

/// Split `name.N` into `(name, Some(N))`, or `(name, None)` when the last
/// segment is not numeric.
pub fn split_version(qualified: &str) -> (&str, Option<u32>) {
    match qualified.rsplit_once('.') {
        Some((name, version)) if !name.is_empty() => match version.parse::<u32>() {
            Ok(v) => (name, Some(v)),
            Err(_) => (qualified, None),
        },
        _ => (qualified, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_version_handles_both_forms() {
        assert_eq!(split_version("example.Class.1"), ("example.Class", Some(1)));
        assert_eq!(split_version("example.Class"), ("example.Class", None));
        assert_eq!(split_version("Class"), ("Class", None));
    }

    #[test]
    fn nesting_is_bounded() {
        let mut c = Cursor::new("x").expect("tokenize");
        for _ in 0..MAX_NESTING_DEPTH {
            c.nest().expect("within bound");
        }
        assert!(matches!(c.nest(), Err(FactDbError::Parse { .. })));
        c.unnest();
        c.nest().expect("room after leaving a level");
    }

    #[test]
    fn cursor_expectations() {
        let mut c = Cursor::new("schema x.1 {").expect("lex");
        c.expect_keyword("schema").expect("keyword");
        assert_eq!(c.expect_name().expect("name"), "x.1");
        assert!(c.eat(&Token::LBrace));
        assert!(c.at_end());
        // Bumping at end stays at end.
        assert_eq!(c.bump(), Token::Eof);
        assert!(c.at_end());
    }

    #[test]
    fn cursor_error_carries_position() {
        let mut c = Cursor::new("\n  }").expect("lex");
        let err = c.expect(&Token::LBrace).expect_err("should fail");
        assert!(matches!(err, FactDbError::Parse { line: 2, col: 3, .. }));
    }
}
