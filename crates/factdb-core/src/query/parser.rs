//! # Query Parser
//!
//! Recursive descent over the shared [`Cursor`]. The statement and pattern
//! entry points are also used by the schema parser for derived predicates.

use super::ast::{Pattern, Query, Source, Statement};
use crate::FactDbError;
use crate::primitives::MAX_QUERY_LENGTH;
use crate::syntax::{Cursor, Token, split_version};

/// Parse complete query text.
pub fn parse_query(text: &str) -> Result<Query, FactDbError> {
    if text.len() > MAX_QUERY_LENGTH {
        return Err(FactDbError::Parse {
            line: 1,
            col: 1,
            message: format!("query exceeds {MAX_QUERY_LENGTH} bytes"),
        });
    }
    let mut cursor = Cursor::new(text)?;
    let query = statements(&mut cursor)?;
    if !cursor.at_end() {
        return Err(cursor.error(format!("unexpected {}", cursor.peek())));
    }
    Ok(query)
}

/// Parse `stmt ((';' | '|') stmt)*`. Stops at the first token that is
/// neither a separator nor the start of another statement.
pub(crate) fn statements(c: &mut Cursor) -> Result<Query, FactDbError> {
    let mut statements = vec![statement(c)?];
    while c.eat(&Token::Semi) || c.eat(&Token::Pipe) {
        if matches!(c.peek(), Token::Eof | Token::RBrace) {
            break;
        }
        statements.push(statement(c)?);
    }
    Ok(Query { statements })
}

fn statement(c: &mut Cursor) -> Result<Statement, FactDbError> {
    let first = source(c)?;
    if c.eat(&Token::Eq) {
        let bind = into_pattern(first).ok_or_else(|| c.error("left side of `=` is not a pattern"))?;
        let source = source(c)?;
        return Ok(Statement {
            bind: Some(bind),
            source,
        });
    }
    let source = match first {
        Source::Expr(Pattern::Nat(id)) => Source::FactId(id),
        Source::Expr(Pattern::Tuple(items)) => match items.as_slice() {
            [Pattern::Nat(id)] => Source::FactId(*id),
            _ => Source::Expr(Pattern::Tuple(items)),
        },
        other => other,
    };
    Ok(Statement { bind: None, source })
}

fn into_pattern(source: Source) -> Option<Pattern> {
    match source {
        Source::Expr(p) => Some(p),
        Source::Predicate {
            name,
            version: None,
            pattern: None,
            value: None,
        } if is_variable(&name) => Some(Pattern::Var(name)),
        _ => None,
    }
}

pub(crate) fn is_variable(name: &str) -> bool {
    !name.contains('.') && name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn starts_pattern(token: &Token) -> bool {
    match token {
        Token::LBrace | Token::LBracket | Token::LParen | Token::Str(_) | Token::Nat(_) | Token::Wild => true,
        Token::Name(n) => n == "true" || n == "false" || is_variable(n),
        _ => false,
    }
}

fn source(c: &mut Cursor) -> Result<Source, FactDbError> {
    if c.eat(&Token::Dollar) {
        return match c.bump() {
            Token::Nat(id) => Ok(Source::FactId(id)),
            other => Err(c.error(format!("expected a fact id after `$`, found {other}"))),
        };
    }
    if let Token::Name(name) = c.peek().clone() {
        if let Some(prim) = name.strip_prefix("prim.") {
            let prim = prim.to_string();
            c.bump();
            let arg = pattern(c)?;
            return Ok(Source::Prim { name: prim, arg });
        }
        let is_predicate = name != "true"
            && name != "false"
            && (name.contains('.')
                || name.chars().next().is_some_and(|ch| ch.is_ascii_lowercase())
                || is_variable(&name));
        if is_predicate {
            c.bump();
            let (base, version) = split_version(&name);
            let pattern = if starts_pattern(c.peek()) {
                Some(pattern(c)?)
            } else {
                None
            };
            let value = if pattern.is_some() && c.eat(&Token::Arrow) {
                Some(self::pattern(c)?)
            } else {
                None
            };
            return Ok(Source::Predicate {
                name: base.to_string(),
                version,
                pattern,
                value,
            });
        }
    }
    Ok(Source::Expr(pattern(c)?))
}

/// Parse one pattern, including a trailing `..`.
pub(crate) fn pattern(c: &mut Cursor) -> Result<Pattern, FactDbError> {
    c.nest()?;
    let parsed = suffixed(c);
    c.unnest();
    parsed
}

fn suffixed(c: &mut Cursor) -> Result<Pattern, FactDbError> {
    let primary = primary(c)?;
    if c.eat(&Token::DotDot) {
        return Ok(match primary {
            Pattern::String(s) => Pattern::Prefix(s),
            other => Pattern::NoExpand(Box::new(other)),
        });
    }
    Ok(primary)
}

fn primary(c: &mut Cursor) -> Result<Pattern, FactDbError> {
    match c.peek().clone() {
        Token::Wild => {
            c.bump();
            Ok(Pattern::Wild)
        }
        Token::Nat(n) => {
            c.bump();
            Ok(Pattern::Nat(n))
        }
        Token::Str(s) => {
            c.bump();
            Ok(Pattern::String(s))
        }
        Token::Name(n) if n == "true" || n == "false" => {
            c.bump();
            Ok(Pattern::Bool(n == "true"))
        }
        Token::Name(n) if is_variable(&n) => {
            c.bump();
            Ok(Pattern::Var(n))
        }
        Token::LParen => {
            c.bump();
            let inner = pattern(c)?;
            c.expect(&Token::RParen)?;
            Ok(inner)
        }
        Token::LBracket => {
            c.bump();
            let mut items = Vec::new();
            if !c.eat(&Token::RBracket) {
                loop {
                    items.push(pattern(c)?);
                    if c.eat(&Token::RBracket) {
                        break;
                    }
                    c.expect(&Token::Comma)?;
                }
            }
            Ok(Pattern::Array(items))
        }
        Token::LBrace => {
            c.bump();
            if c.eat(&Token::RBrace) {
                return Ok(Pattern::Fields(Vec::new()));
            }
            let named = matches!(c.peek(), Token::Name(_)) && c.peek_second() == &Token::Eq;
            if named {
                let mut fields = Vec::new();
                loop {
                    let name = c.expect_name()?;
                    c.expect(&Token::Eq)?;
                    fields.push((name, pattern(c)?));
                    if c.eat(&Token::RBrace) {
                        break;
                    }
                    c.expect(&Token::Comma)?;
                }
                Ok(Pattern::Fields(fields))
            } else {
                let mut items = Vec::new();
                loop {
                    items.push(pattern(c)?);
                    if c.eat(&Token::RBrace) {
                        break;
                    }
                    c.expect(&Token::Comma)?;
                }
                Ok(Pattern::Tuple(items))
            }
        }
        other => Err(c.error(format!("expected a pattern, found {other}"))),
    }
}
