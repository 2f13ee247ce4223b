//! Tokenizer shared by schema and query source text.
//!
//! Qualified names (`glean.test.Expr.6`, `prim.toLower`) are lexed as a single
//! [`Token::Name`]; a `.` only continues a name when it is followed by a name
//! character, so `"a"..` and `X..` lex as a literal followed by [`Token::DotDot`].

use crate::FactDbError;
use std::fmt;

/// A lexical token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Name(String),
    Nat(u64),
    Str(String),
    Wild,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Semi,
    Eq,
    Pipe,
    DotDot,
    Dollar,
    Arrow,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(n) => write!(f, "{n}"),
            Self::Nat(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Wild => write!(f, "_"),
            Self::LBrace => write!(f, "{{"),
            Self::RBrace => write!(f, "}}"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::Comma => write!(f, ","),
            Self::Colon => write!(f, ":"),
            Self::Semi => write!(f, ";"),
            Self::Eq => write!(f, "="),
            Self::Pipe => write!(f, "|"),
            Self::DotDot => write!(f, ".."),
            Self::Dollar => write!(f, "$"),
            Self::Arrow => write!(f, "->"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// A token with its 1-based source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub col: usize,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenize source text. The result always ends with [`Token::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, FactDbError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut col = 1;

    let err = |line: usize, col: usize, message: String| FactDbError::Parse { line, col, message };

    while i < chars.len() {
        let c = chars[i];
        let (start_line, start_col) = (line, col);

        if c == '\n' {
            i += 1;
            line += 1;
            col = 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            col += 1;
            continue;
        }
        // Line comments: `#` and `//`
        if c == '#' || (c == '/' && chars.get(i + 1) == Some(&'/')) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        let advance = |n: usize, i: &mut usize, col: &mut usize| {
            *i += n;
            *col += n;
        };

        let token = match c {
            '{' => {
                advance(1, &mut i, &mut col);
                Token::LBrace
            }
            '}' => {
                advance(1, &mut i, &mut col);
                Token::RBrace
            }
            '[' => {
                advance(1, &mut i, &mut col);
                Token::LBracket
            }
            ']' => {
                advance(1, &mut i, &mut col);
                Token::RBracket
            }
            '(' => {
                advance(1, &mut i, &mut col);
                Token::LParen
            }
            ')' => {
                advance(1, &mut i, &mut col);
                Token::RParen
            }
            ',' => {
                advance(1, &mut i, &mut col);
                Token::Comma
            }
            ':' => {
                advance(1, &mut i, &mut col);
                Token::Colon
            }
            ';' => {
                advance(1, &mut i, &mut col);
                Token::Semi
            }
            '=' => {
                advance(1, &mut i, &mut col);
                Token::Eq
            }
            '|' => {
                advance(1, &mut i, &mut col);
                Token::Pipe
            }
            '$' => {
                advance(1, &mut i, &mut col);
                Token::Dollar
            }
            '-' if chars.get(i + 1) == Some(&'>') => {
                advance(2, &mut i, &mut col);
                Token::Arrow
            }
            '.' if chars.get(i + 1) == Some(&'.') => {
                advance(2, &mut i, &mut col);
                Token::DotDot
            }
            '"' => {
                let mut text = String::new();
                advance(1, &mut i, &mut col);
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(err(start_line, start_col, "unterminated string".into()));
                    };
                    match ch {
                        '"' => {
                            advance(1, &mut i, &mut col);
                            break;
                        }
                        '\\' => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('r') => '\r',
                                Some('"') => '"',
                                Some('\\') => '\\',
                                Some(other) => {
                                    return Err(err(
                                        line,
                                        col,
                                        format!("unknown escape sequence \\{other}"),
                                    ));
                                }
                                None => {
                                    return Err(err(line, col, "unterminated string".into()));
                                }
                            };
                            text.push(escaped);
                            advance(2, &mut i, &mut col);
                        }
                        '\n' => {
                            return Err(err(start_line, start_col, "newline in string".into()));
                        }
                        other => {
                            text.push(other);
                            advance(1, &mut i, &mut col);
                        }
                    }
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    advance(1, &mut i, &mut col);
                }
                let digits: String = chars[start..i].iter().collect();
                let n = digits
                    .parse::<u64>()
                    .map_err(|_| err(start_line, start_col, format!("number too large: {digits}")))?;
                Token::Nat(n)
            }
            c if is_name_start(c) => {
                let start = i;
                loop {
                    while i < chars.len() && is_name_char(chars[i]) {
                        advance(1, &mut i, &mut col);
                    }
                    // A dot continues the name only if a name character follows it.
                    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|&n| is_name_char(n)) {
                        advance(1, &mut i, &mut col);
                        continue;
                    }
                    break;
                }
                let name: String = chars[start..i].iter().collect();
                if name == "_" {
                    Token::Wild
                } else {
                    Token::Name(name)
                }
            }
            other => {
                return Err(err(start_line, start_col, format!("unexpected character {other:?}")));
            }
        };

        tokens.push(Spanned {
            token,
            line: start_line,
            col: start_col,
        });
    }

    tokens.push(Spanned {
        token: Token::Eof,
        line,
        col,
    });
    Ok(tokens)
}
