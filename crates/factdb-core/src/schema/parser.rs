//! # Schema Source Parser
//!
//! ```text
//! schema example.2 : example.1 {
//!   import sys.1
//!   type Loc = { line : nat, column : nat = 1 }
//!   predicate Class : { name : string, loc : Loc }
//!   predicate Named : string -> Class
//!   predicate Foo : string S where Class { S, _ }
//! }
//! ```
//!
//! Declarations are unresolved here; names are resolved at registration.

use super::SchemaRef;
use crate::FactDbError;
use crate::query::ast::{Pattern, Query};
use crate::query::parser::{pattern, statements};
use crate::syntax::{Cursor, Token, split_version};
use serde::{Deserialize, Serialize};

/// An unresolved schema declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDecl {
    pub name: String,
    pub version: u32,
    pub inherits: Vec<SchemaRef>,
    pub imports: Vec<SchemaRef>,
    pub items: Vec<SchemaItem>,
}

impl SchemaDecl {
    #[must_use]
    pub fn id(&self) -> SchemaRef {
        SchemaRef {
            name: self.name.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaItem {
    Type {
        name: String,
        ty: TypeExpr,
    },
    Predicate {
        name: String,
        key: TypeExpr,
        value: Option<TypeExpr>,
        derivation: Option<(Pattern, Query)>,
    },
}

/// A type as written in source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeExpr {
    Byte,
    Nat,
    Bool,
    String,
    Array(Box<TypeExpr>),
    Record(Vec<FieldExpr>),
    Sum(Vec<FieldExpr>),
    Maybe(Box<TypeExpr>),
    Enum(Vec<String>),
    /// An alias or predicate name, optionally versioned.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldExpr {
    pub name: String,
    pub ty: TypeExpr,
    pub default: Option<Literal>,
}

/// A default-value literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    Nat(u64),
    String(String),
    Bool(bool),
}

/// Parse a source file containing zero or more schema declarations.
pub fn parse_schema(text: &str) -> Result<Vec<SchemaDecl>, FactDbError> {
    let mut c = Cursor::new(text)?;
    let mut decls = Vec::new();
    while !c.at_end() {
        decls.push(schema_decl(&mut c)?);
    }
    Ok(decls)
}

fn schema_ref(c: &mut Cursor) -> Result<SchemaRef, FactDbError> {
    let text = c.expect_name()?;
    match split_version(&text) {
        (name, Some(version)) => Ok(SchemaRef {
            name: name.to_string(),
            version,
        }),
        _ => Err(c.error(format!("schema name must be versioned: {text}"))),
    }
}

fn schema_decl(c: &mut Cursor) -> Result<SchemaDecl, FactDbError> {
    c.expect_keyword("schema")?;
    let SchemaRef { name, version } = schema_ref(c)?;
    let mut inherits = Vec::new();
    if c.eat(&Token::Colon) {
        loop {
            inherits.push(schema_ref(c)?);
            if !c.eat(&Token::Comma) {
                break;
            }
        }
    }
    c.expect(&Token::LBrace)?;

    let mut imports = Vec::new();
    let mut items = Vec::new();
    while !c.eat(&Token::RBrace) {
        if c.eat_keyword("import") {
            imports.push(schema_ref(c)?);
        } else if c.eat_keyword("type") {
            let name = c.expect_name()?;
            c.expect(&Token::Eq)?;
            let ty = type_expr(c)?;
            items.push(SchemaItem::Type { name, ty });
        } else if c.eat_keyword("predicate") {
            items.push(predicate(c)?);
        } else {
            return Err(c.error(format!(
                "expected `import`, `type`, `predicate` or `}}`, found {}",
                c.peek()
            )));
        }
        c.eat(&Token::Semi);
    }

    Ok(SchemaDecl {
        name,
        version,
        inherits,
        imports,
        items,
    })
}

fn ends_item(token: &Token) -> bool {
    match token {
        Token::RBrace | Token::Semi | Token::Eof => true,
        Token::Name(n) => matches!(n.as_str(), "predicate" | "type" | "import"),
        _ => false,
    }
}

fn predicate(c: &mut Cursor) -> Result<SchemaItem, FactDbError> {
    let name = c.expect_name()?;
    if name.contains('.') {
        return Err(c.error(format!("predicate names are unqualified: {name}")));
    }
    c.expect(&Token::Colon)?;
    let key = type_expr(c)?;
    let value = if c.eat(&Token::Arrow) {
        Some(type_expr(c)?)
    } else {
        None
    };
    let derivation = if ends_item(c.peek()) {
        None
    } else {
        let key_expr = pattern(c)?;
        c.expect_keyword("where")?;
        let body = statements(c)?;
        Some((key_expr, body))
    };
    Ok(SchemaItem::Predicate {
        name,
        key,
        value,
        derivation,
    })
}

fn type_expr(c: &mut Cursor) -> Result<TypeExpr, FactDbError> {
    c.nest()?;
    let parsed = type_term(c);
    c.unnest();
    parsed
}

fn type_term(c: &mut Cursor) -> Result<TypeExpr, FactDbError> {
    match c.bump() {
        Token::LBracket => {
            let elem = type_expr(c)?;
            c.expect(&Token::RBracket)?;
            Ok(TypeExpr::Array(Box::new(elem)))
        }
        Token::LBrace => {
            if c.eat(&Token::RBrace) {
                return Ok(TypeExpr::Record(Vec::new()));
            }
            let first = field(c)?;
            let is_sum = c.peek() == &Token::Pipe;
            let separator = if is_sum { Token::Pipe } else { Token::Comma };
            let mut fields = vec![first];
            while c.eat(&separator) {
                if c.peek() == &Token::RBrace {
                    break;
                }
                fields.push(field(c)?);
            }
            c.expect(&Token::RBrace)?;
            Ok(if is_sum {
                TypeExpr::Sum(fields)
            } else {
                TypeExpr::Record(fields)
            })
        }
        Token::Name(name) => match name.as_str() {
            "byte" => Ok(TypeExpr::Byte),
            "nat" => Ok(TypeExpr::Nat),
            "bool" => Ok(TypeExpr::Bool),
            "string" => Ok(TypeExpr::String),
            "maybe" => Ok(TypeExpr::Maybe(Box::new(type_expr(c)?))),
            "enum" => {
                c.expect(&Token::LBrace)?;
                let mut names = vec![c.expect_name()?];
                while c.eat(&Token::Pipe) {
                    names.push(c.expect_name()?);
                }
                c.expect(&Token::RBrace)?;
                Ok(TypeExpr::Enum(names))
            }
            _ => Ok(TypeExpr::Named(name)),
        },
        other => Err(c.error(format!("expected a type, found {other}"))),
    }
}

fn field(c: &mut Cursor) -> Result<FieldExpr, FactDbError> {
    let name = c.expect_name()?;
    c.expect(&Token::Colon)?;
    let ty = type_expr(c)?;
    let default = if c.eat(&Token::Eq) {
        Some(match c.bump() {
            Token::Nat(n) => Literal::Nat(n),
            Token::Str(s) => Literal::String(s),
            Token::Name(n) if n == "true" => Literal::Bool(true),
            Token::Name(n) if n == "false" => Literal::Bool(false),
            other => return Err(c.error(format!("expected a default literal, found {other}"))),
        })
    } else {
        None
    };
    Ok(FieldExpr { name, ty, default })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::query::ast::Source;

    #[test]
    fn parses_schema_with_inheritance_and_items() {
        let decls = parse_schema(
            r#"
            schema example.1 {
              type Loc = { line : nat, column : nat = 1 }
              predicate Class : { name : string, loc : Loc }
              predicate Parent : { child : Class, parent : Class }
            }
            schema all.1 : example.1 {}
            "#,
        )
        .expect("parse");
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].name, "example");
        assert_eq!(decls[0].version, 1);
        assert_eq!(decls[0].items.len(), 3);
        assert_eq!(
            decls[1].inherits,
            vec![SchemaRef {
                name: "example".into(),
                version: 1
            }]
        );
    }

    #[test]
    fn parses_sum_maybe_and_enum() {
        let decls = parse_schema(
            "schema t.1 { predicate P : { a : nat | b : maybe string | c : enum { x | y } } }",
        )
        .expect("parse");
        let SchemaItem::Predicate { key, .. } = &decls[0].items[0] else {
            panic!("expected predicate");
        };
        let TypeExpr::Sum(alts) = key else {
            panic!("expected sum");
        };
        assert_eq!(alts.len(), 3);
        assert_eq!(alts[1].ty, TypeExpr::Maybe(Box::new(TypeExpr::String)));
        assert_eq!(alts[2].ty, TypeExpr::Enum(vec!["x".into(), "y".into()]));
    }

    #[test]
    fn parses_value_type_and_default() {
        let decls = parse_schema("schema t.1 { predicate P : string -> { n : nat = 3 } }").expect("parse");
        let SchemaItem::Predicate { value, .. } = &decls[0].items[0] else {
            panic!("expected predicate");
        };
        let Some(TypeExpr::Record(fields)) = value else {
            panic!("expected record value");
        };
        assert_eq!(fields[0].default, Some(Literal::Nat(3)));
    }

    #[test]
    fn parses_derived_predicate() {
        let decls = parse_schema(
            "schema example.2 : example.1 { predicate Foo:string S where Class {S,_ }}schema all.2 : example.2 {}",
        )
        .expect("parse");
        assert_eq!(decls.len(), 2);
        let SchemaItem::Predicate {
            name, derivation, ..
        } = &decls[0].items[0]
        else {
            panic!("expected predicate");
        };
        assert_eq!(name, "Foo");
        let (key, body) = derivation.as_ref().expect("derived");
        assert_eq!(key, &Pattern::Var("S".into()));
        assert!(matches!(&body.statements[0].source, Source::Predicate { name, .. } if name == "Class"));
    }

    #[test]
    fn unversioned_schema_is_rejected() {
        assert!(matches!(
            parse_schema("schema example { }"),
            Err(FactDbError::Parse { .. })
        ));
    }

    #[test]
    fn deep_type_nesting_is_a_parse_error() {
        let deep = format!("schema deep.1 {{ predicate P : {}nat{} }}", "[".repeat(5000), "]".repeat(5000));
        assert!(matches!(parse_schema(&deep), Err(FactDbError::Parse { .. })));

        let shallow = format!("schema deep.1 {{ predicate P : {}nat{} }}", "[".repeat(50), "]".repeat(50));
        parse_schema(&shallow).expect("parse");
    }
}
