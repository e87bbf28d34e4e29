//! Hand-written recursive-descent filter compiler: parses the query
//! surfaces' filter-expression grammar into a typed AST, rejects unknown
//! fields/operators at compile time, and lowers directly to a parameterized
//! SQL predicate. `cel-interpreter` is used
//! for policy expressions elsewhere but its AST cannot cheaply lower to SQL,
//! so the query layer gets its own small parser instead.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
}

/// The legal field set for one query surface.
pub type FieldSchema = HashMap<&'static str, FieldType>;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unexpected end of filter expression")]
    UnexpectedEof,
    #[error("unexpected token '{0}' at position {1}")]
    UnexpectedToken(String, usize),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("operator '{op}' is not valid for field '{field}' of type {ty:?}")]
    InvalidOperatorForType { op: String, field: String, ty: FieldType },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFn {
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Compare { field: String, op: CmpOp, value: Literal },
    In { field: String, values: Vec<Literal> },
    StringCall { func: StringFn, field: String, value: String },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

/* ================================ LEXER ================================ */

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    And,
    Or,
    Not,
    In,
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn tokenize(mut self) -> Result<Vec<(Tok, usize)>, FilterError> {
        let mut out = Vec::new();
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() {
            let c = bytes[self.pos] as char;
            let start = self.pos;
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            match c {
                '(' => {
                    out.push((Tok::LParen, start));
                    self.pos += 1;
                }
                ')' => {
                    out.push((Tok::RParen, start));
                    self.pos += 1;
                }
                ',' => {
                    out.push((Tok::Comma, start));
                    self.pos += 1;
                }
                '!' if bytes.get(self.pos + 1) == Some(&b'=') => {
                    out.push((Tok::Op(CmpOp::Ne), start));
                    self.pos += 2;
                }
                '!' => {
                    out.push((Tok::Not, start));
                    self.pos += 1;
                }
                '=' if bytes.get(self.pos + 1) == Some(&b'=') => {
                    out.push((Tok::Op(CmpOp::Eq), start));
                    self.pos += 2;
                }
                '<' if bytes.get(self.pos + 1) == Some(&b'=') => {
                    out.push((Tok::Op(CmpOp::Le), start));
                    self.pos += 2;
                }
                '<' => {
                    out.push((Tok::Op(CmpOp::Lt), start));
                    self.pos += 1;
                }
                '>' if bytes.get(self.pos + 1) == Some(&b'=') => {
                    out.push((Tok::Op(CmpOp::Ge), start));
                    self.pos += 2;
                }
                '>' => {
                    out.push((Tok::Op(CmpOp::Gt), start));
                    self.pos += 1;
                }
                '&' if bytes.get(self.pos + 1) == Some(&b'&') => {
                    out.push((Tok::And, start));
                    self.pos += 2;
                }
                '|' if bytes.get(self.pos + 1) == Some(&b'|') => {
                    out.push((Tok::Or, start));
                    self.pos += 2;
                }
                '\'' | '"' => {
                    let quote = c;
                    self.pos += 1;
                    let value_start = self.pos;
                    while self.pos < bytes.len() && bytes[self.pos] as char != quote {
                        self.pos += 1;
                    }
                    if self.pos >= bytes.len() {
                        return Err(FilterError::UnexpectedEof);
                    }
                    out.push((Tok::Str(self.src[value_start..self.pos].to_string()), start));
                    self.pos += 1;
                }
                c if c.is_ascii_digit() || c == '-' => {
                    let num_start = self.pos;
                    self.pos += 1;
                    while self.pos < bytes.len()
                        && (bytes[self.pos].is_ascii_digit() || bytes[self.pos] as char == '.')
                    {
                        self.pos += 1;
                    }
                    let slice = &self.src[num_start..self.pos];
                    let n: f64 = slice
                        .parse()
                        .map_err(|_| FilterError::UnexpectedToken(slice.to_string(), start))?;
                    out.push((Tok::Num(n), start));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let id_start = self.pos;
                    self.pos += 1;
                    while self.pos < bytes.len() {
                        let b = bytes[self.pos] as char;
                        if b.is_alphanumeric() || b == '_' || b == '.' {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                    let word = &self.src[id_start..self.pos];
                    let tok = match word {
                        "true" => Tok::Bool(true),
                        "false" => Tok::Bool(false),
                        "in" => Tok::In,
                        _ => Tok::Ident(word.to_string()),
                    };
                    out.push((tok, start));
                }
                _ => return Err(FilterError::UnexpectedToken(c.to_string(), start)),
            }
        }
        Ok(out)
    }
}

/* =============================== PARSER ================================ */

struct Parser<'a> {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    schema: &'a FieldSchema,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn pos_of_peek(&self) -> usize {
        self.toks.get(self.pos).map(|(_, p)| *p).unwrap_or(self.toks.last().map(|(_, p)| *p).unwrap_or(0))
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Tok) -> Result<(), FilterError> {
        match self.advance() {
            Some(t) if &t == expected => Ok(()),
            Some(t) => Err(FilterError::UnexpectedToken(format!("{t:?}"), self.pos_of_peek())),
            None => Err(FilterError::UnexpectedEof),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr, FilterError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr, FilterError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Tok::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, FilterError> {
        if matches!(self.peek(), Some(Tok::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpr, FilterError> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.advance();
            let inner = self.parse_or()?;
            self.expect(&Tok::RParen)?;
            return Ok(inner);
        }

        let field = match self.advance() {
            Some(Tok::Ident(name)) => name,
            Some(t) => return Err(FilterError::UnexpectedToken(format!("{t:?}"), self.pos_of_peek())),
            None => return Err(FilterError::UnexpectedEof),
        };

        if let Some(func) = string_fn(&field) {
            self.expect(&Tok::LParen)?;
            let target_field = match self.advance() {
                Some(Tok::Ident(n)) => n,
                _ => return Err(FilterError::UnexpectedToken("expected field".into(), self.pos_of_peek())),
            };
            self.expect(&Tok::Comma)?;
            let value = match self.advance() {
                Some(Tok::Str(s)) => s,
                _ => return Err(FilterError::UnexpectedToken("expected string literal".into(), self.pos_of_peek())),
            };
            self.expect(&Tok::RParen)?;
            self.check_field(&target_field, FieldType::String)?;
            return Ok(FilterExpr::StringCall { func, field: target_field, value });
        }

        self.check_field_exists(&field)?;

        if matches!(self.peek(), Some(Tok::In)) {
            self.advance();
            self.expect(&Tok::LParen)?;
            let mut values = Vec::new();
            loop {
                let lit = self.parse_literal()?;
                values.push(lit);
                match self.peek() {
                    Some(Tok::Comma) => {
                        self.advance();
                    }
                    Some(Tok::RParen) => break,
                    _ => return Err(FilterError::UnexpectedToken("expected ',' or ')'".into(), self.pos_of_peek())),
                }
            }
            self.expect(&Tok::RParen)?;
            return Ok(FilterExpr::In { field, values });
        }

        let op = match self.advance() {
            Some(Tok::Op(op)) => op,
            Some(t) => return Err(FilterError::UnexpectedToken(format!("{t:?}"), self.pos_of_peek())),
            None => return Err(FilterError::UnexpectedEof),
        };
        let value = self.parse_literal()?;
        self.check_operator(&field, op)?;
        Ok(FilterExpr::Compare { field, op, value })
    }

    fn parse_literal(&mut self) -> Result<Literal, FilterError> {
        match self.advance() {
            Some(Tok::Str(s)) => Ok(Literal::Str(s)),
            Some(Tok::Num(n)) => Ok(Literal::Num(n)),
            Some(Tok::Bool(b)) => Ok(Literal::Bool(b)),
            Some(t) => Err(FilterError::UnexpectedToken(format!("{t:?}"), self.pos_of_peek())),
            None => Err(FilterError::UnexpectedEof),
        }
    }

    fn check_field_exists(&self, field: &str) -> Result<(), FilterError> {
        if self.schema.contains_key(field) {
            Ok(())
        } else {
            Err(FilterError::UnknownField(field.to_string()))
        }
    }

    fn check_field(&self, field: &str, expected: FieldType) -> Result<(), FilterError> {
        match self.schema.get(field) {
            Some(ty) if *ty == expected => Ok(()),
            Some(ty) => Err(FilterError::InvalidOperatorForType {
                op: "stringFn".into(),
                field: field.into(),
                ty: *ty,
            }),
            None => Err(FilterError::UnknownField(field.to_string())),
        }
    }

    fn check_operator(&self, field: &str, op: CmpOp) -> Result<(), FilterError> {
        let ty = *self
            .schema
            .get(field)
            .ok_or_else(|| FilterError::UnknownField(field.to_string()))?;
        if ty != FieldType::Number && matches!(op, CmpOp::Lt | CmpOp::Gt | CmpOp::Le | CmpOp::Ge) {
            return Err(FilterError::InvalidOperatorForType {
                op: op.to_string(),
                field: field.to_string(),
                ty,
            });
        }
        Ok(())
    }
}

fn string_fn(name: &str) -> Option<StringFn> {
    match name {
        "startsWith" => Some(StringFn::StartsWith),
        "endsWith" => Some(StringFn::EndsWith),
        "contains" => Some(StringFn::Contains),
        _ => None,
    }
}

pub fn parse(source: &str, schema: &FieldSchema) -> Result<FilterExpr, FilterError> {
    let toks = Lexer::new(source).tokenize()?;
    let mut parser = Parser { toks, pos: 0, schema };
    let expr = parser.parse_or()?;
    if parser.pos != parser.toks.len() {
        return Err(FilterError::UnexpectedToken(
            format!("{:?}", parser.toks[parser.pos].0),
            parser.toks[parser.pos].1,
        ));
    }
    Ok(expr)
}

/* ============================ SQL LOWERING ============================== */

pub enum SqlParam {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// Lower a compiled filter AST to `(predicate, params)`; `params` are bound
/// positionally by the caller, never concatenated into the predicate text.
pub fn to_sql(expr: &FilterExpr) -> (String, Vec<SqlParam>) {
    let mut params = Vec::new();
    let clause = render(expr, &mut params);
    (clause, params)
}

fn render(expr: &FilterExpr, params: &mut Vec<SqlParam>) -> String {
    match expr {
        FilterExpr::Compare { field, op, value } => {
            params.push(literal_to_param(value));
            format!("{field} {op} ?")
        }
        FilterExpr::In { field, values } => {
            let placeholders = values
                .iter()
                .map(|v| {
                    params.push(literal_to_param(v));
                    "?".to_string()
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{field} IN ({placeholders})")
        }
        FilterExpr::StringCall { func, field, value } => {
            params.push(SqlParam::Str(match func {
                StringFn::StartsWith => format!("{value}%"),
                StringFn::EndsWith => format!("%{value}"),
                StringFn::Contains => format!("%{value}%"),
            }));
            format!("{field} LIKE ?")
        }
        FilterExpr::And(l, r) => format!("({}) AND ({})", render(l, params), render(r, params)),
        FilterExpr::Or(l, r) => format!("({}) OR ({})", render(l, params), render(r, params)),
        FilterExpr::Not(inner) => format!("NOT ({})", render(inner, params)),
    }
}

fn literal_to_param(lit: &Literal) -> SqlParam {
    match lit {
        Literal::Str(s) => SqlParam::Str(s.clone()),
        Literal::Num(n) => SqlParam::Num(*n),
        Literal::Bool(b) => SqlParam::Bool(*b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit_schema() -> FieldSchema {
        let mut m = FieldSchema::new();
        m.insert("verb", FieldType::String);
        m.insert("responseStatusCode", FieldType::Number);
        m.insert("name", FieldType::String);
        m
    }

    #[test]
    fn parses_simple_equality() {
        let expr = parse("verb == 'create'", &audit_schema()).unwrap();
        assert_eq!(
            expr,
            FilterExpr::Compare {
                field: "verb".into(),
                op: CmpOp::Eq,
                value: Literal::Str("create".into())
            }
        );
    }

    #[test]
    fn parses_and_or_precedence() {
        let expr = parse("verb == 'create' && responseStatusCode < 300 || verb == 'delete'", &audit_schema()).unwrap();
        assert!(matches!(expr, FilterExpr::Or(_, _)));
    }

    #[test]
    fn rejects_unknown_field() {
        let err = parse("bogus == 1", &audit_schema()).unwrap_err();
        assert_eq!(err, FilterError::UnknownField("bogus".into()));
    }

    #[test]
    fn rejects_ordering_operator_on_string_field() {
        let err = parse("verb > 'a'", &audit_schema()).unwrap_err();
        assert!(matches!(err, FilterError::InvalidOperatorForType { .. }));
    }

    #[test]
    fn parses_in_expression() {
        let expr = parse("verb in ('create', 'update')", &audit_schema()).unwrap();
        match expr {
            FilterExpr::In { field, values } => {
                assert_eq!(field, "verb");
                assert_eq!(values.len(), 2);
            }
            _ => panic!("expected In"),
        }
    }

    #[test]
    fn parses_string_function_call() {
        let expr = parse("startsWith(name, 'api')", &audit_schema()).unwrap();
        match expr {
            FilterExpr::StringCall { func, field, value } => {
                assert_eq!(func, StringFn::StartsWith);
                assert_eq!(field, "name");
                assert_eq!(value, "api");
            }
            _ => panic!("expected StringCall"),
        }
    }

    #[test]
    fn lowers_to_parameterized_sql_with_no_literal_concatenation() {
        let expr = parse("verb == 'create'", &audit_schema()).unwrap();
        let (sql, params) = to_sql(&expr);
        assert_eq!(sql, "verb == ?");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = parse("verb == 'create' )", &audit_schema());
        assert!(err.is_err());
    }
}
