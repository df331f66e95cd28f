//! Tokenizer and Pratt parser for the condition language.

use serde_json::Value;

use crate::{BinaryOp, Expr, UnaryOp};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error at byte {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Dot,
    Not,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn tokenize(src: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'(' => {
                out.push((Tok::LParen, i));
                i += 1;
            }
            b')' => {
                out.push((Tok::RParen, i));
                i += 1;
            }
            b'.' => {
                out.push((Tok::Dot, i));
                i += 1;
            }
            b'+' => {
                out.push((Tok::Plus, i));
                i += 1;
            }
            b'-' => {
                out.push((Tok::Minus, i));
                i += 1;
            }
            b'*' => {
                out.push((Tok::Star, i));
                i += 1;
            }
            b'/' => {
                out.push((Tok::Slash, i));
                i += 1;
            }
            b'%' => {
                out.push((Tok::Percent, i));
                i += 1;
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::EqEq, i));
                    i += 2;
                } else {
                    return Err(ParseError::new("expected '=='", i));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::NotEq, i));
                    i += 2;
                } else {
                    out.push((Tok::Not, i));
                    i += 1;
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::Le, i));
                    i += 2;
                } else {
                    out.push((Tok::Lt, i));
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::Ge, i));
                    i += 2;
                } else {
                    out.push((Tok::Gt, i));
                    i += 1;
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    out.push((Tok::AndAnd, i));
                    i += 2;
                } else {
                    return Err(ParseError::new("expected '&&'", i));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    out.push((Tok::OrOr, i));
                    i += 2;
                } else {
                    return Err(ParseError::new("expected '||'", i));
                }
            }
            b'"' | b'\'' => {
                let quote = b;
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        None => return Err(ParseError::new("unterminated string", start)),
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let esc = bytes.get(i + 1).copied();
                            match esc {
                                Some(b'n') => s.push('\n'),
                                Some(b't') => s.push('\t'),
                                Some(b'\\') => s.push('\\'),
                                Some(c) if c == quote => s.push(c as char),
                                _ => return Err(ParseError::new("bad escape", i)),
                            }
                            i += 2;
                        }
                        Some(_) => {
                            // Consume one full UTF-8 scalar.
                            let rest = &src[i..];
                            let ch = rest.chars().next().unwrap_or('\u{fffd}');
                            s.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                out.push((Tok::Str(s), start));
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    // A dot only belongs to the number when followed by a digit
                    // (so `items.0.name` tokenizes as path segments).
                    if bytes[i] == b'.'
                        && !bytes.get(i + 1).map(u8::is_ascii_digit).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let text = &src[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| ParseError::new(format!("bad number '{text}'"), start))?;
                out.push((Tok::Number(n), start));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                out.push((Tok::Ident(src[start..i].to_string()), start));
            }
            _ => return Err(ParseError::new(format!("unexpected byte '{}'", b as char), i)),
        }
    }

    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pratt parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    src_len: usize,
}

/// Parse an expression source string into an [`Expr`].
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let toks = tokenize(src)?;
    let mut p = Parser {
        toks,
        pos: 0,
        src_len: src.len(),
    };
    let expr = p.expr(0)?;
    if let Some((tok, at)) = p.peek_at() {
        return Err(ParseError::new(format!("trailing input: {tok:?}"), at));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self) -> Option<(&Tok, usize)> {
        self.toks.get(self.pos).map(|(t, at)| (t, *at))
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn here(&self) -> usize {
        self.toks
            .get(self.pos)
            .map(|(_, at)| *at)
            .unwrap_or(self.src_len)
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.prefix()?;

        while let Some(op) = self.peek().and_then(binary_op) {
            let (lbp, rbp) = binding_power(op);
            if lbp < min_bp {
                break;
            }
            self.next();
            let rhs = self.expr(rbp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ParseError> {
        let at = self.here();
        match self.next() {
            Some(Tok::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::Not) => Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(self.prefix()?),
            }),
            Some(Tok::Minus) => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(self.prefix()?),
            }),
            Some(Tok::LParen) => {
                let inner = self.expr(0)?;
                match self.next() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(ParseError::new("expected ')'", self.here())),
                }
            }
            Some(Tok::Ident(first)) => match first.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(first),
            },
            other => Err(ParseError::new(format!("unexpected token {other:?}"), at)),
        }
    }

    fn path(&mut self, first: String) -> Result<Expr, ParseError> {
        let mut segs = vec![first];
        while self.peek() == Some(&Tok::Dot) {
            self.next();
            match self.next() {
                Some(Tok::Ident(s)) => segs.push(s),
                // `items.0` — a numeric segment indexes an array.
                Some(Tok::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                    segs.push((n as u64).to_string());
                }
                _ => return Err(ParseError::new("expected path segment after '.'", self.here())),
            }
        }
        Ok(Expr::Path(segs))
    }
}

fn binary_op(tok: &Tok) -> Option<BinaryOp> {
    Some(match tok {
        Tok::OrOr => BinaryOp::Or,
        Tok::AndAnd => BinaryOp::And,
        Tok::EqEq => BinaryOp::Eq,
        Tok::NotEq => BinaryOp::Ne,
        Tok::Lt => BinaryOp::Lt,
        Tok::Le => BinaryOp::Le,
        Tok::Gt => BinaryOp::Gt,
        Tok::Ge => BinaryOp::Ge,
        Tok::Plus => BinaryOp::Add,
        Tok::Minus => BinaryOp::Sub,
        Tok::Star => BinaryOp::Mul,
        Tok::Slash => BinaryOp::Div,
        Tok::Percent => BinaryOp::Mod,
        _ => return None,
    })
}

/// `(left, right)` binding powers; right > left makes the operator
/// left-associative.
fn binding_power(op: BinaryOp) -> (u8, u8) {
    match op {
        BinaryOp::Or => (1, 2),
        BinaryOp::And => (3, 4),
        BinaryOp::Eq | BinaryOp::Ne => (5, 6),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => (7, 8),
        BinaryOp::Add | BinaryOp::Sub => (9, 10),
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => (11, 12),
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_operators() {
        let toks = tokenize("a == 1 && b != 2").unwrap();
        assert_eq!(toks.len(), 7);
    }

    #[test]
    fn path_with_numeric_segment() {
        let expr = parse("items.0.name").unwrap();
        assert_eq!(
            expr,
            Expr::Path(vec!["items".into(), "0".into(), "name".into()])
        );
    }

    #[test]
    fn number_followed_by_path_dot() {
        // `3.f` must not parse `3.` as a number.
        assert!(parse("3.f").is_err());
        let expr = parse("3.5").unwrap();
        assert_eq!(expr, Expr::Literal(serde_json::json!(3.5)));
    }

    #[test]
    fn keywords_are_literals() {
        assert_eq!(parse("true").unwrap(), Expr::Literal(Value::Bool(true)));
        assert_eq!(parse("null").unwrap(), Expr::Literal(Value::Null));
    }

    #[test]
    fn single_quoted_strings() {
        assert_eq!(
            parse("'hi'").unwrap(),
            Expr::Literal(Value::String("hi".into()))
        );
    }

    #[test]
    fn rejects_trailing_input() {
        assert!(parse("a b").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a &").is_err());
    }

    #[test]
    fn unary_chains() {
        let expr = parse("!!a").unwrap();
        assert!(matches!(expr, Expr::Unary { .. }));
    }
}
