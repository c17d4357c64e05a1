//! Sandboxed condition expressions.
//!
//! Conditions are compiled once at registration and evaluated against a
//! frame's locals on every hit. The language is deliberately tiny: literals,
//! local names, comparisons, boolean connectives, and parentheses. There is
//! no assignment, no calls, and no access to anything beyond the provided
//! name table.

use mantis_runtime::value::Value;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::error::DebugError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// A precompiled condition expression.
#[derive(Debug, Clone)]
pub(crate) enum CondExpr {
    Lit(Value),
    Name(SmolStr),
    Not(Box<CondExpr>),
    Neg(Box<CondExpr>),
    Binary(BinOp, Box<CondExpr>, Box<CondExpr>),
}

impl CondExpr {
    pub(crate) fn parse(text: &str) -> Result<Self, DebugError> {
        let tokens = lex(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(DebugError::Parse(format!(
                "unexpected trailing input in '{text}'"
            )));
        }
        Ok(expr)
    }

    pub(crate) fn eval(&self, locals: &FxHashMap<SmolStr, Value>) -> Result<Value, DebugError> {
        match self {
            CondExpr::Lit(value) => Ok(value.clone()),
            CondExpr::Name(name) => locals
                .get(name)
                .cloned()
                .ok_or_else(|| DebugError::UndefinedName(name.clone())),
            CondExpr::Not(inner) => Ok(Value::Bool(!inner.eval(locals)?.is_truthy())),
            CondExpr::Neg(inner) => match inner.eval(locals)? {
                Value::Int(n) => Ok(Value::Int(-n)),
                _ => Err(DebugError::TypeMismatch { op: "-" }),
            },
            CondExpr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, locals),
        }
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &CondExpr,
    rhs: &CondExpr,
    locals: &FxHashMap<SmolStr, Value>,
) -> Result<Value, DebugError> {
    // Boolean connectives short-circuit; the right side may reference names
    // that are only defined when the left side admits it.
    match op {
        BinOp::And => {
            let left = lhs.eval(locals)?;
            if !left.is_truthy() {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(rhs.eval(locals)?.is_truthy()));
        }
        BinOp::Or => {
            let left = lhs.eval(locals)?;
            if left.is_truthy() {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(rhs.eval(locals)?.is_truthy()));
        }
        _ => {}
    }

    let left = lhs.eval(locals)?;
    let right = rhs.eval(locals)?;
    let result = match op {
        BinOp::Eq => left == right,
        BinOp::Ne => left != right,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => return Err(DebugError::TypeMismatch { op: op.symbol() }),
            };
            match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!(),
    };
    Ok(Value::Bool(result))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(SmolStr),
    Op(BinOp),
    Bang,
    Minus,
    LParen,
    RParen,
}

fn lex(text: &str) -> Result<Vec<Token>, DebugError> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(BinOp::Eq));
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(BinOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(BinOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(BinOp::Lt));
                i += 1;
            }
            '>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(BinOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(BinOp::Gt));
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::Op(BinOp::And));
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::Op(BinOp::Or));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] as char != quote {
                    end += 1;
                }
                if end == bytes.len() {
                    return Err(DebugError::Parse(format!("unterminated string in '{text}'")));
                }
                tokens.push(Token::Str(text[start..end].to_owned()));
                i = end + 1;
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let digits = &text[start..i];
                let value = digits
                    .parse::<i64>()
                    .map_err(|_| DebugError::Parse(format!("integer out of range: {digits}")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(SmolStr::new(&text[start..i])));
            }
            other => {
                return Err(DebugError::Parse(format!(
                    "unexpected character '{other}' in '{text}'"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<CondExpr, DebugError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = CondExpr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<CondExpr, DebugError> {
        let mut lhs = self.cmp_expr()?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.pos += 1;
            let rhs = self.cmp_expr()?;
            lhs = CondExpr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<CondExpr, DebugError> {
        let lhs = self.unary_expr()?;
        let op = match self.peek() {
            Some(Token::Op(op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge))) => *op,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.unary_expr()?;
        Ok(CondExpr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn unary_expr(&mut self) -> Result<CondExpr, DebugError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(CondExpr::Not(Box::new(self.unary_expr()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(CondExpr::Neg(Box::new(self.unary_expr()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<CondExpr, DebugError> {
        match self.bump() {
            Some(Token::Int(value)) => Ok(CondExpr::Lit(Value::Int(value))),
            Some(Token::Str(value)) => Ok(CondExpr::Lit(Value::Str(value.into()))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(CondExpr::Lit(Value::Bool(true))),
                "false" => Ok(CondExpr::Lit(Value::Bool(false))),
                "nil" => Ok(CondExpr::Lit(Value::Nil)),
                _ => Ok(CondExpr::Name(name)),
            },
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(DebugError::Parse("missing closing parenthesis".to_owned())),
                }
            }
            other => Err(DebugError::Parse(format!(
                "expected a value, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locals(pairs: &[(&str, Value)]) -> FxHashMap<SmolStr, Value> {
        pairs
            .iter()
            .map(|(name, value)| (SmolStr::new(name), value.clone()))
            .collect()
    }

    fn eval(text: &str, locals_map: &FxHashMap<SmolStr, Value>) -> Result<Value, DebugError> {
        CondExpr::parse(text).and_then(|expr| expr.eval(locals_map))
    }

    #[test]
    fn comparisons_and_connectives() {
        let env = locals(&[("a", Value::Int(42)), ("name", Value::Str("x".into()))]);
        assert_eq!(eval("a == 42", &env).unwrap(), Value::Bool(true));
        assert_eq!(eval("a != 42", &env).unwrap(), Value::Bool(false));
        assert_eq!(eval("a > 40 && a <= 42", &env).unwrap(), Value::Bool(true));
        assert_eq!(eval("name == 'x' || a < 0", &env).unwrap(), Value::Bool(true));
        assert_eq!(eval("!(a == 42)", &env).unwrap(), Value::Bool(false));
        assert_eq!(eval("-a == -42", &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn undefined_name_is_an_error() {
        let env = locals(&[]);
        assert_eq!(
            eval("missing == 1", &env).unwrap_err(),
            DebugError::UndefinedName("missing".into())
        );
    }

    #[test]
    fn short_circuit_skips_undefined_right_side() {
        let env = locals(&[("a", Value::Int(1))]);
        assert_eq!(eval("a == 1 || missing == 2", &env).unwrap(), Value::Bool(true));
        assert_eq!(eval("a == 2 && missing == 2", &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn type_mismatch_on_ordering_across_kinds() {
        let env = locals(&[("a", Value::Int(1)), ("s", Value::Str("x".into()))]);
        assert!(matches!(
            eval("a < s", &env).unwrap_err(),
            DebugError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(CondExpr::parse("a =="), Err(DebugError::Parse(_))));
        assert!(matches!(CondExpr::parse("'open"), Err(DebugError::Parse(_))));
        assert!(matches!(CondExpr::parse("a ? b"), Err(DebugError::Parse(_))));
        assert!(matches!(CondExpr::parse("(a == 1"), Err(DebugError::Parse(_))));
    }
}
