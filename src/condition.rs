//! Guard expressions for conditional steps
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | "(" expr ")" | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=") operand)?
//! operand := JSONPath ("$.input.amount") | number | string | true | false | null
//! ```
//!
//! Paths are evaluated against the execution data document
//! (`{"input": ..., "steps": {...}}`). A path that matches nothing is null.
//! A bare operand is truthy unless it is null, false, 0 or "".

use serde_json::Value;
use serde_json_path::JsonPath;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("unexpected '{found}' at position {position}")]
    UnexpectedToken { position: usize, found: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),
    #[error("invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },
    #[error("empty expression")]
    Empty,
}

/// A parsed guard expression
#[derive(Debug)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some((position, token)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::UnexpectedToken {
                position: *position,
                found: token.describe(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, document: &Value) -> bool {
        self.expr.eval(document)
    }
}

#[derive(Debug)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

#[derive(Debug)]
enum Operand {
    Path(JsonPath),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Expr {
    fn eval(&self, document: &Value) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(document) || b.eval(document),
            Expr::And(a, b) => a.eval(document) && b.eval(document),
            Expr::Not(inner) => !inner.eval(document),
            Expr::Truthy(operand) => truthy(&operand.resolve(document)),
            Expr::Compare(left, op, right) => {
                compare(&left.resolve(document), *op, &right.resolve(document))
            }
        }
    }
}

impl Operand {
    fn resolve(&self, document: &Value) -> Value {
        match self {
            Operand::Literal(value) => value.clone(),
            Operand::Path(path) => path
                .query(document)
                .first()
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
        };
    }

    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        _ => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => match op {
                CmpOp::Gt => l > r,
                CmpOp::Ge => l >= r,
                CmpOp::Lt => l < r,
                CmpOp::Le => l <= r,
                CmpOp::Eq | CmpOp::Ne => false,
            },
            _ => false,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Cmp(CmpOp),
    Path(String),
    Literal(Value),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::And => "&&".to_string(),
            Token::Or => "||".to_string(),
            Token::Not => "!".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Cmp(op) => format!("{:?}", op),
            Token::Path(p) => p.clone(),
            Token::Literal(v) => v.to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let next = chars.get(i + 1).copied();

        match (c, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('&', Some('&')) => {
                tokens.push((start, Token::And));
                i += 2;
            }
            ('|', Some('|')) => {
                tokens.push((start, Token::Or));
                i += 2;
            }
            ('=', Some('=')) => {
                tokens.push((start, Token::Cmp(CmpOp::Eq)));
                i += 2;
            }
            ('!', Some('=')) => {
                tokens.push((start, Token::Cmp(CmpOp::Ne)));
                i += 2;
            }
            ('>', Some('=')) => {
                tokens.push((start, Token::Cmp(CmpOp::Ge)));
                i += 2;
            }
            ('<', Some('=')) => {
                tokens.push((start, Token::Cmp(CmpOp::Le)));
                i += 2;
            }
            ('>', _) => {
                tokens.push((start, Token::Cmp(CmpOp::Gt)));
                i += 1;
            }
            ('<', _) => {
                tokens.push((start, Token::Cmp(CmpOp::Lt)));
                i += 1;
            }
            ('!', _) => {
                tokens.push((start, Token::Not));
                i += 1;
            }
            ('(', _) => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            (')', _) => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            ('"', _) | ('\'', _) => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Literal(Value::String(text))));
            }
            ('$', _) => {
                // Paths may contain bracketed segments with quoted names and spaces
                let mut depth = 0usize;
                let mut quote: Option<char> = None;
                while i < chars.len() {
                    let ch = chars[i];
                    if let Some(q) = quote {
                        if ch == q {
                            quote = None;
                        }
                    } else if ch == '\'' || ch == '"' {
                        quote = Some(ch);
                    } else if ch == '[' {
                        depth += 1;
                    } else if ch == ']' {
                        depth = depth.saturating_sub(1);
                    } else if depth == 0
                        && (ch.is_whitespace() || matches!(ch, '(' | ')' | '!' | '=' | '<' | '>' | '&' | '|'))
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push((start, Token::Path(text)));
            }
            _ => {
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '!' | '=' | '<' | '>' | '&' | '|')
                {
                    i += 1;
                }
                if i == start {
                    return Err(ConditionError::UnexpectedToken {
                        position: start,
                        found: c.to_string(),
                    });
                }
                let word: String = chars[start..i].iter().collect();
                let literal = match word.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    "null" => Value::Null,
                    _ => serde_json::from_str::<serde_json::Number>(&word)
                        .map(Value::Number)
                        .map_err(|_| ConditionError::UnexpectedToken {
                            position: start,
                            found: word.clone(),
                        })?,
                };
                tokens.push((start, Token::Literal(literal)));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Result<(usize, Token), ConditionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.advance()? {
                    (_, Token::RParen) => Ok(inner),
                    (position, token) => Err(ConditionError::UnexpectedToken {
                        position,
                        found: token.describe(),
                    }),
                }
            }
            _ => self.compare(),
        }
    }

    fn compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand, ConditionError> {
        match self.advance()? {
            (_, Token::Literal(value)) => Ok(Operand::Literal(value)),
            (_, Token::Path(path)) => JsonPath::parse(&path)
                .map(Operand::Path)
                .map_err(|e| ConditionError::InvalidPath {
                    path,
                    message: e.to_string(),
                }),
            (position, token) => Err(ConditionError::UnexpectedToken {
                position,
                found: token.describe(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, doc: &Value) -> bool {
        Condition::parse(expr).unwrap().evaluate(doc)
    }

    #[test]
    fn test_compares_numbers_and_strings() {
        let doc = json!({"input": {"amount": 150, "currency": "EUR"}});
        assert!(eval("$.input.amount > 100", &doc));
        assert!(!eval("$.input.amount <= 100", &doc));
        assert!(eval("$.input.currency == 'EUR'", &doc));
        assert!(eval("$.input.currency != \"USD\"", &doc));
    }

    #[test]
    fn test_combines_with_precedence() {
        let doc = json!({"input": {"vip": true, "amount": 10}});
        assert!(eval("$.input.amount > 100 || $.input.vip && true", &doc));
        assert!(!eval("!($.input.vip)", &doc));
        assert!(eval("($.input.amount > 100 || $.input.vip) && $.input.amount == 10", &doc));
    }

    #[test]
    fn test_missing_paths_are_null_and_falsy() {
        let doc = json!({"input": {}});
        assert!(!eval("$.input.customer", &doc));
        assert!(eval("$.input.customer == null", &doc));
        assert!(eval("!$.steps.reserve", &doc));
    }

    #[test]
    fn test_bracketed_paths_tokenize_as_one_operand() {
        let doc = json!({"steps": {"check stock": {"available": 3}}});
        assert!(eval("$.steps['check stock'].available >= 3", &doc));
    }

    #[test]
    fn test_syntax_errors_are_reported() {
        assert!(matches!(
            Condition::parse("$.input.amount >"),
            Err(ConditionError::UnexpectedEnd)
        ));
        assert!(matches!(Condition::parse("   "), Err(ConditionError::Empty)));
        assert!(matches!(
            Condition::parse("'open"),
            Err(ConditionError::UnterminatedString(0))
        ));
        assert!(matches!(
            Condition::parse("amount > 3"),
            Err(ConditionError::UnexpectedToken { position: 0, .. })
        ));
        assert!(Condition::parse("(true").is_err());
    }
}
