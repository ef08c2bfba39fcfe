//! Edge condition expressions.
//!
//! Grammar: `key = value`, `key != value`, `key in [a, b, c]`, a bare key
//! (truthiness), combined with `and` / `or` and parentheses. Values are bare
//! tokens or double-quoted strings. Comparison against the `outcome` key is
//! case-insensitive.

use crate::context::{ContextValues, OUTCOME_KEY};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    In,
    And,
    Or,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Eq(String, String),
    Ne(String, String),
    In(String, Vec<String>),
    Exists(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Check the expression parses; used by graph validation.
pub fn validate_condition(condition: &str) -> Result<(), String> {
    parse_expression(condition).map(|_| ())
}

/// Evaluate against the context values. `outcome` and `last_stage` are
/// ordinary context keys kept current by the engine.
pub fn evaluate_condition(condition: &str, context: &ContextValues) -> Result<bool, String> {
    let expr = parse_expression(condition)?;
    Ok(eval(&expr, context))
}

/// Count of comparison clauses; used by routing as a specificity measure.
pub fn condition_clause_count(condition: &str) -> usize {
    parse_expression(condition)
        .map(|expr| clause_count(&expr))
        .unwrap_or(0)
}

/// Whether any clause tests the `outcome` key.
pub fn condition_mentions_outcome(condition: &str) -> bool {
    parse_expression(condition)
        .map(|expr| mentions_key(&expr, OUTCOME_KEY))
        .unwrap_or(false)
}

fn eval(expr: &Expr, context: &ContextValues) -> bool {
    match expr {
        Expr::Eq(key, expected) => compare(key, context.get(key), expected),
        Expr::Ne(key, expected) => !compare(key, context.get(key), expected),
        Expr::In(key, candidates) => candidates
            .iter()
            .any(|candidate| compare(key, context.get(key), candidate)),
        Expr::Exists(key) => is_truthy(context.get(key)),
        Expr::And(left, right) => eval(left, context) && eval(right, context),
        Expr::Or(left, right) => eval(left, context) || eval(right, context),
    }
}

fn compare(key: &str, actual: Option<&Value>, expected: &str) -> bool {
    let Some(actual) = actual else {
        return expected.eq_ignore_ascii_case("null");
    };
    let actual_text = match actual {
        Value::String(inner) => inner.clone(),
        other => other.to_string(),
    };
    if key == OUTCOME_KEY {
        return actual_text.eq_ignore_ascii_case(expected);
    }
    if let (Ok(left), Ok(right)) = (actual_text.parse::<f64>(), expected.parse::<f64>()) {
        return left == right;
    }
    actual_text == expected
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::String(inner)) => !inner.is_empty(),
        Some(Value::Number(_)) => true,
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}

fn clause_count(expr: &Expr) -> usize {
    match expr {
        Expr::And(left, right) | Expr::Or(left, right) => {
            clause_count(left) + clause_count(right)
        }
        _ => 1,
    }
}

fn mentions_key(expr: &Expr, needle: &str) -> bool {
    match expr {
        Expr::Eq(key, _) | Expr::Ne(key, _) | Expr::In(key, _) | Expr::Exists(key) => key == needle,
        Expr::And(left, right) | Expr::Or(left, right) => {
            mentions_key(left, needle) || mentions_key(right, needle)
        }
    }
}

fn parse_expression(condition: &str) -> Result<Expr, String> {
    let tokens = tokenize(condition)?;
    if tokens.is_empty() {
        return Err("condition expression is empty".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "unexpected trailing input in condition '{condition}'"
        ));
    }
    Ok(expr)
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

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.bump();
            let inner = self.parse_or()?;
            match self.bump() {
                Some(Token::RParen) => return Ok(inner),
                _ => return Err("missing closing parenthesis".to_string()),
            }
        }
        self.parse_clause()
    }

    fn parse_clause(&mut self) -> Result<Expr, String> {
        let key = match self.bump() {
            Some(Token::Ident(key)) => key,
            other => return Err(format!("expected condition key, found {other:?}")),
        };
        match self.peek() {
            Some(Token::Eq) => {
                self.bump();
                Ok(Expr::Eq(key, self.parse_value()?))
            }
            Some(Token::Ne) => {
                self.bump();
                Ok(Expr::Ne(key, self.parse_value()?))
            }
            Some(Token::In) => {
                self.bump();
                if self.bump() != Some(Token::LBracket) {
                    return Err(format!("expected '[' after '{key} in'"));
                }
                let mut candidates = Vec::new();
                loop {
                    match self.bump() {
                        Some(Token::Ident(value)) | Some(Token::Str(value)) => {
                            candidates.push(value)
                        }
                        Some(Token::RBracket) if candidates.is_empty() => break,
                        other => return Err(format!("expected list value, found {other:?}")),
                    }
                    match self.bump() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => return Err(format!("expected ',' or ']', found {other:?}")),
                    }
                }
                Ok(Expr::In(key, candidates))
            }
            _ => Ok(Expr::Exists(key)),
        }
    }

    fn parse_value(&mut self) -> Result<String, String> {
        match self.bump() {
            Some(Token::Ident(value)) | Some(Token::Str(value)) => Ok(value),
            other => Err(format!("expected condition value, found {other:?}")),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("expected '=' after '!'".to_string());
                }
                tokens.push(Token::Ne);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err("unterminated string literal".to_string()),
                        },
                        Some(inner) => value.push(inner),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut word = String::new();
                while let Some(&inner) = chars.peek() {
                    if inner.is_ascii_alphanumeric()
                        || inner == '_'
                        || inner == '-'
                        || inner == '.'
                    {
                        word.push(inner);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character '{other}' in condition")),
        }
    }

    Ok(tokens)
}
