//! Condition evaluator collaborator.
//!
//! The oracle only needs three answers from a condition: is it well formed,
//! is it true right now, and which transactions of a batch may be signed.
//! [`BasicEvaluator`] covers boolean literals and comparisons against the
//! evaluation time:
//!
//! ```text
//! True
//! timestamp >= 1402318623 and timestamp < 1402400000
//! False or timestamp > 1700000000
//! ```

use crate::protocol::RequestTransaction;

/// Facts a condition is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    /// Unix seconds.
    pub now: u64,
}

pub trait ConditionEvaluator: Send + Sync {
    fn is_well_formed(&self, expr: &str) -> bool;

    /// Malformed expressions evaluate to false.
    fn evaluate(&self, expr: &str, ctx: &EvalContext) -> bool;

    /// One "may sign" decision per transaction of a batched request.
    fn select_signable(&self, expr: &str, transactions: &[RequestTransaction], ctx: &EvalContext) -> Vec<bool> {
        let verdict = self.evaluate(expr, ctx);
        vec![verdict; transactions.len()]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEvaluator;

impl ConditionEvaluator for BasicEvaluator {
    fn is_well_formed(&self, expr: &str) -> bool {
        parse(expr).is_some()
    }

    fn evaluate(&self, expr: &str, ctx: &EvalContext) -> bool {
        parse(expr).map(|e| e.eval(ctx)).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(bool),
    Time(Cmp, u64),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp { Ge, Gt, Le, Lt }

impl Expr {
    fn eval(&self, ctx: &EvalContext) -> bool {
        match self {
            Expr::Literal(b) => *b,
            Expr::Time(cmp, t) => match cmp {
                Cmp::Ge => ctx.now >= *t,
                Cmp::Gt => ctx.now > *t,
                Cmp::Le => ctx.now <= *t,
                Cmp::Lt => ctx.now < *t,
            },
            Expr::And(a, b) => a.eval(ctx) && b.eval(ctx),
            Expr::Or(a, b) => a.eval(ctx) || b.eval(ctx),
        }
    }
}

fn tokenize(expr: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '<' || c == '>' {
            if chars.get(i + 1) == Some(&'=') {
                tokens.push(format!("{c}="));
                i += 2;
            } else {
                tokens.push(c.to_string());
                i += 1;
            }
        } else if c.is_ascii_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
        } else {
            return None;
        }
    }
    Some(tokens)
}

// or-expr  := and-expr ("or" and-expr)*
// and-expr := atom ("and" atom)*
fn parse(expr: &str) -> Option<Expr> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;
    let parsed = parse_or(&tokens, &mut pos)?;
    (pos == tokens.len()).then_some(parsed)
}

fn parse_or(tokens: &[String], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_and(tokens, pos)?;
    while tokens.get(*pos).map(String::as_str) == Some("or") {
        *pos += 1;
        left = Expr::Or(Box::new(left), Box::new(parse_and(tokens, pos)?));
    }
    Some(left)
}

fn parse_and(tokens: &[String], pos: &mut usize) -> Option<Expr> {
    let mut left = parse_atom(tokens, pos)?;
    while tokens.get(*pos).map(String::as_str) == Some("and") {
        *pos += 1;
        left = Expr::And(Box::new(left), Box::new(parse_atom(tokens, pos)?));
    }
    Some(left)
}

fn parse_atom(tokens: &[String], pos: &mut usize) -> Option<Expr> {
    let tok = tokens.get(*pos)?;
    *pos += 1;
    match tok.as_str() {
        "True" | "true" => Some(Expr::Literal(true)),
        "False" | "false" => Some(Expr::Literal(false)),
        "timestamp" => {
            let cmp = match tokens.get(*pos)?.as_str() {
                ">=" => Cmp::Ge,
                ">" => Cmp::Gt,
                "<=" => Cmp::Le,
                "<" => Cmp::Lt,
                _ => return None,
            };
            let value = tokens.get(*pos + 1)?.parse::<u64>().ok()?;
            *pos += 2;
            Some(Expr::Time(cmp, value))
        }
        _ => None,
    }
}
