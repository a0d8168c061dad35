//! Condition expressions used by condition and router blocks
//!
//! Grammar, loosest binding first:
//! - `a or b`
//! - `a and b`
//! - `not a`
//! - `(a)`, `true`, `false`
//! - `left <op> right` with `==`, `!=`, `>`, `>=`, `<`, `<=`, `contains`
//!
//! Operands are literals (`'text'`, `"text"`, numbers, `true`, `false`,
//! `null`) or dotted paths into the block inputs (`start.user.age`).

use blockcore::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    True,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring for text, membership for arrays
    Contains,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Contains => "contains",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("could not parse condition: {0}")]
    Syntax(String),

    #[error("unbalanced parentheses in: {0}")]
    Unbalanced(String),
}

pub fn parse(input: &str) -> Result<Expression, ExpressionError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ExpressionError::Empty);
    }
    if let Some(inner) = strip_parens(input)? {
        return parse(inner);
    }

    if let Some(at) = find_top_level(input, " or ")? {
        return Ok(Expression::Or(
            Box::new(parse(&input[..at])?),
            Box::new(parse(&input[at + 4..])?),
        ));
    }
    if let Some(at) = find_top_level(input, " and ")? {
        return Ok(Expression::And(
            Box::new(parse(&input[..at])?),
            Box::new(parse(&input[at + 5..])?),
        ));
    }
    if let Some(rest) = input.strip_prefix("not ") {
        return Ok(Expression::Not(Box::new(parse(rest)?)));
    }
    if let Some(rest) = input.strip_prefix('!').filter(|r| !r.starts_with('=')) {
        return Ok(Expression::Not(Box::new(parse(rest)?)));
    }

    match input {
        "true" => Ok(Expression::True),
        "false" => Ok(Expression::False),
        _ => parse_comparison(input),
    }
}

/// Inner text when the whole input is wrapped in one pair of parentheses.
fn strip_parens(input: &str) -> Result<Option<&str>, ExpressionError> {
    if !input.starts_with('(') || !input.ends_with(')') {
        return Ok(None);
    }
    let mut depth = 0i32;
    let mut quote = None;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 && i != input.len() - 1 {
                    return Ok(None);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ExpressionError::Unbalanced(input.to_string()));
    }
    Ok(Some(&input[1..input.len() - 1]))
}

/// First occurrence of `needle` outside quotes and parentheses.
fn find_top_level(input: &str, needle: &str) -> Result<Option<usize>, ExpressionError> {
    let mut depth = 0i32;
    let mut quote = None;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, _) if depth == 0 && input[i..].starts_with(needle) => return Ok(Some(i)),
            _ => {}
        }
        if depth < 0 {
            return Err(ExpressionError::Unbalanced(input.to_string()));
        }
    }
    Ok(None)
}

fn parse_comparison(input: &str) -> Result<Expression, ExpressionError> {
    // Longest operators first so `>=` is not read as `>`
    let operators = [
        ("!=", CompareOp::NotEq),
        (">=", CompareOp::Gte),
        ("<=", CompareOp::Lte),
        ("==", CompareOp::Eq),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        (" contains ", CompareOp::Contains),
    ];

    for (symbol, op) in operators {
        if let Some(at) = find_top_level(input, symbol)? {
            let left = parse_operand(&input[..at])?;
            let right = parse_operand(&input[at + symbol.len()..])?;
            return Ok(Expression::Compare { left, op, right });
        }
    }

    // A bare path is a truthiness test
    let operand = parse_operand(input)?;
    Ok(Expression::Compare {
        left: operand,
        op: CompareOp::Eq,
        right: Operand::Literal(Value::Bool(true)),
    })
}

fn parse_operand(input: &str) -> Result<Operand, ExpressionError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ExpressionError::Syntax("missing operand".to_string()));
    }

    let literal = match input {
        "null" => Some(Value::Null),
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ if input.len() >= 2
            && ((input.starts_with('\'') && input.ends_with('\''))
                || (input.starts_with('"') && input.ends_with('"'))) =>
        {
            Some(Value::String(input[1..input.len() - 1].to_string()))
        }
        _ => input.parse::<f64>().ok().map(Value::Number),
    };
    if let Some(value) = literal {
        return Ok(Operand::Literal(value));
    }

    let is_path = input
        .split('.')
        .all(|s| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-'));
    if is_path {
        Ok(Operand::Path(input.to_string()))
    } else {
        Err(ExpressionError::Syntax(input.to_string()))
    }
}

/// Evaluate against `root`, usually the block inputs as one object.
pub fn evaluate(expr: &Expression, root: &Value) -> bool {
    match expr {
        Expression::True => true,
        Expression::False => false,
        Expression::And(left, right) => evaluate(left, root) && evaluate(right, root),
        Expression::Or(left, right) => evaluate(left, root) || evaluate(right, root),
        Expression::Not(inner) => !evaluate(inner, root),
        Expression::Compare { left, op, right } => {
            let left = operand_value(left, root);
            let right = operand_value(right, root);
            compare(&left, *op, &right)
        }
    }
}

/// Parse and evaluate in one go.
pub fn check(input: &str, root: &Value) -> Result<bool, ExpressionError> {
    parse(input).map(|expr| evaluate(&expr, root))
}

fn operand_value(operand: &Operand, root: &Value) -> Value {
    match operand {
        Operand::Literal(value) => value.clone(),
        Operand::Path(path) => root.get_path(path).cloned().unwrap_or_default(),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::NotEq => !values_equal(left, right),
        CompareOp::Gt => numbers(left, right).map_or(false, |(a, b)| a > b),
        CompareOp::Gte => numbers(left, right).map_or(false, |(a, b)| a >= b),
        CompareOp::Lt => numbers(left, right).map_or(false, |(a, b)| a < b),
        CompareOp::Lte => numbers(left, right).map_or(false, |(a, b)| a <= b),
        CompareOp::Contains => match left {
            Value::String(s) => s.contains(&right.to_text()),
            Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
            Value::Object(map) => right.as_str().map_or(false, |key| map.contains_key(key)),
            _ => false,
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        // Inputs often carry numbers as text
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().map_or(false, |v| (v - n).abs() < f64::EPSILON)
        }
        _ => left == right,
    }
}

fn numbers(left: &Value, right: &Value) -> Option<(f64, f64)> {
    Some((number(left)?, number(right)?))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> Value {
        Value::from(json!({
            "start": {"intent": "search", "score": 7.5, "tags": ["bug", "urgent"], "draft": false},
            "count": "3"
        }))
    }

    #[test]
    fn parses_comparisons() {
        assert_eq!(
            parse("start.intent == 'search'").unwrap(),
            Expression::Compare {
                left: Operand::Path("start.intent".into()),
                op: CompareOp::Eq,
                right: Operand::Literal(Value::from("search")),
            }
        );
        assert!(matches!(parse("a >= 5").unwrap(), Expression::Compare { op: CompareOp::Gte, .. }));
        assert_eq!(parse("  "), Err(ExpressionError::Empty));
        assert!(parse("this is not valid").is_err());
    }

    #[test]
    fn or_binds_looser_than_and() {
        let expr = parse("false and false or true").unwrap();
        assert!(matches!(expr, Expression::Or(_, _)));
        assert!(evaluate(&expr, &Value::Null));
    }

    #[test]
    fn evaluates_against_inputs() {
        let root = root();
        assert!(check("start.intent == 'search'", &root).unwrap());
        assert!(check("start.score > 5 and start.score <= 7.5", &root).unwrap());
        assert!(check("start.tags contains 'bug'", &root).unwrap());
        assert!(check("not start.draft", &root).unwrap());
        assert!(check("count == 3", &root).unwrap());
        assert!(check("missing == null", &root).unwrap());
        assert!(!check("start.intent != 'search' or (start.score < 1)", &root).unwrap());
    }

    #[test]
    fn literal_left_side_after_interpolation() {
        assert!(check("4 > 3", &Value::Null).unwrap());
        assert!(check("'abc' contains 'b'", &Value::Null).unwrap());
    }
}
