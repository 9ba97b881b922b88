//! Typed boolean expressions for sequence-flow conditions.
//!
//! Conditions are parsed once at definition load and evaluated against a
//! read-only variable map at every gateway visit. Evaluation is total:
//! unknown variables resolve to JSON null, and ordering comparisons on
//! non-numeric operands are simply false.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, recognize, value},
    multi::fold_many0,
    number::complete::double,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::VarMap;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("unparsable condition expression: `{0}`")]
    Parse(String),
}

/// One side of a comparison: a literal or a variable reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Bool(bool),
    Number(f64),
    Str(String),
    Var(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed condition AST.
///
/// Grammar, loosest binding first:
///
/// ```text
/// expr    := and ( "||" and )*
/// and     := unary ( "&&" unary )*
/// unary   := "!" unary | primary
/// primary := "(" expr ")" | operand cmp-op operand | operand
/// operand := string | number | "true" | "false" | ident
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Cmp { lhs: Operand, op: CmpOp, rhs: Operand },
    /// Truthiness test of a bare operand, e.g. `valid`.
    Test(Operand),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        match all_consuming(ws(or_expr))(input) {
            Ok((_, cond)) => Ok(cond),
            Err(_) => Err(ConditionError::Parse(input.trim().to_string())),
        }
    }

    pub fn evaluate(&self, data: &VarMap) -> bool {
        match self {
            Condition::And(a, b) => a.evaluate(data) && b.evaluate(data),
            Condition::Or(a, b) => a.evaluate(data) || b.evaluate(data),
            Condition::Not(inner) => !inner.evaluate(data),
            Condition::Cmp { lhs, op, rhs } => compare(&lhs.resolve(data), *op, &rhs.resolve(data)),
            Condition::Test(operand) => is_truthy(&operand.resolve(data)),
        }
    }
}

impl Operand {
    fn resolve(&self, data: &VarMap) -> Value {
        match self {
            Operand::Bool(b) => Value::Bool(*b),
            Operand::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Operand::Str(s) => Value::String(s.clone()),
            Operand::Var(name) => data.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(_) | Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numbers compare as f64 regardless of integer/float representation;
/// everything else falls back to structural equality.
fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    let numeric = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(x), Some(y)) => Some((x, y)),
        _ => None,
    };
    match op {
        CmpOp::Eq => numeric.map(|(x, y)| x == y).unwrap_or(lhs == rhs),
        CmpOp::Ne => !numeric.map(|(x, y)| x == y).unwrap_or(lhs == rhs),
        CmpOp::Lt => numeric.map(|(x, y)| x < y).unwrap_or(false),
        CmpOp::Le => numeric.map(|(x, y)| x <= y).unwrap_or(false),
        CmpOp::Gt => numeric.map(|(x, y)| x > y).unwrap_or(false),
        CmpOp::Ge => numeric.map(|(x, y)| x >= y).unwrap_or(false),
    }
}

// ─── Parser ───────────────────────────────────────────────────

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
    ))(input)
}

fn string_lit(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
    ))(input)
}

fn operand(input: &str) -> IResult<&str, Operand> {
    alt((
        map(string_lit, |s: &str| Operand::Str(s.to_string())),
        map(double, Operand::Number),
        map(ident, |s| match s {
            "true" => Operand::Bool(true),
            "false" => Operand::Bool(false),
            _ => Operand::Var(s.to_string()),
        }),
    ))(input)
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Condition> {
    map(tuple((ws(operand), cmp_op, ws(operand))), |(lhs, op, rhs)| {
        Condition::Cmp { lhs, op, rhs }
    })(input)
}

fn primary(input: &str) -> IResult<&str, Condition> {
    alt((
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        comparison,
        map(ws(operand), Condition::Test),
    ))(input)
}

fn unary(input: &str) -> IResult<&str, Condition> {
    alt((
        map(preceded(ws(char('!')), unary), |c| Condition::Not(Box::new(c))),
        primary,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Condition> {
    let (input, first) = unary(input)?;
    fold_many0(
        preceded(ws(tag("&&")), unary),
        move || first.clone(),
        |acc, rhs| Condition::And(Box::new(acc), Box::new(rhs)),
    )(input)
}

fn or_expr(input: &str) -> IResult<&str, Condition> {
    let (input, first) = and_expr(input)?;
    fold_many0(
        preceded(ws(tag("||")), and_expr),
        move || first.clone(),
        |acc, rhs| Condition::Or(Box::new(acc), Box::new(rhs)),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn bare_ident_is_truthiness_test() {
        let cond = Condition::parse("valid").unwrap();
        assert!(cond.evaluate(&data(&[("valid", json!(true))])));
        assert!(!cond.evaluate(&data(&[("valid", json!(false))])));
        // Missing variable resolves to null — false.
        assert!(!cond.evaluate(&data(&[])));
    }

    #[test]
    fn comparisons() {
        let cond = Condition::parse("amount >= 100").unwrap();
        assert!(cond.evaluate(&data(&[("amount", json!(100))])));
        assert!(cond.evaluate(&data(&[("amount", json!(250.5))])));
        assert!(!cond.evaluate(&data(&[("amount", json!(99))])));
        // Non-numeric operand: ordering is false, never a panic.
        assert!(!cond.evaluate(&data(&[("amount", json!("lots"))])));
    }

    #[test]
    fn integer_and_float_compare_equal() {
        let cond = Condition::parse("count == 3").unwrap();
        assert!(cond.evaluate(&data(&[("count", json!(3))])));
        assert!(cond.evaluate(&data(&[("count", json!(3.0))])));
    }

    #[test]
    fn string_equality() {
        let cond = Condition::parse("status == \"approved\"").unwrap();
        assert!(cond.evaluate(&data(&[("status", json!("approved"))])));
        assert!(!cond.evaluate(&data(&[("status", json!("rejected"))])));

        let single = Condition::parse("status != 'rejected'").unwrap();
        assert!(single.evaluate(&data(&[("status", json!("approved"))])));
    }

    #[test]
    fn precedence_and_parens() {
        // && binds tighter than ||
        let cond = Condition::parse("a || b && c").unwrap();
        assert!(cond.evaluate(&data(&[
            ("a", json!(true)),
            ("b", json!(false)),
            ("c", json!(false)),
        ])));
        assert!(!cond.evaluate(&data(&[
            ("a", json!(false)),
            ("b", json!(true)),
            ("c", json!(false)),
        ])));

        let grouped = Condition::parse("(a || b) && c").unwrap();
        assert!(!grouped.evaluate(&data(&[
            ("a", json!(true)),
            ("b", json!(false)),
            ("c", json!(false)),
        ])));
    }

    #[test]
    fn negation() {
        let cond = Condition::parse("!valid && retries < 3").unwrap();
        assert!(cond.evaluate(&data(&[("valid", json!(false)), ("retries", json!(1))])));
        assert!(!cond.evaluate(&data(&[("valid", json!(true)), ("retries", json!(1))])));
    }

    #[test]
    fn unparsable_is_an_error() {
        assert!(matches!(
            Condition::parse("amount >="),
            Err(ConditionError::Parse(_))
        ));
        assert!(Condition::parse("&& nope").is_err());
        assert!(Condition::parse("").is_err());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let cond = Condition::parse("valid && amount > 10").unwrap();
        let vars = data(&[("valid", json!(true)), ("amount", json!(42))]);
        let first = cond.evaluate(&vars);
        for _ in 0..10 {
            assert_eq!(cond.evaluate(&vars), first);
        }
    }
}
