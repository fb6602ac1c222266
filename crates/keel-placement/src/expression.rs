//! Placement-constraint expressions.
//!
//! A small boolean language over node properties:
//!
//! ```text
//! NodeType == Back && (Disk >= 256 || IsSsd)
//! ```
//!
//! The grammar lives in `expression.pest`. The left side of a
//! comparison names a property (or one of the builtins `NodeName`,
//! `FaultDomain`, `UpgradeDomain`); a bare identifier on the right is a
//! string value. A lone identifier is true
//! when the property equals `true`. Comparisons against a missing
//! property are false.

use std::collections::BTreeMap;

use pest::Parser;
use pest::error::InputLocation;
use pest::iterators::Pair;
use thiserror::Error;

use self::grammar::{ExpressionParser, Rule};

#[allow(clippy::upper_case_acronyms)] // EOI from pest.
mod grammar {
    use pest_derive::Parser;

    #[derive(Parser)]
    #[grammar = "expression.pest"]
    pub struct ExpressionParser;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("invalid expression at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("integer '{0}' out of range")]
    IntegerRange(String),
}

pub type ExpressionResult<T> = Result<T, ExpressionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Compare {
        property: String,
        op: CompareOp,
        value: Value,
    },
    Flag(String),
}

/// Node attributes an expression is evaluated against.
pub struct NodeView<'a> {
    pub name: &'a str,
    pub fault_domain: &'a str,
    pub upgrade_domain: &'a str,
    pub properties: &'a BTreeMap<String, String>,
}

impl NodeView<'_> {
    fn lookup(&self, property: &str) -> Option<&str> {
        match property {
            "NodeName" => Some(self.name),
            "FaultDomain" => Some(self.fault_domain),
            "UpgradeDomain" => Some(self.upgrade_domain),
            other => self.properties.get(other).map(String::as_str),
        }
    }
}

impl Expression {
    /// Parse an expression. Blank input yields `None`: no constraint.
    pub fn parse(input: &str) -> ExpressionResult<Option<Expression>> {
        let root = ExpressionParser::parse(Rule::expression, input)
            .map_err(syntax_error)?
            .next()
            .ok_or_else(|| malformed(0, "empty parse"))?;
        root.into_inner()
            .find(|pair| pair.as_rule() == Rule::or_expr)
            .map(build)
            .transpose()
    }

    pub fn evaluate(&self, node: &NodeView<'_>) -> bool {
        match self {
            Expression::And(a, b) => a.evaluate(node) && b.evaluate(node),
            Expression::Or(a, b) => a.evaluate(node) || b.evaluate(node),
            Expression::Not(inner) => !inner.evaluate(node),
            Expression::Flag(property) => node
                .lookup(property)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            Expression::Compare { property, op, value } => match node.lookup(property) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
        }
    }
}

fn compare(actual: &str, op: CompareOp, expected: &Value) -> bool {
    let ordering = match expected {
        Value::Integer(n) => match actual.trim().parse::<i64>() {
            Ok(a) => a.cmp(n),
            Err(_) => return false,
        },
        Value::Text(s) => match (actual.trim().parse::<i64>(), s.parse::<i64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => actual.cmp(s.as_str()),
        },
    };
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    }
}

fn syntax_error(err: pest::error::Error<Rule>) -> ExpressionError {
    let offset = match err.location {
        InputLocation::Pos(pos) => pos,
        InputLocation::Span((start, _)) => start,
    };
    ExpressionError::Syntax {
        offset,
        message: err.variant.message().into_owned(),
    }
}

fn malformed(offset: usize, message: &str) -> ExpressionError {
    ExpressionError::Syntax {
        offset,
        message: message.to_string(),
    }
}

/// Fold a parsed pair into the expression tree. Binary operators
/// associate to the left.
fn build(pair: Pair<'_, Rule>) -> ExpressionResult<Expression> {
    let offset = pair.as_span().start();
    match pair.as_rule() {
        Rule::or_expr | Rule::and_expr => {
            let or = pair.as_rule() == Rule::or_expr;
            let mut operands = pair.into_inner();
            let first = operands.next().ok_or_else(|| malformed(offset, "missing operand"))?;
            operands.try_fold(build(first)?, |left, next| -> ExpressionResult<Expression> {
                let right = Box::new(build(next)?);
                Ok(if or {
                    Expression::Or(Box::new(left), right)
                } else {
                    Expression::And(Box::new(left), right)
                })
            })
        }
        Rule::not => {
            let inner = pair.into_inner().next().ok_or_else(|| malformed(offset, "missing operand"))?;
            Ok(Expression::Not(Box::new(build(inner)?)))
        }
        Rule::compare => {
            let mut parts = pair.into_inner();
            let property = parts
                .next()
                .ok_or_else(|| malformed(offset, "missing property"))?
                .as_str()
                .to_string();
            let Some(op) = parts.next() else {
                return Ok(Expression::Flag(property));
            };
            let op = match op.as_str() {
                "==" => CompareOp::Eq,
                "!=" => CompareOp::Ne,
                "<" => CompareOp::Lt,
                "<=" => CompareOp::Le,
                ">" => CompareOp::Gt,
                ">=" => CompareOp::Ge,
                other => return Err(malformed(offset, &format!("unknown operator '{other}'"))),
            };
            let value = parts.next().ok_or_else(|| malformed(offset, "missing value"))?;
            let value = match value.as_rule() {
                Rule::integer => value
                    .as_str()
                    .parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|_| ExpressionError::IntegerRange(value.as_str().to_string()))?,
                Rule::string => Value::Text(value.into_inner().next().map_or("", |text| text.as_str()).to_string()),
                _ => Value::Text(value.as_str().to_string()),
            };
            Ok(Expression::Compare { property, op, value })
        }
        rule => Err(malformed(offset, &format!("unexpected rule {rule:?}"))),
    }
}
