//! XPath expression subsystem.
//!
//! Workflows use a compact XPath dialect for conditions, loops and input
//! binding. The engine consumes it through one narrow entry point,
//! [`XPathEval::evaluate`], so tests can exercise it in isolation and the
//! instance engine can register its own functions (`evqGetOutput`,
//! `evqGetContext`, ...) through [`FunctionProvider`].
//!
//! Supported grammar: literals, child/attribute steps, `.` and `..`, `/`
//! and `//`, `preceding-sibling::` / `following-sibling::` axes, predicates
//! (`[3]` index or boolean filter), function calls, and the operators
//! `* div mod + - < <= > >= = != and or |` with the usual precedence.

mod eval;
mod functions;
mod lexer;
mod parser;

use crate::error::{EngineError, Result};
use crate::xml::{Document, NodeId};

pub use eval::XPathEval;

/// One member of a node sequence: an element/text node or an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Node(NodeId),
    Attr { node: NodeId, name: String },
}

/// The result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Item>),
}

impl Value {
    /// Truthiness: non-zero numbers, non-empty strings, non-empty sequences.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Seq(items) => !items.is_empty(),
        }
    }

    /// String value. A sequence converts through its first item.
    pub fn as_string(&self, doc: &Document) -> String {
        match self {
            Value::Bool(b) => if *b { "true" } else { "false" }.to_owned(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => s.clone(),
            Value::Seq(items) => items.first().map(|i| i.string_value(doc)).unwrap_or_default(),
        }
    }

    /// Numeric value, if the value converts cleanly.
    pub fn as_number(&self, doc: &Document) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Seq(_) => self.as_string(doc).trim().parse().ok(),
        }
    }
}

impl Item {
    /// Text content of a node, or the attribute's value.
    pub fn string_value(&self, doc: &Document) -> String {
        match self {
            Item::Node(id) => doc.text(*id),
            Item::Attr { node, name } => doc.attr(*node, name).unwrap_or_default().to_owned(),
        }
    }

    /// Element name or attribute name.
    pub fn node_name(&self, doc: &Document) -> String {
        match self {
            Item::Node(id) => doc.name(*id).unwrap_or_default().to_owned(),
            Item::Attr { name, .. } => name.clone(),
        }
    }
}

/// Extension point for engine-registered functions.
///
/// Returns `None` when the name is not handled, letting the evaluator fall
/// through to its builtin set (and error on a truly unknown name).
pub trait FunctionProvider {
    fn call(&self, name: &str, args: &[Value], doc: &Document) -> Option<Result<Value>>;
}

/// Parse an expression without evaluating it (syntax validation).
pub fn parse(expr: &str) -> Result<()> {
    parser::parse(expr).map(|_| ())
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

pub(crate) fn xpath_err(expr: &str, message: impl Into<String>) -> EngineError {
    EngineError::xpath("XPath", format!("{} in expression {expr:?}", message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(Value::Bool(true).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Float(0.5).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(!Value::Seq(vec![]).truthy());
    }

    #[test]
    fn float_formatting_drops_trailing_zero() {
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(3.5), "3.5");
    }

    #[test]
    fn parse_validates_syntax() {
        assert!(parse("count(tasks/task) > 0").is_ok());
        assert!(parse("count(").is_err());
    }
}
