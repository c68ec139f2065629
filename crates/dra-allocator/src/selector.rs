//! Device selector evaluation.
//!
//! The expression language is pluggable through [`SelectorEvaluator`].
//! Evaluators see a read-only [`DeviceView`] with the driver name and the
//! device's attributes and capacities grouped by domain. Unqualified names
//! on the device belong to the driver's domain.
//!
//! [`BasicEvaluator`] covers the subset used in practice for filtering:
//!
//! ```text
//!   expr   := clause ( "&&" clause )*
//!   clause := "true" | "false" | field | field op literal
//!   field  := device.driver
//!           | device.attributes["<domain>"].<id>
//!           | device.capacity["<domain>"].<id>
//!   op     := == | != | >= | <= | > | <
//! ```
//!
//! Clauses are evaluated left to right and stop at the first false one, so
//! `device.driver == "x" && device.attributes["x"].model == "y"` is safe on
//! devices of other drivers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use dra_core::names::split_qualified;
use dra_core::{Device, DeviceAttribute, Quantity};
use thiserror::Error;

/// Read-only view of one device handed to an evaluator.
#[derive(Debug, Clone)]
pub struct DeviceView<'a> {
    pub driver: &'a str,
    /// domain → id → value
    pub attributes: BTreeMap<&'a str, BTreeMap<&'a str, &'a DeviceAttribute>>,
    /// domain → id → value
    pub capacity: BTreeMap<&'a str, BTreeMap<&'a str, &'a Quantity>>,
}

impl<'a> DeviceView<'a> {
    pub fn new(driver: &'a str, device: &'a Device) -> Self {
        let mut attributes: BTreeMap<_, BTreeMap<_, _>> = BTreeMap::new();
        for (name, value) in &device.attributes {
            let (domain, id) = split_qualified(name);
            attributes.entry(domain.unwrap_or(driver)).or_default().insert(id, value);
        }
        let mut capacity: BTreeMap<_, BTreeMap<_, _>> = BTreeMap::new();
        for (name, cap) in &device.capacity {
            let (domain, id) = split_qualified(name);
            capacity.entry(domain.unwrap_or(driver)).or_default().insert(id, &cap.value);
        }
        Self {
            driver,
            attributes,
            capacity,
        }
    }

    pub fn attribute(&self, domain: &str, id: &str) -> Option<&'a DeviceAttribute> {
        self.attributes.get(domain)?.get(id).copied()
    }

    pub fn capacity(&self, domain: &str, id: &str) -> Option<&'a Quantity> {
        self.capacity.get(domain)?.get(id).copied()
    }
}

/// The outcome of evaluating an expression. Selectors must produce
/// [`EvalValue::Bool`]; anything else aborts the allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Bool(bool),
    Int(i64),
    String(String),
    Version(semver::Version),
    Quantity(Quantity),
}

impl fmt::Display for EvalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalValue::Bool(b) => write!(f, "{b}"),
            EvalValue::Int(i) => write!(f, "{i}"),
            EvalValue::String(s) => write!(f, "{s:?}"),
            EvalValue::Version(v) => write!(f, "semver({v})"),
            EvalValue::Quantity(q) => write!(f, "quantity({q})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("no such key: {0}")]
    UndefinedField(String),

    #[error("cannot compare {left} with {right}")]
    TypeMismatch { left: String, right: String },

    #[error("expression returned {0}, expected a boolean")]
    NotBoolean(String),
}

/// Evaluates selector expressions against devices.
pub trait SelectorEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, device: &DeviceView<'_>) -> Result<EvalValue, EvalError>;

    /// Evaluate and insist on a boolean.
    fn matches(&self, expression: &str, device: &DeviceView<'_>) -> Result<bool, EvalError> {
        match self.evaluate(expression, device)? {
            EvalValue::Bool(b) => Ok(b),
            other => Err(EvalError::NotBoolean(other.to_string())),
        }
    }
}

impl<F> SelectorEvaluator for F
where
    F: Fn(&str, &DeviceView<'_>) -> Result<EvalValue, EvalError> + Send + Sync,
{
    fn evaluate(&self, expression: &str, device: &DeviceView<'_>) -> Result<EvalValue, EvalError> {
        self(expression, device)
    }
}

// ── Basic evaluator ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEvaluator;

const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

impl SelectorEvaluator for BasicEvaluator {
    fn evaluate(&self, expression: &str, device: &DeviceView<'_>) -> Result<EvalValue, EvalError> {
        let clauses = split_outside_quotes(expression, "&&");
        if clauses.len() == 1 {
            return eval_clause(clauses[0], device);
        }
        for clause in clauses {
            match eval_clause(clause, device)? {
                EvalValue::Bool(true) => {}
                EvalValue::Bool(false) => return Ok(EvalValue::Bool(false)),
                other => return Err(EvalError::NotBoolean(other.to_string())),
            }
        }
        Ok(EvalValue::Bool(true))
    }
}

/// Split on `sep` where it does not occur inside a double-quoted string.
fn split_outside_quotes<'e>(expr: &'e str, sep: &str) -> Vec<&'e str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quote => i += 1,
            b'"' => in_quote = !in_quote,
            _ if !in_quote && bytes[i..].starts_with(sep.as_bytes()) => {
                parts.push(&expr[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

/// First comparison operator outside quotes: (position, operator).
fn find_operator(clause: &str) -> Option<(usize, &'static str)> {
    let bytes = clause.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quote => i += 1,
            b'"' => in_quote = !in_quote,
            _ if !in_quote => {
                if let Some(op) = OPERATORS.iter().find(|op| bytes[i..].starts_with(op.as_bytes())) {
                    return Some((i, *op));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn eval_clause(clause: &str, device: &DeviceView<'_>) -> Result<EvalValue, EvalError> {
    let clause = clause.trim();
    match clause {
        "" => return Err(EvalError::Parse("empty expression".to_string())),
        "true" => return Ok(EvalValue::Bool(true)),
        "false" => return Ok(EvalValue::Bool(false)),
        _ => {}
    }
    let Some((pos, op)) = find_operator(clause) else {
        return resolve_field(clause, device);
    };
    let left = resolve_field(clause[..pos].trim(), device)?;
    let right = parse_literal(clause[pos + op.len()..].trim(), &left)?;
    let ordering = compare(&left, &right)?;
    let result = match op {
        "==" => ordering == Some(Ordering::Equal),
        "!=" => ordering != Some(Ordering::Equal),
        _ => {
            let Some(ord) = ordering else {
                return Err(EvalError::TypeMismatch {
                    left: format!("{left} ({op})"),
                    right: right.to_string(),
                });
            };
            match op {
                ">=" => ord != Ordering::Less,
                "<=" => ord != Ordering::Greater,
                ">" => ord == Ordering::Greater,
                _ => ord == Ordering::Less,
            }
        }
    };
    Ok(EvalValue::Bool(result))
}

/// `None` for types that only support equality and are unequal.
fn compare(left: &EvalValue, right: &EvalValue) -> Result<Option<Ordering>, EvalError> {
    Ok(match (left, right) {
        (EvalValue::Int(a), EvalValue::Int(b)) => Some(a.cmp(b)),
        (EvalValue::Version(a), EvalValue::Version(b)) => Some(a.cmp_precedence(b)),
        (EvalValue::Quantity(a), EvalValue::Quantity(b)) => Some(a.cmp(b)),
        (EvalValue::String(a), EvalValue::String(b)) => (a == b).then_some(Ordering::Equal),
        (EvalValue::Bool(a), EvalValue::Bool(b)) => (a == b).then_some(Ordering::Equal),
        _ => {
            return Err(EvalError::TypeMismatch {
                left: left.to_string(),
                right: right.to_string(),
            });
        }
    })
}

fn resolve_field(field: &str, device: &DeviceView<'_>) -> Result<EvalValue, EvalError> {
    if field == "device.driver" {
        return Ok(EvalValue::String(device.driver.to_string()));
    }
    let (map, rest) = if let Some(rest) = field.strip_prefix("device.attributes[") {
        ("attributes", rest)
    } else if let Some(rest) = field.strip_prefix("device.capacity[") {
        ("capacity", rest)
    } else {
        return Err(EvalError::Parse(format!("unsupported field {field}")));
    };
    let (domain, id) = rest
        .strip_prefix('"')
        .and_then(|r| r.split_once("\"]."))
        .ok_or_else(|| EvalError::Parse(format!("malformed field {field}")))?;

    if map == "attributes" {
        let attr = device
            .attribute(domain, id)
            .ok_or_else(|| EvalError::UndefinedField(field.to_string()))?;
        match attr {
            DeviceAttribute::Int(i) => Ok(EvalValue::Int(*i)),
            DeviceAttribute::Bool(b) => Ok(EvalValue::Bool(*b)),
            DeviceAttribute::String(s) => Ok(EvalValue::String(s.clone())),
            DeviceAttribute::Version(v) => semver::Version::parse(v)
                .map(EvalValue::Version)
                .map_err(|e| EvalError::Parse(format!("{field}: {e}"))),
        }
    } else {
        device
            .capacity(domain, id)
            .map(|q| EvalValue::Quantity(q.clone()))
            .ok_or_else(|| EvalError::UndefinedField(field.to_string()))
    }
}

/// Parse the right-hand side of a comparison, guided by the left value's
/// type: string literals compare against versions and quantities as
/// `semver("...")` / `quantity("...")` or as plain strings.
fn parse_literal(text: &str, left: &EvalValue) -> Result<EvalValue, EvalError> {
    let unquote = |s: &str| -> Option<String> {
        s.strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(|s| s.replace("\\\"", "\""))
    };
    let parse_err = |what: &str| EvalError::Parse(format!("invalid {what} literal {text}"));

    if let Some(inner) = text.strip_prefix("semver(").and_then(|s| s.strip_suffix(')')) {
        let s = unquote(inner.trim()).ok_or_else(|| parse_err("semver"))?;
        return semver::Version::parse(&s)
            .map(EvalValue::Version)
            .map_err(|_| parse_err("semver"));
    }
    if let Some(inner) = text.strip_prefix("quantity(").and_then(|s| s.strip_suffix(')')) {
        let s = unquote(inner.trim()).ok_or_else(|| parse_err("quantity"))?;
        return s
            .parse()
            .map(EvalValue::Quantity)
            .map_err(|_| parse_err("quantity"));
    }
    if let Some(s) = unquote(text) {
        return Ok(match left {
            EvalValue::Version(_) => semver::Version::parse(&s)
                .map(EvalValue::Version)
                .map_err(|_| parse_err("semver"))?,
            EvalValue::Quantity(_) => s
                .parse()
                .map(EvalValue::Quantity)
                .map_err(|_| parse_err("quantity"))?,
            _ => EvalValue::String(s),
        });
    }
    match text {
        "true" => return Ok(EvalValue::Bool(true)),
        "false" => return Ok(EvalValue::Bool(false)),
        _ => {}
    }
    let int: i64 = text.parse().map_err(|_| parse_err("integer"))?;
    Ok(match left {
        EvalValue::Quantity(_) => EvalValue::Quantity(Quantity::from_int(int)),
        _ => EvalValue::Int(int),
    })
}
