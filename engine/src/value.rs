//! FILENAME: engine/src/value.rs
//! PURPOSE: The cell value lattice, error taxonomy, coercions, and ordering.
//! CONTEXT: Errors are first-class values here, never exceptions — every
//! operator and function funnels through `to_number`/`to_bool`/`to_string`
//! and `ErrorKind::combine` so the propagation rule lives in one place.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// The six recoverable error kinds, carrying a fixed priority used whenever
/// more than one error could be the result of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    BadReference,
    BadName,
    TypeError,
    DivideByZero,
    Circular,
    Parse,
}

impl ErrorKind {
    /// PARSE=6, CIRCULAR=5, the remaining four share priority 4.
    pub fn priority(&self) -> u8 {
        match self {
            ErrorKind::Parse => 6,
            ErrorKind::Circular => 5,
            ErrorKind::BadReference | ErrorKind::BadName | ErrorKind::TypeError | ErrorKind::DivideByZero => 4,
        }
    }

    pub fn literal(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "#ERROR!",
            ErrorKind::Circular => "#CIRCREF!",
            ErrorKind::BadReference => "#REF!",
            ErrorKind::BadName => "#NAME?",
            ErrorKind::TypeError => "#VALUE!",
            ErrorKind::DivideByZero => "#DIV/0!",
        }
    }

    pub fn from_literal(text: &str) -> Option<ErrorKind> {
        match text.to_uppercase().as_str() {
            "#ERROR!" => Some(ErrorKind::Parse),
            "#CIRCREF!" => Some(ErrorKind::Circular),
            "#REF!" => Some(ErrorKind::BadReference),
            "#NAME?" => Some(ErrorKind::BadName),
            "#VALUE!" => Some(ErrorKind::TypeError),
            "#DIV/0!" => Some(ErrorKind::DivideByZero),
            _ => None,
        }
    }

    /// Total ordering among error kinds, used when comparing two error values
    /// of otherwise-equal tag.
    fn ordinal(&self) -> u8 {
        match self {
            ErrorKind::BadReference => 0,
            ErrorKind::BadName => 1,
            ErrorKind::TypeError => 2,
            ErrorKind::DivideByZero => 3,
            ErrorKind::Circular => 4,
            ErrorKind::Parse => 5,
        }
    }
}

impl PartialOrd for ErrorKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.ordinal().cmp(&other.ordinal()))
    }
}

/// Picks the highest-priority error among `errors`. Panics if `errors` is
/// empty; callers are expected to check first.
pub fn highest_priority(errors: impl IntoIterator<Item = ErrorKind>) -> ErrorKind {
    errors
        .into_iter()
        .reduce(|a, b| if b.priority() > a.priority() { b } else { a })
        .expect("highest_priority called with no errors")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Empty,
    Number(Decimal),
    Text(String),
    Boolean(bool),
    Error(ErrorKind),
}

impl Value {
    pub fn error(kind: ErrorKind) -> Value {
        Value::Error(kind)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Value::Error(k) => Some(*k),
            _ => None,
        }
    }

    /// If this value is an error, returns it; otherwise `None`. Used to
    /// thread the propagation rule through operator and function bodies:
    /// `if let Some(e) = a.propagate().or_else(|| b.propagate()) { return e }`.
    pub fn propagate(&self) -> Option<Value> {
        if self.is_error() {
            Some(self.clone())
        } else {
            None
        }
    }

    /// Coercion used by arithmetic operators and numeric functions.
    pub fn to_number(&self) -> Result<Decimal, ErrorKind> {
        match self {
            Value::Empty => Ok(Decimal::ZERO),
            Value::Number(n) => Ok(*n),
            Value::Text(s) => Decimal::from_str(s.trim()).map_err(|_| ErrorKind::TypeError),
            Value::Boolean(b) => Ok(if *b { Decimal::ONE } else { Decimal::ZERO }),
            Value::Error(k) => Err(*k),
        }
    }

    /// Coercion used by logical operators and functions.
    pub fn to_bool(&self) -> Result<bool, ErrorKind> {
        match self {
            Value::Empty => Ok(false),
            Value::Number(n) => Ok(!n.is_zero()),
            Value::Text(s) => match s.trim().to_ascii_uppercase().as_str() {
                "TRUE" => Ok(true),
                "FALSE" => Ok(false),
                _ => Err(ErrorKind::TypeError),
            },
            Value::Boolean(b) => Ok(*b),
            Value::Error(k) => Err(*k),
        }
    }

    /// Coercion used by string concatenation and text functions. Unlike
    /// `to_number`/`to_bool`, this coercion never fails: an error value
    /// stringifies to its own literal (`#CIRCREF!`, ...) rather than
    /// propagating, so e.g. `="x" & A1` where A1 is an error yields a
    /// string containing that error's text, not the error itself.
    pub fn to_text(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Number(n) => canonical_decimal(n),
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Error(k) => k.literal().to_string(),
        }
    }
}

fn tag_rank(v: &Value) -> u8 {
    match v {
        Value::Empty => 0,
        Value::Error(_) => 1,
        Value::Number(_) => 2,
        Value::Text(_) => 3,
        Value::Boolean(_) => 4,
    }
}

/// Total order across the value lattice, per §4.2: empty compared against a
/// non-empty value of tag T is treated as T's zero value; errors always
/// propagate before comparison reaches this function (callers check
/// `is_error` first using the propagation rule).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Value::Empty, other) | (other, Value::Empty) = (a, b) {
        if !matches!(other, Value::Empty) {
            let zero = zero_of_tag(other);
            let (lhs, rhs) = if matches!(a, Value::Empty) {
                (&zero, other)
            } else {
                (other, &zero)
            };
            return compare_same_or_cross(lhs, rhs);
        }
    }
    compare_same_or_cross(a, b)
}

fn zero_of_tag(v: &Value) -> Value {
    match v {
        Value::Number(_) => Value::Number(Decimal::ZERO),
        Value::Text(_) => Value::Text(String::new()),
        Value::Boolean(_) => Value::Boolean(false),
        Value::Error(k) => Value::Error(*k),
        Value::Empty => Value::Empty,
    }
}

fn compare_same_or_cross(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.to_uppercase().cmp(&y.to_uppercase()),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Error(x), Value::Error(y)) => x.ordinal_pub().cmp(&y.ordinal_pub()),
        (Value::Empty, Value::Empty) => Ordering::Equal,
        _ => tag_rank(a).cmp(&tag_rank(b)),
    }
}

impl ErrorKind {
    fn ordinal_pub(&self) -> u8 {
        self.ordinal()
    }
}

/// Canonical decimal rendering: trailing zeros right of the decimal point
/// and a dangling decimal point are stripped.
pub fn canonical_decimal(n: &Decimal) -> String {
    let s = n.normalize().to_string();
    s
}

/// Turns the result of a checked decimal operation into a `Value`: `Some`
/// becomes a `Number`, `None` (overflow) becomes the signed infinity text
/// from §3 rather than a panic or a silently wrapped number. `approx_sign`
/// only needs its sign to be right — it's typically the same operation
/// performed in `f64`, which is precise enough to tell which direction the
/// overflow went.
pub fn decimal_from_checked(checked: Option<Decimal>, approx_sign: f64) -> Value {
    match checked {
        Some(n) => Value::Number(n),
        None => Value::Text(if approx_sign < 0.0 { "-Infinity" } else { "Infinity" }.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn error_priority_ordering() {
        assert!(ErrorKind::Parse.priority() > ErrorKind::Circular.priority());
        assert!(ErrorKind::Circular.priority() > ErrorKind::BadReference.priority());
        assert_eq!(ErrorKind::BadReference.priority(), ErrorKind::TypeError.priority());
    }

    #[test]
    fn highest_priority_picks_parse() {
        let picked = highest_priority([ErrorKind::DivideByZero, ErrorKind::Parse, ErrorKind::Circular]);
        assert_eq!(picked, ErrorKind::Parse);
    }

    #[test]
    fn highest_priority_keeps_first_on_tie() {
        let picked = highest_priority([ErrorKind::BadReference, ErrorKind::TypeError]);
        assert_eq!(picked, ErrorKind::BadReference);
    }

    #[test]
    fn to_number_coercions() {
        assert_eq!(Value::Empty.to_number().unwrap(), Decimal::ZERO);
        assert_eq!(Value::Boolean(true).to_number().unwrap(), Decimal::ONE);
        assert_eq!(Value::Text("3.5".into()).to_number().unwrap(), dec("3.5"));
        assert!(Value::Text("abc".into()).to_number().is_err());
        assert_eq!(Value::Error(ErrorKind::TypeError).to_number(), Err(ErrorKind::TypeError));
    }

    #[test]
    fn to_bool_coercions() {
        assert_eq!(Value::Empty.to_bool().unwrap(), false);
        assert_eq!(Value::Number(dec("5")).to_bool().unwrap(), true);
        assert_eq!(Value::Text("true".into()).to_bool().unwrap(), true);
        assert_eq!(Value::Text("FALSE".into()).to_bool().unwrap(), false);
        assert!(Value::Text("yes".into()).to_bool().is_err());
    }

    #[test]
    fn canonical_decimal_strips_trailing_zeros() {
        assert_eq!(canonical_decimal(&dec("3.1400")), "3.14");
        assert_eq!(canonical_decimal(&dec("3.000")), "3");
    }

    #[test]
    fn decimal_from_checked_reports_signed_infinity_on_overflow() {
        assert_eq!(decimal_from_checked(None, 1.0), Value::Text("Infinity".to_string()));
        assert_eq!(decimal_from_checked(None, -1.0), Value::Text("-Infinity".to_string()));
        assert_eq!(decimal_from_checked(Some(dec("5")), 1.0), Value::Number(dec("5")));
    }

    #[test]
    fn comparison_cross_tag_order() {
        assert_eq!(compare_values(&Value::Number(dec("1")), &Value::Text("a".into())), Ordering::Less);
        assert_eq!(compare_values(&Value::Text("a".into()), &Value::Boolean(true)), Ordering::Less);
    }

    #[test]
    fn empty_compares_as_zero_value() {
        assert_eq!(compare_values(&Value::Empty, &Value::Number(dec("0"))), Ordering::Equal);
        assert_eq!(compare_values(&Value::Empty, &Value::Number(dec("5"))), Ordering::Less);
        assert_eq!(compare_values(&Value::Empty, &Value::Text(String::new())), Ordering::Equal);
    }

    #[test]
    fn string_comparison_case_insensitive() {
        assert_eq!(compare_values(&Value::Text("ABC".into()), &Value::Text("abc".into())), Ordering::Equal);
    }
}
