//! FILENAME: engine/src/cell.rs
//! PURPOSE: The per-cell data structure and the pure text-classification
//! step of the contents-setting protocol.
//! CONTEXT: A cell is lightweight: location, the user's original text, the
//! parsed formula tree (if any), and the last computed value. Formula
//! parsing needs nothing beyond the text itself, so `classify_contents` is a
//! free function the workbook calls; everything that needs graph access
//! (linking references, evaluating, cycle detection) lives in `workbook.rs`.

use crate::reference::Reference;
use crate::value::{ErrorKind, Value};
use parser::{parse_formula, Expression};
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Cell {
    pub location: Reference,
    pub contents: Option<String>,
    pub formula_tree: Option<Expression>,
    pub value: Value,
}

impl Cell {
    pub fn new(location: Reference) -> Self {
        Cell {
            location,
            contents: None,
            formula_tree: None,
            value: Value::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_none()
    }
}

/// The outcome of classifying a cell's raw text, per §4.6 step 3. Formula
/// text that fails to parse still counts as "formula" contents (so the
/// cell keeps the text around for the user to fix), just with no tree.
pub enum Classification {
    Empty,
    Formula(Expression),
    FormulaParseError,
    Literal(Value),
}

/// Classifies `text` into the branch of the contents-setting protocol it
/// belongs to. Does not touch any cell or graph state — callers apply the
/// result.
pub fn classify_contents(text: &str) -> Classification {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Classification::Empty;
    }

    let first = trimmed.chars().next().unwrap();
    if first == '=' {
        let body = &trimmed[first.len_utf8()..];
        return match parse_formula(body) {
            Ok(expr) => Classification::Formula(expr),
            Err(_) => Classification::FormulaParseError,
        };
    }

    if first == '\'' {
        return Classification::Literal(Value::Text(trimmed[first.len_utf8()..].to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    if upper == "TRUE" {
        return Classification::Literal(Value::Boolean(true));
    }
    if upper == "FALSE" {
        return Classification::Literal(Value::Boolean(false));
    }
    if let Some(kind) = ErrorKind::from_literal(trimmed) {
        return Classification::Literal(Value::Error(kind));
    }

    match Decimal::from_str(trimmed) {
        Ok(n) => Classification::Literal(Value::Number(n)),
        Err(_) => Classification::Literal(Value::Text(trimmed.to_string())),
    }
}
