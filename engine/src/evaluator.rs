//! FILENAME: engine/src/evaluator.rs
//! PURPOSE: A tree-walking evaluator that turns a parsed formula into a
//! `Value`, plus the function dispatch registry's calling convention.
//! CONTEXT: Carries `(workbook, owning_sheet, owning_cell)` per §4.5. Cell
//! references are resolved by reading the target's *stored* value, never by
//! recursively re-evaluating it — the workbook's topological recomputation
//! order already guarantees the referent is current. Lazy functions record
//! runtime-only edges for the branch they actually took through
//! `runtime_edges`, mirroring the evaluator's side-effect-collection idiom:
//! a `RefCell` buffer drained by the workbook after evaluation completes.

use crate::functions;
use crate::reference::{self, Reference};
use crate::sheet::SheetId;
use crate::value::{highest_priority, ErrorKind, Value};
use crate::workbook::{CellHandle, Workbook};
use parser::{BinaryOperator, Expression, UnaryOperator};
use std::cell::RefCell;

/// The result of evaluating one expression node: either a plain value or an
/// unreduced range (only aggregate functions and the top-level cell
/// evaluation are allowed to consume the latter).
#[derive(Debug, Clone)]
pub enum EvalResult {
    Scalar(Value),
    Range(SheetId, (u32, u32), (u32, u32)),
}

impl EvalResult {
    pub fn into_scalar(self) -> Value {
        match self {
            EvalResult::Scalar(v) => v,
            EvalResult::Range(..) => Value::Error(ErrorKind::TypeError),
        }
    }
}

pub struct EvalContext<'a> {
    pub workbook: &'a Workbook,
    pub owning_sheet: SheetId,
    pub owning_cell: (u32, u32),
    runtime_edges: RefCell<Vec<CellHandle>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(workbook: &'a Workbook, owning_sheet: SheetId, owning_cell: (u32, u32)) -> Self {
        EvalContext {
            workbook,
            owning_sheet,
            owning_cell,
            runtime_edges: RefCell::new(Vec::new()),
        }
    }

    pub fn record_runtime_edge(&self, handle: CellHandle) {
        self.runtime_edges.borrow_mut().push(handle);
    }

    pub fn take_runtime_edges(self) -> Vec<CellHandle> {
        self.runtime_edges.into_inner()
    }

    /// Resolves an optional explicit sheet name against the owning cell's
    /// sheet, returning the target sheet id if it currently exists.
    pub fn resolve_sheet(&self, sheet_name: &Option<String>) -> Option<SheetId> {
        match sheet_name {
            None => Some(self.owning_sheet),
            Some(name) => self.workbook.sheet_id_by_name(name),
        }
    }
}

/// Evaluates the top-level formula tree of a cell to its final scalar
/// value, reducing a bare range result to the value of its first cell.
pub fn evaluate_formula(ctx: &EvalContext, expr: &Expression) -> Value {
    match evaluate(ctx, expr) {
        EvalResult::Scalar(v) => v,
        EvalResult::Range(sheet_id, start, _) => read_cell_value(ctx.workbook, sheet_id, start),
    }
}

pub fn evaluate(ctx: &EvalContext, expr: &Expression) -> EvalResult {
    match expr {
        Expression::NumberLiteral(text) => EvalResult::Scalar(parse_number_literal(text)),
        Expression::StringLiteral(s) => EvalResult::Scalar(Value::Text(s.clone())),
        Expression::BooleanLiteral(b) => EvalResult::Scalar(Value::Boolean(*b)),
        Expression::ErrorLiteral(s) => EvalResult::Scalar(Value::Error(
            ErrorKind::from_literal(s).unwrap_or(ErrorKind::Parse),
        )),
        Expression::CellRef(node) => EvalResult::Scalar(evaluate_cell_ref(ctx, node)),
        Expression::Range { sheet, start, end } => evaluate_range(ctx, sheet, start, end),
        Expression::BinaryOp { left, op, right } => evaluate_binary(ctx, left, *op, right),
        Expression::UnaryOp { op, operand } => evaluate_unary(ctx, *op, operand),
        Expression::FunctionCall { name, args } => functions::dispatch(ctx, name, args),
    }
}

fn parse_number_literal(text: &str) -> Value {
    use rust_decimal::Decimal;
    use std::str::FromStr;
    match Decimal::from_str(text) {
        Ok(n) => Value::Number(n),
        Err(_) => Value::Error(ErrorKind::Parse),
    }
}

fn evaluate_cell_ref(ctx: &EvalContext, node: &parser::CellRefNode) -> Value {
    let sheet_id = match ctx.resolve_sheet(&node.sheet) {
        Some(id) => id,
        None => return Value::Error(ErrorKind::BadReference),
    };
    let col = match reference::col_to_index(&node.col) {
        Some(c) => c,
        None => return Value::Error(ErrorKind::BadReference),
    };
    let target = Reference::new(None, col, node.row, false, false);
    if !target.check_bounds() {
        return Value::Error(ErrorKind::BadReference);
    }
    read_cell_value(ctx.workbook, sheet_id, (col, node.row))
}

fn evaluate_range(
    ctx: &EvalContext,
    sheet: &Option<String>,
    start: &parser::CellRefNode,
    end: &parser::CellRefNode,
) -> EvalResult {
    let sheet_name = sheet.clone().or_else(|| start.sheet.clone()).or_else(|| end.sheet.clone());
    let sheet_id = match ctx.resolve_sheet(&sheet_name) {
        Some(id) => id,
        None => return EvalResult::Scalar(Value::Error(ErrorKind::BadReference)),
    };
    let (Some(c0), Some(c1)) = (reference::col_to_index(&start.col), reference::col_to_index(&end.col)) else {
        return EvalResult::Scalar(Value::Error(ErrorKind::BadReference));
    };
    let (col_min, col_max) = (c0.min(c1), c0.max(c1));
    let (row_min, row_max) = (start.row.min(end.row), start.row.max(end.row));
    EvalResult::Range(sheet_id, (col_min, row_min), (col_max, row_max))
}

/// Reads a cell's stored value directly, without re-evaluation.
pub fn read_cell_value(workbook: &Workbook, sheet_id: SheetId, coord: (u32, u32)) -> Value {
    workbook
        .sheet_by_id(sheet_id)
        .and_then(|sheet| sheet.get_cell(coord.0, coord.1))
        .map(|cell| cell.value.clone())
        .unwrap_or(Value::Empty)
}

fn evaluate_binary(ctx: &EvalContext, left: &Expression, op: BinaryOperator, right: &Expression) -> EvalResult {
    let left_val = evaluate(ctx, left).into_scalar();
    let right_val = evaluate(ctx, right).into_scalar();

    if op == BinaryOperator::Concat {
        return EvalResult::Scalar(Value::Text(format!(
            "{}{}",
            left_val.to_text(),
            right_val.to_text()
        )));
    }

    let errors: Vec<ErrorKind> = [&left_val, &right_val]
        .iter()
        .filter_map(|v| v.error_kind())
        .collect();
    if !errors.is_empty() {
        return EvalResult::Scalar(Value::Error(highest_priority(errors)));
    }

    let result = match op {
        BinaryOperator::Add | BinaryOperator::Subtract | BinaryOperator::Multiply | BinaryOperator::Divide => {
            numeric_binary(op, &left_val, &right_val)
        }
        BinaryOperator::Equal
        | BinaryOperator::NotEqual
        | BinaryOperator::LessThan
        | BinaryOperator::GreaterThan
        | BinaryOperator::LessEqual
        | BinaryOperator::GreaterEqual => comparison_binary(op, &left_val, &right_val),
        BinaryOperator::Concat => unreachable!("handled above"),
    };
    EvalResult::Scalar(result)
}

fn numeric_binary(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    use crate::value::decimal_from_checked;
    use rust_decimal::prelude::ToPrimitive;

    let (Ok(l), Ok(r)) = (left.to_number(), right.to_number()) else {
        return Value::Error(ErrorKind::TypeError);
    };
    let (fl, fr) = (l.to_f64().unwrap_or(0.0), r.to_f64().unwrap_or(0.0));
    match op {
        BinaryOperator::Add => decimal_from_checked(l.checked_add(r), fl + fr),
        BinaryOperator::Subtract => decimal_from_checked(l.checked_sub(r), fl - fr),
        BinaryOperator::Multiply => decimal_from_checked(l.checked_mul(r), fl * fr),
        BinaryOperator::Divide => {
            if r.is_zero() {
                Value::Error(ErrorKind::DivideByZero)
            } else {
                decimal_from_checked(l.checked_div(r), fl / fr)
            }
        }
        _ => unreachable!(),
    }
}

fn comparison_binary(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    use crate::value::compare_values;
    use std::cmp::Ordering;
    let ordering = compare_values(left, right);
    let result = match op {
        BinaryOperator::Equal => ordering == Ordering::Equal,
        BinaryOperator::NotEqual => ordering != Ordering::Equal,
        BinaryOperator::LessThan => ordering == Ordering::Less,
        BinaryOperator::GreaterThan => ordering == Ordering::Greater,
        BinaryOperator::LessEqual => ordering != Ordering::Greater,
        BinaryOperator::GreaterEqual => ordering != Ordering::Less,
        BinaryOperator::Concat => unreachable!(),
    };
    Value::Boolean(result)
}

/// Walks a branch that just got evaluated (the taken side of `IF`, the
/// selected arm of `CHOOSE`, the fallback of `IFERROR`, ...) and records a
/// runtime-only edge for every concrete reference it contains. Recurses into
/// nested function calls only through their always-evaluated arguments —
/// their own conditional branches record their own edges when and if they
/// run.
pub fn record_runtime_refs(ctx: &EvalContext, expr: &Expression) {
    match expr {
        Expression::CellRef(node) => {
            if let Some(sheet_id) = ctx.resolve_sheet(&node.sheet) {
                if let Some(col) = reference::col_to_index(&node.col) {
                    ctx.record_runtime_edge((sheet_id, col, node.row));
                }
            }
        }
        Expression::Range { sheet, start, end } => {
            let sheet_name = sheet.clone().or_else(|| start.sheet.clone()).or_else(|| end.sheet.clone());
            if let Some(sheet_id) = ctx.resolve_sheet(&sheet_name) {
                if let (Some(c0), Some(c1)) = (reference::col_to_index(&start.col), reference::col_to_index(&end.col)) {
                    let (col_min, col_max) = (c0.min(c1), c0.max(c1));
                    let (row_min, row_max) = (start.row.min(end.row), start.row.max(end.row));
                    for row in row_min..=row_max {
                        for col in col_min..=col_max {
                            ctx.record_runtime_edge((sheet_id, col, row));
                        }
                    }
                }
            }
        }
        Expression::BinaryOp { left, right, .. } => {
            record_runtime_refs(ctx, left);
            record_runtime_refs(ctx, right);
        }
        Expression::UnaryOp { operand, .. } => record_runtime_refs(ctx, operand),
        Expression::FunctionCall { name, args } => {
            for (i, arg) in args.iter().enumerate() {
                if functions::arg_always_evaluated(name, i) {
                    record_runtime_refs(ctx, arg);
                }
            }
        }
        Expression::NumberLiteral(_)
        | Expression::StringLiteral(_)
        | Expression::BooleanLiteral(_)
        | Expression::ErrorLiteral(_) => {}
    }
}

fn evaluate_unary(ctx: &EvalContext, op: UnaryOperator, operand: &Expression) -> EvalResult {
    let value = evaluate(ctx, operand).into_scalar();
    if let Some(err) = value.error_kind() {
        return EvalResult::Scalar(Value::Error(err));
    }
    let result = match value.to_number() {
        Ok(n) => match op {
            UnaryOperator::Plus => Value::Number(n),
            UnaryOperator::Negate => Value::Number(-n),
        },
        Err(k) => Value::Error(k),
    };
    EvalResult::Scalar(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::Workbook;

    #[test]
    fn arithmetic_and_cell_ref() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("1".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("=1".to_string())).unwrap();
        wb.set_cell_contents("S", "A3", Some("=A1+A2".to_string())).unwrap();
        assert_eq!(
            wb.get_cell_value("S", "A3").unwrap(),
            Value::Number("2".parse().unwrap())
        );
    }

    #[test]
    fn divide_by_zero() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("100".to_string())).unwrap();
        wb.set_cell_contents("S", "B2", Some("=A1/0".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "B2").unwrap(), Value::Error(ErrorKind::DivideByZero));
    }

    #[test]
    fn concat_stringifies_errors_without_propagating() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=A2".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("=A1+A4".to_string())).unwrap();
        wb.set_cell_contents("S", "A3", Some("=\"Hello \" & A1 & \"!\"".to_string()))
            .unwrap();
        assert_eq!(
            wb.get_cell_value("S", "A3").unwrap(),
            Value::Text("Hello #CIRCREF!!".to_string())
        );
    }
}
