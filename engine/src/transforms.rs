//! FILENAME: engine/src/transforms.rs
//! PURPOSE: Formula-tree rewriting: pretty-printing back to text, shifting
//! relative references for move/copy/sort, and rewriting a sheet name after
//! a rename.
//! CONTEXT: These all operate on an already-parsed `Expression` tree rather
//! than the source text, so a formula only needs to be parsed once per edit
//! even when both a reference shift and a re-render are required.

use crate::reference::{self, MAX_COLUMN, MAX_ROW};
use parser::{parse_formula, BinaryOperator, CellRefNode, Expression, UnaryOperator};

/// Renders an expression tree back to formula body text (no leading `=`).
pub fn pretty_print(expr: &Expression) -> String {
    match expr {
        Expression::NumberLiteral(s) => s.clone(),
        Expression::StringLiteral(s) => format!("\"{}\"", s.replace('"', "\"\"")),
        Expression::BooleanLiteral(true) => "TRUE".to_string(),
        Expression::BooleanLiteral(false) => "FALSE".to_string(),
        Expression::ErrorLiteral(s) => s.clone(),
        Expression::CellRef(node) => render_cell_ref(node),
        Expression::Range { sheet, start, end } => {
            let prefix = sheet
                .as_ref()
                .map(|name| format!("{}!", reference::quote_sheet_name(name)))
                .unwrap_or_default();
            format!("{prefix}{}:{}", render_cell_ref_bare(start), render_cell_ref_bare(end))
        }
        Expression::BinaryOp { left, op, right } => {
            format!("{}{}{}", pretty_print(left), operator_text(*op), pretty_print(right))
        }
        Expression::UnaryOp { op, operand } => {
            let sign = match op {
                UnaryOperator::Plus => "+",
                UnaryOperator::Negate => "-",
            };
            format!("{sign}{}", pretty_print(operand))
        }
        Expression::FunctionCall { name, args } => {
            let rendered: Vec<String> = args.iter().map(pretty_print).collect();
            format!("{name}({})", rendered.join(", "))
        }
    }
}

fn render_cell_ref(node: &CellRefNode) -> String {
    let prefix = node
        .sheet
        .as_ref()
        .map(|name| format!("{}!", reference::quote_sheet_name(name)))
        .unwrap_or_default();
    format!("{prefix}{}", render_cell_ref_bare(node))
}

fn render_cell_ref_bare(node: &CellRefNode) -> String {
    let mut out = String::new();
    if node.col_absolute {
        out.push('$');
    }
    out.push_str(&node.col.to_uppercase());
    if node.row_absolute {
        out.push('$');
    }
    out.push_str(&node.row.to_string());
    out
}

fn operator_text(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Equal => "=",
        BinaryOperator::NotEqual => "<>",
        BinaryOperator::LessThan => "<",
        BinaryOperator::GreaterThan => ">",
        BinaryOperator::LessEqual => "<=",
        BinaryOperator::GreaterEqual => ">=",
        BinaryOperator::Add => "+",
        BinaryOperator::Subtract => "-",
        BinaryOperator::Multiply => "*",
        BinaryOperator::Divide => "/",
        BinaryOperator::Concat => "&",
    }
}

/// Shifts every relative reference in `expr` by `(d_col, d_row)`. A
/// reference that lands out of bounds on either axis is replaced wholesale
/// with a `#REF!` error literal, not a propagating error value — the cell
/// keeps that literal as its new formula text.
pub fn adjust_relative_refs(expr: &Expression, d_col: i64, d_row: i64) -> Expression {
    match expr {
        Expression::CellRef(node) => match shift_cell_ref(node, d_col, d_row) {
            Some(shifted) => Expression::CellRef(shifted),
            None => Expression::ErrorLiteral("#REF!".to_string()),
        },
        Expression::Range { sheet, start, end } => {
            match (shift_cell_ref(start, d_col, d_row), shift_cell_ref(end, d_col, d_row)) {
                (Some(s), Some(e)) => Expression::Range {
                    sheet: sheet.clone(),
                    start: Box::new(s),
                    end: Box::new(e),
                },
                _ => Expression::ErrorLiteral("#REF!".to_string()),
            }
        }
        Expression::BinaryOp { left, op, right } => Expression::BinaryOp {
            left: Box::new(adjust_relative_refs(left, d_col, d_row)),
            op: *op,
            right: Box::new(adjust_relative_refs(right, d_col, d_row)),
        },
        Expression::UnaryOp { op, operand } => Expression::UnaryOp {
            op: *op,
            operand: Box::new(adjust_relative_refs(operand, d_col, d_row)),
        },
        Expression::FunctionCall { name, args } => Expression::FunctionCall {
            name: name.clone(),
            args: args.iter().map(|a| adjust_relative_refs(a, d_col, d_row)).collect(),
        },
        Expression::NumberLiteral(_)
        | Expression::StringLiteral(_)
        | Expression::BooleanLiteral(_)
        | Expression::ErrorLiteral(_) => expr.clone(),
    }
}

fn shift_cell_ref(node: &CellRefNode, d_col: i64, d_row: i64) -> Option<CellRefNode> {
    let col_index = reference::col_to_index(&node.col)?;
    let new_col = if node.col_absolute {
        col_index
    } else {
        let shifted = col_index as i64 + d_col;
        if shifted < 1 {
            return None;
        }
        shifted as u32
    };
    let new_row = if node.row_absolute {
        node.row
    } else {
        let shifted = node.row as i64 + d_row;
        if shifted < 1 {
            return None;
        }
        shifted as u32
    };
    if new_col > MAX_COLUMN || new_row > MAX_ROW {
        return None;
    }
    Some(CellRefNode {
        sheet: node.sheet.clone(),
        col: reference::index_to_col(new_col),
        row: new_row,
        col_absolute: node.col_absolute,
        row_absolute: node.row_absolute,
    })
}

/// Rewrites every `CellRef`/`Range` node whose sheet prefix matches
/// `old_name` (case-insensitively) to `new_name`, leaving col/row/absolute
/// flags untouched. Unqualified references are left alone — they resolve
/// against whatever sheet owns the cell, which doesn't change on rename.
pub fn rewrite_sheet_rename(expr: &Expression, old_name: &str, new_name: &str) -> Expression {
    match expr {
        Expression::CellRef(node) => Expression::CellRef(rename_node(node, old_name, new_name)),
        Expression::Range { sheet, start, end } => {
            let renamed_sheet = match sheet {
                Some(s) if s.eq_ignore_ascii_case(old_name) => Some(new_name.to_string()),
                other => other.clone(),
            };
            Expression::Range {
                sheet: renamed_sheet,
                start: Box::new(rename_node(start, old_name, new_name)),
                end: Box::new(rename_node(end, old_name, new_name)),
            }
        }
        Expression::BinaryOp { left, op, right } => Expression::BinaryOp {
            left: Box::new(rewrite_sheet_rename(left, old_name, new_name)),
            op: *op,
            right: Box::new(rewrite_sheet_rename(right, old_name, new_name)),
        },
        Expression::UnaryOp { op, operand } => Expression::UnaryOp {
            op: *op,
            operand: Box::new(rewrite_sheet_rename(operand, old_name, new_name)),
        },
        Expression::FunctionCall { name, args } => Expression::FunctionCall {
            name: name.clone(),
            args: args.iter().map(|a| rewrite_sheet_rename(a, old_name, new_name)).collect(),
        },
        Expression::NumberLiteral(_)
        | Expression::StringLiteral(_)
        | Expression::BooleanLiteral(_)
        | Expression::ErrorLiteral(_) => expr.clone(),
    }
}

fn rename_node(node: &CellRefNode, old_name: &str, new_name: &str) -> CellRefNode {
    let sheet = match &node.sheet {
        Some(s) if s.eq_ignore_ascii_case(old_name) => Some(new_name.to_string()),
        other => other.clone(),
    };
    CellRefNode {
        sheet,
        col: node.col.clone(),
        row: node.row,
        col_absolute: node.col_absolute,
        row_absolute: node.row_absolute,
    }
}

/// Applies a relative-reference shift to a cell's raw contents text: a
/// formula is reparsed, shifted, and re-rendered; anything else (a literal,
/// or no contents at all) is position-independent and passes through
/// unchanged.
pub fn shift_contents(contents: &Option<String>, d_col: i64, d_row: i64) -> Option<String> {
    let text = contents.as_ref()?;
    let Some(body) = text.strip_prefix('=') else {
        return Some(text.clone());
    };
    match parse_formula(body) {
        Ok(expr) => {
            let shifted = adjust_relative_refs(&expr, d_col, d_row);
            Some(format!("={}", pretty_print(&shifted)))
        }
        Err(_) => Some(text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Expression {
        parse_formula(s).unwrap()
    }

    #[test]
    fn pretty_print_roundtrips_simple_arithmetic() {
        let expr = parse("A1+B2*3");
        assert_eq!(pretty_print(&expr), "A1+B2*3");
    }

    #[test]
    fn pretty_print_canonicalizes_equals() {
        let expr = parse("A1==B1");
        assert_eq!(pretty_print(&expr), "A1=B1");
    }

    #[test]
    fn pretty_print_renders_function_calls() {
        let expr = parse("SUM(A1:A3, 4)");
        assert_eq!(pretty_print(&expr), "SUM(A1:A3, 4)");
    }

    #[test]
    fn adjust_relative_refs_shifts_unanchored_reference() {
        let expr = parse("A1");
        let shifted = adjust_relative_refs(&expr, 1, 2);
        assert_eq!(pretty_print(&shifted), "B3");
    }

    #[test]
    fn adjust_relative_refs_leaves_absolute_axis_fixed() {
        let expr = parse("$A1");
        let shifted = adjust_relative_refs(&expr, 5, 5);
        assert_eq!(pretty_print(&shifted), "$A6");
    }

    #[test]
    fn adjust_relative_refs_out_of_bounds_becomes_ref_error() {
        let expr = parse("A1");
        let shifted = adjust_relative_refs(&expr, -1, 0);
        assert_eq!(pretty_print(&shifted), "#REF!");
    }

    #[test]
    fn rewrite_sheet_rename_updates_qualified_reference() {
        let expr = parse("Old!A1+B2");
        let renamed = rewrite_sheet_rename(&expr, "Old", "New");
        assert_eq!(pretty_print(&renamed), "New!A1+B2");
    }

    #[test]
    fn rewrite_sheet_rename_ignores_unqualified_reference() {
        let expr = parse("A1");
        let renamed = rewrite_sheet_rename(&expr, "Old", "New");
        assert_eq!(pretty_print(&renamed), "A1");
    }

    #[test]
    fn shift_contents_passes_through_literal_text() {
        let contents = Some("hello".to_string());
        assert_eq!(shift_contents(&contents, 3, 3), Some("hello".to_string()));
    }
}
