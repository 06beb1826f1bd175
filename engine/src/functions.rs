//! FILENAME: engine/src/functions.rs
//! PURPOSE: The built-in function registry and dispatch calling convention.
//! CONTEXT: Each function is registered under its case-insensitive name with
//! an `ArgMode`: `Eager` functions receive every argument already reduced to
//! an `EvalResult` (so aggregate functions can still tell range args from
//! scalar ones); `Lazy` functions receive the raw argument subtrees and
//! decide for themselves which to evaluate, recording runtime-only edges
//! for whichever branch they actually take.

use crate::evaluator::{evaluate, read_cell_value, record_runtime_refs, EvalContext, EvalResult};
use crate::value::{highest_priority, ErrorKind, Value};
use once_cell::sync::Lazy;
use parser::Expression;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

pub const ENGINE_VERSION: &str = "1.0";

enum FunctionImpl {
    Eager(fn(&EvalContext, &[EvalResult]) -> Value),
    Lazy(fn(&EvalContext, &[Expression]) -> EvalResult),
}

static REGISTRY: Lazy<HashMap<&'static str, FunctionImpl>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, FunctionImpl> = HashMap::new();
    m.insert("VERSION", FunctionImpl::Eager(version_fn));
    m.insert("AND", FunctionImpl::Eager(and_fn));
    m.insert("OR", FunctionImpl::Eager(or_fn));
    m.insert("XOR", FunctionImpl::Eager(xor_fn));
    m.insert("NOT", FunctionImpl::Eager(not_fn));
    m.insert("EXACT", FunctionImpl::Eager(exact_fn));
    m.insert("ISBLANK", FunctionImpl::Eager(isblank_fn));
    m.insert("ISERROR", FunctionImpl::Eager(iserror_fn));
    m.insert("INDIRECT", FunctionImpl::Eager(indirect_fn));
    m.insert("MIN", FunctionImpl::Eager(min_fn));
    m.insert("MAX", FunctionImpl::Eager(max_fn));
    m.insert("SUM", FunctionImpl::Eager(sum_fn));
    m.insert("AVERAGE", FunctionImpl::Eager(average_fn));
    m.insert("IF", FunctionImpl::Lazy(if_fn));
    m.insert("IFERROR", FunctionImpl::Lazy(iferror_fn));
    m.insert("CHOOSE", FunctionImpl::Lazy(choose_fn));
    m.insert("VLOOKUP", FunctionImpl::Lazy(vlookup_fn));
    m.insert("HLOOKUP", FunctionImpl::Lazy(hlookup_fn));
    m
});

/// For a given function name and argument position, whether that argument
/// is always evaluated (so the static-reference linker should recurse into
/// it) or may be skipped depending on runtime values (so only the evaluated-
/// reference edges recorded when that branch actually runs apply). Default
/// is "always" — true for every eager function and for an unrecognized name.
pub fn arg_always_evaluated(function_name: &str, arg_index: usize) -> bool {
    match function_name.to_ascii_uppercase().as_str() {
        "IF" => arg_index == 0,
        "IFERROR" => arg_index == 0,
        "CHOOSE" => arg_index == 0,
        "VLOOKUP" | "HLOOKUP" => arg_index != 1,
        _ => true,
    }
}

pub fn dispatch(ctx: &EvalContext, name: &str, args: &[Expression]) -> EvalResult {
    let upper = name.to_ascii_uppercase();
    match REGISTRY.get(upper.as_str()) {
        None => EvalResult::Scalar(Value::Error(ErrorKind::BadName)),
        Some(FunctionImpl::Lazy(f)) => f(ctx, args),
        Some(FunctionImpl::Eager(f)) => {
            let evaluated: Vec<EvalResult> = args.iter().map(|a| evaluate(ctx, a)).collect();
            EvalResult::Scalar(f(ctx, &evaluated))
        }
    }
}

fn version_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if !args.is_empty() {
        return Value::Error(ErrorKind::TypeError);
    }
    Value::Text(ENGINE_VERSION.to_string())
}

fn bool_args(args: &[EvalResult]) -> Result<Vec<bool>, ErrorKind> {
    let mut bools = Vec::with_capacity(args.len());
    let mut errors = Vec::new();
    for arg in args {
        let v = arg.clone().into_scalar();
        if let Some(e) = v.error_kind() {
            errors.push(e);
            continue;
        }
        match v.to_bool() {
            Ok(b) => bools.push(b),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        Err(highest_priority(errors))
    } else {
        Ok(bools)
    }
}

fn and_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.is_empty() {
        return Value::Error(ErrorKind::TypeError);
    }
    match bool_args(args) {
        Ok(bools) => Value::Boolean(bools.into_iter().all(|b| b)),
        Err(e) => Value::Error(e),
    }
}

fn or_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.is_empty() {
        return Value::Error(ErrorKind::TypeError);
    }
    match bool_args(args) {
        Ok(bools) => Value::Boolean(bools.into_iter().any(|b| b)),
        Err(e) => Value::Error(e),
    }
}

fn xor_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.is_empty() {
        return Value::Error(ErrorKind::TypeError);
    }
    match bool_args(args) {
        Ok(bools) => Value::Boolean(bools.into_iter().filter(|b| *b).count() % 2 == 1),
        Err(e) => Value::Error(e),
    }
}

fn not_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.len() != 1 {
        return Value::Error(ErrorKind::TypeError);
    }
    match bool_args(args) {
        Ok(bools) => Value::Boolean(!bools[0]),
        Err(e) => Value::Error(e),
    }
}

fn exact_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.len() != 2 {
        return Value::Error(ErrorKind::TypeError);
    }
    let a = args[0].clone().into_scalar().to_text();
    let b = args[1].clone().into_scalar().to_text();
    Value::Boolean(a == b)
}

fn isblank_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.len() != 1 {
        return Value::Error(ErrorKind::TypeError);
    }
    let v = args[0].clone().into_scalar();
    match v.error_kind() {
        Some(ErrorKind::Parse) | Some(ErrorKind::Circular) | Some(ErrorKind::BadReference) => Value::Error(v.error_kind().unwrap()),
        Some(_) => Value::Boolean(false),
        None => Value::Boolean(v.is_empty()),
    }
}

fn iserror_fn(_ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.len() != 1 {
        return Value::Error(ErrorKind::TypeError);
    }
    Value::Boolean(args[0].clone().into_scalar().is_error())
}

fn indirect_fn(ctx: &EvalContext, args: &[EvalResult]) -> Value {
    if args.len() != 1 {
        return Value::Error(ErrorKind::TypeError);
    }
    let v = args[0].clone().into_scalar();
    if let Some(e) = v.error_kind() {
        return Value::Error(e);
    }
    let text = v.to_text();
    let reference = match crate::reference::parse_location(&text) {
        Some(r) => r,
        None => return Value::Error(ErrorKind::BadReference),
    };
    if !reference.check_bounds() {
        return Value::Error(ErrorKind::BadReference);
    }
    let sheet_id = match ctx.resolve_sheet(&reference.sheet_name) {
        Some(id) => id,
        None => return Value::Error(ErrorKind::BadReference),
    };
    let handle = (sheet_id, reference.col, reference.row);
    ctx.record_runtime_edge(handle);
    read_cell_value(ctx.workbook, sheet_id, (reference.col, reference.row))
}

fn collect_numbers(ctx: &EvalContext, args: &[EvalResult]) -> Result<Vec<Decimal>, ErrorKind> {
    let mut numbers = Vec::new();
    let mut errors = Vec::new();
    let mut push = |v: Value| match v {
        Value::Error(e) => errors.push(e),
        Value::Empty => {}
        other => match other.to_number() {
            Ok(n) => numbers.push(n),
            Err(e) => errors.push(e),
        },
    };
    for arg in args {
        match arg {
            EvalResult::Scalar(v) => push(v.clone()),
            EvalResult::Range(sheet_id, start, end) => {
                for row in start.1..=end.1 {
                    for col in start.0..=end.0 {
                        push(read_cell_value(ctx.workbook, *sheet_id, (col, row)));
                    }
                }
            }
        }
    }
    if !errors.is_empty() {
        Err(highest_priority(errors))
    } else {
        Ok(numbers)
    }
}

fn sum_fn(ctx: &EvalContext, args: &[EvalResult]) -> Value {
    match collect_numbers(ctx, args) {
        Ok(numbers) => Value::Number(numbers.into_iter().fold(Decimal::ZERO, |a, b| a + b)),
        Err(e) => Value::Error(e),
    }
}

fn average_fn(ctx: &EvalContext, args: &[EvalResult]) -> Value {
    match collect_numbers(ctx, args) {
        Ok(numbers) => {
            if numbers.is_empty() {
                Value::Error(ErrorKind::DivideByZero)
            } else {
                let sum = numbers.iter().fold(Decimal::ZERO, |a, b| a + b);
                Value::Number(sum / Decimal::from(numbers.len() as u64))
            }
        }
        Err(e) => Value::Error(e),
    }
}

fn min_fn(ctx: &EvalContext, args: &[EvalResult]) -> Value {
    match collect_numbers(ctx, args) {
        Ok(numbers) => Value::Number(numbers.into_iter().min().unwrap_or(Decimal::ZERO)),
        Err(e) => Value::Error(e),
    }
}

fn max_fn(ctx: &EvalContext, args: &[EvalResult]) -> Value {
    match collect_numbers(ctx, args) {
        Ok(numbers) => Value::Number(numbers.into_iter().max().unwrap_or(Decimal::ZERO)),
        Err(e) => Value::Error(e),
    }
}

fn if_fn(ctx: &EvalContext, args: &[Expression]) -> EvalResult {
    if args.len() < 2 || args.len() > 3 {
        return EvalResult::Scalar(Value::Error(ErrorKind::TypeError));
    }
    let cond = evaluate(ctx, &args[0]).into_scalar();
    if let Some(e) = cond.error_kind() {
        return EvalResult::Scalar(Value::Error(e));
    }
    let taken = match cond.to_bool() {
        Ok(true) => args.get(1),
        Ok(false) => args.get(2),
        Err(e) => return EvalResult::Scalar(Value::Error(e)),
    };
    match taken {
        Some(expr) => {
            record_runtime_refs(ctx, expr);
            evaluate(ctx, expr)
        }
        None => EvalResult::Scalar(Value::Empty),
    }
}

fn iferror_fn(ctx: &EvalContext, args: &[Expression]) -> EvalResult {
    if args.is_empty() || args.len() > 2 {
        return EvalResult::Scalar(Value::Error(ErrorKind::TypeError));
    }
    let first = evaluate(ctx, &args[0]);
    let is_error = matches!(&first, EvalResult::Scalar(v) if v.is_error());
    if !is_error {
        return first;
    }
    match args.get(1) {
        Some(expr) => {
            record_runtime_refs(ctx, expr);
            evaluate(ctx, expr)
        }
        None => EvalResult::Scalar(Value::Text(String::new())),
    }
}

fn choose_fn(ctx: &EvalContext, args: &[Expression]) -> EvalResult {
    if args.len() < 2 {
        return EvalResult::Scalar(Value::Error(ErrorKind::TypeError));
    }
    let idx_val = evaluate(ctx, &args[0]).into_scalar();
    if let Some(e) = idx_val.error_kind() {
        return EvalResult::Scalar(Value::Error(e));
    }
    let one_based = match idx_val.to_number().ok().and_then(|d| d.to_i64()) {
        Some(n) => n,
        None => return EvalResult::Scalar(Value::Error(ErrorKind::TypeError)),
    };
    let branches = &args[1..];
    if one_based < 1 || one_based as usize > branches.len() {
        return EvalResult::Scalar(Value::Error(ErrorKind::TypeError));
    }
    let chosen = &branches[(one_based - 1) as usize];
    record_runtime_refs(ctx, chosen);
    evaluate(ctx, chosen)
}

fn lookup_impl(ctx: &EvalContext, args: &[Expression], vertical: bool) -> EvalResult {
    if args.len() < 3 {
        return EvalResult::Scalar(Value::Error(ErrorKind::TypeError));
    }
    let key = evaluate(ctx, &args[0]).into_scalar();
    if let Some(e) = key.error_kind() {
        return EvalResult::Scalar(Value::Error(e));
    }

    let (sheet_id, start, end) = match evaluate(ctx, &args[1]) {
        EvalResult::Range(sid, s, e) => (sid, s, e),
        EvalResult::Scalar(_) => return EvalResult::Scalar(Value::Error(ErrorKind::TypeError)),
    };

    let index_val = evaluate(ctx, &args[2]).into_scalar();
    if let Some(e) = index_val.error_kind() {
        return EvalResult::Scalar(Value::Error(e));
    }
    let index = match index_val.to_number().ok().and_then(|d| d.to_i64()) {
        Some(n) if n >= 1 => n as u32,
        _ => return EvalResult::Scalar(Value::Error(ErrorKind::TypeError)),
    };

    let cross_len = if vertical { end.0 - start.0 + 1 } else { end.1 - start.1 + 1 };
    if index > cross_len {
        return EvalResult::Scalar(Value::Error(ErrorKind::TypeError));
    }

    let lead_range: Vec<u32> = if vertical {
        (start.1..=end.1).collect()
    } else {
        (start.0..=end.0).collect()
    };

    for lead in lead_range {
        let (key_col, key_row) = if vertical { (start.0, lead) } else { (lead, start.1) };
        ctx.record_runtime_edge((sheet_id, key_col, key_row));
        let candidate = read_cell_value(ctx.workbook, sheet_id, (key_col, key_row));
        if values_equal(&candidate, &key) {
            let (target_col, target_row) = if vertical {
                (start.0 + index - 1, lead)
            } else {
                (lead, start.1 + index - 1)
            };
            ctx.record_runtime_edge((sheet_id, target_col, target_row));
            return EvalResult::Scalar(read_cell_value(ctx.workbook, sheet_id, (target_col, target_row)));
        }
    }
    EvalResult::Scalar(Value::Error(ErrorKind::BadReference))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    crate::value::compare_values(a, b) == std::cmp::Ordering::Equal
}

fn vlookup_fn(ctx: &EvalContext, args: &[Expression]) -> EvalResult {
    lookup_impl(ctx, args, true)
}

fn hlookup_fn(ctx: &EvalContext, args: &[Expression]) -> EvalResult {
    lookup_impl(ctx, args, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::Workbook;

    #[test]
    fn and_or_xor_not() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=AND(TRUE,TRUE)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Boolean(true));
        wb.set_cell_contents("S", "A2", Some("=OR(FALSE,TRUE)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A2").unwrap(), Value::Boolean(true));
        wb.set_cell_contents("S", "A3", Some("=XOR(TRUE,TRUE)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A3").unwrap(), Value::Boolean(false));
        wb.set_cell_contents("S", "A4", Some("=NOT(FALSE)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A4").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn if_skips_untaken_branch_references() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("100".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("=IF(TRUE, A1*2, A1/0)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A2").unwrap(), Value::Number("200".parse().unwrap()));
    }

    #[test]
    fn iferror_falls_back() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=IFERROR(1/0, \"fallback\")".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Text("fallback".to_string()));
    }

    #[test]
    fn choose_selects_one_based_branch() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=CHOOSE(2, \"a\", \"b\", \"c\")".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Text("b".to_string()));
    }

    #[test]
    fn sum_average_skip_blanks() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("1".to_string())).unwrap();
        wb.set_cell_contents("S", "A3", Some("3".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("=SUM(A1:A3)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "B1").unwrap(), Value::Number("4".parse().unwrap()));
        wb.set_cell_contents("S", "B2", Some("=AVERAGE(A1:A3)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "B2").unwrap(), Value::Number("2".parse().unwrap()));
    }

    #[test]
    fn average_of_only_blanks_is_divide_by_zero() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("=AVERAGE(A1:A3)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "B1").unwrap(), Value::Error(ErrorKind::DivideByZero));
    }

    #[test]
    fn vlookup_finds_row() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("x".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("1".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("y".to_string())).unwrap();
        wb.set_cell_contents("S", "B2", Some("2".to_string())).unwrap();
        wb.set_cell_contents("S", "D1", Some("=VLOOKUP(\"y\", A1:B2, 2)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "D1").unwrap(), Value::Number("2".parse().unwrap()));
    }

    #[test]
    fn indirect_reads_target_cell() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("42".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("=INDIRECT(\"A1\")".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "B1").unwrap(), Value::Number("42".parse().unwrap()));
    }

    #[test]
    fn unknown_function_is_bad_name() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=NOPE(1)".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Error(ErrorKind::BadName));
    }
}
