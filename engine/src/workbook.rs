//! FILENAME: engine/src/workbook.rs
//! PURPOSE: The workbook: sheet registry, dependency graph, recomputation
//! protocol, and every public edit entry point.
//! CONTEXT: A cell's identity is a `(SheetId, col, row)` triple rather than a
//! pointer, so the dependency graph survives sheet deletion and recreation
//! without dangling references of its own. Edits never touch just one cell:
//! `apply_contents` reclassifies and relinks a single cell's edges, and the
//! recomputation protocol that follows walks everything downstream of it in
//! dependency order, folding in circular-reference detection as it goes.

use crate::cell::{classify_contents, Classification};
use crate::evaluator::{evaluate_formula, EvalContext};
use crate::graph::{EdgeKinds, Graph};
use crate::range::Range;
use crate::reference::{self, Reference};
use crate::sheet::{Sheet, SheetId};
use crate::transforms;
use crate::value::{compare_values, ErrorKind, Value};
use parser::Expression;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

const DEFAULT_SHEET_PREFIX: &str = "Sheet";

/// Identifies a cell by the sheet it lives on plus its 1-based column and
/// row, independent of that sheet's current position in the display order.
pub type CellHandle = (SheetId, u32, u32);

/// A node in the bipartite graph tracking which cells mention which sheet
/// names, so a renamed or recreated sheet can find every formula that refers
/// to it by name even while that name resolves to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SheetRefNode {
    Cell(CellHandle),
    Name(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkbookError {
    #[error("invalid sheet name: {0}")]
    InvalidSheetName(String),
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    #[error("invalid cell location: {0}")]
    InvalidLocation(String),
    #[error("sort column index out of range: {0}")]
    InvalidSortIndex(i32),
    #[error("duplicate sort column: {0}")]
    DuplicateSortKey(i32),
    #[error("target location out of range")]
    TargetOutOfRange,
}

/// A single cell-value change, reported to notifiers as `(sheet_name,
/// location_string)`.
pub type ChangedCell = (String, String);

pub struct Workbook {
    sheets: Vec<Sheet>,
    next_sheet_id: SheetId,
    dependency_graph: Graph<CellHandle>,
    sheet_reference_graph: Graph<SheetRefNode>,
    notifiers: Vec<Box<dyn Fn(&[ChangedCell])>>,
}

impl Workbook {
    pub fn new() -> Self {
        Workbook {
            sheets: Vec::new(),
            next_sheet_id: 0,
            dependency_graph: Graph::new(),
            sheet_reference_graph: Graph::new(),
            notifiers: Vec::new(),
        }
    }

    // --- sheet lookup -----------------------------------------------------

    pub fn sheet_id_by_name(&self, name: &str) -> Option<SheetId> {
        self.sheets
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.id)
    }

    pub fn sheet_by_id(&self, id: SheetId) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == id)
    }

    fn sheet_by_id_mut(&mut self, id: SheetId) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.id == id)
    }

    fn require_sheet(&self, name: &str) -> Result<SheetId, WorkbookError> {
        self.sheet_id_by_name(name)
            .ok_or_else(|| WorkbookError::SheetNotFound(name.to_string()))
    }

    fn generate_sheet_name(&self) -> String {
        let mut n = 1u32;
        loop {
            let candidate = format!("{DEFAULT_SHEET_PREFIX}{n}");
            if self.sheet_id_by_name(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    // --- public sheet operations (spec §6) --------------------------------

    pub fn new_sheet(&mut self, name: Option<String>) -> Result<(usize, String), WorkbookError> {
        let resolved = match name {
            Some(raw) => {
                let trimmed = raw.trim().to_string();
                if trimmed.is_empty() {
                    return Err(WorkbookError::InvalidSheetName(raw));
                }
                if self.sheet_id_by_name(&trimmed).is_some() {
                    return Err(WorkbookError::InvalidSheetName(trimmed));
                }
                trimmed
            }
            None => self.generate_sheet_name(),
        };

        let id = self.next_sheet_id;
        self.next_sheet_id += 1;
        self.sheets.push(Sheet::new(id, resolved.clone()));
        log::debug!("new_sheet {resolved:?} (id {id})");
        self.wake_sheet_name_references(&resolved);
        let index = self.sheets.iter().position(|s| s.id == id).unwrap();
        Ok((index, resolved))
    }

    pub fn del_sheet(&mut self, name: &str) -> Result<(), WorkbookError> {
        let id = self.require_sheet(name)?;
        self.sheets.retain(|s| s.id != id);
        log::debug!("del_sheet {name:?}");
        self.wake_sheet_name_references(name);
        Ok(())
    }

    pub fn list_sheets(&self) -> Vec<String> {
        self.sheets.iter().map(|s| reference::quote_sheet_name(&s.name)).collect()
    }

    /// Sheets in display order, exposing raw (unquoted) names and cell
    /// storage — used by `persistence` to walk every cell when saving.
    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn get_sheet_extent(&self, name: &str) -> Result<(u32, u32), WorkbookError> {
        let id = self.require_sheet(name)?;
        Ok(self.sheet_by_id(id).unwrap().extent())
    }

    pub fn move_sheet(&mut self, name: &str, index: usize) -> Result<(), WorkbookError> {
        let id = self.require_sheet(name)?;
        if index >= self.sheets.len() {
            return Err(WorkbookError::TargetOutOfRange);
        }
        let pos = self.sheets.iter().position(|s| s.id == id).unwrap();
        let sheet = self.sheets.remove(pos);
        self.sheets.insert(index, sheet);
        Ok(())
    }

    pub fn copy_sheet(&mut self, name: &str) -> Result<(usize, String), WorkbookError> {
        let src_id = self.require_sheet(name)?;
        let src_name = self.sheet_by_id(src_id).unwrap().name.clone();

        let mut n = 1u32;
        let mut candidate = format!("{src_name}_{n}");
        while self.sheet_id_by_name(&candidate).is_some() {
            n += 1;
            candidate = format!("{src_name}_{n}");
        }

        let (index, final_name) = self.new_sheet(Some(candidate))?;
        let new_id = self.sheet_id_by_name(&final_name).unwrap();

        let entries: Vec<((u32, u32), Option<String>)> = self
            .sheet_by_id(src_id)
            .unwrap()
            .non_empty_cells()
            .map(|(&coord, cell)| (coord, cell.contents.clone()))
            .collect();

        let mut seeds = Vec::new();
        for (coord, contents) in entries {
            let handle = (new_id, coord.0, coord.1);
            self.apply_contents(handle, contents)?;
            seeds.push(handle);
        }
        log::debug!("copy_sheet {name:?} -> {final_name:?} ({} cells)", seeds.len());
        self.recompute_from_seeds(seeds);
        Ok((index, final_name))
    }

    pub fn rename_sheet(&mut self, old_name: &str, new_name: &str) -> Result<(), WorkbookError> {
        let id = self.require_sheet(old_name)?;
        let trimmed = new_name.trim();
        if trimmed.is_empty() {
            return Err(WorkbookError::InvalidSheetName(new_name.to_string()));
        }
        if let Some(existing) = self.sheet_id_by_name(trimmed) {
            if existing != id {
                return Err(WorkbookError::InvalidSheetName(trimmed.to_string()));
            }
        }

        let old_lower = old_name.to_lowercase();
        let referencing: Vec<CellHandle> = self
            .sheet_reference_graph
            .dependents(&SheetRefNode::Name(old_lower), EdgeKinds::STATIC)
            .into_iter()
            .filter_map(|n| match n {
                SheetRefNode::Cell(h) => Some(h),
                SheetRefNode::Name(_) => None,
            })
            .collect();

        self.sheet_by_id_mut(id).unwrap().name = trimmed.to_string();
        log::debug!("rename_sheet {old_name:?} -> {trimmed:?} ({} referencing cells)", referencing.len());

        let mut seeds = Vec::new();
        for handle in referencing {
            let expr = self
                .sheet_by_id(handle.0)
                .and_then(|s| s.get_cell(handle.1, handle.2))
                .and_then(|c| c.formula_tree.clone());
            let Some(expr) = expr else { continue };
            let rewritten = transforms::rewrite_sheet_rename(&expr, old_name, trimmed);
            let text = format!("={}", transforms::pretty_print(&rewritten));
            self.apply_contents(handle, Some(text))?;
            seeds.push(handle);
        }
        self.recompute_from_seeds(seeds);
        // Cells that already referenced `trimmed` while it was dangling now resolve.
        self.wake_sheet_name_references(trimmed);
        Ok(())
    }

    // --- public cell operations (spec §6) ----------------------------------

    pub fn set_cell_contents(
        &mut self,
        sheet_name: &str,
        location: &str,
        contents: Option<String>,
    ) -> Result<(), WorkbookError> {
        let handle = self.resolve_location(sheet_name, location)?;
        self.apply_contents(handle, contents)?;
        log::debug!("set_cell_contents {sheet_name:?}!{location}");
        self.recompute_from_seeds(vec![handle]);
        Ok(())
    }

    pub fn get_cell_contents(&self, sheet_name: &str, location: &str) -> Result<Option<String>, WorkbookError> {
        let handle = self.resolve_location(sheet_name, location)?;
        Ok(self
            .sheet_by_id(handle.0)
            .and_then(|s| s.get_cell(handle.1, handle.2))
            .and_then(|c| c.contents.clone()))
    }

    pub fn get_cell_value(&self, sheet_name: &str, location: &str) -> Result<Value, WorkbookError> {
        let handle = self.resolve_location(sheet_name, location)?;
        Ok(self
            .sheet_by_id(handle.0)
            .and_then(|s| s.get_cell(handle.1, handle.2))
            .map(|c| c.value.clone())
            .unwrap_or(Value::Empty))
    }

    fn resolve_location(&self, sheet_name: &str, location: &str) -> Result<CellHandle, WorkbookError> {
        let sheet_id = self.require_sheet(sheet_name)?;
        let reference = reference::parse_location(location)
            .ok_or_else(|| WorkbookError::InvalidLocation(location.to_string()))?;
        if !reference.check_bounds() {
            return Err(WorkbookError::InvalidLocation(location.to_string()));
        }
        Ok((sheet_id, reference.col, reference.row))
    }

    pub fn move_cells(
        &mut self,
        sheet_name: &str,
        start: &str,
        end: &str,
        to: &str,
        to_sheet: Option<&str>,
    ) -> Result<(), WorkbookError> {
        self.move_or_copy(sheet_name, start, end, to, to_sheet, true)
    }

    pub fn copy_cells(
        &mut self,
        sheet_name: &str,
        start: &str,
        end: &str,
        to: &str,
        to_sheet: Option<&str>,
    ) -> Result<(), WorkbookError> {
        self.move_or_copy(sheet_name, start, end, to, to_sheet, false)
    }

    fn move_or_copy(
        &mut self,
        sheet_name: &str,
        start: &str,
        end: &str,
        to: &str,
        to_sheet: Option<&str>,
        is_move: bool,
    ) -> Result<(), WorkbookError> {
        let src_id = self.require_sheet(sheet_name)?;
        let dst_name = to_sheet.unwrap_or(sheet_name);
        let dst_id = self.require_sheet(dst_name)?;

        let a = reference::parse_location(start).ok_or_else(|| WorkbookError::InvalidLocation(start.to_string()))?;
        let b = reference::parse_location(end).ok_or_else(|| WorkbookError::InvalidLocation(end.to_string()))?;
        let to_start =
            reference::parse_location(to).ok_or_else(|| WorkbookError::InvalidLocation(to.to_string()))?;
        let range = Range::new(None, a, b);

        let d_col = to_start.col as i64 - range.start.col as i64;
        let d_row = to_start.row as i64 - range.start.row as i64;
        let to_end_col = to_start.col as i64 + range.col_count() as i64 - 1;
        let to_end_row = to_start.row as i64 + range.row_count() as i64 - 1;
        if to_start.col < 1
            || to_start.row < 1
            || to_end_col > reference::MAX_COLUMN as i64
            || to_end_row > reference::MAX_ROW as i64
        {
            return Err(WorkbookError::TargetOutOfRange);
        }

        // Overlapping source/destination regions are handled the way an
        // in-place memmove is: iterate away from the direction of the shift
        // so a cell already moved isn't read again as a source.
        let col_order: Vec<u32> = if d_col < 0 {
            (0..range.col_count()).collect()
        } else {
            (0..range.col_count()).rev().collect()
        };
        let row_order: Vec<u32> = if d_row < 0 {
            (0..range.row_count()).collect()
        } else {
            (0..range.row_count()).rev().collect()
        };

        let mut seeds = Vec::new();
        for &r in &row_order {
            for &c in &col_order {
                let from_col = range.start.col + c;
                let from_row = range.start.row + r;
                let to_col = (from_col as i64 + d_col) as u32;
                let to_row = (from_row as i64 + d_row) as u32;

                let from_handle = (src_id, from_col, from_row);
                let to_handle = (dst_id, to_col, to_row);

                let from_contents = self
                    .sheet_by_id(src_id)
                    .and_then(|s| s.get_cell(from_col, from_row))
                    .and_then(|cell| cell.contents.clone());
                let adjusted = transforms::shift_contents(&from_contents, d_col, d_row);

                self.apply_contents(to_handle, adjusted)?;
                seeds.push(to_handle);

                if is_move && from_handle != to_handle {
                    self.apply_contents(from_handle, None)?;
                    seeds.push(from_handle);
                }
            }
        }
        log::debug!(
            "{} {} cells {sheet_name:?}!{start}:{end} -> {dst_name:?}!{to}",
            if is_move { "move" } else { "copy" },
            seeds.len()
        );
        self.recompute_from_seeds(seeds);
        Ok(())
    }

    pub fn sort_region(
        &mut self,
        sheet_name: &str,
        start: &str,
        end: &str,
        sort_cols: &[i32],
    ) -> Result<(), WorkbookError> {
        let sheet_id = self.require_sheet(sheet_name)?;
        let a = reference::parse_location(start).ok_or_else(|| WorkbookError::InvalidLocation(start.to_string()))?;
        let b = reference::parse_location(end).ok_or_else(|| WorkbookError::InvalidLocation(end.to_string()))?;
        let range = Range::new(None, a, b);

        if sort_cols.is_empty() {
            return Err(WorkbookError::InvalidSortIndex(0));
        }
        let mut seen_abs = HashSet::new();
        for &c in sort_cols {
            if c == 0 || c.unsigned_abs() > range.col_count() {
                return Err(WorkbookError::InvalidSortIndex(c));
            }
            if !seen_abs.insert(c.abs()) {
                return Err(WorkbookError::DuplicateSortKey(c));
            }
        }

        let row_count = range.row_count();
        let col_count = range.col_count();

        let keys: Vec<Vec<Value>> = (0..row_count)
            .map(|r| {
                let row = range.start.row + r;
                sort_cols
                    .iter()
                    .map(|&c| {
                        let col = range.start.col + (c.unsigned_abs() - 1);
                        self.sheet_by_id(sheet_id)
                            .and_then(|s| s.get_cell(col, row))
                            .map(|cell| cell.value.clone())
                            .unwrap_or(Value::Empty)
                    })
                    .collect()
            })
            .collect();

        let mut row_order: Vec<u32> = (0..row_count).collect();
        row_order.sort_by(|&ra, &rb| {
            for (key_idx, &c) in sort_cols.iter().enumerate() {
                let ord = compare_values(&keys[ra as usize][key_idx], &keys[rb as usize][key_idx]);
                let ord = if c < 0 { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let snapshot: Vec<Vec<Option<String>>> = (0..row_count)
            .map(|r| {
                let row = range.start.row + r;
                (0..col_count)
                    .map(|c| {
                        let col = range.start.col + c;
                        self.sheet_by_id(sheet_id)
                            .and_then(|s| s.get_cell(col, row))
                            .and_then(|cell| cell.contents.clone())
                    })
                    .collect()
            })
            .collect();

        let mut seeds = Vec::new();
        for (new_r, &old_r) in row_order.iter().enumerate() {
            let d_row = new_r as i64 - old_r as i64;
            let target_row = range.start.row + new_r as u32;
            for c in 0..col_count {
                let col = range.start.col + c;
                let contents = transforms::shift_contents(&snapshot[old_r as usize][c as usize], 0, d_row);
                let handle = (sheet_id, col, target_row);
                self.apply_contents(handle, contents)?;
                seeds.push(handle);
            }
        }
        log::debug!("sort_region {sheet_name:?}!{start}:{end} by {sort_cols:?}");
        self.recompute_from_seeds(seeds);
        Ok(())
    }

    pub fn notify_cells_changed(&mut self, callback: Box<dyn Fn(&[ChangedCell])>) {
        self.notifiers.push(callback);
    }

    // --- cell-contents lifecycle (spec §4.6) -------------------------------

    fn apply_contents(&mut self, handle: CellHandle, text: Option<String>) -> Result<(), WorkbookError> {
        self.dependency_graph.clear_forward(&handle, EdgeKinds::STATIC | EdgeKinds::EVALUATED);
        self.sheet_reference_graph.clear_forward(&SheetRefNode::Cell(handle), EdgeKinds::STATIC);

        let mut formula_expr = None;
        {
            let sheet = self
                .sheet_by_id_mut(handle.0)
                .ok_or_else(|| WorkbookError::SheetNotFound(handle.0.to_string()))?;

            let trimmed = text.as_deref().map(str::trim).filter(|s| !s.is_empty());
            match trimmed {
                None => {
                    sheet.remove_cell(handle.1, handle.2);
                }
                Some(trimmed) => {
                    let cell = sheet.cell_or_create(handle.1, handle.2);
                    cell.contents = Some(trimmed.to_string());
                    match classify_contents(trimmed) {
                        Classification::Empty => {
                            cell.formula_tree = None;
                            cell.value = Value::Empty;
                        }
                        Classification::Formula(expr) => {
                            cell.formula_tree = Some(expr.clone());
                            cell.value = Value::Empty;
                            formula_expr = Some(expr);
                        }
                        Classification::FormulaParseError => {
                            cell.formula_tree = None;
                            cell.value = Value::Error(ErrorKind::Parse);
                        }
                        Classification::Literal(v) => {
                            cell.formula_tree = None;
                            cell.value = v;
                        }
                    }
                }
            }
        }

        if let Some(expr) = formula_expr {
            self.link_static_refs(handle, &expr);
        }
        Ok(())
    }

    fn link_static_refs(&mut self, handle: CellHandle, expr: &Expression) {
        let mut sheet_names = Vec::new();
        let mut cell_edges = Vec::new();
        self.enumerate_static_refs(handle.0, expr, &mut sheet_names, &mut cell_edges);
        for name in sheet_names {
            self.sheet_reference_graph.link(
                &SheetRefNode::Cell(handle),
                &SheetRefNode::Name(name),
                EdgeKinds::STATIC,
            );
        }
        for target in cell_edges {
            self.dependency_graph.link(&handle, &target, EdgeKinds::STATIC);
        }
    }

    /// Walks a freshly parsed formula tree, collecting every sheet-qualified
    /// name it mentions (regardless of whether that name currently resolves)
    /// and every concrete cell it can currently reach. Recurses into a
    /// function call's arguments only where `arg_always_evaluated` says the
    /// argument always runs — a lazy branch's own references are linked when
    /// (if) that branch is actually evaluated, via `EVALUATED` edges.
    fn enumerate_static_refs(
        &self,
        owning_sheet: SheetId,
        expr: &Expression,
        sheet_names: &mut Vec<String>,
        cell_edges: &mut Vec<CellHandle>,
    ) {
        match expr {
            Expression::CellRef(node) => {
                if let Some(name) = &node.sheet {
                    sheet_names.push(name.to_lowercase());
                }
                if let Some(sheet_id) = self.resolve_sheet_name(owning_sheet, &node.sheet) {
                    if let Some(col) = reference::col_to_index(&node.col) {
                        let target = Reference::new(None, col, node.row, node.col_absolute, node.row_absolute);
                        if target.check_bounds() {
                            cell_edges.push((sheet_id, col, node.row));
                        }
                    }
                }
            }
            Expression::Range { sheet, start, end } => {
                let name = sheet.clone().or_else(|| start.sheet.clone()).or_else(|| end.sheet.clone());
                if let Some(n) = &name {
                    sheet_names.push(n.to_lowercase());
                }
                if let Some(sheet_id) = self.resolve_sheet_name(owning_sheet, &name) {
                    if let (Some(c0), Some(c1)) =
                        (reference::col_to_index(&start.col), reference::col_to_index(&end.col))
                    {
                        let (col_min, col_max) = (c0.min(c1), c0.max(c1));
                        let (row_min, row_max) = (start.row.min(end.row), start.row.max(end.row));
                        if col_max <= reference::MAX_COLUMN && row_max <= reference::MAX_ROW {
                            for row in row_min..=row_max {
                                for col in col_min..=col_max {
                                    cell_edges.push((sheet_id, col, row));
                                }
                            }
                        }
                    }
                }
            }
            Expression::BinaryOp { left, right, .. } => {
                self.enumerate_static_refs(owning_sheet, left, sheet_names, cell_edges);
                self.enumerate_static_refs(owning_sheet, right, sheet_names, cell_edges);
            }
            Expression::UnaryOp { operand, .. } => {
                self.enumerate_static_refs(owning_sheet, operand, sheet_names, cell_edges);
            }
            Expression::FunctionCall { name, args } => {
                for (i, arg) in args.iter().enumerate() {
                    if crate::functions::arg_always_evaluated(name, i) {
                        self.enumerate_static_refs(owning_sheet, arg, sheet_names, cell_edges);
                    }
                }
            }
            Expression::NumberLiteral(_)
            | Expression::StringLiteral(_)
            | Expression::BooleanLiteral(_)
            | Expression::ErrorLiteral(_) => {}
        }
    }

    fn resolve_sheet_name(&self, owning_sheet: SheetId, name: &Option<String>) -> Option<SheetId> {
        match name {
            None => Some(owning_sheet),
            Some(n) => self.sheet_id_by_name(n),
        }
    }

    /// Called whenever a sheet's existence under `name` changes (created,
    /// deleted, or a rename makes the old/new name resolve differently):
    /// every cell that statically mentions `name` needs its dependency edges
    /// re-derived against current sheet resolution, then recomputed.
    fn wake_sheet_name_references(&mut self, name: &str) {
        let lower = name.to_lowercase();
        let referencing: Vec<CellHandle> = self
            .sheet_reference_graph
            .dependents(&SheetRefNode::Name(lower), EdgeKinds::STATIC)
            .into_iter()
            .filter_map(|n| match n {
                SheetRefNode::Cell(h) => Some(h),
                SheetRefNode::Name(_) => None,
            })
            .collect();
        if referencing.is_empty() {
            return;
        }
        for &handle in &referencing {
            self.dependency_graph.clear_forward(&handle, EdgeKinds::STATIC);
            let expr = self
                .sheet_by_id(handle.0)
                .and_then(|s| s.get_cell(handle.1, handle.2))
                .and_then(|c| c.formula_tree.clone());
            if let Some(expr) = expr {
                self.link_static_refs(handle, &expr);
            }
        }
        self.recompute_from_seeds(referencing);
    }

    // --- recomputation protocol (spec §4.8) --------------------------------

    /// Recomputes every seed cell plus everything downstream of it, in
    /// dependency order, then re-checks for newly-formed cycles and folds
    /// their ancestors back into the pass until the cycle set stabilizes.
    /// Notifies registered callbacks with every cell whose value changed.
    fn recompute_from_seeds(&mut self, seeds: Vec<CellHandle>) {
        if seeds.is_empty() {
            return;
        }
        let seed_set: HashSet<CellHandle> = seeds.into_iter().collect();
        let both = EdgeKinds::STATIC | EdgeKinds::EVALUATED;
        let ancestors = self.dependency_graph.ancestors_of_set(&seed_set, both);

        let mut to_recompute: HashSet<CellHandle> = seed_set;
        to_recompute.extend(ancestors);

        let mut before: HashMap<CellHandle, Value> =
            to_recompute.iter().map(|&h| (h, self.read_value(h))).collect();

        self.recompute_set(&to_recompute);

        // Folding pass: every recompute can reshuffle EVALUATED edges, which
        // can create or dissolve cycles, so keep widening until a pass finds
        // nothing new.
        loop {
            let scc = self
                .dependency_graph
                .strongly_connected_components_and_topological_order(both)
                .clone();
            let cyclic: HashSet<CellHandle> = scc
                .topological_order
                .iter()
                .filter(|h| self.dependency_graph.is_in_cycle(*h, both))
                .cloned()
                .collect();

            let mut newly_cyclic = Vec::new();
            for &h in &cyclic {
                let already_circular = self.read_value(h) == Value::Error(ErrorKind::Circular);
                if !already_circular {
                    newly_cyclic.push(h);
                }
            }
            if newly_cyclic.is_empty() {
                break;
            }
            log::warn!("{} cell(s) newly detected in a circular reference", newly_cyclic.len());
            for &h in &newly_cyclic {
                before.entry(h).or_insert_with(|| self.read_value(h));
                self.write_value(h, Value::Error(ErrorKind::Circular));
                to_recompute.insert(h);
            }
            let newly_cyclic_set: HashSet<CellHandle> = newly_cyclic.into_iter().collect();
            let more_ancestors = self.dependency_graph.ancestors_of_set(&newly_cyclic_set, both);
            let fresh: Vec<CellHandle> = more_ancestors.difference(&to_recompute).cloned().collect();
            for &h in &fresh {
                before.entry(h).or_insert_with(|| self.read_value(h));
            }
            to_recompute.extend(more_ancestors);
            if fresh.is_empty() {
                continue;
            }
            self.recompute_set(&fresh.into_iter().collect());
        }

        let mut changed: Vec<ChangedCell> = Vec::new();
        for &h in &to_recompute {
            let after = self.read_value(h);
            if before.get(&h).map(|v| v != &after).unwrap_or(true) {
                if let Some(sheet) = self.sheet_by_id(h.0) {
                    let loc = Reference::new(None, h.1, h.2, false, false).render();
                    changed.push((sheet.name.clone(), loc));
                }
            }
        }
        if !changed.is_empty() {
            self.notify(&changed);
        }
    }

    /// Recomputes every formula cell in `handles`, in topological order where
    /// the graph has one, falling back to arbitrary order for isolated
    /// cells. Literal and empty cells have nothing to recompute.
    fn recompute_set(&mut self, handles: &HashSet<CellHandle>) {
        let both = EdgeKinds::STATIC | EdgeKinds::EVALUATED;
        let order = self
            .dependency_graph
            .strongly_connected_components_and_topological_order(both)
            .topological_order
            .clone();

        let mut done = HashSet::new();
        for handle in &order {
            if handles.contains(handle) {
                self.recompute_value(*handle);
                done.insert(*handle);
            }
        }
        for &handle in handles {
            if !done.contains(&handle) {
                self.recompute_value(handle);
            }
        }
    }

    fn recompute_value(&mut self, handle: CellHandle) {
        let Some(sheet) = self.sheet_by_id(handle.0) else { return };
        let Some(formula) = sheet.get_cell(handle.1, handle.2).and_then(|c| c.formula_tree.clone()) else {
            return;
        };

        self.dependency_graph.clear_forward(&handle, EdgeKinds::EVALUATED);
        let ctx = EvalContext::new(self, handle.0, (handle.1, handle.2));
        let value = evaluate_formula(&ctx, &formula);
        let edges = ctx.take_runtime_edges();
        for edge in edges {
            self.dependency_graph.link(&handle, &edge, EdgeKinds::EVALUATED);
        }
        self.write_value(handle, value);
    }

    fn read_value(&self, handle: CellHandle) -> Value {
        self.sheet_by_id(handle.0)
            .and_then(|s| s.get_cell(handle.1, handle.2))
            .map(|c| c.value.clone())
            .unwrap_or(Value::Empty)
    }

    fn write_value(&mut self, handle: CellHandle, value: Value) {
        if let Some(sheet) = self.sheet_by_id_mut(handle.0) {
            sheet.cell_or_create(handle.1, handle.2).value = value;
        }
    }

    /// Invokes every registered notifier with the batch of changed cells.
    /// A notifier that panics is caught and logged; the rest still run, so
    /// one broken callback never blocks the others.
    fn notify(&self, changed: &[ChangedCell]) {
        for notifier in &self.notifiers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| notifier(changed)));
            if let Err(_) = result {
                log::error!("a cell-change notifier panicked; continuing with remaining notifiers");
            }
        }
    }
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn new_sheet_auto_names_skip_collisions() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Sheet1".to_string())).unwrap();
        let (_, name) = wb.new_sheet(None).unwrap();
        assert_eq!(name, "Sheet2");
    }

    #[test]
    fn duplicate_sheet_name_is_rejected() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        assert!(wb.new_sheet(Some("s".to_string())).is_err());
    }

    #[test]
    fn del_sheet_breaks_references_to_circref_style_badreference() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("A".to_string())).unwrap();
        wb.new_sheet(Some("B".to_string())).unwrap();
        wb.set_cell_contents("A", "A1", Some("1".to_string())).unwrap();
        wb.set_cell_contents("B", "B1", Some("=A!A1".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("B", "B1").unwrap(), Value::Number("1".parse().unwrap()));
        wb.del_sheet("A").unwrap();
        assert_eq!(wb.get_cell_value("B", "B1").unwrap(), Value::Error(ErrorKind::BadReference));
    }

    #[test]
    fn recreating_sheet_resurrects_dangling_reference() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("A".to_string())).unwrap();
        wb.set_cell_contents("S_ignored_setup", "A1", None).ok();
        wb.new_sheet(Some("B".to_string())).unwrap();
        wb.set_cell_contents("B", "B1", Some("=A!A1".to_string())).unwrap();
        wb.del_sheet("A").unwrap();
        assert_eq!(wb.get_cell_value("B", "B1").unwrap(), Value::Error(ErrorKind::BadReference));
        wb.new_sheet(Some("A".to_string())).unwrap();
        wb.set_cell_contents("A", "A1", Some("99".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("B", "B1").unwrap(), Value::Number("99".parse().unwrap()));
    }

    #[test]
    fn rename_sheet_rewrites_referencing_formulas() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("A".to_string())).unwrap();
        wb.new_sheet(Some("B".to_string())).unwrap();
        wb.set_cell_contents("A", "A1", Some("5".to_string())).unwrap();
        wb.set_cell_contents("B", "B1", Some("=A!A1".to_string())).unwrap();
        wb.rename_sheet("A", "Renamed").unwrap();
        assert_eq!(
            wb.get_cell_contents("B", "B1").unwrap(),
            Some("=Renamed!A1".to_string())
        );
        assert_eq!(wb.get_cell_value("B", "B1").unwrap(), Value::Number("5".parse().unwrap()));
    }

    #[test]
    fn circular_reference_reports_circref() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=B1".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("=A1".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Error(ErrorKind::Circular));
        assert_eq!(wb.get_cell_value("S", "B1").unwrap(), Value::Error(ErrorKind::Circular));
    }

    #[test]
    fn breaking_a_cycle_restores_normal_evaluation() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=B1".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("=A1".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("10".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Number("10".parse().unwrap()));
        assert_eq!(wb.get_cell_value("S", "B1").unwrap(), Value::Number("10".parse().unwrap()));
    }

    #[test]
    fn move_cells_adjusts_relative_references() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=10".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("=A1".to_string())).unwrap();
        wb.move_cells("S", "A1", "A2", "B1", None).unwrap();
        assert_eq!(wb.get_cell_contents("S", "B1").unwrap(), Some("=10".to_string()));
        assert_eq!(wb.get_cell_contents("S", "B2").unwrap(), Some("=B1".to_string()));
        assert_eq!(wb.get_cell_contents("S", "A1").unwrap(), None);
        assert_eq!(wb.get_cell_value("S", "B2").unwrap(), Value::Number("10".parse().unwrap()));
    }

    #[test]
    fn copy_cells_out_of_range_reference_becomes_ref_error() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=A1".to_string())).ok();
        wb.set_cell_contents("S", "B1", Some("=$A$1".to_string())).unwrap();
        wb.copy_cells("S", "B1", "B1", "A1", None).unwrap();
        let contents = wb.get_cell_contents("S", "A1").unwrap().unwrap();
        assert_eq!(contents, "=$A$1");
    }

    #[test]
    fn sort_region_reorders_by_descending_key() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("3".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("1".to_string())).unwrap();
        wb.set_cell_contents("S", "A3", Some("2".to_string())).unwrap();
        wb.sort_region("S", "A1", "A3", &[-1]).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Number("3".parse().unwrap()));
        assert_eq!(wb.get_cell_value("S", "A2").unwrap(), Value::Number("2".parse().unwrap()));
        assert_eq!(wb.get_cell_value("S", "A3").unwrap(), Value::Number("1".parse().unwrap()));
    }

    #[test]
    fn sort_region_rejects_duplicate_columns() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        assert!(wb.sort_region("S", "A1", "B3", &[1, -1]).is_err());
    }

    #[test]
    fn notifier_receives_changed_locations() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        let seen: Rc<RefCell<Vec<ChangedCell>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        wb.notify_cells_changed(Box::new(move |changed| {
            seen_clone.borrow_mut().extend(changed.iter().cloned());
        }));
        wb.set_cell_contents("S", "A1", Some("1".to_string())).unwrap();
        assert!(seen.borrow().iter().any(|(sheet, loc)| sheet == "S" && loc == "A1"));
    }

    #[test]
    fn circular_reference_with_tail_cell_and_cycle_break() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=A2".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("=A1+A4".to_string())).unwrap();
        wb.set_cell_contents("S", "A3", Some("=\"Hello \" & A1 & \"!\"".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Error(ErrorKind::Circular));
        assert_eq!(wb.get_cell_value("S", "A2").unwrap(), Value::Error(ErrorKind::Circular));
        assert_eq!(wb.get_cell_value("S", "A3").unwrap(), Value::Text("Hello #CIRCREF!!".to_string()));

        wb.set_cell_contents("S", "A1", Some("0".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A2").unwrap(), Value::Number("0".parse().unwrap()));
        assert_eq!(wb.get_cell_value("S", "A3").unwrap(), Value::Text("Hello 0!".to_string()));
    }

    #[test]
    fn parse_error_propagates_through_referencing_formula() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=#REF!+".to_string())).unwrap();
        wb.set_cell_contents("S", "B1", Some("=A1+1".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "A1").unwrap(), Value::Error(ErrorKind::Parse));
        assert_eq!(wb.get_cell_value("S", "B1").unwrap(), Value::Error(ErrorKind::Parse));
    }

    #[test]
    fn rename_sheet_to_a_name_needing_quotes_quotes_the_rewritten_reference() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S1".to_string())).unwrap();
        wb.new_sheet(Some("S2".to_string())).unwrap();
        wb.set_cell_contents("S1", "A1", Some("10".to_string())).unwrap();
        wb.set_cell_contents("S2", "A1", Some("=S1!A1+5".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S2", "A1").unwrap(), Value::Number("15".parse().unwrap()));

        wb.rename_sheet("S1", "new name").unwrap();
        assert_eq!(
            wb.get_cell_contents("S2", "A1").unwrap(),
            Some("='new name'!A1+5".to_string())
        );
        assert_eq!(wb.get_cell_value("S2", "A1").unwrap(), Value::Number("15".parse().unwrap()));
    }

    #[test]
    fn copy_cells_keeps_literal_formula_independent_of_source() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        wb.set_cell_contents("S", "A1", Some("=10".to_string())).unwrap();
        wb.set_cell_contents("S", "A2", Some("=A1".to_string())).unwrap();
        wb.copy_cells("S", "A1", "A2", "B1", None).unwrap();
        assert_eq!(wb.get_cell_contents("S", "B1").unwrap(), Some("=10".to_string()));
        assert_eq!(wb.get_cell_contents("S", "B2").unwrap(), Some("=B1".to_string()));
        assert_eq!(wb.get_cell_value("S", "B2").unwrap(), Value::Number("10".parse().unwrap()));

        wb.set_cell_contents("S", "A1", Some("a string".to_string())).unwrap();
        assert_eq!(wb.get_cell_value("S", "B2").unwrap(), Value::Number("10".parse().unwrap()));
    }

    #[test]
    fn sort_region_preserves_relative_order_of_tied_keys() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        let col_a = [1, 2, 3, 4, 5, 5, 5, 5, 5, 10, 11, 12, 13, 14, 15];
        for (i, &v) in col_a.iter().enumerate() {
            let row = i as u32 + 1;
            wb.set_cell_contents("S", &format!("A{row}"), Some(v.to_string())).unwrap();
            wb.set_cell_contents("S", &format!("B{row}"), Some(format!("={row}"))).unwrap();
        }
        wb.sort_region("S", "A1", "B15", &[1]).unwrap();
        for row in 5..=9u32 {
            assert_eq!(
                wb.get_cell_value("S", &format!("B{row}")).unwrap(),
                Value::Number(row.to_string().parse().unwrap())
            );
        }
    }

    #[test]
    fn notifier_panic_does_not_block_other_notifiers() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S".to_string())).unwrap();
        let ran: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let ran_clone = ran.clone();
        wb.notify_cells_changed(Box::new(|_| panic!("boom")));
        wb.notify_cells_changed(Box::new(move |_| {
            *ran_clone.borrow_mut() = true;
        }));
        wb.set_cell_contents("S", "A1", Some("1".to_string())).unwrap();
        assert!(*ran.borrow());
    }
}
