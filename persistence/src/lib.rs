//! FILENAME: persistence/src/lib.rs
//! PURPOSE: Loads and saves a workbook as the JSON format described under
//! the engine's External Interfaces: `{"sheets": [{"name": S,
//! "cell-contents": {LOC: TEXT, ...}}, ...]}`.
//! CONTEXT: Cell contents round-trip as the text the user originally typed,
//! not the evaluated value — loading replays every cell through
//! `Workbook::set_cell_contents` exactly as a live edit would, so parsing,
//! linking, and recomputation happen the same way regardless of whether the
//! contents came from a user keystroke or a saved file.

mod error;

pub use error::PersistenceError;

use engine::Workbook;
use serde_json::{Map, Value as Json};
use std::io::{Read, Write};

pub fn load_workbook(reader: impl Read) -> Result<Workbook, PersistenceError> {
    let document: Json = serde_json::from_reader(reader)?;

    let sheets = document
        .get("sheets")
        .ok_or_else(|| PersistenceError::MissingKey("sheets".to_string()))?
        .as_array()
        .ok_or_else(|| PersistenceError::WrongType("sheets".to_string()))?;

    let mut workbook = Workbook::new();
    for sheet in sheets {
        let name = sheet
            .get("name")
            .ok_or_else(|| PersistenceError::MissingKey("name".to_string()))?
            .as_str()
            .ok_or_else(|| PersistenceError::WrongType("name".to_string()))?;

        let cell_contents = sheet
            .get("cell-contents")
            .ok_or_else(|| PersistenceError::MissingKey("cell-contents".to_string()))?
            .as_object()
            .ok_or_else(|| PersistenceError::WrongType("cell-contents".to_string()))?;

        workbook.new_sheet(Some(name.to_string()))?;
        for (location, text) in cell_contents {
            let text = text
                .as_str()
                .ok_or_else(|| PersistenceError::WrongType(format!("cell-contents.{location}")))?;
            workbook.set_cell_contents(name, location, Some(text.to_string()))?;
        }
    }
    Ok(workbook)
}

pub fn save_workbook(workbook: &Workbook, writer: impl Write) -> Result<(), PersistenceError> {
    let mut sheets = Vec::new();
    for sheet in workbook.sheets() {
        let mut cell_contents = Map::new();
        for (&(col, row), cell) in sheet.non_empty_cells() {
            if let Some(text) = &cell.contents {
                let location = engine::Reference::new(None, col, row, false, false).render();
                cell_contents.insert(location, Json::String(text.clone()));
            }
        }
        let mut sheet_obj = Map::new();
        sheet_obj.insert("name".to_string(), Json::String(sheet.name.clone()));
        sheet_obj.insert("cell-contents".to_string(), Json::Object(cell_contents));
        sheets.push(Json::Object(sheet_obj));
    }

    let mut document = Map::new();
    document.insert("sheets".to_string(), Json::Array(sheets));
    serde_json::to_writer(writer, &Json::Object(document))?;
    Ok(())
}
