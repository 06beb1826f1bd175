//! FILENAME: persistence/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing key: {0}")]
    MissingKey(String),

    #[error("wrong type for {0}")]
    WrongType(String),

    #[error("workbook error: {0}")]
    Workbook(#[from] engine::WorkbookError),
}
