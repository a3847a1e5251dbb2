//! Column decoding helpers for uuid values stored as TEXT.
//!
//! The schema writes every uuid as its 36-character string form; sqlx's
//! built-in SQLite `Uuid` decode only accepts 16-byte blobs, so row types
//! fetch these columns as `String` and parse.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub fn uuid_text(row: &SqliteRow, column: &str) -> Result<Uuid, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

pub fn opt_uuid_text(row: &SqliteRow, column: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        Uuid::parse_str(&s).map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}
