//! Device database: the store owned by the db process and the typed client
//! other processes reach it through.

mod client;
mod memory;

pub use client::DbClient;
pub use memory::{row, MemoryDb, Row};

use serde::{Deserialize, Serialize};

/// API name of the db process.
pub const DB_API: &str = "db";

/// Arguments of `select` and `cursor_open`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectArgs {
    pub table: String,
    #[serde(default)]
    pub filter: Row,
}

/// Arguments of `insert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertArgs {
    pub table: String,
    pub row: Row,
}

/// Arguments of `update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateArgs {
    pub table: String,
    #[serde(default)]
    pub filter: Row,
    pub changes: Row,
}

/// Arguments of `cursor_fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchArgs {
    pub cursor: u64,
    pub max_rows: usize,
}

/// One page of a server cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorPage {
    pub rows: Vec<Row>,
    pub done: bool,
}
