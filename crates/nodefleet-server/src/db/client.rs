//! Typed client of the `db` API.

use nodefleet_rpc::Proxy;
use nodefleet_runloop::Promise;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CursorPage, FetchArgs, InsertArgs, Row, SelectArgs, UpdateArgs};
use crate::error::{ServerError, ServerResult};

/// Database access for processes other than db.
#[derive(Debug, Clone)]
pub struct DbClient {
    proxy: Proxy,
}

impl DbClient {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    fn call<A, R>(&self, method: &str, args: A) -> Promise<ServerResult<R>>
    where
        A: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.proxy
            .call_async::<A, R>(method, args)
            .map(|result| result.map_err(ServerError::from))
    }

    pub fn select(&self, table: &str, filter: Row) -> Promise<ServerResult<Vec<Row>>> {
        self.call(
            "select",
            SelectArgs {
                table: table.to_string(),
                filter,
            },
        )
    }

    /// Insert a row; resolves to its id.
    pub fn insert(&self, table: &str, row: Row) -> Promise<ServerResult<u64>> {
        self.call(
            "insert",
            InsertArgs {
                table: table.to_string(),
                row,
            },
        )
    }

    /// Update matching rows; resolves to the number of rows changed.
    pub fn update(&self, table: &str, filter: Row, changes: Row) -> Promise<ServerResult<usize>> {
        self.call(
            "update",
            UpdateArgs {
                table: table.to_string(),
                filter,
                changes,
            },
        )
    }

    pub fn commit(&self) -> Promise<ServerResult<u64>> {
        self.call("commit", ())
    }

    pub fn rollback(&self) -> Promise<ServerResult<bool>> {
        self.call("rollback", ())
    }

    /// Open a server cursor over the matching rows.
    pub fn cursor_open(&self, table: &str, filter: Row) -> Promise<ServerResult<u64>> {
        self.call(
            "cursor_open",
            SelectArgs {
                table: table.to_string(),
                filter,
            },
        )
    }

    pub fn cursor_fetch(&self, cursor: u64, max_rows: usize) -> Promise<ServerResult<CursorPage>> {
        self.call("cursor_fetch", FetchArgs { cursor, max_rows })
    }

    pub fn cursor_close(&self, cursor: u64) -> Promise<ServerResult<bool>> {
        self.call("cursor_close", cursor)
    }

    /// Look up one row; resolves to `None` when nothing matches.
    pub fn find_one(&self, table: &str, filter: Row) -> Promise<ServerResult<Option<Row>>> {
        self.select(table, filter)
            .map(|result| result.map(|rows| rows.into_iter().next()))
    }
}
