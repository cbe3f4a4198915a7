//! The `db` API served by the db process.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use nodefleet_rpc::{parse_args, CallContext, MethodTable, RemoteError, Reply, Service};
use serde_json::Value;
use tracing::debug;

use crate::db::{CursorPage, FetchArgs, InsertArgs, MemoryDb, Row, SelectArgs, UpdateArgs, DB_API};

/// One session against the shared database. Cursors belong to the session
/// and are released when it ends.
pub struct DbService {
    db: Rc<RefCell<MemoryDb>>,
    cursors: BTreeMap<u64, VecDeque<Row>>,
    next_cursor: u64,
}

impl DbService {
    pub fn new(db: Rc<RefCell<MemoryDb>>) -> Self {
        Self {
            db,
            cursors: BTreeMap::new(),
            next_cursor: 0,
        }
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.len()
    }

    fn select(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: SelectArgs = parse_args(args)?;
        Reply::json(self.db.borrow().select(&args.table, &args.filter))
    }

    fn insert(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: InsertArgs = parse_args(args)?;
        Reply::json(self.db.borrow_mut().insert(&args.table, args.row))
    }

    fn update(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: UpdateArgs = parse_args(args)?;
        Reply::json(self.db.borrow_mut().update(&args.table, &args.filter, &args.changes))
    }

    fn commit(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.db.borrow_mut().commit())
    }

    fn rollback(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.db.borrow_mut().rollback())
    }

    fn cursor_open(&mut self, ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: SelectArgs = parse_args(args)?;
        let rows = self.db.borrow().select(&args.table, &args.filter);
        self.next_cursor += 1;
        let id = self.next_cursor;
        debug!("{}: cursor {} over {} ({} rows)", ctx.connector_name(), id, args.table, rows.len());
        self.cursors.insert(id, rows.into());
        Reply::json(id)
    }

    fn cursor_fetch(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let args: FetchArgs = parse_args(args)?;
        let rows = self
            .cursors
            .get_mut(&args.cursor)
            .ok_or_else(|| RemoteError::new("unknown_cursor", format!("no cursor {}", args.cursor)))?;
        let take = args.max_rows.min(rows.len());
        let page = CursorPage {
            rows: rows.drain(..take).collect(),
            done: rows.is_empty(),
        };
        Reply::json(page)
    }

    fn cursor_close(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        let cursor: u64 = parse_args(args)?;
        Reply::json(self.cursors.remove(&cursor).is_some())
    }
}

impl Service for DbService {
    const API: &'static str = DB_API;

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("select", DbService::select)
            .with("insert", DbService::insert)
            .with("update", DbService::update)
            .with("commit", DbService::commit)
            .with("rollback", DbService::rollback)
            .with("cursor_open", DbService::cursor_open)
            .with("cursor_fetch", DbService::cursor_fetch)
            .with("cursor_close", DbService::cursor_close)
    }

    fn cleanup(&mut self) {
        if !self.cursors.is_empty() {
            debug!("db: releasing {} open cursors", self.cursors.len());
            self.cursors.clear();
        }
    }
}
