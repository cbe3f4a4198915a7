//! Owner of the device database.

use std::cell::RefCell;
use std::rc::Rc;

use nodefleet_daemon::{DaemonError, ProcessContext, ServerProcess};
use nodefleet_rpc::{Connector, ConnectorOptions, LocalService};
use tracing::{info, warn};

use super::{DB, MAIN};
use crate::db::MemoryDb;
use crate::service::DbService;

pub struct DbProcess {
    db: Rc<RefCell<MemoryDb>>,
    connector: Option<Connector>,
}

impl DbProcess {
    pub fn new() -> Self {
        Self {
            db: Rc::new(RefCell::new(MemoryDb::new())),
            connector: None,
        }
    }

    /// The store served to main.
    pub fn store(&self) -> Rc<RefCell<MemoryDb>> {
        self.db.clone()
    }
}

impl Default for DbProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerProcess for DbProcess {
    fn name(&self) -> &str {
        DB
    }

    fn level(&self) -> u8 {
        0
    }

    fn prepare(&mut self, ctx: &mut ProcessContext) -> Result<(), DaemonError> {
        let stream = ctx.take_channel(DB, MAIN)?;
        let connector = Connector::new(ctx.ev(), stream, ConnectorOptions::new("db<-main"))
            .map_err(|e| DaemonError::prepare(DB, e))?;
        let db = self.db.clone();
        connector.configure(LocalService::new().register(move || DbService::new(db.clone())));
        self.connector = Some(connector);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.close();
        }
        let mut db = self.db.borrow_mut();
        if db.has_uncommitted() {
            warn!("db: discarding uncommitted writes");
            db.rollback();
        }
        info!("db: {} commits, tables {:?}", db.commits(), db.tables());
    }
}
