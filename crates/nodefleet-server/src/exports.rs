//! NFS export table regeneration.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use nodefleet_runloop::Promise;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blocking::{BlockingClient, BlockingRequest};
use crate::error::ServerResult;
use crate::restarter::ServiceRestarter;

const HEADER: &str = "# Generated by nodefleet. Local changes are overwritten.\n";
const OPTIONS: &str = "ro,no_root_squash,no_subtree_check";

/// One exported directory and the client allowed to mount it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportEntry {
    pub path: PathBuf,
    pub client: String,
}

/// Render an exports file; entries are sorted so equal sets render equally.
pub fn render(entries: &[ExportEntry]) -> String {
    let mut sorted = entries.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut content = String::from(HEADER);
    for entry in sorted {
        content.push_str(&format!("{} {}({})\n", entry.path.display(), entry.client, OPTIONS));
    }
    content
}

/// Writes the exports file through the blocking worker and asks the NFS
/// restarter to pick it up.
#[derive(Clone)]
pub struct ExportsWriter {
    path: PathBuf,
    blocking: Rc<dyn BlockingClient>,
    nfs: ServiceRestarter,
    last: Rc<RefCell<Option<String>>>,
}

impl ExportsWriter {
    pub fn new(path: impl Into<PathBuf>, blocking: Rc<dyn BlockingClient>, nfs: ServiceRestarter) -> Self {
        Self {
            path: path.into(),
            blocking,
            nfs,
            last: Rc::new(RefCell::new(None)),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Rewrite the file if its content changes. Resolves to whether it did.
    pub fn regenerate(&self, entries: &[ExportEntry]) -> Promise<ServerResult<bool>> {
        let content = render(entries);
        if self.last.borrow().as_deref() == Some(content.as_str()) {
            debug!("{} unchanged", self.path.display());
            return Promise::resolved(Ok(false));
        }

        let count = entries.len();
        let path = self.path.clone();
        let last = self.last.clone();
        let nfs = self.nfs.clone();
        self.blocking
            .run(BlockingRequest::WriteFile {
                path: self.path.clone(),
                content: content.clone(),
            })
            .map(move |result| {
                result?;
                info!("{} regenerated ({} exports)", path.display(), count);
                *last.borrow_mut() = Some(content);
                nfs.bump();
                Ok(true)
            })
    }
}

#[cfg(test)]
#[path = "exports_tests.rs"]
mod tests;
