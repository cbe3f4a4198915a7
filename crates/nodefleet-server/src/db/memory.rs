//! In-memory table store with a single staging area.
//!
//! Writes land in a staged copy of the tables and become visible to
//! later readers of the committed view only on [`MemoryDb::commit`].
//! Reads see staged writes, like reads inside an open transaction.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

/// One record; every row gets an integer `id` on insert.
pub type Row = Map<String, Value>;

type Tables = BTreeMap<String, Vec<Row>>;

/// Build a row from a JSON object. Anything else gives an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(key, value)| row.get(key) == Some(value))
}

#[derive(Debug, Default)]
pub struct MemoryDb {
    committed: Tables,
    staged: Option<Tables>,
    next_id: u64,
    commits: u64,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn view(&self) -> &Tables {
        self.staged.as_ref().unwrap_or(&self.committed)
    }

    fn stage(&mut self) -> &mut Tables {
        let committed = &self.committed;
        self.staged.get_or_insert_with(|| committed.clone())
    }

    /// Rows of `table` whose fields equal every field of `filter`.
    pub fn select(&self, table: &str, filter: &Row) -> Vec<Row> {
        self.view()
            .get(table)
            .map(|rows| rows.iter().filter(|r| matches(r, filter)).cloned().collect())
            .unwrap_or_default()
    }

    /// Rows visible to readers that do not see staged writes.
    pub fn select_committed(&self, table: &str, filter: &Row) -> Vec<Row> {
        self.committed
            .get(table)
            .map(|rows| rows.iter().filter(|r| matches(r, filter)).cloned().collect())
            .unwrap_or_default()
    }

    /// Insert a row and return its id.
    pub fn insert(&mut self, table: &str, mut row: Row) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        row.insert("id".to_string(), Value::from(id));
        self.stage().entry(table.to_string()).or_default().push(row);
        debug!("db: insert into {} (id {})", table, id);
        id
    }

    /// Apply `changes` to every matching row; returns how many matched.
    pub fn update(&mut self, table: &str, filter: &Row, changes: &Row) -> usize {
        let Some(rows) = self.stage().get_mut(table) else {
            return 0;
        };
        let mut updated = 0;
        for row in rows.iter_mut().filter(|r| matches(r, filter)) {
            for (key, value) in changes {
                if key != "id" {
                    row.insert(key.clone(), value.clone());
                }
            }
            updated += 1;
        }
        debug!("db: update {} ({} rows)", table, updated);
        updated
    }

    /// Publish staged writes. Returns the commit sequence number.
    pub fn commit(&mut self) -> u64 {
        if let Some(staged) = self.staged.take() {
            self.committed = staged;
        }
        self.commits += 1;
        self.commits
    }

    /// Drop staged writes. Returns whether there were any.
    pub fn rollback(&mut self) -> bool {
        self.staged.take().is_some()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.staged.is_some()
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn tables(&self) -> Vec<String> {
        self.view().keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
