use super::*;

use serde_json::json;

fn node(mac: &str, image: &str) -> Row {
    row(json!({"mac": mac, "image": image}))
}

#[test]
fn test_insert_assigns_ids() {
    let mut db = MemoryDb::new();
    assert_eq!(db.insert("nodes", node("aa", "debian")), 1);
    assert_eq!(db.insert("nodes", node("bb", "debian")), 2);

    let rows = db.select("nodes", &row(json!({"mac": "bb"})));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!(2));
}

#[test]
fn test_staged_writes_visible_only_after_commit() {
    let mut db = MemoryDb::new();
    db.insert("nodes", node("aa", "debian"));
    assert!(db.has_uncommitted());
    assert_eq!(db.select("nodes", &Row::new()).len(), 1);
    assert!(db.select_committed("nodes", &Row::new()).is_empty());

    assert_eq!(db.commit(), 1);
    assert!(!db.has_uncommitted());
    assert_eq!(db.select_committed("nodes", &Row::new()).len(), 1);
}

#[test]
fn test_rollback_discards() {
    let mut db = MemoryDb::new();
    db.insert("nodes", node("aa", "debian"));
    db.commit();
    db.update("nodes", &row(json!({"mac": "aa"})), &row(json!({"image": "alpine"})));
    assert!(db.rollback());
    assert_eq!(db.select("nodes", &Row::new())[0]["image"], json!("debian"));
    assert!(!db.rollback());
}

#[test]
fn test_update_keeps_id() {
    let mut db = MemoryDb::new();
    db.insert("nodes", node("aa", "debian"));
    db.insert("nodes", node("bb", "debian"));
    let changed = db.update(
        "nodes",
        &row(json!({"image": "debian"})),
        &row(json!({"image": "alpine", "id": 99})),
    );
    assert_eq!(changed, 2);
    let rows = db.select("nodes", &row(json!({"image": "alpine"})));
    let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

#[test]
fn test_unknown_table() {
    let mut db = MemoryDb::new();
    assert!(db.select("images", &Row::new()).is_empty());
    assert_eq!(db.update("images", &Row::new(), &row(json!({"a": 1}))), 0);
    assert!(db.tables().is_empty());
}

#[test]
fn test_row_from_non_object() {
    assert!(row(json!([1, 2])).is_empty());
}
