use super::*;

struct Echo {
    calls: u32,
}

impl Echo {
    fn echo(&mut self, _ctx: &mut CallContext, args: Value) -> Result<Reply, RemoteError> {
        self.calls += 1;
        Ok(Reply::Now(args))
    }

    fn count(&mut self, _ctx: &mut CallContext, _args: Value) -> Result<Reply, RemoteError> {
        Reply::json(self.calls)
    }
}

impl Service for Echo {
    const API: &'static str = "echo";

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("echo", Echo::echo)
            .with("count", Echo::count)
    }
}

#[test]
fn test_method_table_lookup() {
    let table = Echo::methods();
    assert_eq!(table.len(), 2);
    assert!(!table.is_empty());
    assert_eq!(table.names(), vec!["count", "echo"]);
    assert!(table.get("echo").is_some());
    assert!(table.get("missing").is_none());
}

#[test]
fn test_local_service_registry() {
    let local = LocalService::new().register(|| Echo { calls: 0 });
    assert_eq!(local.apis(), vec!["echo"]);
    assert!(local.open("echo").is_some());
    assert!(local.open("db").is_none());
}

#[test]
fn test_parse_args_reports_bad_args() {
    #[derive(Debug, serde::Deserialize)]
    struct Args {
        #[allow(dead_code)]
        mac: String,
    }

    let err = parse_args::<Args>(serde_json::json!({"ip": 1})).unwrap_err();
    assert!(err.is("bad_args"));
    assert!(parse_args::<Args>(serde_json::json!({"mac": "aa"})).is_ok());
}

#[test]
fn test_reply_helpers() {
    match Reply::json(vec![1, 2]).unwrap() {
        Reply::Now(value) => assert_eq!(value, serde_json::json!([1, 2])),
        Reply::Deferred => panic!("expected an immediate reply"),
    }
    assert!(matches!(Reply::unit(), Ok(Reply::Now(Value::Null))));
}
