// Multi-process lock smoke test for shared-list appends.
use std::process::{Command, Stdio};

use private_attrs::api::{Store, StoreOptions};
use serde_json::json;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_private-attrs");
    Command::new(exe)
}

#[test]
fn concurrent_appends_are_serialized() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Store::with_options(StoreOptions::proxy().with_session_dir(temp.path()))
        .expect("store");
    let list = store.new_list().expect("list");
    let session = store.session_path().expect("session").to_path_buf();

    let workers = 8;
    let mut children = Vec::new();
    for i in 0..workers {
        let child = cmd()
            .args([
                "append",
                session.to_str().unwrap(),
                "--list",
                &list.handle().id.to_string(),
                "--json",
                &format!("{{\"i\":{i}}}"),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        children.push(child);
    }

    for mut child in children {
        let status = child.wait().expect("wait");
        assert!(status.success());
    }

    let items = list.items().expect("items");
    assert_eq!(items.len(), workers);
    for i in 0..workers {
        assert!(items.contains(&json!({ "i": i })));
    }
}
