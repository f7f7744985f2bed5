use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Drive the real binary over stdio: initialize, list tools, run a gated
/// call and a retrieval call, and check the JSON-RPC frame shape.
#[test]
fn stdio_server_smoke() {
    // `cargo test` sets this for integration tests.
    let bin = env!("CARGO_BIN_EXE_contextengine");
    let home = tempfile::tempdir().expect("tempdir");

    let mut child = Command::new(bin)
        .arg("serve")
        // Keep the run hermetic: fake home, no model download, no collectors.
        .env("HOME", home.path())
        .env("CONTEXTENGINE_DISABLE_EMBEDDINGS", "1")
        .env("CONTEXTENGINE_CONFIG", home.path().join("nonexistent-config.json"))
        .current_dir(home.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn contextengine serve");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");

        // One JSON-RPC message per line (the server reads lines()).
        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "list_sources", "arguments": {} }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "run_audit", "arguments": {} }
            })
        )
        .unwrap();
    }
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let reader = BufReader::new(stdout);
    let mut replies: Vec<serde_json::Value> = Vec::new();
    for line in reader.lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&line) {
            replies.push(v);
        }
        if replies.len() == 4 {
            break;
        }
    }
    let _ = child.kill();
    let _ = child.wait();

    assert_eq!(replies.len(), 4, "one reply per request");

    // initialize
    assert_eq!(replies[0]["id"], 1);
    assert_eq!(replies[0]["result"]["serverInfo"]["name"], "contextengine");

    // tools/list carries the minimum operation surface.
    let tools = replies[1]["result"]["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for required in [
        "search_context",
        "list_sources",
        "read_source",
        "reindex",
        "save_learning",
        "list_learnings",
        "import_learnings",
        "delete_learning",
        "save_session",
        "load_session",
        "list_sessions",
        "end_session",
        "list_projects",
        "check_ports",
        "run_audit",
        "score_project",
    ] {
        assert!(names.contains(&required), "missing tool {required}");
    }

    // list_sources answers with text content and no error.
    let content = replies[2]["result"]["content"][0]["text"].as_str().unwrap();
    assert!(content.contains("chunks"));
    assert_eq!(replies[2]["result"]["isError"], false);

    // Premium tool is gated but still answers through the firewall.
    let gated = replies[3]["result"]["content"][0]["text"].as_str().unwrap();
    assert!(gated.contains("premium"));
    assert_eq!(replies[3]["result"]["isError"], true);
}
