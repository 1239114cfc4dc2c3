//! End-to-end tests against a live mock provider speaking line-delimited
//! JSON-RPC over stdio.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use ncp_gateway::config::Settings;
use ncp_gateway::discovery::FindOptions;
use ncp_gateway::orchestrator::Orchestrator;
use ncp_gateway::profile::{Profile, ProfileStore, ProviderSpec};
use ncp_gateway::protocol::Content;

/// A provider that answers the handshake and tool calls, and appends every
/// incoming frame to a log file so tests can assert on what it received.
const MOCK_PROVIDER: &str = r#"
log="$1"
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$log"
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"1.0.0"}}}\n' "$id";;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_text","description":"Echo the given text back to the caller","inputSchema":{"type":"object","properties":{"text":{"type":"string"}}}}]}}\n' "$id";;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"},{"type":"text","text":"twice"}],"isError":false}}\n' "$id";;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"not supported"}}\n' "$id";;
  esac
done
"#;

/// A provider that completes the handshake but never answers tool calls.
const SILENT_CALL_PROVIDER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"slow","version":"1.0.0"}}}\n' "$id";;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"long_task","description":"A tool that never finishes","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"tools/call"'*)
      : ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"not supported"}}\n' "$id";;
  esac
done
"#;

fn provider_spec(script_path: &Path, log_path: &Path) -> ProviderSpec {
    ProviderSpec {
        command: "bash".to_string(),
        args: vec![
            script_path.to_string_lossy().into_owned(),
            log_path.to_string_lossy().into_owned(),
        ],
        env: BTreeMap::new(),
        provenance: None,
    }
}

fn settings() -> Settings {
    Settings {
        spawn_timeout_secs: 5,
        call_timeout_secs: 5,
        ..Settings::default()
    }
}

async fn wait_for_reconcile(orchestrator: &Orchestrator) {
    for _ in 0..500 {
        if !orchestrator.is_reconciling() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("reconciliation did not finish");
}

#[tokio::test]
async fn cold_start_probes_provider_and_serves_find_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("mock.sh");
    let log = dir.path().join("frames.log");
    std::fs::write(&script, MOCK_PROVIDER).unwrap();

    let store = ProfileStore::new(dir.path());
    let mut profile = Profile::default();
    profile
        .add("mock".to_string(), provider_spec(&script, &log))
        .unwrap();
    store.save("default", &profile).await.unwrap();

    let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
        .await
        .unwrap();
    wait_for_reconcile(&orchestrator).await;

    // Give the indexing task a moment to drain the probe results
    for _ in 0..200 {
        let results = orchestrator
            .find("echo the given text back", &FindOptions::default())
            .await;
        if results.first().is_some_and(|r| r.fqtn == "mock:echo_text") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let results = orchestrator
        .find("echo the given text back", &FindOptions::default())
        .await;
    assert_eq!(results[0].fqtn, "mock:echo_text");

    let cancel = CancellationToken::new();
    let result = orchestrator
        .run(
            "mock:echo_text",
            json!({"text": "hello"}),
            None,
            None,
            &cancel,
        )
        .await
        .unwrap();
    assert!(!result.is_error);
    // Text parts are concatenated with newline by normalization
    match &result.content[0] {
        Content::Text { text } => assert_eq!(text, "echoed\ntwice"),
        other => panic!("expected text content, got {other:?}"),
    }

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn meta_is_forwarded_verbatim_to_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("mock.sh");
    let log = dir.path().join("frames.log");
    std::fs::write(&script, MOCK_PROVIDER).unwrap();

    let store = ProfileStore::new(dir.path());
    let mut profile = Profile::default();
    profile
        .add("mock".to_string(), provider_spec(&script, &log))
        .unwrap();
    store.save("default", &profile).await.unwrap();

    let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
        .await
        .unwrap();
    wait_for_reconcile(&orchestrator).await;

    let meta = json!({"sessionId": "sess-42", "trace": {"spanId": 7}});
    let cancel = CancellationToken::new();
    orchestrator
        .run("mock:echo_text", json!({}), Some(meta.clone()), None, &cancel)
        .await
        .unwrap();

    // The provider logged every incoming frame; the tools/call frame must
    // carry _meta byte-for-byte.
    let frames = std::fs::read_to_string(&log).unwrap();
    let call_frame = frames
        .lines()
        .find(|l| l.contains("tools/call"))
        .expect("provider received the call");
    let parsed: Value = serde_json::from_str(call_frame).unwrap();
    assert_eq!(parsed["params"]["_meta"], meta);

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn crash_isolation_second_provider_keeps_working() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("mock.sh");
    let log = dir.path().join("frames.log");
    std::fs::write(&script, MOCK_PROVIDER).unwrap();

    let store = ProfileStore::new(dir.path());
    let mut profile = Profile::default();
    profile
        .add("good".to_string(), provider_spec(&script, &log))
        .unwrap();
    profile
        .add(
            "broken".to_string(),
            ProviderSpec {
                command: "/no/such/binary".to_string(),
                args: vec![],
                env: BTreeMap::new(),
                provenance: None,
            },
        )
        .unwrap();
    store.save("default", &profile).await.unwrap();

    let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
        .await
        .unwrap();
    wait_for_reconcile(&orchestrator).await;

    let cancel = CancellationToken::new();

    // The broken provider fails its own call only
    let err = orchestrator
        .run("broken:anything", json!({}), None, None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "spawn_failed");

    // The good provider is unaffected
    let result = orchestrator
        .run("good:echo_text", json!({}), None, None, &cancel)
        .await
        .unwrap();
    assert!(!result.is_error);

    // find still serves the good provider's cached tools
    let results = orchestrator
        .find("echo the given text back", &FindOptions::default())
        .await;
    assert!(results.iter().any(|r| r.fqtn == "good:echo_text"));

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn cancellation_completes_the_call_and_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("silent.sh");
    std::fs::write(&script, SILENT_CALL_PROVIDER).unwrap();

    let store = ProfileStore::new(dir.path());
    let mut profile = Profile::default();
    profile
        .add(
            "slow".to_string(),
            ProviderSpec {
                command: "bash".to_string(),
                args: vec![script.to_string_lossy().into_owned()],
                env: BTreeMap::new(),
                provenance: None,
            },
        )
        .unwrap();
    store.save("default", &profile).await.unwrap();

    let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
        .await
        .unwrap();
    wait_for_reconcile(&orchestrator).await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = orchestrator
        .run("slow:long_task", json!({}), None, None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "cancelled");

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn call_timeout_fails_the_call_but_not_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("silent.sh");
    std::fs::write(&script, SILENT_CALL_PROVIDER).unwrap();

    let store = ProfileStore::new(dir.path());
    let mut profile = Profile::default();
    profile
        .add(
            "slow".to_string(),
            ProviderSpec {
                command: "bash".to_string(),
                args: vec![script.to_string_lossy().into_owned()],
                env: BTreeMap::new(),
                provenance: None,
            },
        )
        .unwrap();
    store.save("default", &profile).await.unwrap();

    let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
        .await
        .unwrap();
    wait_for_reconcile(&orchestrator).await;

    let cancel = CancellationToken::new();
    let err = orchestrator
        .run(
            "slow:long_task",
            json!({}),
            None,
            Some(Duration::from_millis(200)),
            &cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "call_timeout");

    // The cached view is intact: find still works
    let results = orchestrator
        .find("a tool that never finishes", &FindOptions::default())
        .await;
    assert!(results.iter().any(|r| r.fqtn == "slow:long_task"));

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn warm_restart_skips_probing_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("mock.sh");
    let log = dir.path().join("frames.log");
    std::fs::write(&script, MOCK_PROVIDER).unwrap();

    let store = ProfileStore::new(dir.path());
    let mut profile = Profile::default();
    profile
        .add("mock".to_string(), provider_spec(&script, &log))
        .unwrap();
    store.save("default", &profile).await.unwrap();

    // First start: cold, probes the provider
    {
        let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
            .await
            .unwrap();
        wait_for_reconcile(&orchestrator).await;
        orchestrator.cleanup().await;
    }

    let frames_after_first = std::fs::read_to_string(&log).unwrap().lines().count();

    // Second start: warm, the provider process is never contacted
    {
        let orchestrator = Orchestrator::initialize(dir.path(), settings(), "default")
            .await
            .unwrap();
        assert!(!orchestrator.is_reconciling());

        let results = orchestrator
            .find("echo the given text back", &FindOptions::default())
            .await;
        assert!(results.iter().any(|r| r.fqtn == "mock:echo_text"));
        orchestrator.cleanup().await;
    }

    let frames_after_second = std::fs::read_to_string(&log).unwrap().lines().count();
    assert_eq!(
        frames_after_first, frames_after_second,
        "warm start must not touch the provider"
    );
}
