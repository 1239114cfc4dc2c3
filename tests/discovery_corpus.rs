//! Ranking quality over a curated corpus shaped like a real profile.

use std::collections::BTreeMap;

use serde_json::json;

use ncp_gateway::cache::{MetadataStore, ProviderEntry, content_hash};
use ncp_gateway::config::Settings;
use ncp_gateway::discovery::FindOptions;
use ncp_gateway::orchestrator::Orchestrator;
use ncp_gateway::profile::{Profile, ProfileStore, ProviderSpec};
use ncp_gateway::protocol::Tool;

fn spec(command: &str) -> ProviderSpec {
    ProviderSpec {
        command: command.to_string(),
        args: vec![],
        env: BTreeMap::new(),
        provenance: None,
    }
}

fn tool(name: &str, description: &str) -> Tool {
    Tool {
        name: name.to_string(),
        title: None,
        description: Some(description.to_string()),
        input_schema: json!({"type": "object", "properties": {}}),
    }
}

/// A profile shaped like a real workstation: filesystem, shell, database,
/// web, search, memory.
fn corpus() -> Vec<(&'static str, &'static str, Vec<Tool>)> {
    vec![
        (
            "filesystem",
            "mcp-filesystem",
            vec![
                tool("read_file", "Read the complete contents of a file from the file system"),
                tool("write_file", "Create a new file or overwrite an existing file with new contents"),
                tool("list_directory", "List all files and directories in a given path"),
                tool("move_file", "Move or rename a file or directory"),
            ],
        ),
        (
            "shell",
            "bash-server",
            vec![tool("run_command", "Run a shell command and return its output")],
        ),
        (
            "postgres",
            "postgres-mcp",
            vec![
                tool("query", "Execute a read-only SQL query against the database"),
                tool("insert_record", "Insert a record into a database table"),
            ],
        ),
        (
            "web",
            "mcp-fetch",
            vec![tool("fetch_url", "Fetch the contents of a URL and return it as text")],
        ),
        (
            "search",
            "brave-search",
            vec![tool("web_search", "Search the web and return relevant results")],
        ),
        (
            "memory",
            "mcp-memory",
            vec![
                tool("store_memory", "Store a note in the knowledge graph for later recall"),
                tool("recall_memory", "Recall previously stored notes from the knowledge graph"),
            ],
        ),
    ]
}

async fn corpus_orchestrator(
    data_dir: &std::path::Path,
) -> std::sync::Arc<Orchestrator> {
    let store = ProfileStore::new(data_dir);
    let mut profile = Profile::default();
    for (name, command, _) in corpus() {
        profile.add(name.to_string(), spec(command)).unwrap();
    }
    store.save("default", &profile).await.unwrap();

    let metadata = MetadataStore::open(&data_dir.join("cache")).await;
    let mut expected = 0;
    for (name, command, tools) in corpus() {
        expected += tools.len();
        let entry = ProviderEntry::new(tools, vec![], vec![], None, content_hash(&spec(command)));
        metadata.patch_add(name, entry).await.unwrap();
    }
    metadata
        .commit_profile_hash(&profile.content_hash())
        .await
        .unwrap();
    drop(metadata);

    let settings = Settings {
        spawn_timeout_secs: 1,
        call_timeout_secs: 1,
        ..Settings::default()
    };
    let orchestrator = Orchestrator::initialize(data_dir, settings, "default")
        .await
        .unwrap();

    // Wait for the embedding backfill to cover the whole corpus; the store
    // loads a snapshot at open time, so reopen per poll.
    for _ in 0..500 {
        let embeddings =
            ncp_gateway::cache::EmbeddingStore::open(&data_dir.join("cache")).await;
        if embeddings.len().await >= expected {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    orchestrator
}

async fn top_k(orchestrator: &Orchestrator, query: &str, k: usize) -> Vec<String> {
    orchestrator
        .find(
            query,
            &FindOptions {
                limit: k,
                ..FindOptions::default()
            },
        )
        .await
        .into_iter()
        .map(|r| r.fqtn)
        .collect()
}

#[tokio::test]
async fn intended_tools_rank_in_top_five() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = corpus_orchestrator(dir.path()).await;

    let cases = [
        ("read the complete contents of a file", "filesystem:read_file"),
        ("create a new file with contents", "filesystem:write_file"),
        ("list all files in a path", "filesystem:list_directory"),
        ("run a shell command", "shell:run_command"),
        ("execute a sql query against the database", "postgres:query"),
        ("fetch the contents of a url", "web:fetch_url"),
        ("search the web for results", "search:web_search"),
        ("store a note for later recall", "memory:store_memory"),
    ];

    for (query, expected) in cases {
        let top = top_k(&orchestrator, query, 5).await;
        assert!(
            top.iter().any(|f| f == expected),
            "query {query:?}: expected {expected} in top 5, got {top:?}"
        );
    }

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn commit_intent_bridges_to_the_shell_provider() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = corpus_orchestrator(dir.path()).await;

    let results = orchestrator
        .find("commit my changes", &FindOptions::default())
        .await;
    let position = results
        .iter()
        .position(|r| r.fqtn == "shell:run_command")
        .expect("shell:run_command must be ranked");
    assert!(position < 3, "expected top 3, got position {position}");
    assert!(
        results[position]
            .reasons
            .iter()
            .any(|reason| reason.contains("version-control")),
        "enhancement reason must mention version-control operations"
    );

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn store_intent_prefers_insert_class_operations() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = corpus_orchestrator(dir.path()).await;

    let top = top_k(&orchestrator, "store customer data in the database", 5).await;
    assert!(
        top.iter()
            .any(|f| f == "postgres:insert_record" || f == "postgres:query"),
        "expected a database tool in top 5, got {top:?}"
    );

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn confidence_threshold_filters_weak_matches() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = corpus_orchestrator(dir.path()).await;

    let strict = orchestrator
        .find(
            "read the complete contents of a file",
            &FindOptions {
                confidence_threshold: Some(0.9),
                ..FindOptions::default()
            },
        )
        .await;
    let relaxed = orchestrator
        .find(
            "read the complete contents of a file",
            &FindOptions {
                confidence_threshold: Some(0.05),
                ..FindOptions::default()
            },
        )
        .await;
    assert!(strict.len() <= relaxed.len());

    orchestrator.cleanup().await;
}

#[tokio::test]
async fn results_are_ordered_by_descending_confidence() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = corpus_orchestrator(dir.path()).await;

    let results = orchestrator
        .find(
            "read the complete contents of a file",
            &FindOptions {
                limit: 10,
                ..FindOptions::default()
            },
        )
        .await;
    for pair in results.windows(2) {
        assert!(
            pair[0].confidence >= pair[1].confidence,
            "results must be sorted by confidence"
        );
    }

    orchestrator.cleanup().await;
}
