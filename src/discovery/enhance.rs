//! Enhancement layer
//!
//! Two curated rule sets composed additively onto similarity scores:
//!
//! - **Capability inference** bridges implicit domains to provider kinds a
//!   plain embedding match cannot see ("commit my changes" says nothing
//!   about shells, yet a shell provider can run git).
//! - **Intent resolution** maps natural-language intents to the operation
//!   lemmas tool authors actually use ("save my changes" → commit).
//!
//! Every boost carries a human-readable reason that surfaces in `find`
//! results.

/// What kind of provider a spec looks like, inferred from its command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Shell/terminal executors
    Shell,
    /// File and directory access
    Filesystem,
    /// SQL or document databases
    Database,
    /// HTTP/web fetchers
    Http,
    /// Dedicated version-control providers
    VersionControl,
    /// Container/runtime management
    Container,
    /// Web or corpus search
    Search,
    /// Knowledge/memory stores
    Memory,
    /// Anything else
    Other,
}

/// A score boost with its justification
#[derive(Debug, Clone, PartialEq)]
pub struct Boost {
    /// Additive score amount
    pub amount: f64,
    /// Rule confidence (0..1)
    pub confidence: f64,
    /// Human-readable reason shown in results
    pub reason: &'static str,
}

/// Candidate facts the enhancement layer looks at
#[derive(Debug, Clone)]
pub struct EnhanceCandidate<'a> {
    /// Raw tool name
    pub tool_name: &'a str,
    /// Tool description
    pub description: &'a str,
    /// Inferred provider kind
    pub kind: ProviderKind,
}

/// Classify a provider by its command line and name.
///
/// The command basename is the strongest signal; the provider's profile
/// name breaks ties for wrappers like `npx`.
#[must_use]
pub fn classify_provider(name: &str, command: &str, args: &[String]) -> ProviderKind {
    let basename = command
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(command)
        .to_lowercase();
    let haystack = format!(
        "{} {} {}",
        name.to_lowercase(),
        basename,
        args.join(" ").to_lowercase()
    );

    let matches_any = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if matches!(basename.as_str(), "bash" | "sh" | "zsh" | "fish" | "pwsh")
        || matches_any(&["shell", "terminal", "command-runner"])
    {
        ProviderKind::Shell
    } else if matches_any(&["git", "mercurial", "svn"]) {
        ProviderKind::VersionControl
    } else if matches_any(&["filesystem", "file-server", "fs-server"]) {
        ProviderKind::Filesystem
    } else if matches_any(&[
        "postgres", "psql", "mysql", "sqlite", "mongo", "redis", "database",
    ]) {
        ProviderKind::Database
    } else if matches_any(&["docker", "podman", "kubectl", "container"]) {
        ProviderKind::Container
    } else if matches_any(&["fetch", "http", "curl", "browser", "puppeteer"]) {
        ProviderKind::Http
    } else if matches_any(&["search", "brave", "tavily", "exa"]) {
        ProviderKind::Search
    } else if matches_any(&["memory", "knowledge", "vector"]) {
        ProviderKind::Memory
    } else {
        ProviderKind::Other
    }
}

/// Capability-inference rule: an implicit domain in the query makes tools
/// from matching provider kinds viable even without lexical overlap.
struct CapabilityRule {
    surface: &'static [&'static str],
    kinds: &'static [ProviderKind],
    confidence: f64,
    boost: f64,
    reason: &'static str,
}

const CAPABILITY_RULES: &[CapabilityRule] = &[
    CapabilityRule {
        surface: &["commit", "branch", "merge", "rebase", "push", "pull request", "git", "stash"],
        kinds: &[ProviderKind::Shell, ProviderKind::VersionControl],
        confidence: 0.85,
        boost: 0.25,
        reason: "can run version-control operations",
    },
    CapabilityRule {
        surface: &["install package", "npm", "pip ", "cargo ", "dependencies", "build the project"],
        kinds: &[ProviderKind::Shell],
        confidence: 0.75,
        boost: 0.2,
        reason: "can run package-manager and build commands",
    },
    CapabilityRule {
        surface: &["file", "directory", "folder", "path"],
        kinds: &[ProviderKind::Filesystem, ProviderKind::Shell],
        confidence: 0.6,
        boost: 0.1,
        reason: "operates on files and directories",
    },
    CapabilityRule {
        surface: &["sql", "query the database", "table", "record", "rows"],
        kinds: &[ProviderKind::Database],
        confidence: 0.8,
        boost: 0.2,
        reason: "executes database queries",
    },
    CapabilityRule {
        surface: &["website", "webpage", "url", "download", "api endpoint"],
        kinds: &[ProviderKind::Http],
        confidence: 0.7,
        boost: 0.15,
        reason: "fetches web resources",
    },
    CapabilityRule {
        surface: &["container", "docker", "image", "deploy"],
        kinds: &[ProviderKind::Container, ProviderKind::Shell],
        confidence: 0.7,
        boost: 0.15,
        reason: "manages containers and deployments",
    },
    CapabilityRule {
        surface: &["remember", "recall", "note down", "what did i"],
        kinds: &[ProviderKind::Memory],
        confidence: 0.65,
        boost: 0.15,
        reason: "stores and recalls knowledge",
    },
];

/// Intent-resolution rule: a natural-language intent resolves to operation
/// lemmas; candidates whose name or description carries a lemma get the
/// boost.
struct IntentRule {
    surface: &'static [&'static str],
    lemmas: &'static [&'static str],
    boost: f64,
    reason: &'static str,
}

const INTENT_RULES: &[IntentRule] = &[
    IntentRule {
        surface: &["save my changes", "save changes", "check in", "checkpoint my work"],
        lemmas: &["commit", "run_command", "exec"],
        boost: 0.2,
        reason: "intent resolves to commit-class operations",
    },
    IntentRule {
        surface: &["store", "save the data", "persist", "keep track of"],
        lemmas: &["insert", "write", "create", "upsert", "put"],
        boost: 0.15,
        reason: "intent resolves to insert-class operations",
    },
    IntentRule {
        surface: &["look up", "find out", "what is", "show me"],
        lemmas: &["search", "query", "get", "read", "list"],
        boost: 0.1,
        reason: "intent resolves to lookup-class operations",
    },
    IntentRule {
        surface: &["delete", "remove", "get rid of", "clean up"],
        lemmas: &["delete", "remove", "drop", "rm"],
        boost: 0.15,
        reason: "intent resolves to delete-class operations",
    },
    IntentRule {
        surface: &["update", "change", "modify", "edit"],
        lemmas: &["update", "edit", "patch", "write", "set"],
        boost: 0.1,
        reason: "intent resolves to update-class operations",
    },
];

/// Compute all enhancement boosts for one candidate against a query.
///
/// Deterministic: rules are evaluated in declaration order and matching is
/// pure string containment over the lowercased query.
#[must_use]
pub fn enhancement_boosts(query: &str, candidate: &EnhanceCandidate<'_>) -> Vec<Boost> {
    let query_lower = query.to_lowercase();
    let name_lower = candidate.tool_name.to_lowercase();
    let desc_lower = candidate.description.to_lowercase();

    let mut boosts = Vec::new();

    for rule in CAPABILITY_RULES {
        let surface_hit = rule.surface.iter().any(|s| query_lower.contains(s));
        let kind_hit = rule.kinds.contains(&candidate.kind);
        if surface_hit && kind_hit {
            boosts.push(Boost {
                amount: rule.boost * rule.confidence,
                confidence: rule.confidence,
                reason: rule.reason,
            });
        }
    }

    for rule in INTENT_RULES {
        let surface_hit = rule.surface.iter().any(|s| query_lower.contains(s));
        let lemma_hit = rule
            .lemmas
            .iter()
            .any(|l| name_lower.contains(l) || desc_lower.contains(l));
        if surface_hit && lemma_hit {
            boosts.push(Boost {
                amount: rule.boost,
                confidence: 1.0,
                reason: rule.reason,
            });
        }
    }

    boosts
}

/// Sum of boost amounts
#[must_use]
pub fn total_boost(boosts: &[Boost]) -> f64 {
    boosts.iter().map(|b| b.amount).sum()
}
