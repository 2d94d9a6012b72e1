// Tier 1 enrichment: deterministic signature matching, run inline at upsert time.

use std::collections::BTreeSet;

use crate::types::{Classification, RemoteChange};

/// Textual fingerprints one AI tool leaves on a pull request.
struct ToolSignature {
    tool: &'static str,
    /// Lowercase substrings searched in title, body, and commit messages.
    markers: &'static [&'static str],
    /// Exact (lowercase) author logins.
    bots: &'static [&'static str],
    branch_prefixes: &'static [&'static str],
}

const TOOLS: &[ToolSignature] = &[
    ToolSignature {
        tool: "claude",
        markers: &[
            "co-authored-by: claude",
            "generated with [claude code]",
            "generated with claude code",
            "noreply@anthropic.com",
        ],
        bots: &["claude[bot]", "claude"],
        branch_prefixes: &["claude/"],
    },
    ToolSignature {
        tool: "copilot",
        markers: &[
            "co-authored-by: copilot",
            "copilot-swe-agent",
            "generated by copilot",
        ],
        bots: &["copilot", "copilot-swe-agent", "copilot-swe-agent[bot]"],
        branch_prefixes: &["copilot/"],
    },
    ToolSignature {
        tool: "cursor",
        markers: &[
            "co-authored-by: cursor",
            "cursoragent@cursor.com",
            "generated with cursor",
        ],
        bots: &["cursor[bot]", "cursoragent"],
        branch_prefixes: &["cursor/"],
    },
    ToolSignature {
        tool: "codex",
        markers: &[
            "co-authored-by: codex",
            "chatgpt.com/codex",
            "generated with codex",
        ],
        bots: &["chatgpt-codex-connector[bot]", "codex[bot]"],
        branch_prefixes: &["codex/"],
    },
    ToolSignature {
        tool: "aider",
        markers: &["co-authored-by: aider", "aider: ", "aider.chat"],
        bots: &[],
        branch_prefixes: &["aider/"],
    },
    ToolSignature {
        tool: "devin",
        markers: &["app.devin.ai", "devin-ai-integration", "co-authored-by: devin"],
        bots: &["devin-ai-integration[bot]", "devin-ai-integration"],
        branch_prefixes: &["devin/"],
    },
    ToolSignature {
        tool: "windsurf",
        markers: &[
            "co-authored-by: windsurf",
            "generated with windsurf",
            "co-authored-by: codeium",
        ],
        bots: &["windsurf[bot]"],
        branch_prefixes: &["windsurf/"],
    },
];

/// Path rules, checked in order; the first match categorizes a file.
const CATEGORY_RULES: &[(&str, &[&str], &[&str])] = &[
    // (category, path fragments, file suffixes)
    (
        "ci",
        &[".github/workflows/", ".circleci/", ".buildkite/", ".gitlab-ci"],
        &["jenkinsfile"],
    ),
    (
        "tests",
        &["tests/", "test/", "__tests__/", "spec/", "/test_", "test_"],
        &["_test.go", "_test.rs", ".test.ts", ".test.tsx", ".test.js", ".spec.ts", ".spec.js", "_spec.rb"],
    ),
    ("docs", &["docs/", "doc/"], &[".md", ".mdx", ".rst", ".adoc", ".txt"]),
    (
        "infrastructure",
        &["terraform/", "k8s/", "helm/", "kubernetes/", "ansible/", "deploy/", "infra/"],
        &["dockerfile", "docker-compose.yml", "docker-compose.yaml", ".tf", ".tfvars", ".nix"],
    ),
    (
        "data",
        &["migrations/", "dbt/", "notebooks/"],
        &[".sql", ".ipynb", ".prisma", ".parquet", ".csv"],
    ),
    (
        "frontend",
        &["frontend/", "web/", "ui/", "components/"],
        &[".tsx", ".jsx", ".vue", ".svelte", ".css", ".scss", ".html"],
    ),
    (
        "backend",
        &["server/", "api/", "backend/"],
        &[".rs", ".go", ".py", ".java", ".kt", ".rb", ".php", ".cs", ".ex", ".scala", ".ts", ".js"],
    ),
];

/// Free, deterministic classifier. Its output is a fallback; inference wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternDetector;

impl PatternDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, change: &RemoteChange) -> Classification {
        let tools = detect_tools(change);
        let categories = change
            .files
            .iter()
            .filter_map(|f| categorize_path(&f.path))
            .map(str::to_string)
            .collect();

        Classification {
            is_ai_assisted: !tools.is_empty(),
            tools,
            confidence: None,
            categories,
        }
    }
}

fn detect_tools(change: &RemoteChange) -> BTreeSet<String> {
    let mut text = change.title.to_lowercase();
    if let Some(body) = &change.body {
        text.push('\n');
        text.push_str(&body.to_lowercase());
    }
    for commit in &change.commits {
        text.push('\n');
        text.push_str(&commit.message.to_lowercase());
    }
    let author = change.author.as_deref().map(str::to_lowercase);
    let branch = change.head_ref.as_deref().map(str::to_lowercase);

    TOOLS
        .iter()
        .filter(|sig| {
            sig.markers.iter().any(|m| text.contains(m))
                || author
                    .as_deref()
                    .is_some_and(|a| sig.bots.contains(&a))
                || branch
                    .as_deref()
                    .is_some_and(|b| sig.branch_prefixes.iter().any(|p| b.starts_with(p)))
        })
        .map(|sig| sig.tool.to_string())
        .collect()
}

/// Technology category for one file path, if any rule matches.
pub fn categorize_path(path: &str) -> Option<&'static str> {
    let lower = path.to_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    CATEGORY_RULES
        .iter()
        .find(|(_, fragments, suffixes)| {
            fragments
                .iter()
                .any(|f| lower.starts_with(f) || lower.contains(&format!("/{f}")))
                || suffixes
                    .iter()
                    .any(|s| file_name == *s || file_name.ends_with(s))
        })
        .map(|(category, _, _)| *category)
}
