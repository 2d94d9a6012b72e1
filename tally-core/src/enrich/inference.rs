// Tier 2 enrichment: batched classification by an external inference provider.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{EnrichError, LlmError, TallyError};
use crate::llm::{LlmProvider, TokenUsage};
use crate::types::{ChangeRecord, ChangeRecordId, Classification};

/// One record as submitted to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub id: ChangeRecordId,
    pub summary: String,
}

impl InferenceRequest {
    /// Title, body, touched paths and commit messages, cut at `max_chars`.
    pub fn from_record(record: &ChangeRecord, max_chars: usize) -> Self {
        let change = &record.change;
        let mut summary = format!("Title: {}\n", change.title);
        if let Some(author) = &change.author {
            let _ = writeln!(summary, "Author: {author}");
        }
        if let Some(branch) = &change.head_ref {
            let _ = writeln!(summary, "Branch: {branch}");
        }
        let _ = writeln!(summary, "Size: +{} -{}", change.additions, change.deletions);
        if let Some(body) = change.body.as_deref().filter(|b| !b.trim().is_empty()) {
            let _ = writeln!(summary, "Description:\n{}", body.trim());
        }
        if !change.files.is_empty() {
            summary.push_str("Files:\n");
            for file in &change.files {
                let _ = writeln!(summary, "  {} (+{} -{})", file.path, file.additions, file.deletions);
            }
        }
        if !change.commits.is_empty() {
            summary.push_str("Commits:\n");
            for commit in &change.commits {
                let _ = writeln!(summary, "  {}", commit.message.trim());
            }
        }

        Self {
            id: record.id,
            summary: truncate_chars(&summary, max_chars),
        }
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s.to_string(),
    }
}

/// Provider answer for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutput {
    /// Only ids that were part of the batch. Missing ids stay unenriched.
    pub classifications: Vec<(ChangeRecordId, Classification)>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// The enrichment provider boundary: a batch in, per-record classifications
/// or a batch-level error out.
#[async_trait::async_trait]
pub trait InferenceProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn classify(&self, batch: &[InferenceRequest]) -> Result<InferenceOutput, EnrichError>;
}

/// [`InferenceProvider`] backed by an [`LlmProvider`] prompt.
#[derive(Debug)]
pub struct LlmInferenceProvider {
    llm: Box<dyn LlmProvider>,
}

impl LlmInferenceProvider {
    pub fn new(llm: Box<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl InferenceProvider for LlmInferenceProvider {
    fn name(&self) -> &str {
        self.llm.name()
    }

    #[instrument(
        skip_all,
        name = "inference_batch",
        fields(provider = self.llm.name(), model = self.llm.model_id(), batch = batch.len())
    )]
    async fn classify(&self, batch: &[InferenceRequest]) -> Result<InferenceOutput, EnrichError> {
        let prompt = build_prompt(batch);
        let (text, usage) = self.llm.complete(&prompt).await.map_err(into_enrich_error)?;
        let cost_usd = self.llm.cost(&usage);

        // The reply is billed whether or not it parses.
        let classifications = parse_response(&text, batch).map_err(|e| match e {
            EnrichError::Parse { message, .. } => EnrichError::Parse {
                message,
                usage,
                cost_usd,
            },
            other => other,
        })?;
        debug!(
            returned = classifications.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Inference batch classified"
        );

        Ok(InferenceOutput {
            classifications,
            usage,
            cost_usd,
        })
    }
}

fn into_enrich_error(err: TallyError) -> EnrichError {
    match err {
        TallyError::Llm(LlmError::Parse(msg)) => EnrichError::parse(msg),
        other => EnrichError::ProviderUnavailable(other.to_string()),
    }
}

const TOOL_NAMES: &str = "claude, copilot, cursor, codex, aider, devin, windsurf";
const CATEGORY_NAMES: &str = "frontend, backend, infrastructure, data, docs, tests, ci";

fn build_prompt(batch: &[InferenceRequest]) -> String {
    let mut prompt = format!(
        "Classify each pull request below.\n\
         Decide whether it was written with help from an AI coding tool, which tools \
         (from: {TOOL_NAMES}), and which technology areas it touches (from: {CATEGORY_NAMES}).\n\
         Respond with ONLY a JSON array, one object per pull request:\n\
         [{{\"id\": <id>, \"is_ai_assisted\": true|false, \"tools\": [...], \
         \"confidence\": <0.0-1.0>, \"categories\": [...]}}]\n"
    );
    for request in batch {
        let _ = write!(prompt, "\n--- PR {} ---\n{}\n", request.id, request.summary);
    }
    prompt
}

#[derive(Deserialize)]
struct RawClassification {
    id: i64,
    is_ai_assisted: bool,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    categories: Vec<String>,
}

/// Map the provider's JSON array onto the batch. Unknown and repeated ids are dropped.
pub fn parse_response(
    text: &str,
    batch: &[InferenceRequest],
) -> Result<Vec<(ChangeRecordId, Classification)>, EnrichError> {
    // Models like to wrap JSON in prose or code fences.
    let start = text.find('[');
    let end = text.rfind(']');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err(EnrichError::parse("no JSON array in response")),
    };
    let raw: Vec<RawClassification> =
        serde_json::from_str(json).map_err(|e| EnrichError::parse(e.to_string()))?;

    let mut expected: HashSet<ChangeRecordId> = batch.iter().map(|r| r.id).collect();
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        let id = ChangeRecordId(item.id);
        if !expected.remove(&id) {
            debug!(%id, "Ignoring unexpected id in inference response");
            continue;
        }
        out.push((
            id,
            Classification {
                is_ai_assisted: item.is_ai_assisted,
                tools: normalize(item.tools),
                confidence: item.confidence.map(|c| c.clamp(0.0, 1.0)),
                categories: normalize(item.categories),
            },
        ));
    }
    Ok(out)
}

fn normalize(values: Vec<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}
