use chrono::{DateTime, Utc};

use crate::llm::TokenUsage;

/// Top-level Tally error type.
///
/// All fallible operations in `tally-core` return [`Result<T, TallyError>`](Result).
/// Each variant wraps a layer-specific error enum so callers can match on
/// the source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum TallyError {
    /// Error from the `SQLite` store layer.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Error talking to the remote search API.
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Error from the enrichment tier (pattern or inference).
    #[error("Enrichment error: {0}")]
    Enrich(#[from] EnrichError),

    /// A fetched record violated a basic invariant.
    #[error("Data integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error communicating with an LLM provider.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// An insight rule failed to evaluate.
    #[error("Rule {rule} failed: {message}")]
    Rule {
        /// Identifier of the failing rule.
        rule: String,
        /// Description of the failure.
        message: String,
    },
}

impl TallyError {
    /// Whether this error must fail the current sync phase outright.
    pub fn is_fatal_for_sync(&self) -> bool {
        match self {
            Self::Fetch(e) => !e.is_retryable(),
            Self::Integrity(_) | Self::Enrich(_) | Self::Llm(_) | Self::Rule { .. } => false,
            Self::Store(_) | Self::Config(_) => true,
        }
    }
}

impl From<rusqlite::Error> for TallyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// Errors from the SQLite-backed store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema setup failed.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A referenced row was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization of a nested column failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the remote search API.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    /// The shared rate-limit budget is exhausted until `reset_at`.
    #[error("Rate limited until {reset_at}")]
    RateLimited {
        /// When the remote says the budget refills.
        reset_at: DateTime<Utc>,
    },

    /// Connection, timeout, or 5xx failure. Safe to retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Credentials rejected. Requires re-authentication.
    #[error("API auth expired: {0}")]
    AuthExpired(String),

    /// Non-retryable API failure.
    #[error("Remote API error (HTTP {status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Response could not be decoded.
    #[error("Response parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Rate limits and transient failures are retried; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransientNetwork(_))
    }
}

/// Errors from the enrichment tiers. Never escalated to sync state.
#[derive(thiserror::Error, Debug)]
pub enum EnrichError {
    /// The inference provider could not serve the batch; it is deferred.
    #[error("Inference provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider output could not be mapped onto classifications. The call
    /// may still have been billed.
    #[error("Inference response parse error: {message}")]
    Parse {
        message: String,
        usage: TokenUsage,
        cost_usd: f64,
    },
}

impl EnrichError {
    /// An unusable reply that cost nothing.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        }
    }

    /// Usage and cost the failed call was billed for, if any.
    pub fn spend(&self) -> Option<(TokenUsage, f64)> {
        match self {
            Self::Parse {
                usage, cost_usd, ..
            } if *cost_usd > 0.0 || *usage != TokenUsage::default() => Some((*usage, *cost_usd)),
            _ => None,
        }
    }
}

/// A fetched record that fails a basic invariant. Skipped, not fatal.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// `merged_at` precedes `created_at`.
    #[error("{remote_id}: merged before created")]
    MergedBeforeCreated {
        /// Remote identifier of the offending record.
        remote_id: String,
    },

    /// A review event precedes the record's `created_at`.
    #[error("{remote_id}: review submitted before created")]
    ReviewBeforeCreated {
        /// Remote identifier of the offending record.
        remote_id: String,
    },
}

/// Errors in Tally configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Errors from LLM provider interactions.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /// Network-level failure connecting to the LLM provider.
    #[error("Network error: {0}")]
    Network(String),

    /// LLM API returned a non-success HTTP status.
    #[error("API error (HTTP {status}): {body}")]
    ApiError {
        /// HTTP status code from the provider.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// LLM response could not be parsed into the expected format.
    #[error("Response parse error: {0}")]
    Parse(String),

    /// LLM configuration is missing or invalid (API key, model, etc.).
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_retryability() {
        assert!(FetchError::TransientNetwork("reset".into()).is_retryable());
        assert!(
            FetchError::RateLimited {
                reset_at: Utc::now()
            }
            .is_retryable()
        );
        assert!(!FetchError::AuthExpired("401".into()).is_retryable());
        assert!(
            !FetchError::Api {
                status: 422,
                body: "bad query".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn sync_fatality() {
        let auth: TallyError = FetchError::AuthExpired("401".into()).into();
        assert!(auth.is_fatal_for_sync());

        let integrity: TallyError = IntegrityError::MergedBeforeCreated {
            remote_id: "PR_1".into(),
        }
        .into();
        assert!(!integrity.is_fatal_for_sync());

        let transient: TallyError = FetchError::TransientNetwork("timeout".into()).into();
        assert!(!transient.is_fatal_for_sync());
    }

    #[test]
    fn billed_parse_errors_report_spend() {
        assert_eq!(EnrichError::parse("no JSON array").spend(), None);
        assert_eq!(EnrichError::ProviderUnavailable("503".into()).spend(), None);

        let usage = TokenUsage {
            input_tokens: 900,
            output_tokens: 40,
        };
        let billed = EnrichError::Parse {
            message: "expected `,`".into(),
            usage,
            cost_usd: 0.02,
        };
        assert_eq!(billed.spend(), Some((usage, 0.02)));
        assert_eq!(
            billed.to_string(),
            "Inference response parse error: expected `,`"
        );
    }

    #[test]
    fn messages_include_context() {
        let err: TallyError = FetchError::AuthExpired("bad credentials".into()).into();
        assert_eq!(
            err.to_string(),
            "Fetch error: API auth expired: bad credentials"
        );
    }
}
