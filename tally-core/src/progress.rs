//! Sync progress: the status read model and its reporters.
//!
//! [`ProgressTracker`] derives a [`SyncStatus`] from the persisted resource
//! row; it never writes. The CLI feeds polled statuses to an
//! [`IndicatifReporter`]; library callers can use [`NoopReporter`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::error::StoreError;
use crate::store::SyncStore;
use crate::types::{Percent, ResourceId, SyncPhase, TrackedResource};

/// Snapshot answering "how far along is this resource?".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub resource_id: ResourceId,
    pub resource: String,
    pub phase: SyncPhase,
    pub percent: Percent,
    pub items_done: u64,
    pub items_total: Option<u64>,
    pub error: Option<String>,
    pub last_completed_phase: Option<SyncPhase>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn from_resource(resource: &TrackedResource) -> Self {
        Self {
            resource_id: resource.id,
            resource: resource.slug(),
            phase: resource.sync_phase,
            percent: resource.percent(),
            items_done: resource.completed_items,
            items_total: resource.total_items,
            error: resource.last_error.clone(),
            last_completed_phase: resource.last_completed_phase,
            started_at: resource.started_at,
            completed_at: resource.completed_at,
        }
    }

    /// No further progress will happen without a new trigger.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.phase,
            SyncPhase::NotStarted | SyncPhase::Complete | SyncPhase::Failed
        )
    }
}

/// Read-only view over persisted progress.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn SyncStore>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker").finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, id: ResourceId) -> crate::error::Result<SyncStatus> {
        let resource = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;
        Ok(SyncStatus::from_resource(&resource))
    }
}

/// Receives polled statuses for display.
pub trait ProgressReporter: Send + Sync {
    fn update(&self, status: &SyncStatus);

    /// Mark the tracked run as finished.
    fn finish(&self);

    /// Display an informational message.
    fn message(&self, msg: &str);
}

/// No-op reporter for library callers that don't need progress output.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn update(&self, _status: &SyncStatus) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
}

/// Reporter backed by an `indicatif` bar for CLI use.
///
/// Shows a spinner while the total is unknown and a bounded bar once it is.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::new_spinner(),
        }
    }

    /// A reporter that draws nothing (quiet mode, tests).
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl ProgressReporter for IndicatifReporter {
    fn update(&self, status: &SyncStatus) {
        match status.items_total {
            Some(total) => {
                if self.bar.length() != Some(total) {
                    self.bar.set_style(
                        ProgressStyle::with_template(
                            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({eta})",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                    );
                    self.bar.set_length(total);
                }
            }
            None => {
                self.bar.set_style(
                    ProgressStyle::with_template("{spinner:.green} {msg} {pos} items")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                self.bar.unset_length();
            }
        }
        self.bar.set_position(status.items_done);
        self.bar
            .set_message(format!("{} {}", status.resource, status.phase));
        self.bar.tick();
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }
}
