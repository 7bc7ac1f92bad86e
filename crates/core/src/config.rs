use std::time::Duration;

use crate::prune::RetentionPolicy;

/// Set to `1` or `true` to let fetches accept a downloaded document whose
/// derived token disagrees with the checksum registry. Emergency use only.
pub const SKIP_CHECKSUM_MISMATCH_ENV: &str = "GRIDHOST_SKIP_CHECKSUM_MISMATCH";

/// Operator-facing configuration of the hosted storage manager.
///
/// Initialized once at boot and read-only thereafter.
#[derive(Clone, Debug)]
pub struct HsmConfig {
    /// Debounce interval between a change notification and the push it
    /// schedules.
    pub seconds_before_push: f64,
    /// Initial backoff after a transient push failure; doubles per attempt.
    pub seconds_before_first_retry: f64,
    /// Retry budget for transient pushes and for download-vs-registry
    /// consistency loops.
    pub retry_attempts: u32,
    /// Whether each successful push also uploads an `updatedAt` record under
    /// the `meta` purpose, for services that poll recency.
    pub push_doc_update_times: bool,
    /// Accept checksum-registry mismatches instead of failing closed.
    pub skip_checksum_mismatch: bool,
    /// Snapshot retention policy.
    pub retention: RetentionPolicy,
    /// Run the pruner after this many successful pushes of a document.
    pub prune_after_pushes: u32,
    /// Global ceiling on concurrent uploads across all documents.
    pub max_parallel_pushes: usize,
    /// Deadline for a single external-storage operation.
    pub storage_timeout_secs: f64,
    /// Refuse document replacements larger than this.
    pub max_import_bytes: Option<u64>,
    /// Refuse attachments larger than this.
    pub max_attachment_bytes: Option<u64>,
    /// Key prefix in the external store, ahead of `<purpose>/<docId>`.
    pub storage_prefix: String,
    /// Worker registration info published to the worker map.
    pub public_url: String,
    pub internal_url: String,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            seconds_before_push: 0.5,
            seconds_before_first_retry: 3.0,
            retry_attempts: 5,
            push_doc_update_times: true,
            skip_checksum_mismatch: false,
            retention: RetentionPolicy::default(),
            prune_after_pushes: 5,
            max_parallel_pushes: 4,
            storage_timeout_secs: 60.0,
            max_import_bytes: None,
            max_attachment_bytes: None,
            storage_prefix: "grist".into(),
            public_url: "http://localhost:8484".into(),
            internal_url: "http://localhost:8484".into(),
        }
    }
}

impl HsmConfig {
    /// Defaults, with overrides applied from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var(SKIP_CHECKSUM_MISMATCH_ENV) {
            config.skip_checksum_mismatch = matches!(v.as_str(), "1" | "true" | "yes");
        }
        config
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.seconds_before_push)
    }

    pub fn first_retry(&self) -> Duration {
        Duration::from_secs_f64(self.seconds_before_first_retry)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.storage_timeout_secs)
    }
}
