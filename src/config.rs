use serde::Deserialize;
use std::num::NonZeroUsize;

/// What an invocation does when an element cannot be produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort on the first failure: stages not yet started are skipped, running
    /// ones stop invoking run bodies, and the failure is returned as an error.
    #[default]
    FailFast,
    /// Keep going: failed elements are left out of the results and reported
    /// next to them.
    BestEffort,
}

/// Engine configuration.
///
/// Deserializable, e.g. from `{"workers": 4, "failure-policy": "best-effort"}`;
/// missing fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Size of a dedicated worker pool. `None` runs on the global rayon pool.
    pub workers: Option<NonZeroUsize>,
    /// Reaction to element failures.
    pub failure_policy: FailurePolicy,
    /// Whether structurally identical subplans are computed once.
    pub factorize: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            failure_policy: FailurePolicy::default(),
            factorize: true,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON configuration document.
    ///
    /// # Errors
    /// Malformed JSON, unknown fields or invalid values.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Runs invocations on a dedicated pool of `workers` threads.
    #[must_use]
    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Enables or disables factorization.
    #[must_use]
    pub fn with_factorize(mut self, factorize: bool) -> Self {
        self.factorize = factorize;
        self
    }
}
