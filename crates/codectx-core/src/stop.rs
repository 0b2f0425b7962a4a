//! Typed stopping conditions and the halt decision.
//!
//! "Stopping" is data, not control flow: stages record conditions as
//! they occur and the assembler consults [`StopLog::should_halt`] at
//! its decision points. Each condition carries a severity, a category,
//! structured values, and actionable recommendations that surface in
//! the bundle.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Severity of a stopping condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Assembly cannot usefully continue.
    High,
    /// Quality or resource pressure worth surfacing.
    Medium,
    /// Informational.
    Low,
}

/// Category of a stopping condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Budget or count limits.
    Resource,
    /// Candidate or bundle quality.
    Quality,
    /// A stage failed outright.
    Error,
    /// Latency and cache behavior.
    Performance,
}

/// The closed set of stopping condition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopKind {
    /// Token budget fully consumed.
    BudgetExhausted,
    /// Token usage crossed the warning fraction.
    BudgetWarning,
    /// Requested count exceeded the configured maximum.
    LimitReached,
    /// A candidate scored below the policy quality threshold.
    QualityThreshold,
    /// A retrieval lane failed.
    SearchFailure,
    /// A cache hit a size boundary.
    CacheBoundary,
    /// Cache hit rate degraded below the expected range.
    CachePerformance,
    /// Traversal hit its node/edge/token limit.
    GraphTraversalLimit,
    /// A stage exceeded its deadline.
    Timeout,
    /// An item was downshifted to a cheaper level.
    DegradationTriggered,
}

impl StopKind {
    /// Severity of this condition.
    pub fn severity(&self) -> Severity {
        match self {
            Self::BudgetExhausted | Self::SearchFailure | Self::Timeout => Severity::High,
            Self::BudgetWarning
            | Self::LimitReached
            | Self::QualityThreshold
            | Self::CachePerformance
            | Self::GraphTraversalLimit
            | Self::DegradationTriggered => Severity::Medium,
            Self::CacheBoundary => Severity::Low,
        }
    }

    /// Category of this condition.
    pub fn category(&self) -> Category {
        match self {
            Self::BudgetExhausted
            | Self::BudgetWarning
            | Self::LimitReached
            | Self::GraphTraversalLimit => Category::Resource,
            Self::QualityThreshold | Self::DegradationTriggered => Category::Quality,
            Self::SearchFailure => Category::Error,
            Self::CacheBoundary | Self::CachePerformance | Self::Timeout => Category::Performance,
        }
    }

    /// Default recommendations attached to this condition.
    pub fn recommendations(&self) -> Vec<String> {
        let items: &[&str] = match self {
            Self::BudgetExhausted => &[
                "raise the token budget",
                "narrow the query to fewer symbols",
            ],
            Self::BudgetWarning => &["consider a higher budget for broader context"],
            Self::LimitReached => &["lower the requested result count"],
            Self::QualityThreshold => &["rephrase the query with more specific identifiers"],
            Self::SearchFailure => &[
                "check provider connectivity",
                "retry; the bundle degraded to the remaining lanes",
            ],
            Self::CacheBoundary => &["raise the cache capacity if this recurs"],
            Self::CachePerformance => &["investigate cache hit rate; queries may be too diverse"],
            Self::GraphTraversalLimit => &[
                "reduce traversal depth",
                "raise the traversal token budget",
            ],
            Self::Timeout => &["raise the request deadline", "narrow the query"],
            Self::DegradationTriggered => &[
                "raise the token budget to keep full implementations",
            ],
        };
        items.iter().map(|s| (*s).to_string()).collect()
    }
}

/// One recorded stopping condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReason {
    /// Condition type.
    #[serde(rename = "type")]
    pub kind: StopKind,
    /// Severity (denormalized for bundle consumers).
    pub severity: Severity,
    /// Category (denormalized for bundle consumers).
    pub category: Category,
    /// Structured condition-specific values.
    pub values: serde_json::Value,
    /// Human-readable explanation.
    pub explanation: String,
    /// What the caller can do about it.
    pub actionable: Vec<String>,
}

impl StopReason {
    /// Build a reason with the kind's default severity, category, and
    /// recommendations.
    pub fn new(kind: StopKind, values: serde_json::Value, explanation: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            category: kind.category(),
            values,
            explanation: explanation.into(),
            actionable: kind.recommendations(),
        }
    }
}

/// Counts and totals summarizing one run's stop log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopSummary {
    /// High-severity condition count.
    pub high: usize,
    /// Medium-severity condition count.
    pub medium: usize,
    /// Low-severity condition count.
    pub low: usize,
    /// Total measured tokens of the emitted bundle.
    pub total_tokens: u32,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
}

/// Ordered stop-reason log for one assembly run.
#[derive(Debug)]
pub struct StopLog {
    reasons: Vec<StopReason>,
    search_failures: u32,
    started: Instant,
}

impl Default for StopLog {
    fn default() -> Self {
        Self::new()
    }
}

impl StopLog {
    /// Start an empty log; the clock for the duration summary starts
    /// now.
    pub fn new() -> Self {
        Self {
            reasons: Vec::new(),
            search_failures: 0,
            started: Instant::now(),
        }
    }

    /// Record a condition, preserving insertion order.
    pub fn record(&mut self, reason: StopReason) {
        if reason.kind == StopKind::SearchFailure {
            self.search_failures += 1;
        }
        tracing::debug!(
            kind = ?reason.kind,
            severity = ?reason.severity,
            "stop reason recorded"
        );
        self.reasons.push(reason);
    }

    /// Whether assembly must halt early: a high-severity condition,
    /// budget exhaustion, or three or more lane failures in one run.
    ///
    /// A single SEARCH_FAILURE does not halt on its own even though it
    /// is high severity: one degraded lane still leaves a usable fused
    /// order, and only repeated failures abandon the run.
    pub fn should_halt(&self) -> bool {
        self.search_failures >= 3
            || self.reasons.iter().any(|r| {
                r.kind == StopKind::BudgetExhausted
                    || (r.severity == Severity::High && r.kind != StopKind::SearchFailure)
            })
    }

    /// Whether a condition of this kind was recorded.
    pub fn contains(&self, kind: StopKind) -> bool {
        self.reasons.iter().any(|r| r.kind == kind)
    }

    /// Reasons recorded so far, in order.
    pub fn reasons(&self) -> &[StopReason] {
        &self.reasons
    }

    /// Summarize the run.
    pub fn summary(&self, total_tokens: u32) -> StopSummary {
        let mut summary = StopSummary {
            total_tokens,
            duration_ms: self.started.elapsed().as_millis() as u64,
            ..StopSummary::default()
        };
        for reason in &self.reasons {
            match reason.severity {
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
            }
        }
        summary
    }

    /// Consume into the serialized bundle field.
    pub fn into_reasons(self) -> Vec<StopReason> {
        self.reasons
    }
}
