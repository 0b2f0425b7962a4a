//! Per-item provenance: why each span made it into the bundle.
//!
//! Evidence is additive. An item surfaced by retrieval and then
//! reached again through a test-of edge carries both records.

use serde::{Deserialize, Serialize};

use crate::types::{EdgeKind, LaneMask};

/// Why an item was included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InclusionReason {
    /// Direct retrieval hit.
    Seed,
    /// Reached through graph traversal.
    GraphExpansion,
    /// Test span attached to an included implementation.
    TestOf,
    /// Route handler resolved for an API-style query.
    RoutesTarget,
    /// Configuration key definition or usage.
    ConfigKey,
}

impl InclusionReason {
    /// Stable string used in bundle JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::GraphExpansion => "graph-expansion",
            Self::TestOf => "test-of",
            Self::RoutesTarget => "routes-target",
            Self::ConfigKey => "config-key",
        }
    }
}

/// One evidence record attached to a bundle item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// File the item lives in.
    pub file: String,
    /// Symbol name, when the span defines one.
    pub symbol: Option<String>,
    /// Why the item was included.
    pub reason: InclusionReason,
    /// Edge kind, when inclusion came via the graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<EdgeKind>,
    /// Retriever rank (1-based), when the item was a seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    /// Fused retrieval score.
    pub score: f64,
    /// Whether any cache served this item along the way (rerank cache,
    /// traversal cache).
    pub cached: bool,
    /// Lanes that contributed to the item's retrieval.
    pub lanes: LaneMask,
}

/// Evidence accumulated over one assembly run, in pack order.
#[derive(Debug, Clone, Default)]
pub struct EvidenceLog {
    records: Vec<EvidenceRecord>,
}

impl EvidenceLog {
    /// New empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records are never merged; the same item may
    /// legitimately appear once per reason.
    pub fn record(&mut self, record: EvidenceRecord) {
        self.records.push(record);
    }

    /// All records, in insertion order.
    pub fn records(&self) -> &[EvidenceRecord] {
        &self.records
    }

    /// Consume into the serialized bundle field.
    pub fn into_records(self) -> Vec<EvidenceRecord> {
        self.records
    }
}
