//! The bundle: the externally stable output contract.
//!
//! Field names and shapes here are consumed by assistants and tooling
//! downstream; changes must stay backward compatible.

use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceRecord;
use crate::stop::{StopReason, StopSummary};

/// Progressive context level of an emitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ContextLevel {
    /// Path + summary + public signatures.
    Capsule = 1,
    /// Symbol definition with signature and nearest doc block.
    Definition = 2,
    /// Smallest enclosing executable span, tests attached.
    Implementation = 3,
    /// Broader file-level fallback.
    Full = 4,
}

impl ContextLevel {
    /// The next cheaper level, if any. Degradation walks this chain.
    pub fn down(&self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::Implementation),
            Self::Implementation => Some(Self::Definition),
            Self::Definition => Some(Self::Capsule),
            Self::Capsule => None,
        }
    }
}

impl From<ContextLevel> for u8 {
    fn from(level: ContextLevel) -> u8 {
        level as u8
    }
}

impl TryFrom<u8> for ContextLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Capsule),
            2 => Ok(Self::Definition),
            3 => Ok(Self::Implementation),
            4 => Ok(Self::Full),
            other => Err(format!("invalid context level {other}")),
        }
    }
}

/// Why one item is in the bundle: seed score plus graph justification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhyIncluded {
    /// Fused retrieval score (0 for pure graph expansions).
    pub seed: f64,
    /// Graph edges that justified inclusion:
    /// `[kind, target, confidence, weight]` tuples.
    pub edges: Vec<EdgeWhy>,
    /// Path of the attached test span, if one was bundled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
}

/// One edge justification tuple, serialized as an array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeWhy(pub String, pub String, pub f64, pub f64);

/// One emitted context item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleItem {
    /// File path.
    pub file: String,
    /// Byte ranges included, `[start, end)` pairs.
    pub spans: Vec<[u32; 2]>,
    /// Context level this item was emitted at.
    pub level: ContextLevel,
    /// Inclusion justification.
    pub why: WhyIncluded,
    /// Rendered text at the emitted level.
    pub content: String,
}

/// Token accounting for one bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenReport {
    /// Requested budget.
    pub budget: u32,
    /// Pre-filter estimate of the packed items.
    pub est_used: u32,
    /// Measured tokens of the emitted items.
    pub actual: u32,
    /// Tokenizer model used for measurement.
    pub model: String,
}

/// The assembled, budget-bounded context bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Bundle identifier, `c_<unix_ms>`.
    pub bundle_id: String,
    /// The query this bundle answers.
    pub query: String,
    /// Token accounting.
    pub token_report: TokenReport,
    /// Ordered items, pack order.
    pub items: Vec<BundleItem>,
    /// Whether an early-stop heuristic declared the bundle sufficient.
    pub satisfied: bool,
    /// Human-readable assembly outcome.
    pub reason: String,
    /// Ordered stopping conditions.
    pub stopping_reasons: Vec<StopReason>,
    /// Run summary (severity counts, tokens, duration).
    pub summary: StopSummary,
    /// Per-item provenance, append order.
    pub evidence: Vec<EvidenceRecord>,
}

impl ContextBundle {
    /// Render the bundle as one text block for direct LLM consumption,
    /// grouping consecutive items by file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut current_file: Option<&str> = None;
        for item in &self.items {
            if current_file != Some(item.file.as_str()) {
                if current_file.is_some() {
                    out.push_str("\n\n");
                }
                out.push_str(&format!("// === {} ===\n", item.file));
                current_file = Some(item.file.as_str());
            }
            out.push_str(&item.content);
            out.push('\n');
        }
        out
    }

    /// Span ids are not carried on items; signatures key off the
    /// byte-range identity instead. Sorted for set semantics.
    pub fn item_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .items
            .iter()
            .flat_map(|item| {
                item.spans
                    .iter()
                    .map(move |range| format!("{}:{}-{}", item.file, range[0], range[1]))
            })
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_serializes_as_number() {
        let json = serde_json::to_value(ContextLevel::Implementation).expect("serialize");
        assert_eq!(json, serde_json::json!(3));
        let back: ContextLevel = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, ContextLevel::Implementation);
    }

    #[test]
    fn test_level_degradation_chain() {
        assert_eq!(ContextLevel::Full.down(), Some(ContextLevel::Implementation));
        assert_eq!(
            ContextLevel::Implementation.down(),
            Some(ContextLevel::Definition)
        );
        assert_eq!(ContextLevel::Definition.down(), Some(ContextLevel::Capsule));
        assert_eq!(ContextLevel::Capsule.down(), None);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let result: Result<ContextLevel, _> = serde_json::from_value(serde_json::json!(9));
        assert!(result.is_err());
    }

    #[test]
    fn test_edge_why_serializes_as_array() {
        let why = EdgeWhy("call".into(), "validateToken".into(), 0.9, 0.09);
        let json = serde_json::to_value(&why).expect("serialize");
        assert_eq!(json, serde_json::json!(["call", "validateToken", 0.9, 0.09]));
    }
}
