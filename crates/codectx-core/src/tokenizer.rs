//! Model-aware token counting with a deterministic fallback estimator.
//!
//! Budget correctness depends on these counts, so the same input must
//! produce the same count on every run: cache keys and bundle
//! signatures are derived from token-charged state. When a
//! `tokenizer.json` for the active model is available it is used;
//! otherwise a byte-ratio estimator stands in (code averages ~3 bytes
//! per token, prose ~4).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TokenizerConfig;

/// Broad content class used by the fallback estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextClass {
    /// Source code and other dense token streams.
    Code,
    /// Natural language text.
    Prose,
}

/// Token counter for a single model.
pub struct TokenCounter {
    tokenizer: Option<tokenizers::Tokenizer>,
    model: String,
}

impl TokenCounter {
    /// Build a counter from configuration.
    ///
    /// A missing or unloadable tokenizer file downgrades to the
    /// estimator with a warning; it never fails the caller.
    pub fn new(config: &TokenizerConfig) -> Self {
        let tokenizer = config.tokenizer_path.as_deref().and_then(load_tokenizer);
        if tokenizer.is_none() && config.tokenizer_path.is_some() {
            tracing::warn!(
                model = %config.model,
                "tokenizer file unavailable, falling back to byte estimator"
            );
        }
        Self {
            tokenizer,
            model: config.model.clone(),
        }
    }

    /// Counter that always uses the byte estimator. Used in tests and
    /// wherever model fidelity is not required.
    pub fn estimator(model: &str) -> Self {
        Self {
            tokenizer: None,
            model: model.to_string(),
        }
    }

    /// Model name reported in token accounting.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether a real model tokenizer is loaded.
    pub fn is_model_backed(&self) -> bool {
        self.tokenizer.is_some()
    }

    /// Count tokens in a text.
    pub fn count(&self, text: &str, class: TextClass) -> u32 {
        if text.is_empty() {
            return 0;
        }
        if let Some(tokenizer) = &self.tokenizer {
            match tokenizer.encode(text, false) {
                Ok(encoding) => return encoding.get_ids().len() as u32,
                Err(e) => {
                    tracing::warn!(error = %e, "tokenizer encode failed, using estimator");
                }
            }
        }
        estimate(text.len(), class)
    }

    /// Count tokens of a JSON value in its compact serialized form.
    ///
    /// Structured payloads (edges, bundle items) are charged against
    /// budgets in exactly the shape they would be emitted.
    pub fn count_json(&self, value: &serde_json::Value) -> u32 {
        let serialized = value.to_string();
        self.count(&serialized, TextClass::Code)
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("model", &self.model)
            .field("model_backed", &self.tokenizer.is_some())
            .finish()
    }
}

/// Deterministic byte-ratio estimate: ceil(bytes/3) for code,
/// ceil(bytes/4) for prose.
fn estimate(bytes: usize, class: TextClass) -> u32 {
    let divisor = match class {
        TextClass::Code => 3,
        TextClass::Prose => 4,
    };
    bytes.div_ceil(divisor) as u32
}

fn load_tokenizer(path: &Path) -> Option<tokenizers::Tokenizer> {
    if !path.exists() {
        return None;
    }
    match tokenizers::Tokenizer::from_file(path) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(tokenizer = %path.display(), error = %e, "failed to load tokenizer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimator_code_vs_prose() {
        let counter = TokenCounter::estimator("estimator");
        // 12 bytes: ceil(12/3) = 4 for code, ceil(12/4) = 3 for prose.
        let text = "abcdefghijkl";
        assert_eq!(counter.count(text, TextClass::Code), 4);
        assert_eq!(counter.count(text, TextClass::Prose), 3);
    }

    #[test]
    fn test_estimator_rounds_up() {
        let counter = TokenCounter::estimator("estimator");
        assert_eq!(counter.count("abcd", TextClass::Code), 2); // ceil(4/3)
        assert_eq!(counter.count("abcde", TextClass::Prose), 2); // ceil(5/4)
    }

    #[test]
    fn test_empty_text_is_zero() {
        let counter = TokenCounter::estimator("estimator");
        assert_eq!(counter.count("", TextClass::Code), 0);
        assert_eq!(counter.count_json(&serde_json::json!("")), 1); // "\"\"" is 2 bytes
    }

    #[test]
    fn test_count_is_stable_across_calls() {
        let counter = TokenCounter::estimator("estimator");
        let value = serde_json::json!({"src": "a", "dst": "b", "kind": "call"});
        assert_eq!(counter.count_json(&value), counter.count_json(&value));
    }

    #[test]
    fn test_missing_tokenizer_path_degrades() {
        let config = TokenizerConfig {
            model: "missing-model".into(),
            tokenizer_path: Some(std::path::PathBuf::from("/nonexistent/tokenizer.json")),
        };
        let counter = TokenCounter::new(&config);
        assert!(!counter.is_model_backed());
        assert_eq!(counter.model(), "missing-model");
    }
}
