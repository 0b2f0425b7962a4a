//! Pluggable embedding and rerank provider interfaces.
//!
//! The engine never talks to a model directly; it calls these traits
//! and treats failures softly: a 4xx is terminal for the call, a
//! 5xx/timeout is retryable, and either way the affected lane degrades
//! instead of failing the request.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CtxError, CtxResult};

/// Boxed future type used by provider traits, keeping them object-safe.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = CtxResult<T>> + Send + 'a>>;

/// One reranked candidate: index into the submitted document list plus
/// the provider's relevance score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    /// Index into the candidate list as submitted.
    pub index: u32,
    /// Provider relevance score, higher is better.
    pub score: f64,
}

/// Embedding provider: texts in, one fixed-dimension vector per text.
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name used in cache keys and logs.
    fn name(&self) -> &str;

    /// Embed a batch of texts under the given model.
    fn embed<'a>(&'a self, texts: &'a [String], model: &'a str)
        -> ProviderFuture<'a, Vec<Vec<f32>>>;
}

/// Rerank provider: scores documents against a query.
pub trait RerankProvider: Send + Sync {
    /// Provider name used in cache keys and logs.
    fn name(&self) -> &str;

    /// Model identifier used in cache keys.
    fn model(&self) -> &str;

    /// Score up to `top_k` documents against the query. The returned
    /// list is sorted by score descending.
    fn rerank<'a>(
        &'a self,
        query: &'a str,
        documents: &'a [String],
        top_k: usize,
    ) -> ProviderFuture<'a, Vec<RerankScore>>;
}

/// Remote rerank provider speaking a JSON POST protocol.
///
/// Request: `{"model", "query", "documents", "top_n"}`.
/// Response: `{"results": [{"index", "relevance_score"}]}`.
pub struct HttpRerankProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct RerankRequestBody<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponseBody {
    results: Vec<RerankResponseItem>,
}

#[derive(Deserialize)]
struct RerankResponseItem {
    index: u32,
    relevance_score: f64,
}

impl HttpRerankProvider {
    /// Build a provider against an endpoint URL.
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> CtxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CtxError::Config {
                details: format!("rerank HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
        })
    }

    async fn call(&self, query: &str, documents: &[String], top_k: usize) -> CtxResult<Vec<RerankScore>> {
        let body = RerankRequestBody {
            model: &self.model,
            query,
            documents,
            top_n: top_k,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CtxError::Provider {
                provider: "rerank-http".into(),
                message: format!("transport: {e}"),
                // Connection errors and timeouts behave like 5xx.
                retryable: true,
            })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(CtxError::Provider {
                provider: "rerank-http".into(),
                message: format!("HTTP {status}"),
                retryable: false,
            });
        }
        if !status.is_success() {
            return Err(CtxError::Provider {
                provider: "rerank-http".into(),
                message: format!("HTTP {status}"),
                retryable: true,
            });
        }

        let parsed: RerankResponseBody =
            response.json().await.map_err(|e| CtxError::Provider {
                provider: "rerank-http".into(),
                message: format!("malformed response: {e}"),
                retryable: false,
            })?;

        let mut scores: Vec<RerankScore> = parsed
            .results
            .into_iter()
            .map(|r| RerankScore {
                index: r.index,
                score: r.relevance_score,
            })
            .collect();
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        Ok(scores)
    }
}

impl RerankProvider for HttpRerankProvider {
    fn name(&self) -> &str {
        "rerank-http"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn rerank<'a>(
        &'a self,
        query: &'a str,
        documents: &'a [String],
        top_k: usize,
    ) -> ProviderFuture<'a, Vec<RerankScore>> {
        Box::pin(self.call(query, documents, top_k))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted provider doubles for orchestration tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted outcome for one provider call.
    #[derive(Debug, Clone)]
    pub enum ScriptedCall {
        /// Succeed with scores descending from the last document.
        SucceedReversed,
        /// Fail with a retryable (5xx-like) error.
        FailRetryable,
        /// Fail with a terminal (4xx-like) error.
        FailTerminal,
    }

    /// Rerank provider that plays back a script of outcomes.
    pub struct ScriptedRerankProvider {
        script: Vec<ScriptedCall>,
        calls: AtomicUsize,
    }

    impl ScriptedRerankProvider {
        /// Build from a script; calls past the end repeat the last entry.
        pub fn new(script: Vec<ScriptedCall>) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }

        /// Number of calls made so far.
        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RerankProvider for ScriptedRerankProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-v1"
        }

        fn rerank<'a>(
            &'a self,
            _query: &'a str,
            documents: &'a [String],
            top_k: usize,
        ) -> ProviderFuture<'a, Vec<RerankScore>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .get(call)
                .or_else(|| self.script.last())
                .cloned()
                .unwrap_or(ScriptedCall::SucceedReversed);
            let doc_count = documents.len().min(top_k);
            Box::pin(async move {
                match step {
                    ScriptedCall::SucceedReversed => Ok((0..doc_count)
                        .rev()
                        .enumerate()
                        .map(|(rank, index)| RerankScore {
                            index: index as u32,
                            score: 1.0 - rank as f64 * 0.01,
                        })
                        .collect()),
                    ScriptedCall::FailRetryable => Err(CtxError::Provider {
                        provider: "scripted".into(),
                        message: "HTTP 503".into(),
                        retryable: true,
                    }),
                    ScriptedCall::FailTerminal => Err(CtxError::Provider {
                        provider: "scripted".into(),
                        message: "HTTP 400".into(),
                        retryable: false,
                    }),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ScriptedCall, ScriptedRerankProvider};
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_plays_script() {
        let provider = ScriptedRerankProvider::new(vec![
            ScriptedCall::FailRetryable,
            ScriptedCall::SucceedReversed,
        ]);
        let docs = vec!["a".to_string(), "b".to_string()];

        let first = provider.rerank("q", &docs, 10).await;
        assert!(matches!(first, Err(CtxError::Provider { retryable: true, .. })));

        let second = provider.rerank("q", &docs, 10).await.expect("scores");
        assert_eq!(second[0].index, 1);
        assert_eq!(provider.call_count(), 2);
    }
}
