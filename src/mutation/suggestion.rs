//! Parameter suggestion sources

use super::MutationProposal;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

/// Something that proposes new strategy parameters, typically a model.
#[async_trait]
pub trait SuggestionSource: Send + Sync {
    /// A proposal for `strategy`, or `None` if there is nothing to suggest.
    async fn suggest(
        &self,
        strategy: &str,
        current_params: &Value,
        performance: &Value,
    ) -> Result<Option<MutationProposal>>;
}

/// Hands out pre-loaded proposals in FIFO order per strategy.
#[derive(Default)]
pub struct QueuedSuggestions {
    queue: Mutex<VecDeque<MutationProposal>>,
}

impl QueuedSuggestions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, proposal: MutationProposal) {
        self.queue.lock().await.push_back(proposal);
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl SuggestionSource for QueuedSuggestions {
    async fn suggest(
        &self,
        strategy: &str,
        current_params: &Value,
        _performance: &Value,
    ) -> Result<Option<MutationProposal>> {
        let mut queue = self.queue.lock().await;
        let found = queue
            .iter()
            .position(|p| p.strategy == strategy)
            .and_then(|i| queue.remove(i));
        match &found {
            Some(p) => tracing::info!(strategy, params = ?p.params, "Queued suggestion found"),
            None => tracing::debug!(strategy, current = %current_params, "No queued suggestion"),
        }
        Ok(found)
    }
}

/// POSTs the current parameters, performance data and the proposal schema
/// to a model endpoint. `204 No Content` or a JSON `null` mean no suggestion.
pub struct HttpSuggestionSource {
    client: Client,
    endpoint: url::Url,
    token: Option<SecretString>,
    retry: RetryPolicy,
}

impl HttpSuggestionSource {
    pub fn new(endpoint: &str, token: Option<SecretString>, retry: RetryPolicy) -> Result<Self> {
        let endpoint = endpoint
            .parse()
            .map_err(|e| Error::Config(format!("invalid suggestion endpoint: {}", e)))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint,
            token,
            retry,
        })
    }

    async fn request(&self, body: &Value) -> Result<Option<Value>> {
        let mut req = self.client.post(self.endpoint.clone()).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Transient(format!("suggestion endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(Error::Strategy(format!("suggestion endpoint returned {}", status)));
        }
        let value: Value = resp.json().await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }
}

#[async_trait]
impl SuggestionSource for HttpSuggestionSource {
    async fn suggest(
        &self,
        strategy: &str,
        current_params: &Value,
        performance: &Value,
    ) -> Result<Option<MutationProposal>> {
        let body = json!({
            "strategy": strategy,
            "current_params": current_params,
            "performance": performance,
            "response_schema": MutationProposal::schema(),
        });
        let raw = self
            .retry
            .run("suggestion", |_| self.request(&body))
            .await?;
        raw.map(MutationProposal::from_value).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn proposal(strategy: &str, v: i64) -> MutationProposal {
        MutationProposal {
            strategy: strategy.into(),
            params: BTreeMap::from([("min_profit_bps".to_string(), json!(v))]),
            rationale: "test".into(),
        }
    }

    #[tokio::test]
    async fn queue_is_fifo_per_strategy() {
        let q = QueuedSuggestions::new();
        q.push(proposal("a", 1)).await;
        q.push(proposal("b", 2)).await;
        q.push(proposal("a", 3)).await;

        let got = q.suggest("a", &json!({}), &json!({})).await.unwrap().unwrap();
        assert_eq!(got.params["min_profit_bps"], json!(1));
        let got = q.suggest("a", &json!({}), &json!({})).await.unwrap().unwrap();
        assert_eq!(got.params["min_profit_bps"], json!(3));
        assert!(q.suggest("a", &json!({}), &json!({})).await.unwrap().is_none());
        assert_eq!(q.len().await, 1);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/suggest", addr)
    }

    #[tokio::test]
    async fn http_source_sends_schema_and_validates_reply() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let seen_in = seen.clone();
        let app = Router::new().route(
            "/suggest",
            post(move |Json(body): Json<Value>| {
                let seen = seen_in.clone();
                async move {
                    let strategy = body["strategy"].as_str().unwrap_or_default().to_string();
                    *seen.lock().await = Some(body);
                    match strategy.as_str() {
                        "good" => Json(json!({
                            "strategy": "good",
                            "params": {"min_profit_bps": 40},
                            "rationale": "spread widened"
                        })),
                        "none" => Json(Value::Null),
                        _ => Json(json!({"strategy": "bad", "params": {}})),
                    }
                }
            }),
        );
        let url = serve(app).await;
        let src = HttpSuggestionSource::new(&url, None, RetryPolicy::new(1, Duration::from_millis(1))).unwrap();

        let got = src
            .suggest("good", &json!({"min_profit_bps": 25}), &json!({"cycle": 3}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.params["min_profit_bps"], json!(40));
        let body = seen.lock().await.clone().unwrap();
        assert_eq!(body["current_params"]["min_profit_bps"], 25);
        assert!(body["response_schema"]["properties"]["rationale"].is_object());

        assert!(src.suggest("none", &json!({}), &json!({})).await.unwrap().is_none());
        assert!(matches!(
            src.suggest("bad", &json!({}), &json!({})).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn http_source_retries_server_errors() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_in = hits.clone();
        let app = Router::new().route(
            "/suggest",
            post(move || {
                let hits = hits_in.clone();
                async move {
                    if hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        AxumStatus::SERVICE_UNAVAILABLE
                    } else {
                        AxumStatus::NO_CONTENT
                    }
                }
            }),
        );
        let url = serve(app).await;
        let src = HttpSuggestionSource::new(&url, None, RetryPolicy::new(3, Duration::from_millis(1))).unwrap();

        assert!(src.suggest("x", &json!({}), &json!({})).await.unwrap().is_none());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
