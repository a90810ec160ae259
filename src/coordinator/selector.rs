// coordinator/selector.rs - Specialist selection
//
//! The external Selector chooses among DF candidates; when it declines,
//! errs or picks outside the candidate set, the deterministic
//! [`fallback_select`] takes over. The core never couples to a concrete
//! language-model vendor: anything implementing [`Selector`] plugs in.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Selector errors
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("selector returned no choice")]
    NoChoice,
}

/// Input handed to the selector: the conversation, the requirement, the DF
/// snapshot and the journaled history.
#[derive(Debug, Clone, Serialize)]
pub struct SelectorInput {
    pub conversation_id: String,
    pub required_capability: String,
    pub df_timestamp: Option<String>,
    pub fipa_request: Value,
    pub candidates: Vec<Value>,
    pub history: Vec<Value>,
}

/// Selector verdict
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorChoice {
    pub selected_jid: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

/// A pure function from selector input to a choice
#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(&self, input: &SelectorInput) -> Result<SelectorChoice, SelectorError>;
}

/// Always declines; every conversation goes through the fallback
pub struct NoSelector;

#[async_trait]
impl Selector for NoSelector {
    async fn select(&self, _input: &SelectorInput) -> Result<SelectorChoice, SelectorError> {
        Err(SelectorError::NoChoice)
    }
}

/// In-process selector for tests and embedding
pub struct FnSelector<F>(pub F);

#[async_trait]
impl<F> Selector for FnSelector<F>
where
    F: Fn(&SelectorInput) -> Option<SelectorChoice> + Send + Sync,
{
    async fn select(&self, input: &SelectorInput) -> Result<SelectorChoice, SelectorError> {
        (self.0)(input).ok_or(SelectorError::NoChoice)
    }
}

/// External selector service: POST the input JSON, read the choice JSON.
/// Transient failures are retried a bounded number of times with a fixed
/// pause.
pub struct HttpSelector {
    client: reqwest::Client,
    url: String,
    attempts: u32,
    pause: Duration,
}

impl HttpSelector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            attempts: 5,
            pause: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, attempts: u32, pause: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.pause = pause;
        self
    }
}

#[async_trait]
impl Selector for HttpSelector {
    async fn select(&self, input: &SelectorInput) -> Result<SelectorChoice, SelectorError> {
        let mut last_err = SelectorError::NoChoice;
        for attempt in 1..=self.attempts {
            let sent = self
                .client
                .post(&self.url)
                .json(input)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            match sent {
                Ok(response) => match response.json::<SelectorChoice>().await {
                    Ok(choice) => return Ok(choice),
                    Err(e) => {
                        warn!(error = %e, "selector returned unparseable choice");
                        return Err(SelectorError::NoChoice);
                    }
                },
                Err(e) => {
                    debug!(attempt, error = %e, "selector call failed");
                    last_err = SelectorError::Http(e);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.pause).await;
            }
        }
        Err(last_err)
    }
}

fn jid_of(candidate: &Value) -> Option<&str> {
    candidate.get("jid").and_then(Value::as_str)
}

fn status_is_serving(candidate: &Value) -> bool {
    matches!(
        candidate.get("status").and_then(Value::as_str),
        Some("online") | Some("available") | Some("ready")
    )
}

fn advertises(candidate: &Value, capability: &str) -> bool {
    candidate
        .get("capabilities")
        .and_then(Value::as_array)
        .is_some_and(|caps| {
            caps.iter()
                .filter_map(Value::as_str)
                .any(|cap| cap.eq_ignore_ascii_case(capability))
        })
}

/// Deterministic selection when the Selector produced no valid choice.
///
/// Preference tiers: serving candidates advertising the capability, then
/// merely serving candidates, then everyone. Ties break on jid ordering, so
/// the result is a total function of the candidate set.
pub fn fallback_select(candidates: &[Value], required_capability: &str) -> Option<String> {
    let jids = |filter: &dyn Fn(&Value) -> bool| -> Vec<&str> {
        let mut hits: Vec<&str> = candidates
            .iter()
            .filter(|c| filter(c))
            .filter_map(jid_of)
            .collect();
        hits.sort_unstable();
        hits
    };

    let tier1 = jids(&|c: &Value| status_is_serving(c) && advertises(c, required_capability));
    if let Some(first) = tier1.first() {
        return Some((*first).to_string());
    }
    let tier2 = jids(&status_is_serving);
    if let Some(first) = tier2.first() {
        return Some((*first).to_string());
    }
    jids(&|_| true).first().map(|jid| (*jid).to_string())
}
