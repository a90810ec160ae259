// kb/client.rs - Coordinator-side KB access
//
//! STORE/GET over the bus from inside a conversation.
//!
//! Each request runs in a sub-tagged conversation id
//! (`<conv>-kbframe-…`, `-kbput-…`, `-kbget-…`) so the dispatcher can route
//! the reply into the conversation's dedicated KB queue without touching the
//! main queue. The timeline read-modify-write lives here too: read latest,
//! append, truncate to the history window, write back with `if_match`, and
//! retry once on conflict before giving up (journaling is best-effort).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::acl::{AclMessage, ONTOLOGY_KB, Performative, new_reply_id, now_ms};
use crate::bus::{BusError, BusSender};
use crate::correlation::{CorrBook, ExpectSpec, bare};

use super::agent::KB_ROLE;

/// Conversation sub-tag for journaled frames
pub const TAG_FRAME: &str = "-kbframe-";
/// Conversation sub-tag for timeline writes
pub const TAG_PUT: &str = "-kbput-";
/// Conversation sub-tag for reads
pub const TAG_GET: &str = "-kbget-";

/// If `conv` is a KB sub-conversation, return the parent conversation id.
pub fn kb_parent(conv: &str) -> Option<&str> {
    for tag in [TAG_GET, TAG_PUT, TAG_FRAME] {
        if let Some(idx) = conv.find(tag) {
            return Some(&conv[..idx]);
        }
    }
    None
}

/// KB client errors
#[derive(Debug, Error)]
pub enum KbClientError {
    #[error("kb reply timed out")]
    Timeout,

    #[error("kb conflict on {0}")]
    Conflict(String),

    #[error("kb not found: {0}")]
    NotFound(String),

    #[error("kb failure: {0}")]
    Failure(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// STORE acknowledgement
#[derive(Debug, Clone)]
pub struct StoredMeta {
    pub key: String,
    pub version: i64,
    pub etag: String,
    pub stored_at: String,
}

/// GET result
#[derive(Debug, Clone)]
pub struct FetchedValue {
    pub key: String,
    pub version: i64,
    pub etag: String,
    pub value: Value,
    pub stored_at: String,
}

/// Per-conversation KB client. Owns the conversation's KB reply queue.
pub struct KbClient {
    sender: BusSender,
    role: String,
    kb_jid: String,
    conv: String,
    rx: mpsc::Receiver<AclMessage>,
    corr: Arc<Mutex<CorrBook>>,
    timeout: Duration,
    seq: u64,
}

impl KbClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: BusSender,
        role: impl Into<String>,
        kb_jid: impl Into<String>,
        conv: impl Into<String>,
        rx: mpsc::Receiver<AclMessage>,
        corr: Arc<Mutex<CorrBook>>,
        timeout: Duration,
    ) -> Self {
        Self {
            sender,
            role: role.into(),
            kb_jid: kb_jid.into(),
            conv: conv.into(),
            rx,
            corr,
            timeout,
            seq: 0,
        }
    }

    /// Journal one frame under `session:<conv>:chat:frame:<now_ms>`
    pub async fn store_frame(&mut self, entry: &Value) -> Result<StoredMeta, KbClientError> {
        let key = format!("session:{}:chat:frame:{}", self.conv, now_ms());
        self.store(TAG_FRAME, &key, entry.clone(), &["kind:frame"], None)
            .await
    }

    /// STORE one value
    pub async fn store(
        &mut self,
        tag: &str,
        key: &str,
        value: Value,
        tags: &[&str],
        if_match: Option<String>,
    ) -> Result<StoredMeta, KbClientError> {
        let mut content = json!({
            "type": "STORE",
            "key": key,
            "content_type": "application/json",
            "value": value,
            "tags": tags,
        });
        if let Some(expected) = if_match {
            content["if_match"] = Value::String(expected);
        }
        let reply = self.request(tag, content).await?;
        match reply.content_type().as_str() {
            "STORED" => Ok(StoredMeta {
                key: reply.content_str("key").unwrap_or(key).to_string(),
                version: reply.content.get("version").and_then(Value::as_i64).unwrap_or(0),
                etag: reply.content_str("etag").unwrap_or_default().to_string(),
                stored_at: reply.content_str("stored_at").unwrap_or_default().to_string(),
            }),
            "FAILURE.CONFLICT" => Err(KbClientError::Conflict(key.to_string())),
            other => Err(KbClientError::Failure(other.to_string())),
        }
    }

    /// GET the latest version of a key
    pub async fn get(&mut self, key: &str) -> Result<FetchedValue, KbClientError> {
        let content = json!({"type": "GET", "key": key});
        let reply = self.request(TAG_GET, content).await?;
        match reply.content_type().as_str() {
            "VALUE" => Ok(FetchedValue {
                key: reply.content_str("key").unwrap_or(key).to_string(),
                version: reply.content.get("version").and_then(Value::as_i64).unwrap_or(0),
                etag: reply.content_str("etag").unwrap_or_default().to_string(),
                value: reply.content.get("value").cloned().unwrap_or(Value::Null),
                stored_at: reply.content_str("stored_at").unwrap_or_default().to_string(),
            }),
            "FAILURE.NOT_FOUND" => Err(KbClientError::NotFound(key.to_string())),
            other => Err(KbClientError::Failure(other.to_string())),
        }
    }

    /// Append an entry to the session timeline, truncated to the last
    /// `history_len` entries. One conflict retry, then the update is lost
    /// on purpose — the next frame extends the timeline against whatever
    /// version won.
    pub async fn append_timeline(
        &mut self,
        entry: Value,
        history_len: usize,
    ) -> Result<StoredMeta, KbClientError> {
        let key = self.timeline_key();
        let mut last_err = KbClientError::Timeout;
        for _attempt in 0..2 {
            let (mut entries, version) = match self.get(&key).await {
                Ok(found) => (
                    found.value.as_array().cloned().unwrap_or_default(),
                    found.version,
                ),
                Err(KbClientError::NotFound(_)) => (Vec::new(), 0),
                Err(e) => return Err(e),
            };
            entries.push(entry.clone());
            let overflow = entries.len().saturating_sub(history_len);
            let tail = entries.split_off(overflow);

            match self
                .store(
                    TAG_PUT,
                    &key,
                    Value::Array(tail),
                    &["kind:timeline"],
                    Some(format!("v{version}")),
                )
                .await
            {
                Ok(meta) => return Ok(meta),
                Err(KbClientError::Conflict(key)) => {
                    debug!(key = %key, "timeline conflict, re-reading");
                    last_err = KbClientError::Conflict(key);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Latest timeline entries; empty on any failure
    pub async fn fetch_timeline(&mut self) -> Vec<Value> {
        let key = self.timeline_key();
        match self.get(&key).await {
            Ok(found) => found.value.as_array().cloned().unwrap_or_default(),
            Err(KbClientError::NotFound(_)) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "timeline fetch failed");
                Vec::new()
            }
        }
    }

    fn timeline_key(&self) -> String {
        format!("session:{}:chat:timeline:main", self.conv)
    }

    async fn request(&mut self, tag: &str, content: Value) -> Result<AclMessage, KbClientError> {
        self.seq += 1;
        let sub_conv = format!("{}{}{}", self.conv, tag, self.seq);
        let reply_id = new_reply_id("kb");

        self.corr.lock().register(
            &sub_conv,
            &reply_id,
            ExpectSpec::from_sender(bare(&self.kb_jid))
                .performatives(&[
                    Performative::Inform,
                    Performative::Failure,
                    Performative::Refuse,
                ])
                .ttl(self.timeout + Duration::from_secs(2))
                .note("kb request"),
        );

        let frame = AclMessage::new(
            Performative::Request,
            self.role.as_str(),
            KB_ROLE,
            content,
        )
        .with_ontology(ONTOLOGY_KB)
        .with_conversation(sub_conv.as_str())
        .with_reply_with(reply_id.as_str());
        self.sender.send(&self.kb_jid, &frame).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KbClientError::Timeout);
            }
            let Ok(next) = tokio::time::timeout(remaining, self.rx.recv()).await else {
                return Err(KbClientError::Timeout);
            };
            let Some(reply) = next else {
                return Err(KbClientError::Timeout);
            };
            if reply.in_reply_to.as_deref() == Some(reply_id.as_str()) {
                return Ok(reply);
            }
            // stale sub-conversation traffic, skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kb_parent_extraction() {
        assert_eq!(kb_parent("sess-1-kbget-4"), Some("sess-1"));
        assert_eq!(kb_parent("sess-1-kbput-2"), Some("sess-1"));
        assert_eq!(kb_parent("sess-1-kbframe-9"), Some("sess-1"));
        assert_eq!(kb_parent("sess-1"), None);
    }
}
