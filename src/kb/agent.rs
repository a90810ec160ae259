// kb/agent.rs - Knowledge Base agent
//
//! The KB as a bus citizen: it answers `MAS.KB` STORE/GET requests from the
//! single whitelisted writer and refuses everyone else. It also registers
//! itself at the DF (over `MAS.DF`) and heartbeats like any other service
//! agent, so clients may discover it.

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::acl::{AclMessage, ONTOLOGY_DF, ONTOLOGY_KB, Performative};
use crate::bus::{Delivery, Endpoint};
use crate::config::PlatformConfig;
use crate::correlation::bare;
use crate::observability::{
    KbGetOutcome, KbStoreOutcome, record_kb_get, record_kb_latency, record_kb_store,
    record_message_received,
};
use crate::platform::{AgentProfile, register_with_df, spawn_heartbeat};

use super::store::{KbStore, StoreError, StoreRequest};

/// Role name the KB answers under
pub const KB_ROLE: &str = "KB";

/// The KB agent loop
pub struct KbAgent {
    endpoint: Endpoint,
    store: KbStore,
    /// Bare identity of the only permitted writer (the coordinator)
    allowed_writer: String,
    df_jid: Option<String>,
    heartbeat: Duration,
}

impl KbAgent {
    pub fn new(
        endpoint: Endpoint,
        store: KbStore,
        allowed_writer: impl Into<String>,
        cfg: &PlatformConfig,
    ) -> Self {
        Self {
            endpoint,
            store,
            allowed_writer: allowed_writer.into(),
            df_jid: None,
            heartbeat: cfg.heartbeat(),
        }
    }

    /// Register and heartbeat at this DF on startup
    pub fn with_df(mut self, df_jid: impl Into<String>) -> Self {
        self.df_jid = Some(df_jid.into());
        self
    }

    pub async fn run(mut self) {
        info!(
            jid = self.endpoint.jid(),
            writer = %self.allowed_writer,
            "KB started"
        );

        if let Some(df_jid) = self.df_jid.clone() {
            let profile = AgentProfile::new(self.endpoint.jid())
                .with_capability("KB_STORE")
                .with_description("append-only versioned knowledge base");
            if let Err(e) = register_with_df(
                &self.endpoint.sender(),
                &df_jid,
                KB_ROLE,
                &profile,
                ONTOLOGY_DF,
            )
            .await
            {
                warn!(error = %e, "KB registration failed");
            }
            let _heartbeat = spawn_heartbeat(
                self.endpoint.sender(),
                df_jid,
                KB_ROLE.to_string(),
                self.endpoint.jid().to_string(),
                self.heartbeat,
                ONTOLOGY_DF.to_string(),
            );
        }

        while let Some(delivery) = self.endpoint.recv().await {
            self.handle(delivery).await;
        }
    }

    async fn handle(&mut self, delivery: Delivery) {
        let from = bare(&delivery.from).to_string();
        let acl = match AclMessage::from_json(&delivery.body) {
            Ok(acl) => acl,
            Err(e) => {
                debug!(from = %from, error = %e, "KB received malformed frame");
                let nack = AclMessage::new(
                    Performative::Failure,
                    KB_ROLE,
                    from.as_str(),
                    json!({"type": "FAILURE.INVALID_JSON", "error": e.to_string()}),
                )
                .with_ontology(ONTOLOGY_KB);
                self.send(&from, &nack).await;
                return;
            }
        };
        record_message_received(acl.performative.as_str());

        // acks from the DF and other non-request traffic
        if acl.performative != Performative::Request {
            return;
        }

        if from != self.allowed_writer {
            warn!(from = %from, "KB refusing unauthorized writer");
            let refuse = acl
                .reply(
                    Performative::Refuse,
                    KB_ROLE,
                    json!({"type": "REFUSE.UNAUTHORIZED", "writer": self.allowed_writer}),
                )
                .with_ontology(ONTOLOGY_KB);
            self.send(&from, &refuse).await;
            return;
        }

        let reply = match acl.content_type().as_str() {
            "STORE" => self.do_store(&acl, &from).await,
            "GET" => self.do_get(&acl).await,
            other => {
                debug!(ctype = other, "KB unsupported content type");
                acl.reply(
                    Performative::Refuse,
                    KB_ROLE,
                    json!({"type": "REFUSE.UNSUPPORTED_TYPE", "got": other}),
                )
            }
        };
        self.send(&from, &reply.with_ontology(ONTOLOGY_KB)).await;
    }

    async fn do_store(&self, acl: &AclMessage, from: &str) -> AclMessage {
        let key = acl.content_str("key").unwrap_or_default().to_string();
        let request = StoreRequest {
            key: key.clone(),
            content_type: acl
                .content_str("content_type")
                .unwrap_or("application/json")
                .to_string(),
            value: acl.content.get("value").cloned().unwrap_or(Value::Null),
            tags: acl
                .content
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            created_by: from.to_string(),
            if_match: acl.content_str("if_match").map(str::to_string),
        };

        let started = Instant::now();
        let result = self.store.store(request).await;
        record_kb_latency("store", started.elapsed());

        match result {
            Ok(item) => {
                record_kb_store(KbStoreOutcome::Ok);
                acl.reply(
                    Performative::Inform,
                    KB_ROLE,
                    json!({
                        "type": "STORED",
                        "key": item.key,
                        "version": item.version,
                        "etag": item.etag,
                        "stored_at": item.created_at,
                    }),
                )
            }
            Err(StoreError::InvalidKey(_)) => {
                record_kb_store(KbStoreOutcome::Fail);
                acl.reply(
                    Performative::Failure,
                    KB_ROLE,
                    json!({"type": "FAILURE.INVALID_KEY", "key": key}),
                )
            }
            Err(StoreError::Conflict { found, expected, .. }) => {
                record_kb_store(KbStoreOutcome::Conflict);
                acl.reply(
                    Performative::Failure,
                    KB_ROLE,
                    json!({
                        "type": "FAILURE.CONFLICT",
                        "key": key,
                        "if_match": expected,
                        "current_version": found,
                    }),
                )
            }
            Err(e) => {
                record_kb_store(KbStoreOutcome::Fail);
                warn!(error = %e, key = %key, "KB store failed");
                acl.reply(
                    Performative::Failure,
                    KB_ROLE,
                    json!({"type": "FAILURE.EXCEPTION", "error": e.to_string()}),
                )
            }
        }
    }

    async fn do_get(&self, acl: &AclMessage) -> AclMessage {
        let key = acl.content_str("key").unwrap_or_default().to_string();
        let version = acl.content.get("version").and_then(Value::as_i64);
        let as_of = acl.content_str("as_of").map(str::to_string);

        let started = Instant::now();
        let result = self.store.get(&key, version, as_of).await;
        record_kb_latency("get", started.elapsed());

        match result {
            Ok(item) => {
                record_kb_get(KbGetOutcome::Ok);
                acl.reply(
                    Performative::Inform,
                    KB_ROLE,
                    json!({
                        "type": "VALUE",
                        "key": item.key,
                        "version": item.version,
                        "etag": item.etag,
                        "content_type": item.content_type,
                        "value": item.value,
                        "stored_at": item.created_at,
                    }),
                )
            }
            Err(StoreError::NotFound(_)) => {
                record_kb_get(KbGetOutcome::NotFound);
                acl.reply(
                    Performative::Failure,
                    KB_ROLE,
                    json!({"type": "FAILURE.NOT_FOUND", "key": key}),
                )
            }
            Err(StoreError::InvalidKey(_)) => {
                record_kb_get(KbGetOutcome::Fail);
                acl.reply(
                    Performative::Failure,
                    KB_ROLE,
                    json!({"type": "FAILURE.INVALID_KEY", "key": key}),
                )
            }
            Err(e) => {
                record_kb_get(KbGetOutcome::Fail);
                warn!(error = %e, key = %key, "KB get failed");
                acl.reply(
                    Performative::Failure,
                    KB_ROLE,
                    json!({"type": "FAILURE.EXCEPTION", "error": e.to_string()}),
                )
            }
        }
    }

    async fn send(&self, to: &str, frame: &AclMessage) {
        if let Err(e) = self.endpoint.send(to, frame).await {
            warn!(error = %e, to, "KB failed to send reply");
        }
    }
}
