// agents/specialist.rs - Specialist worker adapter
//
//! The minimum contract a worker agent fulfills: register at the DF,
//! heartbeat, and answer `REQUEST.ASK_EXPERT` with an immediate AGREE
//! followed by the terminal `INFORM.RESULT`. The actual expertise is a
//! pluggable [`ExpertLogic`] hook; the core treats the answer as opaque.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::acl::{AclMessage, ONTOLOGY_CORE, Performative};
use crate::bus::{Delivery, Endpoint};
use crate::config::PlatformConfig;
use crate::correlation::bare;
use crate::observability::record_message_received;
use crate::platform::{AgentProfile, register_with_df, spawn_heartbeat};

/// Role name specialists speak under
pub const SPECIALIST_ROLE: &str = "Specialist";

/// Worker logic hook. Answers are opaque to the control plane.
#[async_trait]
pub trait ExpertLogic: Send + Sync {
    async fn answer(&self, question: &str, history: &[Value]) -> anyhow::Result<String>;
}

/// Trivial logic for demos and tests: echoes the question back.
pub struct EchoExpert;

#[async_trait]
impl ExpertLogic for EchoExpert {
    async fn answer(&self, question: &str, _history: &[Value]) -> anyhow::Result<String> {
        Ok(format!("Echo: {question}"))
    }
}

/// A specialist agent bound to one bus identity
pub struct Specialist {
    endpoint: Endpoint,
    df_jid: String,
    profile: AgentProfile,
    logic: Arc<dyn ExpertLogic>,
    heartbeat: Duration,
}

impl Specialist {
    pub fn new(
        endpoint: Endpoint,
        df_jid: impl Into<String>,
        profile: AgentProfile,
        logic: Arc<dyn ExpertLogic>,
        cfg: &PlatformConfig,
    ) -> Self {
        Self {
            endpoint,
            df_jid: df_jid.into(),
            profile,
            logic,
            heartbeat: cfg.heartbeat(),
        }
    }

    pub async fn run(mut self) {
        info!(
            jid = self.endpoint.jid(),
            caps = ?self.profile.capabilities,
            "Specialist started"
        );
        if let Err(e) = register_with_df(
            &self.endpoint.sender(),
            &self.df_jid,
            SPECIALIST_ROLE,
            &self.profile,
            ONTOLOGY_CORE,
        )
        .await
        {
            warn!(error = %e, "specialist registration failed");
        }
        let _heartbeat = spawn_heartbeat(
            self.endpoint.sender(),
            self.df_jid.clone(),
            SPECIALIST_ROLE.to_string(),
            self.profile.jid.clone(),
            self.heartbeat,
            ONTOLOGY_CORE.to_string(),
        );

        while let Some(delivery) = self.endpoint.recv().await {
            self.handle(delivery).await;
        }
    }

    async fn handle(&mut self, delivery: Delivery) {
        let Ok(acl) = AclMessage::from_json(&delivery.body) else {
            debug!(from = %delivery.from, "specialist dropping malformed frame");
            return;
        };
        record_message_received(acl.performative.as_str());

        if acl.performative != Performative::Request || acl.content_type() != "ASK_EXPERT" {
            return;
        }
        let reply_to = bare(&delivery.from).to_string();
        let question = acl
            .content
            .get("args")
            .and_then(|args| args.get("question"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let history: Vec<Value> = acl
            .content
            .get("history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(jid = self.endpoint.jid(), question = %question, "handling ASK_EXPERT");

        let agree = acl.reply(
            Performative::Agree,
            SPECIALIST_ROLE,
            json!({"status": "working"}),
        );
        self.send(&reply_to, &agree).await;

        match self.logic.answer(&question, &history).await {
            Ok(answer) => {
                let capability = self
                    .profile
                    .capabilities
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "ASK_EXPERT".to_string());
                let result = acl.reply(
                    Performative::Inform,
                    SPECIALIST_ROLE,
                    json!({
                        "type": "RESULT",
                        "result": {"answer": answer},
                        "meta": {"capability": capability},
                    }),
                );
                self.send(&reply_to, &result).await;
            }
            Err(e) => {
                warn!(error = %e, "expert logic failed");
                let failure = acl.reply(
                    Performative::Failure,
                    SPECIALIST_ROLE,
                    json!({"reason": e.to_string()}),
                );
                self.send(&reply_to, &failure).await;
            }
        }
    }

    async fn send(&self, to: &str, frame: &AclMessage) {
        if let Err(e) = self.endpoint.send(to, frame).await {
            warn!(error = %e, to, "specialist send failed");
        }
    }
}
