// platform/mod.rs - Platform agents and shared agent plumbing
//
//! The Directory Facilitator plus the register/heartbeat plumbing every
//! service agent (KB, specialists) shares.

pub mod df;

pub use df::{AgentProfile, AgentStatus, DfAgent, DfCatalog, DfError, DF_ROLE};

use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::acl::{AclMessage, Performative, new_reply_id};
use crate::bus::{BusError, BusSender};

/// Announce a profile to the DF. Fire-and-forget: the AGREE lands in the
/// caller's mailbox and is ignored there; re-registration rides on the
/// heartbeat loop anyway.
pub async fn register_with_df(
    sender: &BusSender,
    df_jid: &str,
    role: &str,
    profile: &AgentProfile,
    ontology: &str,
) -> Result<(), BusError> {
    let frame = AclMessage::new(
        Performative::Request,
        role,
        DF_ROLE,
        json!({"type": "REGISTER", "profile": profile}),
    )
    .with_ontology(ontology)
    .with_conversation(format!("reg-{}", new_reply_id("df")))
    .with_reply_with(new_reply_id("msg"));
    debug!(jid = %profile.jid, df = df_jid, "registering with DF");
    sender.send(df_jid, &frame).await
}

/// Periodic HEARTBEAT task keeping a registration warm.
pub fn spawn_heartbeat(
    sender: BusSender,
    df_jid: String,
    role: String,
    jid: String,
    period: Duration,
    ontology: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it, registration just went out
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let beat = AclMessage::new(
                Performative::Inform,
                role.as_str(),
                DF_ROLE,
                json!({"type": "HEARTBEAT", "jid": jid}),
            )
            .with_ontology(ontology.as_str());
            if let Err(e) = sender.send(&df_jid, &beat).await {
                warn!(error = %e, jid = %jid, "heartbeat send failed");
            }
        }
    })
}
