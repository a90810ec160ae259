// coordinator/mod.rs - Coordinator dispatcher
//
//! The orchestrator's front half: a single long-running task that
//! multiplexes the inbound bus stream into per-conversation queues.
//!
//! Routing rules, in order:
//! 1. frames whose conversation id carries a KB sub-tag go to the owning
//!    conversation's dedicated KB reply queue;
//! 2. `REQUEST.USER_MSG` opens a conversation (id synthesized when missing)
//!    and spawns a [`serve::serve_conversation`] task fed from a fresh
//!    queue — the triggering frame itself is carried into the task, not
//!    re-enqueued;
//! 3. anything else with a conversation id lands in the matching queue;
//!    unknown conversations and uncorrelated frames are dropped.
//!
//! A global semaphore bounds the number of conversations in flight.

pub mod selector;
mod serve;

pub use selector::{
    FnSelector, HttpSelector, NoSelector, Selector, SelectorChoice, SelectorError, SelectorInput,
    fallback_select,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::acl::{AclMessage, Performative, now_ms};
use crate::bus::{Delivery, Endpoint};
use crate::config::PlatformConfig;
use crate::correlation::{CorrBook, allow_if_correlated, bare};
use crate::kb::{KbClient, kb_parent};
use crate::observability::record_message_received;

use serve::{ServeContext, serve_conversation};

/// Role name the coordinator speaks under
pub const COORDINATOR_ROLE: &str = "Coordinator";

const QUEUE_CAPACITY: usize = 64;
const SWEEP_PERIOD: Duration = Duration::from_secs(5);

struct ConvQueues {
    main: mpsc::Sender<AclMessage>,
    kb: mpsc::Sender<AclMessage>,
}

type QueueMap = Arc<Mutex<HashMap<String, ConvQueues>>>;

/// The coordinator agent
pub struct Coordinator {
    endpoint: Endpoint,
    cfg: PlatformConfig,
    df_jid: String,
    kb_jid: String,
    selector: Arc<dyn Selector>,
    corr: Arc<Mutex<CorrBook>>,
    queues: QueueMap,
    permits: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        endpoint: Endpoint,
        cfg: PlatformConfig,
        df_jid: impl Into<String>,
        kb_jid: impl Into<String>,
        selector: Arc<dyn Selector>,
    ) -> Self {
        let corr = Arc::new(Mutex::new(CorrBook::new(cfg.corr_ttl())));
        let permits = Arc::new(Semaphore::new(cfg.coord_max_concurrency.max(1)));
        Self {
            endpoint,
            cfg,
            df_jid: df_jid.into(),
            kb_jid: kb_jid.into(),
            selector,
            corr,
            queues: Arc::new(Mutex::new(HashMap::new())),
            permits,
        }
    }

    pub async fn run(mut self) {
        info!(
            jid = self.endpoint.jid(),
            df = %self.df_jid,
            kb = %self.kb_jid,
            mode = %self.cfg.coord_df_mode,
            max_concurrency = self.cfg.coord_max_concurrency,
            "Coordinator started"
        );
        let mut last_sweep = Instant::now();
        loop {
            if last_sweep.elapsed() >= SWEEP_PERIOD {
                self.corr.lock().sweep();
                last_sweep = Instant::now();
            }
            let Some(delivery) = self.endpoint.recv_timeout(Duration::from_secs(1)).await else {
                continue;
            };
            self.dispatch(delivery);
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let Ok(acl) = AclMessage::from_json(&delivery.body) else {
            debug!(from = %delivery.from, "dropping non-JSON frame");
            return;
        };
        record_message_received(acl.performative.as_str());

        let from_bare = bare(&delivery.from).to_string();
        if !allow_if_correlated(&mut self.corr.lock(), &acl, &from_bare) {
            return;
        }

        let conv = acl.conversation_id.clone();

        // KB replies ride sub-tagged conversation ids
        if let Some(parent) = conv.as_deref().and_then(kb_parent) {
            let parent = parent.to_string();
            match self.queues.lock().get(&parent) {
                Some(queues) => {
                    if queues.kb.try_send(acl).is_err() {
                        debug!(conv = %parent, "kb queue unavailable, dropping reply");
                    }
                }
                None => debug!(conv = %parent, "kb reply for unknown conversation"),
            }
            return;
        }

        if acl.performative == Performative::Request && acl.content_type() == "USER_MSG" {
            let conv_id = conv.unwrap_or_else(|| format!("sess-{}", now_ms()));
            self.spawn_serve(conv_id, acl, from_bare);
            return;
        }

        match conv {
            Some(conv_id) => match self.queues.lock().get(&conv_id) {
                Some(queues) => {
                    if queues.main.try_send(acl).is_err() {
                        debug!(conv = %conv_id, "conversation queue unavailable, dropping");
                    }
                }
                None => debug!(conv = %conv_id, "frame for unknown conversation dropped"),
            },
            // a frame without conversation id that is not a session start
            None => debug!(from = %from_bare, "conversationless frame dropped"),
        }
    }

    fn spawn_serve(&self, conv_id: String, orig: AclMessage, orig_from: String) {
        let (main_rx, kb_rx) = {
            let mut guard = self.queues.lock();
            if guard.contains_key(&conv_id) {
                warn!(conv = %conv_id, "conversation already active, dropping duplicate USER_MSG");
                return;
            }
            let (main_tx, main_rx) = mpsc::channel(QUEUE_CAPACITY);
            let (kb_tx, kb_rx) = mpsc::channel(QUEUE_CAPACITY);
            guard.insert(conv_id.clone(), ConvQueues { main: main_tx, kb: kb_tx });
            (main_rx, kb_rx)
        };

        let sender = self.endpoint.sender();
        let kb = KbClient::new(
            sender.clone(),
            COORDINATOR_ROLE,
            self.kb_jid.clone(),
            conv_id.clone(),
            kb_rx,
            self.corr.clone(),
            self.cfg.kb_timeout(),
        );
        let ctx = ServeContext {
            cfg: self.cfg.clone(),
            sender,
            df_jid: self.df_jid.clone(),
            selector: self.selector.clone(),
            corr: self.corr.clone(),
            conv: conv_id.clone(),
            orig,
            orig_from,
            main_rx,
            kb,
        };

        let grace = self.cfg.conv_grace();
        let queues = self.queues.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            serve_conversation(ctx).await;
            // absorb late frames before tearing the queues down
            tokio::time::sleep(grace).await;
            queues.lock().remove(&conv_id);
        });
    }
}
