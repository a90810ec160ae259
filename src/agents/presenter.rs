// agents/presenter.rs - Presenter adapter
//
//! The human-facing end of the pipeline. One presenter pins a single
//! session id for its lifetime; a session-level lock keeps at most one
//! USER_MSG outstanding. Replies are gated by a private correlation book —
//! only coordinator frames answering our token get through.

use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::acl::{AclMessage, Performative, new_reply_id};
use crate::bus::{BusError, BusSender, Endpoint, Mailbox};
use crate::config::PlatformConfig;
use crate::coordinator::COORDINATOR_ROLE;
use crate::correlation::{CorrBook, ExpectSpec, allow_if_correlated, bare};

/// Role name the presenter speaks under
pub const PRESENTER_ROLE: &str = "Presenter";

/// Presenter errors
#[derive(Debug, Error)]
pub enum PresenterError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("coordinator declined: {0}")]
    Declined(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

struct PresenterInner {
    mailbox: Mailbox,
    corr: CorrBook,
}

/// One user session on the bus
pub struct Presenter {
    sender: BusSender,
    coordinator_jid: String,
    session_id: String,
    wait: Duration,
    inner: tokio::sync::Mutex<PresenterInner>,
}

impl Presenter {
    pub fn new(
        endpoint: Endpoint,
        coordinator_jid: impl Into<String>,
        session_id: impl Into<String>,
        cfg: &PlatformConfig,
    ) -> Self {
        let (sender, mailbox) = endpoint.split();
        let wait = cfg.presenter_wait();
        Self {
            sender,
            coordinator_jid: coordinator_jid.into(),
            session_id: session_id.into(),
            wait,
            inner: tokio::sync::Mutex::new(PresenterInner {
                mailbox,
                corr: CorrBook::new(wait + Duration::from_secs(2)),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one question and wait for the coordinator's reply.
    ///
    /// The inner lock is the session mutex: a second `ask` on the same
    /// presenter parks until the first completes.
    pub async fn ask(&self, question: &str) -> Result<String, PresenterError> {
        let mut inner = self.inner.lock().await;

        let reply_id = new_reply_id("msg");
        inner.corr.register(
            &self.session_id,
            &reply_id,
            ExpectSpec::from_sender(bare(&self.coordinator_jid))
                .performatives(&[
                    Performative::Inform,
                    Performative::Refuse,
                    Performative::Failure,
                    Performative::NotUnderstood,
                ])
                .note("user msg"),
        );

        let frame = AclMessage::new(
            Performative::Request,
            PRESENTER_ROLE,
            COORDINATOR_ROLE,
            json!({
                "type": "USER_MSG",
                "args": {"question": question},
                "meta": {"presenter_jid": self.sender.jid()},
            }),
        )
        .with_conversation(self.session_id.as_str())
        .with_reply_with(reply_id.as_str());

        info!(session = %self.session_id, question = %question, "asking coordinator");
        self.sender.send(&self.coordinator_jid, &frame).await?;

        let deadline = Instant::now() + self.wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PresenterError::Timeout(self.wait));
            }
            let Some(delivery) = inner.mailbox.recv_timeout(remaining).await else {
                return Err(PresenterError::Timeout(self.wait));
            };
            let Ok(acl) = AclMessage::from_json(&delivery.body) else {
                continue;
            };
            let from = bare(&delivery.from).to_string();
            if !allow_if_correlated(&mut inner.corr, &acl, &from) {
                continue;
            }
            // a late reply to an earlier question may still satisfy the
            // book; only frames answering this token end the wait
            if acl.in_reply_to.as_deref() != Some(reply_id.as_str()) {
                continue;
            }

            match acl.performative {
                Performative::Inform if acl.content_type() == "PRESENTER_REPLY" => {
                    let text = acl.content_str("text").unwrap_or_default().to_string();
                    debug!(session = %self.session_id, "got presenter reply");
                    return Ok(text);
                }
                Performative::Refuse | Performative::Failure | Performative::NotUnderstood => {
                    let why = if acl.content_type().is_empty() {
                        acl.performative.as_str().to_string()
                    } else {
                        acl.content_type()
                    };
                    return Err(PresenterError::Declined(why));
                }
                _ => {}
            }
        }
    }
}
