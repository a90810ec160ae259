// coordinator/serve.rs - One task per user request
//
//! The sequential state machine behind every conversation:
//! journal USER_MSG -> DF lookup -> normalize candidates -> select ->
//! ask specialists with a global retry budget -> reply to the presenter.
//!
//! Every external wait is bounded; a missed deadline moves the machine to
//! the next attempt or the final "no answer" reply. Journaling is
//! best-effort and never blocks the answering path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::acl::{AclMessage, Performative, new_reply_id, now_iso};
use crate::bus::BusSender;
use crate::config::{DfMode, PlatformConfig};
use crate::correlation::{CorrBook, ExpectSpec, bare};
use crate::kb::KbClient;
use crate::observability::record_conversation_served;
use crate::platform::DF_ROLE;

use super::COORDINATOR_ROLE;
use super::selector::{Selector, SelectorInput, fallback_select};

/// Everything one ServeConversation task owns
pub(crate) struct ServeContext {
    pub cfg: PlatformConfig,
    pub sender: BusSender,
    pub df_jid: String,
    pub selector: Arc<dyn Selector>,
    pub corr: Arc<Mutex<CorrBook>>,
    pub conv: String,
    pub orig: AclMessage,
    /// Bare transport sender of the triggering USER_MSG
    pub orig_from: String,
    pub main_rx: mpsc::Receiver<AclMessage>,
    pub kb: KbClient,
}

pub(crate) async fn serve_conversation(mut ctx: ServeContext) {
    let question = ctx
        .orig
        .content
        .get("args")
        .and_then(|args| args.get("question"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    info!(conv = %ctx.conv, question = %question, "serving conversation");

    // 1. journal the user message
    let entry = timeline_entry(&ctx.orig.sender, "REQUEST", "USER_MSG", &question);
    journal(&mut ctx, entry).await;

    // 2-3. discover and normalize candidates
    let (candidates, df_timestamp) = discover(&mut ctx).await;
    if candidates.is_empty() {
        let text = format!("Brak dostępnych specjalistów ({}).", ctx.cfg.need_cap);
        reply_presenter(&ctx, &text).await;
        record_conversation_served("no_specialists");
        return;
    }

    // 4-5. selection, falling back deterministically
    let history = ctx.kb.fetch_timeline().await;
    let selected = choose(&mut ctx, &candidates, df_timestamp, &history).await;
    let Some(selected) = selected else {
        let text = format!("Brak dostępnych specjalistów ({}).", ctx.cfg.need_cap);
        reply_presenter(&ctx, &text).await;
        record_conversation_served("no_specialists");
        return;
    };

    // 6. ask specialists under the global retry budget
    let answer = ask_specialists(&mut ctx, &selected, &candidates, &question, &history).await;

    // 7. final reply
    match answer {
        Some(text) => {
            reply_presenter(&ctx, &text).await;
            record_conversation_served("answered");
        }
        None => {
            reply_presenter(&ctx, "Specjalista nie odpowiedział w czasie. Spróbuj ponownie.").await;
            record_conversation_served("no_answer");
        }
    }
}

fn timeline_entry(agent: &str, pf: &str, entry_type: &str, text: &str) -> Value {
    json!({
        "ts": now_iso(),
        "agent": agent,
        "pf": pf,
        "type": entry_type,
        "text": text,
    })
}

/// Best-effort journaling: the frame row and the timeline append may both
/// fail without affecting the conversation.
async fn journal(ctx: &mut ServeContext, entry: Value) {
    if let Err(e) = ctx.kb.store_frame(&entry).await {
        warn!(conv = %ctx.conv, error = %e, "frame journal failed");
    }
    let history_len = ctx.cfg.coord_history_len;
    if let Err(e) = ctx.kb.append_timeline(entry, history_len).await {
        warn!(conv = %ctx.conv, error = %e, "timeline append failed");
    }
}

/// DF lookup per the configured mode, then candidate normalization.
async fn discover(ctx: &mut ServeContext) -> (Vec<Value>, Option<String>) {
    let first_need = match ctx.cfg.coord_df_mode {
        DfMode::Need => ctx.cfg.need_cap.clone(),
        DfMode::All => "ALL".to_string(),
    };
    let mut reply = df_query(ctx, &first_need).await;

    if ctx.cfg.coord_df_mode == DfMode::All {
        let empty = reply
            .as_ref()
            .map(|inform| normalize_candidates(inform, &ctx.cfg.need_cap).0.is_empty())
            .unwrap_or(true);
        if empty {
            let need = ctx.cfg.need_cap.clone();
            reply = df_query(ctx, &need).await;
        }
    }

    let Some(inform) = reply else {
        warn!(conv = %ctx.conv, "DF lookup produced no reply");
        return (Vec::new(), None);
    };

    let (candidates, df_timestamp) = normalize_candidates(&inform, &ctx.cfg.need_cap);
    let jids: Vec<&str> = candidates
        .iter()
        .filter_map(|c| c.get("jid").and_then(Value::as_str))
        .collect();
    let entry = timeline_entry(DF_ROLE, "INFORM", "DF_RESPONSE", &jids.join(","));
    journal(ctx, entry).await;

    (candidates, df_timestamp)
}

/// One QUERY-REF round trip against the DF
async fn df_query(ctx: &mut ServeContext, need: &str) -> Option<AclMessage> {
    let reply_id = new_reply_id("df");
    ctx.corr.lock().register(
        &ctx.conv,
        &reply_id,
        ExpectSpec::from_sender(bare(&ctx.df_jid))
            .performatives(&[Performative::Inform])
            .ttl(ctx.cfg.corr_ttl())
            .note("df lookup"),
    );

    let frame = AclMessage::new(
        Performative::QueryRef,
        COORDINATOR_ROLE,
        DF_ROLE,
        json!({"need": need}),
    )
    .with_conversation(ctx.conv.as_str())
    .with_reply_with(reply_id.as_str());
    if let Err(e) = ctx.sender.send(&ctx.df_jid, &frame).await {
        warn!(error = %e, "DF query send failed");
        return None;
    }

    let timeout = ctx.cfg.req_timeout();
    await_reply(ctx, &reply_id, timeout, |msg| {
        msg.performative == Performative::Inform
    })
    .await
}

/// Accept either full profile maps or bare identifier strings; entries
/// without a jid are dropped, bare strings become minimal online profiles.
fn normalize_candidates(inform: &AclMessage, need_cap: &str) -> (Vec<Value>, Option<String>) {
    let df_timestamp = inform.content_str("df_timestamp").map(str::to_string);

    let from_profiles: Vec<Value> = inform
        .content
        .get("profiles")
        .and_then(Value::as_array)
        .map(|profiles| {
            profiles
                .iter()
                .filter(|p| p.get("jid").and_then(Value::as_str).is_some())
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if !from_profiles.is_empty() {
        return (from_profiles, df_timestamp);
    }

    let from_candidates: Vec<Value> = inform
        .content
        .get("candidates")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(jid) => Some(json!({
                        "jid": jid,
                        "status": "online",
                        "capabilities": [need_cap],
                    })),
                    Value::Object(map) if map.get("jid").and_then(Value::as_str).is_some() => {
                        Some(entry.clone())
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    (from_candidates, df_timestamp)
}

/// Selector invocation plus membership check; deterministic fallback when
/// it declines or picks outside the set.
async fn choose(
    ctx: &mut ServeContext,
    candidates: &[Value],
    df_timestamp: Option<String>,
    history: &[Value],
) -> Option<String> {
    let input = SelectorInput {
        conversation_id: ctx.conv.clone(),
        required_capability: ctx.cfg.need_cap.clone(),
        df_timestamp,
        fipa_request: json!({
            "performative": ctx.orig.performative.as_str(),
            "sender": ctx.orig.sender,
            "content": {
                "type": ctx.orig.content.get("type"),
                "args": ctx.orig.content.get("args"),
            },
        }),
        candidates: candidates.to_vec(),
        history: history.to_vec(),
    };

    let jids: Vec<&str> = candidates
        .iter()
        .filter_map(|c| c.get("jid").and_then(Value::as_str))
        .collect();

    match ctx.selector.select(&input).await {
        Ok(choice) if jids.contains(&choice.selected_jid.as_str()) => {
            info!(
                conv = %ctx.conv,
                selected = %choice.selected_jid,
                reason = %choice.reason,
                confidence = choice.confidence,
                "selector choice accepted"
            );
            Some(choice.selected_jid)
        }
        Ok(choice) => {
            warn!(
                conv = %ctx.conv,
                selected = %choice.selected_jid,
                "selector picked outside the candidate set, falling back"
            );
            fallback_select(candidates, &ctx.cfg.need_cap)
        }
        Err(e) => {
            debug!(conv = %ctx.conv, error = %e, "selector declined, falling back");
            fallback_select(candidates, &ctx.cfg.need_cap)
        }
    }
}

/// REQUEST.ASK_EXPERT against the try-list, up to the global attempt
/// budget. The first non-empty answer wins.
async fn ask_specialists(
    ctx: &mut ServeContext,
    selected: &str,
    candidates: &[Value],
    question: &str,
    history: &[Value],
) -> Option<String> {
    let mut order = vec![selected.to_string()];
    let mut others: Vec<String> = candidates
        .iter()
        .filter_map(|c| c.get("jid").and_then(Value::as_str))
        .filter(|jid| *jid != selected)
        .map(str::to_string)
        .collect();
    others.sort_unstable();
    order.extend(others);

    let budget = ctx.cfg.coord_max_retries.max(1) as usize;
    for attempt in 0..budget {
        let target = order[attempt % order.len()].clone();
        info!(conv = %ctx.conv, attempt = attempt + 1, target = %target, "asking specialist");

        let reply_id = new_reply_id("ask");
        ctx.corr.lock().register(
            &ctx.conv,
            &reply_id,
            ExpectSpec::from_sender(bare(&target))
                .performatives(&[Performative::Agree, Performative::Inform])
                .ttl(ctx.cfg.corr_ttl())
                .note("ask expert"),
        );

        let frame = AclMessage::new(
            Performative::Request,
            COORDINATOR_ROLE,
            "Specialist",
            json!({
                "type": "ASK_EXPERT",
                "args": {"question": question},
                "history": history,
            }),
        )
        .with_conversation(ctx.conv.as_str())
        .with_reply_with(reply_id.as_str());
        if let Err(e) = ctx.sender.send(&target, &frame).await {
            warn!(error = %e, target = %target, "ask send failed");
            continue;
        }

        if let Some(answer) = await_result(ctx, &reply_id, &target).await {
            return Some(answer);
        }
        debug!(conv = %ctx.conv, target = %target, "no answer within deadline");
    }
    None
}

/// Wait out one specialist exchange: log the AGREE, return the RESULT
/// answer if one lands before the deadline.
async fn await_result(ctx: &mut ServeContext, reply_id: &str, target: &str) -> Option<String> {
    let deadline = Instant::now() + ctx.cfg.req_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let Ok(Some(msg)) = tokio::time::timeout(remaining, ctx.main_rx.recv()).await else {
            return None;
        };
        if msg.in_reply_to.as_deref() != Some(reply_id) {
            continue;
        }
        match msg.performative {
            Performative::Agree => {
                debug!(conv = %ctx.conv, target = %target, "specialist agreed");
                let entry = timeline_entry(target, "AGREE", "AGREE", "");
                journal(ctx, entry).await;
            }
            Performative::Inform if msg.content_type() == "RESULT" => {
                let answer = msg
                    .content
                    .get("result")
                    .and_then(|result| result.get("answer"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let entry = timeline_entry(target, "INFORM", "RESULT", &answer);
                journal(ctx, entry).await;
                if !answer.is_empty() {
                    return Some(answer);
                }
                return None;
            }
            _ => {}
        }
    }
}

/// Send the final INFORM.PRESENTER_REPLY back to whoever asked.
async fn reply_presenter(ctx: &ServeContext, text: &str) {
    let presenter_jid = ctx
        .orig
        .content
        .get("meta")
        .and_then(|meta| meta.get("presenter_jid"))
        .and_then(Value::as_str)
        .unwrap_or(&ctx.orig_from)
        .to_string();

    let mut frame = ctx.orig.reply(
        Performative::Inform,
        COORDINATOR_ROLE,
        json!({"type": "PRESENTER_REPLY", "text": text}),
    );
    // the conversation id may have been synthesized by the dispatcher
    frame.conversation_id = Some(ctx.conv.clone());

    info!(conv = %ctx.conv, to = %presenter_jid, "replying to presenter");
    if let Err(e) = ctx.sender.send(&presenter_jid, &frame).await {
        warn!(error = %e, to = %presenter_jid, "presenter reply send failed");
    }
}

/// Drain the main queue until a frame answering `reply_id` passes `accept`,
/// or the deadline expires.
async fn await_reply(
    ctx: &mut ServeContext,
    reply_id: &str,
    timeout: Duration,
    accept: impl Fn(&AclMessage) -> bool,
) -> Option<AclMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let Ok(Some(msg)) = tokio::time::timeout(remaining, ctx.main_rx.recv()).await else {
            return None;
        };
        if msg.in_reply_to.as_deref() == Some(reply_id) && accept(&msg) {
            return Some(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inform_with(content: Value) -> AclMessage {
        AclMessage::new(Performative::Inform, DF_ROLE, COORDINATOR_ROLE, content)
    }

    #[test]
    fn test_normalize_prefers_profiles() {
        let inform = inform_with(json!({
            "profiles": [
                {"jid": "a@x", "status": "online", "capabilities": ["ASK_EXPERT"]},
                {"status": "online"},
            ],
            "candidates": ["b@x"],
            "df_timestamp": "2025-01-01T00:00:00Z",
        }));
        let (candidates, ts) = normalize_candidates(&inform, "ASK_EXPERT");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0]["jid"], "a@x");
        assert_eq!(ts.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_normalize_fabricates_from_bare_jids() {
        let inform = inform_with(json!({"candidates": ["b@x", 7, {"jid": "c@x"}]}));
        let (candidates, _) = normalize_candidates(&inform, "ASK_EXPERT");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0]["jid"], "b@x");
        assert_eq!(candidates[0]["status"], "online");
        assert_eq!(candidates[0]["capabilities"][0], "ASK_EXPERT");
        assert_eq!(candidates[1]["jid"], "c@x");
    }

    #[test]
    fn test_timeline_entry_shape() {
        let entry = timeline_entry("Presenter", "REQUEST", "USER_MSG", "ping");
        assert_eq!(entry["agent"], "Presenter");
        assert_eq!(entry["pf"], "REQUEST");
        assert_eq!(entry["type"], "USER_MSG");
        assert_eq!(entry["text"], "ping");
        assert!(entry["ts"].as_str().is_some());
    }
}
