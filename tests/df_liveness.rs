// tests/df_liveness.rs - DF lifecycle over the bus

mod common;

use std::time::Duration;

use serde_json::{Value, json};

use mas_platform::acl::{AclMessage, Performative, new_reply_id};
use mas_platform::bus::{Endpoint, InMemoryBus};
use mas_platform::config::PlatformConfig;
use mas_platform::platform::DfAgent;

use common::send_and_wait;

const DF_JID: &str = "df@mas";

fn fast_df_config() -> PlatformConfig {
    PlatformConfig {
        df_heartbeat_sec: 1.0,
        df_ttl_multiplier: 3,
        df_cleanup_period: 0.3,
        ..Default::default()
    }
}

fn register_frame(jid: &str, caps: &[&str]) -> AclMessage {
    AclMessage::new(
        Performative::Request,
        "Specialist",
        "Registry",
        json!({"type": "REGISTER", "profile": {"jid": jid, "capabilities": caps}}),
    )
    .with_conversation(format!("reg-{jid}"))
    .with_reply_with(new_reply_id("msg"))
}

fn query_frame(content: Value) -> AclMessage {
    AclMessage::new(Performative::QueryRef, "Probe", "Registry", content)
        .with_conversation("probe-conv")
        .with_reply_with(new_reply_id("dfq"))
}

fn candidates_of(reply: &AclMessage) -> Vec<String> {
    reply
        .content
        .get("candidates")
        .and_then(Value::as_array)
        .map(|jids| {
            jids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_register_query_deregister() {
    let cfg = PlatformConfig::default();
    let bus = InMemoryBus::new();
    tokio::spawn(DfAgent::new(Endpoint::attach(bus.clone(), DF_JID), &cfg).run());

    let mut probe = Endpoint::attach(bus.clone(), "probe@mas");
    let wait = Duration::from_secs(2);

    let ack = send_and_wait(&mut probe, DF_JID, &register_frame("b@x", &["ASK_EXPERT"]), wait)
        .await
        .expect("register ack");
    assert_eq!(ack.performative, Performative::Agree);
    assert_eq!(ack.content["status"], "registered");

    send_and_wait(&mut probe, DF_JID, &register_frame("a@x", &["ASK_EXPERT"]), wait)
        .await
        .expect("second register ack");

    // capability query is case-insensitive and jid-sorted
    let reply = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "ask_expert"})), wait)
        .await
        .expect("query reply");
    assert_eq!(reply.performative, Performative::Inform);
    assert_eq!(candidates_of(&reply), vec!["a@x", "b@x"]);
    assert!(reply.content.get("df_timestamp").is_some());
    let profiles = reply.content["profiles"].as_array().expect("profiles");
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[0]["jid"], "a@x");
    assert_eq!(profiles[0]["status"], "online");

    // unknown capability: empty but well-formed
    let reply = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "NO_SUCH"})), wait)
        .await
        .expect("query reply");
    assert!(candidates_of(&reply).is_empty());

    // LIST and need=ALL agree
    let list = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"type": "LIST"})), wait)
        .await
        .expect("list reply");
    assert_eq!(candidates_of(&list), vec!["a@x", "b@x"]);
    let all = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "ALL"})), wait)
        .await
        .expect("all reply");
    assert_eq!(candidates_of(&all), vec!["a@x", "b@x"]);

    // deregister removes immediately
    let dereg = AclMessage::new(
        Performative::Request,
        "Specialist",
        "Registry",
        json!({"type": "DEREGISTER", "jid": "a@x"}),
    )
    .with_conversation("reg-a@x")
    .with_reply_with(new_reply_id("msg"));
    let ack = send_and_wait(&mut probe, DF_JID, &dereg, wait).await.expect("dereg ack");
    assert_eq!(ack.content["status"], "deregistered");

    let reply = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "ASK_EXPERT"})), wait)
        .await
        .expect("query reply");
    assert_eq!(candidates_of(&reply), vec!["b@x"]);
}

#[tokio::test]
async fn test_register_without_jid_fails() {
    let cfg = PlatformConfig::default();
    let bus = InMemoryBus::new();
    tokio::spawn(DfAgent::new(Endpoint::attach(bus.clone(), DF_JID), &cfg).run());

    let mut probe = Endpoint::attach(bus.clone(), "probe@mas");
    let frame = AclMessage::new(
        Performative::Request,
        "Specialist",
        "Registry",
        json!({"type": "REGISTER", "profile": {"name": "nameless"}}),
    )
    .with_conversation("reg-nameless")
    .with_reply_with(new_reply_id("msg"));

    let nack = send_and_wait(&mut probe, DF_JID, &frame, Duration::from_secs(2))
        .await
        .expect("failure reply");
    assert_eq!(nack.performative, Performative::Failure);
    assert_eq!(nack.content["reason"], "INVALID_PROFILE");
}

#[tokio::test]
async fn test_ttl_expiry_without_heartbeats() {
    // heartbeat 1s: offline past 2s, removed past 3s
    let cfg = fast_df_config();
    let bus = InMemoryBus::new();
    tokio::spawn(DfAgent::new(Endpoint::attach(bus.clone(), DF_JID), &cfg).run());

    let mut probe = Endpoint::attach(bus.clone(), "probe@mas");
    let wait = Duration::from_secs(2);

    send_and_wait(&mut probe, DF_JID, &register_frame("p@x", &["ASK_EXPERT"]), wait)
        .await
        .expect("register ack");

    let reply = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "ASK_EXPERT"})), wait)
        .await
        .expect("query reply");
    assert_eq!(candidates_of(&reply), vec!["p@x"]);

    // past the alive window: gone from live queries, offline in DUMP
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let reply = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "ASK_EXPERT"})), wait)
        .await
        .expect("query reply");
    assert!(candidates_of(&reply).is_empty());

    let dump = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"type": "DUMP"})), wait)
        .await
        .expect("dump reply");
    let profiles = dump.content["profiles"].as_array().expect("profiles");
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0]["status"], "offline");

    // past the removal TTL: swept from the catalog entirely
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let dump = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"type": "DUMP"})), wait)
        .await
        .expect("dump reply");
    assert!(candidates_of(&dump).is_empty());
}

#[tokio::test]
async fn test_heartbeat_keeps_profile_alive() {
    let cfg = fast_df_config();
    let bus = InMemoryBus::new();
    tokio::spawn(DfAgent::new(Endpoint::attach(bus.clone(), DF_JID), &cfg).run());

    let mut probe = Endpoint::attach(bus.clone(), "probe@mas");
    let wait = Duration::from_secs(2);

    send_and_wait(&mut probe, DF_JID, &register_frame("p@x", &["ASK_EXPERT"]), wait)
        .await
        .expect("register ack");

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        let beat = AclMessage::new(
            Performative::Inform,
            "Specialist",
            "Registry",
            json!({"type": "HEARTBEAT", "jid": "p@x"}),
        );
        probe.send(DF_JID, &beat).await.expect("heartbeat send");
    }

    let reply = send_and_wait(&mut probe, DF_JID, &query_frame(json!({"need": "ASK_EXPERT"})), wait)
        .await
        .expect("query reply");
    assert_eq!(candidates_of(&reply), vec!["p@x"]);
}
