// tests/kb_agent.rs - KB agent over the bus: whitelist, taxonomy, conflicts

mod common;

use std::time::Duration;

use serde_json::{Value, json};

use mas_platform::acl::{AclMessage, ONTOLOGY_KB, Performative, new_reply_id};
use mas_platform::bus::{Endpoint, InMemoryBus};
use mas_platform::config::PlatformConfig;
use mas_platform::kb::{KbAgent, KbStore, StoreRequest};

use common::send_and_wait;

const KB_JID: &str = "kb@mas";
const WRITER_JID: &str = "coordinator@mas";

async fn boot_kb(bus: &std::sync::Arc<InMemoryBus>) -> KbStore {
    let cfg = PlatformConfig::default();
    let store = KbStore::open_in_memory().expect("kb store");
    let agent = KbAgent::new(
        Endpoint::attach(bus.clone(), KB_JID),
        store.clone(),
        WRITER_JID,
        &cfg,
    );
    tokio::spawn(agent.run());
    store
}

fn store_frame(key: &str, value: Value, if_match: Option<&str>) -> AclMessage {
    let mut content = json!({
        "type": "STORE",
        "key": key,
        "content_type": "application/json",
        "value": value,
        "tags": ["kind:test"],
    });
    if let Some(expected) = if_match {
        content["if_match"] = json!(expected);
    }
    AclMessage::new(Performative::Request, "Coordinator", "KB", content)
        .with_ontology(ONTOLOGY_KB)
        .with_conversation("kbtest")
        .with_reply_with(new_reply_id("kb"))
}

fn get_frame(key: &str, version: Option<i64>) -> AclMessage {
    let mut content = json!({"type": "GET", "key": key});
    if let Some(version) = version {
        content["version"] = json!(version);
    }
    AclMessage::new(Performative::Request, "Coordinator", "KB", content)
        .with_ontology(ONTOLOGY_KB)
        .with_conversation("kbtest")
        .with_reply_with(new_reply_id("kb"))
}

#[tokio::test]
async fn test_store_get_roundtrip() {
    let bus = InMemoryBus::new();
    boot_kb(&bus).await;
    let mut writer = Endpoint::attach(bus.clone(), WRITER_JID);
    let wait = Duration::from_secs(2);

    let key = "session:s1:chat:frame:1";
    let stored = send_and_wait(&mut writer, KB_JID, &store_frame(key, json!({"q": "ping"}), None), wait)
        .await
        .expect("stored reply");
    assert_eq!(stored.performative, Performative::Inform);
    assert_eq!(stored.content_type(), "STORED");
    assert_eq!(stored.content["version"], 1);
    assert!(stored.content["etag"].as_str().is_some());

    let value = send_and_wait(&mut writer, KB_JID, &get_frame(key, None), wait)
        .await
        .expect("value reply");
    assert_eq!(value.content_type(), "VALUE");
    assert_eq!(value.content["version"], 1);
    assert_eq!(value.content["value"], json!({"q": "ping"}));
    assert_eq!(value.content["etag"], stored.content["etag"]);
}

#[tokio::test]
async fn test_invalid_key_and_not_found() {
    let bus = InMemoryBus::new();
    boot_kb(&bus).await;
    let mut writer = Endpoint::attach(bus.clone(), WRITER_JID);
    let wait = Duration::from_secs(2);

    let reply = send_and_wait(&mut writer, KB_JID, &store_frame("bad", json!({}), None), wait)
        .await
        .expect("reply");
    assert_eq!(reply.performative, Performative::Failure);
    assert_eq!(reply.content_type(), "FAILURE.INVALID_KEY");

    let reply = send_and_wait(
        &mut writer,
        KB_JID,
        &get_frame("session:s1:chat:frame:404", None),
        wait,
    )
    .await
    .expect("reply");
    assert_eq!(reply.content_type(), "FAILURE.NOT_FOUND");
}

#[tokio::test]
async fn test_unauthorized_writer_refused() {
    let bus = InMemoryBus::new();
    boot_kb(&bus).await;
    let mut intruder = Endpoint::attach(bus.clone(), "rogue@mas");

    let reply = send_and_wait(
        &mut intruder,
        KB_JID,
        &store_frame("session:s1:chat:frame:1", json!({}), None),
        Duration::from_secs(2),
    )
    .await
    .expect("refusal");
    assert_eq!(reply.performative, Performative::Refuse);
    assert_eq!(reply.content_type(), "REFUSE.UNAUTHORIZED");
}

#[tokio::test]
async fn test_unsupported_type_refused() {
    let bus = InMemoryBus::new();
    boot_kb(&bus).await;
    let mut writer = Endpoint::attach(bus.clone(), WRITER_JID);

    let frame = AclMessage::new(
        Performative::Request,
        "Coordinator",
        "KB",
        json!({"type": "DROP_TABLE"}),
    )
    .with_ontology(ONTOLOGY_KB)
    .with_conversation("kbtest")
    .with_reply_with(new_reply_id("kb"));
    let reply = send_and_wait(&mut writer, KB_JID, &frame, Duration::from_secs(2))
        .await
        .expect("refusal");
    assert_eq!(reply.content_type(), "REFUSE.UNSUPPORTED_TYPE");
}

#[tokio::test]
async fn test_conflict_then_retry_after_get() {
    let bus = InMemoryBus::new();
    boot_kb(&bus).await;
    let mut writer = Endpoint::attach(bus.clone(), WRITER_JID);
    let wait = Duration::from_secs(2);
    let key = "session:s:chat:timeline:main";

    // seed v1
    let seeded = send_and_wait(&mut writer, KB_JID, &store_frame(key, json!([{"seed": 1}]), None), wait)
        .await
        .expect("seed");
    assert_eq!(seeded.content["version"], 1);

    // two writers race from v1: exactly one STORED v2, one CONFLICT
    let won = send_and_wait(
        &mut writer,
        KB_JID,
        &store_frame(key, json!([{"who": "A"}]), Some("v1")),
        wait,
    )
    .await
    .expect("winner");
    assert_eq!(won.content_type(), "STORED");
    assert_eq!(won.content["version"], 2);

    let lost = send_and_wait(
        &mut writer,
        KB_JID,
        &store_frame(key, json!([{"who": "B"}]), Some("v1")),
        wait,
    )
    .await
    .expect("loser");
    assert_eq!(lost.performative, Performative::Failure);
    assert_eq!(lost.content_type(), "FAILURE.CONFLICT");

    // the loser re-reads and retries against the new version
    let current = send_and_wait(&mut writer, KB_JID, &get_frame(key, None), wait)
        .await
        .expect("current");
    assert_eq!(current.content["version"], 2);

    let retried = send_and_wait(
        &mut writer,
        KB_JID,
        &store_frame(key, json!([{"who": "B", "retry": true}]), Some("v2")),
        wait,
    )
    .await
    .expect("retry");
    assert_eq!(retried.content_type(), "STORED");
    assert_eq!(retried.content["version"], 3);
}

#[tokio::test]
async fn test_file_backed_store_survives_reopen() {
    // the admin CLI reads the same file the agent writes
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kb.sqlite");

    let store = KbStore::open(&path).expect("open");
    for n in 1..=2 {
        store
            .store(StoreRequest {
                key: "session:s9:chat:frame:1".to_string(),
                content_type: "application/json".to_string(),
                value: json!({"n": n}),
                tags: vec!["kind:frame".to_string()],
                created_by: WRITER_JID.to_string(),
                if_match: None,
            })
            .await
            .expect("store");
    }
    drop(store);

    let reopened = KbStore::open(&path).expect("reopen");
    let latest = reopened
        .get_sync("session:s9:chat:frame:1", None, None)
        .expect("get");
    assert_eq!(latest.version, 2);

    let rows = reopened.dump_session_sync("s9").expect("dump");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, "session:s9:chat:frame:1");
    assert_eq!((rows[0].1, rows[1].1), (1, 2));
}

#[tokio::test]
async fn test_get_by_explicit_version() {
    let bus = InMemoryBus::new();
    boot_kb(&bus).await;
    let mut writer = Endpoint::attach(bus.clone(), WRITER_JID);
    let wait = Duration::from_secs(2);
    let key = "session:s:chat:frame:7";

    for n in 1..=2 {
        send_and_wait(&mut writer, KB_JID, &store_frame(key, json!({"n": n}), None), wait)
            .await
            .expect("stored");
    }
    let v1 = send_and_wait(&mut writer, KB_JID, &get_frame(key, Some(1)), wait)
        .await
        .expect("value");
    assert_eq!(v1.content["value"], json!({"n": 1}));
}
