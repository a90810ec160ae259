// acl.rs - FIPA ACL JSON envelope
//
//! The ACL envelope shared by every agent on the bus.
//!
//! A frame is a flat JSON object: performative, sender/receiver role names,
//! ontology, protocol, language, timestamp, the correlation triple
//! (`conversation_id`, `reply_with`, `in_reply_to`) and an opaque `content`
//! mapping interpreted by the receiver per ontology. Unknown JSON fields are
//! ignored on parse; performatives outside the closed FIPA set are rejected.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Ontology for coordinator/presenter/specialist/DF exchanges
pub const ONTOLOGY_CORE: &str = "MAS.Core";
/// Ontology for knowledge-base frames
pub const ONTOLOGY_KB: &str = "MAS.KB";
/// Alternate ontology for DF registration frames emitted by the KB
pub const ONTOLOGY_DF: &str = "MAS.DF";

/// Envelope errors
#[derive(Debug, Error)]
pub enum AclError {
    #[error("unknown performative: {0:?}")]
    UnknownPerformative(String),

    #[error("invalid ACL JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// FIPA performatives, upper-kebab on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Performative {
    AcceptProposal,
    Agree,
    Cancel,
    Cfp,
    Confirm,
    Disconfirm,
    Failure,
    Inform,
    InformIf,
    InformRef,
    NotUnderstood,
    Propose,
    QueryIf,
    QueryRef,
    Refuse,
    RejectProposal,
    Request,
    RequestWhen,
    RequestWhenever,
    Subscribe,
}

impl Performative {
    /// Every member of the closed set, in wire order
    pub const ALL: [Performative; 20] = [
        Performative::AcceptProposal,
        Performative::Agree,
        Performative::Cancel,
        Performative::Cfp,
        Performative::Confirm,
        Performative::Disconfirm,
        Performative::Failure,
        Performative::Inform,
        Performative::InformIf,
        Performative::InformRef,
        Performative::NotUnderstood,
        Performative::Propose,
        Performative::QueryIf,
        Performative::QueryRef,
        Performative::Refuse,
        Performative::RejectProposal,
        Performative::Request,
        Performative::RequestWhen,
        Performative::RequestWhenever,
        Performative::Subscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Performative::AcceptProposal => "ACCEPT-PROPOSAL",
            Performative::Agree => "AGREE",
            Performative::Cancel => "CANCEL",
            Performative::Cfp => "CFP",
            Performative::Confirm => "CONFIRM",
            Performative::Disconfirm => "DISCONFIRM",
            Performative::Failure => "FAILURE",
            Performative::Inform => "INFORM",
            Performative::InformIf => "INFORM-IF",
            Performative::InformRef => "INFORM-REF",
            Performative::NotUnderstood => "NOT-UNDERSTOOD",
            Performative::Propose => "PROPOSE",
            Performative::QueryIf => "QUERY-IF",
            Performative::QueryRef => "QUERY-REF",
            Performative::Refuse => "REFUSE",
            Performative::RejectProposal => "REJECT-PROPOSAL",
            Performative::Request => "REQUEST",
            Performative::RequestWhen => "REQUEST-WHEN",
            Performative::RequestWhenever => "REQUEST-WHENEVER",
            Performative::Subscribe => "SUBSCRIBE",
        }
    }

    /// Normalize free-form input and map into the closed set
    pub fn parse(raw: &str) -> Result<Self, AclError> {
        let canon = normalize_performative(raw);
        match canon.as_str() {
            "ACCEPT-PROPOSAL" => Ok(Performative::AcceptProposal),
            "AGREE" => Ok(Performative::Agree),
            "CANCEL" => Ok(Performative::Cancel),
            "CFP" => Ok(Performative::Cfp),
            "CONFIRM" => Ok(Performative::Confirm),
            "DISCONFIRM" => Ok(Performative::Disconfirm),
            "FAILURE" => Ok(Performative::Failure),
            "INFORM" => Ok(Performative::Inform),
            "INFORM-IF" => Ok(Performative::InformIf),
            "INFORM-REF" => Ok(Performative::InformRef),
            "NOT-UNDERSTOOD" => Ok(Performative::NotUnderstood),
            "PROPOSE" => Ok(Performative::Propose),
            "QUERY-IF" => Ok(Performative::QueryIf),
            "QUERY-REF" => Ok(Performative::QueryRef),
            "REFUSE" => Ok(Performative::Refuse),
            "REJECT-PROPOSAL" => Ok(Performative::RejectProposal),
            "REQUEST" => Ok(Performative::Request),
            "REQUEST-WHEN" => Ok(Performative::RequestWhen),
            "REQUEST-WHENEVER" => Ok(Performative::RequestWhenever),
            "SUBSCRIBE" => Ok(Performative::Subscribe),
            _ => Err(AclError::UnknownPerformative(raw.to_string())),
        }
    }

    /// Default FIPA interaction protocol for a frame opened with this performative
    pub fn default_protocol(&self) -> &'static str {
        match self {
            Performative::QueryIf | Performative::QueryRef => "fipa-query",
            Performative::Subscribe => "fipa-subscribe",
            Performative::Cfp
            | Performative::Propose
            | Performative::AcceptProposal
            | Performative::RejectProposal => "fipa-contract-net",
            _ => "fipa-request",
        }
    }
}

impl std::fmt::Display for Performative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Performative {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Performative {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Performative::parse(&raw).map_err(D::Error::custom)
    }
}

/// Glued spellings repaired after the space/underscore pass
const KEBAB_REPAIRS: [(&str, &str); 8] = [
    ("ACCEPTPROPOSAL", "ACCEPT-PROPOSAL"),
    ("REJECTPROPOSAL", "REJECT-PROPOSAL"),
    ("INFORMIF", "INFORM-IF"),
    ("INFORMREF", "INFORM-REF"),
    ("QUERYIF", "QUERY-IF"),
    ("QUERYREF", "QUERY-REF"),
    ("REQUESTWHEN", "REQUEST-WHEN"),
    ("REQUESTWHENEVER", "REQUEST-WHENEVER"),
];

/// Canonicalize a performative spelling: uppercase, space/underscore runs
/// collapsed to `-`, glued kebab forms repaired, dash runs collapsed.
pub fn normalize_performative(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_dash = false;
    for ch in raw.trim().chars() {
        let mapped = match ch {
            ' ' | '_' => '-',
            c => c.to_ascii_uppercase(),
        };
        if mapped == '-' {
            if prev_dash {
                continue;
            }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        out.push(mapped);
    }
    for (glued, kebab) in KEBAB_REPAIRS {
        out = out.replace(glued, kebab);
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out
}

fn default_ontology() -> String {
    ONTOLOGY_CORE.to_string()
}

fn default_language() -> String {
    "application/json".to_string()
}

/// Producer timestamp, second-resolution ISO-8601 UTC
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Wall clock in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh correlation token, e.g. `msg-1712345678901-a1b2c3d4`
pub fn new_reply_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, now_ms(), &hex[..8])
}

/// One ACL frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclMessage {
    pub performative: Performative,
    pub sender: String,
    pub receiver: String,
    #[serde(default = "default_ontology")]
    pub ontology: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "now_iso")]
    pub timestamp: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub reply_with: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub content: Map<String, Value>,
}

impl AclMessage {
    /// Build a frame with envelope defaults applied. A non-object `content`
    /// is wrapped under a `"value"` key; `null` becomes an empty mapping.
    pub fn new(
        performative: Performative,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: Value,
    ) -> Self {
        let content = match content {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            performative,
            sender: sender.into(),
            receiver: receiver.into(),
            ontology: default_ontology(),
            protocol: performative.default_protocol().to_string(),
            language: default_language(),
            timestamp: now_iso(),
            conversation_id: None,
            reply_with: None,
            in_reply_to: None,
            content,
        }
    }

    /// Answer this frame: same conversation, `in_reply_to` echoing our
    /// `reply_with`, addressed back at the sender.
    pub fn reply(&self, performative: Performative, sender: impl Into<String>, content: Value) -> Self {
        let mut msg = AclMessage::new(performative, sender, self.sender.clone(), content);
        msg.conversation_id = self.conversation_id.clone();
        msg.in_reply_to = self.reply_with.clone();
        msg
    }

    pub fn with_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_reply_with(mut self, id: impl Into<String>) -> Self {
        self.reply_with = Some(id.into());
        self
    }

    pub fn with_in_reply_to(mut self, id: impl Into<String>) -> Self {
        self.in_reply_to = Some(id.into());
        self
    }

    pub fn with_ontology(mut self, ontology: impl Into<String>) -> Self {
        self.ontology = ontology.into();
        self
    }

    /// Parse a wire frame. Fills the protocol from the performative when the
    /// producer left it empty.
    pub fn from_json(body: &str) -> Result<Self, AclError> {
        let mut msg: AclMessage = serde_json::from_str(body)?;
        if msg.protocol.trim().is_empty() {
            msg.protocol = msg.performative.default_protocol().to_string();
        }
        Ok(msg)
    }

    pub fn to_json(&self) -> Result<String, AclError> {
        Ok(serde_json::to_string(self)?)
    }

    /// `content.type`, uppercased; empty when absent
    pub fn content_type(&self) -> String {
        self.content
            .get("type")
            .and_then(Value::as_str)
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// String field lookup inside `content`
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_variants() {
        assert_eq!(normalize_performative("request"), "REQUEST");
        assert_eq!(normalize_performative("Request_When"), "REQUEST-WHEN");
        assert_eq!(normalize_performative("acceptproposal"), "ACCEPT-PROPOSAL");
        assert_eq!(normalize_performative("query  ref"), "QUERY-REF");
        assert_eq!(normalize_performative("requestwhenever"), "REQUEST-WHENEVER");
    }

    #[test]
    fn test_normalize_idempotent() {
        for pf in Performative::ALL {
            assert_eq!(normalize_performative(pf.as_str()), pf.as_str());
        }
    }

    #[test]
    fn test_default_protocol_table() {
        assert_eq!(Performative::QueryRef.default_protocol(), "fipa-query");
        assert_eq!(Performative::QueryIf.default_protocol(), "fipa-query");
        assert_eq!(Performative::Subscribe.default_protocol(), "fipa-subscribe");
        assert_eq!(Performative::Cfp.default_protocol(), "fipa-contract-net");
        assert_eq!(Performative::Propose.default_protocol(), "fipa-contract-net");
        assert_eq!(Performative::Request.default_protocol(), "fipa-request");
        assert_eq!(Performative::Inform.default_protocol(), "fipa-request");
    }

    #[test]
    fn test_envelope_defaults_and_roundtrip() {
        let msg = AclMessage::new(
            Performative::QueryRef,
            "Coordinator",
            "Registry",
            json!({"need": "ASK_EXPERT"}),
        )
        .with_conversation("c1")
        .with_reply_with("r1");

        assert_eq!(msg.protocol, "fipa-query");
        assert_eq!(msg.ontology, ONTOLOGY_CORE);
        assert_eq!(msg.language, "application/json");

        let body = msg.to_json().unwrap();
        let parsed = AclMessage::from_json(&body).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_all_performatives_accepted() {
        for pf in Performative::ALL {
            let body = AclMessage::new(pf, "A", "B", json!({"ok": true}))
                .to_json()
                .unwrap();
            let parsed = AclMessage::from_json(&body).unwrap();
            assert_eq!(parsed.performative, pf);
        }
    }

    #[test]
    fn test_unknown_performative_rejected() {
        let body = r#"{"performative":"SHOUT","sender":"A","receiver":"B","content":{}}"#;
        assert!(AclMessage::from_json(body).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let body = r#"{"performative":"INFORM","sender":"A","receiver":"B","content":{},"x-extra":1}"#;
        let parsed = AclMessage::from_json(body).unwrap();
        assert_eq!(parsed.performative, Performative::Inform);
    }

    #[test]
    fn test_reply_correlation() {
        let ask = AclMessage::new(Performative::Request, "Presenter", "Coordinator", json!({}))
            .with_conversation("sess-1")
            .with_reply_with("msg-1");
        let ans = ask.reply(Performative::Inform, "Coordinator", json!({"text": "ok"}));
        assert_eq!(ans.receiver, "Presenter");
        assert_eq!(ans.conversation_id.as_deref(), Some("sess-1"));
        assert_eq!(ans.in_reply_to.as_deref(), Some("msg-1"));
    }

    #[test]
    fn test_content_type_uppercased() {
        let msg = AclMessage::new(Performative::Request, "A", "B", json!({"type": "register"}));
        assert_eq!(msg.content_type(), "REGISTER");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn normalization_is_idempotent(raw in ".{0,40}") {
                let once = normalize_performative(&raw);
                let twice = normalize_performative(&once);
                prop_assert_eq!(twice, once);
            }

            #[test]
            fn canonical_forms_parse_back(pf in proptest::sample::select(Performative::ALL.to_vec())) {
                prop_assert_eq!(Performative::parse(pf.as_str()).unwrap(), pf);
            }
        }
    }
}
