// platform/df.rs - Directory Facilitator (DF)
//
//! Yellow pages for the agent federation.
//!
//! Agents REGISTER a profile, keep it warm with HEARTBEAT frames and drop
//! out with DEREGISTER. Liveness is computed lazily against the wall clock:
//! a profile is alive within `2 * DF_HEARTBEAT_SEC` of its last heartbeat,
//! reported `offline` after that, and removed once
//! `DF_TTL_MULTIPLIER * DF_HEARTBEAT_SEC` (or its self-declared `ttl_sec`)
//! has passed. QUERY-REF answers capability lookups from an index that is
//! rebuilt on every registration.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acl::{AclMessage, Performative, now_iso};
use crate::bus::{Delivery, Endpoint};
use crate::config::PlatformConfig;
use crate::correlation::bare;
use crate::observability::record_message_received;

/// Role name the DF answers under
pub const DF_ROLE: &str = "Registry";

/// DF errors
#[derive(Debug, Clone, Error)]
pub enum DfError {
    #[error("profile has no jid")]
    InvalidProfile,
}

/// Declared availability of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Ready,
}

impl AgentStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            "ready" => Some(AgentStatus::Ready),
            _ => None,
        }
    }
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_status() -> AgentStatus {
    AgentStatus::Online
}

/// A registered agent profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub jid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    /// Epoch seconds of the last register/heartbeat
    #[serde(default)]
    pub last_seen: f64,
    /// Self-declared removal TTL, seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_sec: Option<f64>,
    /// Passthrough runtime fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentProfile {
    pub fn new(jid: impl Into<String>) -> Self {
        let jid = jid.into();
        Self {
            name: jid.clone(),
            jid,
            version: default_version(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            skills: BTreeSet::new(),
            status: AgentStatus::Online,
            last_seen: 0.0,
            ttl_sec: None,
            extra: Map::new(),
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.insert(cap.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Age in seconds against `now` (epoch seconds)
    pub fn age(&self, now: f64) -> f64 {
        (now - self.last_seen).max(0.0)
    }
}

/// Wall clock as epoch seconds
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn string_set(value: &Value) -> BTreeSet<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The in-memory catalog plus its derived capability index.
///
/// Liveness never mutates state on reads; callers pass `now` explicitly so
/// queries stay deterministic under test.
#[derive(Debug)]
pub struct DfCatalog {
    catalog: BTreeMap<String, AgentProfile>,
    /// lowercased capability -> jids
    cap_index: BTreeMap<String, BTreeSet<String>>,
    alive_window: f64,
    removal_ttl: f64,
}

impl DfCatalog {
    pub fn new(alive_window_sec: f64, removal_ttl_sec: f64) -> Self {
        Self {
            catalog: BTreeMap::new(),
            cap_index: BTreeMap::new(),
            alive_window: alive_window_sec,
            removal_ttl: removal_ttl_sec,
        }
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn get(&self, jid: &str) -> Option<&AgentProfile> {
        self.catalog.get(jid)
    }

    /// Merge an incoming registration into the catalog.
    ///
    /// Every field except `jid`/`type` is copied; `capabilities` become the
    /// union of prior and incoming; `status` is forced online and
    /// `last_seen` refreshed. The capability index is rebuilt for the jid.
    pub fn upsert(&mut self, incoming: &Map<String, Value>, now: f64) -> Result<&AgentProfile, DfError> {
        let jid = incoming
            .get("jid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(DfError::InvalidProfile)?
            .to_string();

        let mut profile = self
            .catalog
            .remove(&jid)
            .unwrap_or_else(|| AgentProfile::new(jid.clone()));
        Self::apply_fields(&mut profile, incoming, true);
        profile.status = AgentStatus::Online;
        profile.last_seen = now;

        self.reindex(&jid, &profile.capabilities);
        Ok(self.catalog.entry(jid).or_insert(profile))
    }

    /// Heartbeat: refresh `last_seen` and copy any runtime fields.
    pub fn touch(&mut self, jid: &str, runtime: &Map<String, Value>, now: f64) {
        let Some(mut profile) = self.catalog.remove(jid) else {
            return;
        };
        Self::apply_fields(&mut profile, runtime, false);
        if let Some(status) = runtime.get("status").and_then(Value::as_str) {
            profile.status = AgentStatus::parse(status).unwrap_or(AgentStatus::Online);
        } else {
            profile.status = AgentStatus::Online;
        }
        profile.last_seen = now;
        self.reindex(jid, &profile.capabilities);
        self.catalog.insert(jid.to_string(), profile);
    }

    pub fn remove(&mut self, jid: &str) -> bool {
        self.drop_index_entries(jid);
        self.catalog.remove(jid).is_some()
    }

    /// Mark stale profiles offline and drop expired ones. Returns the
    /// removed jids.
    pub fn gc(&mut self, now: f64) -> Vec<String> {
        let mut removed = Vec::new();
        let jids: Vec<String> = self.catalog.keys().cloned().collect();
        for jid in jids {
            let Some(profile) = self.catalog.get_mut(&jid) else {
                continue;
            };
            let age = profile.age(now);
            let ttl = profile.ttl_sec.unwrap_or(self.removal_ttl);
            if age > ttl {
                removed.push(jid.clone());
            } else if age > self.alive_window {
                profile.status = AgentStatus::Offline;
            }
        }
        for jid in &removed {
            self.remove(jid);
        }
        removed
    }

    pub fn is_alive(&self, profile: &AgentProfile, now: f64) -> bool {
        profile.age(now) <= self.alive_window
    }

    /// All live profiles, sorted by jid
    pub fn live_profiles(&self, now: f64) -> Vec<AgentProfile> {
        self.catalog
            .values()
            .filter(|p| self.is_alive(p, now))
            .cloned()
            .collect()
    }

    /// The whole catalog including offline profiles, sorted by jid
    pub fn all_profiles(&self) -> Vec<AgentProfile> {
        self.catalog.values().cloned().collect()
    }

    /// Live profiles advertising `capability` (case-insensitive), sorted by jid
    pub fn find_by_capability(&self, capability: &str, now: f64) -> Vec<AgentProfile> {
        let key = capability.trim().to_ascii_lowercase();
        let Some(jids) = self.cap_index.get(&key) else {
            return Vec::new();
        };
        jids.iter()
            .filter_map(|jid| self.catalog.get(jid))
            .filter(|p| self.is_alive(p, now))
            .cloned()
            .collect()
    }

    fn apply_fields(profile: &mut AgentProfile, fields: &Map<String, Value>, union_caps: bool) {
        for (key, value) in fields {
            match key.as_str() {
                // identity and bookkeeping stay ours
                "jid" | "type" | "status" | "last_seen" => {}
                "name" => {
                    if let Some(s) = value.as_str() {
                        profile.name = s.to_string();
                    }
                }
                "version" => {
                    if let Some(s) = value.as_str() {
                        profile.version = s.to_string();
                    }
                }
                "description" => {
                    if let Some(s) = value.as_str() {
                        profile.description = s.to_string();
                    }
                }
                "capabilities" => {
                    let incoming = string_set(value);
                    if union_caps {
                        profile.capabilities.extend(incoming);
                    } else if !incoming.is_empty() {
                        profile.capabilities = incoming;
                    }
                }
                "skills" => {
                    profile.skills = string_set(value);
                }
                "ttl_sec" => {
                    profile.ttl_sec = value.as_f64();
                }
                _ => {
                    profile.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }

    fn reindex(&mut self, jid: &str, capabilities: &BTreeSet<String>) {
        self.drop_index_entries(jid);
        for cap in capabilities {
            self.cap_index
                .entry(cap.trim().to_ascii_lowercase())
                .or_default()
                .insert(jid.to_string());
        }
    }

    fn drop_index_entries(&mut self, jid: &str) {
        self.cap_index.retain(|_, jids| {
            jids.remove(jid);
            !jids.is_empty()
        });
    }
}

/// The DF agent: a receive loop over the bus with periodic lazy GC,
/// mirroring the catalog semantics above onto ACL frames.
pub struct DfAgent {
    endpoint: Endpoint,
    catalog: DfCatalog,
    cleanup_period: Duration,
}

impl DfAgent {
    pub fn new(endpoint: Endpoint, cfg: &PlatformConfig) -> Self {
        Self {
            catalog: DfCatalog::new(cfg.alive_window_sec(), cfg.removal_ttl_sec()),
            cleanup_period: cfg.cleanup_period(),
            endpoint,
        }
    }

    pub async fn run(mut self) {
        info!(
            jid = self.endpoint.jid(),
            gc_period = ?self.cleanup_period,
            "DF started"
        );
        let mut last_gc = std::time::Instant::now();
        loop {
            if last_gc.elapsed() >= self.cleanup_period {
                let removed = self.catalog.gc(now_epoch());
                if !removed.is_empty() {
                    info!(removed = ?removed, "DF gc removed stale profiles");
                }
                last_gc = std::time::Instant::now();
            }

            let Some(delivery) = self.endpoint.recv_timeout(Duration::from_secs(1)).await else {
                continue;
            };
            self.handle(delivery).await;
        }
    }

    /// Force a GC pass (exposed for the run loop and tests)
    pub fn collect(&mut self, now: f64) -> Vec<String> {
        self.catalog.gc(now)
    }

    pub fn catalog(&self) -> &DfCatalog {
        &self.catalog
    }

    async fn handle(&mut self, delivery: Delivery) {
        let Ok(acl) = AclMessage::from_json(&delivery.body) else {
            debug!(from = %delivery.from, "DF dropping malformed frame");
            return;
        };
        record_message_received(acl.performative.as_str());
        let reply_to = bare(&delivery.from).to_string();

        match (acl.performative, acl.content_type().as_str()) {
            (Performative::Request, "REGISTER") => {
                let profile = acl
                    .content
                    .get("profile")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let merged = self
                    .catalog
                    .upsert(&profile, now_epoch())
                    .map(|stored| (stored.jid.clone(), stored.capabilities.clone()));
                match merged {
                    Ok((jid, caps)) => {
                        info!(jid = %jid, caps = ?caps, "DF register");
                        let ack = acl.reply(
                            Performative::Agree,
                            DF_ROLE,
                            json!({"status": "registered"}),
                        );
                        self.send(&reply_to, &ack).await;
                    }
                    Err(DfError::InvalidProfile) => {
                        warn!(from = %reply_to, "DF register without jid");
                        let nack = acl.reply(
                            Performative::Failure,
                            DF_ROLE,
                            json!({"reason": "INVALID_PROFILE"}),
                        );
                        self.send(&reply_to, &nack).await;
                    }
                }
            }
            (Performative::Inform, "HEARTBEAT") => {
                if let Some(jid) = acl.content_str("jid") {
                    let jid = jid.to_string();
                    self.catalog.touch(&jid, &acl.content, now_epoch());
                }
            }
            (Performative::Request, "DEREGISTER") => {
                if let Some(jid) = acl.content_str("jid") {
                    let jid = jid.to_string();
                    self.catalog.remove(&jid);
                    info!(jid = %jid, "DF deregister");
                    let ack = acl.reply(
                        Performative::Agree,
                        DF_ROLE,
                        json!({"status": "deregistered"}),
                    );
                    self.send(&reply_to, &ack).await;
                }
            }
            (Performative::QueryRef, _) => {
                let answer = self.answer_query(&acl);
                self.send(&reply_to, &answer).await;
            }
            _ => {
                // other traffic is none of the DF's business
            }
        }
    }

    fn answer_query(&self, acl: &AclMessage) -> AclMessage {
        let now = now_epoch();
        let query_type = acl.content_type();
        let need = acl.content_str("need").unwrap_or_default().trim().to_string();

        let profiles = if query_type == "DUMP" {
            self.catalog.all_profiles()
        } else if query_type == "LIST"
            || need.is_empty()
            || need.eq_ignore_ascii_case("ALL")
            || need == "*"
        {
            self.catalog.live_profiles(now)
        } else {
            self.catalog.find_by_capability(&need, now)
        };

        let candidates: Vec<&str> = profiles.iter().map(|p| p.jid.as_str()).collect();
        let query = if query_type.is_empty() { &need } else { &query_type };
        debug!(query = %query, hits = candidates.len(), "DF query");
        acl.reply(
            Performative::Inform,
            DF_ROLE,
            json!({
                "candidates": candidates,
                "profiles": profiles,
                "df_timestamp": now_iso(),
            }),
        )
    }

    async fn send(&self, to: &str, frame: &AclMessage) {
        if let Err(e) = self.endpoint.send(to, frame).await {
            warn!(error = %e, to, "DF failed to send reply");
        }
    }
}
