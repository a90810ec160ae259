// lib.rs - Multi-Agent Control Plane
//
// A federation of agents over an abstract FIPA-ACL message bus: a
// Coordinator routes user questions to Specialists discovered through a
// Directory Facilitator, journaling every exchange in an append-only
// Knowledge Base.

pub mod acl;
pub mod agents;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod kb;
pub mod observability;
pub mod platform;

// Re-export commonly used types
pub use acl::{
    AclError, AclMessage, ONTOLOGY_CORE, ONTOLOGY_DF, ONTOLOGY_KB, Performative, new_reply_id,
    normalize_performative, now_iso, now_ms,
};

pub use agents::{
    EchoExpert, ExpertLogic, PRESENTER_ROLE, Presenter, PresenterError, SPECIALIST_ROLE,
    Specialist,
};

pub use bus::{Bus, BusError, BusSender, Delivery, Endpoint, InMemoryBus, Mailbox};

pub use config::{DfMode, PlatformConfig};

pub use coordinator::{
    COORDINATOR_ROLE, Coordinator, FnSelector, HttpSelector, NoSelector, Selector, SelectorChoice,
    SelectorError, SelectorInput, fallback_select,
};

pub use correlation::{CorrBook, ExpectSpec, Expectation, allow_if_correlated, bare};

pub use kb::{
    FetchedValue, KB_ROLE, KbAgent, KbClient, KbClientError, KbStore, StoreError, StoreRequest,
    StoredItem, StoredMeta, kb_parent, session_of, validate_key,
};

pub use observability::{
    MetricsConfig, MetricsHandle, TracingConfig, TracingFormat, init_metrics, init_tracing,
};

pub use platform::{
    AgentProfile, AgentStatus, DF_ROLE, DfAgent, DfCatalog, DfError, register_with_df,
    spawn_heartbeat,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::acl::{AclMessage, Performative};
    pub use crate::agents::{EchoExpert, Presenter, Specialist};
    pub use crate::bus::{Bus, Endpoint, InMemoryBus};
    pub use crate::config::PlatformConfig;
    pub use crate::coordinator::{Coordinator, NoSelector, Selector};
    pub use crate::kb::{KbAgent, KbStore};
    pub use crate::platform::{AgentProfile, DfAgent};
}
