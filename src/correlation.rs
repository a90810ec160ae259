// correlation.rs - Correlation book for ACL request/response matching
//
//! Registry of correlation expectations:
//! `(conversation_id) -> (reply_with) -> Expectation`.
//!
//! Every dispatcher runs inbound frames through [`allow_if_correlated`]:
//! frames without `in_reply_to` pass (initiating frames need no
//! correlation), everything else must match a registered expectation on
//! sender, performative and TTL. Violations are dropped, never errored —
//! they are normal under an at-least-once bus.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::acl::{AclMessage, Performative};

/// Performatives treated as acks: they never consume a multi-phase
/// expectation unless `consume_on` says otherwise.
const ACK_PERFORMATIVES: [Performative; 1] = [Performative::Agree];

/// A single registered expectation for `(conversation_id, reply_with)`
#[derive(Debug, Clone)]
pub struct Expectation {
    /// Permitted bare sender identities (empty = any)
    pub allow_from: HashSet<String>,

    /// Permitted performatives (empty = any)
    pub allow_pf: HashSet<Performative>,

    /// Entry is dead past this deadline
    pub expires_at: Instant,

    /// Debug note carried through logs
    pub note: String,

    /// When set, only these performatives consume the entry
    pub consume_on: Option<HashSet<Performative>>,
}

/// Registration parameters for [`CorrBook::register`]
#[derive(Debug, Clone, Default)]
pub struct ExpectSpec {
    pub allow_from: Vec<String>,
    pub allow_pf: Vec<Performative>,
    pub ttl: Option<Duration>,
    pub note: String,
}

impl ExpectSpec {
    pub fn from_sender(jid: impl Into<String>) -> Self {
        Self {
            allow_from: vec![jid.into()],
            ..Default::default()
        }
    }

    pub fn performatives(mut self, pfs: &[Performative]) -> Self {
        self.allow_pf = pfs.to_vec();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

/// The expectation book
#[derive(Debug)]
pub struct CorrBook {
    default_ttl: Duration,
    by_conv: HashMap<String, HashMap<String, Expectation>>,
}

impl CorrBook {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            by_conv: HashMap::new(),
        }
    }

    /// Install an expectation for the response identified by
    /// `(conversation_id, reply_with)`.
    ///
    /// Default consumption policy: when the expectation spans both AGREE and
    /// INFORM, only INFORM consumes it, so the intermediate ack leaves the
    /// entry in place for the terminal frame.
    pub fn register(&mut self, conv_id: &str, reply_with: &str, spec: ExpectSpec) {
        let ttl = spec.ttl.unwrap_or(self.default_ttl);
        let allow_pf: HashSet<Performative> = spec.allow_pf.iter().copied().collect();

        let consume_on = if allow_pf.contains(&Performative::Agree)
            && allow_pf.contains(&Performative::Inform)
        {
            Some(HashSet::from([Performative::Inform]))
        } else {
            None
        };

        let bucket = self.by_conv.entry(conv_id.to_string()).or_default();
        bucket.insert(
            reply_with.to_string(),
            Expectation {
                allow_from: spec.allow_from.into_iter().collect(),
                allow_pf,
                expires_at: Instant::now() + ttl,
                note: spec.note,
                consume_on,
            },
        );
    }

    /// Check an inbound frame against the book; consume the entry when the
    /// policy says the exchange is over.
    ///
    /// Returns `true` when the frame is allowed through, whether or not the
    /// entry was consumed.
    pub fn match_and_pop(
        &mut self,
        conv_id: &str,
        in_reply_to: Option<&str>,
        from_bare: Option<&str>,
        performative: Option<Performative>,
    ) -> bool {
        // Initiating frames carry no correlation; let them through.
        let Some(in_reply_to) = in_reply_to else {
            return true;
        };

        let Some(bucket) = self.by_conv.get_mut(conv_id) else {
            return false;
        };
        let Some(exp) = bucket.get(in_reply_to) else {
            return false;
        };

        if Instant::now() > exp.expires_at {
            trace!(conv = conv_id, reply = in_reply_to, "expectation expired");
            bucket.remove(in_reply_to);
            self.drop_empty_bucket(conv_id);
            return false;
        }

        if !exp.allow_from.is_empty() {
            match from_bare {
                Some(from) if exp.allow_from.contains(from) => {}
                _ => return false,
            }
        }

        if !exp.allow_pf.is_empty() {
            match performative {
                Some(pf) if exp.allow_pf.contains(&pf) => {}
                _ => return false,
            }
        }

        let should_consume = match (&exp.consume_on, performative) {
            (Some(terminal), Some(pf)) => terminal.contains(&pf),
            (Some(_), None) => false,
            (None, pf) => {
                // Multi-phase expectations survive acks.
                let multi_phase = exp.allow_pf.len() > 1;
                !(multi_phase && pf.is_some_and(|p| ACK_PERFORMATIVES.contains(&p)))
            }
        };

        if should_consume {
            bucket.remove(in_reply_to);
            self.drop_empty_bucket(conv_id);
        }
        true
    }

    /// Remove every expired entry.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.by_conv.retain(|_, bucket| {
            bucket.retain(|_, exp| now <= exp.expires_at);
            !bucket.is_empty()
        });
    }

    /// Number of live expectations, for diagnostics
    pub fn len(&self) -> usize {
        self.by_conv.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conv.is_empty()
    }

    fn drop_empty_bucket(&mut self, conv_id: &str) {
        if self.by_conv.get(conv_id).is_some_and(HashMap::is_empty) {
            self.by_conv.remove(conv_id);
        }
    }
}

/// Bare identity: strip the transport resource suffix (`agent@host/res`)
pub fn bare(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// Dispatcher guard: does this frame satisfy the correlation book?
pub fn allow_if_correlated(book: &mut CorrBook, frame: &AclMessage, from_bare: &str) -> bool {
    let conv = frame.conversation_id.as_deref().unwrap_or("");
    let ok = book.match_and_pop(
        conv,
        frame.in_reply_to.as_deref(),
        Some(from_bare),
        Some(frame.performative),
    );
    if !ok {
        debug!(
            conv,
            from = from_bare,
            pf = %frame.performative,
            in_reply_to = frame.in_reply_to.as_deref().unwrap_or(""),
            "frame failed correlation, dropping"
        );
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> CorrBook {
        CorrBook::new(Duration::from_secs(30))
    }

    #[test]
    fn test_initiating_frames_pass() {
        let mut corr = book();
        assert!(corr.match_and_pop("c1", None, Some("x@d"), Some(Performative::Inform)));
    }

    #[test]
    fn test_register_and_match() {
        let mut corr = book();
        corr.register(
            "c1",
            "r1",
            ExpectSpec::from_sender("s@d").performatives(&[Performative::Inform]),
        );
        // wrong sender
        assert!(!corr.match_and_pop("c1", Some("r1"), Some("z@d"), Some(Performative::Inform)));
        // wrong performative
        assert!(!corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Agree)));
        // match consumes
        assert!(corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Inform)));
        assert!(!corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Inform)));
    }

    #[test]
    fn test_unknown_conversation_rejected() {
        let mut corr = book();
        assert!(!corr.match_and_pop("nope", Some("r1"), Some("s@d"), Some(Performative::Inform)));
    }

    #[test]
    fn test_agree_does_not_consume_multi_phase() {
        let mut corr = book();
        corr.register(
            "c1",
            "r1",
            ExpectSpec::from_sender("s@d")
                .performatives(&[Performative::Agree, Performative::Inform]),
        );
        assert!(corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Agree)));
        // the terminal INFORM still matches and consumes
        assert!(corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Inform)));
        assert!(!corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Inform)));
    }

    #[test]
    fn test_expired_never_matches() {
        let mut corr = book();
        corr.register(
            "c1",
            "r1",
            ExpectSpec::from_sender("s@d").ttl(Duration::from_millis(0)),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(!corr.match_and_pop("c1", Some("r1"), Some("s@d"), Some(Performative::Inform)));
        assert!(corr.is_empty());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let mut corr = book();
        corr.register("c1", "r1", ExpectSpec::default().ttl(Duration::from_millis(0)));
        corr.register("c2", "r2", ExpectSpec::default());
        std::thread::sleep(Duration::from_millis(5));
        corr.sweep();
        assert_eq!(corr.len(), 1);
    }

    #[test]
    fn test_bare_strips_resource() {
        assert_eq!(bare("agent@host/res-1"), "agent@host");
        assert_eq!(bare("agent@host"), "agent@host");
    }
}
