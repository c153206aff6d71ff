//! Presence tracking for notification gating.
//!
//! Keeps a map of bare JID to the show values of every available
//! resource. Dispatch updates it from inbound presence; the
//! notification path reads it when deciding whether a presence-gated
//! subscription gets an event. Updates are atomic per bare JID.

use std::collections::HashMap;

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use tracing::debug;
use xmpp_parsers::presence::Show;

/// Show value recorded when an available presence carries no `<show/>`.
pub const SHOW_ONLINE: &str = "online";

/// Map a parsed show element onto its tracked string form.
pub fn show_as_str(show: Option<Show>) -> &'static str {
    match show {
        None => SHOW_ONLINE,
        Some(Show::Away) => "away",
        Some(Show::Chat) => "chat",
        Some(Show::Dnd) => "dnd",
        Some(Show::Xa) => "xa",
    }
}

/// Tracker of available resources per bare JID.
///
/// Thread-safe: the outer map uses per-key exclusion for upserts, the
/// inner map is only touched while the outer entry is held.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    presences: DashMap<BareJid, HashMap<FullJid, String>>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            presences: DashMap::new(),
        }
    }

    /// Record an available resource with its show value.
    pub fn on_available(&self, jid: FullJid, show: Option<Show>) {
        let bare = jid.to_bare();
        let show = show_as_str(show).to_string();
        debug!(jid = %jid, show = %show, "Presence available");
        self.presences.entry(bare).or_default().insert(jid, show);
    }

    /// Remove a resource that went unavailable.
    ///
    /// The bare JID entry is pruned once its last resource is gone.
    pub fn on_unavailable(&self, jid: &FullJid) {
        let bare = jid.to_bare();
        if let Some(mut entry) = self.presences.get_mut(&bare) {
            entry.remove(jid);
            debug!(jid = %jid, remaining = entry.len(), "Presence unavailable");
        }
        self.presences.remove_if(&bare, |_, resources| resources.is_empty());
    }

    /// Show values known for a JID.
    ///
    /// A bare JID returns every known resource's show value; a full JID
    /// returns a one-element sequence when known, else empty.
    pub fn shows_for(&self, jid: &Jid) -> Vec<String> {
        match jid.clone().try_into_full() {
            Ok(full) => self
                .presences
                .get(&full.to_bare())
                .and_then(|resources| resources.get(&full).cloned())
                .into_iter()
                .collect(),
            Err(bare) => self
                .presences
                .get(&bare)
                .map(|resources| resources.values().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Whether any resource of the bare JID is available.
    pub fn is_available(&self, bare: &BareJid) -> bool {
        self.presences
            .get(bare)
            .map(|resources| !resources.is_empty())
            .unwrap_or(false)
    }

    /// Number of tracked bare JIDs.
    pub fn tracked_count(&self) -> usize {
        self.presences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(s: &str) -> FullJid {
        s.parse().expect("valid full jid")
    }

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    #[test]
    fn test_available_records_show() {
        let tracker = PresenceTracker::new();
        tracker.on_available(full("bob@rookery.chat/r1"), None);
        tracker.on_available(full("bob@rookery.chat/r2"), Some(Show::Away));

        let mut shows = tracker.shows_for(&jid("bob@rookery.chat"));
        shows.sort();
        assert_eq!(shows, vec!["away".to_string(), "online".to_string()]);
    }

    #[test]
    fn test_full_jid_lookup() {
        let tracker = PresenceTracker::new();
        tracker.on_available(full("bob@rookery.chat/r1"), Some(Show::Dnd));

        assert_eq!(
            tracker.shows_for(&jid("bob@rookery.chat/r1")),
            vec!["dnd".to_string()]
        );
        assert!(tracker.shows_for(&jid("bob@rookery.chat/r2")).is_empty());
    }

    #[test]
    fn test_unavailable_prunes_empty_entries() {
        let tracker = PresenceTracker::new();
        let r1 = full("carol@rookery.chat/r1");
        tracker.on_available(r1.clone(), None);
        assert_eq!(tracker.tracked_count(), 1);

        tracker.on_unavailable(&r1);
        assert_eq!(tracker.tracked_count(), 0);
        assert!(tracker.shows_for(&jid("carol@rookery.chat")).is_empty());
    }

    #[test]
    fn test_unavailable_keeps_other_resources() {
        let tracker = PresenceTracker::new();
        tracker.on_available(full("dan@rookery.chat/r1"), None);
        tracker.on_available(full("dan@rookery.chat/r2"), Some(Show::Xa));

        tracker.on_unavailable(&full("dan@rookery.chat/r1"));
        assert_eq!(
            tracker.shows_for(&jid("dan@rookery.chat")),
            vec!["xa".to_string()]
        );
    }

    #[test]
    fn test_unavailable_for_unknown_resource_is_noop() {
        let tracker = PresenceTracker::new();
        tracker.on_unavailable(&full("ghost@rookery.chat/r1"));
        assert_eq!(tracker.tracked_count(), 0);
    }
}
