//! Per-node affiliate records.

use jid::BareJid;

use crate::types::Affiliation;

/// An entity's long-lived relationship with a node, identified by
/// `(node, bare JID)`.
#[derive(Debug, Clone)]
pub struct NodeAffiliate {
    /// The entity's bare JID.
    pub jid: BareJid,
    /// The current affiliation.
    pub affiliation: Affiliation,
}

impl NodeAffiliate {
    /// Create a new affiliate record.
    pub fn new(jid: BareJid, affiliation: Affiliation) -> Self {
        Self { jid, affiliation }
    }

    /// Whether the record carries no standing beyond plain membership
    /// and can be dropped once the entity's last subscription goes.
    pub fn is_disposable(&self) -> bool {
        matches!(self.affiliation, Affiliation::Member | Affiliation::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposable_affiliations() {
        let jid: BareJid = "bob@rookery.chat".parse().unwrap();
        assert!(NodeAffiliate::new(jid.clone(), Affiliation::Member).is_disposable());
        assert!(NodeAffiliate::new(jid.clone(), Affiliation::None).is_disposable());
        assert!(!NodeAffiliate::new(jid.clone(), Affiliation::Owner).is_disposable());
        assert!(!NodeAffiliate::new(jid, Affiliation::Outcast).is_disposable());
    }
}
