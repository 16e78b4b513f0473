//! Access control descriptors attached to documents and named resources.

use std::collections::BTreeSet;

use crate::docid::DocId;

/// How a document's ACL combines with the ACL it inherits from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InheritanceRule {
    /// The child's decision wins over the parent's.
    #[default]
    ChildOverrides,
    /// The parent's decision wins over the child's.
    ParentOverrides,
    /// Access requires both child and parent to permit.
    AndBothPermit,
    /// Access requires either child or parent to permit.
    OrEitherPermit,
}

impl InheritanceRule {
    /// Wire name emitted in feed ACL fragments.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::ChildOverrides => "child-overrides",
            Self::ParentOverrides => "parent-overrides",
            Self::AndBothPermit => "and-both-permit",
            Self::OrEitherPermit => "or-either-permit",
        }
    }
}

/// Structured authorization descriptor for one document.
///
/// User and group names are opaque strings. Empty sets mean "no rule on
/// this dimension". The optional parent must be encodable by the codec so
/// the appliance can resolve the inheritance chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    permit_users: BTreeSet<String>,
    deny_users: BTreeSet<String>,
    permit_groups: BTreeSet<String>,
    deny_groups: BTreeSet<String>,
    inherit_from: Option<DocId>,
    inheritance: InheritanceRule,
}

impl Acl {
    /// An empty ACL: no rules on any dimension, no inheritance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permit_user(mut self, user: impl Into<String>) -> Self {
        self.permit_users.insert(user.into());
        self
    }

    pub fn deny_user(mut self, user: impl Into<String>) -> Self {
        self.deny_users.insert(user.into());
        self
    }

    pub fn permit_group(mut self, group: impl Into<String>) -> Self {
        self.permit_groups.insert(group.into());
        self
    }

    pub fn deny_group(mut self, group: impl Into<String>) -> Self {
        self.deny_groups.insert(group.into());
        self
    }

    /// Sets the document this ACL inherits from.
    pub fn inherit_from(mut self, parent: DocId) -> Self {
        self.inherit_from = Some(parent);
        self
    }

    pub fn with_inheritance(mut self, rule: InheritanceRule) -> Self {
        self.inheritance = rule;
        self
    }

    pub fn permitted_users(&self) -> &BTreeSet<String> {
        &self.permit_users
    }

    pub fn denied_users(&self) -> &BTreeSet<String> {
        &self.deny_users
    }

    pub fn permitted_groups(&self) -> &BTreeSet<String> {
        &self.permit_groups
    }

    pub fn denied_groups(&self) -> &BTreeSet<String> {
        &self.deny_groups
    }

    pub fn parent(&self) -> Option<&DocId> {
        self.inherit_from.as_ref()
    }

    pub fn inheritance(&self) -> InheritanceRule {
        self.inheritance
    }

    /// True when no dimension carries a rule and nothing is inherited.
    pub fn is_empty(&self) -> bool {
        self.permit_users.is_empty()
            && self.deny_users.is_empty()
            && self.permit_groups.is_empty()
            && self.deny_groups.is_empty()
            && self.inherit_from.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_rules() {
        let acl = Acl::new()
            .permit_user("alice")
            .permit_user("bob")
            .deny_group("contractors")
            .with_inheritance(InheritanceRule::AndBothPermit);
        assert_eq!(acl.permitted_users().len(), 2);
        assert!(acl.denied_groups().contains("contractors"));
        assert_eq!(acl.inheritance(), InheritanceRule::AndBothPermit);
        assert!(!acl.is_empty());
    }

    #[test]
    fn empty_acl_reports_empty() {
        assert!(Acl::new().is_empty());
        assert_eq!(Acl::new().inheritance(), InheritanceRule::ChildOverrides);
    }
}
