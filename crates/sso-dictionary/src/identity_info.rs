use crate::security_context::{self, SecurityContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The value persisted for an identity (spec.md §3). Lives here rather
/// than in `sso-identity` because both `sso-db` and `sso-identity` need
/// the type and `sso-db` must not depend on `sso-identity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInfo {
    /// 0 means "new, not yet stored".
    pub id: u32,
    pub username: Option<String>,
    pub username_is_secret: bool,
    /// Short-lived; canonically lives in the Secret DB. Never persisted
    /// into the Metadata DB row, and stripped by `get_info`.
    pub secret: Option<String>,
    pub store_secret: bool,
    pub caption: Option<String>,
    pub realms: Vec<String>,
    pub methods: BTreeMap<String, BTreeSet<String>>,
    pub acl: Vec<SecurityContext>,
    pub owner: SecurityContext,
    pub validated: bool,
    pub r#type: i32,
    pub ref_count: u32,
}

impl IdentityInfo {
    pub fn new(owner: SecurityContext) -> Self {
        Self {
            id: 0,
            username: None,
            username_is_secret: false,
            secret: None,
            store_secret: false,
            caption: None,
            realms: Vec::new(),
            methods: BTreeMap::new(),
            acl: Vec::new(),
            owner,
            validated: false,
            r#type: 0,
            ref_count: 0,
        }
    }

    pub fn is_new(&self) -> bool {
        self.id == 0
    }

    /// Returns a copy with `secret` removed, and `username` removed too
    /// if `username_is_secret` is set. Used by `get_info`/`get_identity`
    /// responses, which must never leak secret material.
    pub fn stripped(&self) -> Self {
        let mut copy = self.clone();
        copy.secret = None;
        if copy.username_is_secret {
            copy.username = None;
        }
        copy
    }
}

/// Deep equality as specified: `realms`/`acl` compared as sorted
/// sequences, `methods` compared as a map whose values are compared as
/// sorted sequences (already guaranteed here since `BTreeSet`/`BTreeMap`
/// iterate in sorted order, so structural `PartialEq` already gives us
/// this without extra sorting).
impl PartialEq for IdentityInfo {
    fn eq(&self, other: &Self) -> bool {
        let mut a_realms = self.realms.clone();
        let mut b_realms = other.realms.clone();
        a_realms.sort();
        b_realms.sort();

        let a_acl = security_context::sorted(self.acl.clone());
        let b_acl = security_context::sorted(other.acl.clone());

        self.id == other.id
            && self.username == other.username
            && self.username_is_secret == other.username_is_secret
            && self.secret == other.secret
            && self.store_secret == other.store_secret
            && self.caption == other.caption
            && a_realms == b_realms
            && self.methods == other.methods
            && a_acl == b_acl
            && self.owner == other.owner
            && self.validated == other.validated
            && self.r#type == other.r#type
            && self.ref_count == other.ref_count
    }
}

impl Eq for IdentityInfo {}

/// A `(identity_id, owner_context, name)` triple. Names are opaque to
/// the core; re-adding the same name from the same owner is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub identity_id: u32,
    pub owner: SecurityContext,
    pub name: String,
}

/// `(identity_id, username, password)`. Lives only in the Secret DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identity_id: u32,
    pub username: String,
    pub password: String,
}

/// Opaque byte map keyed by `(identity_id, method_id)`. The bytes are
/// always a `Dictionary::encode()` payload, but this crate treats them
/// opaquely since the per-method contents are plugin-defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBlob {
    pub identity_id: u32,
    pub method_id: u32,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(s: &str) -> SecurityContext {
        SecurityContext::new(s, "*")
    }

    #[test]
    fn equality_reflexive() {
        let mut info = IdentityInfo::new(ctx("sys"));
        info.realms = vec!["b".into(), "a".into()];
        assert_eq!(info, info.clone());
    }

    #[test]
    fn equality_symmetric_under_reordering() {
        let mut a = IdentityInfo::new(ctx("sys"));
        a.realms = vec!["a".into(), "b".into()];
        a.acl = vec![ctx("x"), ctx("y")];

        let mut b = IdentityInfo::new(ctx("sys"));
        b.realms = vec!["b".into(), "a".into()];
        b.acl = vec![ctx("y"), ctx("x")];

        assert_eq!(a, b);
        assert_eq!(b, a);
    }

    #[test]
    fn secret_stripped_does_not_affect_equality_of_other_fields() {
        let mut info = IdentityInfo::new(ctx("sys"));
        info.secret = Some("s".into());
        let stripped = info.stripped();
        assert_eq!(stripped.secret, None);
        assert_ne!(info, stripped);
    }

    #[test]
    fn username_stripped_when_marked_secret() {
        let mut info = IdentityInfo::new(ctx("sys"));
        info.username = Some("u".into());
        info.username_is_secret = true;
        let stripped = info.stripped();
        assert_eq!(stripped.username, None);
    }
}
