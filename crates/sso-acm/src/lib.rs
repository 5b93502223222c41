//! Resolves peer security contexts and enforces read/write/ACL
//! policies (spec.md §4.1, C5).

use sso_dictionary::{SecurityContext, WILDCARD};

/// The three distinct checks used at different Identity operations,
/// per `gsignond-identity.c`'s `VALIDATE_IDENTITY_*` macros: read/use
/// access, write/owner access, and ACL-validity (used only by `store`
/// when the caller supplies a new ACL).
pub trait AccessControlManager: Send + Sync {
    /// Resolves the calling peer's context from a transport hint (a
    /// file descriptor, service name, or equivalent opaque string).
    /// Must be deterministic for a given hint.
    fn peer_context(&self, transport_hint: &str) -> SecurityContext;

    /// True iff `peer` matches some entry in `acl` and platform policy
    /// authorizes `peer` to use `owner` at the system layer.
    fn peer_is_allowed_to_use(
        &self,
        peer: &SecurityContext,
        owner: &SecurityContext,
        acl: &[SecurityContext],
    ) -> bool;

    /// Equality under the match relation.
    fn peer_is_owner(&self, peer: &SecurityContext, owner: &SecurityContext) -> bool;

    /// Validates that a peer may set the given ACL (forbids a peer
    /// injecting contexts broader than itself).
    fn acl_is_valid(&self, peer: &SecurityContext, acl: &[SecurityContext]) -> bool;

    /// The privileged context allowed administrative operations such
    /// as `clear` and `query_identities`.
    fn keychain_context(&self) -> &SecurityContext;
}

/// Platform-layer access check, separated from the ACL-matching logic
/// so that a real deployment can plug in a Smack-style `have_access`
/// call without touching the ACL semantics above it.
pub trait PlatformPolicy: Send + Sync {
    fn have_access(&self, peer: &SecurityContext, owner: &SecurityContext) -> bool;
}

/// A platform policy that always admits. Used by test deployments
/// where the host's mandatory access control is not modeled.
pub struct AllowAllPlatformPolicy;

impl PlatformPolicy for AllowAllPlatformPolicy {
    fn have_access(&self, _peer: &SecurityContext, _owner: &SecurityContext) -> bool {
        true
    }
}

/// The daemon's standard ACM: ACL matching per spec.md §4.1, backed by
/// a pluggable [`PlatformPolicy`] for the system-layer check. Every
/// decision is audit-logged, mirroring the teacher's
/// authn_authz-module idiom of logging each ACL verdict.
pub struct DefaultAcm<P: PlatformPolicy> {
    keychain: SecurityContext,
    platform: P,
}

impl<P: PlatformPolicy> DefaultAcm<P> {
    pub fn new(keychain: SecurityContext, platform: P) -> Self {
        Self { keychain, platform }
    }
}

impl DefaultAcm<AllowAllPlatformPolicy> {
    /// The always-admit test deployment ACM, matching spec.md §4.1's
    /// "platform policy may be a stub that always admits".
    pub fn always_admit(keychain: SecurityContext) -> Self {
        Self::new(keychain, AllowAllPlatformPolicy)
    }
}

impl<P: PlatformPolicy> AccessControlManager for DefaultAcm<P> {
    fn peer_context(&self, transport_hint: &str) -> SecurityContext {
        // Implementation-dependent resolution: we treat the hint as
        // `system` or `system:application`, defaulting `application`
        // to the wildcard, which is deterministic for a given hint as
        // required.
        match transport_hint.split_once(':') {
            Some((system, application)) => SecurityContext::new(system, application),
            None => SecurityContext::new(transport_hint, WILDCARD),
        }
    }

    fn peer_is_allowed_to_use(
        &self,
        peer: &SecurityContext,
        owner: &SecurityContext,
        acl: &[SecurityContext],
    ) -> bool {
        let acl_ok = acl.iter().any(|entry| peer.matches(entry)) || self.peer_is_owner(peer, owner);
        let platform_ok = self.platform.have_access(peer, owner);
        let allowed = acl_ok && platform_ok;
        tracing::info!(
            %peer, %owner, acl_ok, platform_ok, allowed,
            "acm.peer_is_allowed_to_use"
        );
        allowed
    }

    fn peer_is_owner(&self, peer: &SecurityContext, owner: &SecurityContext) -> bool {
        let allowed = peer.matches(owner);
        tracing::info!(%peer, %owner, allowed, "acm.peer_is_owner");
        allowed
    }

    fn acl_is_valid(&self, peer: &SecurityContext, acl: &[SecurityContext]) -> bool {
        // A peer may not inject an entry broader than itself: every
        // proposed entry must be matched by the peer (i.e. the peer is
        // at least as specific), or be an exact match for the peer.
        let valid = acl.iter().all(|entry| peer.matches(entry) || entry == peer);
        tracing::info!(%peer, entries = acl.len(), valid, "acm.acl_is_valid");
        valid
    }

    fn keychain_context(&self) -> &SecurityContext {
        &self.keychain
    }
}
