use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Wildcard marker for the `application` half of a [`SecurityContext`].
pub const WILDCARD: &str = "*";

/// A `(system, application)` pair identifying where a request originated.
///
/// `system` is a platform label (a Smack label, a path, an executable
/// name — whatever the host's access control mechanism hands back).
/// `application` defaults to [`WILDCARD`] when a caller does not
/// distinguish between applications sharing a system label.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub system: String,
    pub application: String,
}

impl SecurityContext {
    pub fn new(system: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            application: application.into(),
        }
    }

    /// A context whose `application` is the wildcard.
    pub fn new_system(system: impl Into<String>) -> Self {
        Self::new(system, WILDCARD)
    }

    /// The empty context: matches nothing but itself.
    pub fn empty() -> Self {
        Self::new("", "")
    }

    fn field_matches(requested: &str, target: &str) -> bool {
        requested == target || requested == WILDCARD
    }

    /// Returns true iff `self` (the requesting context) matches `target`
    /// (the reference context), per spec: `self.system == target.system`
    /// (or `self.system` is wildcard) and likewise for `application`.
    pub fn matches(&self, target: &SecurityContext) -> bool {
        Self::field_matches(&self.system, &target.system)
            && Self::field_matches(&self.application, &target.application)
    }

    pub fn is_wildcard_application(&self) -> bool {
        self.application == WILDCARD
    }
}

impl fmt::Display for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.system, self.application)
    }
}

/// Total order over the pair, used to produce deterministic ACL
/// orderings for comparison and persistence. Plain byte-wise
/// lexicographic comparison of `(system, application)`.
impl Ord for SecurityContext {
    fn cmp(&self, other: &Self) -> Ordering {
        self.system
            .cmp(&other.system)
            .then_with(|| self.application.cmp(&other.application))
    }
}

impl PartialOrd for SecurityContext {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorts a list of contexts into the canonical order used for ACL
/// comparison and persistence.
pub fn sorted(mut contexts: Vec<SecurityContext>) -> Vec<SecurityContext> {
    contexts.sort();
    contexts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let a = SecurityContext::new("app1", "widget");
        let b = SecurityContext::new("app1", "widget");
        assert!(a.matches(&b));
        assert!(b.matches(&a));
    }

    #[test]
    fn wildcard_application_matches_any() {
        let requester = SecurityContext::new("app1", WILDCARD);
        let target = SecurityContext::new("app1", "widget");
        assert!(requester.matches(&target));
        // not symmetric: the specific target does not match the wildcard requester
        assert!(!target.matches(&requester));
    }

    #[test]
    fn different_systems_never_match() {
        let a = SecurityContext::new("app1", WILDCARD);
        let b = SecurityContext::new("app2", WILDCARD);
        assert!(!a.matches(&b));
        assert!(!b.matches(&a));
    }

    #[test]
    fn match_monotonicity_without_wildcards() {
        let a = SecurityContext::new("sys", "app");
        let b = SecurityContext::new("sys", "app");
        let c = SecurityContext::new("sys", "app");
        assert!(a.matches(&b) && b.matches(&c) && a.matches(&c));
    }

    #[test]
    fn ordering_is_total_and_deterministic() {
        let mut v = vec![
            SecurityContext::new("b", "x"),
            SecurityContext::new("a", "z"),
            SecurityContext::new("a", "a"),
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                SecurityContext::new("a", "a"),
                SecurityContext::new("a", "z"),
                SecurityContext::new("b", "x"),
            ]
        );
    }
}
