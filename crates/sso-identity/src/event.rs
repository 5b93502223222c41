/// Signals an Identity emits on a successful operation (spec.md §4.2,
/// §9's "Signals" re-architecture note). The source's GObject signals
/// become an explicit broadcast channel; subscribers (the out-of-scope
/// transport layer) get delivery order matching emission order since
/// `tokio::sync::broadcast` preserves per-sender order.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityEvent {
    CredentialsUpdated { identity_id: u32 },
    UserVerified { identity_id: u32 },
    SecretVerified { identity_id: u32 },
    Removed { identity_id: u32 },
    SignedOut { identity_id: u32 },
    DataUpdated { identity_id: u32 },
}
