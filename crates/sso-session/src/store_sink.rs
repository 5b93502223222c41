use async_trait::async_trait;
use sso_dictionary::Dictionary;

/// Receives a plugin's `store` events: method-specific cached material
/// (spec.md's `MethodBlob`) the plugin wants persisted across
/// sessions. Implemented by `sso-identity` against the Secret DB; kept
/// as a trait here so this crate never depends on `sso-db`.
#[async_trait]
pub trait MethodDataSink: Send + Sync {
    async fn store(&self, data: Dictionary);
}
