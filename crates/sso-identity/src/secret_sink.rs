use async_trait::async_trait;
use sso_db::Store;
use sso_dictionary::Dictionary;
use sso_session::MethodDataSink;
use std::sync::Arc;

/// Persists a plugin's `store` events into the Secret DB's method-blob
/// table, resolving the method name to its id lazily (spec.md §4.3's
/// `MethodBlob`, via `MetadataStore::insert_method`'s get-or-insert).
/// Failures are logged, not propagated: a dropped cache write should
/// never fail the auth session that produced it.
pub struct SecretSink {
    store: Arc<Store>,
    identity_id: u32,
    method: String,
}

impl SecretSink {
    pub fn new(store: Arc<Store>, identity_id: u32, method: impl Into<String>) -> Self {
        Self {
            store,
            identity_id,
            method: method.into(),
        }
    }
}

#[async_trait]
impl MethodDataSink for SecretSink {
    async fn store(&self, data: Dictionary) {
        let method_id = match self.store.metadata.insert_method(self.method.clone()).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    identity_id = self.identity_id, method = %self.method, %err,
                    "failed to resolve method id for a plugin store event"
                );
                return;
            }
        };
        if let Err(err) = self
            .store
            .secret
            .update_data(self.identity_id, method_id, data.encode())
            .await
        {
            tracing::warn!(
                identity_id = self.identity_id, method = %self.method, %err,
                "failed to persist plugin store blob"
            );
        }
    }
}
