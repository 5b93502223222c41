use crate::metadata::MetadataStore;
use crate::secret::SecretStore;
use sso_dictionary::{Credential, IdentityInfo, SsoError, SsoResult};

/// Combines the Metadata and Secret stores behind the two-phase
/// sequencing and integrity invariant described in spec.md §5/§4.6:
/// a Metadata row may exist without a Secret row (e.g. `store_secret`
/// false), but never the reverse.
pub struct Store {
    pub metadata: MetadataStore,
    pub secret: SecretStore,
}

impl Store {
    pub fn new(metadata_path: impl Into<String>, secret_path: impl Into<String>) -> Self {
        Self {
            metadata: MetadataStore::new(metadata_path),
            secret: SecretStore::new(secret_path),
        }
    }

    pub async fn open(&self) -> SsoResult<()> {
        self.metadata.open().await?;
        self.secret.open().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.metadata.close().await;
        self.secret.close().await;
    }

    /// Persists `info` via the Metadata store, then (if `store_secret`
    /// and a `secret` is present) the Secret store. If the Secret write
    /// fails, a compensating delete on the Metadata row restores
    /// consistency and the whole operation fails with `StoreFailed`,
    /// per spec.md §5's two-phase transaction rule.
    pub async fn store_identity(&self, info: &IdentityInfo) -> SsoResult<u32> {
        let id = self.metadata.insert_or_update_identity(info).await?;

        if info.store_secret {
            if let (Some(username), Some(secret)) = (&info.username, &info.secret) {
                let credential = Credential {
                    identity_id: id,
                    username: username.clone(),
                    password: secret.clone(),
                };
                if let Err(err) = self.secret.update_credentials(credential).await {
                    self.metadata.remove_identity(id).await.ok();
                    return Err(SsoError::StoreFailed(format!(
                        "secret write failed, compensating delete applied: {err}"
                    )));
                }
            }
        }

        Ok(id)
    }

    /// Removes an identity from both stores, including every cached
    /// per-method blob, so no Secret-side row survives its Metadata
    /// row (spec.md §4.6's integrity invariant). Per that same
    /// invariant, a failed Secret-side removal aborts the operation
    /// and leaves the Metadata row intact.
    pub async fn remove_identity(&self, id: u32) -> SsoResult<()> {
        self.secret.remove_credentials(id).await?;
        self.secret.remove_all_data(id).await?;
        self.metadata.remove_identity(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sso_dictionary::SecurityContext;

    fn ctx(s: &str) -> SecurityContext {
        SecurityContext::new(s, "*")
    }

    #[tokio::test]
    async fn store_identity_writes_both_stores() {
        let store = Store::new(":memory:", ":memory:");
        store.open().await.unwrap();

        let mut info = IdentityInfo::new(ctx("app1"));
        info.username = Some("u".into());
        info.secret = Some("s".into());
        info.store_secret = true;

        let id = store.store_identity(&info).await.unwrap();
        assert_ne!(id, 0);

        let cred = store.secret.load_credentials(id).await.unwrap().unwrap();
        assert_eq!(cred.username, "u");
        assert_eq!(cred.password, "s");
    }

    #[tokio::test]
    async fn store_without_store_secret_skips_secret_db() {
        let store = Store::new(":memory:", ":memory:");
        store.open().await.unwrap();

        let mut info = IdentityInfo::new(ctx("app1"));
        info.username = Some("u".into());
        info.secret = Some("s".into());
        info.store_secret = false;

        let id = store.store_identity(&info).await.unwrap();
        assert!(store.secret.load_credentials(id).await.unwrap().is_none());
    }

    /// Testable Property 8: if the Secret-DB write fails after the
    /// Metadata row has already been created, the compensating delete
    /// leaves the Metadata DB as if the store never happened.
    #[tokio::test]
    async fn secret_db_failure_rolls_back_the_metadata_row() {
        let store = Store::new(":memory:", ":memory:");
        store.open().await.unwrap();
        store.secret.close().await;

        let mut info = IdentityInfo::new(ctx("app1"));
        info.username = Some("u".into());
        info.secret = Some("s".into());
        info.store_secret = true;

        let err = store.store_identity(&info).await.unwrap_err();
        assert!(matches!(err, SsoError::StoreFailed(_)));

        // Reopen the secret store just to query; the metadata row must
        // be gone, not left dangling without its secret counterpart.
        store.secret.open().await.unwrap();
        let ids = store
            .metadata
            .query_identities(crate::metadata::IdentityFilter::default())
            .await
            .unwrap();
        assert!(ids.is_empty(), "compensating delete must remove the metadata row");
    }

    /// The integrity invariant this module documents forbids a Secret
    /// row surviving its Metadata row: `remove_identity` must also
    /// clear any per-method blob cached under the Secret DB, not just
    /// the credential row.
    #[tokio::test]
    async fn remove_identity_clears_cached_method_data_too() {
        let store = Store::new(":memory:", ":memory:");
        store.open().await.unwrap();

        let mut info = IdentityInfo::new(ctx("app1"));
        info.username = Some("u".into());
        info.secret = Some("s".into());
        info.store_secret = true;
        let id = store.store_identity(&info).await.unwrap();

        let method_id = store.metadata.insert_method("digest".to_string()).await.unwrap();
        store.secret.update_data(id, method_id, vec![1, 2, 3]).await.unwrap();

        store.remove_identity(id).await.unwrap();

        assert!(store.secret.load_credentials(id).await.unwrap().is_none());
        assert!(store.secret.load_data(id, method_id).await.unwrap().is_none());
    }
}
