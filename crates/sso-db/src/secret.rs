use crate::database::StoreHandle;
use sso_dictionary::{Credential, SsoError, SsoResult};
use subtle::ConstantTimeEq;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    identity_id INTEGER PRIMARY KEY,
    username TEXT NOT NULL,
    password TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS method_data (
    identity_id INTEGER NOT NULL,
    method_id INTEGER NOT NULL,
    blob BLOB NOT NULL,
    PRIMARY KEY (identity_id, method_id)
);
"#;

const CLEAR_SQL: &str = "DELETE FROM credentials; DELETE FROM method_data;";

/// The encrypted store: per-identity credentials and per-(identity,
/// method) opaque blobs (spec.md §4.6, C3). The encryption itself is a
/// property of the filesystem it's mounted on (see `sso-storage`); this
/// crate only speaks SQL to whatever path the Storage Manager hands it.
pub struct SecretStore {
    handle: StoreHandle,
}

impl SecretStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            handle: StoreHandle::new(path),
        }
    }

    pub async fn open(&self) -> SsoResult<()> {
        self.handle.open(SCHEMA).await
    }

    pub async fn close(&self) {
        self.handle.close().await
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub async fn clear(&self) -> SsoResult<()> {
        self.handle.clear(CLEAR_SQL).await
    }

    pub fn last_error(&self) -> Option<String> {
        self.handle.last_error()
    }

    pub async fn load_credentials(&self, id: u32) -> SsoResult<Option<Credential>> {
        let db = self.handle.db()?;
        db.perform("load_credentials", move |conn| {
            let mut stmt =
                conn.prepare("SELECT username, password FROM credentials WHERE identity_id = ?")?;
            stmt.bind((1, id as i64))?;
            if let Ok(sqlite::State::Row) = stmt.next() {
                let username: String = stmt.read("username")?;
                let password: String = stmt.read("password")?;
                Ok(Some(Credential {
                    identity_id: id,
                    username,
                    password,
                }))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }

    pub async fn update_credentials(&self, credential: Credential) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("update_credentials", move |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO credentials (identity_id, username, password)
                 VALUES (?, ?, ?)
                 ON CONFLICT (identity_id) DO UPDATE SET
                    username = excluded.username,
                    password = excluded.password",
            )?;
            stmt.bind((1, credential.identity_id as i64))?;
            stmt.bind((2, credential.username.as_str()))?;
            stmt.bind((3, credential.password.as_str()))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|err| SsoError::StoreFailed(format!("{err:#}")))
    }

    pub async fn remove_credentials(&self, id: u32) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("remove_credentials", move |conn| {
            let mut stmt = conn.prepare("DELETE FROM credentials WHERE identity_id = ?")?;
            stmt.bind((1, id as i64))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|err| SsoError::RemoveFailed(format!("{err:#}")))
    }

    pub async fn load_data(&self, id: u32, method_id: u32) -> SsoResult<Option<Vec<u8>>> {
        let db = self.handle.db()?;
        db.perform("load_data", move |conn| {
            let mut stmt = conn
                .prepare("SELECT blob FROM method_data WHERE identity_id = ? AND method_id = ?")?;
            stmt.bind((1, id as i64))?;
            stmt.bind((2, method_id as i64))?;
            if let Ok(sqlite::State::Row) = stmt.next() {
                let blob: Vec<u8> = stmt.read("blob")?;
                Ok(Some(blob))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }

    pub async fn update_data(&self, id: u32, method_id: u32, blob: Vec<u8>) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("update_data", move |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO method_data (identity_id, method_id, blob)
                 VALUES (?, ?, ?)
                 ON CONFLICT (identity_id, method_id) DO UPDATE SET blob = excluded.blob",
            )?;
            stmt.bind((1, id as i64))?;
            stmt.bind((2, method_id as i64))?;
            stmt.bind((3, blob.as_slice()))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|err| SsoError::StoreFailed(format!("{err:#}")))
    }

    pub async fn remove_data(&self, id: u32, method_id: u32) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("remove_data", move |conn| {
            let mut stmt =
                conn.prepare("DELETE FROM method_data WHERE identity_id = ? AND method_id = ?")?;
            stmt.bind((1, id as i64))?;
            stmt.bind((2, method_id as i64))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|err| SsoError::RemoveFailed(format!("{err:#}")))
    }

    /// Deletes every cached blob for `id`, across all methods. Used by
    /// identity removal so no `method_data` row outlives its
    /// Metadata-side identity (spec.md §4.6's integrity invariant: no
    /// Secret row may exist without its Metadata row).
    pub async fn remove_all_data(&self, id: u32) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("remove_all_data", move |conn| {
            let mut stmt = conn.prepare("DELETE FROM method_data WHERE identity_id = ?")?;
            stmt.bind((1, id as i64))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|err| SsoError::RemoveFailed(format!("{err:#}")))
    }

    /// Constant-time comparison against the stored credential, per
    /// spec.md §4.6. Username is compared for equality first (its
    /// length alone is not secret), then the password is compared with
    /// `subtle::ConstantTimeEq` so that timing does not leak how many
    /// leading bytes matched.
    pub async fn check_credentials(&self, credential: Credential) -> SsoResult<bool> {
        let stored = self.load_credentials(credential.identity_id).await?;
        Ok(match stored {
            Some(stored) => {
                stored.username == credential.username
                    && bool::from(
                        stored.password.as_bytes().ct_eq(credential.password.as_bytes()),
                    )
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credentials_round_trip() {
        let store = SecretStore::new(":memory:");
        store.open().await.unwrap();

        let cred = Credential {
            identity_id: 1,
            username: "u".into(),
            password: "p".into(),
        };
        store.update_credentials(cred.clone()).await.unwrap();

        let fetched = store.load_credentials(1).await.unwrap().unwrap();
        assert_eq!(fetched, cred);
    }

    #[tokio::test]
    async fn check_credentials_matches_and_rejects() {
        let store = SecretStore::new(":memory:");
        store.open().await.unwrap();
        store
            .update_credentials(Credential {
                identity_id: 1,
                username: "u".into(),
                password: "correct".into(),
            })
            .await
            .unwrap();

        assert!(store
            .check_credentials(Credential {
                identity_id: 1,
                username: "u".into(),
                password: "correct".into(),
            })
            .await
            .unwrap());

        assert!(!store
            .check_credentials(Credential {
                identity_id: 1,
                username: "u".into(),
                password: "wrong".into(),
            })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn check_credentials_missing_identity_is_false() {
        let store = SecretStore::new(":memory:");
        store.open().await.unwrap();
        assert!(!store
            .check_credentials(Credential {
                identity_id: 42,
                username: "u".into(),
                password: "p".into(),
            })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn method_data_round_trip() {
        let store = SecretStore::new(":memory:");
        store.open().await.unwrap();
        store.update_data(1, 7, vec![1, 2, 3]).await.unwrap();
        let blob = store.load_data(1, 7).await.unwrap().unwrap();
        assert_eq!(blob, vec![1, 2, 3]);
        store.remove_data(1, 7).await.unwrap();
        assert!(store.load_data(1, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_all_data_clears_every_method_for_identity() {
        let store = SecretStore::new(":memory:");
        store.open().await.unwrap();
        store.update_data(1, 7, vec![1, 2, 3]).await.unwrap();
        store.update_data(1, 9, vec![4, 5, 6]).await.unwrap();
        store.update_data(2, 7, vec![7, 8, 9]).await.unwrap();

        store.remove_all_data(1).await.unwrap();

        assert!(store.load_data(1, 7).await.unwrap().is_none());
        assert!(store.load_data(1, 9).await.unwrap().is_none());
        assert_eq!(store.load_data(2, 7).await.unwrap(), Some(vec![7, 8, 9]));
    }
}
