use crate::database::StoreHandle;
use sso_dictionary::{IdentityInfo, Reference, SecurityContext, SsoError, SsoResult};
use std::collections::{BTreeMap, BTreeSet};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT,
    username_is_secret INTEGER NOT NULL DEFAULT 0,
    store_secret INTEGER NOT NULL DEFAULT 0,
    caption TEXT,
    owner_system TEXT NOT NULL,
    owner_application TEXT NOT NULL,
    validated INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS identity_realms (
    identity_id INTEGER NOT NULL,
    realm TEXT NOT NULL,
    PRIMARY KEY (identity_id, realm)
);

CREATE TABLE IF NOT EXISTS methods (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS identity_methods (
    identity_id INTEGER NOT NULL,
    method_id INTEGER NOT NULL,
    mechanism TEXT NOT NULL,
    PRIMARY KEY (identity_id, method_id, mechanism)
);

CREATE TABLE IF NOT EXISTS identity_acl (
    identity_id INTEGER NOT NULL,
    system TEXT NOT NULL,
    application TEXT NOT NULL,
    PRIMARY KEY (identity_id, system, application)
);

CREATE TABLE IF NOT EXISTS identity_references (
    identity_id INTEGER NOT NULL,
    owner_system TEXT NOT NULL,
    owner_application TEXT NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (identity_id, owner_system, owner_application, name)
);
"#;

const CLEAR_SQL: &str = "DELETE FROM identities; \
     DELETE FROM identity_realms; \
     DELETE FROM identity_methods; \
     DELETE FROM identity_acl; \
     DELETE FROM identity_references;";

/// Predicates accepted by `query_identities`, matched as an AND of
/// whichever fields are `Some`.
#[derive(Debug, Clone, Default)]
pub struct IdentityFilter {
    pub owner: Option<SecurityContext>,
    pub r#type: Option<i32>,
    pub caption: Option<String>,
}

/// The public store: identities, methods, mechanisms, realms, ACLs,
/// owners, and named references (spec.md §4.6, C2).
pub struct MetadataStore {
    handle: StoreHandle,
}

impl MetadataStore {
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

    /// Inserts a new identity (when `info.id == 0`) or updates the
    /// existing row, replacing its realms/methods/acl wholesale.
    /// Returns the (possibly newly-assigned) id.
    pub async fn insert_or_update_identity(&self, info: &IdentityInfo) -> SsoResult<u32> {
        let db = self.handle.db()?;
        let info = info.clone();
        db.perform("insert_or_update_identity", move |conn| {
            let tx_guard = conn.execute("BEGIN IMMEDIATE");
            tx_guard.map_err(|e| anyhow::anyhow!("begin transaction: {e}"))?;

            let result = (|| -> anyhow::Result<u32> {
                let id = if info.is_new() {
                    let mut stmt = conn.prepare(
                        "INSERT INTO identities
                            (username, username_is_secret, store_secret, caption,
                             owner_system, owner_application, validated, type)
                         VALUES
                            ($username, $username_is_secret, $store_secret, $caption,
                             $owner_system, $owner_application, $validated, $type)",
                    )?;
                    bind_identity_fields(&mut stmt, &info)?;
                    stmt.next()?;
                    conn.last_insert_rowid() as u32
                } else {
                    let mut stmt = conn.prepare(
                        "UPDATE identities SET
                            username = $username,
                            username_is_secret = $username_is_secret,
                            store_secret = $store_secret,
                            caption = $caption,
                            owner_system = $owner_system,
                            owner_application = $owner_application,
                            validated = $validated,
                            type = $type
                         WHERE id = $id",
                    )?;
                    bind_identity_fields(&mut stmt, &info)?;
                    stmt.bind(("$id", info.id as i64))?;
                    stmt.next()?;
                    info.id
                };

                let mut del = conn.prepare("DELETE FROM identity_realms WHERE identity_id = ?")?;
                del.bind((1, id as i64))?;
                del.next()?;
                for realm in &info.realms {
                    let mut ins = conn.prepare(
                        "INSERT INTO identity_realms (identity_id, realm) VALUES (?, ?)",
                    )?;
                    ins.bind((1, id as i64))?;
                    ins.bind((2, realm.as_str()))?;
                    ins.next()?;
                }

                let mut del =
                    conn.prepare("DELETE FROM identity_methods WHERE identity_id = ?")?;
                del.bind((1, id as i64))?;
                del.next()?;
                for (method, mechanisms) in &info.methods {
                    let method_id = get_or_insert_method_id(conn, method)?;
                    for mechanism in mechanisms {
                        let mut ins = conn.prepare(
                            "INSERT INTO identity_methods (identity_id, method_id, mechanism)
                             VALUES (?, ?, ?)",
                        )?;
                        ins.bind((1, id as i64))?;
                        ins.bind((2, method_id as i64))?;
                        ins.bind((3, mechanism.as_str()))?;
                        ins.next()?;
                    }
                }

                let mut del = conn.prepare("DELETE FROM identity_acl WHERE identity_id = ?")?;
                del.bind((1, id as i64))?;
                del.next()?;
                for ctx in &info.acl {
                    let mut ins = conn.prepare(
                        "INSERT INTO identity_acl (identity_id, system, application)
                         VALUES (?, ?, ?)",
                    )?;
                    ins.bind((1, id as i64))?;
                    ins.bind((2, ctx.system.as_str()))?;
                    ins.bind((3, ctx.application.as_str()))?;
                    ins.next()?;
                }

                Ok(id)
            })();

            match &result {
                Ok(_) => conn.execute("COMMIT")?,
                Err(_) => {
                    conn.execute("ROLLBACK").ok();
                }
            }
            result
        })
        .await
        .map_err(|err| SsoError::StoreFailed(format!("{err:#}")))
    }

    pub async fn get_identity(&self, id: u32) -> SsoResult<IdentityInfo> {
        let db = self.handle.db()?;
        db.perform("get_identity", move |conn| load_identity(conn, id))
            .await
            .map_err(|_| SsoError::IdentityNotFound)
    }

    pub async fn query_identities(&self, filter: IdentityFilter) -> SsoResult<Vec<IdentityInfo>> {
        let db = self.handle.db()?;
        db.perform("query_identities", move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM identities ORDER BY id")?;
            let mut ids = vec![];
            while let Ok(sqlite::State::Row) = stmt.next() {
                ids.push(stmt.read::<i64, _>("id")? as u32);
            }
            drop(stmt);

            let mut out = vec![];
            for id in ids {
                let info = load_identity(conn, id)?;
                if let Some(owner) = &filter.owner {
                    if &info.owner != owner {
                        continue;
                    }
                }
                if let Some(t) = filter.r#type {
                    if info.r#type != t {
                        continue;
                    }
                }
                if let Some(caption) = &filter.caption {
                    if info.caption.as_deref() != Some(caption.as_str()) {
                        continue;
                    }
                }
                out.push(info);
            }
            Ok(out)
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }

    pub async fn remove_identity(&self, id: u32) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("remove_identity", move |conn| {
            let mut stmt = conn.prepare("DELETE FROM identities WHERE id = ?")?;
            stmt.bind((1, id as i64))?;
            stmt.next()?;
            for table in [
                "identity_realms",
                "identity_methods",
                "identity_acl",
                "identity_references",
            ] {
                let mut del = conn.prepare(format!("DELETE FROM {table} WHERE identity_id = ?"))?;
                del.bind((1, id as i64))?;
                del.next()?;
            }
            Ok(())
        })
        .await
        .map_err(|err| SsoError::RemoveFailed(format!("{err:#}")))
    }

    pub async fn insert_reference(
        &self,
        id: u32,
        owner: SecurityContext,
        name: String,
    ) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("insert_reference", move |conn| {
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO identity_references
                     (identity_id, owner_system, owner_application, name)
                 VALUES (?, ?, ?, ?)",
            )?;
            stmt.bind((1, id as i64))?;
            stmt.bind((2, owner.system.as_str()))?;
            stmt.bind((3, owner.application.as_str()))?;
            stmt.bind((4, name.as_str()))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }

    pub async fn remove_reference(
        &self,
        id: u32,
        owner: SecurityContext,
        name: String,
    ) -> SsoResult<()> {
        let db = self.handle.db()?;
        db.perform("remove_reference", move |conn| {
            let mut stmt = conn.prepare(
                "DELETE FROM identity_references
                 WHERE identity_id = ? AND owner_system = ? AND owner_application = ? AND name = ?",
            )?;
            stmt.bind((1, id as i64))?;
            stmt.bind((2, owner.system.as_str()))?;
            stmt.bind((3, owner.application.as_str()))?;
            stmt.bind((4, name.as_str()))?;
            stmt.next()?;
            Ok(())
        })
        .await
        .map_err(|_err| SsoError::ReferenceNotFound)
    }

    pub async fn list_references(
        &self,
        id: u32,
        owner: SecurityContext,
    ) -> SsoResult<Vec<Reference>> {
        let db = self.handle.db()?;
        db.perform("list_references", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM identity_references
                 WHERE identity_id = ? AND owner_system = ? AND owner_application = ?
                 ORDER BY name",
            )?;
            stmt.bind((1, id as i64))?;
            stmt.bind((2, owner.system.as_str()))?;
            stmt.bind((3, owner.application.as_str()))?;
            let mut out = vec![];
            while let Ok(sqlite::State::Row) = stmt.next() {
                let name: String = stmt.read("name")?;
                out.push(Reference {
                    identity_id: id,
                    owner: owner.clone(),
                    name,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }

    pub async fn insert_method(&self, name: String) -> SsoResult<u32> {
        let db = self.handle.db()?;
        db.perform("insert_method", move |conn| {
            get_or_insert_method_id(conn, &name)
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }

    pub async fn get_method_id(&self, name: String) -> SsoResult<Option<u32>> {
        let db = self.handle.db()?;
        db.perform("get_method_id", move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM methods WHERE name = ?")?;
            stmt.bind((1, name.as_str()))?;
            if let Ok(sqlite::State::Row) = stmt.next() {
                Ok(Some(stmt.read::<i64, _>("id")? as u32))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|err| SsoError::Unknown(format!("{err:#}")))
    }
}

fn bind_identity_fields(
    stmt: &mut sqlite::Statement,
    info: &IdentityInfo,
) -> anyhow::Result<()> {
    match &info.username {
        Some(u) => stmt.bind(("$username", u.as_str()))?,
        None => stmt.bind(("$username", ()))?,
    }
    stmt.bind(("$username_is_secret", info.username_is_secret as i64))?;
    stmt.bind(("$store_secret", info.store_secret as i64))?;
    match &info.caption {
        Some(c) => stmt.bind(("$caption", c.as_str()))?,
        None => stmt.bind(("$caption", ()))?,
    }
    stmt.bind(("$owner_system", info.owner.system.as_str()))?;
    stmt.bind(("$owner_application", info.owner.application.as_str()))?;
    stmt.bind(("$validated", info.validated as i64))?;
    stmt.bind(("$type", info.r#type as i64))?;
    Ok(())
}

fn get_or_insert_method_id(conn: &sqlite::ConnectionThreadSafe, name: &str) -> anyhow::Result<u32> {
    let mut stmt = conn.prepare("SELECT id FROM methods WHERE name = ?")?;
    stmt.bind((1, name))?;
    if let Ok(sqlite::State::Row) = stmt.next() {
        return Ok(stmt.read::<i64, _>("id")? as u32);
    }
    drop(stmt);
    let mut ins = conn.prepare("INSERT INTO methods (name) VALUES (?)")?;
    ins.bind((1, name))?;
    ins.next()?;
    Ok(conn.last_insert_rowid() as u32)
}

fn load_identity(conn: &sqlite::ConnectionThreadSafe, id: u32) -> anyhow::Result<IdentityInfo> {
    let mut stmt = conn.prepare(
        "SELECT username, username_is_secret, store_secret, caption,
                owner_system, owner_application, validated, type
         FROM identities WHERE id = ?",
    )?;
    stmt.bind((1, id as i64))?;
    if !matches!(stmt.next()?, sqlite::State::Row) {
        anyhow::bail!("identity {id} not found");
    }

    let username: Option<String> = match stmt.column_type("username")? {
        sqlite::Type::Null => None,
        _ => Some(stmt.read("username")?),
    };
    let username_is_secret: i64 = stmt.read("username_is_secret")?;
    let store_secret: i64 = stmt.read("store_secret")?;
    let caption: Option<String> = match stmt.column_type("caption")? {
        sqlite::Type::Null => None,
        _ => Some(stmt.read("caption")?),
    };
    let owner_system: String = stmt.read("owner_system")?;
    let owner_application: String = stmt.read("owner_application")?;
    let validated: i64 = stmt.read("validated")?;
    let r#type: i64 = stmt.read("type")?;
    drop(stmt);

    // `ref_count` is derived rather than stored: it must reflect
    // whatever `insert_reference`/`remove_reference` have done since
    // the identity was created, and a column written only by
    // `insert_or_update_identity` can never track that.
    let mut stmt =
        conn.prepare("SELECT COUNT(*) as n FROM identity_references WHERE identity_id = ?")?;
    stmt.bind((1, id as i64))?;
    stmt.next()?;
    let ref_count: i64 = stmt.read("n")?;
    drop(stmt);

    let mut realms = vec![];
    let mut stmt = conn.prepare("SELECT realm FROM identity_realms WHERE identity_id = ? ORDER BY realm")?;
    stmt.bind((1, id as i64))?;
    while let Ok(sqlite::State::Row) = stmt.next() {
        realms.push(stmt.read::<String, _>("realm")?);
    }
    drop(stmt);

    let mut methods: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT m.name as method_name, im.mechanism as mechanism
         FROM identity_methods im JOIN methods m ON m.id = im.method_id
         WHERE im.identity_id = ?",
    )?;
    stmt.bind((1, id as i64))?;
    while let Ok(sqlite::State::Row) = stmt.next() {
        let method: String = stmt.read("method_name")?;
        let mechanism: String = stmt.read("mechanism")?;
        methods.entry(method).or_default().insert(mechanism);
    }
    drop(stmt);

    let mut acl = vec![];
    let mut stmt =
        conn.prepare("SELECT system, application FROM identity_acl WHERE identity_id = ?")?;
    stmt.bind((1, id as i64))?;
    while let Ok(sqlite::State::Row) = stmt.next() {
        let system: String = stmt.read("system")?;
        let application: String = stmt.read("application")?;
        acl.push(SecurityContext::new(system, application));
    }

    Ok(IdentityInfo {
        id,
        username,
        username_is_secret: username_is_secret != 0,
        secret: None,
        store_secret: store_secret != 0,
        caption,
        realms,
        methods,
        acl,
        owner: SecurityContext::new(owner_system, owner_application),
        validated: validated != 0,
        r#type: r#type as i32,
        ref_count: ref_count as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(s: &str) -> SecurityContext {
        SecurityContext::new(s, "*")
    }

    #[tokio::test]
    async fn insert_get_round_trip() {
        let store = MetadataStore::new(":memory:");
        store.open().await.unwrap();

        let mut info = IdentityInfo::new(ctx("app1"));
        info.username = Some("u".into());
        info.store_secret = true;
        info.realms = vec!["r2".into(), "r1".into()];
        info.methods
            .insert("password".into(), BTreeSet::from(["password".to_string()]));
        info.acl = vec![ctx("app1")];

        let id = store.insert_or_update_identity(&info).await.unwrap();
        assert_ne!(id, 0);

        let fetched = store.get_identity(id).await.unwrap();
        assert_eq!(fetched.username.as_deref(), Some("u"));
        assert_eq!(fetched.realms, vec!["r1".to_string(), "r2".to_string()]);
        assert!(fetched.methods.contains_key("password"));
    }

    #[tokio::test]
    async fn missing_identity_is_not_found() {
        let store = MetadataStore::new(":memory:");
        store.open().await.unwrap();
        let err = store.get_identity(999).await.unwrap_err();
        assert_eq!(err, SsoError::IdentityNotFound);
    }

    #[tokio::test]
    async fn references_are_idempotent() {
        let store = MetadataStore::new(":memory:");
        store.open().await.unwrap();
        let info = IdentityInfo::new(ctx("app1"));
        let id = store.insert_or_update_identity(&info).await.unwrap();

        store
            .insert_reference(id, ctx("app1"), "ref1".into())
            .await
            .unwrap();
        store
            .insert_reference(id, ctx("app1"), "ref1".into())
            .await
            .unwrap();

        let refs = store.list_references(id, ctx("app1")).await.unwrap();
        assert_eq!(refs.len(), 1);
    }

    /// `ref_count` must reflect the live `identity_references` set,
    /// not a column that's only ever written once at store time.
    #[tokio::test]
    async fn ref_count_tracks_added_and_removed_references() {
        let store = MetadataStore::new(":memory:");
        store.open().await.unwrap();
        let info = IdentityInfo::new(ctx("app1"));
        let id = store.insert_or_update_identity(&info).await.unwrap();
        assert_eq!(store.get_identity(id).await.unwrap().ref_count, 0);

        store.insert_reference(id, ctx("app1"), "ref1".into()).await.unwrap();
        assert_eq!(store.get_identity(id).await.unwrap().ref_count, 1);

        store.insert_reference(id, ctx("app2"), "ref2".into()).await.unwrap();
        assert_eq!(store.get_identity(id).await.unwrap().ref_count, 2);

        store.remove_reference(id, ctx("app1"), "ref1".into()).await.unwrap();
        assert_eq!(store.get_identity(id).await.unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn query_filters_by_owner() {
        let store = MetadataStore::new(":memory:");
        store.open().await.unwrap();
        store
            .insert_or_update_identity(&IdentityInfo::new(ctx("app1")))
            .await
            .unwrap();
        store
            .insert_or_update_identity(&IdentityInfo::new(ctx("app2")))
            .await
            .unwrap();

        let found = store
            .query_identities(IdentityFilter {
                owner: Some(ctx("app1")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, ctx("app1"));
    }
}
