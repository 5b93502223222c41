//! The dual-store persistence layer: a public Metadata store and an
//! encrypted-at-rest Secret store, plus the `Store` facade that
//! sequences writes across both per spec.md §5's two-phase rule.

mod database;
mod metadata;
mod secret;
mod store;

pub use database::{with_busy_retry, Database, StoreHandle};
pub use metadata::{IdentityFilter, MetadataStore};
pub use secret::SecretStore;
pub use store::Store;
