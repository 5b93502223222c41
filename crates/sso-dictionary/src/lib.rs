//! Foundational types shared by every crate in the workspace: the
//! typed key/value [`Dictionary`], the `(system, application)`
//! [`SecurityContext`] pair, and the daemon-wide [`SsoError`]
//! taxonomy.

mod dictionary;
mod error;
mod identity_info;
mod security_context;

pub use dictionary::{Dictionary, Value};
pub use error::{SsoError, SsoResult};
pub use identity_info::{Credential, IdentityInfo, MethodBlob, Reference};
pub use security_context::{sorted, SecurityContext, WILDCARD};
