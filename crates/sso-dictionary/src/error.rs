use thiserror::Error;

/// The error taxonomy shared by every crate in the workspace.
///
/// Errors produced deep inside a component are converted to the member
/// here that matches the abstraction level the caller operates at; the
/// underlying cause is logged, not returned, per the propagation rule
/// described for this daemon.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SsoError {
    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("identity not found")]
    IdentityNotFound,

    #[error("reference not found")]
    ReferenceNotFound,

    #[error("method not known: {0}")]
    MethodNotKnown(String),

    #[error("method not available: {0}")]
    MethodNotAvailable(String),

    #[error("mechanism not available: {0}")]
    MechanismNotAvailable(String),

    #[error("credentials not available")]
    CredentialsNotAvailable,

    #[error("not authorized")]
    NotAuthorized,

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("user interaction failed: {0}")]
    UserInteraction(String),

    #[error("session canceled")]
    SessionCanceled,

    #[error("timeout")]
    Timeout,

    #[error("store failed: {0}")]
    StoreFailed(String),

    #[error("remove failed: {0}")]
    RemoveFailed(String),

    #[error("plugin died")]
    PluginDied,

    #[error("plugin protocol error: {0}")]
    ProtocolError(String),
}

impl SsoError {
    /// Short, stable kind name, independent of any associated detail
    /// string. Used by tests and by callers that want to match on the
    /// taxonomy without caring about the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            SsoError::Unknown(_) => "Unknown",
            SsoError::PermissionDenied => "PermissionDenied",
            SsoError::IdentityNotFound => "IdentityNotFound",
            SsoError::ReferenceNotFound => "ReferenceNotFound",
            SsoError::MethodNotKnown(_) => "MethodNotKnown",
            SsoError::MethodNotAvailable(_) => "MethodNotAvailable",
            SsoError::MechanismNotAvailable(_) => "MechanismNotAvailable",
            SsoError::CredentialsNotAvailable => "CredentialsNotAvailable",
            SsoError::NotAuthorized => "NotAuthorized",
            SsoError::MissingData(_) => "MissingData",
            SsoError::InvalidData(_) => "InvalidData",
            SsoError::UserInteraction(_) => "UserInteraction",
            SsoError::SessionCanceled => "SessionCanceled",
            SsoError::Timeout => "Timeout",
            SsoError::StoreFailed(_) => "StoreFailed",
            SsoError::RemoveFailed(_) => "RemoveFailed",
            SsoError::PluginDied => "PluginDied",
            SsoError::ProtocolError(_) => "ProtocolError",
        }
    }
}

impl From<std::io::Error> for SsoError {
    fn from(err: std::io::Error) -> Self {
        SsoError::Unknown(err.to_string())
    }
}

impl From<serde_json::Error> for SsoError {
    fn from(err: serde_json::Error) -> Self {
        SsoError::ProtocolError(err.to_string())
    }
}

pub type SsoResult<T> = std::result::Result<T, SsoError>;
