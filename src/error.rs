use std::io;

/// Errors produced while establishing or servicing a proxied session.
///
/// Everything up to and including the outbound handshake is fatal to the
/// session. Later failures are handled where they occur and never surface
/// through this type.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("authentication produced no permissions")]
    InvalidPermissions,
    #[error("malformed proxy target configuration")]
    MalformedTarget(#[source] serde_json::Error),
    #[error("target private key did not parse")]
    BadPrivateKey(#[source] russh::keys::Error),
    #[error("failed to dial target {address}")]
    DialFailed {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("backend host key fingerprint mismatch")]
    HostKeyMismatch,
    #[error("outbound ssh handshake failed")]
    HandshakeFailed(#[source] russh::Error),
    #[error("backend rejected authentication for user {user:?}")]
    AuthenticationFailed { user: String },
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}
