use std::collections::HashMap;

use async_trait::async_trait;
use russh::keys::PublicKey;

/// Name of the critical option carrying the JSON backend descriptor.
pub const PROXY_TARGET_CONFIG_OPTION: &str = "proxy-target-config";
/// Name of the critical option carrying the JSON application log message.
pub const LOG_MESSAGE_OPTION: &str = "log-message";

/// Read access to the critical options an authenticator attached to a
/// session. The proxy core only ever reads two options; modeling the
/// capability as a trait keeps test doubles trivial.
pub trait PermissionsReader: Send + Sync {
    fn critical_option(&self, name: &str) -> Option<&str>;
}

/// Authentication-produced container handed from the authenticator to the
/// proxy core. Only the critical-options mapping is meaningful here.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    critical_options: HashMap<String, String>,
}

impl Permissions {
    pub fn new(critical_options: HashMap<String, String>) -> Self {
        Permissions { critical_options }
    }

    /// Builder-style insertion, mostly useful when wiring up authenticators.
    pub fn with_critical_option(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.critical_options.insert(name.into(), value.into());
        self
    }
}

impl PermissionsReader for Permissions {
    fn critical_option(&self, name: &str) -> Option<&str> {
        self.critical_options.get(name).map(String::as_str)
    }
}

/// Authentication layer contract. The embedding process decides which
/// credentials are acceptable and, for accepted ones, which critical options
/// the session carries; the proxy core consumes the resulting
/// [`Permissions`] and nothing else.
///
/// Returning `None` rejects the authentication attempt.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate_password(&self, user: &str, password: &str) -> Option<Permissions>;

    async fn authenticate_public_key(&self, user: &str, key: &PublicKey) -> Option<Permissions>;
}
