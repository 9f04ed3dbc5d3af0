pub mod app_log;
mod backend;
pub mod error;
pub mod fingerprints;
pub mod permissions;
pub mod proxy;
pub mod target;

pub use app_log::{APP_LOG_SOURCE, AppLogMessage, AppLogSink};
pub use error::ProxyError;
pub use permissions::{
    Authenticator, LOG_MESSAGE_OPTION, PROXY_TARGET_CONFIG_OPTION, Permissions, PermissionsReader,
};
pub use proxy::SshProxy;
pub use target::TargetConfig;
