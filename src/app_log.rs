use serde::Deserialize;

use crate::permissions::{LOG_MESSAGE_OPTION, PermissionsReader};

/// Source tag attached to every forwarded application log event.
pub const APP_LOG_SOURCE: &str = "SSH";

/// Application log descriptor, decoded from the `log-message` critical
/// option.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppLogMessage {
    pub guid: String,
    pub message: String,
    pub index: i64,
}

/// Delivery sink for application log events. The actual transport (firehose,
/// syslog, ...) belongs to the embedding process.
pub trait AppLogSink: Send + Sync {
    fn send_app_log(&self, app_id: &str, message: &str, source: &str, instance: &str);
}

/// Forward at most one application log event for the session.
///
/// An absent option does nothing; a malformed one is logged and otherwise
/// ignored, since a bad log descriptor must not affect the session.
pub fn emit_app_log(permissions: &dyn PermissionsReader, sink: &dyn AppLogSink) {
    let Some(raw) = permissions.critical_option(LOG_MESSAGE_OPTION) else {
        return;
    };
    if raw.is_empty() {
        return;
    }
    let log_message: AppLogMessage = match serde_json::from_str(raw) {
        Ok(log_message) => log_message,
        Err(error) => {
            tracing::error!(%error, "Unable to decode log-message option.");
            return;
        }
    };
    sink.send_app_log(
        &log_message.guid,
        &log_message.message,
        APP_LOG_SOURCE,
        &log_message.index.to_string(),
    );
}
