//! Consented per-request logging.
//!
//! Guest `console.*` output reaches the host only when the client that
//! issued the request proved consent: its token must equal the server token
//! configured on the runtime. Records that pass the check go to a
//! [`LogSink`]; everything else is dropped. Logging is best-effort and
//! never feeds back into the data path.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::metrics::METRIC_CONSENTED_LOG_RECORDS;
use crate::objects::RequestLogContext;

/// Shortest server token accepted at startup.
const MIN_TOKEN_LENGTH: usize = 6;

/// Severity of a guest log record, as reported by the console bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    /// `console.log`
    Log,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl LogSeverity {
    /// Parse the severity tag carried in a log callback. Unknown tags
    /// default to `Log`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "WARN" => Self::Warn,
            "ERROR" => Self::Error,
            _ => Self::Log,
        }
    }
}

/// One guest log record that passed the consent check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Record severity.
    pub severity: LogSeverity,
    /// Uuid of the request that emitted the record.
    pub request_uuid: String,
    /// Formatted request context, e.g. `(origin: example.com)`.
    pub context: String,
    /// The emitted line.
    pub message: String,
}

/// Where consented records go.
///
/// The default sink forwards to `tracing`; tests install collecting sinks.
pub trait LogSink: Send + Sync {
    /// Deliver one record. Must not block the caller for long: this runs on
    /// a native-function listener thread.
    fn emit(&self, record: &LogRecord);
}

/// The default sink: forwards records to `tracing` at the record's level.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, record: &LogRecord) {
        match record.severity {
            LogSeverity::Log => tracing::info!(
                uuid = %record.request_uuid,
                context = %record.context,
                "{}",
                record.message
            ),
            LogSeverity::Warn => tracing::warn!(
                uuid = %record.request_uuid,
                context = %record.context,
                "{}",
                record.message
            ),
            LogSeverity::Error => tracing::error!(
                uuid = %record.request_uuid,
                context = %record.context,
                "{}",
                record.message
            ),
        }
    }
}

/// Applies the consent check and forwards passing records to the sink.
pub struct ConsentedLogger {
    server_token: Option<String>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for ConsentedLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentedLogger")
            .field("server_token", &self.server_token)
            .finish_non_exhaustive()
    }
}

impl ConsentedLogger {
    /// Build a logger from the configured server token.
    ///
    /// An absent or empty token disables consented logging entirely (with a
    /// startup warning). A non-empty token shorter than six characters is a
    /// configuration error.
    pub fn new(server_token: Option<String>, sink: Arc<dyn LogSink>) -> crate::Result<Self> {
        let server_token = match server_token {
            None => None,
            Some(token) if token.is_empty() => None,
            Some(token) if token.len() < MIN_TOKEN_LENGTH => {
                return Err(crate::RomaError::InvalidArgument(format!(
                    "server token length must be at least {MIN_TOKEN_LENGTH}"
                )));
            }
            Some(token) => Some(token),
        };
        if server_token.is_none() {
            tracing::warn!("server token is not set, consented logging is turned off");
        }
        Ok(Self { server_token, sink })
    }

    /// Whether a request carrying `client_token` may log.
    pub fn is_consented(&self, client_token: Option<&str>) -> bool {
        match (&self.server_token, client_token) {
            (Some(server), Some(client)) => !client.is_empty() && server == client,
            _ => false,
        }
    }

    /// Emit one guest record if the request consented; drop it otherwise.
    pub fn emit(
        &self,
        request_uuid: &str,
        log_context: &RequestLogContext,
        severity: LogSeverity,
        message: &str,
    ) {
        if !self.is_consented(log_context.client_token.as_deref()) {
            return;
        }
        metrics::counter!(METRIC_CONSENTED_LOG_RECORDS).increment(1);
        self.sink.emit(&LogRecord {
            severity,
            request_uuid: request_uuid.to_string(),
            context: format_context(&log_context.context),
            message: message.to_string(),
        });
    }
}

/// Format the context map as `(k: v, k2: v2)`, skipping empty values.
pub(crate) fn format_context(map: &BTreeMap<String, String>) -> String {
    let formatted = map
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join(", ");
    if formatted.is_empty() {
        String::new()
    } else {
        format!("({formatted}) ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<LogRecord>>);

    impl LogSink for CollectingSink {
        fn emit(&self, record: &LogRecord) {
            self.0.lock().push(record.clone());
        }
    }

    fn context(token: Option<&str>) -> RequestLogContext {
        RequestLogContext {
            client_token: token.map(str::to_string),
            context: BTreeMap::from([
                ("origin".to_string(), "example.com".to_string()),
                ("empty".to_string(), String::new()),
            ]),
        }
    }

    #[test]
    fn matching_token_emits() {
        let sink = Arc::new(CollectingSink::default());
        let logger =
            ConsentedLogger::new(Some("secret-token".to_string()), sink.clone()).unwrap();

        logger.emit("uuid-1", &context(Some("secret-token")), LogSeverity::Log, "hello");

        let records = sink.0.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "hello");
        assert_eq!(records[0].context, "(origin: example.com) ");
    }

    #[test]
    fn mismatched_or_absent_token_drops() {
        let sink = Arc::new(CollectingSink::default());
        let logger =
            ConsentedLogger::new(Some("secret-token".to_string()), sink.clone()).unwrap();

        logger.emit("u", &context(Some("wrong-token")), LogSeverity::Warn, "nope");
        logger.emit("u", &context(None), LogSeverity::Error, "nope");
        logger.emit("u", &context(Some("")), LogSeverity::Log, "nope");

        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn unset_server_token_disables_logging() {
        let sink = Arc::new(CollectingSink::default());
        let logger = ConsentedLogger::new(None, sink.clone()).unwrap();
        assert!(!logger.is_consented(Some("anything")));

        logger.emit("u", &context(Some("anything")), LogSeverity::Log, "nope");
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn short_server_token_is_rejected() {
        let sink = Arc::new(CollectingSink::default());
        let err = ConsentedLogger::new(Some("short".to_string()), sink).unwrap_err();
        assert!(err.to_string().contains("at least 6"), "got: {err}");
    }

    #[test]
    fn context_formatting_skips_empty_values() {
        assert_eq!(format_context(&BTreeMap::new()), "");
        let map = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), String::new()),
            ("c".to_string(), "3".to_string()),
        ]);
        assert_eq!(format_context(&map), "(a: 1, c: 3) ");
    }
}
