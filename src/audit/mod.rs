//! Per-request audit records
//!
//! Every request the gateway mediates yields exactly one [`RequestLogRecord`].
//! Records are queued on a bounded channel and written by a background task,
//! so a slow or failing sink never delays or alters a response.

pub mod sink;

pub use sink::{AuditSink, HttpAuditSink, TracingAuditSink};

use crate::auth::AuthContext;
use crate::config::{AuditConfig, AuditSinkConfig, RouteConfig};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status recorded when the caller went away before a response was produced
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogRecord {
    pub id: Uuid,
    pub request_id: String,
    pub route_id: Option<String>,
    pub service_id: Option<String>,
    pub api_key_id: Option<String>,
    pub user_id: Option<String>,
    pub ip: String,
    pub user_agent: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Non-blocking handle to the audit worker
#[derive(Clone)]
pub struct AuditLogger {
    tx: Option<mpsc::Sender<RequestLogRecord>>,
}

impl AuditLogger {
    /// Start a worker that drains records into `sink`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, buffer_size: usize, max_retries: u32) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLogRecord>(buffer_size.max(1));

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                deliver(sink.as_ref(), &record, max_retries).await;
            }
            debug!("Audit worker stopped");
        });

        info!(buffer_size, max_retries, "Audit logger started");
        Self { tx: Some(tx) }
    }

    /// Build the logger described by configuration
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        if !config.enabled {
            info!("Audit logging disabled");
            return Ok(Self::disabled());
        }

        let sink: Arc<dyn AuditSink> = match &config.sink {
            AuditSinkConfig::Tracing => Arc::new(TracingAuditSink),
            AuditSinkConfig::Http {
                url,
                token,
                timeout_ms,
            } => Arc::new(HttpAuditSink::new(
                url.clone(),
                token.clone(),
                Duration::from_millis(*timeout_ms),
            )?),
        };

        Ok(Self::spawn(sink, config.buffer_size, config.max_retries))
    }

    /// Logger that discards every record
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a record without waiting
    pub fn record(&self, record: RequestLogRecord) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                crate::metrics::record_audit_dropped("queue_full");
                warn!(request_id = %record.request_id, "Audit queue full, dropping record");
            }
            Err(TrySendError::Closed(record)) => {
                crate::metrics::record_audit_dropped("closed");
                warn!(request_id = %record.request_id, "Audit worker gone, dropping record");
            }
        }
    }

    /// Start auditing a request; the returned guard records exactly once
    pub fn begin(&self, draft: RequestDraft) -> AuditGuard {
        AuditGuard {
            logger: self.clone(),
            draft,
            started: Instant::now(),
            finished: false,
        }
    }
}

async fn deliver(sink: &dyn AuditSink, record: &RequestLogRecord, max_retries: u32) {
    let mut attempt = 0;
    loop {
        match sink.write(record).await {
            Ok(()) => return,
            Err(e) if attempt < max_retries => {
                attempt += 1;
                debug!(
                    request_id = %record.request_id,
                    attempt,
                    error = %e,
                    "Retrying audit write"
                );
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            Err(e) => {
                crate::metrics::record_audit_dropped("sink_error");
                warn!(request_id = %record.request_id, error = %e, "Failed to write audit record");
                return;
            }
        }
    }
}

/// Request facts known when handling starts
#[derive(Debug, Clone, Default)]
pub struct RequestDraft {
    pub request_id: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub method: String,
    pub path: String,
    pub route_id: Option<String>,
    pub service_id: Option<String>,
    pub api_key_id: Option<String>,
    pub user_id: Option<String>,
}

/// Accumulates what the dispatcher learns and records it once
///
/// Dropping an unfinished guard records the request as abandoned by the
/// caller.
pub struct AuditGuard {
    logger: AuditLogger,
    draft: RequestDraft,
    started: Instant,
    finished: bool,
}

impl AuditGuard {
    pub fn set_route(&mut self, route: &RouteConfig) {
        self.draft.route_id = Some(route.id.clone());
        self.draft.service_id = route.service_id.clone();
    }

    pub fn set_auth(&mut self, auth: &AuthContext) {
        if let Some(key) = &auth.api_key {
            self.draft.api_key_id = Some(key.id.clone());
            if self.draft.service_id.is_none() {
                self.draft.service_id = key.service_id.clone();
            }
        }
        self.draft.user_id = auth.effective_user_id().map(str::to_string);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the terminal outcome
    pub fn finish(mut self, status_code: u16, error_message: Option<String>) {
        self.emit(status_code, error_message);
    }

    fn emit(&mut self, status_code: u16, error_message: Option<String>) {
        self.finished = true;
        let draft = std::mem::take(&mut self.draft);

        self.logger.record(RequestLogRecord {
            id: Uuid::new_v4(),
            request_id: draft.request_id,
            route_id: draft.route_id,
            service_id: draft.service_id,
            api_key_id: draft.api_key_id,
            user_id: draft.user_id,
            ip: draft.ip,
            user_agent: draft.user_agent,
            method: draft.method,
            path: draft.path,
            status_code,
            is_error: status_code >= 400,
            error_message,
            response_time_ms: self.started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if !self.finished {
            debug!(request_id = %self.draft.request_id, "Request cancelled before completion");
            self.emit(
                CLIENT_CLOSED_REQUEST,
                Some("Client closed request".to_string()),
            );
        }
    }
}

#[cfg(test)]
impl RequestLogRecord {
    pub(crate) fn sample() -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: "req-1".to_string(),
            route_id: None,
            service_id: None,
            api_key_id: None,
            user_id: None,
            ip: "127.0.0.1".to_string(),
            user_agent: Some("test".to_string()),
            method: "GET".to_string(),
            path: "/api/users".to_string(),
            status_code: 200,
            is_error: false,
            error_message: None,
            response_time_ms: 3,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<RequestLogRecord>>,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for MemorySink {
        async fn write(&self, record: &RequestLogRecord) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GatewayError::Internal("collector down".to_string()));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    impl MemorySink {
        async fn wait_for(&self, count: usize) -> Vec<RequestLogRecord> {
            for _ in 0..100 {
                {
                    let records = self.records.lock().unwrap();
                    if records.len() >= count {
                        return records.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.records.lock().unwrap().clone()
        }
    }

    fn draft() -> RequestDraft {
        RequestDraft {
            request_id: "req-9".to_string(),
            ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/api/users".to_string(),
            ..RequestDraft::default()
        }
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let value = serde_json::to_value(RequestLogRecord::sample()).unwrap();
        assert!(value.get("requestId").is_some());
        assert!(value.get("statusCode").is_some());
        assert!(value.get("responseTimeMs").is_some());
        assert!(value.get("request_id").is_none());
    }

    #[tokio::test]
    async fn test_guard_records_outcome_once() {
        let sink = Arc::new(MemorySink::default());
        let logger = AuditLogger::spawn(sink.clone(), 16, 0);

        let mut guard = logger.begin(draft());
        guard.set_route(&RouteConfig {
            id: "route-1".to_string(),
            path: "/users".to_string(),
            method: "GET".to_string(),
            target_url: "http://users".to_string(),
            is_active: true,
            rate_limit: None,
            cache_ttl: None,
            middleware: Default::default(),
            service_id: Some("svc-1".to_string()),
        });
        guard.finish(503, Some("Service unavailable".to_string()));

        let records = sink.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.records.lock().unwrap().len(), 1);

        let record = &records[0];
        assert_eq!(record.route_id.as_deref(), Some("route-1"));
        assert_eq!(record.service_id.as_deref(), Some("svc-1"));
        assert_eq!(record.status_code, 503);
        assert!(record.is_error);
        assert_eq!(record.error_message.as_deref(), Some("Service unavailable"));
    }

    #[tokio::test]
    async fn test_dropped_guard_records_client_closed() {
        let sink = Arc::new(MemorySink::default());
        let logger = AuditLogger::spawn(sink.clone(), 16, 0);

        drop(logger.begin(draft()));

        let records = sink.wait_for(1).await;
        assert_eq!(records[0].status_code, CLIENT_CLOSED_REQUEST);
        assert_eq!(
            records[0].error_message.as_deref(),
            Some("Client closed request")
        );
    }

    #[tokio::test]
    async fn test_sink_failure_is_retried_then_dropped() {
        let sink = Arc::new(MemorySink {
            failures_left: AtomicUsize::new(1),
            ..MemorySink::default()
        });
        let logger = AuditLogger::spawn(sink.clone(), 16, 1);
        logger.record(RequestLogRecord::sample());
        assert_eq!(sink.wait_for(1).await.len(), 1);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);

        let sink = Arc::new(MemorySink {
            failures_left: AtomicUsize::new(1),
            ..MemorySink::default()
        });
        let logger = AuditLogger::spawn(sink.clone(), 16, 0);
        logger.record(RequestLogRecord::sample());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks() {
        struct StuckSink;

        #[async_trait]
        impl AuditSink for StuckSink {
            async fn write(&self, _record: &RequestLogRecord) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let logger = AuditLogger::spawn(Arc::new(StuckSink), 1, 0);
        let started = Instant::now();
        for _ in 0..50 {
            logger.record(RequestLogRecord::sample());
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_disabled_logger_discards() {
        let logger = AuditLogger::disabled();
        logger.record(RequestLogRecord::sample());
        logger.begin(draft()).finish(200, None);
    }
}
