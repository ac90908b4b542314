use super::RequestLogRecord;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::info;

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &RequestLogRecord) -> Result<()>;
}

/// Emits each record as a structured event on the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &RequestLogRecord) -> Result<()> {
        info!(
            target: "audit",
            id = %record.id,
            request_id = %record.request_id,
            route_id = record.route_id.as_deref().unwrap_or("-"),
            service_id = record.service_id.as_deref().unwrap_or("-"),
            api_key_id = record.api_key_id.as_deref().unwrap_or("-"),
            user_id = record.user_id.as_deref().unwrap_or("-"),
            ip = %record.ip,
            method = %record.method,
            path = %record.path,
            status = record.status_code,
            is_error = record.is_error,
            error = record.error_message.as_deref().unwrap_or(""),
            response_time_ms = record.response_time_ms,
            "request"
        );
        Ok(())
    }
}

/// POSTs each record as JSON to a collector endpoint
pub struct HttpAuditSink {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpAuditSink {
    pub fn new(url: String, token: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn write(&self, record: &RequestLogRecord) -> Result<()> {
        let mut request = self.client.post(&self.url).json(record);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("Audit collector unreachable: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Internal(format!(
                "Audit collector returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_sink_posts_camel_case_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs"))
            .and(header("authorization", "Bearer audit-token"))
            .and(body_partial_json(serde_json::json!({
                "requestId": "req-1",
                "routeId": "route-1",
                "statusCode": 200,
                "isError": false
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpAuditSink::new(
            format!("{}/logs", server.uri()),
            Some(SecretString::new("audit-token".to_string())),
            Duration::from_secs(1),
        )
        .unwrap();

        let mut record = RequestLogRecord::sample();
        record.route_id = Some("route-1".to_string());
        sink.write(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_sink_reports_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = HttpAuditSink::new(server.uri(), None, Duration::from_secs(1)).unwrap();
        assert!(sink.write(&RequestLogRecord::sample()).await.is_err());
    }

    #[tokio::test]
    async fn test_tracing_sink_never_fails() {
        assert!(TracingAuditSink
            .write(&RequestLogRecord::sample())
            .await
            .is_ok());
    }
}
