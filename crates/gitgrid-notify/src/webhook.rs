//! Webhook notifier.
//!
//! Posts each [`NotificationEvent`] as a JSON body to a configured plain
//! HTTP endpoint, one connection per event.

use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use gitgrid_state::{NodeId, RepoId};

/// An operational event worth telling a human about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    Failover {
        repo_id: RepoId,
        old_primary: NodeId,
        new_primary: NodeId,
    },
    DeadLetterReprocessFailed {
        entry_id: u64,
        repo_id: RepoId,
        error: String,
    },
}

/// Fire-and-forget notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

/// Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, event: NotificationEvent) {
        debug!(?event, "notification dropped, no webhook configured");
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid webhook url {0:?}")]
    InvalidUrl(String),

    #[error("unsupported webhook scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("webhook timed out")]
    Timeout,
}

/// Delivers events to an HTTP webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    uri: Uri,
    authority: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| NotifyError::InvalidUrl(url.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(NotifyError::UnsupportedScheme(other.to_string())),
            None => return Err(NotifyError::InvalidUrl(url.to_string())),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| NotifyError::InvalidUrl(url.to_string()))?;
        let authority = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        Ok(Self {
            uri,
            authority,
            timeout,
        })
    }

    /// POST one event and wait for the response.
    pub async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(event).map_err(|e| NotifyError::Request(e.to_string()))?;
        tokio::time::timeout(self.timeout, self.post(body))
            .await
            .map_err(|_| NotifyError::Timeout)?
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), NotifyError> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| NotifyError::Connect(e.to_string()))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NotifyError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let host = self
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| self.authority.clone());
        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let req = http::Request::builder()
            .method("POST")
            .uri(path)
            .header("host", host)
            .header("content-type", "application/json")
            .header("user-agent", "gitgrid-notify/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(resp.status().as_u16()))
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: NotificationEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(?event, "no async runtime, webhook notification dropped");
            return;
        };
        let notifier = self.clone();
        handle.spawn(async move {
            match notifier.deliver(&event).await {
                Ok(()) => debug!(?event, "webhook delivered"),
                Err(e) => warn!(error = %e, ?event, "webhook delivery failed"),
            }
        });
    }
}
