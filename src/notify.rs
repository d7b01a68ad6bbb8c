//! Notification side effects
//!
//! Notifications are fire-and-forget: [`dispatch`] runs the notifier on its
//! own task after the ledger call has returned, and a failure is only logged.
//! Nothing here can roll back or delay a ledger write.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Outgoing message, addressed to a user id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

impl Notification {
    pub fn text(to: impl Into<String>, subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            text: Some(text.into()),
            html: None,
        }
    }

    /// A recipient, a subject and at least one body are required.
    pub fn validate(&self) -> Result<(), NotifyError> {
        let has_body = self.text.as_deref().is_some_and(|t| !t.is_empty())
            || self.html.as_deref().is_some_and(|h| !h.is_empty());
        if self.to.trim().is_empty() || self.subject.trim().is_empty() || !has_body {
            return Err(NotifyError::MissingFields);
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Missing fields")]
    MissingFields,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook rejected notification with status {0}")]
    Rejected(u16),
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Logs notifications instead of delivering them
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        notification.validate()?;
        info!(to = %notification.to, subject = %notification.subject, "Notification logged");
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        notification.validate()?;
        let response = self
            .http_client
            .post(&self.url)
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Send in the background. Failures are logged and dropped.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            warn!(to = %notification.to, subject = %notification.subject, error = %e, "Notification failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_missing_body_rejected() {
        let mut notification = Notification::text("u1", "Hello", "");
        assert!(matches!(notification.validate(), Err(NotifyError::MissingFields)));

        notification.html = Some("<p>hi</p>".into());
        assert!(notification.validate().is_ok());
    }

    #[tokio::test]
    async fn test_log_notifier_validates() {
        let notifier = LogNotifier;
        assert!(notifier.notify(&Notification::text("u1", "s", "t")).await.is_ok());
        assert!(notifier.notify(&Notification::text("", "s", "t")).await.is_err());
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .and(body_partial_json(serde_json::json!({ "to": "u1", "subject": "Badge earned" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/notify", server.uri())).unwrap();
        notifier
            .notify(&Notification::text("u1", "Badge earned", "Food Hero"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        let err = notifier
            .notify(&Notification::text("u1", "s", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(500)));
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        // Invalid notification: logged, not propagated
        dispatch(notifier, Notification::text("", "", "")).await.unwrap();
    }
}
