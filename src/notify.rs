//! Notification delivery for time-locked requests
//!
//! The coordinator renders a message and hands it to a
//! [`NotificationBroker`]. Delivery semantics (email, SMS, chat) live
//! outside the core; the built-in broker writes the rendered message to the
//! audit log so a bare gateway still leaves a trace.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Template applied when a time-lock policy does not configure its own.
pub const DEFAULT_TEMPLATE: &str = "\
A time-locked request is pending and will execute at {{ request_execution_time }} \
unless cancelled within {{ time_lock_duration }} minutes.

Request id: {{ request_uuid }}

{{ request_information }}
";

/// A rendered message and who should receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Hands a notification to whatever delivers it.
#[async_trait]
pub trait NotificationBroker: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Broker that records notifications in the process log.
pub struct LogBroker;

#[async_trait]
impl NotificationBroker for LogBroker {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            recipients = notification.recipients.join(", "),
            message = %notification.message,
            "time-lock notification"
        );
        Ok(())
    }
}

/// Replace every `{{ name }}` token with its context value. Rendering is
/// literal substring replacement; unknown tokens are left in place.
pub fn render_template(template: &str, context: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in context {
        rendered = rendered.replace(&format!("{{{{ {name} }}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_replaces_all_occurrences() {
        let rendered = render_template(
            "id={{ request_uuid }} again={{ request_uuid }}",
            &[("request_uuid", "abc123".to_string())],
        );
        assert_eq!(rendered, "id=abc123 again=abc123");
    }

    #[test]
    fn test_render_template_leaves_unknown_tokens() {
        let rendered = render_template("{{ mystery }}", &[("known", "x".to_string())]);
        assert_eq!(rendered, "{{ mystery }}");
    }

    #[test]
    fn test_default_template_mentions_every_variable() {
        for name in [
            "request_information",
            "request_execution_time",
            "time_lock_duration",
            "request_uuid",
        ] {
            assert!(DEFAULT_TEMPLATE.contains(&format!("{{{{ {name} }}}}")));
        }
    }

    #[tokio::test]
    async fn test_log_broker_accepts_notifications() {
        let broker = LogBroker;
        let result = broker
            .send(Notification {
                recipients: vec!["ops@example.com".to_string()],
                message: "hello".to_string(),
            })
            .await;
        assert!(result.is_ok());
    }
}
