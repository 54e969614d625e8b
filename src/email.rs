//! Outbound email for task assignment and reminders.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tera::{Context, Tera};

use crate::config::EmailConfig;
use crate::error::EmailError;

const TASK_ASSIGNED: &str = "task_assigned";
const TASK_REMINDER: &str = "task_reminder";

const TASK_ASSIGNED_TEMPLATE: &str = "Hello {{ recipient }},

{{ actor }} assigned you a task on {{ matter }}:

  {{ title }}
{% if due_on %}  Due: {{ due_on }}
{% endif %}  Priority: {{ priority }}

Sign in to LexDesk to view the details.
";

const TASK_REMINDER_TEMPLATE: &str = "Hello {{ recipient }},

This is a reminder that the following task on {{ matter }} is due {{ due_on }}:

  {{ title }}
  Status: {{ status }}{% if progress > 0 %} ({{ progress }}% done){% endif %}

Sign in to LexDesk to update it.
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Posts messages as JSON to an HTTP mail API.
pub struct HttpEmailSender {
    client: reqwest::Client,
    api_url: url::Url,
    api_key: Option<SecretString>,
}

impl HttpEmailSender {
    pub fn new(api_url: url::Url, api_key: Option<SecretString>) -> Result<Self, EmailError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            api_key,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let mut request = self.client.post(self.api_url.clone()).json(message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        tracing::info!(to = %message.to, subject = %message.subject, "email delivery disabled; not sent");
        Ok(())
    }
}

pub fn sender_from_config(config: &EmailConfig) -> Result<Arc<dyn EmailSender>, EmailError> {
    match (&config.api_url, config.enabled) {
        (Some(url), true) => Ok(Arc::new(HttpEmailSender::new(
            url.clone(),
            config.api_key.clone(),
        )?)),
        _ => Ok(Arc::new(LogEmailSender)),
    }
}

/// Facts needed to describe a task in an email.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEmail {
    pub recipient: String,
    pub title: String,
    pub matter: String,
    pub due_on: Option<NaiveDate>,
    pub priority: String,
    pub status: String,
    pub progress: i32,
}

/// Renders messages and hands them to the configured sender.
pub struct Mailer {
    from: String,
    templates: Tera,
    sender: Arc<dyn EmailSender>,
}

impl Mailer {
    pub fn new(from: impl Into<String>, sender: Arc<dyn EmailSender>) -> Result<Self, EmailError> {
        let mut templates = Tera::default();
        templates
            .add_raw_templates(vec![
                (TASK_ASSIGNED, TASK_ASSIGNED_TEMPLATE),
                (TASK_REMINDER, TASK_REMINDER_TEMPLATE),
            ])
            .map_err(|e| EmailError::Template(e.to_string()))?;
        Ok(Self {
            from: from.into(),
            templates,
            sender,
        })
    }

    pub fn task_assigned(
        &self,
        to: &str,
        actor: &str,
        task: &TaskEmail,
    ) -> Result<EmailMessage, EmailError> {
        let mut context = Context::from_serialize(task)
            .map_err(|e| EmailError::Template(e.to_string()))?;
        context.insert("actor", actor);
        Ok(EmailMessage {
            from: self.from.clone(),
            to: to.to_string(),
            subject: format!("New task: {}", task.title),
            text: self.render(TASK_ASSIGNED, &context)?,
        })
    }

    pub fn task_reminder(&self, to: &str, task: &TaskEmail) -> Result<EmailMessage, EmailError> {
        let context = Context::from_serialize(task)
            .map_err(|e| EmailError::Template(e.to_string()))?;
        let due = task
            .due_on
            .map(|d| d.to_string())
            .unwrap_or_else(|| "soon".to_string());
        Ok(EmailMessage {
            from: self.from.clone(),
            to: to.to_string(),
            subject: format!("Reminder: {} is due {}", task.title, due),
            text: self.render(TASK_REMINDER, &context)?,
        })
    }

    /// Send and log the outcome. Delivery problems never propagate.
    pub async fn deliver(&self, message: Result<EmailMessage, EmailError>) -> bool {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("failed to build email: {}", e);
                return false;
            }
        };
        match self.sender.send(&message).await {
            Ok(()) => {
                tracing::debug!(to = %message.to, subject = %message.subject, "email sent");
                true
            }
            Err(e) => {
                tracing::warn!(to = %message.to, "email delivery failed: {}", e);
                false
            }
        }
    }

    fn render(&self, name: &str, context: &Context) -> Result<String, EmailError> {
        self.templates
            .render(name, context)
            .map_err(|e| EmailError::Template(e.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;

    fn task() -> TaskEmail {
        TaskEmail {
            recipient: "Ana".into(),
            title: "Draft reply brief".into(),
            matter: "MAT-2025-0004 Smith v. Jones".into(),
            due_on: NaiveDate::from_ymd_opt(2025, 5, 2),
            priority: "high".into(),
            status: "in_progress".into(),
            progress: 50,
        }
    }

    #[test]
    fn assignment_email_names_actor_and_due_date() {
        let mailer = Mailer::new("noreply@firm.test", Arc::new(LogEmailSender)).unwrap();
        let message = mailer.task_assigned("ana@firm.test", "Ben", &task()).unwrap();
        assert_eq!(message.subject, "New task: Draft reply brief");
        assert!(message.text.contains("Ben assigned you a task on MAT-2025-0004"));
        assert!(message.text.contains("Due: 2025-05-02"));
        assert_eq!(message.from, "noreply@firm.test");
    }

    #[test]
    fn reminder_email_shows_progress() {
        let mailer = Mailer::new("noreply@firm.test", Arc::new(LogEmailSender)).unwrap();
        let message = mailer.task_reminder("ana@firm.test", &task()).unwrap();
        assert_eq!(message.subject, "Reminder: Draft reply brief is due 2025-05-02");
        assert!(message.text.contains("(50% done)"));
    }

    #[tokio::test]
    async fn deliver_hands_message_to_sender() {
        let sender = Arc::new(RecordingSender::default());
        let mailer = Mailer::new("noreply@firm.test", sender.clone()).unwrap();
        let delivered = mailer
            .deliver(mailer.task_reminder("ana@firm.test", &task()))
            .await;
        assert!(delivered);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn disabled_config_logs_instead_of_sending() {
        let config = EmailConfig {
            enabled: false,
            api_url: None,
            api_key: None,
            from: "noreply@firm.test".into(),
        };
        assert!(sender_from_config(&config).is_ok());
    }
}
