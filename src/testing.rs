//! Fixtures for unit tests: a throwaway libSQL database, app state and
//! seeded rows.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::{
    AuditConfig, AuthConfig, BillingConfig, Config, DatabaseBackend, DatabaseConfig,
    EmailConfig, ReminderConfig, ServerConfig, UploadConfig,
};
use crate::db::libsql::LibSqlBackend;
use crate::db::{
    CreateInvoiceParams, CreateMatterParams, CreateTaskParams, CreateUserParams, Database,
    InvoiceRecord, LineItem, MatterRecord, MatterStatus, Role, TaskPriority, TaskRecord,
    TaskStatus, UserRecord,
};
use crate::email::{EmailSender, LogEmailSender, Mailer};
use crate::legal::audit::AuditLog;
use crate::web::server::AppState;

/// Password of every seeded user.
pub const TEST_PASSWORD: &str = "correct-horse-battery";

static PASSWORD_HASH: OnceCell<String> = OnceCell::const_new();

async fn password_hash() -> String {
    PASSWORD_HASH
        .get_or_init(|| async {
            crate::web::auth::hash_password(TEST_PASSWORD.to_string())
                .await
                .expect("hash test password")
        })
        .await
        .clone()
}

pub async fn test_db() -> (Arc<dyn Database>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path()).await;
    (db, dir)
}

async fn open_db(dir: &Path) -> Arc<dyn Database> {
    let backend = LibSqlBackend::new_local(&dir.join("test.db"))
        .await
        .expect("open libsql");
    backend.run_migrations().await.expect("migrations");
    Arc::new(backend)
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            cors_origins: vec!["http://localhost:5173".into()],
        },
        database: DatabaseConfig {
            backend: DatabaseBackend::LibSql,
            libsql_path: dir.join("test.db"),
            url: None,
            pool_size: 4,
        },
        auth: AuthConfig {
            jwt_secret: SecretString::from("test-secret-test-secret-test-secret".to_string()),
            token_ttl_hours: 12,
            login_max_attempts: 5,
            login_window_secs: 300,
            api_max_requests: 10_000,
            api_window_secs: 60,
        },
        uploads: UploadConfig {
            dir: dir.join("uploads"),
            max_document_bytes: 1024 * 1024,
            max_photo_bytes: 64 * 1024,
        },
        email: EmailConfig {
            enabled: false,
            api_url: None,
            api_key: None,
            from: "noreply@firm.test".into(),
        },
        reminders: ReminderConfig {
            enabled: false,
            interval_secs: 3600,
            lead_hours: 24,
        },
        billing: BillingConfig {
            due_soon_days: 7,
            default_tax_rate: Decimal::ZERO,
        },
        audit: AuditConfig {
            enabled: false,
            path: dir.join("logs/audit.jsonl"),
            hash_chain: false,
        },
    }
}

pub async fn test_state() -> (Arc<AppState>, TempDir) {
    test_state_with_sender(Arc::new(LogEmailSender)).await
}

pub async fn test_state_with_sender(sender: Arc<dyn EmailSender>) -> (Arc<AppState>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let db = open_db(dir.path()).await;
    let mailer = Arc::new(Mailer::new(config.email.from.clone(), sender).expect("mailer"));
    let state = AppState::new(&config, db, mailer, AuditLog::disabled());
    (Arc::new(state), dir)
}

pub async fn seed_user(db: &dyn Database, name: &str, role: Role) -> UserRecord {
    let slug: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    let email = format!("{}.{}@firm.test", slug, &Uuid::new_v4().simple().to_string()[..8]);
    db.create_user(&CreateUserParams {
        name: name.to_string(),
        email,
        password_hash: password_hash().await,
        role,
        phone: None,
        title: None,
        is_active: true,
    })
    .await
    .expect("seed user")
}

pub async fn seed_matter(
    db: &dyn Database,
    created_by: Uuid,
    client_id: Option<Uuid>,
    member_ids: Vec<Uuid>,
) -> MatterRecord {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    db.create_matter(&CreateMatterParams {
        matter_number: format!("MAT-TEST-{suffix}"),
        title: format!("Matter {suffix}"),
        description: None,
        practice_area: Some("Litigation".into()),
        status: MatterStatus::Open,
        client_id,
        member_ids,
        opened_on: None,
        closed_on: None,
        created_by,
    })
    .await
    .expect("seed matter")
}

pub async fn seed_task(
    db: &dyn Database,
    matter_id: Uuid,
    created_by: Uuid,
    assignee_ids: Vec<Uuid>,
    due_on: Option<NaiveDate>,
) -> TaskRecord {
    db.create_task(&CreateTaskParams {
        title: "Draft motion".into(),
        description: None,
        matter_id,
        case_file_id: None,
        assignee_ids,
        priority: TaskPriority::Medium,
        status: TaskStatus::Pending,
        checklist: Vec::new(),
        progress: 0,
        due_on,
        completed_at: None,
        created_by,
    })
    .await
    .expect("seed task")
}

/// One-line invoice for `total`, issued unless `is_draft`.
pub async fn seed_invoice(
    db: &dyn Database,
    matter: &MatterRecord,
    created_by: Uuid,
    total: Decimal,
    due_date: NaiveDate,
    is_draft: bool,
) -> InvoiceRecord {
    let client_id = matter.client_id.expect("matter has a client");
    db.create_invoice(&CreateInvoiceParams {
        invoice_number: format!(
            "INV-TEST-{}",
            &Uuid::new_v4().simple().to_string()[..8].to_uppercase()
        ),
        matter_id: matter.id,
        client_id,
        issue_date: (!is_draft).then_some(due_date - chrono::Duration::days(30)),
        due_date,
        line_items: vec![LineItem {
            description: "Legal services".into(),
            quantity: Decimal::ONE,
            unit_price: total,
            amount: total,
        }],
        subtotal: total,
        tax_rate: Decimal::ZERO,
        tax: Decimal::ZERO,
        discount: Decimal::ZERO,
        total,
        is_draft,
        notes: None,
        created_by,
    })
    .await
    .expect("seed invoice")
}

/// One part of a hand-built multipart body: name, optional file name and
/// content type, payload.
pub struct Part<'a> {
    pub name: &'a str,
    pub file_name: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub data: &'a [u8],
}

impl<'a> Part<'a> {
    pub fn text(name: &'a str, value: &'a str) -> Self {
        Self {
            name,
            file_name: None,
            content_type: None,
            data: value.as_bytes(),
        }
    }

    pub fn file(file_name: &'a str, content_type: Option<&'a str>, data: &'a [u8]) -> Self {
        Self {
            name: "file",
            file_name: Some(file_name),
            content_type,
            data,
        }
    }
}

/// Build the `Multipart` extractor a handler would receive for `parts`.
pub async fn multipart(parts: &[Part<'_>]) -> axum::extract::Multipart {
    use axum::extract::FromRequest;

    const BOUNDARY: &str = "lexdesk-test-boundary";
    let mut body: Vec<u8> = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let disposition = match part.file_name {
            Some(file_name) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                part.name, file_name
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name),
        };
        body.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/")
        .header(
            axum::http::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(axum::body::Body::from(body))
        .expect("multipart request");
    axum::extract::Multipart::from_request(request, &())
        .await
        .expect("multipart extractor")
}
