//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations. Two implementations exist behind feature flags:
//!
//! - `libsql` (default): libSQL (Turso's SQLite fork) embedded file database
//! - `postgres`: `deadpool-postgres` + `tokio-postgres`
//!
//! Handlers hold an `Arc<dyn Database>`; leaf helpers can depend on a single
//! sub-trait instead.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            let backend = libsql::LibSqlBackend::new_local(&config.libsql_path).await?;
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        crate::config::DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config).await?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::Pool(format!(
            "database backend {:?} is not compiled in; enable the matching cargo feature",
            other
        ))),
    }
}

// ==================== Enumerations ====================

/// Account role. Ordered from most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Member,
    Client,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Client => "client",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "super_admin" => Some(Self::SuperAdmin),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// Matter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatterStatus {
    Open,
    OnHold,
    Closed,
}

impl MatterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::OnHold => "on_hold",
            Self::Closed => "closed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "on_hold" => Some(Self::OnHold),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Court case file state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseFileStatus {
    Active,
    Stayed,
    Closed,
}

impl CaseFileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stayed => "stayed",
            Self::Closed => "closed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "stayed" => Some(Self::Stayed),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Who a notice is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeAudience {
    Everyone,
    Staff,
    Members,
    Clients,
}

impl NoticeAudience {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Everyone => "everyone",
            Self::Staff => "staff",
            Self::Members => "members",
            Self::Clients => "clients",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "everyone" => Some(Self::Everyone),
            "staff" => Some(Self::Staff),
            "members" => Some(Self::Members),
            "clients" => Some(Self::Clients),
            _ => None,
        }
    }
}

/// Entity kinds recorded in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Matter,
    CaseFile,
    Document,
    Task,
    Invoice,
    Notice,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Matter => "matter",
            Self::CaseFile => "case_file",
            Self::Document => "document",
            Self::Task => "task",
            Self::Invoice => "invoice",
            Self::Notice => "notice",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "matter" => Some(Self::Matter),
            "case_file" => Some(Self::CaseFile),
            "document" => Some(Self::Document),
            "task" => Some(Self::Task),
            "invoice" => Some(Self::Invoice),
            "notice" => Some(Self::Notice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    Updated,
    Deleted,
    StatusChanged,
    Assigned,
    Uploaded,
    PaymentRecorded,
    Reminder,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::StatusChanged => "status_changed",
            Self::Assigned => "assigned",
            Self::Uploaded => "uploaded",
            Self::PaymentRecorded => "payment_recorded",
            Self::Reminder => "reminder",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "status_changed" => Some(Self::StatusChanged),
            "assigned" => Some(Self::Assigned),
            "uploaded" => Some(Self::Uploaded),
            "payment_recorded" => Some(Self::PaymentRecorded),
            "reminder" => Some(Self::Reminder),
            _ => None,
        }
    }
}

// ==================== Query scoping ====================

/// Which rows a caller may see.
///
/// Staff see everything; members see matters they belong to (or hold a task
/// on); clients see matters where they are the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    All,
    Member(Uuid),
    Client(Uuid),
}

/// Offset/limit window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    /// Build a page from 1-based page number and limit, clamping both.
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        let limit = limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT);
        let page = page.unwrap_or(1).max(1);
        Self {
            offset: (page - 1).saturating_mul(limit),
            limit,
        }
    }

    pub fn number(&self) -> i64 {
        self.offset / self.limit + 1
    }

    /// Unbounded window, for internal aggregation.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: i64::MAX,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Paged<T> {
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Paged<U> {
        Paged {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

// ==================== Users ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub photo_path: Option<String>,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUserParams {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub phone: Option<Option<String>>,
    pub title: Option<Option<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub search: Option<String>,
    /// When set, restrict clients to those on matters this member belongs to.
    pub visible_to_member: Option<Uuid>,
    pub page: Page,
}

// ==================== Matters ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatterRecord {
    pub id: Uuid,
    pub matter_number: String,
    pub title: String,
    pub description: Option<String>,
    pub practice_area: Option<String>,
    pub status: MatterStatus,
    pub client_id: Option<Uuid>,
    pub member_ids: Vec<Uuid>,
    pub opened_on: Option<NaiveDate>,
    pub closed_on: Option<NaiveDate>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateMatterParams {
    pub matter_number: String,
    pub title: String,
    pub description: Option<String>,
    pub practice_area: Option<String>,
    pub status: MatterStatus,
    pub client_id: Option<Uuid>,
    pub member_ids: Vec<Uuid>,
    pub opened_on: Option<NaiveDate>,
    pub closed_on: Option<NaiveDate>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMatterParams {
    pub matter_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub practice_area: Option<Option<String>>,
    pub status: Option<MatterStatus>,
    pub client_id: Option<Option<Uuid>>,
    pub member_ids: Option<Vec<Uuid>>,
    pub opened_on: Option<Option<NaiveDate>>,
    pub closed_on: Option<Option<NaiveDate>>,
}

#[derive(Debug, Clone)]
pub struct MatterFilter {
    pub visibility: Visibility,
    pub status: Option<MatterStatus>,
    pub client_id: Option<Uuid>,
    pub search: Option<String>,
    pub page: Page,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatterStatusCounts {
    pub open: i64,
    pub on_hold: i64,
    pub closed: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatusCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
}

impl TaskStatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed
    }

    pub fn add(&mut self, status: TaskStatus, count: i64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Completed => self.completed += count,
        }
    }
}

/// Raw per-matter aggregates; money totals are computed from invoices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatterAggregates {
    pub tasks: TaskStatusCounts,
    pub overdue_tasks: i64,
    pub average_progress: i64,
    pub case_file_count: i64,
    pub document_count: i64,
}

// ==================== Case files ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseFileRecord {
    pub id: Uuid,
    pub matter_id: Uuid,
    pub title: String,
    pub case_number: Option<String>,
    pub court: Option<String>,
    pub case_type: Option<String>,
    pub status: CaseFileStatus,
    pub filed_on: Option<NaiveDate>,
    pub next_hearing_on: Option<NaiveDate>,
    pub description: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateCaseFileParams {
    pub matter_id: Uuid,
    pub title: String,
    pub case_number: Option<String>,
    pub court: Option<String>,
    pub case_type: Option<String>,
    pub status: CaseFileStatus,
    pub filed_on: Option<NaiveDate>,
    pub next_hearing_on: Option<NaiveDate>,
    pub description: Option<String>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCaseFileParams {
    pub title: Option<String>,
    pub case_number: Option<Option<String>>,
    pub court: Option<Option<String>>,
    pub case_type: Option<Option<String>>,
    pub status: Option<CaseFileStatus>,
    pub filed_on: Option<Option<NaiveDate>>,
    pub next_hearing_on: Option<Option<NaiveDate>>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct CaseFileFilter {
    pub visibility: Visibility,
    pub matter_id: Option<Uuid>,
    pub status: Option<CaseFileStatus>,
    pub search: Option<String>,
    pub page: Page,
}

// ==================== Documents ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub matter_id: Uuid,
    pub case_file_id: Option<Uuid>,
    pub title: String,
    pub file_name: String,
    pub stored_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub client_visible: bool,
    pub uploaded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateDocumentParams {
    pub id: Uuid,
    pub matter_id: Uuid,
    pub case_file_id: Option<Uuid>,
    pub title: String,
    pub file_name: String,
    pub stored_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub client_visible: bool,
    pub uploaded_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateDocumentParams {
    pub title: Option<String>,
    pub case_file_id: Option<Option<Uuid>>,
    pub client_visible: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct DocumentFilter {
    pub visibility: Visibility,
    pub matter_id: Option<Uuid>,
    pub case_file_id: Option<Uuid>,
    pub search: Option<String>,
    pub page: Page,
}

// ==================== Tasks ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: Uuid,
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub matter_id: Uuid,
    pub case_file_id: Option<Uuid>,
    pub assignee_ids: Vec<Uuid>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub checklist: Vec<ChecklistItem>,
    pub progress: i32,
    pub due_on: Option<NaiveDate>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub title: String,
    pub description: Option<String>,
    pub matter_id: Uuid,
    pub case_file_id: Option<Uuid>,
    pub assignee_ids: Vec<Uuid>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub checklist: Vec<ChecklistItem>,
    pub progress: i32,
    pub due_on: Option<NaiveDate>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskParams {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub case_file_id: Option<Option<Uuid>>,
    pub assignee_ids: Option<Vec<Uuid>>,
    pub priority: Option<TaskPriority>,
    pub status: Option<TaskStatus>,
    pub checklist: Option<Vec<ChecklistItem>>,
    pub progress: Option<i32>,
    pub due_on: Option<Option<NaiveDate>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub reminder_sent_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub visibility: Visibility,
    pub status: Option<TaskStatus>,
    pub matter_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub priority: Option<TaskPriority>,
    /// Only open tasks due strictly before this date.
    pub overdue_before: Option<NaiveDate>,
    /// Only open tasks due within this inclusive window.
    pub due_between: Option<(NaiveDate, NaiveDate)>,
    pub search: Option<String>,
    pub page: Page,
}

impl TaskFilter {
    pub fn new(visibility: Visibility) -> Self {
        Self {
            visibility,
            status: None,
            matter_id: None,
            assignee_id: None,
            priority: None,
            overdue_before: None,
            due_between: None,
            search: None,
            page: Page::default(),
        }
    }
}

/// Per-user task outcomes used for leaderboard scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardRow {
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
    pub completed: i64,
    pub on_time: i64,
    pub overdue_open: i64,
}

// ==================== Invoices ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub invoice_number: String,
    pub matter_id: Uuid,
    pub client_id: Uuid,
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub is_draft: bool,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceRecord {
    pub fn balance(&self) -> Decimal {
        (self.total - self.amount_paid).round_dp(2)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub method: Option<String>,
    pub reference: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub invoice_number: String,
    pub matter_id: Uuid,
    pub client_id: Uuid,
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub is_draft: bool,
    pub notes: Option<String>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateInvoiceParams {
    pub issue_date: Option<Option<NaiveDate>>,
    pub due_date: Option<NaiveDate>,
    pub line_items: Option<Vec<LineItem>>,
    pub subtotal: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub tax: Option<Decimal>,
    pub discount: Option<Decimal>,
    pub total: Option<Decimal>,
    pub is_draft: Option<bool>,
    pub notes: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentParams {
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub method: Option<String>,
    pub reference: Option<String>,
    pub recorded_by: Uuid,
}

#[derive(Debug, Clone)]
pub struct InvoiceFilter {
    pub visibility: Visibility,
    pub matter_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
}

// ==================== Notices ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeRecord {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub audience: NoticeAudience,
    pub pinned: bool,
    pub published_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateNoticeParams {
    pub title: String,
    pub body: String,
    pub audience: NoticeAudience,
    pub pinned: bool,
    pub published_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateNoticeParams {
    pub title: Option<String>,
    pub body: Option<String>,
    pub audience: Option<NoticeAudience>,
    pub pinned: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
pub struct NoticeFilter {
    pub audiences: Vec<NoticeAudience>,
    /// Hide notices whose `expires_at` is at or before this instant.
    pub active_at: Option<DateTime<Utc>>,
    pub page: Page,
}

// ==================== Activity & notifications ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: ActivityAction,
    pub summary: String,
    pub changes: Vec<FieldChange>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateActivityParams {
    pub actor_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: ActivityAction,
    pub summary: String,
    pub changes: Vec<FieldChange>,
    /// Users who receive a notification. The actor is filtered out.
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub activity: ActivityRecord,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActivityFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub page: Page,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `Database` supertrait
// combines them all, so `Arc<dyn Database>` consumers see one surface.

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, input: &CreateUserParams) -> Result<UserRecord, DatabaseError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError>;
    async fn get_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<UserRecord>, DatabaseError>;
    /// Returns the user and their stored password hash.
    async fn get_user_credentials(
        &self,
        email: &str,
    ) -> Result<Option<(UserRecord, String)>, DatabaseError>;
    async fn get_password_hash(&self, id: Uuid) -> Result<Option<String>, DatabaseError>;
    async fn list_users(&self, filter: &UserFilter) -> Result<Paged<UserRecord>, DatabaseError>;
    async fn update_user(
        &self,
        id: Uuid,
        input: &UpdateUserParams,
    ) -> Result<Option<UserRecord>, DatabaseError>;
    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<bool, DatabaseError>;
    async fn set_photo_path(
        &self,
        id: Uuid,
        path: Option<&str>,
    ) -> Result<Option<UserRecord>, DatabaseError>;
    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;
    async fn delete_user(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn count_users_with_role(&self, role: Role) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait MatterStore: Send + Sync {
    async fn create_matter(
        &self,
        input: &CreateMatterParams,
    ) -> Result<MatterRecord, DatabaseError>;
    async fn get_matter(&self, id: Uuid) -> Result<Option<MatterRecord>, DatabaseError>;
    async fn list_matters(
        &self,
        filter: &MatterFilter,
    ) -> Result<Paged<MatterRecord>, DatabaseError>;
    async fn update_matter(
        &self,
        id: Uuid,
        input: &UpdateMatterParams,
    ) -> Result<Option<MatterRecord>, DatabaseError>;
    async fn delete_matter(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn is_matter_visible(
        &self,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<bool, DatabaseError>;
    async fn matter_numbers_with_prefix(&self, prefix: &str)
    -> Result<Vec<String>, DatabaseError>;
    async fn count_client_matters(&self, client_id: Uuid) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait CaseFileStore: Send + Sync {
    async fn create_case_file(
        &self,
        input: &CreateCaseFileParams,
    ) -> Result<CaseFileRecord, DatabaseError>;
    async fn get_case_file(&self, id: Uuid) -> Result<Option<CaseFileRecord>, DatabaseError>;
    async fn list_case_files(
        &self,
        filter: &CaseFileFilter,
    ) -> Result<Paged<CaseFileRecord>, DatabaseError>;
    async fn update_case_file(
        &self,
        id: Uuid,
        input: &UpdateCaseFileParams,
    ) -> Result<Option<CaseFileRecord>, DatabaseError>;
    async fn delete_case_file(&self, id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(
        &self,
        input: &CreateDocumentParams,
    ) -> Result<DocumentRecord, DatabaseError>;
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, DatabaseError>;
    async fn list_documents(
        &self,
        filter: &DocumentFilter,
    ) -> Result<Paged<DocumentRecord>, DatabaseError>;
    async fn update_document(
        &self,
        id: Uuid,
        input: &UpdateDocumentParams,
    ) -> Result<Option<DocumentRecord>, DatabaseError>;
    async fn delete_document(&self, id: Uuid) -> Result<bool, DatabaseError>;
    /// Stored paths of every document on a matter, for cleanup before deletion.
    async fn document_paths_for_matter(
        &self,
        matter_id: Uuid,
    ) -> Result<Vec<String>, DatabaseError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, input: &CreateTaskParams) -> Result<TaskRecord, DatabaseError>;
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Paged<TaskRecord>, DatabaseError>;
    async fn update_task(
        &self,
        id: Uuid,
        input: &UpdateTaskParams,
    ) -> Result<Option<TaskRecord>, DatabaseError>;
    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn task_status_counts(
        &self,
        visibility: Visibility,
    ) -> Result<TaskStatusCounts, DatabaseError>;
    /// Open tasks due on or before `due_by` that have not been reminded yet.
    async fn tasks_due_for_reminder(
        &self,
        due_by: NaiveDate,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;
    async fn is_task_assignee(&self, task_id: Uuid, user_id: Uuid)
    -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn create_invoice(
        &self,
        input: &CreateInvoiceParams,
    ) -> Result<InvoiceRecord, DatabaseError>;
    async fn get_invoice(&self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError>;
    /// All invoices matching the filter, newest first. Status filtering and
    /// paging happen after status inference.
    async fn list_invoices(
        &self,
        filter: &InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, DatabaseError>;
    async fn update_invoice(
        &self,
        id: Uuid,
        input: &UpdateInvoiceParams,
    ) -> Result<Option<InvoiceRecord>, DatabaseError>;
    async fn delete_invoice(&self, id: Uuid) -> Result<bool, DatabaseError>;
    /// Atomically append a payment and bump `amount_paid`. Fails with
    /// `Constraint` when the payment exceeds the outstanding balance.
    async fn record_payment(
        &self,
        invoice_id: Uuid,
        input: &CreatePaymentParams,
    ) -> Result<Option<(InvoiceRecord, PaymentRecord)>, DatabaseError>;
    async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<PaymentRecord>, DatabaseError>;
    async fn invoice_numbers_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, DatabaseError>;
    async fn count_invoices_for_matter(&self, matter_id: Uuid) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait NoticeStore: Send + Sync {
    async fn create_notice(&self, input: &CreateNoticeParams)
    -> Result<NoticeRecord, DatabaseError>;
    async fn get_notice(&self, id: Uuid) -> Result<Option<NoticeRecord>, DatabaseError>;
    async fn list_notices(
        &self,
        filter: &NoticeFilter,
    ) -> Result<Paged<NoticeRecord>, DatabaseError>;
    async fn update_notice(
        &self,
        id: Uuid,
        input: &UpdateNoticeParams,
    ) -> Result<Option<NoticeRecord>, DatabaseError>;
    async fn delete_notice(&self, id: Uuid) -> Result<bool, DatabaseError>;
    /// Ids of active users whose role falls in the notice audience.
    async fn audience_user_ids(
        &self,
        roles: &[Role],
    ) -> Result<Vec<Uuid>, DatabaseError>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn record_activity(
        &self,
        input: &CreateActivityParams,
    ) -> Result<ActivityRecord, DatabaseError>;
    async fn list_activity(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Paged<ActivityRecord>, DatabaseError>;
    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        page: Page,
    ) -> Result<Paged<NotificationRecord>, DatabaseError>;
    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, DatabaseError>;
    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
    async fn mark_all_notifications_read(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;
}

#[async_trait]
pub trait DashboardStore: Send + Sync {
    async fn matter_status_counts(
        &self,
        visibility: Visibility,
    ) -> Result<MatterStatusCounts, DatabaseError>;
    async fn count_overdue_tasks(
        &self,
        visibility: Visibility,
        today: NaiveDate,
    ) -> Result<i64, DatabaseError>;
    async fn matter_aggregates(
        &self,
        matter_id: Uuid,
        today: NaiveDate,
    ) -> Result<MatterAggregates, DatabaseError>;
    /// Task outcomes for every active internal assignee.
    async fn leaderboard_rows(
        &self,
        since: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<Vec<LeaderboardRow>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database:
    UserStore
    + MatterStore
    + CaseFileStore
    + DocumentStore
    + TaskStore
    + InvoiceStore
    + NoticeStore
    + ActivityStore
    + DashboardStore
    + Send
    + Sync
{
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
