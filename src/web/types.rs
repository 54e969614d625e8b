//! Request and response DTOs for the practice API.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::db::{
    ActivityRecord, CaseFileStatus, EntityType, InvoiceRecord, LineItem, MatterRecord,
    MatterStatus, MatterStatusCounts, NoticeAudience, Page, Paged, PaymentRecord, Role,
    TaskPriority, TaskRecord, TaskStatus, TaskStatusCounts, UserRecord,
};
use crate::legal::billing::{InvoiceStatus, InvoiceSummary, LineItemInput};
use crate::legal::leaderboard::LeaderboardEntry;
use crate::legal::tasks::ChecklistInput;

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) in update bodies.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Money rendered with exactly two decimal places.
pub fn money_string(value: Decimal) -> String {
    let mut rounded = value.round_dp(2);
    rounded.rescale(2);
    rounded.to_string()
}

// --- Common ---

#[derive(Debug, Serialize)]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T> PagedResponse<T> {
    pub fn new(paged: Paged<T>, page: Page) -> Self {
        Self {
            items: paged.items,
            total: paged.total,
            page: page.number(),
            limit: page.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

// --- Auth ---

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserRecord,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

// --- Users ---

#[derive(Debug, Default, Deserialize)]
pub struct UserListQuery {
    pub role: Option<Role>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Option<Role>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    #[serde(default, deserialize_with = "nullable")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub title: Option<Option<String>>,
    pub is_active: Option<bool>,
}

// --- Matters ---

#[derive(Debug, Default, Deserialize)]
pub struct MatterListQuery {
    pub status: Option<MatterStatus>,
    pub client_id: Option<Uuid>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMatterRequest {
    pub matter_number: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub practice_area: Option<String>,
    pub status: Option<MatterStatus>,
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
    pub opened_on: Option<NaiveDate>,
    pub closed_on: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateMatterRequest {
    pub matter_number: Option<String>,
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub practice_area: Option<Option<String>>,
    pub status: Option<MatterStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub client_id: Option<Option<Uuid>>,
    pub member_ids: Option<Vec<Uuid>>,
    #[serde(default, deserialize_with = "nullable")]
    pub opened_on: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "nullable")]
    pub closed_on: Option<Option<NaiveDate>>,
}

/// Per-matter aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct MatterStats {
    pub tasks: TaskStatusCounts,
    pub overdue_tasks: i64,
    pub average_progress: i64,
    pub case_files: i64,
    pub documents: i64,
    /// Present for staff and the matter's client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoices: Option<InvoiceSummary>,
}

#[derive(Debug, Serialize)]
pub struct MatterDetail {
    #[serde(flatten)]
    pub matter: MatterRecord,
    pub stats: MatterStats,
}

// --- Case files ---

#[derive(Debug, Default, Deserialize)]
pub struct CaseFileListQuery {
    pub matter_id: Option<Uuid>,
    pub status: Option<CaseFileStatus>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCaseFileRequest {
    pub matter_id: Uuid,
    pub title: String,
    pub case_number: Option<String>,
    pub court: Option<String>,
    pub case_type: Option<String>,
    pub status: Option<CaseFileStatus>,
    pub filed_on: Option<NaiveDate>,
    pub next_hearing_on: Option<NaiveDate>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateCaseFileRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub case_number: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub court: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub case_type: Option<Option<String>>,
    pub status: Option<CaseFileStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub filed_on: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "nullable")]
    pub next_hearing_on: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
}

// --- Documents ---

#[derive(Debug, Default, Deserialize)]
pub struct DocumentListQuery {
    pub matter_id: Option<Uuid>,
    pub case_file_id: Option<Uuid>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateDocumentRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub case_file_id: Option<Option<Uuid>>,
    pub client_visible: Option<bool>,
}

// --- Tasks ---

#[derive(Debug, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub matter_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub priority: Option<TaskPriority>,
    pub overdue: Option<bool>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub matter_id: Uuid,
    pub case_file_id: Option<Uuid>,
    #[serde(default)]
    pub assignee_ids: Vec<Uuid>,
    pub priority: Option<TaskPriority>,
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub checklist: Vec<ChecklistInput>,
    pub due_on: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub case_file_id: Option<Option<Uuid>>,
    pub assignee_ids: Option<Vec<Uuid>>,
    pub priority: Option<TaskPriority>,
    pub status: Option<TaskStatus>,
    pub checklist: Option<Vec<ChecklistInput>>,
    #[serde(default, deserialize_with = "nullable")]
    pub due_on: Option<Option<NaiveDate>>,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusRequest {
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct ChecklistAddRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ChecklistToggleRequest {
    pub done: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskCountsResponse {
    #[serde(flatten)]
    pub counts: TaskStatusCounts,
    pub total: i64,
    pub overdue: i64,
}

// --- Invoices ---

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceListQuery {
    pub status: Option<String>,
    pub matter_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub invoice_number: Option<String>,
    pub matter_id: Uuid,
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub line_items: Vec<LineItemInput>,
    pub tax_rate: Option<Decimal>,
    pub discount: Option<Decimal>,
    pub is_draft: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateInvoiceRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub issue_date: Option<Option<NaiveDate>>,
    pub due_date: Option<NaiveDate>,
    pub line_items: Option<Vec<LineItemInput>>,
    pub tax_rate: Option<Decimal>,
    pub discount: Option<Decimal>,
    pub is_draft: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    pub notes: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub paid_on: Option<NaiveDate>,
    pub method: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineItemView {
    pub description: String,
    pub quantity: String,
    pub unit_price: String,
    pub amount: String,
}

impl From<&LineItem> for LineItemView {
    fn from(item: &LineItem) -> Self {
        Self {
            description: item.description.clone(),
            quantity: item.quantity.normalize().to_string(),
            unit_price: money_string(item.unit_price),
            amount: money_string(item.amount),
        }
    }
}

/// Invoice as shown to API callers, with its inferred status and balance.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceView {
    pub id: Uuid,
    pub invoice_number: String,
    pub matter_id: Uuid,
    pub client_id: Uuid,
    pub status: InvoiceStatus,
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub line_items: Vec<LineItemView>,
    pub subtotal: String,
    pub tax_rate: String,
    pub tax: String,
    pub discount: String,
    pub total: String,
    pub amount_paid: String,
    pub balance: String,
    pub is_draft: bool,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceView {
    pub fn new(invoice: &InvoiceRecord, status: InvoiceStatus) -> Self {
        Self {
            id: invoice.id,
            invoice_number: invoice.invoice_number.clone(),
            matter_id: invoice.matter_id,
            client_id: invoice.client_id,
            status,
            issue_date: invoice.issue_date,
            due_date: invoice.due_date,
            line_items: invoice.line_items.iter().map(LineItemView::from).collect(),
            subtotal: money_string(invoice.subtotal),
            tax_rate: money_string(invoice.tax_rate),
            tax: money_string(invoice.tax),
            discount: money_string(invoice.discount),
            total: money_string(invoice.total),
            amount_paid: money_string(invoice.amount_paid),
            balance: money_string(invoice.balance().max(Decimal::ZERO)),
            is_draft: invoice.is_draft,
            notes: invoice.notes.clone(),
            created_by: invoice.created_by,
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: String,
    pub paid_on: NaiveDate,
    pub method: Option<String>,
    pub reference: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<&PaymentRecord> for PaymentView {
    fn from(payment: &PaymentRecord) -> Self {
        Self {
            id: payment.id,
            invoice_id: payment.invoice_id,
            amount: money_string(payment.amount),
            paid_on: payment.paid_on,
            method: payment.method.clone(),
            reference: payment.reference.clone(),
            recorded_by: payment.recorded_by,
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: InvoiceView,
    pub payments: Vec<PaymentView>,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub invoice: InvoiceView,
    pub payment: PaymentView,
}

// --- Notices ---

#[derive(Debug, Default, Deserialize)]
pub struct NoticeListQuery {
    pub include_expired: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNoticeRequest {
    pub title: String,
    pub body: String,
    pub audience: Option<NoticeAudience>,
    #[serde(default)]
    pub pinned: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateNoticeRequest {
    pub title: Option<String>,
    pub body: Option<String>,
    pub audience: Option<NoticeAudience>,
    pub pinned: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

// --- Notifications & activity ---

#[derive(Debug, Default, Deserialize)]
pub struct NotificationListQuery {
    pub unread: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct ReadAllResponse {
    pub updated: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<Uuid>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

// --- Dashboard ---

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub tasks: TaskStatusCounts,
    pub overdue_tasks: i64,
    pub due_soon: Vec<TaskRecord>,
    pub matters: MatterStatusCounts,
    /// Present for staff and clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoices: Option<InvoiceSummary>,
    pub unread_notifications: i64,
    pub recent_activity: Vec<ActivityRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub days: i64,
    pub since: DateTime<Utc>,
    pub entries: Vec<LeaderboardEntry>,
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn money_always_has_two_places() {
        assert_eq!(money_string(dec!(10)), "10.00");
        assert_eq!(money_string(dec!(10.5)), "10.50");
        assert_eq!(money_string(dec!(3.456)), "3.46");
    }

    #[test]
    fn nullable_fields_distinguish_null_from_absent() {
        let absent: UpdateMatterRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.client_id, None);
        let cleared: UpdateMatterRequest = serde_json::from_str(r#"{"client_id":null}"#).unwrap();
        assert_eq!(cleared.client_id, Some(None));
    }

    #[test]
    fn paged_response_reports_page_number() {
        let page = Page::new(Some(2), Some(5));
        let response = PagedResponse::new(
            Paged {
                items: vec![1, 2],
                total: 7,
            },
            page,
        );
        assert_eq!(response.page, 2);
        assert_eq!(response.limit, 5);
        assert_eq!(response.total, 7);
    }
}
