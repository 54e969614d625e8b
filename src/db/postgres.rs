//! PostgreSQL backend for the Database trait.
//!
//! Uses a `deadpool-postgres` pool; schema comes from the refinery migrations
//! embedded from `migrations/`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{GenericClient, Pool};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{
    ActivityAction, ActivityFilter, ActivityRecord, ActivityStore, CaseFileFilter,
    CaseFileRecord, CaseFileStatus, CaseFileStore, CreateActivityParams, CreateCaseFileParams,
    CreateDocumentParams, CreateInvoiceParams, CreateMatterParams, CreateNoticeParams,
    CreatePaymentParams, CreateTaskParams, CreateUserParams, DashboardStore, Database,
    DocumentFilter, DocumentRecord, DocumentStore, EntityType, InvoiceFilter, InvoiceRecord,
    InvoiceStore, LeaderboardRow, MatterAggregates, MatterFilter, MatterRecord, MatterStatus,
    MatterStatusCounts, MatterStore, NoticeAudience, NoticeFilter, NoticeRecord, NoticeStore,
    NotificationRecord, Page, Paged, PaymentRecord, Role, TaskFilter, TaskPriority, TaskRecord,
    TaskStatus, TaskStatusCounts, TaskStore, UpdateCaseFileParams, UpdateDocumentParams,
    UpdateInvoiceParams, UpdateMatterParams, UpdateNoticeParams, UpdateTaskParams,
    UpdateUserParams, UserFilter, UserRecord, UserStore, Visibility,
};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

// ==================== Query building ====================

type SqlParam = Box<dyn ToSql + Sync + Send>;

#[derive(Default)]
struct PgArgs {
    values: Vec<SqlParam>,
    clauses: Vec<String>,
}

impl PgArgs {
    fn bind<T: ToSql + Sync + Send + 'static>(&mut self, value: T) -> String {
        self.values.push(Box::new(value));
        format!("${}", self.values.len())
    }

    fn clause(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn page_sql(&mut self, page: Page) -> String {
        let limit = self.bind(page.limit);
        let offset = self.bind(page.offset);
        format!(" LIMIT {} OFFSET {}", limit, offset)
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|value| value.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.trim().to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn matter_scope(args: &mut PgArgs, visibility: Visibility, column: &str) {
    match visibility {
        Visibility::All => {}
        Visibility::Member(user_id) => {
            let user = args.bind(user_id);
            args.clause(format!(
                "({column} IN (SELECT matter_id FROM matter_members WHERE user_id = {user}) \
                 OR {column} IN (SELECT sc.matter_id FROM tasks sc \
                    JOIN task_assignees sca ON sca.task_id = sc.id WHERE sca.user_id = {user}))"
            ));
        }
        Visibility::Client(user_id) => {
            let user = args.bind(user_id);
            args.clause(format!(
                "{column} IN (SELECT id FROM matters WHERE client_id = {user})"
            ));
        }
    }
}

fn task_scope(args: &mut PgArgs, visibility: Visibility) {
    match visibility {
        Visibility::Member(user_id) => {
            let user = args.bind(user_id);
            args.clause(format!(
                "(t.id IN (SELECT task_id FROM task_assignees WHERE user_id = {user}) \
                 OR t.matter_id IN (SELECT matter_id FROM matter_members WHERE user_id = {user}))"
            ));
        }
        other => matter_scope(args, other, "t.matter_id"),
    }
}

async fn count_rows<C: GenericClient + Sync>(
    conn: &C,
    from_sql: &str,
    args: &PgArgs,
) -> Result<i64, DatabaseError> {
    let row = conn
        .query_one(
            &format!("SELECT COUNT(*) FROM {}{}", from_sql, args.where_sql()),
            &args.refs(),
        )
        .await?;
    Ok(row.try_get(0)?)
}

fn to_json_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, DatabaseError> {
    serde_json::to_value(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json_value<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, DatabaseError> {
    serde_json::from_value(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_enum<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T, DatabaseError> {
    parse(raw).ok_or_else(|| DatabaseError::Serialization(format!("invalid {} '{}'", what, raw)))
}

// ==================== Row mapping ====================

const USER_COLUMNS: &str = "u.id, u.name, u.email, u.role, u.phone, u.title, u.photo_path, \
     u.is_active, u.last_login_at, u.created_at, u.updated_at";

const MATTER_SELECT: &str = "SELECT m.id, m.matter_number, m.title, m.description, \
     m.practice_area, m.status, m.client_id, m.opened_on, m.closed_on, m.created_by, m.created_at, \
     m.updated_at, ARRAY(SELECT mm.user_id FROM matter_members mm WHERE mm.matter_id = m.id \
     ORDER BY mm.position) AS member_ids FROM matters m";

const CASE_FILE_COLUMNS: &str = "c.id, c.matter_id, c.title, c.case_number, c.court, c.case_type, \
     c.status, c.filed_on, c.next_hearing_on, c.description, c.created_by, c.created_at, c.updated_at";

const DOCUMENT_COLUMNS: &str = "d.id, d.matter_id, d.case_file_id, d.title, d.file_name, \
     d.stored_path, d.content_type, d.size_bytes, d.client_visible, d.uploaded_by, d.created_at, \
     d.updated_at";

const TASK_SELECT: &str = "SELECT t.id, t.title, t.description, t.matter_id, t.case_file_id, \
     t.priority, t.status, t.checklist, t.progress, t.due_on, t.completed_at, t.reminder_sent_at, \
     t.created_by, t.created_at, t.updated_at, ARRAY(SELECT ta.user_id FROM task_assignees ta \
     WHERE ta.task_id = t.id ORDER BY ta.position) AS assignee_ids FROM tasks t";

const INVOICE_COLUMNS: &str = "i.id, i.invoice_number, i.matter_id, i.client_id, i.issue_date, \
     i.due_date, i.line_items, i.subtotal, i.tax_rate, i.tax, i.discount, i.total, i.amount_paid, \
     i.is_draft, i.notes, i.created_by, i.created_at, i.updated_at";

const PAYMENT_COLUMNS: &str =
    "id, invoice_id, amount, paid_on, method, reference, recorded_by, created_at";

const NOTICE_COLUMNS: &str = "n.id, n.title, n.body, n.audience, n.pinned, n.published_at, \
     n.expires_at, n.created_by, n.created_at, n.updated_at";

const ACTIVITY_COLUMNS: &str =
    "a.id, a.actor_id, a.entity_type, a.entity_id, a.action, a.summary, a.changes, a.created_at";

fn row_to_user_record(row: &Row) -> Result<UserRecord, DatabaseError> {
    let role: String = row.try_get(3)?;
    Ok(UserRecord {
        id: row.try_get(0)?,
        name: row.try_get(1)?,
        email: row.try_get(2)?,
        role: parse_enum(&role, Role::from_db_value, "role")?,
        phone: row.try_get(4)?,
        title: row.try_get(5)?,
        photo_path: row.try_get(6)?,
        is_active: row.try_get(7)?,
        last_login_at: row.try_get(8)?,
        created_at: row.try_get(9)?,
        updated_at: row.try_get(10)?,
    })
}

fn row_to_matter_record(row: &Row) -> Result<MatterRecord, DatabaseError> {
    let status: String = row.try_get(5)?;
    Ok(MatterRecord {
        id: row.try_get(0)?,
        matter_number: row.try_get(1)?,
        title: row.try_get(2)?,
        description: row.try_get(3)?,
        practice_area: row.try_get(4)?,
        status: parse_enum(&status, MatterStatus::from_db_value, "matter status")?,
        client_id: row.try_get(6)?,
        opened_on: row.try_get(7)?,
        closed_on: row.try_get(8)?,
        created_by: row.try_get(9)?,
        created_at: row.try_get(10)?,
        updated_at: row.try_get(11)?,
        member_ids: row.try_get(12)?,
    })
}

fn row_to_case_file_record(row: &Row) -> Result<CaseFileRecord, DatabaseError> {
    let status: String = row.try_get(6)?;
    Ok(CaseFileRecord {
        id: row.try_get(0)?,
        matter_id: row.try_get(1)?,
        title: row.try_get(2)?,
        case_number: row.try_get(3)?,
        court: row.try_get(4)?,
        case_type: row.try_get(5)?,
        status: parse_enum(&status, CaseFileStatus::from_db_value, "case file status")?,
        filed_on: row.try_get(7)?,
        next_hearing_on: row.try_get(8)?,
        description: row.try_get(9)?,
        created_by: row.try_get(10)?,
        created_at: row.try_get(11)?,
        updated_at: row.try_get(12)?,
    })
}

fn row_to_document_record(row: &Row) -> Result<DocumentRecord, DatabaseError> {
    Ok(DocumentRecord {
        id: row.try_get(0)?,
        matter_id: row.try_get(1)?,
        case_file_id: row.try_get(2)?,
        title: row.try_get(3)?,
        file_name: row.try_get(4)?,
        stored_path: row.try_get(5)?,
        content_type: row.try_get(6)?,
        size_bytes: row.try_get(7)?,
        client_visible: row.try_get(8)?,
        uploaded_by: row.try_get(9)?,
        created_at: row.try_get(10)?,
        updated_at: row.try_get(11)?,
    })
}

fn row_to_task_record(row: &Row) -> Result<TaskRecord, DatabaseError> {
    let priority: String = row.try_get(5)?;
    let status: String = row.try_get(6)?;
    Ok(TaskRecord {
        id: row.try_get(0)?,
        title: row.try_get(1)?,
        description: row.try_get(2)?,
        matter_id: row.try_get(3)?,
        case_file_id: row.try_get(4)?,
        priority: parse_enum(&priority, TaskPriority::from_db_value, "task priority")?,
        status: parse_enum(&status, TaskStatus::from_db_value, "task status")?,
        checklist: from_json_value(row.try_get(7)?)?,
        progress: row.try_get(8)?,
        due_on: row.try_get(9)?,
        completed_at: row.try_get(10)?,
        reminder_sent_at: row.try_get(11)?,
        created_by: row.try_get(12)?,
        created_at: row.try_get(13)?,
        updated_at: row.try_get(14)?,
        assignee_ids: row.try_get(15)?,
    })
}

fn row_to_invoice_record(row: &Row) -> Result<InvoiceRecord, DatabaseError> {
    Ok(InvoiceRecord {
        id: row.try_get(0)?,
        invoice_number: row.try_get(1)?,
        matter_id: row.try_get(2)?,
        client_id: row.try_get(3)?,
        issue_date: row.try_get(4)?,
        due_date: row.try_get(5)?,
        line_items: from_json_value(row.try_get(6)?)?,
        subtotal: row.try_get(7)?,
        tax_rate: row.try_get(8)?,
        tax: row.try_get(9)?,
        discount: row.try_get(10)?,
        total: row.try_get(11)?,
        amount_paid: row.try_get(12)?,
        is_draft: row.try_get(13)?,
        notes: row.try_get(14)?,
        created_by: row.try_get(15)?,
        created_at: row.try_get(16)?,
        updated_at: row.try_get(17)?,
    })
}

fn row_to_payment_record(row: &Row) -> Result<PaymentRecord, DatabaseError> {
    Ok(PaymentRecord {
        id: row.try_get(0)?,
        invoice_id: row.try_get(1)?,
        amount: row.try_get(2)?,
        paid_on: row.try_get(3)?,
        method: row.try_get(4)?,
        reference: row.try_get(5)?,
        recorded_by: row.try_get(6)?,
        created_at: row.try_get(7)?,
    })
}

fn row_to_notice_record(row: &Row) -> Result<NoticeRecord, DatabaseError> {
    let audience: String = row.try_get(3)?;
    Ok(NoticeRecord {
        id: row.try_get(0)?,
        title: row.try_get(1)?,
        body: row.try_get(2)?,
        audience: parse_enum(&audience, NoticeAudience::from_db_value, "notice audience")?,
        pinned: row.try_get(4)?,
        published_at: row.try_get(5)?,
        expires_at: row.try_get(6)?,
        created_by: row.try_get(7)?,
        created_at: row.try_get(8)?,
        updated_at: row.try_get(9)?,
    })
}

fn row_to_activity_record(row: &Row, offset: usize) -> Result<ActivityRecord, DatabaseError> {
    let entity_type: String = row.try_get(offset + 2)?;
    let action: String = row.try_get(offset + 4)?;
    Ok(ActivityRecord {
        id: row.try_get(offset)?,
        actor_id: row.try_get(offset + 1)?,
        entity_type: parse_enum(&entity_type, EntityType::from_db_value, "entity type")?,
        entity_id: row.try_get(offset + 3)?,
        action: parse_enum(&action, ActivityAction::from_db_value, "activity action")?,
        summary: row.try_get(offset + 5)?,
        changes: from_json_value(row.try_get(offset + 6)?)?,
        created_at: row.try_get(offset + 7)?,
    })
}

async fn fetch_matter<C: GenericClient + Sync>(
    conn: &C,
    id: Uuid,
) -> Result<Option<MatterRecord>, DatabaseError> {
    let row = conn
        .query_opt(&format!("{MATTER_SELECT} WHERE m.id = $1"), &[&id])
        .await?;
    row.map(|row| row_to_matter_record(&row)).transpose()
}

async fn fetch_task<C: GenericClient + Sync>(
    conn: &C,
    id: Uuid,
) -> Result<Option<TaskRecord>, DatabaseError> {
    let row = conn
        .query_opt(&format!("{TASK_SELECT} WHERE t.id = $1"), &[&id])
        .await?;
    row.map(|row| row_to_task_record(&row)).transpose()
}

async fn fetch_invoice<C: GenericClient + Sync>(
    conn: &C,
    id: Uuid,
    for_update: bool,
) -> Result<Option<InvoiceRecord>, DatabaseError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = conn
        .query_opt(
            &format!("SELECT {INVOICE_COLUMNS} FROM invoices i WHERE i.id = $1{lock}"),
            &[&id],
        )
        .await?;
    row.map(|row| row_to_invoice_record(&row)).transpose()
}

async fn replace_links<C: GenericClient + Sync>(
    conn: &C,
    table: &str,
    owner_column: &str,
    owner: Uuid,
    user_ids: &[Uuid],
) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("DELETE FROM {table} WHERE {owner_column} = $1"),
        &[&owner],
    )
    .await?;
    for (position, user_id) in user_ids.iter().enumerate() {
        let position = position as i32;
        conn.execute(
            &format!(
                "INSERT INTO {table} ({owner_column}, user_id, position) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING"
            ),
            &[&owner, user_id, &position],
        )
        .await?;
    }
    Ok(())
}

// ==================== Stores ====================

#[async_trait]
impl UserStore for PgBackend {
    async fn create_user(&self, input: &CreateUserParams) -> Result<UserRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO users AS u (id, name, email, password_hash, role, phone, title, is_active) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {USER_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &input.name,
                    &input.email,
                    &input.password_hash,
                    &input.role.as_str(),
                    &input.phone,
                    &input.title,
                    &input.is_active,
                ],
            )
            .await?;
        row_to_user_record(&row)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = $1"),
                &[&id],
            )
            .await?;
        row.map(|row| row_to_user_record(&row)).transpose()
    }

    async fn get_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<UserRecord>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let ids = ids.to_vec();
        let rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u WHERE u.id = ANY($1) ORDER BY u.name ASC"
                ),
                &[&ids],
            )
            .await?;
        rows.iter().map(row_to_user_record).collect()
    }

    async fn get_user_credentials(
        &self,
        email: &str,
    ) -> Result<Option<(UserRecord, String)>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {USER_COLUMNS}, u.password_hash FROM users u WHERE u.email = $1"),
                &[&email],
            )
            .await?;
        match row {
            Some(row) => Ok(Some((row_to_user_record(&row)?, row.try_get(11)?))),
            None => Ok(None),
        }
    }

    async fn get_password_hash(&self, id: Uuid) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT password_hash FROM users WHERE id = $1", &[&id])
            .await?;
        row.map(|row| row.try_get(0).map_err(DatabaseError::from))
            .transpose()
    }

    async fn list_users(&self, filter: &UserFilter) -> Result<Paged<UserRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        if let Some(role) = filter.role {
            let p = args.bind(role.as_str().to_string());
            args.clause(format!("u.role = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.bind(like_pattern(search));
            args.clause(format!("(LOWER(u.name) LIKE {p} OR u.email LIKE {p})"));
        }
        if let Some(member_id) = filter.visible_to_member {
            let p = args.bind(member_id);
            args.clause(format!(
                "(u.role <> 'client' OR u.id IN (SELECT m.client_id FROM matters m \
                   JOIN matter_members mm ON mm.matter_id = m.id \
                   WHERE mm.user_id = {p} AND m.client_id IS NOT NULL))"
            ));
        }
        let total = count_rows(&**conn, "users u", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u{where_sql} ORDER BY u.name ASC, u.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows.iter().map(row_to_user_record).collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn update_user(
        &self,
        id: Uuid,
        input: &UpdateUserParams,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let Some(existing) = self.get_user(id).await? else {
            return Ok(None);
        };
        let name = input.name.clone().unwrap_or(existing.name);
        let email = input.email.clone().unwrap_or(existing.email);
        let role = input.role.unwrap_or(existing.role);
        let phone = input.phone.clone().unwrap_or(existing.phone);
        let title = input.title.clone().unwrap_or(existing.title);
        let is_active = input.is_active.unwrap_or(existing.is_active);

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE users AS u SET name = $2, email = $3, role = $4, phone = $5, title = $6, \
                     is_active = $7, updated_at = NOW() WHERE u.id = $1 RETURNING {USER_COLUMNS}"
                ),
                &[
                    &id,
                    &name,
                    &email,
                    &role.as_str(),
                    &phone,
                    &title,
                    &is_active,
                ],
            )
            .await?;
        row.map(|row| row_to_user_record(&row)).transpose()
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &hash],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn set_photo_path(
        &self,
        id: Uuid,
        path: Option<&str>,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE users AS u SET photo_path = $2, updated_at = NOW() WHERE u.id = $1 \
                     RETURNING {USER_COLUMNS}"
                ),
                &[&id, &path],
            )
            .await?;
        row.map(|row| row_to_user_record(&row)).transpose()
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET last_login_at = $2 WHERE id = $1",
            &[&id, &at],
        )
        .await?;
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn count_users_with_role(&self, role: Role) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM users WHERE role = $1",
                &[&role.as_str()],
            )
            .await?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl MatterStore for PgBackend {
    async fn create_matter(
        &self,
        input: &CreateMatterParams,
    ) -> Result<MatterRecord, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO matters (id, matter_number, title, description, practice_area, status, \
             client_id, opened_on, closed_on, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &id,
                &input.matter_number,
                &input.title,
                &input.description,
                &input.practice_area,
                &input.status.as_str(),
                &input.client_id,
                &input.opened_on,
                &input.closed_on,
                &input.created_by,
            ],
        )
        .await?;
        replace_links(&tx, "matter_members", "matter_id", id, &input.member_ids).await?;
        let record = fetch_matter(&tx, id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created matter".to_string()))?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get_matter(&self, id: Uuid) -> Result<Option<MatterRecord>, DatabaseError> {
        let conn = self.conn().await?;
        fetch_matter(&**conn, id).await
    }

    async fn list_matters(
        &self,
        filter: &MatterFilter,
    ) -> Result<Paged<MatterRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        matter_scope(&mut args, filter.visibility, "m.id");
        if let Some(status) = filter.status {
            let p = args.bind(status.as_str().to_string());
            args.clause(format!("m.status = {p}"));
        }
        if let Some(client_id) = filter.client_id {
            let p = args.bind(client_id);
            args.clause(format!("m.client_id = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.bind(like_pattern(search));
            args.clause(format!(
                "(LOWER(m.title) LIKE {p} OR LOWER(m.matter_number) LIKE {p})"
            ));
        }
        let total = count_rows(&**conn, "matters m", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "{MATTER_SELECT}{where_sql} ORDER BY m.created_at DESC, m.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows
            .iter()
            .map(row_to_matter_record)
            .collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn update_matter(
        &self,
        id: Uuid,
        input: &UpdateMatterParams,
    ) -> Result<Option<MatterRecord>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let Some(existing) = fetch_matter(&tx, id).await? else {
            return Ok(None);
        };
        let matter_number = input
            .matter_number
            .clone()
            .unwrap_or(existing.matter_number);
        let title = input.title.clone().unwrap_or(existing.title);
        let description = input.description.clone().unwrap_or(existing.description);
        let practice_area = input.practice_area.clone().unwrap_or(existing.practice_area);
        let status = input.status.unwrap_or(existing.status);
        let client_id = input.client_id.unwrap_or(existing.client_id);
        let opened_on = input.opened_on.unwrap_or(existing.opened_on);
        let closed_on = input.closed_on.unwrap_or(existing.closed_on);

        tx.execute(
            "UPDATE matters SET matter_number = $2, title = $3, description = $4, practice_area = $5, \
             status = $6, client_id = $7, opened_on = $8, closed_on = $9, updated_at = NOW() \
             WHERE id = $1",
            &[
                &id,
                &matter_number,
                &title,
                &description,
                &practice_area,
                &status.as_str(),
                &client_id,
                &opened_on,
                &closed_on,
            ],
        )
        .await?;
        if let Some(member_ids) = &input.member_ids {
            replace_links(&tx, "matter_members", "matter_id", id, member_ids).await?;
        }
        let record = fetch_matter(&tx, id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn delete_matter(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM matters WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn is_matter_visible(
        &self,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        let p = args.bind(id);
        args.clause(format!("m.id = {p}"));
        matter_scope(&mut args, visibility, "m.id");
        Ok(count_rows(&**conn, "matters m", &args).await? > 0)
    }

    async fn matter_numbers_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await?;
        let pattern = format!("{}%", prefix);
        let rows = conn
            .query(
                "SELECT matter_number FROM matters WHERE matter_number LIKE $1",
                &[&pattern],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(DatabaseError::from))
            .collect()
    }

    async fn count_client_matters(&self, client_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM matters WHERE client_id = $1",
                &[&client_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl CaseFileStore for PgBackend {
    async fn create_case_file(
        &self,
        input: &CreateCaseFileParams,
    ) -> Result<CaseFileRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO case_files AS c (id, matter_id, title, case_number, court, case_type, \
                     status, filed_on, next_hearing_on, description, created_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {CASE_FILE_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &input.matter_id,
                    &input.title,
                    &input.case_number,
                    &input.court,
                    &input.case_type,
                    &input.status.as_str(),
                    &input.filed_on,
                    &input.next_hearing_on,
                    &input.description,
                    &input.created_by,
                ],
            )
            .await?;
        row_to_case_file_record(&row)
    }

    async fn get_case_file(&self, id: Uuid) -> Result<Option<CaseFileRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {CASE_FILE_COLUMNS} FROM case_files c WHERE c.id = $1"),
                &[&id],
            )
            .await?;
        row.map(|row| row_to_case_file_record(&row)).transpose()
    }

    async fn list_case_files(
        &self,
        filter: &CaseFileFilter,
    ) -> Result<Paged<CaseFileRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        matter_scope(&mut args, filter.visibility, "c.matter_id");
        if let Some(matter_id) = filter.matter_id {
            let p = args.bind(matter_id);
            args.clause(format!("c.matter_id = {p}"));
        }
        if let Some(status) = filter.status {
            let p = args.bind(status.as_str().to_string());
            args.clause(format!("c.status = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.bind(like_pattern(search));
            args.clause(format!(
                "(LOWER(c.title) LIKE {p} OR LOWER(COALESCE(c.case_number, '')) LIKE {p})"
            ));
        }
        let total = count_rows(&**conn, "case_files c", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "SELECT {CASE_FILE_COLUMNS} FROM case_files c{where_sql} \
                     ORDER BY c.created_at DESC, c.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows
            .iter()
            .map(row_to_case_file_record)
            .collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn update_case_file(
        &self,
        id: Uuid,
        input: &UpdateCaseFileParams,
    ) -> Result<Option<CaseFileRecord>, DatabaseError> {
        let Some(existing) = self.get_case_file(id).await? else {
            return Ok(None);
        };
        let title = input.title.clone().unwrap_or(existing.title);
        let case_number = input.case_number.clone().unwrap_or(existing.case_number);
        let court = input.court.clone().unwrap_or(existing.court);
        let case_type = input.case_type.clone().unwrap_or(existing.case_type);
        let status = input.status.unwrap_or(existing.status);
        let filed_on = input.filed_on.unwrap_or(existing.filed_on);
        let next_hearing_on = input.next_hearing_on.unwrap_or(existing.next_hearing_on);
        let description = input.description.clone().unwrap_or(existing.description);

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE case_files AS c SET title = $2, case_number = $3, court = $4, \
                     case_type = $5, status = $6, filed_on = $7, next_hearing_on = $8, \
                     description = $9, updated_at = NOW() WHERE c.id = $1 RETURNING {CASE_FILE_COLUMNS}"
                ),
                &[
                    &id,
                    &title,
                    &case_number,
                    &court,
                    &case_type,
                    &status.as_str(),
                    &filed_on,
                    &next_hearing_on,
                    &description,
                ],
            )
            .await?;
        row.map(|row| row_to_case_file_record(&row)).transpose()
    }

    async fn delete_case_file(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM case_files WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }
}

#[async_trait]
impl DocumentStore for PgBackend {
    async fn create_document(
        &self,
        input: &CreateDocumentParams,
    ) -> Result<DocumentRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO documents AS d (id, matter_id, case_file_id, title, file_name, \
                     stored_path, content_type, size_bytes, client_visible, uploaded_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {DOCUMENT_COLUMNS}"
                ),
                &[
                    &input.id,
                    &input.matter_id,
                    &input.case_file_id,
                    &input.title,
                    &input.file_name,
                    &input.stored_path,
                    &input.content_type,
                    &input.size_bytes,
                    &input.client_visible,
                    &input.uploaded_by,
                ],
            )
            .await?;
        row_to_document_record(&row)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE d.id = $1"),
                &[&id],
            )
            .await?;
        row.map(|row| row_to_document_record(&row)).transpose()
    }

    async fn list_documents(
        &self,
        filter: &DocumentFilter,
    ) -> Result<Paged<DocumentRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        matter_scope(&mut args, filter.visibility, "d.matter_id");
        if matches!(filter.visibility, Visibility::Client(_)) {
            args.clause("d.client_visible".to_string());
        }
        if let Some(matter_id) = filter.matter_id {
            let p = args.bind(matter_id);
            args.clause(format!("d.matter_id = {p}"));
        }
        if let Some(case_file_id) = filter.case_file_id {
            let p = args.bind(case_file_id);
            args.clause(format!("d.case_file_id = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.bind(like_pattern(search));
            args.clause(format!(
                "(LOWER(d.title) LIKE {p} OR LOWER(d.file_name) LIKE {p})"
            ));
        }
        let total = count_rows(&**conn, "documents d", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents d{where_sql} \
                     ORDER BY d.created_at DESC, d.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows
            .iter()
            .map(row_to_document_record)
            .collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn update_document(
        &self,
        id: Uuid,
        input: &UpdateDocumentParams,
    ) -> Result<Option<DocumentRecord>, DatabaseError> {
        let Some(existing) = self.get_document(id).await? else {
            return Ok(None);
        };
        let title = input.title.clone().unwrap_or(existing.title);
        let case_file_id = input.case_file_id.unwrap_or(existing.case_file_id);
        let client_visible = input.client_visible.unwrap_or(existing.client_visible);

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE documents AS d SET title = $2, case_file_id = $3, client_visible = $4, \
                     updated_at = NOW() WHERE d.id = $1 RETURNING {DOCUMENT_COLUMNS}"
                ),
                &[&id, &title, &case_file_id, &client_visible],
            )
            .await?;
        row.map(|row| row_to_document_record(&row)).transpose()
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM documents WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn document_paths_for_matter(
        &self,
        matter_id: Uuid,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT stored_path FROM documents WHERE matter_id = $1",
                &[&matter_id],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(DatabaseError::from))
            .collect()
    }
}

#[async_trait]
impl TaskStore for PgBackend {
    async fn create_task(&self, input: &CreateTaskParams) -> Result<TaskRecord, DatabaseError> {
        let checklist = to_json_value(&input.checklist)?;
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO tasks (id, title, description, matter_id, case_file_id, priority, status, \
             checklist, progress, due_on, completed_at, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            &[
                &id,
                &input.title,
                &input.description,
                &input.matter_id,
                &input.case_file_id,
                &input.priority.as_str(),
                &input.status.as_str(),
                &checklist,
                &input.progress,
                &input.due_on,
                &input.completed_at,
                &input.created_by,
            ],
        )
        .await?;
        replace_links(&tx, "task_assignees", "task_id", id, &input.assignee_ids).await?;
        let record = fetch_task(&tx, id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created task".to_string()))?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        fetch_task(&**conn, id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Paged<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        task_scope(&mut args, filter.visibility);
        if let Some(status) = filter.status {
            let p = args.bind(status.as_str().to_string());
            args.clause(format!("t.status = {p}"));
        }
        if let Some(matter_id) = filter.matter_id {
            let p = args.bind(matter_id);
            args.clause(format!("t.matter_id = {p}"));
        }
        if let Some(assignee_id) = filter.assignee_id {
            let p = args.bind(assignee_id);
            args.clause(format!(
                "t.id IN (SELECT task_id FROM task_assignees WHERE user_id = {p})"
            ));
        }
        if let Some(priority) = filter.priority {
            let p = args.bind(priority.as_str().to_string());
            args.clause(format!("t.priority = {p}"));
        }
        if let Some(before) = filter.overdue_before {
            let p = args.bind(before);
            args.clause(format!(
                "t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on < {p}"
            ));
        }
        if let Some((from, to)) = filter.due_between {
            let from = args.bind(from);
            let to = args.bind(to);
            args.clause(format!(
                "t.status <> 'completed' AND t.due_on BETWEEN {from} AND {to}"
            ));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.bind(like_pattern(search));
            args.clause(format!(
                "(LOWER(t.title) LIKE {p} OR LOWER(COALESCE(t.description, '')) LIKE {p})"
            ));
        }
        let total = count_rows(&**conn, "tasks t", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "{TASK_SELECT}{where_sql} \
                     ORDER BY t.due_on ASC NULLS LAST, t.created_at DESC, t.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows
            .iter()
            .map(row_to_task_record)
            .collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn update_task(
        &self,
        id: Uuid,
        input: &UpdateTaskParams,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let Some(existing) = fetch_task(&tx, id).await? else {
            return Ok(None);
        };
        let title = input.title.clone().unwrap_or(existing.title);
        let description = input.description.clone().unwrap_or(existing.description);
        let case_file_id = input.case_file_id.unwrap_or(existing.case_file_id);
        let priority = input.priority.unwrap_or(existing.priority);
        let status = input.status.unwrap_or(existing.status);
        let checklist = to_json_value(input.checklist.as_ref().unwrap_or(&existing.checklist))?;
        let progress = input.progress.unwrap_or(existing.progress);
        let due_on = input.due_on.unwrap_or(existing.due_on);
        let completed_at = input.completed_at.unwrap_or(existing.completed_at);
        let reminder_sent_at = input.reminder_sent_at.unwrap_or(existing.reminder_sent_at);

        tx.execute(
            "UPDATE tasks SET title = $2, description = $3, case_file_id = $4, priority = $5, \
             status = $6, checklist = $7, progress = $8, due_on = $9, completed_at = $10, \
             reminder_sent_at = $11, updated_at = NOW() WHERE id = $1",
            &[
                &id,
                &title,
                &description,
                &case_file_id,
                &priority.as_str(),
                &status.as_str(),
                &checklist,
                &progress,
                &due_on,
                &completed_at,
                &reminder_sent_at,
            ],
        )
        .await?;
        if let Some(assignee_ids) = &input.assignee_ids {
            replace_links(&tx, "task_assignees", "task_id", id, assignee_ids).await?;
        }
        let record = fetch_task(&tx, id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM tasks WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn task_status_counts(
        &self,
        visibility: Visibility,
    ) -> Result<TaskStatusCounts, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        task_scope(&mut args, visibility);
        let rows = conn
            .query(
                &format!(
                    "SELECT t.status, COUNT(*) FROM tasks t{} GROUP BY t.status",
                    args.where_sql()
                ),
                &args.refs(),
            )
            .await?;
        let mut counts = TaskStatusCounts::default();
        for row in rows {
            let status: String = row.try_get(0)?;
            counts.add(
                parse_enum(&status, TaskStatus::from_db_value, "task status")?,
                row.try_get(1)?,
            );
        }
        Ok(counts)
    }

    async fn tasks_due_for_reminder(
        &self,
        due_by: NaiveDate,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "{TASK_SELECT} WHERE t.status <> 'completed' AND t.reminder_sent_at IS NULL \
                     AND t.due_on IS NOT NULL AND t.due_on <= $1 ORDER BY t.due_on ASC, t.id ASC"
                ),
                &[&due_by],
            )
            .await?;
        rows.iter().map(row_to_task_record).collect()
    }

    async fn is_task_assignee(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT 1 FROM task_assignees WHERE task_id = $1 AND user_id = $2",
                &[&task_id, &user_id],
            )
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl InvoiceStore for PgBackend {
    async fn create_invoice(
        &self,
        input: &CreateInvoiceParams,
    ) -> Result<InvoiceRecord, DatabaseError> {
        let line_items = to_json_value(&input.line_items)?;
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO invoices AS i (id, invoice_number, matter_id, client_id, issue_date, \
                     due_date, line_items, subtotal, tax_rate, tax, discount, total, is_draft, notes, \
                     created_by) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                     RETURNING {INVOICE_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &input.invoice_number,
                    &input.matter_id,
                    &input.client_id,
                    &input.issue_date,
                    &input.due_date,
                    &line_items,
                    &input.subtotal,
                    &input.tax_rate,
                    &input.tax,
                    &input.discount,
                    &input.total,
                    &input.is_draft,
                    &input.notes,
                    &input.created_by,
                ],
            )
            .await?;
        row_to_invoice_record(&row)
    }

    async fn get_invoice(&self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        fetch_invoice(&**conn, id, false).await
    }

    async fn list_invoices(
        &self,
        filter: &InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        match filter.visibility {
            Visibility::All => {}
            Visibility::Client(user_id) => {
                let p = args.bind(user_id);
                args.clause(format!("i.client_id = {p}"));
            }
            Visibility::Member(_) => args.clause("FALSE".to_string()),
        }
        if let Some(matter_id) = filter.matter_id {
            let p = args.bind(matter_id);
            args.clause(format!("i.matter_id = {p}"));
        }
        if let Some(client_id) = filter.client_id {
            let p = args.bind(client_id);
            args.clause(format!("i.client_id = {p}"));
        }
        let rows = conn
            .query(
                &format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices i{} ORDER BY i.created_at DESC, i.id ASC",
                    args.where_sql()
                ),
                &args.refs(),
            )
            .await?;
        rows.iter().map(row_to_invoice_record).collect()
    }

    async fn update_invoice(
        &self,
        id: Uuid,
        input: &UpdateInvoiceParams,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let Some(existing) = fetch_invoice(&**conn, id, false).await? else {
            return Ok(None);
        };
        let issue_date = input.issue_date.unwrap_or(existing.issue_date);
        let due_date = input.due_date.unwrap_or(existing.due_date);
        let line_items =
            to_json_value(input.line_items.as_ref().unwrap_or(&existing.line_items))?;
        let subtotal = input.subtotal.unwrap_or(existing.subtotal);
        let tax_rate = input.tax_rate.unwrap_or(existing.tax_rate);
        let tax = input.tax.unwrap_or(existing.tax);
        let discount = input.discount.unwrap_or(existing.discount);
        let total = input.total.unwrap_or(existing.total);
        let is_draft = input.is_draft.unwrap_or(existing.is_draft);
        let notes = input.notes.clone().unwrap_or(existing.notes);

        let row = conn
            .query_opt(
                &format!(
                    "UPDATE invoices AS i SET issue_date = $2, due_date = $3, line_items = $4, \
                     subtotal = $5, tax_rate = $6, tax = $7, discount = $8, total = $9, is_draft = $10, \
                     notes = $11, updated_at = NOW() WHERE i.id = $1 RETURNING {INVOICE_COLUMNS}"
                ),
                &[
                    &id,
                    &issue_date,
                    &due_date,
                    &line_items,
                    &subtotal,
                    &tax_rate,
                    &tax,
                    &discount,
                    &total,
                    &is_draft,
                    &notes,
                ],
            )
            .await?;
        row.map(|row| row_to_invoice_record(&row)).transpose()
    }

    async fn delete_invoice(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM invoices WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn record_payment(
        &self,
        invoice_id: Uuid,
        input: &CreatePaymentParams,
    ) -> Result<Option<(InvoiceRecord, PaymentRecord)>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let Some(invoice) = fetch_invoice(&tx, invoice_id, true).await? else {
            return Ok(None);
        };
        if invoice.is_draft {
            return Err(DatabaseError::Constraint(
                "payments cannot be recorded against a draft invoice".to_string(),
            ));
        }
        if input.amount > invoice.balance() {
            return Err(DatabaseError::Constraint(format!(
                "payment {} exceeds outstanding balance {}",
                input.amount,
                invoice.balance()
            )));
        }

        let amount: Decimal = input.amount.round_dp(2);
        let payment = tx
            .query_one(
                &format!(
                    "INSERT INTO invoice_payments ({PAYMENT_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) RETURNING {PAYMENT_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &invoice_id,
                    &amount,
                    &input.paid_on,
                    &input.method,
                    &input.reference,
                    &input.recorded_by,
                ],
            )
            .await?;
        let payment = row_to_payment_record(&payment)?;
        let updated = tx
            .query_one(
                &format!(
                    "UPDATE invoices AS i SET amount_paid = amount_paid + $2, updated_at = NOW() \
                     WHERE i.id = $1 RETURNING {INVOICE_COLUMNS}"
                ),
                &[&invoice_id, &amount],
            )
            .await?;
        let invoice = row_to_invoice_record(&updated)?;
        tx.commit().await?;
        Ok(Some((invoice, payment)))
    }

    async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM invoice_payments WHERE invoice_id = $1 \
                     ORDER BY paid_on ASC, created_at ASC"
                ),
                &[&invoice_id],
            )
            .await?;
        rows.iter().map(row_to_payment_record).collect()
    }

    async fn invoice_numbers_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await?;
        let pattern = format!("{}%", prefix);
        let rows = conn
            .query(
                "SELECT invoice_number FROM invoices WHERE invoice_number LIKE $1",
                &[&pattern],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(DatabaseError::from))
            .collect()
    }

    async fn count_invoices_for_matter(&self, matter_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM invoices WHERE matter_id = $1",
                &[&matter_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl NoticeStore for PgBackend {
    async fn create_notice(
        &self,
        input: &CreateNoticeParams,
    ) -> Result<NoticeRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO notices AS n (id, title, body, audience, pinned, published_at, \
                     expires_at, created_by) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     RETURNING {NOTICE_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &input.title,
                    &input.body,
                    &input.audience.as_str(),
                    &input.pinned,
                    &input.published_at,
                    &input.expires_at,
                    &input.created_by,
                ],
            )
            .await?;
        row_to_notice_record(&row)
    }

    async fn get_notice(&self, id: Uuid) -> Result<Option<NoticeRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {NOTICE_COLUMNS} FROM notices n WHERE n.id = $1"),
                &[&id],
            )
            .await?;
        row.map(|row| row_to_notice_record(&row)).transpose()
    }

    async fn list_notices(
        &self,
        filter: &NoticeFilter,
    ) -> Result<Paged<NoticeRecord>, DatabaseError> {
        if filter.audiences.is_empty() {
            return Ok(Paged {
                items: Vec::new(),
                total: 0,
            });
        }
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        let audiences: Vec<String> = filter
            .audiences
            .iter()
            .map(|audience| audience.as_str().to_string())
            .collect();
        let p = args.bind(audiences);
        args.clause(format!("n.audience = ANY({p})"));
        if let Some(at) = filter.active_at {
            let p = args.bind(at);
            args.clause(format!("(n.expires_at IS NULL OR n.expires_at > {p})"));
        }
        let total = count_rows(&**conn, "notices n", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "SELECT {NOTICE_COLUMNS} FROM notices n{where_sql} \
                     ORDER BY n.pinned DESC, n.published_at DESC, n.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows
            .iter()
            .map(row_to_notice_record)
            .collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn update_notice(
        &self,
        id: Uuid,
        input: &UpdateNoticeParams,
    ) -> Result<Option<NoticeRecord>, DatabaseError> {
        let Some(existing) = self.get_notice(id).await? else {
            return Ok(None);
        };
        let title = input.title.clone().unwrap_or(existing.title);
        let body = input.body.clone().unwrap_or(existing.body);
        let audience = input.audience.unwrap_or(existing.audience);
        let pinned = input.pinned.unwrap_or(existing.pinned);
        let expires_at = input.expires_at.unwrap_or(existing.expires_at);

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE notices AS n SET title = $2, body = $3, audience = $4, pinned = $5, \
                     expires_at = $6, updated_at = NOW() WHERE n.id = $1 RETURNING {NOTICE_COLUMNS}"
                ),
                &[&id, &title, &body, &audience.as_str(), &pinned, &expires_at],
            )
            .await?;
        row.map(|row| row_to_notice_record(&row)).transpose()
    }

    async fn delete_notice(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM notices WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn audience_user_ids(&self, roles: &[Role]) -> Result<Vec<Uuid>, DatabaseError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn().await?;
        let roles: Vec<String> = roles.iter().map(|role| role.as_str().to_string()).collect();
        let rows = conn
            .query(
                "SELECT id FROM users WHERE is_active AND role = ANY($1) ORDER BY id",
                &[&roles],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(DatabaseError::from))
            .collect()
    }
}

#[async_trait]
impl ActivityStore for PgBackend {
    async fn record_activity(
        &self,
        input: &CreateActivityParams,
    ) -> Result<ActivityRecord, DatabaseError> {
        let changes = to_json_value(&input.changes)?;
        let recipients: BTreeSet<Uuid> = input
            .recipients
            .iter()
            .copied()
            .filter(|recipient| Some(*recipient) != input.actor_id)
            .collect();

        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO activity AS a (id, actor_id, entity_type, entity_id, action, summary, changes) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {ACTIVITY_COLUMNS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &input.actor_id,
                    &input.entity_type.as_str(),
                    &input.entity_id,
                    &input.action.as_str(),
                    &input.summary,
                    &changes,
                ],
            )
            .await?;
        let record = row_to_activity_record(&row, 0)?;
        for recipient in &recipients {
            tx.execute(
                "INSERT INTO notifications (id, user_id, activity_id) \
                 SELECT $1, $2, $3 WHERE EXISTS (SELECT 1 FROM users WHERE id = $2)",
                &[&Uuid::new_v4(), recipient, &record.id],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn list_activity(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Paged<ActivityRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        if let Some(entity_type) = filter.entity_type {
            let p = args.bind(entity_type.as_str().to_string());
            args.clause(format!("a.entity_type = {p}"));
        }
        if let Some(entity_id) = filter.entity_id {
            let p = args.bind(entity_id);
            args.clause(format!("a.entity_id = {p}"));
        }
        if let Some(actor_id) = filter.actor_id {
            let p = args.bind(actor_id);
            args.clause(format!("a.actor_id = {p}"));
        }
        let total = count_rows(&**conn, "activity a", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let rows = conn
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity a{where_sql} \
                     ORDER BY a.created_at DESC, a.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let items = rows
            .iter()
            .map(|row| row_to_activity_record(row, 0))
            .collect::<Result<_, _>>()?;
        Ok(Paged { items, total })
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        page: Page,
    ) -> Result<Paged<NotificationRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        let p = args.bind(user_id);
        args.clause(format!("n.user_id = {p}"));
        if unread_only {
            args.clause("n.read_at IS NULL".to_string());
        }
        let total = count_rows(&**conn, "notifications n", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(page);
        let rows = conn
            .query(
                &format!(
                    "SELECT n.id, n.user_id, n.read_at, n.created_at, {ACTIVITY_COLUMNS} \
                     FROM notifications n JOIN activity a ON a.id = n.activity_id{where_sql} \
                     ORDER BY n.created_at DESC, n.id ASC{page_sql}"
                ),
                &args.refs(),
            )
            .await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(NotificationRecord {
                id: row.try_get(0)?,
                user_id: row.try_get(1)?,
                read_at: row.try_get(2)?,
                created_at: row.try_get(3)?,
                activity: row_to_activity_record(row, 4)?,
            });
        }
        Ok(Paged { items, total })
    }

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND read_at IS NULL",
                &[&user_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE notifications SET read_at = COALESCE(read_at, $3) WHERE id = $1 AND user_id = $2",
                &[&notification_id, &user_id, &at],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn mark_all_notifications_read(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE notifications SET read_at = $2 WHERE user_id = $1 AND read_at IS NULL",
                &[&user_id, &at],
            )
            .await?;
        Ok(affected)
    }
}

#[async_trait]
impl DashboardStore for PgBackend {
    async fn matter_status_counts(
        &self,
        visibility: Visibility,
    ) -> Result<MatterStatusCounts, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        matter_scope(&mut args, visibility, "m.id");
        let rows = conn
            .query(
                &format!(
                    "SELECT m.status, COUNT(*) FROM matters m{} GROUP BY m.status",
                    args.where_sql()
                ),
                &args.refs(),
            )
            .await?;
        let mut counts = MatterStatusCounts::default();
        for row in rows {
            let status: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            match MatterStatus::from_db_value(&status) {
                Some(MatterStatus::Open) => counts.open += count,
                Some(MatterStatus::OnHold) => counts.on_hold += count,
                Some(MatterStatus::Closed) => counts.closed += count,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn count_overdue_tasks(
        &self,
        visibility: Visibility,
        today: NaiveDate,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let mut args = PgArgs::default();
        task_scope(&mut args, visibility);
        let p = args.bind(today);
        args.clause(format!(
            "t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on < {p}"
        ));
        count_rows(&**conn, "tasks t", &args).await
    }

    async fn matter_aggregates(
        &self,
        matter_id: Uuid,
        today: NaiveDate,
    ) -> Result<MatterAggregates, DatabaseError> {
        let conn = self.conn().await?;
        let mut aggregates = MatterAggregates::default();
        let rows = conn
            .query(
                "SELECT status, COUNT(*) FROM tasks WHERE matter_id = $1 GROUP BY status",
                &[&matter_id],
            )
            .await?;
        for row in rows {
            let status: String = row.try_get(0)?;
            aggregates.tasks.add(
                parse_enum(&status, TaskStatus::from_db_value, "task status")?,
                row.try_get(1)?,
            );
        }
        let row = conn
            .query_one(
                "SELECT \
                   COUNT(*) FILTER (WHERE status <> 'completed' AND due_on IS NOT NULL AND due_on < $2), \
                   COALESCE(ROUND(AVG(progress))::BIGINT, 0), \
                   (SELECT COUNT(*) FROM case_files WHERE matter_id = $1), \
                   (SELECT COUNT(*) FROM documents WHERE matter_id = $1) \
                 FROM tasks WHERE matter_id = $1",
                &[&matter_id, &today],
            )
            .await?;
        aggregates.overdue_tasks = row.try_get(0)?;
        aggregates.average_progress = row.try_get(1)?;
        aggregates.case_file_count = row.try_get(2)?;
        aggregates.document_count = row.try_get(3)?;
        Ok(aggregates)
    }

    async fn leaderboard_rows(
        &self,
        since: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<Vec<LeaderboardRow>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT u.id, u.name, u.role, \
                   COUNT(*) FILTER (WHERE t.status = 'completed' AND t.completed_at >= $1), \
                   COUNT(*) FILTER (WHERE t.status = 'completed' AND t.completed_at >= $1 \
                     AND (t.due_on IS NULL OR (t.completed_at AT TIME ZONE 'UTC')::date <= t.due_on)), \
                   COUNT(*) FILTER (WHERE t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on < $2) \
                 FROM users u \
                 JOIN task_assignees ta ON ta.user_id = u.id \
                 JOIN tasks t ON t.id = ta.task_id \
                 WHERE u.is_active AND u.role IN ('member', 'admin') \
                 GROUP BY u.id, u.name, u.role",
                &[&since, &today],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.try_get(2)?;
            out.push(LeaderboardRow {
                user_id: row.try_get(0)?,
                name: row.try_get(1)?,
                role: parse_enum(&role, Role::from_db_value, "role")?,
                completed: row.try_get(3)?,
                on_time: row.try_get(4)?,
                overdue_open: row.try_get(5)?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}
