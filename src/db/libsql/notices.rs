use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    CreateNoticeParams, NoticeAudience, NoticeFilter, NoticeRecord, NoticeStore, Paged, Role,
    UpdateNoticeParams,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, bool_value, count_rows, fmt_ts, get_bool, get_opt_text, get_text,
    opt_ts, parse_ts, parse_ts_opt, parse_uuid, parse_uuid_opt,
};

const NOTICE_COLUMNS: &str = "n.id, n.title, n.body, n.audience, n.pinned, n.published_at, \
     n.expires_at, n.created_by, n.created_at, n.updated_at";

fn parse_audience(raw: &str) -> Result<NoticeAudience, DatabaseError> {
    NoticeAudience::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid notice audience '{}'", raw)))
}

fn row_to_notice_record(row: &libsql::Row) -> Result<NoticeRecord, DatabaseError> {
    Ok(NoticeRecord {
        id: parse_uuid(&get_text(row, 0), "notice.id")?,
        title: get_text(row, 1),
        body: get_text(row, 2),
        audience: parse_audience(&get_text(row, 3))?,
        pinned: get_bool(row, 4),
        published_at: parse_ts(&get_text(row, 5))?,
        expires_at: parse_ts_opt(get_opt_text(row, 6))?,
        created_by: parse_uuid_opt(get_opt_text(row, 7), "notice.created_by")?,
        created_at: parse_ts(&get_text(row, 8))?,
        updated_at: parse_ts(&get_text(row, 9))?,
    })
}

#[async_trait::async_trait]
impl NoticeStore for LibSqlBackend {
    async fn create_notice(
        &self,
        input: &CreateNoticeParams,
    ) -> Result<NoticeRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO notices (id, title, body, audience, pinned, published_at, expires_at, \
             created_by, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id.to_string(),
                input.title.as_str(),
                input.body.as_str(),
                input.audience.as_str(),
                bool_value(input.pinned),
                fmt_ts(&input.published_at),
                opt_ts(input.expires_at),
                input.created_by.to_string(),
                now,
            ],
        )
        .await?;

        self.get_notice(id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created notice".to_string()))
    }

    async fn get_notice(&self, id: Uuid) -> Result<Option<NoticeRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {NOTICE_COLUMNS} FROM notices n WHERE n.id = ?1 LIMIT 1"),
                params![id.to_string()],
            )
            .await?
            .next()
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
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let audiences = filter
            .audiences
            .iter()
            .map(|audience| args.text(audience.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        args.clause(format!("n.audience IN ({audiences})"));
        if let Some(at) = filter.active_at {
            let p = args.text(fmt_ts(&at));
            args.clause(format!("(n.expires_at IS NULL OR n.expires_at > {p})"));
        }

        let total = count_rows(&conn, "notices n", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {NOTICE_COLUMNS} FROM notices n{where_sql} \
                     ORDER BY n.pinned DESC, n.published_at DESC, n.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_notice_record(&row)?);
        }
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

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE notices SET title = ?2, body = ?3, audience = ?4, pinned = ?5, expires_at = ?6, \
             updated_at = ?7 WHERE id = ?1",
            params![
                id.to_string(),
                title,
                body,
                audience.as_str(),
                bool_value(pinned),
                opt_ts(expires_at),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.get_notice(id).await
    }

    async fn delete_notice(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM notices WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn audience_user_ids(&self, roles: &[Role]) -> Result<Vec<Uuid>, DatabaseError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let placeholders = roles
            .iter()
            .map(|role| args.text(role.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = conn
            .query(
                &format!(
                    "SELECT id FROM users WHERE is_active = 1 AND role IN ({placeholders}) ORDER BY id"
                ),
                args.params(),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(parse_uuid(&get_text(&row, 0), "users.id")?);
        }
        Ok(out)
    }
}
