use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    CreateMatterParams, MatterFilter, MatterRecord, MatterStatus, MatterStore, Paged,
    UpdateMatterParams, Visibility,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, count_rows, fmt_ts, get_i64, get_opt_text, get_text, in_transaction,
    like_pattern, matter_scope, opt_date, opt_text, opt_text_owned, opt_uuid, parse_date_opt,
    parse_ts, parse_uuid, parse_uuid_opt,
};

const MATTER_COLUMNS: &str = "m.id, m.matter_number, m.title, m.description, m.practice_area, \
     m.status, m.client_id, m.opened_on, m.closed_on, m.created_by, m.created_at, m.updated_at";

fn parse_matter_status(raw: &str) -> Result<MatterStatus, DatabaseError> {
    MatterStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid matter status '{}'", raw)))
}

/// Maps a row without `member_ids`; callers attach those separately.
fn row_to_matter_record(row: &libsql::Row) -> Result<MatterRecord, DatabaseError> {
    Ok(MatterRecord {
        id: parse_uuid(&get_text(row, 0), "matter.id")?,
        matter_number: get_text(row, 1),
        title: get_text(row, 2),
        description: get_opt_text(row, 3),
        practice_area: get_opt_text(row, 4),
        status: parse_matter_status(&get_text(row, 5))?,
        client_id: parse_uuid_opt(get_opt_text(row, 6), "matter.client_id")?,
        member_ids: Vec::new(),
        opened_on: parse_date_opt(get_opt_text(row, 7))?,
        closed_on: parse_date_opt(get_opt_text(row, 8))?,
        created_by: parse_uuid_opt(get_opt_text(row, 9), "matter.created_by")?,
        created_at: parse_ts(&get_text(row, 10))?,
        updated_at: parse_ts(&get_text(row, 11))?,
    })
}

async fn load_member_ids(
    conn: &libsql::Connection,
    matter_id: Uuid,
) -> Result<Vec<Uuid>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT user_id FROM matter_members WHERE matter_id = ?1 ORDER BY position ASC",
            params![matter_id.to_string()],
        )
        .await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(parse_uuid(&get_text(&row, 0), "matter_members.user_id")?);
    }
    Ok(out)
}

async fn replace_members(
    conn: &libsql::Connection,
    matter_id: Uuid,
    member_ids: &[Uuid],
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM matter_members WHERE matter_id = ?1",
        params![matter_id.to_string()],
    )
    .await?;
    for (position, user_id) in member_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO matter_members (matter_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![matter_id.to_string(), user_id.to_string(), position as i64],
        )
        .await?;
    }
    Ok(())
}

async fn fetch_matter(
    conn: &libsql::Connection,
    id: Uuid,
) -> Result<Option<MatterRecord>, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {MATTER_COLUMNS} FROM matters m WHERE m.id = ?1 LIMIT 1"),
            params![id.to_string()],
        )
        .await?
        .next()
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut record = row_to_matter_record(&row)?;
    record.member_ids = load_member_ids(conn, id).await?;
    Ok(Some(record))
}

#[async_trait::async_trait]
impl MatterStore for LibSqlBackend {
    async fn create_matter(
        &self,
        input: &CreateMatterParams,
    ) -> Result<MatterRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        in_transaction!(conn, async {
            conn.execute(
                "INSERT INTO matters (id, matter_number, title, description, practice_area, status, \
                 client_id, opened_on, closed_on, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id.to_string(),
                    input.matter_number.as_str(),
                    input.title.as_str(),
                    opt_text(input.description.as_deref()),
                    opt_text(input.practice_area.as_deref()),
                    input.status.as_str(),
                    opt_uuid(input.client_id),
                    opt_date(input.opened_on),
                    opt_date(input.closed_on),
                    input.created_by.to_string(),
                    now.as_str(),
                ],
            )
            .await?;
            replace_members(&conn, id, &input.member_ids).await?;
            fetch_matter(&conn, id)
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load created matter".to_string()))
        })
    }

    async fn get_matter(&self, id: Uuid) -> Result<Option<MatterRecord>, DatabaseError> {
        let conn = self.connect().await?;
        fetch_matter(&conn, id).await
    }

    async fn list_matters(
        &self,
        filter: &MatterFilter,
    ) -> Result<Paged<MatterRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        matter_scope(&mut args, filter.visibility, "m.id");
        if let Some(status) = filter.status {
            let p = args.text(status.as_str());
            args.clause(format!("m.status = {p}"));
        }
        if let Some(client_id) = filter.client_id {
            let p = args.text(client_id.to_string());
            args.clause(format!("m.client_id = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.text(like_pattern(search));
            args.clause(format!(
                "(LOWER(m.title) LIKE {p} ESCAPE '\\' OR LOWER(m.matter_number) LIKE {p} ESCAPE '\\')"
            ));
        }

        let total = count_rows(&conn, "matters m", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MATTER_COLUMNS} FROM matters m{where_sql} \
                     ORDER BY m.created_at DESC, m.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_matter_record(&row)?);
        }
        for item in &mut items {
            item.member_ids = load_member_ids(&conn, item.id).await?;
        }
        Ok(Paged { items, total })
    }

    async fn update_matter(
        &self,
        id: Uuid,
        input: &UpdateMatterParams,
    ) -> Result<Option<MatterRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let Some(existing) = fetch_matter(&conn, id).await? else {
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

        in_transaction!(conn, async {
            conn.execute(
                "UPDATE matters SET matter_number = ?2, title = ?3, description = ?4, \
                 practice_area = ?5, status = ?6, client_id = ?7, opened_on = ?8, closed_on = ?9, \
                 updated_at = ?10 WHERE id = ?1",
                params![
                    id.to_string(),
                    matter_number,
                    title,
                    opt_text_owned(description),
                    opt_text_owned(practice_area),
                    status.as_str(),
                    opt_uuid(client_id),
                    opt_date(opened_on),
                    opt_date(closed_on),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;
            if let Some(member_ids) = &input.member_ids {
                replace_members(&conn, id, member_ids).await?;
            }
            fetch_matter(&conn, id).await
        })
    }

    async fn delete_matter(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM matters WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn is_matter_visible(
        &self,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let p = args.text(id.to_string());
        args.clause(format!("m.id = {p}"));
        matter_scope(&mut args, visibility, "m.id");
        Ok(count_rows(&conn, "matters m", &args).await? > 0)
    }

    async fn matter_numbers_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT matter_number FROM matters WHERE matter_number LIKE ?1",
                params![format!("{}%", prefix)],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(get_text(&row, 0));
        }
        Ok(out)
    }

    async fn count_client_matters(&self, client_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT COUNT(*) FROM matters WHERE client_id = ?1",
                params![client_id.to_string()],
            )
            .await?
            .next()
            .await?;
        Ok(row.map(|row| get_i64(&row, 0)).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{MatterFilter, Page, Role, Visibility};
    use crate::testing::{seed_matter, seed_task, seed_user, test_db};

    #[tokio::test]
    async fn members_reach_matters_through_membership_or_assignment() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(db.as_ref(), "Mia Member", Role::Member).await;
        let joined = seed_matter(db.as_ref(), admin.id, None, vec![member.id]).await;
        let assigned = seed_matter(db.as_ref(), admin.id, None, vec![]).await;
        let hidden = seed_matter(db.as_ref(), admin.id, None, vec![]).await;
        seed_task(db.as_ref(), assigned.id, admin.id, vec![member.id], None).await;

        let scope = Visibility::Member(member.id);
        assert!(db.is_matter_visible(joined.id, scope).await.unwrap());
        assert!(db.is_matter_visible(assigned.id, scope).await.unwrap());
        assert!(!db.is_matter_visible(hidden.id, scope).await.unwrap());

        let listed = db
            .list_matters(&MatterFilter {
                visibility: scope,
                status: None,
                client_id: None,
                search: None,
                page: Page::default(),
            })
            .await
            .unwrap();
        assert_eq!(listed.total, 2);
        assert!(listed.items.iter().all(|m| m.id != hidden.id));
    }

    #[tokio::test]
    async fn clients_cannot_be_removed_while_they_have_matters() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let client = seed_user(db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(db.as_ref(), admin.id, Some(client.id), vec![]).await;

        assert!(
            db.is_matter_visible(matter.id, Visibility::Client(client.id))
                .await
                .unwrap()
        );
        assert_eq!(db.count_client_matters(client.id).await.unwrap(), 1);

        let err = db.delete_user(client.id).await.expect_err("restricted");
        assert!(err.is_constraint());

        assert!(db.delete_matter(matter.id).await.unwrap());
        assert!(db.delete_user(client.id).await.unwrap());
    }

    #[tokio::test]
    async fn numbers_are_found_by_prefix() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        seed_matter(db.as_ref(), admin.id, None, vec![]).await;
        let numbers = db.matter_numbers_with_prefix("MAT-TEST-").await.unwrap();
        assert_eq!(numbers.len(), 1);
        assert!(db.matter_numbers_with_prefix("MAT-1999-").await.unwrap().is_empty());
    }
}
