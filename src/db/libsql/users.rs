use chrono::{DateTime, Utc};
use libsql::{Value, params};
use uuid::Uuid;

use crate::db::{
    CreateUserParams, Paged, Role, UpdateUserParams, UserFilter, UserRecord, UserStore,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, bool_value, count_rows, fmt_ts, get_bool, get_opt_text, get_text,
    like_pattern, opt_text, opt_text_owned, parse_ts, parse_ts_opt, parse_uuid,
};

const USER_COLUMNS: &str = "u.id, u.name, u.email, u.role, u.phone, u.title, u.photo_path, \
     u.is_active, u.last_login_at, u.created_at, u.updated_at";

fn parse_role(raw: &str) -> Result<Role, DatabaseError> {
    Role::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid role '{}'", raw)))
}

fn row_to_user_record(row: &libsql::Row) -> Result<UserRecord, DatabaseError> {
    Ok(UserRecord {
        id: parse_uuid(&get_text(row, 0), "user.id")?,
        name: get_text(row, 1),
        email: get_text(row, 2),
        role: parse_role(&get_text(row, 3))?,
        phone: get_opt_text(row, 4),
        title: get_opt_text(row, 5),
        photo_path: get_opt_text(row, 6),
        is_active: get_bool(row, 7),
        last_login_at: parse_ts_opt(get_opt_text(row, 8))?,
        created_at: parse_ts(&get_text(row, 9))?,
        updated_at: parse_ts(&get_text(row, 10))?,
    })
}

#[async_trait::async_trait]
impl UserStore for LibSqlBackend {
    async fn create_user(&self, input: &CreateUserParams) -> Result<UserRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO users (id, name, email, password_hash, role, phone, title, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id.to_string(),
                input.name.as_str(),
                input.email.as_str(),
                input.password_hash.as_str(),
                input.role.as_str(),
                opt_text(input.phone.as_deref()),
                opt_text(input.title.as_deref()),
                bool_value(input.is_active),
                now,
            ],
        )
        .await?;

        self.get_user(id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created user".to_string()))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1 LIMIT 1"),
                params![id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_user_record(&row)).transpose()
    }

    async fn get_users_by_ids(&self, ids: &[Uuid]) -> Result<Vec<UserRecord>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let placeholders = ids
            .iter()
            .map(|id| args.text(id.to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u WHERE u.id IN ({placeholders}) ORDER BY u.name ASC"
                ),
                args.params(),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_user_record(&row)?);
        }
        Ok(out)
    }

    async fn get_user_credentials(
        &self,
        email: &str,
    ) -> Result<Option<(UserRecord, String)>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS}, u.password_hash FROM users u WHERE u.email = ?1 LIMIT 1"
                ),
                params![email],
            )
            .await?
            .next()
            .await?;
        match row {
            Some(row) => Ok(Some((row_to_user_record(&row)?, get_text(&row, 11)))),
            None => Ok(None),
        }
    }

    async fn get_password_hash(&self, id: Uuid) -> Result<Option<String>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT password_hash FROM users WHERE id = ?1 LIMIT 1",
                params![id.to_string()],
            )
            .await?
            .next()
            .await?;
        Ok(row.map(|row| get_text(&row, 0)))
    }

    async fn list_users(&self, filter: &UserFilter) -> Result<Paged<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        if let Some(role) = filter.role {
            let p = args.text(role.as_str());
            args.clause(format!("u.role = {p}"));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.text(like_pattern(search));
            args.clause(format!(
                "(LOWER(u.name) LIKE {p} ESCAPE '\\' OR u.email LIKE {p} ESCAPE '\\')"
            ));
        }
        if let Some(member_id) = filter.visible_to_member {
            let p = args.text(member_id.to_string());
            args.clause(format!(
                "(u.role <> 'client' OR u.id IN (SELECT m.client_id FROM matters m \
                   JOIN matter_members mm ON mm.matter_id = m.id \
                   WHERE mm.user_id = {p} AND m.client_id IS NOT NULL))"
            ));
        }

        let total = count_rows(&conn, "users u", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u{where_sql} ORDER BY u.name ASC, u.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_user_record(&row)?);
        }
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

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE users SET name = ?2, email = ?3, role = ?4, phone = ?5, title = ?6, \
             is_active = ?7, updated_at = ?8 WHERE id = ?1",
            params![
                id.to_string(),
                name,
                email,
                role.as_str(),
                opt_text_owned(phone),
                opt_text_owned(title),
                bool_value(is_active),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.get_user(id).await
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), hash, fmt_ts(&Utc::now())],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn set_photo_path(
        &self,
        id: Uuid,
        path: Option<&str>,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE users SET photo_path = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), opt_text(path), fmt_ts(&Utc::now())],
            )
            .await?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_user(id).await
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE users SET last_login_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_ts(&at)],
        )
        .await?;
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM users WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn count_users_with_role(&self, role: Role) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let p = args.bind(Value::Text(role.as_str().to_string()));
        args.clause(format!("u.role = {p}"));
        count_rows(&conn, "users u", &args).await
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{CreateUserParams, Role, UserFilter};
    use crate::testing::{seed_matter, seed_user, test_db};

    #[tokio::test]
    async fn emails_are_unique() {
        let (db, _dir) = test_db().await;
        let existing = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let err = db
            .create_user(&CreateUserParams {
                name: "Someone Else".into(),
                email: existing.email.clone(),
                password_hash: "x".into(),
                role: Role::Member,
                phone: None,
                title: None,
                is_active: true,
            })
            .await
            .expect_err("duplicate email");
        assert!(err.is_constraint());

        let (found, hash) = db
            .get_user_credentials(&existing.email)
            .await
            .unwrap()
            .expect("credentials");
        assert_eq!(found.id, existing.id);
        assert!(hash.starts_with("$argon2"));
        assert_eq!(db.count_users_with_role(Role::Admin).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn members_only_list_their_own_clients() {
        let (db, _dir) = test_db().await;
        let admin = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(db.as_ref(), "Mia Member", Role::Member).await;
        let theirs = seed_user(db.as_ref(), "Carl Client", Role::Client).await;
        let stranger = seed_user(db.as_ref(), "Sue Stranger", Role::Client).await;
        seed_matter(db.as_ref(), admin.id, Some(theirs.id), vec![member.id]).await;
        seed_matter(db.as_ref(), admin.id, Some(stranger.id), vec![]).await;

        let clients = db
            .list_users(&UserFilter {
                role: Some(Role::Client),
                visible_to_member: Some(member.id),
                ..UserFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(clients.total, 1);
        assert_eq!(clients.items[0].id, theirs.id);
    }
}
