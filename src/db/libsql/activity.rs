use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    ActivityAction, ActivityFilter, ActivityRecord, ActivityStore, CreateActivityParams,
    EntityType, NotificationRecord, Page, Paged,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, count_rows, fmt_ts, from_json, get_opt_text, get_text,
    in_transaction, opt_uuid, parse_ts, parse_ts_opt, parse_uuid, parse_uuid_opt, to_json,
};

const ACTIVITY_COLUMNS: &str =
    "a.id, a.actor_id, a.entity_type, a.entity_id, a.action, a.summary, a.changes, a.created_at";

fn row_to_activity_record(row: &libsql::Row, offset: i32) -> Result<ActivityRecord, DatabaseError> {
    let entity_raw = get_text(row, offset + 2);
    let action_raw = get_text(row, offset + 4);
    Ok(ActivityRecord {
        id: parse_uuid(&get_text(row, offset), "activity.id")?,
        actor_id: parse_uuid_opt(get_opt_text(row, offset + 1), "activity.actor_id")?,
        entity_type: EntityType::from_db_value(&entity_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid entity type '{}'", entity_raw))
        })?,
        entity_id: parse_uuid(&get_text(row, offset + 3), "activity.entity_id")?,
        action: ActivityAction::from_db_value(&action_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid activity action '{}'", action_raw))
        })?,
        summary: get_text(row, offset + 5),
        changes: from_json(&get_text(row, offset + 6))?,
        created_at: parse_ts(&get_text(row, offset + 7))?,
    })
}

#[async_trait::async_trait]
impl ActivityStore for LibSqlBackend {
    async fn record_activity(
        &self,
        input: &CreateActivityParams,
    ) -> Result<ActivityRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        let changes = to_json(&input.changes)?;
        let recipients: BTreeSet<Uuid> = input
            .recipients
            .iter()
            .copied()
            .filter(|recipient| Some(*recipient) != input.actor_id)
            .collect();

        in_transaction!(conn, async {
            conn.execute(
                "INSERT INTO activity (id, actor_id, entity_type, entity_id, action, summary, changes, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    opt_uuid(input.actor_id),
                    input.entity_type.as_str(),
                    input.entity_id.to_string(),
                    input.action.as_str(),
                    input.summary.as_str(),
                    changes.as_str(),
                    now.as_str(),
                ],
            )
            .await?;
            for recipient in &recipients {
                conn.execute(
                    "INSERT INTO notifications (id, user_id, activity_id, created_at) \
                     SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM users WHERE id = ?2)",
                    params![
                        Uuid::new_v4().to_string(),
                        recipient.to_string(),
                        id.to_string(),
                        now.as_str(),
                    ],
                )
                .await?;
            }
            let row = conn
                .query(
                    &format!("SELECT {ACTIVITY_COLUMNS} FROM activity a WHERE a.id = ?1"),
                    params![id.to_string()],
                )
                .await?
                .next()
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load activity".to_string()))?;
            row_to_activity_record(&row, 0)
        })
    }

    async fn list_activity(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Paged<ActivityRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        if let Some(entity_type) = filter.entity_type {
            let p = args.text(entity_type.as_str());
            args.clause(format!("a.entity_type = {p}"));
        }
        if let Some(entity_id) = filter.entity_id {
            let p = args.text(entity_id.to_string());
            args.clause(format!("a.entity_id = {p}"));
        }
        if let Some(actor_id) = filter.actor_id {
            let p = args.text(actor_id.to_string());
            args.clause(format!("a.actor_id = {p}"));
        }

        let total = count_rows(&conn, "activity a", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity a{where_sql} \
                     ORDER BY a.created_at DESC, a.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_activity_record(&row, 0)?);
        }
        Ok(Paged { items, total })
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        page: Page,
    ) -> Result<Paged<NotificationRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let p = args.text(user_id.to_string());
        args.clause(format!("n.user_id = {p}"));
        if unread_only {
            args.clause("n.read_at IS NULL".to_string());
        }

        let total = count_rows(&conn, "notifications n", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(page);
        let mut rows = conn
            .query(
                &format!(
                    "SELECT n.id, n.user_id, n.read_at, n.created_at, {ACTIVITY_COLUMNS} \
                     FROM notifications n JOIN activity a ON a.id = n.activity_id{where_sql} \
                     ORDER BY n.created_at DESC, n.id ASC{page_sql}"
                ),
                args.params(),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(NotificationRecord {
                id: parse_uuid(&get_text(&row, 0), "notification.id")?,
                user_id: parse_uuid(&get_text(&row, 1), "notification.user_id")?,
                read_at: parse_ts_opt(get_opt_text(&row, 2))?,
                created_at: parse_ts(&get_text(&row, 3))?,
                activity: row_to_activity_record(&row, 4)?,
            });
        }
        Ok(Paged { items, total })
    }

    async fn count_unread_notifications(&self, user_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let p = args.text(user_id.to_string());
        args.clause(format!("n.user_id = {p}"));
        args.clause("n.read_at IS NULL".to_string());
        count_rows(&conn, "notifications n", &args).await
    }

    async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE notifications SET read_at = COALESCE(read_at, ?3) WHERE id = ?1 AND user_id = ?2",
                params![notification_id.to_string(), user_id.to_string(), fmt_ts(&at)],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn mark_all_notifications_read(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE notifications SET read_at = ?2 WHERE user_id = ?1 AND read_at IS NULL",
                params![user_id.to_string(), fmt_ts(&at)],
            )
            .await?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::db::{
        ActivityAction, ActivityFilter, CreateActivityParams, EntityType, Page, Role,
    };
    use crate::testing::{seed_user, test_db};

    #[tokio::test]
    async fn recipients_skip_the_actor_duplicates_and_unknown_users() {
        let (db, _dir) = test_db().await;
        let actor = seed_user(db.as_ref(), "Ana Admin", Role::Admin).await;
        let reader = seed_user(db.as_ref(), "Mia Member", Role::Member).await;
        let entity = Uuid::new_v4();

        let activity = db
            .record_activity(&CreateActivityParams {
                actor_id: Some(actor.id),
                entity_type: EntityType::Matter,
                entity_id: entity,
                action: ActivityAction::Created,
                summary: "Opened matter".into(),
                changes: Vec::new(),
                recipients: vec![actor.id, reader.id, reader.id, Uuid::new_v4()],
            })
            .await
            .unwrap();
        assert_eq!(activity.actor_id, Some(actor.id));

        assert_eq!(db.count_unread_notifications(reader.id).await.unwrap(), 1);
        assert_eq!(db.count_unread_notifications(actor.id).await.unwrap(), 0);

        let inbox = db
            .list_notifications(reader.id, true, Page::default())
            .await
            .unwrap();
        assert_eq!(inbox.items[0].activity.id, activity.id);

        let history = db
            .list_activity(&ActivityFilter {
                entity_type: Some(EntityType::Matter),
                entity_id: Some(entity),
                actor_id: None,
                page: Page::default(),
            })
            .await
            .unwrap();
        assert_eq!(history.total, 1);
    }
}
