use chrono::{DateTime, NaiveDate, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    DashboardStore, LeaderboardRow, MatterAggregates, MatterStatus, MatterStatusCounts, Role,
    Visibility,
};
use crate::error::DatabaseError;

use super::tasks::parse_task_status;
use super::{
    LibSqlBackend, QueryArgs, count_rows, fmt_ts, get_i64, get_text, matter_scope, parse_uuid,
    task_scope,
};

#[async_trait::async_trait]
impl DashboardStore for LibSqlBackend {
    async fn matter_status_counts(
        &self,
        visibility: Visibility,
    ) -> Result<MatterStatusCounts, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        matter_scope(&mut args, visibility, "m.id");
        let mut rows = conn
            .query(
                &format!(
                    "SELECT m.status, COUNT(*) FROM matters m{} GROUP BY m.status",
                    args.where_sql()
                ),
                args.params(),
            )
            .await?;
        let mut counts = MatterStatusCounts::default();
        while let Some(row) = rows.next().await? {
            let count = get_i64(&row, 1);
            match MatterStatus::from_db_value(&get_text(&row, 0)) {
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
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        task_scope(&mut args, visibility);
        let p = args.text(today.to_string());
        args.clause(format!(
            "t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on < {p}"
        ));
        count_rows(&conn, "tasks t", &args).await
    }

    async fn matter_aggregates(
        &self,
        matter_id: Uuid,
        today: NaiveDate,
    ) -> Result<MatterAggregates, DatabaseError> {
        let conn = self.connect().await?;
        let mut aggregates = MatterAggregates::default();

        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM tasks WHERE matter_id = ?1 GROUP BY status",
                params![matter_id.to_string()],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            aggregates
                .tasks
                .add(parse_task_status(&get_text(&row, 0))?, get_i64(&row, 1));
        }

        let row = conn
            .query(
                "SELECT \
                   COALESCE(SUM(CASE WHEN status <> 'completed' AND due_on IS NOT NULL AND due_on < ?2 THEN 1 ELSE 0 END), 0), \
                   COALESCE(CAST(ROUND(AVG(progress)) AS INTEGER), 0), \
                   (SELECT COUNT(*) FROM case_files WHERE matter_id = ?1), \
                   (SELECT COUNT(*) FROM documents WHERE matter_id = ?1) \
                 FROM tasks WHERE matter_id = ?1",
                params![matter_id.to_string(), today.to_string()],
            )
            .await?
            .next()
            .await?;
        if let Some(row) = row {
            aggregates.overdue_tasks = get_i64(&row, 0);
            aggregates.average_progress = get_i64(&row, 1);
            aggregates.case_file_count = get_i64(&row, 2);
            aggregates.document_count = get_i64(&row, 3);
        }
        Ok(aggregates)
    }

    async fn leaderboard_rows(
        &self,
        since: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<Vec<LeaderboardRow>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT u.id, u.name, u.role, \
                   SUM(CASE WHEN t.status = 'completed' AND t.completed_at >= ?1 THEN 1 ELSE 0 END), \
                   SUM(CASE WHEN t.status = 'completed' AND t.completed_at >= ?1 \
                        AND (t.due_on IS NULL OR substr(t.completed_at, 1, 10) <= t.due_on) THEN 1 ELSE 0 END), \
                   SUM(CASE WHEN t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on < ?2 \
                        THEN 1 ELSE 0 END) \
                 FROM users u \
                 JOIN task_assignees ta ON ta.user_id = u.id \
                 JOIN tasks t ON t.id = ta.task_id \
                 WHERE u.is_active = 1 AND u.role IN ('member', 'admin') \
                 GROUP BY u.id, u.name, u.role",
                params![fmt_ts(&since), today.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let role_raw = get_text(&row, 2);
            out.push(LeaderboardRow {
                user_id: parse_uuid(&get_text(&row, 0), "users.id")?,
                name: get_text(&row, 1),
                role: Role::from_db_value(&role_raw).ok_or_else(|| {
                    DatabaseError::Serialization(format!("invalid role '{}'", role_raw))
                })?,
                completed: get_i64(&row, 3),
                on_time: get_i64(&row, 4),
                overdue_open: get_i64(&row, 5),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    use crate::db::{CreateUserParams, Database, Role, TaskStatus, UpdateTaskParams};
    use crate::testing::{seed_matter, seed_task, seed_user, test_db};

    async fn complete(db: &dyn Database, task_id: Uuid, at: DateTime<Utc>) {
        db.update_task(
            task_id,
            &UpdateTaskParams {
                status: Some(TaskStatus::Completed),
                progress: Some(100),
                completed_at: Some(Some(at)),
                ..UpdateTaskParams::default()
            },
        )
        .await
        .unwrap()
        .expect("task exists");
    }

    #[tokio::test]
    async fn leaderboard_counts_window_timeliness_and_overdue_work() {
        let (db, _dir) = test_db().await;
        let db = db.as_ref();
        let admin = seed_user(db, "Ana Admin", Role::Admin).await;
        let member = seed_user(db, "Mia Member", Role::Member).await;
        let client = seed_user(db, "Carl Client", Role::Client).await;
        let retired = db
            .create_user(&CreateUserParams {
                name: "Rex Retired".into(),
                email: "rex.retired@firm.test".into(),
                password_hash: "x".into(),
                role: Role::Member,
                phone: None,
                title: None,
                is_active: false,
            })
            .await
            .unwrap();
        let matter = seed_matter(db, admin.id, None, vec![member.id]).await;
        let now = Utc::now();
        let today = now.date_naive();

        let late = seed_task(db, matter.id, admin.id, vec![member.id], Some(today - Duration::days(10))).await;
        complete(db, late.id, now - Duration::days(2)).await;
        let stale = seed_task(db, matter.id, admin.id, vec![member.id], None).await;
        complete(db, stale.id, now - Duration::days(40)).await;
        let prompt = seed_task(db, matter.id, admin.id, vec![member.id], Some(today + Duration::days(5))).await;
        complete(db, prompt.id, now).await;
        seed_task(db, matter.id, admin.id, vec![member.id], Some(today - Duration::days(1))).await;

        let others = seed_task(db, matter.id, admin.id, vec![retired.id, client.id], None).await;
        complete(db, others.id, now).await;

        let rows = db.leaderboard_rows(now - Duration::days(30), today).await.unwrap();
        assert_eq!(rows.len(), 1, "only active members and admins with work are listed");
        let row = &rows[0];
        assert_eq!(row.user_id, member.id);
        assert_eq!(row.role, Role::Member);
        assert_eq!((row.completed, row.on_time, row.overdue_open), (2, 1, 1));
    }
}
