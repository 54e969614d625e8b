use chrono::{NaiveDate, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    CreateTaskParams, Paged, TaskFilter, TaskPriority, TaskRecord, TaskStatus, TaskStatusCounts,
    TaskStore, UpdateTaskParams, Visibility,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, QueryArgs, count_rows, fmt_ts, from_json, get_i64, get_opt_text, get_text,
    in_transaction, like_pattern, opt_date, opt_text, opt_text_owned, opt_ts, opt_uuid,
    parse_date_opt, parse_ts, parse_ts_opt, parse_uuid, parse_uuid_opt, task_scope, to_json,
};

const TASK_COLUMNS: &str = "t.id, t.title, t.description, t.matter_id, t.case_file_id, t.priority, \
     t.status, t.checklist, t.progress, t.due_on, t.completed_at, t.reminder_sent_at, t.created_by, \
     t.created_at, t.updated_at";

pub(super) fn parse_task_status(raw: &str) -> Result<TaskStatus, DatabaseError> {
    TaskStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid task status '{}'", raw)))
}

fn parse_task_priority(raw: &str) -> Result<TaskPriority, DatabaseError> {
    TaskPriority::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid task priority '{}'", raw)))
}

/// Maps a row without `assignee_ids`; callers attach those separately.
fn row_to_task_record(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let progress = i32::try_from(get_i64(row, 8))
        .map_err(|_| DatabaseError::Serialization("invalid task progress".to_string()))?;
    Ok(TaskRecord {
        id: parse_uuid(&get_text(row, 0), "task.id")?,
        title: get_text(row, 1),
        description: get_opt_text(row, 2),
        matter_id: parse_uuid(&get_text(row, 3), "task.matter_id")?,
        case_file_id: parse_uuid_opt(get_opt_text(row, 4), "task.case_file_id")?,
        assignee_ids: Vec::new(),
        priority: parse_task_priority(&get_text(row, 5))?,
        status: parse_task_status(&get_text(row, 6))?,
        checklist: from_json(&get_text(row, 7))?,
        progress,
        due_on: parse_date_opt(get_opt_text(row, 9))?,
        completed_at: parse_ts_opt(get_opt_text(row, 10))?,
        reminder_sent_at: parse_ts_opt(get_opt_text(row, 11))?,
        created_by: parse_uuid_opt(get_opt_text(row, 12), "task.created_by")?,
        created_at: parse_ts(&get_text(row, 13))?,
        updated_at: parse_ts(&get_text(row, 14))?,
    })
}

async fn load_assignee_ids(
    conn: &libsql::Connection,
    task_id: Uuid,
) -> Result<Vec<Uuid>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT user_id FROM task_assignees WHERE task_id = ?1 ORDER BY position ASC",
            params![task_id.to_string()],
        )
        .await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(parse_uuid(&get_text(&row, 0), "task_assignees.user_id")?);
    }
    Ok(out)
}

async fn replace_assignees(
    conn: &libsql::Connection,
    task_id: Uuid,
    assignee_ids: &[Uuid],
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM task_assignees WHERE task_id = ?1",
        params![task_id.to_string()],
    )
    .await?;
    for (position, user_id) in assignee_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO task_assignees (task_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![task_id.to_string(), user_id.to_string(), position as i64],
        )
        .await?;
    }
    Ok(())
}

async fn fetch_task(
    conn: &libsql::Connection,
    id: Uuid,
) -> Result<Option<TaskRecord>, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1 LIMIT 1"),
            params![id.to_string()],
        )
        .await?
        .next()
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut record = row_to_task_record(&row)?;
    record.assignee_ids = load_assignee_ids(conn, id).await?;
    Ok(Some(record))
}

async fn query_tasks(
    conn: &libsql::Connection,
    sql: &str,
    args: &QueryArgs,
) -> Result<Vec<TaskRecord>, DatabaseError> {
    let mut rows = conn.query(sql, args.params()).await?;
    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(row_to_task_record(&row)?);
    }
    for item in &mut items {
        item.assignee_ids = load_assignee_ids(conn, item.id).await?;
    }
    Ok(items)
}

#[async_trait::async_trait]
impl TaskStore for LibSqlBackend {
    async fn create_task(&self, input: &CreateTaskParams) -> Result<TaskRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let now = fmt_ts(&Utc::now());
        let checklist = to_json(&input.checklist)?;
        in_transaction!(conn, async {
            conn.execute(
                "INSERT INTO tasks (id, title, description, matter_id, case_file_id, priority, status, \
                 checklist, progress, due_on, completed_at, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    id.to_string(),
                    input.title.as_str(),
                    opt_text(input.description.as_deref()),
                    input.matter_id.to_string(),
                    opt_uuid(input.case_file_id),
                    input.priority.as_str(),
                    input.status.as_str(),
                    checklist.as_str(),
                    i64::from(input.progress),
                    opt_date(input.due_on),
                    opt_ts(input.completed_at),
                    input.created_by.to_string(),
                    now.as_str(),
                ],
            )
            .await?;
            replace_assignees(&conn, id, &input.assignee_ids).await?;
            fetch_task(&conn, id)
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load created task".to_string()))
        })
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.connect().await?;
        fetch_task(&conn, id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Paged<TaskRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        task_scope(&mut args, filter.visibility);
        if let Some(status) = filter.status {
            let p = args.text(status.as_str());
            args.clause(format!("t.status = {p}"));
        }
        if let Some(matter_id) = filter.matter_id {
            let p = args.text(matter_id.to_string());
            args.clause(format!("t.matter_id = {p}"));
        }
        if let Some(assignee_id) = filter.assignee_id {
            let p = args.text(assignee_id.to_string());
            args.clause(format!(
                "t.id IN (SELECT task_id FROM task_assignees WHERE user_id = {p})"
            ));
        }
        if let Some(priority) = filter.priority {
            let p = args.text(priority.as_str());
            args.clause(format!("t.priority = {p}"));
        }
        if let Some(before) = filter.overdue_before {
            let p = args.text(before.to_string());
            args.clause(format!(
                "t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on < {p}"
            ));
        }
        if let Some((from, to)) = filter.due_between {
            let from = args.text(from.to_string());
            let to = args.text(to.to_string());
            args.clause(format!(
                "t.status <> 'completed' AND t.due_on IS NOT NULL AND t.due_on >= {from} AND t.due_on <= {to}"
            ));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let p = args.text(like_pattern(search));
            args.clause(format!(
                "(LOWER(t.title) LIKE {p} ESCAPE '\\' OR LOWER(COALESCE(t.description, '')) LIKE {p} ESCAPE '\\')"
            ));
        }

        let total = count_rows(&conn, "tasks t", &args).await?;
        let where_sql = args.where_sql();
        let page_sql = args.page_sql(filter.page);
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t{where_sql} \
             ORDER BY t.due_on IS NULL, t.due_on ASC, t.created_at DESC, t.id ASC{page_sql}"
        );
        let items = query_tasks(&conn, &sql, &args).await?;
        Ok(Paged { items, total })
    }

    async fn update_task(
        &self,
        id: Uuid,
        input: &UpdateTaskParams,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let Some(existing) = fetch_task(&conn, id).await? else {
            return Ok(None);
        };

        let title = input.title.clone().unwrap_or(existing.title);
        let description = input.description.clone().unwrap_or(existing.description);
        let case_file_id = input.case_file_id.unwrap_or(existing.case_file_id);
        let priority = input.priority.unwrap_or(existing.priority);
        let status = input.status.unwrap_or(existing.status);
        let checklist = to_json(input.checklist.as_ref().unwrap_or(&existing.checklist))?;
        let progress = input.progress.unwrap_or(existing.progress);
        let due_on = input.due_on.unwrap_or(existing.due_on);
        let completed_at = input.completed_at.unwrap_or(existing.completed_at);
        let reminder_sent_at = input.reminder_sent_at.unwrap_or(existing.reminder_sent_at);

        in_transaction!(conn, async {
            conn.execute(
                "UPDATE tasks SET title = ?2, description = ?3, case_file_id = ?4, priority = ?5, \
                 status = ?6, checklist = ?7, progress = ?8, due_on = ?9, completed_at = ?10, \
                 reminder_sent_at = ?11, updated_at = ?12 WHERE id = ?1",
                params![
                    id.to_string(),
                    title,
                    opt_text_owned(description),
                    opt_uuid(case_file_id),
                    priority.as_str(),
                    status.as_str(),
                    checklist,
                    i64::from(progress),
                    opt_date(due_on),
                    opt_ts(completed_at),
                    opt_ts(reminder_sent_at),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;
            if let Some(assignee_ids) = &input.assignee_ids {
                replace_assignees(&conn, id, assignee_ids).await?;
            }
            fetch_task(&conn, id).await
        })
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    async fn task_status_counts(
        &self,
        visibility: Visibility,
    ) -> Result<TaskStatusCounts, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        task_scope(&mut args, visibility);
        let where_sql = args.where_sql();
        let mut rows = conn
            .query(
                &format!("SELECT t.status, COUNT(*) FROM tasks t{where_sql} GROUP BY t.status"),
                args.params(),
            )
            .await?;
        let mut counts = TaskStatusCounts::default();
        while let Some(row) = rows.next().await? {
            counts.add(parse_task_status(&get_text(&row, 0))?, get_i64(&row, 1));
        }
        Ok(counts)
    }

    async fn tasks_due_for_reminder(
        &self,
        due_by: NaiveDate,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut args = QueryArgs::default();
        let p = args.text(due_by.to_string());
        args.clause("t.status <> 'completed'".to_string());
        args.clause("t.reminder_sent_at IS NULL".to_string());
        args.clause(format!("t.due_on IS NOT NULL AND t.due_on <= {p}"));
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t{} ORDER BY t.due_on ASC, t.id ASC",
            args.where_sql()
        );
        query_tasks(&conn, &sql, &args).await
    }

    async fn is_task_assignee(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT 1 FROM task_assignees WHERE task_id = ?1 AND user_id = ?2 LIMIT 1",
                params![task_id.to_string(), user_id.to_string()],
            )
            .await?
            .next()
            .await?;
        Ok(row.is_some())
    }
}
