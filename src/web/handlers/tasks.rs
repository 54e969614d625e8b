//! Tasks, their checklists and assignment notifications.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{
    ActivityAction, ChecklistItem, CreateTaskParams, EntityType, MatterRecord, Role, TaskFilter,
    TaskPriority, TaskRecord, TaskStatus, UpdateTaskParams, UserRecord,
};
use crate::email::TaskEmail;
use crate::legal::access::visibility_for;
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::normalize::{empty_to_none, required_text};
use crate::legal::tasks::{
    Lifecycle, MAX_CHECKLIST_ITEMS, apply_status, build_checklist, derive_from_checklist,
    new_item, remove_item, set_item_done,
};
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiResult, bad_request, check_case_file, db_error, deny, internal_users, not_found, page_of,
    referenced_matter, works_on_matter,
};
use crate::web::server::AppState;
use crate::web::types::{
    ChecklistAddRequest, ChecklistToggleRequest, CreateTaskRequest, PagedResponse,
    TaskCountsResponse, TaskListQuery, TaskStatusRequest, UpdateTaskRequest,
};

/// Mirrors the list scope: staff see everything, members their assignments
/// and tasks on their matters, clients tasks on their own matters.
fn can_see(user: &UserRecord, task: &TaskRecord, matter: &MatterRecord) -> bool {
    match user.role {
        Role::SuperAdmin | Role::Admin => true,
        Role::Member => {
            task.assignee_ids.contains(&user.id) || matter.member_ids.contains(&user.id)
        }
        Role::Client => matter.client_id == Some(user.id),
    }
}

/// Status and checklist changes are also open to assignees.
fn can_progress(user: &UserRecord, task: &TaskRecord, matter: &MatterRecord) -> bool {
    works_on_matter(user, matter)
        || (user.role != Role::Client && task.assignee_ids.contains(&user.id))
}

async fn load_visible(
    state: &AppState,
    user: &UserRecord,
    id: Uuid,
) -> ApiResult<(TaskRecord, MatterRecord)> {
    let task = state
        .db
        .get_task(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Task", id))?;
    let matter = state
        .db
        .get_matter(task.matter_id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Task", id))?;
    if !can_see(user, &task, &matter) {
        return Err(not_found("Task", id));
    }
    Ok((task, matter))
}

fn task_email(recipient: &UserRecord, task: &TaskRecord, matter: &MatterRecord) -> TaskEmail {
    TaskEmail {
        recipient: recipient.name.clone(),
        title: task.title.clone(),
        matter: format!("{} {}", matter.matter_number, matter.title),
        due_on: task.due_on,
        priority: task.priority.as_str().to_string(),
        status: task.status.as_str().to_string(),
        progress: task.progress,
    }
}

/// Activity and email for users who just joined a task.
async fn announce_assignment(
    state: &AppState,
    actor: &UserRecord,
    task: &TaskRecord,
    matter: &MatterRecord,
    added: &[Uuid],
) {
    let added: Vec<Uuid> = added.iter().copied().filter(|id| *id != actor.id).collect();
    if added.is_empty() {
        return;
    }
    Entry::new(
        actor.id,
        EntityType::Task,
        task.id,
        ActivityAction::Assigned,
        format!("{} assigned you \"{}\"", actor.name, task.title),
    )
    .notify(added.iter().copied())
    .record(state.db.as_ref())
    .await;

    let recipients = match state.db.get_users_by_ids(&added).await {
        Ok(users) => users,
        Err(e) => {
            tracing::warn!(task_id = %task.id, "could not load assignees for email: {}", e);
            return;
        }
    };
    for user in recipients.iter().filter(|u| u.is_active) {
        let email = task_email(user, task, matter);
        state
            .mailer
            .deliver(state.mailer.task_assigned(&user.email, &actor.name, &email))
            .await;
    }
}

/// Persist a lifecycle change and log it.
async fn save_lifecycle(
    state: &AppState,
    actor: &UserRecord,
    before: &TaskRecord,
    next: Lifecycle,
    summary: String,
) -> ApiResult<TaskRecord> {
    let params = UpdateTaskParams {
        status: Some(next.status),
        checklist: Some(next.checklist),
        progress: Some(next.progress),
        completed_at: Some(next.completed_at),
        ..UpdateTaskParams::default()
    };
    let after = state
        .db
        .update_task(before.id, &params)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Task", before.id))?;

    let changes = diff_fields(before, &after);
    if !changes.is_empty() {
        let action = if before.status != after.status {
            ActivityAction::StatusChanged
        } else {
            ActivityAction::Updated
        };
        Entry::new(actor.id, EntityType::Task, after.id, action, summary)
            .changes(changes)
            .notify(after.assignee_ids.iter().copied())
            .record(state.db.as_ref())
            .await;
    }
    Ok(after)
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<PagedResponse<TaskRecord>>> {
    let page = page_of(query.page, query.limit);
    let mut filter = TaskFilter::new(visibility_for(&user));
    filter.status = query.status;
    filter.matter_id = query.matter_id;
    filter.assignee_id = query.assignee_id;
    filter.priority = query.priority;
    if query.overdue == Some(true) {
        filter.overdue_before = Some(Utc::now().date_naive());
    }
    filter.search = empty_to_none(query.search.as_deref());
    filter.page = page;

    let tasks = state.db.list_tasks(&filter).await.map_err(db_error)?;
    Ok(Json(PagedResponse::new(tasks, page)))
}

pub async fn counts_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<TaskCountsResponse>> {
    let visibility = visibility_for(&user);
    let counts = state
        .db
        .task_status_counts(visibility)
        .await
        .map_err(db_error)?;
    let overdue = state
        .db
        .count_overdue_tasks(visibility, Utc::now().date_naive())
        .await
        .map_err(db_error)?;
    Ok(Json(TaskCountsResponse {
        counts,
        total: counts.total(),
        overdue,
    }))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TaskRecord>> {
    let (task, _) = load_visible(&state, &user, id).await?;
    Ok(Json(task))
}

fn initial_lifecycle(
    checklist: Vec<ChecklistItem>,
    status: Option<TaskStatus>,
    now: DateTime<Utc>,
) -> Lifecycle {
    let blank = Lifecycle {
        status: TaskStatus::Pending,
        checklist: Vec::new(),
        progress: 0,
        completed_at: None,
    };
    let derived = derive_from_checklist(&blank, checklist, now);
    match status {
        Some(status) => apply_status(&derived, status, now),
        None => derived,
    }
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskRecord>)> {
    let matter = referenced_matter(state.db.as_ref(), &actor, req.matter_id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "create_task"));
    }

    let title = required_text("title", &req.title).map_err(bad_request)?;
    if let Some(case_file_id) = req.case_file_id {
        check_case_file(state.db.as_ref(), case_file_id, matter.id).await?;
    }
    let assignee_ids =
        internal_users(state.db.as_ref(), &req.assignee_ids, "assignee_ids").await?;
    let checklist = build_checklist(req.checklist).map_err(bad_request)?;
    let lifecycle = initial_lifecycle(checklist, req.status, Utc::now());

    let created = state
        .db
        .create_task(&CreateTaskParams {
            title,
            description: empty_to_none(req.description.as_deref()),
            matter_id: matter.id,
            case_file_id: req.case_file_id,
            assignee_ids,
            priority: req.priority.unwrap_or(TaskPriority::Medium),
            status: lifecycle.status,
            checklist: lifecycle.checklist,
            progress: lifecycle.progress,
            due_on: req.due_on,
            completed_at: lifecycle.completed_at,
            created_by: actor.id,
        })
        .await
        .map_err(db_error)?;

    Entry::new(
        actor.id,
        EntityType::Task,
        created.id,
        ActivityAction::Created,
        format!(
            "{} created task \"{}\" on {}",
            actor.name, created.title, matter.matter_number
        ),
    )
    .changes(snapshot(&created, true))
    .record(state.db.as_ref())
    .await;
    announce_assignment(&state, &actor, &created, &matter, &created.assignee_ids).await;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<Json<TaskRecord>> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "update_task"));
    }
    let now = Utc::now();

    let mut params = UpdateTaskParams::default();
    if let Some(title) = &req.title {
        params.title = Some(required_text("title", title).map_err(bad_request)?);
    }
    if let Some(description) = &req.description {
        params.description = Some(empty_to_none(description.as_deref()));
    }
    if let Some(case_file_id) = req.case_file_id {
        if let Some(case_file_id) = case_file_id {
            check_case_file(state.db.as_ref(), case_file_id, matter.id).await?;
        }
        params.case_file_id = Some(case_file_id);
    }
    if let Some(ids) = &req.assignee_ids {
        params.assignee_ids = Some(internal_users(state.db.as_ref(), ids, "assignee_ids").await?);
    }
    params.priority = req.priority;
    if let Some(due_on) = req.due_on
        && due_on != before.due_on
    {
        params.due_on = Some(due_on);
        params.reminder_sent_at = Some(None);
    }

    let previous = Lifecycle::from(&before);
    let mut next = previous.clone();
    if let Some(items) = req.checklist {
        next = derive_from_checklist(&next, build_checklist(items).map_err(bad_request)?, now);
    }
    if let Some(status) = req.status {
        next = apply_status(&next, status, now);
    }
    if next != previous {
        params.status = Some(next.status);
        params.checklist = Some(next.checklist);
        params.progress = Some(next.progress);
        params.completed_at = Some(next.completed_at);
    }

    let after = state
        .db
        .update_task(id, &params)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Task", id))?;

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        let action = if before.status != after.status {
            ActivityAction::StatusChanged
        } else {
            ActivityAction::Updated
        };
        Entry::new(
            actor.id,
            EntityType::Task,
            after.id,
            action,
            format!("{} updated task \"{}\"", actor.name, after.title),
        )
        .changes(changes)
        .notify(
            after
                .assignee_ids
                .iter()
                .filter(|id| before.assignee_ids.contains(id))
                .copied(),
        )
        .record(state.db.as_ref())
        .await;
    }
    let added: Vec<Uuid> = after
        .assignee_ids
        .iter()
        .filter(|id| !before.assignee_ids.contains(id))
        .copied()
        .collect();
    announce_assignment(&state, &actor, &after, &matter, &added).await;

    Ok(Json(after))
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<TaskStatusRequest>,
) -> ApiResult<Json<TaskRecord>> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !can_progress(&actor, &before, &matter) {
        return Err(deny(&state, &actor, "update_task_status"));
    }
    let next = apply_status(&Lifecycle::from(&before), req.status, Utc::now());
    let summary = format!(
        "{} marked \"{}\" as {}",
        actor.name,
        before.title,
        req.status.as_str()
    );
    Ok(Json(save_lifecycle(&state, &actor, &before, next, summary).await?))
}

pub async fn checklist_add_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<ChecklistAddRequest>,
) -> ApiResult<(StatusCode, Json<TaskRecord>)> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !can_progress(&actor, &before, &matter) {
        return Err(deny(&state, &actor, "edit_checklist"));
    }
    if before.checklist.len() >= MAX_CHECKLIST_ITEMS {
        return Err(bad_request(format!(
            "checklist may hold at most {MAX_CHECKLIST_ITEMS} items"
        )));
    }
    let item = new_item(&req.text).map_err(bad_request)?;
    let summary = format!("{} added \"{}\" to \"{}\"", actor.name, item.text, before.title);
    let mut checklist = before.checklist.clone();
    checklist.push(item);

    let previous = Lifecycle::from(&before);
    let next = derive_from_checklist(&previous, checklist, Utc::now());
    let after = save_lifecycle(&state, &actor, &before, next, summary).await?;
    Ok((StatusCode::CREATED, Json(after)))
}

pub async fn checklist_toggle_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ChecklistToggleRequest>,
) -> ApiResult<Json<TaskRecord>> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !can_progress(&actor, &before, &matter) {
        return Err(deny(&state, &actor, "edit_checklist"));
    }
    let checklist = set_item_done(&before.checklist, item_id, req.done)
        .ok_or_else(|| not_found("Checklist item", item_id))?;
    let next = derive_from_checklist(&Lifecycle::from(&before), checklist, Utc::now());
    let summary = format!("{} updated the checklist of \"{}\"", actor.name, before.title);
    Ok(Json(save_lifecycle(&state, &actor, &before, next, summary).await?))
}

pub async fn checklist_delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<TaskRecord>> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !can_progress(&actor, &before, &matter) {
        return Err(deny(&state, &actor, "edit_checklist"));
    }
    let checklist = remove_item(&before.checklist, item_id)
        .ok_or_else(|| not_found("Checklist item", item_id))?;
    let next = derive_from_checklist(&Lifecycle::from(&before), checklist, Utc::now());
    let summary = format!("{} removed a checklist item from \"{}\"", actor.name, before.title);
    Ok(Json(save_lifecycle(&state, &actor, &before, next, summary).await?))
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let (task, matter) = load_visible(&state, &actor, id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "delete_task"));
    }
    if !state.db.delete_task(id).await.map_err(db_error)? {
        return Err(not_found("Task", id));
    }
    Entry::new(
        actor.id,
        EntityType::Task,
        id,
        ActivityAction::Deleted,
        format!("{} deleted task \"{}\"", actor.name, task.title),
    )
    .changes(snapshot(&task, false))
    .notify(task.assignee_ids.iter().copied())
    .record(state.db.as_ref())
    .await;
    tracing::info!(task_id = %id, "task deleted");
    Ok(StatusCode::NO_CONTENT)
}
