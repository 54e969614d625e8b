//! Per-user notification inbox and the activity feed.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use uuid::Uuid;

use crate::db::{ActivityFilter, ActivityRecord, EntityType, NotificationRecord, UserRecord};
use crate::legal::access::is_staff;
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiResult, db_error, deny, not_found, page_of, require_internal, visible_matter,
};
use crate::web::server::AppState;
use crate::web::types::{
    ActivityQuery, NotificationListQuery, PagedResponse, ReadAllResponse, UnreadCountResponse,
};

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<NotificationListQuery>,
) -> ApiResult<Json<PagedResponse<NotificationRecord>>> {
    let page = page_of(query.page, query.limit);
    let notifications = state
        .db
        .list_notifications(user.id, query.unread.unwrap_or(false), page)
        .await
        .map_err(db_error)?;
    Ok(Json(PagedResponse::new(notifications, page)))
}

pub async fn unread_count_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<UnreadCountResponse>> {
    let count = state
        .db
        .count_unread_notifications(user.id)
        .await
        .map_err(db_error)?;
    Ok(Json(UnreadCountResponse { count }))
}

pub async fn read_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    // Another user's notification looks the same as a missing one.
    if state
        .db
        .mark_notification_read(user.id, id, Utc::now())
        .await
        .map_err(db_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Notification", id))
    }
}

pub async fn read_all_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<ReadAllResponse>> {
    let updated = state
        .db
        .mark_all_notifications_read(user.id, Utc::now())
        .await
        .map_err(db_error)?;
    tracing::debug!(user_id = %user.id, updated, "notifications marked read");
    Ok(Json(ReadAllResponse { updated }))
}

/// Whether a member may read the history of one entity. Entities hang off a
/// matter, so the matter's scope decides.
async fn member_can_follow(
    state: &AppState,
    user: &UserRecord,
    entity_type: EntityType,
    entity_id: Uuid,
) -> ApiResult<bool> {
    let db = state.db.as_ref();
    let matter_id = match entity_type {
        EntityType::User => return Ok(entity_id == user.id),
        EntityType::Invoice | EntityType::Notice => return Ok(false),
        EntityType::Matter => Some(entity_id),
        EntityType::CaseFile => db
            .get_case_file(entity_id)
            .await
            .map_err(db_error)?
            .map(|case_file| case_file.matter_id),
        EntityType::Document => db
            .get_document(entity_id)
            .await
            .map_err(db_error)?
            .map(|document| document.matter_id),
        EntityType::Task => db
            .get_task(entity_id)
            .await
            .map_err(db_error)?
            .map(|task| task.matter_id),
    };
    match matter_id {
        Some(matter_id) => Ok(visible_matter(db, user, matter_id).await.is_ok()),
        None => Ok(false),
    }
}

/// Staff read the whole log. Members read either one entity they can see or,
/// with no entity filter, their own actions.
pub async fn activity_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<PagedResponse<ActivityRecord>>> {
    require_internal(&state, &user, "read_activity")?;
    let page = page_of(query.page, query.limit);
    let mut filter = ActivityFilter {
        entity_type: query.entity_type,
        entity_id: query.entity_id,
        actor_id: None,
        page,
    };

    if !is_staff(user.role) {
        match (query.entity_type, query.entity_id) {
            (Some(entity_type), Some(entity_id)) => {
                if !member_can_follow(&state, &user, entity_type, entity_id).await? {
                    return Err(deny(&state, &user, "read_activity"));
                }
            }
            (None, None) => filter.actor_id = Some(user.id),
            _ => return Err(deny(&state, &user, "read_activity")),
        }
    }

    let activity = state.db.list_activity(&filter).await.map_err(db_error)?;
    Ok(Json(PagedResponse::new(activity, page)))
}
