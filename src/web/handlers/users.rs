//! User accounts and profile photos.

use std::sync::Arc;

use axum::{
    Extension, Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::Response,
};
use serde_json::json;
use uuid::Uuid;

use crate::db::{
    ActivityAction, CreateUserParams, EntityType, MatterFilter, Page, Role, UpdateUserParams,
    UserFilter, UserRecord, Visibility,
};
use crate::legal::access::{can_manage_role, is_internal, is_staff};
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::audit::AuditKind;
use crate::legal::normalize::{empty_to_none, normalize_email, normalize_phone, required_text};
use crate::legal::uploads::content_type_for;
use crate::web::auth::{CurrentUser, check_password_strength, hash_password};
use crate::web::handlers::{
    ApiResult, bad_request, db_conflict, db_error, deny, not_found, page_of, read_multipart,
    require_staff, upload_error,
};
use crate::web::server::AppState;
use crate::web::types::{CreateUserRequest, PagedResponse, UpdateUserRequest, UserListQuery};

const EMAIL_TAKEN: &str = "A user with this email already exists";

/// Whether `viewer` may see `target`'s profile.
async fn can_view(state: &AppState, viewer: &UserRecord, target: &UserRecord) -> ApiResult<bool> {
    if viewer.id == target.id || is_staff(viewer.role) {
        return Ok(true);
    }
    match viewer.role {
        Role::Client => Ok(false),
        _ if is_internal(target.role) => Ok(true),
        _ => {
            // Members see clients of matters they work on.
            let shared = state
                .db
                .list_matters(&MatterFilter {
                    visibility: Visibility::Member(viewer.id),
                    status: None,
                    client_id: Some(target.id),
                    search: None,
                    page: Page::new(Some(1), Some(1)),
                })
                .await
                .map_err(db_error)?;
            Ok(shared.total > 0)
        }
    }
}

async fn load_visible(state: &AppState, viewer: &UserRecord, id: Uuid) -> ApiResult<UserRecord> {
    let target = state
        .db
        .get_user(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("User", id))?;
    if !can_view(state, viewer, &target).await? {
        return Err(not_found("User", id));
    }
    Ok(target)
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<UserListQuery>,
) -> ApiResult<Json<PagedResponse<UserRecord>>> {
    if user.role == Role::Client {
        return Err(deny(&state, &user, "list_users"));
    }
    let page = page_of(query.page, query.limit);
    let filter = UserFilter {
        role: query.role,
        search: empty_to_none(query.search.as_deref()),
        visible_to_member: (!is_staff(user.role)).then_some(user.id),
        page,
    };
    let users = state.db.list_users(&filter).await.map_err(db_error)?;
    Ok(Json(PagedResponse::new(users, page)))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<UserRecord>> {
    Ok(Json(load_visible(&state, &user, id).await?))
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<UserRecord>)> {
    require_staff(&state, &actor, "create_user")?;
    let role = req.role.unwrap_or(Role::Member);
    if !can_manage_role(actor.role, role) {
        return Err(deny(&state, &actor, "create_user"));
    }

    let name = required_text("name", &req.name).map_err(bad_request)?;
    let email = normalize_email(&req.email).map_err(bad_request)?;
    let phone = normalize_phone(req.phone.as_deref()).map_err(bad_request)?;
    check_password_strength(&req.password).map_err(|e| bad_request(e.to_string()))?;
    let password_hash = hash_password(req.password).await.map_err(|e| {
        tracing::error!("password hashing failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create user".to_string(),
        )
    })?;

    let created = state
        .db
        .create_user(&CreateUserParams {
            name,
            email,
            password_hash,
            role,
            phone,
            title: empty_to_none(req.title.as_deref()),
            is_active: req.is_active.unwrap_or(true),
        })
        .await
        .map_err(db_conflict(EMAIL_TAKEN))?;

    Entry::new(
        actor.id,
        EntityType::User,
        created.id,
        ActivityAction::Created,
        format!("{} added user {}", actor.name, created.name),
    )
    .changes(snapshot(&created, true))
    .record(state.db.as_ref())
    .await;
    tracing::info!(user_id = %created.id, role = created.role.as_str(), "user created");

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserRecord>> {
    let before = load_visible(&state, &actor, id).await?;
    let is_self = actor.id == before.id;
    let staff = is_staff(actor.role);

    if !is_self && !staff {
        return Err(deny(&state, &actor, "update_user"));
    }
    let touches_account = req.email.is_some() || req.role.is_some() || req.is_active.is_some();
    if touches_account && !staff {
        return Err(deny(&state, &actor, "update_user_account"));
    }
    if !is_self && !can_manage_role(actor.role, before.role) {
        return Err(deny(&state, &actor, "update_user"));
    }
    if let Some(role) = req.role {
        if is_self && role != before.role {
            return Err(bad_request("You cannot change your own role"));
        }
        if !is_self && !can_manage_role(actor.role, role) {
            return Err(deny(&state, &actor, "assign_role"));
        }
    }
    if is_self && req.is_active == Some(false) {
        return Err(bad_request("You cannot deactivate your own account"));
    }

    let mut params = UpdateUserParams::default();
    if let Some(name) = &req.name {
        params.name = Some(required_text("name", name).map_err(bad_request)?);
    }
    if let Some(email) = &req.email {
        params.email = Some(normalize_email(email).map_err(bad_request)?);
    }
    if let Some(phone) = &req.phone {
        params.phone = Some(normalize_phone(phone.as_deref()).map_err(bad_request)?);
    }
    if let Some(title) = &req.title {
        params.title = Some(empty_to_none(title.as_deref()));
    }
    params.role = req.role;
    params.is_active = req.is_active;

    let after = state
        .db
        .update_user(id, &params)
        .await
        .map_err(db_conflict(EMAIL_TAKEN))?
        .ok_or_else(|| not_found("User", id))?;

    if after.role != before.role {
        state.audit.record(
            AuditKind::RoleChanged,
            json!({
                "actor_id": actor.id,
                "user_id": after.id,
                "from": before.role.as_str(),
                "to": after.role.as_str(),
            }),
        );
    }
    if before.is_active && !after.is_active {
        state.audit.record(
            AuditKind::UserDeactivated,
            json!({ "actor_id": actor.id, "user_id": after.id }),
        );
    }

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        Entry::new(
            actor.id,
            EntityType::User,
            after.id,
            ActivityAction::Updated,
            format!("{} updated user {}", actor.name, after.name),
        )
        .changes(changes)
        .notify([after.id])
        .record(state.db.as_ref())
        .await;
    }
    Ok(Json(after))
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_staff(&state, &actor, "delete_user")?;
    if actor.id == id {
        return Err(bad_request("You cannot delete your own account"));
    }
    let target = state
        .db
        .get_user(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("User", id))?;
    if !can_manage_role(actor.role, target.role) {
        return Err(deny(&state, &actor, "delete_user"));
    }
    if state
        .db
        .count_client_matters(id)
        .await
        .map_err(db_error)?
        > 0
    {
        return Err((
            StatusCode::CONFLICT,
            format!(
                "{} is the client of existing matters; reassign or delete them first",
                target.name
            ),
        ));
    }

    if !state
        .db
        .delete_user(id)
        .await
        .map_err(db_conflict("User is still referenced by other records"))?
    {
        return Err(not_found("User", id));
    }
    if let Some(path) = &target.photo_path {
        state.uploads.remove(path).await;
    }

    Entry::new(
        actor.id,
        EntityType::User,
        id,
        ActivityAction::Deleted,
        format!("{} removed user {}", actor.name, target.name),
    )
    .changes(snapshot(&target, false))
    .record(state.db.as_ref())
    .await;
    tracing::info!(user_id = %id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn photo_upload_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> ApiResult<Json<UserRecord>> {
    let target = load_visible(&state, &actor, id).await?;
    let allowed = actor.id == target.id
        || (is_staff(actor.role) && can_manage_role(actor.role, target.role));
    if !allowed {
        return Err(deny(&state, &actor, "upload_photo"));
    }

    let form = read_multipart(multipart).await?;
    let file = form.file.ok_or_else(|| bad_request("'file' part is required"))?;
    let stored = state
        .uploads
        .save_photo(
            target.id,
            &file.file_name,
            file.content_type.as_deref(),
            &file.bytes,
            state.upload_limits.max_photo_bytes,
        )
        .await
        .map_err(upload_error)?;

    let updated = match state
        .db
        .set_photo_path(target.id, Some(&stored.stored_path))
        .await
    {
        Ok(Some(user)) => user,
        Ok(None) => {
            state.uploads.remove(&stored.stored_path).await;
            return Err(not_found("User", id));
        }
        Err(e) => {
            state.uploads.remove(&stored.stored_path).await;
            return Err(db_error(e));
        }
    };
    if let Some(previous) = &target.photo_path {
        state.uploads.remove(previous).await;
    }

    Entry::new(
        actor.id,
        EntityType::User,
        updated.id,
        ActivityAction::Uploaded,
        format!("{} updated the profile photo of {}", actor.name, updated.name),
    )
    .changes(diff_fields(&target, &updated))
    .record(state.db.as_ref())
    .await;
    Ok(Json(updated))
}

pub async fn photo_get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(viewer)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let target = load_visible(&state, &viewer, id).await?;
    let path = target
        .photo_path
        .ok_or_else(|| (StatusCode::NOT_FOUND, "User has no photo".to_string()))?;
    let bytes = state.uploads.read(&path).await.map_err(|e| {
        tracing::warn!("stored photo for {} unreadable: {}", id, e);
        (StatusCode::NOT_FOUND, "Photo file is missing".to_string())
    })?;
    let content_type = content_type_for(&path, None);

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "private, max-age=300")
        .body(Body::from(bytes))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
