//! Firm notice board.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{
    ActivityAction, CreateNoticeParams, EntityType, NoticeAudience, NoticeFilter, NoticeRecord,
    UpdateNoticeParams, UserRecord,
};
use crate::legal::access::{audience_roles, is_staff, notice_audiences_for};
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::normalize::required_text;
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiResult, bad_request, db_error, not_found, page_of, require_staff,
};
use crate::web::server::AppState;
use crate::web::types::{
    CreateNoticeRequest, NoticeListQuery, PagedResponse, UpdateNoticeRequest,
};

const MAX_BODY_CHARS: usize = 20_000;

/// Bodies keep their line breaks; only the ends are trimmed.
fn notice_body(raw: &str) -> ApiResult<String> {
    let body = raw.trim();
    if body.is_empty() {
        return Err(bad_request("body must not be empty"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(bad_request(format!(
            "body must be at most {MAX_BODY_CHARS} characters"
        )));
    }
    Ok(body.to_string())
}

fn check_expiry(
    published_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
) -> ApiResult<()> {
    match expires_at {
        Some(expires) if expires <= published_at => Err(bad_request(
            "expires_at must be after published_at",
        )),
        _ => Ok(()),
    }
}

fn is_live(notice: &NoticeRecord, now: DateTime<Utc>) -> bool {
    notice.expires_at.is_none_or(|expires| expires > now)
}

async fn load_visible(state: &AppState, user: &UserRecord, id: Uuid) -> ApiResult<NoticeRecord> {
    let notice = state
        .db
        .get_notice(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Notice", id))?;
    let readable = notice_audiences_for(user.role).contains(&notice.audience)
        && (is_staff(user.role) || is_live(&notice, Utc::now()));
    if readable {
        Ok(notice)
    } else {
        Err(not_found("Notice", id))
    }
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<NoticeListQuery>,
) -> ApiResult<Json<PagedResponse<NoticeRecord>>> {
    let page = page_of(query.page, query.limit);
    let include_expired = is_staff(user.role) && query.include_expired.unwrap_or(false);
    let notices = state
        .db
        .list_notices(&NoticeFilter {
            audiences: notice_audiences_for(user.role),
            active_at: (!include_expired).then(Utc::now),
            page,
        })
        .await
        .map_err(db_error)?;
    Ok(Json(PagedResponse::new(notices, page)))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<NoticeRecord>> {
    Ok(Json(load_visible(&state, &user, id).await?))
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Json(req): Json<CreateNoticeRequest>,
) -> ApiResult<(StatusCode, Json<NoticeRecord>)> {
    require_staff(&state, &actor, "create_notice")?;
    let published_at = req.published_at.unwrap_or_else(Utc::now);
    check_expiry(published_at, req.expires_at)?;
    let audience = req.audience.unwrap_or(NoticeAudience::Everyone);

    let created = state
        .db
        .create_notice(&CreateNoticeParams {
            title: required_text("title", &req.title).map_err(bad_request)?,
            body: notice_body(&req.body)?,
            audience,
            pinned: req.pinned,
            published_at,
            expires_at: req.expires_at,
            created_by: actor.id,
        })
        .await
        .map_err(db_error)?;

    let recipients = state
        .db
        .audience_user_ids(&audience_roles(audience))
        .await
        .map_err(db_error)?;
    tracing::info!(
        notice_id = %created.id,
        audience = audience.as_str(),
        recipients = recipients.len(),
        "notice published"
    );
    Entry::new(
        actor.id,
        EntityType::Notice,
        created.id,
        ActivityAction::Created,
        format!("{} posted notice \"{}\"", actor.name, created.title),
    )
    .changes(snapshot(&created, true))
    .notify(recipients)
    .record(state.db.as_ref())
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateNoticeRequest>,
) -> ApiResult<Json<NoticeRecord>> {
    require_staff(&state, &actor, "update_notice")?;
    let before = load_visible(&state, &actor, id).await?;

    let mut params = UpdateNoticeParams {
        audience: req.audience,
        pinned: req.pinned,
        expires_at: req.expires_at,
        ..UpdateNoticeParams::default()
    };
    if let Some(title) = &req.title {
        params.title = Some(required_text("title", title).map_err(bad_request)?);
    }
    if let Some(body) = &req.body {
        params.body = Some(notice_body(body)?);
    }
    if let Some(expires_at) = req.expires_at {
        check_expiry(before.published_at, expires_at)?;
    }

    let after = state
        .db
        .update_notice(id, &params)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Notice", id))?;

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        Entry::new(
            actor.id,
            EntityType::Notice,
            after.id,
            ActivityAction::Updated,
            format!("{} edited notice \"{}\"", actor.name, after.title),
        )
        .changes(changes)
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
    require_staff(&state, &actor, "delete_notice")?;
    let notice = load_visible(&state, &actor, id).await?;
    if !state.db.delete_notice(id).await.map_err(db_error)? {
        return Err(not_found("Notice", id));
    }
    Entry::new(
        actor.id,
        EntityType::Notice,
        id,
        ActivityAction::Deleted,
        format!("{} removed notice \"{}\"", actor.name, notice.title),
    )
    .changes(snapshot(&notice, false))
    .record(state.db.as_ref())
    .await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::Role;
    use crate::testing::{seed_user, test_state};

    fn notice(audience: NoticeAudience, expires_at: Option<DateTime<Utc>>) -> CreateNoticeRequest {
        CreateNoticeRequest {
            title: format!("  Office   closure {} ", audience.as_str()),
            body: "The office is closed on Friday.\n\nRemote work applies.".into(),
            audience: Some(audience),
            pinned: false,
            published_at: None,
            expires_at,
        }
    }

    async fn post(
        state: &Arc<AppState>,
        actor: &UserRecord,
        req: CreateNoticeRequest,
    ) -> NoticeRecord {
        let (_, Json(created)) = create_handler(
            State(Arc::clone(state)),
            Extension(CurrentUser(actor.clone())),
            Json(req),
        )
        .await
        .expect("create notice");
        created
    }

    #[tokio::test]
    async fn audiences_decide_who_reads_and_who_is_notified() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;

        let for_clients = post(&state, &admin, notice(NoticeAudience::Clients, None)).await;
        assert_eq!(for_clients.title, "Office closure clients");
        assert!(for_clients.body.contains("\n\n"));
        post(&state, &admin, notice(NoticeAudience::Members, None)).await;
        post(&state, &admin, notice(NoticeAudience::Everyone, None)).await;

        let Json(seen) = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(client.clone())),
            Query(NoticeListQuery::default()),
        )
        .await
        .expect("list");
        assert_eq!(seen.total, 2);

        assert_eq!(state.db.count_unread_notifications(client.id).await.unwrap(), 2);
        assert_eq!(state.db.count_unread_notifications(member.id).await.unwrap(), 2);

        let err = get_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member.clone())),
            Path(for_clients.id),
        )
        .await
        .expect_err("members cannot read client notices");
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = create_handler(
            State(state),
            Extension(CurrentUser(member)),
            Json(notice(NoticeAudience::Everyone, None)),
        )
        .await
        .expect_err("members cannot post");
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn expired_notices_are_hidden_except_on_request_by_staff() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let mut stale = notice(NoticeAudience::Everyone, Some(Utc::now() - Duration::hours(1)));
        stale.published_at = Some(Utc::now() - Duration::days(2));
        let stale = post(&state, &admin, stale).await;

        let Json(for_member) = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member.clone())),
            Query(NoticeListQuery {
                include_expired: Some(true),
                ..Default::default()
            }),
        )
        .await
        .expect("list");
        assert_eq!(for_member.total, 0);

        let Json(for_admin) = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Query(NoticeListQuery {
                include_expired: Some(true),
                ..Default::default()
            }),
        )
        .await
        .expect("list");
        assert_eq!(for_admin.total, 1);

        let err = get_handler(State(state), Extension(CurrentUser(member)), Path(stale.id))
            .await
            .expect_err("expired");
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expiry_must_follow_publication() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let mut req = notice(NoticeAudience::Staff, None);
        req.published_at = Some(Utc::now());
        req.expires_at = Some(Utc::now() - Duration::minutes(5));
        let err = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Json(req),
        )
        .await
        .expect_err("expires before publication");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let created = post(&state, &admin, notice(NoticeAudience::Staff, None)).await;
        let Json(pinned) = update_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(created.id),
            Json(UpdateNoticeRequest {
                pinned: Some(true),
                body: Some("  Updated hours.  ".into()),
                ..Default::default()
            }),
        )
        .await
        .expect("update");
        assert!(pinned.pinned);
        assert_eq!(pinned.body, "Updated hours.");

        let status = delete_handler(State(state), Extension(CurrentUser(admin)), Path(created.id))
            .await
            .expect("delete");
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
