//! Court case files attached to matters.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::db::{
    ActivityAction, CaseFileFilter, CaseFileRecord, CaseFileStatus, CreateCaseFileParams,
    EntityType, MatterRecord, UpdateCaseFileParams, UserRecord,
};
use crate::legal::access::visibility_for;
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::normalize::{empty_to_none, normalize_reference, required_text};
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiResult, bad_request, db_conflict, db_error, deny, not_found, page_of, referenced_matter,
    require_staff, visible_matter, works_on_matter,
};
use crate::web::server::AppState;
use crate::web::types::{
    CaseFileListQuery, CreateCaseFileRequest, PagedResponse, UpdateCaseFileRequest,
};

const CASE_NUMBER_TAKEN: &str = "This matter already has a case file with that case number";

/// Case file plus its matter, if the caller can see the matter.
async fn load_visible(
    state: &AppState,
    user: &UserRecord,
    id: Uuid,
) -> ApiResult<(CaseFileRecord, MatterRecord)> {
    let case_file = state
        .db
        .get_case_file(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Case file", id))?;
    let matter = visible_matter(state.db.as_ref(), user, case_file.matter_id)
        .await
        .map_err(|_| not_found("Case file", id))?;
    Ok((case_file, matter))
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<CaseFileListQuery>,
) -> ApiResult<Json<PagedResponse<CaseFileRecord>>> {
    let page = page_of(query.page, query.limit);
    let case_files = state
        .db
        .list_case_files(&CaseFileFilter {
            visibility: visibility_for(&user),
            matter_id: query.matter_id,
            status: query.status,
            search: empty_to_none(query.search.as_deref()),
            page,
        })
        .await
        .map_err(db_error)?;
    Ok(Json(PagedResponse::new(case_files, page)))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CaseFileRecord>> {
    let (case_file, _) = load_visible(&state, &user, id).await?;
    Ok(Json(case_file))
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Json(req): Json<CreateCaseFileRequest>,
) -> ApiResult<(StatusCode, Json<CaseFileRecord>)> {
    let matter = referenced_matter(state.db.as_ref(), &actor, req.matter_id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "create_case_file"));
    }

    let created = state
        .db
        .create_case_file(&CreateCaseFileParams {
            matter_id: matter.id,
            title: required_text("title", &req.title).map_err(bad_request)?,
            case_number: normalize_reference(req.case_number.as_deref()),
            court: empty_to_none(req.court.as_deref()),
            case_type: empty_to_none(req.case_type.as_deref()),
            status: req.status.unwrap_or(CaseFileStatus::Active),
            filed_on: req.filed_on,
            next_hearing_on: req.next_hearing_on,
            description: empty_to_none(req.description.as_deref()),
            created_by: actor.id,
        })
        .await
        .map_err(db_conflict(CASE_NUMBER_TAKEN))?;

    Entry::new(
        actor.id,
        EntityType::CaseFile,
        created.id,
        ActivityAction::Created,
        format!(
            "{} added case file \"{}\" to {}",
            actor.name, created.title, matter.matter_number
        ),
    )
    .changes(snapshot(&created, true))
    .notify(matter.member_ids.iter().copied())
    .record(state.db.as_ref())
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCaseFileRequest>,
) -> ApiResult<Json<CaseFileRecord>> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "update_case_file"));
    }

    let mut params = UpdateCaseFileParams::default();
    if let Some(title) = &req.title {
        params.title = Some(required_text("title", title).map_err(bad_request)?);
    }
    if let Some(number) = &req.case_number {
        params.case_number = Some(normalize_reference(number.as_deref()));
    }
    if let Some(court) = &req.court {
        params.court = Some(empty_to_none(court.as_deref()));
    }
    if let Some(case_type) = &req.case_type {
        params.case_type = Some(empty_to_none(case_type.as_deref()));
    }
    if let Some(description) = &req.description {
        params.description = Some(empty_to_none(description.as_deref()));
    }
    params.status = req.status;
    params.filed_on = req.filed_on;
    params.next_hearing_on = req.next_hearing_on;

    let after = state
        .db
        .update_case_file(id, &params)
        .await
        .map_err(db_conflict(CASE_NUMBER_TAKEN))?
        .ok_or_else(|| not_found("Case file", id))?;

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        let action = if before.status != after.status {
            ActivityAction::StatusChanged
        } else {
            ActivityAction::Updated
        };
        Entry::new(
            actor.id,
            EntityType::CaseFile,
            after.id,
            action,
            format!("{} updated case file \"{}\"", actor.name, after.title),
        )
        .changes(changes)
        .notify(matter.member_ids.iter().copied())
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
    let (case_file, _) = load_visible(&state, &actor, id).await?;
    require_staff(&state, &actor, "delete_case_file")?;

    if !state.db.delete_case_file(id).await.map_err(db_error)? {
        return Err(not_found("Case file", id));
    }
    Entry::new(
        actor.id,
        EntityType::CaseFile,
        id,
        ActivityAction::Deleted,
        format!("{} deleted case file \"{}\"", actor.name, case_file.title),
    )
    .changes(snapshot(&case_file, false))
    .record(state.db.as_ref())
    .await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateDocumentParams, Role};
    use crate::testing::{seed_matter, seed_user, test_state};

    fn create_req(matter_id: Uuid, number: Option<&str>) -> Json<CreateCaseFileRequest> {
        Json(CreateCaseFileRequest {
            matter_id,
            title: "Appeal".into(),
            case_number: number.map(str::to_string),
            court: Some(" Court of Appeal ".into()),
            case_type: None,
            status: None,
            filed_on: None,
            next_hearing_on: None,
            description: None,
        })
    }

    #[tokio::test]
    async fn members_of_the_matter_may_add_case_files() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![member.id]).await;

        let (status, Json(created)) = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member.clone())),
            create_req(matter.id, Some(" cv-2025 001 ")),
        )
        .await
        .expect("create");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.case_number.as_deref(), Some("CV-2025 001"));
        assert_eq!(created.court.as_deref(), Some("Court of Appeal"));
        assert_eq!(created.status, CaseFileStatus::Active);

        let err = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member.clone())),
            create_req(matter.id, Some("CV-2025 001")),
        )
        .await
        .expect_err("duplicate case number");
        assert_eq!(err.0, StatusCode::CONFLICT);

        let err = delete_handler(
            State(state),
            Extension(CurrentUser(member)),
            Path(created.id),
        )
        .await
        .expect_err("members cannot delete");
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_or_hidden_matter_is_a_bad_request() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let hidden = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;

        let err = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member)),
            create_req(hidden.id, None),
        )
        .await
        .expect_err("hidden matter");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = create_handler(
            State(state),
            Extension(CurrentUser(admin)),
            create_req(Uuid::new_v4(), None),
        )
        .await
        .expect_err("missing matter");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deleting_detaches_documents() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let (_, Json(case_file)) = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            create_req(matter.id, None),
        )
        .await
        .expect("create");

        let document = state
            .db
            .create_document(&CreateDocumentParams {
                id: Uuid::new_v4(),
                matter_id: matter.id,
                case_file_id: Some(case_file.id),
                title: "Notice of appeal".into(),
                file_name: "notice.pdf".into(),
                stored_path: "documents/x/notice.pdf".into(),
                content_type: "application/pdf".into(),
                size_bytes: 4,
                client_visible: false,
                uploaded_by: admin.id,
            })
            .await
            .unwrap();

        delete_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Path(case_file.id),
        )
        .await
        .expect("delete");

        let kept = state.db.get_document(document.id).await.unwrap().expect("kept");
        assert_eq!(kept.case_file_id, None);
    }
}
