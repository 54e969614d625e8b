//! Document uploads, metadata and downloads.

use std::sync::Arc;

use axum::{
    Extension, Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::Response,
};
use uuid::Uuid;

use crate::db::{
    ActivityAction, CreateDocumentParams, DocumentFilter, DocumentRecord, EntityType,
    MatterRecord, Role, UpdateDocumentParams, UserRecord,
};
use crate::legal::access::visibility_for;
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::normalize::{empty_to_none, required_text};
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiResult, bad_request, check_case_file, db_error, deny, not_found, page_of, read_multipart,
    referenced_matter, upload_error, visible_matter, works_on_matter,
};
use crate::web::server::AppState;
use crate::web::types::{DocumentListQuery, PagedResponse, UpdateDocumentRequest};

/// Document plus its matter. Clients only reach documents shared with them.
async fn load_visible(
    state: &AppState,
    user: &UserRecord,
    id: Uuid,
) -> ApiResult<(DocumentRecord, MatterRecord)> {
    let document = state
        .db
        .get_document(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Document", id))?;
    if user.role == Role::Client && !document.client_visible {
        return Err(not_found("Document", id));
    }
    let matter = visible_matter(state.db.as_ref(), user, document.matter_id)
        .await
        .map_err(|_| not_found("Document", id))?;
    Ok((document, matter))
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "on" | "yes")
    )
}

fn parse_uuid(field: &str, raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| bad_request(format!("'{field}' must be a UUID")))
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<DocumentListQuery>,
) -> ApiResult<Json<PagedResponse<DocumentRecord>>> {
    let page = page_of(query.page, query.limit);
    let documents = state
        .db
        .list_documents(&DocumentFilter {
            visibility: visibility_for(&user),
            matter_id: query.matter_id,
            case_file_id: query.case_file_id,
            search: empty_to_none(query.search.as_deref()),
            page,
        })
        .await
        .map_err(db_error)?;
    Ok(Json(PagedResponse::new(documents, page)))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DocumentRecord>> {
    let (document, _) = load_visible(&state, &user, id).await?;
    Ok(Json(document))
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<DocumentRecord>)> {
    let form = read_multipart(multipart).await?;
    let matter_id = parse_uuid(
        "matter_id",
        form.field("matter_id")
            .ok_or_else(|| bad_request("'matter_id' is required"))?,
    )?;
    let matter = referenced_matter(state.db.as_ref(), &actor, matter_id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "upload_document"));
    }
    let case_file_id = match form.field("case_file_id").and_then(|v| empty_to_none(Some(v))) {
        Some(raw) => {
            let id = parse_uuid("case_file_id", &raw)?;
            check_case_file(state.db.as_ref(), id, matter.id).await?;
            Some(id)
        }
        None => None,
    };
    let file = form
        .file
        .as_ref()
        .ok_or_else(|| bad_request("'file' part is required"))?;

    let id = Uuid::new_v4();
    let stored = state
        .uploads
        .save_document(
            matter.id,
            id,
            &file.file_name,
            file.content_type.as_deref(),
            &file.bytes,
            state.upload_limits.max_document_bytes,
        )
        .await
        .map_err(upload_error)?;

    let title = match form.field("title").and_then(|v| empty_to_none(Some(v))) {
        Some(raw) => required_text("title", &raw).map_err(bad_request)?,
        None => stored.file_name.clone(),
    };
    let params = CreateDocumentParams {
        id,
        matter_id: matter.id,
        case_file_id,
        title,
        file_name: stored.file_name.clone(),
        stored_path: stored.stored_path.clone(),
        content_type: stored.content_type.clone(),
        size_bytes: stored.size_bytes,
        client_visible: parse_flag(form.field("client_visible")),
        uploaded_by: actor.id,
    };
    let created = match state.db.create_document(&params).await {
        Ok(document) => document,
        Err(e) => {
            state.uploads.remove(&stored.stored_path).await;
            return Err(db_error(e));
        }
    };

    let mut recipients = matter.member_ids.clone();
    if created.client_visible {
        recipients.extend(matter.client_id);
    }
    Entry::new(
        actor.id,
        EntityType::Document,
        created.id,
        ActivityAction::Uploaded,
        format!(
            "{} uploaded \"{}\" to {}",
            actor.name, created.title, matter.matter_number
        ),
    )
    .changes(snapshot(&created, true))
    .notify(recipients)
    .record(state.db.as_ref())
    .await;
    tracing::info!(
        document_id = %created.id,
        matter_id = %matter.id,
        bytes = created.size_bytes,
        "document uploaded"
    );

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let (document, _) = load_visible(&state, &user, id).await?;
    let bytes = state.uploads.read(&document.stored_path).await.map_err(|e| {
        tracing::warn!(document_id = %id, "stored document unreadable: {}", e);
        (StatusCode::NOT_FOUND, "Document file is missing".to_string())
    })?;

    Response::builder()
        .header(header::CONTENT_TYPE, document.content_type.as_str())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", document.file_name),
        )
        .header(header::CONTENT_LENGTH, bytes.len())
        .body(Body::from(bytes))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateDocumentRequest>,
) -> ApiResult<Json<DocumentRecord>> {
    let (before, matter) = load_visible(&state, &actor, id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "update_document"));
    }

    let mut params = UpdateDocumentParams::default();
    if let Some(title) = &req.title {
        params.title = Some(required_text("title", title).map_err(bad_request)?);
    }
    if let Some(case_file_id) = req.case_file_id {
        if let Some(case_file_id) = case_file_id {
            check_case_file(state.db.as_ref(), case_file_id, matter.id).await?;
        }
        params.case_file_id = Some(case_file_id);
    }
    params.client_visible = req.client_visible;

    let after = state
        .db
        .update_document(id, &params)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Document", id))?;

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        let newly_shared = !before.client_visible && after.client_visible;
        Entry::new(
            actor.id,
            EntityType::Document,
            after.id,
            ActivityAction::Updated,
            format!("{} updated document \"{}\"", actor.name, after.title),
        )
        .changes(changes)
        .notify(matter.client_id.filter(|_| newly_shared))
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
    let (document, matter) = load_visible(&state, &actor, id).await?;
    if !works_on_matter(&actor, &matter) {
        return Err(deny(&state, &actor, "delete_document"));
    }
    if !state.db.delete_document(id).await.map_err(db_error)? {
        return Err(not_found("Document", id));
    }
    state.uploads.remove(&document.stored_path).await;

    Entry::new(
        actor.id,
        EntityType::Document,
        id,
        ActivityAction::Deleted,
        format!("{} deleted document \"{}\"", actor.name, document.title),
    )
    .changes(snapshot(&document, false))
    .record(state.db.as_ref())
    .await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;
    use crate::testing::{Part, multipart, seed_matter, seed_user, test_state};

    #[test]
    fn flags_accept_common_truthy_values() {
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some(" ON ")));
        assert!(!parse_flag(Some("false")));
        assert!(!parse_flag(None));
    }

    #[tokio::test]
    async fn upload_download_and_delete_round_trip() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let matter_id = matter.id.to_string();

        let form = multipart(&[
            Part::text("matter_id", &matter_id),
            Part::file("Engagement Letter.pdf", None, b"%PDF-1.7 test"),
        ])
        .await;
        let (status, Json(doc)) = upload_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            form,
        )
        .await
        .expect("upload");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(doc.title, "Engagement_Letter.pdf");
        assert_eq!(doc.content_type, "application/pdf");
        assert_eq!(doc.size_bytes, 13);
        assert!(!doc.client_visible);

        let response = download_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(doc.id),
        )
        .await
        .expect("download");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/pdf"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"%PDF-1.7 test");

        delete_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Path(doc.id),
        )
        .await
        .expect("delete");
        assert!(state.uploads.read(&doc.stored_path).await.is_err());
    }

    #[tokio::test]
    async fn empty_files_are_rejected() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let matter_id = matter.id.to_string();

        let form = multipart(&[
            Part::text("matter_id", &matter_id),
            Part::file("empty.txt", Some("text/plain"), b""),
        ])
        .await;
        let err = upload_handler(State(state), Extension(CurrentUser(admin)), form)
            .await
            .expect_err("empty");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_files_are_rejected() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let matter_id = matter.id.to_string();
        let big = vec![b'x'; state.upload_limits.max_document_bytes + 1];

        let form = multipart(&[
            Part::text("matter_id", &matter_id),
            Part::file("big.bin", None, &big),
        ])
        .await;
        let err = upload_handler(State(state), Extension(CurrentUser(admin)), form)
            .await
            .expect_err("too large");
        assert_eq!(err.0, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn clients_only_see_shared_documents() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, Some(client.id), vec![]).await;
        let matter_id = matter.id.to_string();

        let mut ids = Vec::new();
        for (name, shared) in [("shared.pdf", "true"), ("internal.pdf", "false")] {
            let form = multipart(&[
                Part::text("matter_id", &matter_id),
                Part::text("client_visible", shared),
                Part::file(name, None, b"data"),
            ])
            .await;
            let (_, Json(doc)) = upload_handler(
                State(Arc::clone(&state)),
                Extension(CurrentUser(admin.clone())),
                form,
            )
            .await
            .expect("upload");
            ids.push(doc.id);
        }

        let Json(listed) = list_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(client.clone())),
            Query(DocumentListQuery::default()),
        )
        .await
        .expect("list");
        assert_eq!(listed.total, 1);
        assert_eq!(listed.items[0].id, ids[0]);

        let err = get_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(client.clone())),
            Path(ids[1]),
        )
        .await
        .expect_err("internal document");
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = delete_handler(State(state), Extension(CurrentUser(client)), Path(ids[0]))
            .await
            .expect_err("client delete");
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn case_file_must_belong_to_the_matter() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let other = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let foreign = state
            .db
            .create_case_file(&crate::db::CreateCaseFileParams {
                matter_id: other.id,
                title: "Elsewhere".into(),
                case_number: None,
                court: None,
                case_type: None,
                status: crate::db::CaseFileStatus::Active,
                filed_on: None,
                next_hearing_on: None,
                description: None,
                created_by: admin.id,
            })
            .await
            .unwrap();
        let matter_id = matter.id.to_string();
        let case_file_id = foreign.id.to_string();

        let form = multipart(&[
            Part::text("matter_id", &matter_id),
            Part::text("case_file_id", &case_file_id),
            Part::file("a.pdf", None, b"data"),
        ])
        .await;
        let err = upload_handler(State(state), Extension(CurrentUser(admin)), form)
            .await
            .expect_err("foreign case file");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
