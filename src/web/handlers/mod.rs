//! Route handlers, one module per resource, plus the error mapping and
//! scope checks they share.

pub mod auth;
pub mod case_files;
pub mod dashboard;
pub mod documents;
pub mod invoices;
pub mod matters;
pub mod notices;
pub mod notifications;
pub mod tasks;
pub mod users;

use axum::extract::Multipart;
use axum::http::StatusCode;
use bytes::Bytes;
use uuid::Uuid;

use crate::db::{Database, MatterRecord, Page, Role, UserRecord};
use crate::error::{DatabaseError, UploadError};
use crate::legal::access::{is_staff, visibility_for};
use crate::legal::audit::AuditKind;
use crate::web::server::AppState;

pub type ApiError = (StatusCode, String);
pub type ApiResult<T> = Result<T, ApiError>;

/// Map a storage error to an HTTP status. Constraint failures become 409;
/// anything unexpected is logged and hidden behind a generic 500.
pub(crate) fn db_error(err: DatabaseError) -> ApiError {
    match err {
        DatabaseError::Constraint(message) => {
            tracing::debug!("constraint violation: {}", message);
            (
                StatusCode::CONFLICT,
                "Conflicts with existing data".to_string(),
            )
        }
        DatabaseError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        other => {
            tracing::error!("database error: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal storage error".to_string(),
            )
        }
    }
}

/// Like `db_error`, with a caller-specific message for constraint failures.
pub(crate) fn db_conflict(message: &str) -> impl FnOnce(DatabaseError) -> ApiError + '_ {
    move |err| match err {
        DatabaseError::Constraint(detail) => {
            tracing::debug!("constraint violation: {}", detail);
            (StatusCode::CONFLICT, message.to_string())
        }
        other => db_error(other),
    }
}

pub(crate) fn upload_error(err: UploadError) -> ApiError {
    let status = match &err {
        UploadError::Empty => StatusCode::BAD_REQUEST,
        UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        UploadError::Io(message) => {
            tracing::error!("upload storage failed: {}", message);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store upload".to_string(),
            );
        }
    };
    (status, err.to_string())
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

pub(crate) fn not_found(entity: &str, id: Uuid) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{entity} '{id}' not found"))
}

/// A body field references a row that does not exist.
pub(crate) fn missing_reference(entity: &str, id: Uuid) -> ApiError {
    (StatusCode::BAD_REQUEST, format!("{entity} '{id}' not found"))
}

/// 403, recorded in the audit log.
pub(crate) fn deny(state: &AppState, user: &UserRecord, action: &str) -> ApiError {
    state.audit.record(
        AuditKind::PermissionDenied,
        serde_json::json!({
            "user_id": user.id,
            "role": user.role.as_str(),
            "action": action,
        }),
    );
    (
        StatusCode::FORBIDDEN,
        "You do not have permission to perform this action".to_string(),
    )
}

pub(crate) fn require_staff(state: &AppState, user: &UserRecord, action: &str) -> ApiResult<()> {
    if is_staff(user.role) {
        Ok(())
    } else {
        Err(deny(state, user, action))
    }
}

pub(crate) fn require_internal(
    state: &AppState,
    user: &UserRecord,
    action: &str,
) -> ApiResult<()> {
    if user.role == Role::Client {
        Err(deny(state, user, action))
    } else {
        Ok(())
    }
}

pub(crate) fn page_of(page: Option<i64>, limit: Option<i64>) -> Page {
    Page::new(page, limit)
}

/// Load a matter the caller may see. Out-of-scope matters are reported as
/// missing.
pub(crate) async fn visible_matter(
    db: &dyn Database,
    user: &UserRecord,
    id: Uuid,
) -> ApiResult<MatterRecord> {
    let matter = db
        .get_matter(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found("Matter", id))?;
    if !db
        .is_matter_visible(id, visibility_for(user))
        .await
        .map_err(db_error)?
    {
        return Err(not_found("Matter", id));
    }
    Ok(matter)
}

/// Matter referenced from a request body: missing or out of scope is a 400.
pub(crate) async fn referenced_matter(
    db: &dyn Database,
    user: &UserRecord,
    id: Uuid,
) -> ApiResult<MatterRecord> {
    visible_matter(db, user, id)
        .await
        .map_err(|_| missing_reference("Matter", id))
}

/// Staff, or an internal user listed on the matter.
pub(crate) fn works_on_matter(user: &UserRecord, matter: &MatterRecord) -> bool {
    is_staff(user.role) || (user.role == Role::Member && matter.member_ids.contains(&user.id))
}

/// Verify a case file exists and belongs to `matter_id`.
pub(crate) async fn check_case_file(
    db: &dyn Database,
    case_file_id: Uuid,
    matter_id: Uuid,
) -> ApiResult<()> {
    match db.get_case_file(case_file_id).await.map_err(db_error)? {
        Some(case_file) if case_file.matter_id == matter_id => Ok(()),
        Some(_) => Err(bad_request(format!(
            "Case file '{case_file_id}' belongs to a different matter"
        ))),
        None => Err(missing_reference("Case file", case_file_id)),
    }
}

/// Deduplicate and validate user ids that must refer to active internal users.
pub(crate) async fn internal_users(
    db: &dyn Database,
    ids: &[Uuid],
    field: &str,
) -> ApiResult<Vec<Uuid>> {
    let mut unique: Vec<Uuid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(*id);
        }
    }
    let users = db.get_users_by_ids(&unique).await.map_err(db_error)?;
    for id in &unique {
        match users.iter().find(|user| user.id == *id) {
            None => return Err(missing_reference("User", *id)),
            Some(user) if user.role == Role::Client => {
                return Err(bad_request(format!(
                    "'{field}' may only contain firm users; '{}' is a client",
                    user.name
                )));
            }
            Some(user) if !user.is_active => {
                return Err(bad_request(format!(
                    "'{field}' contains deactivated user '{}'",
                    user.name
                )));
            }
            Some(_) => {}
        }
    }
    Ok(unique)
}

/// A file part pulled out of a multipart body.
pub(crate) struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Text fields and the `file` part of a multipart body.
pub(crate) struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub file: Option<UploadedFile>,
}

impl MultipartForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) async fn read_multipart(mut multipart: Multipart) -> ApiResult<MultipartForm> {
    let mut form = MultipartForm {
        fields: Vec::new(),
        file: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(|e| (e.status(), e.body_text()))?;
            form.file = Some(UploadedFile {
                file_name,
                content_type,
                bytes,
            });
        } else {
            let value = field.text().await.map_err(|e| (e.status(), e.body_text()))?;
            form.fields.push((name, value));
        }
    }
    Ok(form)
}
