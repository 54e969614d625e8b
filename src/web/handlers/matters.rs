//! Matters: the client engagements everything else hangs off.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{Datelike, NaiveDate, Utc};
use uuid::Uuid;

use crate::db::{
    ActivityAction, CreateMatterParams, Database, EntityType, InvoiceFilter, MatterFilter,
    MatterRecord, MatterStatus, Role, UpdateMatterParams, UserRecord, Visibility,
};
use crate::error::DatabaseError;
use crate::legal::access::{is_staff, visibility_for};
use crate::legal::activity::{Entry, diff_fields, snapshot};
use crate::legal::billing::summarize;
use crate::legal::normalize::{empty_to_none, normalize_reference, required_text};
use crate::legal::numbering::{MATTER_PREFIX, next_number, year_prefix};
use crate::web::auth::CurrentUser;
use crate::web::handlers::{
    ApiResult, bad_request, db_conflict, db_error, internal_users, missing_reference, not_found,
    page_of, require_staff, visible_matter,
};
use crate::web::server::AppState;
use crate::web::types::{
    CreateMatterRequest, MatterDetail, MatterListQuery, MatterStats, PagedResponse,
    UpdateMatterRequest,
};

const NUMBER_TAKEN: &str = "A matter with this number already exists";
const NUMBERING_ATTEMPTS: usize = 3;

/// `client_id` must point at a user holding the client role.
async fn check_client(db: &dyn Database, id: Uuid) -> ApiResult<()> {
    match db.get_user(id).await.map_err(db_error)? {
        None => Err(missing_reference("User", id)),
        Some(user) if user.role != Role::Client => Err(bad_request(format!(
            "'client_id' must reference a client; '{}' is not one",
            user.name
        ))),
        Some(_) => Ok(()),
    }
}

/// Task, file and money roll-up for one matter. Invoice totals are only
/// included for staff and the matter's own client.
pub(crate) async fn matter_stats(
    state: &AppState,
    user: &UserRecord,
    matter: &MatterRecord,
    today: NaiveDate,
) -> ApiResult<MatterStats> {
    let aggregates = state
        .db
        .matter_aggregates(matter.id, today)
        .await
        .map_err(db_error)?;

    let sees_money = is_staff(user.role) || matter.client_id == Some(user.id);
    let invoices = if sees_money {
        let rows = state
            .db
            .list_invoices(&InvoiceFilter {
                visibility: Visibility::All,
                matter_id: Some(matter.id),
                client_id: None,
            })
            .await
            .map_err(db_error)?;
        Some(summarize(&rows, today, state.billing.due_soon_days))
    } else {
        None
    };

    Ok(MatterStats {
        tasks: aggregates.tasks,
        overdue_tasks: aggregates.overdue_tasks,
        average_progress: aggregates.average_progress,
        case_files: aggregates.case_file_count,
        documents: aggregates.document_count,
        invoices,
    })
}

/// `closed_on` follows the status unless the caller set it explicitly.
fn closing_date(
    status: MatterStatus,
    requested: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<NaiveDate> {
    match status {
        MatterStatus::Closed => requested.or(Some(today)),
        MatterStatus::Open | MatterStatus::OnHold => None,
    }
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<MatterListQuery>,
) -> ApiResult<Json<PagedResponse<MatterRecord>>> {
    let page = page_of(query.page, query.limit);
    let matters = state
        .db
        .list_matters(&MatterFilter {
            visibility: visibility_for(&user),
            status: query.status,
            client_id: query.client_id,
            search: empty_to_none(query.search.as_deref()),
            page,
        })
        .await
        .map_err(db_error)?;
    Ok(Json(PagedResponse::new(matters, page)))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MatterDetail>> {
    let matter = visible_matter(state.db.as_ref(), &user, id).await?;
    let stats = matter_stats(&state, &user, &matter, Utc::now().date_naive()).await?;
    Ok(Json(MatterDetail { matter, stats }))
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MatterStats>> {
    let matter = visible_matter(state.db.as_ref(), &user, id).await?;
    let stats = matter_stats(&state, &user, &matter, Utc::now().date_naive()).await?;
    Ok(Json(stats))
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Json(req): Json<CreateMatterRequest>,
) -> ApiResult<(StatusCode, Json<MatterRecord>)> {
    require_staff(&state, &actor, "create_matter")?;
    let today = Utc::now().date_naive();

    let title = required_text("title", &req.title).map_err(bad_request)?;
    if let Some(client_id) = req.client_id {
        check_client(state.db.as_ref(), client_id).await?;
    }
    let member_ids = internal_users(state.db.as_ref(), &req.member_ids, "member_ids").await?;
    let status = req.status.unwrap_or(MatterStatus::Open);

    let mut params = CreateMatterParams {
        matter_number: String::new(),
        title,
        description: empty_to_none(req.description.as_deref()),
        practice_area: empty_to_none(req.practice_area.as_deref()),
        status,
        client_id: req.client_id,
        member_ids,
        opened_on: req.opened_on.or(Some(today)),
        closed_on: closing_date(status, req.closed_on, today),
        created_by: actor.id,
    };

    let explicit = normalize_reference(req.matter_number.as_deref());
    let created = match explicit {
        Some(number) => {
            params.matter_number = number;
            state
                .db
                .create_matter(&params)
                .await
                .map_err(db_conflict(NUMBER_TAKEN))?
        }
        None => create_numbered(state.db.as_ref(), &mut params, today.year()).await?,
    };

    Entry::new(
        actor.id,
        EntityType::Matter,
        created.id,
        ActivityAction::Created,
        format!("{} opened matter {}", actor.name, created.matter_number),
    )
    .changes(snapshot(&created, true))
    .notify(created.member_ids.iter().copied())
    .record(state.db.as_ref())
    .await;
    tracing::info!(matter_id = %created.id, number = %created.matter_number, "matter created");

    Ok((StatusCode::CREATED, Json(created)))
}

/// Allocate the next `MAT-YYYY-NNNN`, retrying when a concurrent insert
/// took the same number.
async fn create_numbered(
    db: &dyn Database,
    params: &mut CreateMatterParams,
    year: i32,
) -> ApiResult<MatterRecord> {
    let prefix = year_prefix(MATTER_PREFIX, year);
    for attempt in 1..=NUMBERING_ATTEMPTS {
        let existing = db
            .matter_numbers_with_prefix(&prefix)
            .await
            .map_err(db_error)?;
        params.matter_number = next_number(MATTER_PREFIX, year, &existing);
        match db.create_matter(params).await {
            Ok(matter) => return Ok(matter),
            Err(DatabaseError::Constraint(detail)) if attempt < NUMBERING_ATTEMPTS => {
                tracing::debug!(attempt, "matter number collision, retrying: {}", detail);
            }
            Err(e) => return Err(db_conflict(NUMBER_TAKEN)(e)),
        }
    }
    Err((
        StatusCode::CONFLICT,
        "Could not allocate a matter number".to_string(),
    ))
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(actor)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateMatterRequest>,
) -> ApiResult<Json<MatterRecord>> {
    let before = visible_matter(state.db.as_ref(), &actor, id).await?;
    require_staff(&state, &actor, "update_matter")?;
    let today = Utc::now().date_naive();

    let mut params = UpdateMatterParams::default();
    if let Some(raw) = &req.matter_number {
        let number = normalize_reference(Some(raw))
            .ok_or_else(|| bad_request("matter_number must not be blank"))?;
        params.matter_number = Some(number);
    }
    if let Some(title) = &req.title {
        params.title = Some(required_text("title", title).map_err(bad_request)?);
    }
    if let Some(description) = &req.description {
        params.description = Some(empty_to_none(description.as_deref()));
    }
    if let Some(area) = &req.practice_area {
        params.practice_area = Some(empty_to_none(area.as_deref()));
    }
    if let Some(client_id) = req.client_id {
        if let Some(client_id) = client_id {
            check_client(state.db.as_ref(), client_id).await?;
        }
        params.client_id = Some(client_id);
    }
    if let Some(ids) = &req.member_ids {
        params.member_ids = Some(internal_users(state.db.as_ref(), ids, "member_ids").await?);
    }
    params.opened_on = req.opened_on;

    let status = req.status.unwrap_or(before.status);
    params.status = req.status;
    params.closed_on = match (before.status, status) {
        (MatterStatus::Closed, MatterStatus::Closed) => match req.closed_on {
            Some(None) => Some(closing_date(status, before.closed_on, today)),
            other => other,
        },
        (_, MatterStatus::Closed) => Some(closing_date(
            status,
            req.closed_on.flatten().or(before.closed_on),
            today,
        )),
        (MatterStatus::Closed, _) => Some(None),
        // Open matters never carry a closing date.
        _ => None,
    };

    let after = state
        .db
        .update_matter(id, &params)
        .await
        .map_err(db_conflict(NUMBER_TAKEN))?
        .ok_or_else(|| not_found("Matter", id))?;

    let changes = diff_fields(&before, &after);
    if !changes.is_empty() {
        let added: Vec<Uuid> = after
            .member_ids
            .iter()
            .filter(|member| !before.member_ids.contains(member))
            .copied()
            .collect();
        let action = if before.status != after.status {
            ActivityAction::StatusChanged
        } else {
            ActivityAction::Updated
        };
        Entry::new(
            actor.id,
            EntityType::Matter,
            after.id,
            action,
            format!("{} updated matter {}", actor.name, after.matter_number),
        )
        .changes(changes)
        .notify(added)
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
    let matter = visible_matter(state.db.as_ref(), &actor, id).await?;
    require_staff(&state, &actor, "delete_matter")?;

    let invoices = state
        .db
        .count_invoices_for_matter(id)
        .await
        .map_err(db_error)?;
    if invoices > 0 {
        return Err((
            StatusCode::CONFLICT,
            format!(
                "Matter {} has {} invoice(s); delete them first",
                matter.matter_number, invoices
            ),
        ));
    }

    let paths = state
        .db
        .document_paths_for_matter(id)
        .await
        .map_err(db_error)?;
    if !state
        .db
        .delete_matter(id)
        .await
        .map_err(db_conflict("Matter is still referenced by other records"))?
    {
        return Err(not_found("Matter", id));
    }
    for path in &paths {
        state.uploads.remove(path).await;
    }

    Entry::new(
        actor.id,
        EntityType::Matter,
        id,
        ActivityAction::Deleted,
        format!("{} deleted matter {}", actor.name, matter.matter_number),
    )
    .changes(snapshot(&matter, false))
    .record(state.db.as_ref())
    .await;
    tracing::info!(matter_id = %id, documents = paths.len(), "matter deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::Page;
    use crate::testing::{seed_invoice, seed_matter, seed_task, seed_user, test_state};

    fn create_req(title: &str) -> CreateMatterRequest {
        CreateMatterRequest {
            matter_number: None,
            title: title.into(),
            description: None,
            practice_area: Some("  ".into()),
            status: None,
            client_id: None,
            member_ids: Vec::new(),
            opened_on: None,
            closed_on: None,
        }
    }

    #[tokio::test]
    async fn numbers_are_allocated_per_year() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let year = Utc::now().year();

        let (_, Json(first)) = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Json(create_req("Smith v. Jones")),
        )
        .await
        .expect("first");
        let (_, Json(second)) = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Json(create_req("Estate of Doe")),
        )
        .await
        .expect("second");

        assert_eq!(first.matter_number, format!("MAT-{year}-0001"));
        assert_eq!(second.matter_number, format!("MAT-{year}-0002"));
        assert_eq!(first.practice_area, None);
        assert_eq!(first.opened_on, Some(Utc::now().date_naive()));

        let mut dup = create_req("Duplicate");
        dup.matter_number = Some(format!("mat-{year}-0001"));
        let err = create_handler(State(state), Extension(CurrentUser(admin)), Json(dup))
            .await
            .expect_err("duplicate number");
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn client_must_have_client_role() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;

        let mut req = create_req("Bad client");
        req.client_id = Some(member.id);
        let err = create_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Json(req),
        )
        .await
        .expect_err("member as client");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let mut req = create_req("Missing client");
        req.client_id = Some(Uuid::new_v4());
        let err = create_handler(State(state), Extension(CurrentUser(admin)), Json(req))
            .await
            .expect_err("unknown client");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1.contains("not found"));
    }

    #[tokio::test]
    async fn closing_stamps_and_reopening_clears_closed_on() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;

        let Json(closed) = update_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(matter.id),
            Json(UpdateMatterRequest {
                status: Some(MatterStatus::Closed),
                ..Default::default()
            }),
        )
        .await
        .expect("close");
        assert_eq!(closed.closed_on, Some(Utc::now().date_naive()));

        let Json(reopened) = update_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(matter.id),
            Json(UpdateMatterRequest {
                status: Some(MatterStatus::Open),
                ..Default::default()
            }),
        )
        .await
        .expect("reopen");
        assert_eq!(reopened.closed_on, None);

        let history = state
            .db
            .list_activity(&crate::db::ActivityFilter {
                entity_type: Some(EntityType::Matter),
                entity_id: Some(matter.id),
                actor_id: None,
                page: Page::default(),
            })
            .await
            .unwrap();
        assert_eq!(history.total, 2);
        assert!(
            history
                .items
                .iter()
                .all(|a| a.action == ActivityAction::StatusChanged)
        );
    }

    #[tokio::test]
    async fn closed_matters_keep_a_closing_date() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        let filed = Utc::now().date_naive() - Duration::days(3);
        let update = |req: UpdateMatterRequest| {
            update_handler(
                State(Arc::clone(&state)),
                Extension(CurrentUser(admin.clone())),
                Path(matter.id),
                Json(req),
            )
        };

        let Json(closed) = update(UpdateMatterRequest {
            status: Some(MatterStatus::Closed),
            closed_on: Some(Some(filed)),
            ..Default::default()
        })
        .await
        .expect("close");
        assert_eq!(closed.closed_on, Some(filed));

        let Json(cleared) = update(UpdateMatterRequest {
            closed_on: Some(None),
            ..Default::default()
        })
        .await
        .expect("clear closing date");
        assert_eq!(cleared.status, MatterStatus::Closed);
        assert_eq!(cleared.closed_on, Some(filed));

        let Json(open) = update(UpdateMatterRequest {
            status: Some(MatterStatus::Open),
            ..Default::default()
        })
        .await
        .expect("reopen");
        let Json(still_open) = update(UpdateMatterRequest {
            closed_on: Some(Some(filed)),
            ..Default::default()
        })
        .await
        .expect("date on open matter");
        assert_eq!(open.closed_on, None);
        assert_eq!(still_open.closed_on, None);
    }

    #[tokio::test]
    async fn added_members_are_notified() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let first = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let second = seed_user(state.db.as_ref(), "Max Member", Role::Member).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![first.id]).await;

        update_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Path(matter.id),
            Json(UpdateMatterRequest {
                member_ids: Some(vec![first.id, second.id, second.id]),
                ..Default::default()
            }),
        )
        .await
        .expect("add member");

        assert_eq!(state.db.count_unread_notifications(second.id).await.unwrap(), 1);
        assert_eq!(state.db.count_unread_notifications(first.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn matters_with_invoices_cannot_be_deleted() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, Some(client.id), vec![]).await;
        let due = Utc::now().date_naive() + Duration::days(30);
        seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(100), due, true).await;

        let err = delete_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin.clone())),
            Path(matter.id),
        )
        .await
        .expect_err("has invoices");
        assert_eq!(err.0, StatusCode::CONFLICT);

        let empty = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        seed_task(state.db.as_ref(), empty.id, admin.id, vec![], None).await;
        let status = delete_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(admin)),
            Path(empty.id),
        )
        .await
        .expect("delete");
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.db.get_matter(empty.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outsiders_get_not_found_and_members_see_no_money() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let outsider = seed_user(state.db.as_ref(), "Olga Other", Role::Member).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;
        let matter =
            seed_matter(state.db.as_ref(), admin.id, Some(client.id), vec![member.id]).await;
        let due = Utc::now().date_naive() + Duration::days(30);
        seed_invoice(state.db.as_ref(), &matter, admin.id, dec!(250), due, false).await;

        let err = get_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(outsider)),
            Path(matter.id),
        )
        .await
        .expect_err("outsider");
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let Json(detail) = get_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(member.clone())),
            Path(matter.id),
        )
        .await
        .expect("member view");
        assert!(detail.stats.invoices.is_none());

        let Json(stats) = stats_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(client)),
            Path(matter.id),
        )
        .await
        .expect("client view");
        let invoices = stats.invoices.expect("client sees totals");
        assert_eq!(invoices.billed, dec!(250));
        assert_eq!(invoices.outstanding, dec!(250));

        let err = update_handler(
            State(state),
            Extension(CurrentUser(member)),
            Path(matter.id),
            Json(UpdateMatterRequest::default()),
        )
        .await
        .expect_err("members cannot edit");
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }
}
