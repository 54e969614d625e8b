//! Home screen summary and the task leaderboard.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
};
use chrono::{Duration, Utc};

use crate::db::{ActivityFilter, InvoiceFilter, Page, Role, TaskFilter, Visibility};
use crate::legal::access::{is_staff, visibility_for};
use crate::legal::billing::summarize;
use crate::legal::leaderboard::{clamp_days, rank};
use crate::web::auth::CurrentUser;
use crate::web::handlers::{ApiResult, db_error, require_internal};
use crate::web::server::AppState;
use crate::web::types::{DashboardResponse, LeaderboardQuery, LeaderboardResponse};

const DUE_SOON_DAYS: i64 = 7;
const RECENT_LIMIT: i64 = 10;

pub async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<DashboardResponse>> {
    let db = state.db.as_ref();
    let visibility = visibility_for(&user);
    let today = Utc::now().date_naive();
    let recent = Page::new(Some(1), Some(RECENT_LIMIT));

    let due_soon_filter = TaskFilter {
        due_between: Some((today, today + Duration::days(DUE_SOON_DAYS))),
        page: recent,
        ..TaskFilter::new(visibility)
    };
    let (tasks, overdue_tasks, due_soon, matters, unread_notifications) = futures::try_join!(
        db.task_status_counts(visibility),
        db.count_overdue_tasks(visibility, today),
        db.list_tasks(&due_soon_filter),
        db.matter_status_counts(visibility),
        db.count_unread_notifications(user.id),
    )
    .map_err(db_error)?;

    let invoices = match user.role {
        Role::Member => None,
        _ => {
            let scope = if is_staff(user.role) {
                Visibility::All
            } else {
                Visibility::Client(user.id)
            };
            let rows = db
                .list_invoices(&InvoiceFilter {
                    visibility: scope,
                    matter_id: None,
                    client_id: None,
                })
                .await
                .map_err(db_error)?;
            Some(summarize(&rows, today, state.billing.due_soon_days))
        }
    };

    // Staff see the firm-wide log; everyone else sees what was sent to them.
    let recent_activity = if is_staff(user.role) {
        db.list_activity(&ActivityFilter {
            entity_type: None,
            entity_id: None,
            actor_id: None,
            page: recent,
        })
        .await
        .map_err(db_error)?
        .items
    } else {
        db.list_notifications(user.id, false, recent)
            .await
            .map_err(db_error)?
            .items
            .into_iter()
            .map(|notification| notification.activity)
            .collect()
    };

    Ok(Json(DashboardResponse {
        tasks,
        overdue_tasks,
        due_soon: due_soon.items,
        matters,
        invoices,
        unread_notifications,
        recent_activity,
    }))
}

pub async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Json<LeaderboardResponse>> {
    require_internal(&state, &user, "view_leaderboard")?;
    let days = clamp_days(query.days);
    let now = Utc::now();
    let since = now - Duration::days(days);
    let rows = state
        .db
        .leaderboard_rows(since, now.date_naive())
        .await
        .map_err(db_error)?;
    Ok(Json(LeaderboardResponse {
        days,
        since,
        entries: rank(rows),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::{TaskStatus, UpdateTaskParams, UserRecord};
    use crate::testing::{seed_invoice, seed_matter, seed_task, seed_user, test_state};

    async fn summary(state: &Arc<AppState>, user: &UserRecord) -> DashboardResponse {
        let Json(response) = summary_handler(
            State(Arc::clone(state)),
            Extension(CurrentUser(user.clone())),
        )
        .await
        .expect("dashboard");
        response
    }

    #[tokio::test]
    async fn summary_is_scoped_to_the_caller() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let member = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;
        let today = Utc::now().date_naive();

        let mine = seed_matter(state.db.as_ref(), admin.id, Some(client.id), vec![member.id]).await;
        let other = seed_matter(state.db.as_ref(), admin.id, None, vec![]).await;
        seed_task(state.db.as_ref(), mine.id, admin.id, vec![member.id], Some(today + Duration::days(2))).await;
        seed_task(state.db.as_ref(), mine.id, admin.id, vec![], Some(today - Duration::days(1))).await;
        seed_task(state.db.as_ref(), other.id, admin.id, vec![], Some(today)).await;
        seed_invoice(state.db.as_ref(), &mine, admin.id, dec!(300), today + Duration::days(40), false).await;

        let for_admin = summary(&state, &admin).await;
        assert_eq!(for_admin.tasks.total(), 3);
        assert_eq!(for_admin.overdue_tasks, 1);
        assert_eq!(for_admin.due_soon.len(), 2);
        assert_eq!(for_admin.matters.open, 2);
        assert_eq!(for_admin.invoices.as_ref().map(|s| s.billed), Some(dec!(300)));

        let for_member = summary(&state, &member).await;
        assert_eq!(for_member.tasks.total(), 2);
        assert_eq!(for_member.due_soon.len(), 1);
        assert_eq!(for_member.matters.open, 1);
        assert!(for_member.invoices.is_none());

        let for_client = summary(&state, &client).await;
        assert_eq!(for_client.matters.open, 1);
        assert_eq!(for_client.invoices.map(|s| s.outstanding), Some(dec!(300)));
    }

    #[tokio::test]
    async fn leaderboard_ranks_completed_work() {
        let (state, _dir) = test_state().await;
        let admin = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;
        let busy = seed_user(state.db.as_ref(), "Bea Busy", Role::Member).await;
        let idle = seed_user(state.db.as_ref(), "Ivo Idle", Role::Member).await;
        let client = seed_user(state.db.as_ref(), "Carl Client", Role::Client).await;
        let matter = seed_matter(state.db.as_ref(), admin.id, None, vec![busy.id, idle.id]).await;
        let task = seed_task(state.db.as_ref(), matter.id, admin.id, vec![busy.id], None).await;
        state
            .db
            .update_task(
                task.id,
                &UpdateTaskParams {
                    status: Some(TaskStatus::Completed),
                    progress: Some(100),
                    completed_at: Some(Some(Utc::now())),
                    ..UpdateTaskParams::default()
                },
            )
            .await
            .unwrap();

        let Json(board) = leaderboard_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(idle.clone())),
            Query(LeaderboardQuery { days: Some(9999) }),
        )
        .await
        .expect("leaderboard");
        assert_eq!(board.days, 365);
        let top = &board.entries[0];
        assert_eq!(top.user_id, busy.id);
        assert_eq!(top.rank, 1);
        assert_eq!(top.completed, 1);
        assert!(board.entries.iter().all(|entry| entry.user_id != client.id));

        let err = leaderboard_handler(
            State(state),
            Extension(CurrentUser(client)),
            Query(LeaderboardQuery::default()),
        )
        .await
        .expect_err("clients");
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }
}
