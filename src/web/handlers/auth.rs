//! Login, session and password endpoints.

use std::sync::Arc;

use axum::{Extension, Json, extract::State, http::StatusCode};
use chrono::Utc;
use serde_json::json;

use crate::db::UserRecord;
use crate::error::AuthError;
use crate::legal::audit::AuditKind;
use crate::web::auth::{CurrentUser, check_password_strength, hash_password, verify_password};
use crate::web::handlers::{ApiResult, bad_request, db_error};
use crate::web::server::AppState;
use crate::web::types::{ChangePasswordRequest, LoginRequest, LoginResponse};

fn invalid_credentials() -> (StatusCode, String) {
    (
        StatusCode::UNAUTHORIZED,
        AuthError::InvalidCredentials.to_string(),
    )
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || req.password.is_empty() {
        return Err(bad_request("'email' and 'password' are required"));
    }

    if !state.login_limiter.check(&email) {
        state
            .audit
            .record(AuditKind::LoginRateLimited, json!({ "email": email }));
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            "Too many login attempts. Try again later.".to_string(),
        ));
    }

    let Some((mut user, hash)) = state
        .db
        .get_user_credentials(&email)
        .await
        .map_err(db_error)?
    else {
        state.audit.record(
            AuditKind::LoginFailed,
            json!({ "email": email, "reason": "unknown_email" }),
        );
        return Err(invalid_credentials());
    };

    if !verify_password(req.password, hash).await {
        state.audit.record(
            AuditKind::LoginFailed,
            json!({ "email": email, "user_id": user.id, "reason": "bad_password" }),
        );
        return Err(invalid_credentials());
    }

    if !user.is_active {
        state.audit.record(
            AuditKind::LoginFailed,
            json!({ "email": email, "user_id": user.id, "reason": "inactive" }),
        );
        return Err((StatusCode::FORBIDDEN, AuthError::Inactive.to_string()));
    }

    let now = Utc::now();
    state
        .db
        .touch_last_login(user.id, now)
        .await
        .map_err(db_error)?;
    user.last_login_at = Some(now);
    state.login_limiter.reset(&email);

    let (token, expires_at) = state.tokens.issue(&user, now).map_err(|e| {
        tracing::error!("failed to issue token: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to issue token".to_string(),
        )
    })?;
    state.audit.record(
        AuditKind::LoginSucceeded,
        json!({ "user_id": user.id, "role": user.role.as_str() }),
    );
    tracing::info!(user_id = %user.id, "user logged in");

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user,
    }))
}

pub async fn me_handler(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<UserRecord> {
    Json(user)
}

pub async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    check_password_strength(&req.new_password).map_err(|e| bad_request(e.to_string()))?;

    let stored = state
        .db
        .get_password_hash(user.id)
        .await
        .map_err(db_error)?
        .unwrap_or_default();
    if !verify_password(req.current_password, stored).await {
        return Err(bad_request("Current password is incorrect"));
    }

    let hash = hash_password(req.new_password).await.map_err(|e| {
        tracing::error!("password hashing failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to update password".to_string(),
        )
    })?;
    state
        .db
        .set_password_hash(user.id, &hash)
        .await
        .map_err(db_error)?;
    state
        .audit
        .record(AuditKind::PasswordChanged, json!({ "user_id": user.id }));
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;
    use crate::testing::{TEST_PASSWORD, seed_user, test_state};

    fn login(email: &str, password: &str) -> Json<LoginRequest> {
        Json(LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })
    }

    #[tokio::test]
    async fn login_issues_token_and_stamps_last_login() {
        let (state, _dir) = test_state().await;
        let user = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;

        let Json(resp) = login_handler(State(Arc::clone(&state)), login(&user.email.to_uppercase(), TEST_PASSWORD))
            .await
            .expect("login");
        assert_eq!(resp.user.id, user.id);
        assert!(resp.user.last_login_at.is_some());
        let claims = state.tokens.verify(&resp.token, Utc::now()).expect("valid token");
        assert_eq!(claims.sub, user.id);
    }

    #[tokio::test]
    async fn unknown_email_and_bad_password_look_the_same() {
        let (state, _dir) = test_state().await;
        let user = seed_user(state.db.as_ref(), "Ana Admin", Role::Admin).await;

        let unknown = login_handler(State(Arc::clone(&state)), login("nobody@firm.test", TEST_PASSWORD))
            .await
            .expect_err("unknown");
        let wrong = login_handler(State(Arc::clone(&state)), login(&user.email, "wrong-password"))
            .await
            .expect_err("wrong");
        assert_eq!(unknown, wrong);
        assert_eq!(unknown.0, StatusCode::UNAUTHORIZED);
        assert_eq!(state.audit.counters().failed_logins, 2);
    }

    #[tokio::test]
    async fn inactive_users_are_forbidden() {
        let (state, _dir) = test_state().await;
        let user = seed_user(state.db.as_ref(), "Old Timer", Role::Member).await;
        state
            .db
            .update_user(
                user.id,
                &crate::db::UpdateUserParams {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("deactivate");

        let err = login_handler(State(state), login(&user.email, TEST_PASSWORD))
            .await
            .expect_err("inactive");
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn password_change_requires_current_password() {
        let (state, _dir) = test_state().await;
        let user = seed_user(state.db.as_ref(), "Mia Member", Role::Member).await;

        let err = change_password_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(user.clone())),
            Json(ChangePasswordRequest {
                current_password: "not-it-at-all".into(),
                new_password: "a much better one".into(),
            }),
        )
        .await
        .expect_err("wrong current");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let status = change_password_handler(
            State(Arc::clone(&state)),
            Extension(CurrentUser(user.clone())),
            Json(ChangePasswordRequest {
                current_password: TEST_PASSWORD.into(),
                new_password: "a much better one".into(),
            }),
        )
        .await
        .expect("changed");
        assert_eq!(status, StatusCode::NO_CONTENT);

        login_handler(State(state), login(&user.email, "a much better one"))
            .await
            .expect("new password works");
    }
}
