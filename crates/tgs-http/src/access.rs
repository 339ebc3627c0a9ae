//! Password gate as axum middleware, plus the shared `/pwd` handlers.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{AppendHeaders, Html, IntoResponse, Redirect, Response},
    Form, Json,
};
use serde::Deserialize;
use serde_json::json;
use tgs_core::access::{AccessDecision, AccessGuard};
use tgs_supervisor::ProcessSupervisor;

use crate::pages;

/// Where the middleware gets the guard for each request.
#[async_trait]
pub trait GuardSource: Send + Sync {
    async fn access_guard(&self) -> AccessGuard;

    /// Title shown on the password prompt.
    fn title(&self) -> &'static str {
        "tgState"
    }
}

/// Fixed guard: the worker's config never changes while it runs.
#[async_trait]
impl GuardSource for AccessGuard {
    async fn access_guard(&self) -> AccessGuard {
        self.clone()
    }
}

/// The supervisor checks against whatever config it currently holds.
#[async_trait]
impl GuardSource for ProcessSupervisor {
    async fn access_guard(&self) -> AccessGuard {
        AccessGuard::from_config(&self.config().await)
    }

    fn title(&self) -> &'static str {
        "tgState supervisor"
    }
}

pub type SharedGuard = Arc<dyn GuardSource>;

pub async fn require_access(
    State(source): State<SharedGuard>,
    req: Request,
    next: Next,
) -> Response {
    let guard = source.access_guard().await;

    let decision = {
        let cookie = req
            .headers()
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok());
        let query = Query::<PasswordQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.p);
        guard.check(req.uri().path(), cookie, query.as_deref())
    };

    match decision {
        AccessDecision::Allow => next.run(req).await,
        AccessDecision::AllowAndSetCookie(cookie) => {
            let mut resp = next.run(req).await;
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                resp.headers_mut().append(header::SET_COOKIE, value);
            }
            resp
        }
        AccessDecision::Prompt => {
            Html(pages::password_prompt(source.title(), None)).into_response()
        }
        AccessDecision::Deny => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "password required" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PasswordQuery {
    p: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    #[serde(default)]
    p: String,
}

/// The prompt, or home when no password is configured.
pub async fn password_page(State(source): State<SharedGuard>) -> Response {
    if !source.access_guard().await.is_active() {
        return Redirect::to("/").into_response();
    }
    Html(pages::password_prompt(source.title(), None)).into_response()
}

/// Right password: cookie + redirect home. Wrong one: the prompt again with 401.
pub async fn submit_password(
    State(source): State<SharedGuard>,
    Form(form): Form<PasswordForm>,
) -> Response {
    let guard = source.access_guard().await;
    if !guard.is_active() {
        return Redirect::to("/").into_response();
    }
    if guard.matches(&form.p) {
        return (
            AppendHeaders([(header::SET_COOKIE, guard.session_cookie(&form.p))]),
            Redirect::to("/"),
        )
            .into_response();
    }

    tracing::warn!("rejected password attempt");
    (
        StatusCode::UNAUTHORIZED,
        Html(pages::password_prompt(source.title(), Some("Wrong password"))),
    )
        .into_response()
}
