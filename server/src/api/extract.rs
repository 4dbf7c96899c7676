use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Query, Request},
    http::{header, request::Parts, HeaderMap},
    Json,
};
use chrono::Utc;
use odds_contract::LotteryChain;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::config::Secret;
use crate::error::ApiError;
use crate::services::AuthUser;
use crate::App;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const METRICS_TOKEN_HEADER: &str = "x-metrics-token";

/// JSON body whose rejections render as [ApiError].
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Query string whose rejections render as [ApiError].
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(Self(value))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn token_matches(headers: &HeaderMap, header_name: &str, expected: &Secret) -> bool {
    let header_token = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok());
    bearer_token(headers) == Some(expected.expose()) || header_token == Some(expected.expose())
}

/// Admin routes are closed unless a token is configured.
pub(super) fn admin_auth_error(token: Option<&Secret>, headers: &HeaderMap) -> Option<ApiError> {
    match token.filter(|token| !token.is_empty()) {
        Some(token) if token_matches(headers, ADMIN_TOKEN_HEADER, token) => None,
        _ => Some(ApiError::Unauthorized("Unauthorized".to_string())),
    }
}

/// Metrics are open unless a token is configured.
pub(super) fn metrics_auth_error(token: Option<&Secret>, headers: &HeaderMap) -> Option<ApiError> {
    match token.filter(|token| !token.is_empty()) {
        Some(token) if !token_matches(headers, METRICS_TOKEN_HEADER, token) => {
            Some(ApiError::Unauthorized("Unauthorized".to_string()))
        }
        _ => None,
    }
}

#[async_trait]
impl<C: LotteryChain> FromRequestParts<Arc<App<C>>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        app: &Arc<App<C>>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("Unauthorized".to_string()))?;
        app.auth
            .keys()
            .authenticate(token, Utc::now())
            .map_err(|err| ApiError::Unauthorized(err.to_string()))
    }
}

/// Guard for operator routes.
pub struct Admin;

#[async_trait]
impl<C: LotteryChain> FromRequestParts<Arc<App<C>>> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        app: &Arc<App<C>>,
    ) -> Result<Self, Self::Rejection> {
        match admin_auth_error(app.config.admin_token.as_ref(), &parts.headers) {
            Some(err) => Err(err),
            None => Ok(Admin),
        }
    }
}

/// Parse a numeric path id.
pub(super) fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request("Validation failed (numeric string is expected)"))
}
