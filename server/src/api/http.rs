use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use odds_contract::LotteryChain;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::extract::{metrics_auth_error, ApiJson};
use crate::error::ApiError;
use crate::services::webhook::SIGNATURE_HEADER;
use crate::services::LoginResponse;
use crate::App;

pub(super) async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

pub(super) async fn metrics<C: LotteryChain>(
    headers: HeaderMap,
    AxumState(app): AxumState<Arc<App<C>>>,
) -> Response {
    if let Some(err) = metrics_auth_error(app.config.metrics_token.as_ref(), &headers) {
        return err.into_response();
    }
    Json(json!({
        "http": app.http_metrics_snapshot(),
        "lifecycle": app.lifecycle_metrics_snapshot(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WalletAuthRequest {
    wallet_address: String,
    signature: String,
    message: String,
}

pub(super) async fn wallet_auth<C: LotteryChain>(
    AxumState(app): AxumState<Arc<App<C>>>,
    ApiJson(request): ApiJson<WalletAuthRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    let response = app
        .auth
        .login(&request.wallet_address, &request.signature, &request.message)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub(super) async fn webhook<C: LotteryChain>(
    AxumState(app): AxumState<Arc<App<C>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let summary = app.webhook.handle(&body, signature).await?;
    tracing::debug!(logs = summary.logs, applied = summary.applied, "webhook handled");
    Ok(Json(json!({ "status": "success" })))
}
