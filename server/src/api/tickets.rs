use axum::{
    extract::{Path, State as AxumState},
    http::StatusCode,
    Json,
};
use odds_contract::LotteryChain;
use odds_types::{Ticket, TicketGroup, Usdc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::extract::{parse_id, Admin, ApiJson};
use crate::error::ApiError;
use crate::services::{AuthUser, TicketDetails};
use crate::store::TicketUpdate;
use crate::App;

type AppState<C> = AxumState<Arc<App<C>>>;

pub(super) async fn mine<C: LotteryChain>(
    AxumState(app): AppState<C>,
    user: AuthUser,
) -> Result<Json<Vec<TicketDetails>>, ApiError> {
    Ok(Json(app.tickets.find_by_user(user.id).await?))
}

pub(super) async fn all<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
) -> Result<Json<Vec<TicketDetails>>, ApiError> {
    Ok(Json(app.tickets.find_all().await?))
}

pub(super) async fn by_id<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(id): Path<String>,
) -> Result<Json<TicketDetails>, ApiError> {
    Ok(Json(app.tickets.find_one(parse_id(&id)?).await?))
}

pub(super) async fn by_raffle<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TicketDetails>>, ApiError> {
    Ok(Json(app.tickets.find_by_raffle(parse_id(&id)?).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateTicketRequest {
    user_id: i64,
    raffle_id: i64,
    #[serde(default)]
    referral_code_id: Option<i64>,
}

pub(super) async fn create<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
    ApiJson(request): ApiJson<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let ticket = app
        .tickets
        .create(request.user_id, request.raffle_id, request.referral_code_id)
        .await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateTicketRequest {
    group: Option<TicketGroup>,
    prize_amount: Option<Usdc>,
    is_distributed: Option<bool>,
    purchase_transaction_hash: Option<String>,
}

impl From<UpdateTicketRequest> for TicketUpdate {
    fn from(request: UpdateTicketRequest) -> Self {
        TicketUpdate {
            group: request.group,
            prize_amount: request.prize_amount,
            is_distributed: request.is_distributed,
            purchase_transaction_hash: request.purchase_transaction_hash,
        }
    }
}

pub(super) async fn update<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateTicketRequest>,
) -> Result<Json<TicketDetails>, ApiError> {
    Ok(Json(
        app.tickets.update(parse_id(&id)?, request.into()).await?,
    ))
}

pub(super) async fn remove<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.tickets.remove(parse_id(&id)?).await?;
    Ok(Json(json!({ "deleted": true })))
}
