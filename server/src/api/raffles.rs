use axum::{
    extract::{Path, State as AxumState},
    http::StatusCode,
    Json,
};
use odds_contract::LotteryChain;
use odds_types::RaffleStatus;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::extract::{parse_id, Admin, ApiJson, ApiQuery};
use crate::error::ApiError;
use crate::services::raffles::{
    ActivityItem, ActivityStats, AutoEnrollReceipt, AutoEnrollRequest, PastRaffles,
    RaffleTickets, RaffleWinner,
};
use crate::services::{AuthUser, Page, PurchaseReceipt, PurchaseRequest, RaffleSummary};
use crate::App;

type AppState<C> = AxumState<Arc<App<C>>>;

#[derive(Debug, Default, Deserialize)]
pub(super) struct PageQuery {
    page: Option<u64>,
    limit: Option<u64>,
}

impl From<PageQuery> for Page {
    fn from(query: PageQuery) -> Self {
        Page::new(query.page, query.limit)
    }
}

pub(super) async fn current<C: LotteryChain>(
    AxumState(app): AppState<C>,
) -> Result<Json<RaffleSummary>, ApiError> {
    Ok(Json(app.raffles.current().await?))
}

pub(super) async fn active<C: LotteryChain>(
    AxumState(app): AppState<C>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raffles = app.raffles.active().await?;
    Ok(Json(json!({ "count": raffles.len(), "raffles": raffles })))
}

pub(super) async fn past<C: LotteryChain>(
    AxumState(app): AppState<C>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<PastRaffles>, ApiError> {
    Ok(Json(app.raffles.past(query.into()).await?))
}

pub(super) async fn by_id<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(id): Path<String>,
) -> Result<Json<RaffleSummary>, ApiError> {
    Ok(Json(app.raffles.by_id(parse_id(&id)?).await?))
}

pub(super) async fn tickets<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<RaffleTickets>, ApiError> {
    Ok(Json(
        app.raffles
            .raffle_tickets(parse_id(&id)?, query.into())
            .await?,
    ))
}

pub(super) async fn winner<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(id): Path<String>,
) -> Result<Json<RaffleWinner>, ApiError> {
    Ok(Json(app.raffles.raffle_winner(parse_id(&id)?).await?))
}

pub(super) async fn purchase<C: LotteryChain>(
    AxumState(app): AppState<C>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<PurchaseRequest>,
) -> Result<(StatusCode, Json<PurchaseReceipt>), ApiError> {
    let receipt = app.raffles.purchase(&user, parse_id(&id)?, request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub(super) async fn auto_enroll<C: LotteryChain>(
    AxumState(app): AppState<C>,
    ApiJson(request): ApiJson<AutoEnrollRequest>,
) -> Result<(StatusCode, Json<AutoEnrollReceipt>), ApiError> {
    let receipt = app.raffles.auto_enroll(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub(super) async fn activity<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(wallet): Path<String>,
) -> Result<Json<Vec<ActivityItem>>, ApiError> {
    Ok(Json(app.raffles.user_activity(&wallet).await?))
}

pub(super) async fn activity_stats<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(wallet): Path<String>,
) -> Result<Json<ActivityStats>, ApiError> {
    Ok(Json(app.raffles.user_activity_stats(&wallet).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateRaffleRequest {
    status: RaffleStatus,
    #[serde(default)]
    is_distributed: Option<bool>,
}

pub(super) async fn update<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateRaffleRequest>,
) -> Result<Json<RaffleSummary>, ApiError> {
    let summary = app
        .raffles
        .update_raffle(parse_id(&id)?, request.status, request.is_distributed)
        .await?;
    Ok(Json(summary))
}
