use axum::{
    extract::{Path, State as AxumState},
    http::StatusCode,
    Json,
};
use odds_contract::LotteryChain;
use odds_types::{LeaderboardEntry, LeaderboardSort, ReferralCode, SortOrder};
use serde::Deserialize;
use std::sync::Arc;

use super::extract::{Admin, ApiJson, ApiQuery};
use crate::error::ApiError;
use crate::services::referral::generate_platform_codes;
use crate::services::AuthUser;
use crate::App;

const DEFAULT_PLATFORM_CODES: usize = 10;
const MAX_PLATFORM_CODES: usize = 1_000;

type AppState<C> = AxumState<Arc<App<C>>>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LeaderboardQuery {
    #[serde(default)]
    sort_by: LeaderboardSort,
    #[serde(default)]
    order: SortOrder,
}

pub(super) async fn leaderboard<C: LotteryChain>(
    AxumState(app): AppState<C>,
    ApiQuery(query): ApiQuery<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    Ok(Json(
        app.referrals.leaderboard(query.sort_by, query.order).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub(super) struct UserStatsQuery {
    wallet: Option<String>,
}

pub(super) async fn user_stats<C: LotteryChain>(
    AxumState(app): AppState<C>,
    ApiQuery(query): ApiQuery<UserStatsQuery>,
) -> Result<Json<Option<LeaderboardEntry>>, ApiError> {
    let wallet = query
        .wallet
        .filter(|wallet| !wallet.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("wallet is required"))?;
    Ok(Json(app.referrals.user_stats(&wallet).await?))
}

pub(super) async fn validate<C: LotteryChain>(
    AxumState(app): AppState<C>,
    Path(code): Path<String>,
) -> Result<Json<ReferralCode>, ApiError> {
    Ok(Json(app.referrals.validate(&code).await?))
}

pub(super) async fn mine<C: LotteryChain>(
    AxumState(app): AppState<C>,
    user: AuthUser,
) -> Result<Json<ReferralCode>, ApiError> {
    Ok(Json(app.referrals.generate_user_code(user.id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PlatformCodesRequest {
    #[serde(default)]
    codes: Vec<String>,
    count: Option<usize>,
}

pub(super) async fn list_platform_codes<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
) -> Result<Json<Vec<ReferralCode>>, ApiError> {
    Ok(Json(app.referrals.platform_codes().await?))
}

/// Ensure the given codes exist, or mint `count` random ones when none are given.
pub(super) async fn create_platform_codes<C: LotteryChain>(
    AxumState(app): AppState<C>,
    _admin: Admin,
    ApiJson(request): ApiJson<PlatformCodesRequest>,
) -> Result<(StatusCode, Json<Vec<ReferralCode>>), ApiError> {
    let codes = if request.codes.is_empty() {
        let count = request.count.unwrap_or(DEFAULT_PLATFORM_CODES);
        if count == 0 || count > MAX_PLATFORM_CODES {
            return Err(ApiError::bad_request(format!(
                "count must be between 1 and {MAX_PLATFORM_CODES}"
            )));
        }
        generate_platform_codes(count)
    } else {
        request.codes
    };
    let created = app.referrals.create_platform_codes(codes).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
