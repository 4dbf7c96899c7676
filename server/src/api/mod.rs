use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use odds_contract::LotteryChain;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::App;

mod extract;
mod http;
mod raffles;
mod referral;
mod tickets;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct Api<C: LotteryChain> {
    app: Arc<App<C>>,
}

#[derive(Clone)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
    allow_no_origin: bool,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn default_governor_config() -> Option<IpGovernorConfig> {
    GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .finish()
}

impl<C: LotteryChain> Api<C> {
    pub fn new(app: Arc<App<C>>) -> Self {
        Self { app }
    }

    pub fn router(&self) -> Router {
        let config = &self.app.config;
        let allowed_origins = config.origins.allowed.clone();
        let allow_any_origin = config.origins.allows_any();
        if allowed_origins.is_empty() {
            tracing::warn!("no allowed origins configured; all browser origins will be rejected");
        }
        let cors_origins = allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "invalid allowed origin");
                    None
                }
            })
            .collect::<Vec<_>>();
        let origin_config = OriginConfig {
            allowed_origins: Arc::new(allowed_origins),
            allow_any_origin,
            allow_no_origin: config.origins.allow_no_origin,
        };

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([header::HeaderName::from_static(REQUEST_ID_HEADER)]);

        let governor_conf = match (
            config.http_rate_limit_per_second,
            config.http_rate_limit_burst,
        ) {
            (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
                let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                let config = GovernorConfigBuilder::default()
                    .period(period)
                    .burst_size(burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .or_else(|| {
                        tracing::warn!("invalid rate-limit config; falling back to defaults");
                        default_governor_config()
                    });
                config.map(Arc::new)
            }
            _ => None,
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/metrics", get(http::metrics::<C>))
            .route("/auth/wallet", post(http::wallet_auth::<C>))
            .route("/webhook", post(http::webhook::<C>))
            .route("/raffles/current", get(raffles::current::<C>))
            .route("/raffles/active", get(raffles::active::<C>))
            .route("/raffles/past", get(raffles::past::<C>))
            .route("/raffles/auto-enroll", post(raffles::auto_enroll::<C>))
            .route(
                "/raffles/user/:wallet/activity",
                get(raffles::activity::<C>),
            )
            .route(
                "/raffles/user/:wallet/activity/stats",
                get(raffles::activity_stats::<C>),
            )
            .route(
                "/raffles/:id",
                get(raffles::by_id::<C>).patch(raffles::update::<C>),
            )
            .route("/raffles/:id/tickets", get(raffles::tickets::<C>))
            .route("/raffles/:id/winner", get(raffles::winner::<C>))
            .route("/raffles/:id/purchase", post(raffles::purchase::<C>))
            .route("/referral/leaderboard", get(referral::leaderboard::<C>))
            .route("/referral/user-stats", get(referral::user_stats::<C>))
            .route("/referral/me", get(referral::mine::<C>))
            .route("/referral/validate/:code", get(referral::validate::<C>))
            .route(
                "/referral/platform-codes",
                get(referral::list_platform_codes::<C>).post(referral::create_platform_codes::<C>),
            )
            .route(
                "/tickets",
                get(tickets::all::<C>).post(tickets::create::<C>),
            )
            .route("/tickets/me", get(tickets::mine::<C>))
            .route("/tickets/raffle/:id", get(tickets::by_raffle::<C>))
            .route(
                "/tickets/:id",
                get(tickets::by_id::<C>)
                    .patch(tickets::update::<C>)
                    .delete(tickets::remove::<C>),
            );

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };

        let router = router.layer(cors);
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            async move { enforce_origin(origin_config, req, next).await }
        }));
        let router = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            self.app.clone(),
            request_id_middleware::<C>,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.app.clone())
    }
}

async fn enforce_origin(config: OriginConfig, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    } else if !config.allow_no_origin {
        return (StatusCode::FORBIDDEN, "Origin required").into_response();
    }
    next.run(req).await
}

async fn request_id_middleware<C: LotteryChain>(
    AxumState(app): AxumState<Arc<App<C>>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    app.http_metrics()
        .record(response.status().as_u16(), elapsed);
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "http.request"
    );
    response
}
