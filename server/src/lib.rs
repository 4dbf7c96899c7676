//! Backend for odds raffles.
//!
//! The HTTP API reserves tickets and hands buyers the contract calls to sign,
//! the [Scheduler] rotates raffles through their lifecycle on-chain, and the
//! [Reconciler] folds confirmed contract events (from the log listener or the
//! Alchemy webhook) back into the database.

use hmac::digest::InvalidLength;
use odds_contract::LotteryChain;
use std::sync::Arc;

mod api;
pub use api::Api;

pub mod config;
mod error;
pub use error::ApiError;
pub mod metrics;
pub mod reconciler;
pub use reconciler::Reconciler;
pub mod scheduler;
pub use scheduler::Scheduler;
pub mod services;
pub mod store;

use config::ServerConfig;
use metrics::{
    HttpMetrics, HttpMetricsSnapshot, LifecycleMetrics, LifecycleMetricsSnapshot,
};
use services::{
    AuthService, RaffleService, ReferralService, TicketService, TokenKeys, WebhookService,
};
use store::Store;

/// Shared state behind every route and background task.
pub struct App<C: LotteryChain> {
    pub config: ServerConfig,
    pub store: Store,
    pub chain: C,
    pub auth: AuthService,
    pub raffles: RaffleService<C>,
    pub referrals: ReferralService,
    pub tickets: TicketService,
    pub webhook: WebhookService,
    pub reconciler: Reconciler,
    http_metrics: HttpMetrics,
    lifecycle: Arc<LifecycleMetrics>,
}

impl<C: LotteryChain> App<C> {
    pub fn new(config: ServerConfig, store: Store, chain: C) -> Result<Self, InvalidLength> {
        let keys = TokenKeys::new(&config.jwt_secret, config.token_ttl)?;
        let lifecycle = Arc::new(LifecycleMetrics::default());
        let reconciler = Reconciler::new(store.clone(), lifecycle.clone());
        let webhook = WebhookService::new(
            config.webhook_signing_key.clone(),
            config.lottery_contract.clone(),
            reconciler.clone(),
        );
        Ok(Self {
            auth: AuthService::new(store.clone(), keys),
            raffles: RaffleService::new(store.clone(), chain.clone(), config.template),
            referrals: ReferralService::new(store.clone(), config.leaderboard_size),
            tickets: TicketService::new(store.clone()),
            webhook,
            reconciler,
            http_metrics: HttpMetrics::default(),
            lifecycle,
            config,
            store,
            chain,
        })
    }

    /// Lifecycle scheduler sharing this app's store, chain, and counters.
    pub fn scheduler(&self) -> Scheduler<C> {
        Scheduler::new(
            self.store.clone(),
            self.chain.clone(),
            self.config.rotation,
            self.config.template,
            self.config.scheduler_interval,
            self.lifecycle.clone(),
        )
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub fn lifecycle_metrics_snapshot(&self) -> LifecycleMetricsSnapshot {
        self.lifecycle.snapshot()
    }
}
