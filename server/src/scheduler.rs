//! Raffle lifecycle scheduler.
//!
//! Each tick closes raffles that are finished (ending the lottery on-chain first),
//! then tops the active set back up according to the [RotationPolicy]. Ticks run
//! back to back on one task, so they never overlap. A failing step is logged and the
//! remaining steps still run; chain failures leave the raffle untouched so the next
//! tick retries it.

use crate::config::RotationPolicy;
use crate::metrics::LifecycleMetrics;
use crate::store::{Store, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use odds_contract::{Error as ChainError, LotteryChain, LotteryRevert};
use odds_types::{daily_window, Raffle, RaffleStatus, RaffleTemplate};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

type Result<T> = std::result::Result<T, StoreError>;

pub struct Scheduler<C: LotteryChain> {
    store: Store,
    chain: C,
    policy: RotationPolicy,
    template: RaffleTemplate,
    interval: Duration,
    metrics: Arc<LifecycleMetrics>,
}

impl<C: LotteryChain> Scheduler<C> {
    pub fn new(
        store: Store,
        chain: C,
        policy: RotationPolicy,
        template: RaffleTemplate,
        interval: Duration,
        metrics: Arc<LifecycleMetrics>,
    ) -> Self {
        Self {
            store,
            chain,
            policy,
            template,
            interval,
            metrics,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(policy = ?self.policy, interval = ?self.interval, "raffle scheduler started");
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) {
        match self.policy {
            RotationPolicy::Pool { active_target } => {
                self.step("complete sold-out raffles", self.finish_sold_out(now))
                    .await;
                self.step("complete expired raffles", self.finish_expired(now))
                    .await;
                self.step("fill raffle pool", self.fill_pool(active_target, now))
                    .await;
            }
            RotationPolicy::Daily { horizon_days } => {
                self.step("schedule daily raffles", self.schedule_days(horizon_days, now))
                    .await;
                self.step("complete expired raffles", self.finish_expired(now))
                    .await;
                self.step("activate daily raffle", self.activate_due(now))
                    .await;
            }
        }
    }

    async fn step(&self, name: &'static str, step: impl Future<Output = Result<()>>) {
        if let Err(err) = step.await {
            error!(?err, step = name, "scheduler step failed");
        }
    }

    async fn finish_sold_out(&self, now: DateTime<Utc>) -> Result<()> {
        let raffles = self.store.run(|db| db.sold_out_active_raffles()).await?;
        for raffle in raffles {
            self.finish(&raffle, now).await?;
        }
        Ok(())
    }

    async fn finish_expired(&self, now: DateTime<Utc>) -> Result<()> {
        let raffles = self
            .store
            .run(move |db| db.expired_active_raffles(now))
            .await?;
        for raffle in raffles {
            self.finish(&raffle, now).await?;
        }
        Ok(())
    }

    /// End the lottery on-chain, then complete the raffle.
    async fn finish(&self, raffle: &Raffle, now: DateTime<Utc>) -> Result<()> {
        let Ok(lottery_id) = u64::try_from(raffle.id) else {
            return Ok(());
        };
        let info = match self.chain.get_lottery(lottery_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(raffle_id = raffle.id, "lottery missing on-chain, skipping completion");
                return Ok(());
            }
            Err(err) => {
                self.metrics.inc_chain_failure();
                warn!(?err, raffle_id = raffle.id, "failed to read lottery");
                return Ok(());
            }
        };
        if !info.is_active {
            return self.complete(raffle.id, info.is_drawn, now).await;
        }
        match self.chain.end_lottery(lottery_id).await {
            Ok(tx) => {
                info!(raffle_id = raffle.id, %tx, "lottery ended");
                self.complete(raffle.id, false, now).await
            }
            Err(err) if err.revert() == Some(LotteryRevert::NoTickets) => {
                info!(raffle_id = raffle.id, "lottery had no tickets, closing without draw");
                self.complete(raffle.id, false, now).await
            }
            Err(err) => {
                self.metrics.inc_chain_failure();
                warn!(?err, raffle_id = raffle.id, "failed to end lottery");
                Ok(())
            }
        }
    }

    async fn complete(&self, id: i64, drawn: bool, now: DateTime<Utc>) -> Result<()> {
        if self
            .store
            .run(move |db| db.complete_raffle(id, drawn, now))
            .await?
        {
            self.metrics.inc_completed();
            info!(raffle_id = id, drawn, "raffle completed");
        }
        Ok(())
    }

    /// Create the lottery on-chain if needed, then activate. Returns false when the
    /// raffle stays pending.
    async fn activate(&self, raffle: &Raffle, now: DateTime<Utc>) -> Result<bool> {
        let id = raffle.id;
        if !raffle.is_created {
            let Ok(lottery_id) = u64::try_from(id) else {
                return Ok(false);
            };
            let tx = match self
                .chain
                .create_lottery(lottery_id, raffle.max_tickets)
                .await
            {
                Ok(tx) => tx,
                Err(ChainError::LotteryExists(_)) => raffle.transaction_hash.clone().unwrap_or_default(),
                Err(err) => {
                    self.metrics.inc_chain_failure();
                    warn!(?err, raffle_id = id, "failed to create lottery, will retry");
                    return Ok(false);
                }
            };
            self.store
                .run(move |db| db.mark_raffle_created(id, &tx, now))
                .await?;
        }
        let activated = self
            .store
            .run(move |db| db.activate_raffle(id, now))
            .await?;
        if activated {
            self.metrics.inc_activated();
            info!(raffle_id = id, "raffle activated");
        }
        Ok(activated)
    }

    async fn fill_pool(&self, target: u64, now: DateTime<Utc>) -> Result<()> {
        let active = self
            .store
            .run(|db| db.count_raffles(RaffleStatus::Active))
            .await?;
        if active >= target {
            if active > target {
                warn!(active, target, "more raffles active than the pool target");
            }
            return Ok(());
        }

        let short = target - active;
        let pending = self
            .store
            .run(move |db| db.pending_raffles(None, short))
            .await?;
        // Pending raffles still count toward the shortfall while their creation retries.
        let missing = short.saturating_sub(pending.len() as u64);
        let template = self.template;
        let created = self
            .store
            .run(move |db| {
                (0..missing)
                    .map(|_| db.insert_raffle(&template.pooled(now), now))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;
        for _ in &created {
            self.metrics.inc_created();
        }

        let mut activated = 0u64;
        for raffle in pending.iter().chain(&created) {
            if self.activate(raffle, now).await? {
                activated += 1;
            }
        }
        info!(active, target, activated, new = created.len(), "raffle pool topped up");
        Ok(())
    }

    async fn schedule_days(&self, horizon_days: u32, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        let days = today
            .iter_days()
            .take(horizon_days as usize + 1)
            .collect::<Vec<NaiveDate>>();
        let Some(last) = days.last().copied() else {
            return Ok(());
        };
        let (from, _) = daily_window(today);
        let (_, to) = daily_window(last);
        let template = self.template;
        let created = self
            .store
            .run(move |db| {
                let scheduled = db
                    .raffle_start_dates(from, to)?
                    .into_iter()
                    .map(|start| start.date_naive())
                    .collect::<HashSet<_>>();
                let mut created = 0u64;
                for day in days.into_iter().filter(|day| !scheduled.contains(day)) {
                    db.insert_raffle(&template.daily(day), now)?;
                    created += 1;
                }
                Ok::<_, StoreError>(created)
            })
            .await?;
        for _ in 0..created {
            self.metrics.inc_created();
        }
        if created > 0 {
            info!(created, horizon_days, "daily raffles scheduled");
        }
        Ok(())
    }

    async fn activate_due(&self, now: DateTime<Utc>) -> Result<()> {
        let active = self
            .store
            .run(|db| db.count_raffles(RaffleStatus::Active))
            .await?;
        if active > 0 {
            return Ok(());
        }
        let due = self
            .store
            .run(move |db| db.pending_raffles(Some(now), 1))
            .await?;
        match due.first() {
            Some(raffle) => {
                self.activate(raffle, now).await?;
            }
            None => warn!("no pending raffle is due for activation"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use odds_contract::mocks::MockChain;
    use odds_contract::LotteryInfo;

    fn scheduler(
        chain: &MockChain,
        policy: RotationPolicy,
    ) -> (Scheduler<MockChain>, Store, Arc<LifecycleMetrics>) {
        let store = Store::open_in_memory().unwrap();
        let metrics = Arc::new(LifecycleMetrics::default());
        let template = RaffleTemplate {
            max_tickets: 5,
            ..RaffleTemplate::default()
        };
        (
            Scheduler::new(
                store.clone(),
                chain.clone(),
                policy,
                template,
                Duration::from_secs(60),
                metrics.clone(),
            ),
            store,
            metrics,
        )
    }

    async fn count(store: &Store, status: RaffleStatus) -> u64 {
        store.run(move |db| db.count_raffles(status)).await.unwrap()
    }

    async fn raffle(store: &Store, id: i64) -> Raffle {
        store.run(move |db| db.raffle(id)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn pool_fills_to_target() {
        let chain = MockChain::new();
        let (scheduler, store, metrics) =
            scheduler(&chain, RotationPolicy::Pool { active_target: 3 });
        scheduler.tick(Utc::now()).await;

        assert_eq!(count(&store, RaffleStatus::Active).await, 3);
        assert_eq!(chain.created(), vec![1, 2, 3]);
        assert!(raffle(&store, 2).await.is_created);

        scheduler.tick(Utc::now()).await;
        assert_eq!(chain.created().len(), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.raffles_created, 3);
        assert_eq!(snapshot.raffles_activated, 3);
    }

    #[tokio::test]
    async fn sold_out_raffles_end_before_completion() {
        let chain = MockChain::new();
        let (scheduler, store, _) = scheduler(&chain, RotationPolicy::Pool { active_target: 1 });
        scheduler.tick(Utc::now()).await;

        let now = Utc::now();
        store
            .run(move |db| db.add_raffle_tickets(1, 5, now))
            .await
            .unwrap();
        chain.set_tickets_sold(1, 5);
        scheduler.tick(Utc::now()).await;

        assert_eq!(chain.ended(), vec![1]);
        assert_eq!(raffle(&store, 1).await.status, RaffleStatus::Completed);
        assert_eq!(raffle(&store, 2).await.status, RaffleStatus::Active);
    }

    #[tokio::test]
    async fn lottery_without_tickets_closes_undrawn() {
        let chain = MockChain::new();
        let (scheduler, store, _) = scheduler(&chain, RotationPolicy::Pool { active_target: 1 });
        scheduler.tick(Utc::now()).await;

        // Sold out off-chain only; the contract refuses to draw.
        let now = Utc::now();
        store
            .run(move |db| db.add_raffle_tickets(1, 5, now))
            .await
            .unwrap();
        scheduler.tick(Utc::now()).await;

        let closed = raffle(&store, 1).await;
        assert_eq!(closed.status, RaffleStatus::Completed);
        assert!(!closed.is_distributed);
        assert!(chain.ended().is_empty());
    }

    #[tokio::test]
    async fn inactive_lottery_completes_with_draw_state() {
        let chain = MockChain::new();
        let (scheduler, store, _) = scheduler(&chain, RotationPolicy::Pool { active_target: 1 });
        scheduler.tick(Utc::now()).await;

        chain.insert(LotteryInfo {
            id: 1,
            max_tickets: 5,
            tickets_sold: 5,
            is_active: false,
            is_drawn: true,
            created_at: 0,
        });
        let now = Utc::now();
        store
            .run(move |db| db.add_raffle_tickets(1, 5, now))
            .await
            .unwrap();
        scheduler.tick(Utc::now()).await;

        let closed = raffle(&store, 1).await;
        assert_eq!(closed.status, RaffleStatus::Completed);
        assert!(closed.is_distributed);
        assert!(chain.ended().is_empty());
    }

    #[tokio::test]
    async fn failed_creation_stays_pending_without_duplicates() {
        let chain = MockChain::new();
        chain.fail_create(2);
        let (scheduler, store, metrics) =
            scheduler(&chain, RotationPolicy::Pool { active_target: 2 });
        scheduler.tick(Utc::now()).await;
        scheduler.tick(Utc::now()).await;

        assert_eq!(count(&store, RaffleStatus::Active).await, 1);
        assert_eq!(count(&store, RaffleStatus::Pending).await, 1);
        assert!(!raffle(&store, 2).await.is_created);
        assert_eq!(metrics.snapshot().chain_failures, 2);
    }

    #[tokio::test]
    async fn failed_end_is_retried() {
        let chain = MockChain::new();
        let (scheduler, store, _) = scheduler(&chain, RotationPolicy::Pool { active_target: 1 });
        scheduler.tick(Utc::now()).await;

        chain.fail_end(1);
        chain.set_tickets_sold(1, 5);
        let now = Utc::now();
        store
            .run(move |db| db.add_raffle_tickets(1, 5, now))
            .await
            .unwrap();
        scheduler.tick(Utc::now()).await;
        assert_eq!(raffle(&store, 1).await.status, RaffleStatus::Active);
    }

    #[tokio::test]
    async fn daily_rotation_schedules_and_rolls_over() {
        let chain = MockChain::new();
        let (scheduler, store, _) =
            scheduler(&chain, RotationPolicy::Daily { horizon_days: 2 });
        let day_one = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        scheduler.tick(day_one).await;
        scheduler.tick(day_one).await;
        assert_eq!(count(&store, RaffleStatus::Pending).await, 2);
        let first = raffle(&store, 1).await;
        assert_eq!(first.title, "Daily Raffle 2024-05-01");
        assert_eq!(first.status, RaffleStatus::Active);
        assert!(first.is_created);

        scheduler.tick(day_one + ChronoDuration::days(1)).await;
        assert_eq!(raffle(&store, 1).await.status, RaffleStatus::Completed);
        let second = raffle(&store, 2).await;
        assert_eq!(second.title, "Daily Raffle 2024-05-02");
        assert_eq!(second.status, RaffleStatus::Active);
        assert_eq!(count(&store, RaffleStatus::Pending).await, 2);
    }
}
