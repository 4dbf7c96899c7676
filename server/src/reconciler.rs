//! Applies confirmed lottery events to the database.
//!
//! Every event is applied in one transaction together with the listener cursor, and
//! every step checks what is already recorded first, so the listener and the webhook
//! can both deliver the same log without double counting.

use crate::metrics::LifecycleMetrics;
use crate::store::{Db, RaffleSettlement, Store, StoreError, TicketUpdate};
use chrono::{DateTime, Utc};
use odds_contract::{Backoff, Cursor, ListenerUpdate, LotteryEvent, LotteryOutcome, ObservedEvent};
use odds_types::{
    NewTicket, NewTransaction, TicketGroup, TransactionKind, TransactionStatus, Usdc,
    WalletAddress,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Cursor name of the contract event listener.
pub const LISTENER_CURSOR: &str = "lottery";

const APPLY_ATTEMPTS: usize = 5;

/// `count` consecutive tickets bought in one on-chain transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketPurchase {
    pub lottery_id: u64,
    pub buyer: WalletAddress,
    pub first_ticket: u64,
    pub count: u64,
    pub transaction_hash: String,
    pub nonce: Option<u64>,
    pub to: Option<WalletAddress>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurchaseApplied {
    Recorded,
    Duplicate,
    UnknownRaffle,
}

fn raffle_id(lottery_id: u64) -> Option<i64> {
    i64::try_from(lottery_id).ok()
}

pub(crate) fn apply_ticket_purchase(
    db: &mut Db<'_>,
    purchase: &TicketPurchase,
    now: DateTime<Utc>,
) -> Result<PurchaseApplied, StoreError> {
    let Some(id) = raffle_id(purchase.lottery_id) else {
        return Ok(PurchaseApplied::UnknownRaffle);
    };
    let Some(raffle) = db.lock_raffle(id)? else {
        return Ok(PurchaseApplied::UnknownRaffle);
    };
    let (buyer, _) = db.get_or_create_user(&purchase.buyer, now)?;
    let hash = purchase.transaction_hash.as_str();

    let mut recorded = 0u64;
    let last = purchase.first_ticket.saturating_add(purchase.count);
    for number in purchase.first_ticket..last {
        match db.ticket_by_number(raffle.id, number)? {
            Some(ticket) if ticket.purchase_transaction_hash.as_deref() == Some(hash) => {}
            Some(ticket) => {
                // The chain decides ownership; a reservation held by another
                // wallet under this number moves to the buyer.
                if ticket.owner_id != buyer.id {
                    db.reassign_ticket(ticket.id, buyer.id, now)?;
                    db.remove_user_tickets(ticket.owner_id, 1, now)?;
                    db.add_user_tickets(buyer.id, 1, now)?;
                    warn!(
                        raffle_id = raffle.id,
                        number,
                        previous_owner = ticket.owner_id,
                        buyer = buyer.id,
                        "reserved ticket bought on-chain by another wallet"
                    );
                }
                db.update_ticket(
                    ticket.id,
                    &TicketUpdate {
                        purchase_transaction_hash: Some(hash.to_string()),
                        ..Default::default()
                    },
                    now,
                )?;
                recorded += 1;
            }
            None => {
                db.insert_ticket(
                    &NewTicket {
                        ticket_number: number,
                        raffle_id: raffle.id,
                        owner_id: buyer.id,
                        referral_code_id: None,
                        purchase_transaction_hash: Some(hash.to_string()),
                        is_auto_enrolled: false,
                        group: None,
                    },
                    now,
                )?;
                db.raise_raffle_tickets(raffle.id, number, now)?;
                db.add_user_tickets(buyer.id, 1, now)?;
                recorded += 1;
            }
        }
    }
    if recorded == 0 {
        return Ok(PurchaseApplied::Duplicate);
    }

    let amount = raffle.ticket_price.checked_mul(recorded).ok_or_else(|| {
        StoreError::Corrupt(format!("purchase amount overflow in raffle {}", raffle.id))
    })?;
    if let Some(existing) = db.transaction_by_hash(hash, TransactionKind::TicketPurchase, Some(raffle.id))? {
        db.update_transaction(
            existing.id,
            TransactionStatus::Completed,
            existing.amount.saturating_add(amount),
            None,
            now,
        )?;
    } else if let Some(reservation) = db.pending_reservation(&buyer.wallet_address, raffle.id)? {
        db.attach_transaction_hash(reservation.id, hash, purchase.nonce, now)?;
        db.update_transaction(reservation.id, TransactionStatus::Completed, amount, None, now)?;
    } else {
        let mut tx =
            NewTransaction::new(TransactionKind::TicketPurchase, TransactionStatus::Completed, amount);
        tx.transaction_hash = hash.to_string();
        tx.description = Some(format!("Purchased {recorded} tickets in raffle {}", raffle.id));
        tx.from_address = Some(buyer.wallet_address.clone());
        tx.to_address = purchase.to.clone();
        tx.raffle_id = Some(raffle.id);
        tx.nonce = purchase.nonce;
        tx.metadata = Some(json!({
            "firstTicket": purchase.first_ticket,
            "ticketCount": recorded,
        }));
        db.insert_transaction(&tx, now)?;
    }
    debug!(raffle_id = raffle.id, recorded, hash, "ticket purchase reconciled");
    Ok(PurchaseApplied::Recorded)
}

/// Mark the raffle as existing on-chain. Returns false when nothing changed.
pub(crate) fn apply_lottery_created(
    db: &mut Db<'_>,
    lottery_id: u64,
    transaction_hash: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let Some(raffle) = raffle_id(lottery_id).map(|id| db.raffle(id)).transpose()?.flatten() else {
        return Ok(false);
    };
    if raffle.is_created && raffle.transaction_hash.as_deref() == Some(transaction_hash) {
        return Ok(false);
    }
    db.mark_raffle_created(raffle.id, transaction_hash, now)?;
    Ok(true)
}

/// Record the draw: prize tiers, winner totals, payouts and the platform fee.
pub(crate) fn apply_lottery_ended(
    db: &mut Db<'_>,
    outcome: &LotteryOutcome,
    transaction_hash: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let Some(raffle) = raffle_id(outcome.lottery_id)
        .map(|id| db.lock_raffle(id))
        .transpose()?
        .flatten()
    else {
        return Ok(false);
    };
    if raffle.is_distributed && raffle.transaction_hash.as_deref() == Some(transaction_hash) {
        return Ok(false);
    }

    let tiers = [
        (
            TicketGroup::Group1,
            &outcome.winning_ticket_ids,
            outcome.first_place_prize_per_ticket,
        ),
        (
            TicketGroup::Group2,
            &outcome.second_place_ticket_ids,
            outcome.second_place_prize_per_ticket,
        ),
    ];
    let mut winner = None;
    for (group, numbers, prize) in tiers {
        for number in numbers {
            let Some(ticket) = db.ticket_by_number(raffle.id, *number)? else {
                warn!(raffle_id = raffle.id, number, "prize ticket not found");
                continue;
            };
            db.update_ticket(
                ticket.id,
                &TicketUpdate {
                    group: Some(group),
                    prize_amount: Some(prize),
                    is_distributed: Some(true),
                    ..Default::default()
                },
                now,
            )?;
            db.record_user_win(ticket.owner_id, prize, now)?;
            if group == TicketGroup::Group1 && winner.is_none() {
                winner = Some((ticket.owner_id, ticket.id));
            }

            let owner = db.user(ticket.owner_id)?;
            let mut payout =
                NewTransaction::new(TransactionKind::PrizeDistribution, TransactionStatus::Completed, prize);
            payout.transaction_hash = transaction_hash.to_string();
            payout.description = Some(format!(
                "{group} prize for ticket {number} in raffle {}",
                raffle.id
            ));
            payout.to_address = owner.map(|owner| owner.wallet_address);
            payout.raffle_id = Some(raffle.id);
            payout.ticket_id = Some(ticket.id);
            db.insert_transaction(&payout, now)?;
        }
    }

    db.settle_raffle(
        raffle.id,
        &RaffleSettlement {
            winner_id: winner.map(|(owner, _)| owner),
            winning_ticket_id: winner.map(|(_, ticket)| ticket),
            total_prize_amount: outcome.prize_pool,
            platform_fee: outcome.platform_cut,
            distributed_amount: outcome.distributed_pool,
            transaction_hash: transaction_hash.to_string(),
        },
        now,
    )?;

    let mut fee =
        NewTransaction::new(TransactionKind::PlatformFee, TransactionStatus::Completed, outcome.platform_cut);
    fee.transaction_hash = transaction_hash.to_string();
    fee.description = Some(format!("Platform fee for raffle {}", raffle.id));
    fee.raffle_id = Some(raffle.id);
    fee.metadata = Some(json!({
        "prizePool": outcome.prize_pool,
        "distributedPool": outcome.distributed_pool,
        "totalTicketsSold": outcome.total_tickets_sold,
    }));
    db.insert_transaction(&fee, now)?;

    info!(
        raffle_id = raffle.id,
        winners = outcome.winning_ticket_ids.len(),
        second_place = outcome.second_place_ticket_ids.len(),
        distributed = %outcome.distributed_pool,
        "raffle settled"
    );
    Ok(true)
}

/// Apply one decoded event. Returns false when it had already been applied.
fn apply_event(
    db: &mut Db<'_>,
    observed: &ObservedEvent,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let hash = observed.meta.transaction_hash.as_str();
    match &observed.event {
        LotteryEvent::LotteryCreated { lottery_id, .. } => {
            apply_lottery_created(db, *lottery_id, hash, now)
        }
        LotteryEvent::TicketPurchased {
            lottery_id,
            buyer,
            ticket_id,
        } => {
            let purchase = TicketPurchase {
                lottery_id: *lottery_id,
                buyer: buyer.clone(),
                first_ticket: *ticket_id,
                count: 1,
                transaction_hash: hash.to_string(),
                nonce: observed.meta.nonce,
                to: observed.meta.to.clone(),
            };
            match apply_ticket_purchase(db, &purchase, now)? {
                PurchaseApplied::Recorded => Ok(true),
                PurchaseApplied::Duplicate => Ok(false),
                PurchaseApplied::UnknownRaffle => {
                    warn!(lottery_id, "ticket purchase for unknown raffle");
                    Ok(false)
                }
            }
        }
        LotteryEvent::LotteryEnded(outcome) => apply_lottery_ended(db, outcome, hash, now),
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    metrics: Arc<LifecycleMetrics>,
}

impl Reconciler {
    pub fn new(store: Store, metrics: Arc<LifecycleMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Where the listener should resume.
    pub async fn cursor(&self) -> Result<Option<Cursor>, StoreError> {
        self.store.run(|db| db.cursor(LISTENER_CURSOR)).await
    }

    fn count(&self, observed: &ObservedEvent, applied: bool) {
        if applied {
            self.metrics.inc_applied();
            info!(
                event = observed.event.name(),
                lottery_id = observed.event.lottery_id(),
                tx = %observed.meta.transaction_hash,
                "lottery event applied"
            );
        } else {
            self.metrics.inc_skipped();
            debug!(
                event = observed.event.name(),
                lottery_id = observed.event.lottery_id(),
                "lottery event already applied"
            );
        }
    }

    /// Apply an event delivered outside the listener (the webhook).
    pub async fn apply_observed(&self, observed: ObservedEvent) -> Result<bool, StoreError> {
        let now = Utc::now();
        let (observed, applied) = self
            .store
            .run(move |db| {
                let applied = apply_event(db, &observed, now)?;
                Ok::<_, StoreError>((observed, applied))
            })
            .await?;
        self.count(&observed, applied);
        Ok(applied)
    }

    /// Apply a listener update and persist its cursor in the same transaction.
    pub async fn apply_update(&self, update: ListenerUpdate) -> Result<(), StoreError> {
        let now = Utc::now();
        match update {
            ListenerUpdate::Event { event, cursor } => {
                let (event, applied) = self
                    .store
                    .run(move |db| {
                        let applied = apply_event(db, &event, now)?;
                        db.save_cursor(LISTENER_CURSOR, cursor, now)?;
                        Ok::<_, StoreError>((event, applied))
                    })
                    .await?;
                self.count(&event, applied);
            }
            ListenerUpdate::Checkpoint(cursor) => {
                self.store
                    .run(move |db| db.save_cursor(LISTENER_CURSOR, cursor, now))
                    .await?;
            }
        }
        Ok(())
    }

    /// Drain listener updates until the channel closes.
    pub async fn run(self, mut updates: mpsc::Receiver<ListenerUpdate>) {
        info!("reconciler started");
        while let Some(update) = updates.recv().await {
            let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5));
            for attempt in 1..=APPLY_ATTEMPTS {
                match self.apply_update(update.clone()).await {
                    Ok(()) => break,
                    Err(err) if attempt < APPLY_ATTEMPTS => {
                        warn!(?err, attempt, "failed to apply listener update, retrying");
                        sleep(backoff.next_delay()).await;
                    }
                    Err(err) => {
                        self.metrics.inc_event_failure();
                        error!(?err, ?update, "dropping listener update");
                    }
                }
            }
        }
        info!("listener channel closed, reconciler stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odds_contract::EventMeta;
    use odds_types::{RaffleStatus, RaffleTemplate};

    fn wallet(byte: u8) -> WalletAddress {
        WalletAddress::from_bytes([byte; 20])
    }

    fn meta(hash: &str, block: u64) -> EventMeta {
        EventMeta {
            block_number: block,
            log_index: 0,
            transaction_hash: hash.to_string(),
            ..Default::default()
        }
    }

    fn purchased(lottery_id: u64, buyer: u8, ticket_id: u64, hash: &str) -> ObservedEvent {
        ObservedEvent {
            event: LotteryEvent::TicketPurchased {
                lottery_id,
                buyer: wallet(buyer),
                ticket_id,
            },
            meta: meta(hash, 10),
        }
    }

    async fn setup() -> (Reconciler, Store, Arc<LifecycleMetrics>, i64) {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let raffle = store
            .run(move |db| {
                let raffle = db.insert_raffle(&RaffleTemplate::default().pooled(now), now)?;
                db.activate_raffle(raffle.id, now)?;
                Ok::<_, StoreError>(raffle.id)
            })
            .await
            .unwrap();
        let metrics = Arc::new(LifecycleMetrics::default());
        (
            Reconciler::new(store.clone(), metrics.clone()),
            store,
            metrics,
            raffle,
        )
    }

    #[tokio::test]
    async fn ticket_purchases_are_idempotent() {
        let (reconciler, store, metrics, raffle) = setup().await;
        let id = raffle as u64;
        assert!(reconciler.apply_observed(purchased(id, 1, 1, "0xa")).await.unwrap());
        assert!(reconciler.apply_observed(purchased(id, 1, 2, "0xa")).await.unwrap());
        assert!(!reconciler.apply_observed(purchased(id, 1, 2, "0xa")).await.unwrap());
        assert!(!reconciler.apply_observed(purchased(404, 1, 1, "0xb")).await.unwrap());

        let (raffle, txs, user) = store
            .run(move |db| {
                Ok::<_, StoreError>((
                    db.raffle(raffle)?,
                    db.wallet_transactions(&wallet(1))?,
                    db.user_by_wallet(&wallet(1))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(raffle.unwrap().total_tickets, 2);
        assert_eq!(user.unwrap().total_tickets_purchased, 2);
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, Usdc::from_units(2));
        assert_eq!(txs[0].status, TransactionStatus::Completed);
        assert_eq!(txs[0].transaction_hash, "0xa");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_applied, 2);
        assert_eq!(snapshot.events_skipped, 2);
    }

    #[tokio::test]
    async fn purchase_completes_matching_reservation() {
        let (_, store, _, raffle) = setup().await;
        let now = Utc::now();
        let applied = store
            .run(move |db| {
                let user = db.insert_user(&wallet(3), now)?;
                db.insert_ticket(
                    &NewTicket {
                        ticket_number: 1,
                        raffle_id: raffle,
                        owner_id: user.id,
                        referral_code_id: None,
                        purchase_transaction_hash: None,
                        is_auto_enrolled: false,
                        group: None,
                    },
                    now,
                )?;
                db.add_raffle_tickets(raffle, 1, now)?;
                let mut reservation = NewTransaction::new(
                    TransactionKind::TicketPurchase,
                    TransactionStatus::Pending,
                    Usdc::from_units(1),
                );
                reservation.from_address = Some(wallet(3));
                reservation.raffle_id = Some(raffle);
                db.insert_transaction(&reservation, now)?;
                apply_ticket_purchase(
                    db,
                    &TicketPurchase {
                        lottery_id: raffle as u64,
                        buyer: wallet(3),
                        first_ticket: 1,
                        count: 1,
                        transaction_hash: "0xbuy".into(),
                        nonce: Some(9),
                        to: None,
                    },
                    now,
                )
            })
            .await
            .unwrap();
        assert_eq!(applied, PurchaseApplied::Recorded);

        let (txs, ticket, raffle) = store
            .run(move |db| {
                Ok::<_, StoreError>((
                    db.wallet_transactions(&wallet(3))?,
                    db.ticket_by_number(raffle, 1)?,
                    db.raffle(raffle)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].transaction_hash, "0xbuy");
        assert_eq!(txs[0].nonce, Some(9));
        assert_eq!(txs[0].status, TransactionStatus::Completed);
        assert_eq!(
            ticket.unwrap().purchase_transaction_hash.as_deref(),
            Some("0xbuy")
        );
        assert_eq!(raffle.unwrap().total_tickets, 1);
    }

    #[tokio::test]
    async fn on_chain_buyer_takes_over_abandoned_reservation() {
        let (reconciler, store, _, raffle) = setup().await;
        let now = Utc::now();
        store
            .run(move |db| {
                let holder = db.insert_user(&wallet(1), now)?;
                db.insert_ticket(
                    &NewTicket {
                        ticket_number: 1,
                        raffle_id: raffle,
                        owner_id: holder.id,
                        referral_code_id: None,
                        purchase_transaction_hash: None,
                        is_auto_enrolled: false,
                        group: None,
                    },
                    now,
                )?;
                db.add_raffle_tickets(raffle, 1, now)?;
                db.add_user_tickets(holder.id, 1, now)
            })
            .await
            .unwrap();

        let id = raffle as u64;
        assert!(reconciler.apply_observed(purchased(id, 2, 1, "0xb")).await.unwrap());
        let ended = ObservedEvent {
            event: LotteryEvent::LotteryEnded(LotteryOutcome {
                lottery_id: id,
                winning_ticket_ids: vec![1],
                second_place_ticket_ids: vec![],
                prize_pool: Usdc::from_units(1),
                platform_cut: Usdc::from_micros(50_000),
                distributed_pool: Usdc::from_micros(950_000),
                total_tickets_sold: 1,
                first_place_prize_per_ticket: Usdc::from_micros(950_000),
                second_place_prize_per_ticket: Usdc::ZERO,
            }),
            meta: meta("0xend", 20),
        };
        assert!(reconciler.apply_observed(ended).await.unwrap());

        let (ticket, holder, buyer, raffle) = store
            .run(move |db| {
                Ok::<_, StoreError>((
                    db.ticket_by_number(raffle, 1)?,
                    db.user_by_wallet(&wallet(1))?,
                    db.user_by_wallet(&wallet(2))?,
                    db.raffle(raffle)?,
                ))
            })
            .await
            .unwrap();
        let (ticket, holder, buyer) = (ticket.unwrap(), holder.unwrap(), buyer.unwrap());
        assert_eq!(ticket.owner_id, buyer.id);
        assert_eq!(ticket.purchase_transaction_hash.as_deref(), Some("0xb"));
        assert_eq!(buyer.total_tickets_purchased, 1);
        assert_eq!(buyer.total_raffles_won, 1);
        assert_eq!(holder.total_tickets_purchased, 0);
        assert_eq!(holder.total_raffles_won, 0);
        assert_eq!(raffle.unwrap().winner_id, Some(buyer.id));
    }

    #[tokio::test]
    async fn lottery_end_settles_once() {
        let (reconciler, store, _, raffle) = setup().await;
        let id = raffle as u64;
        for (buyer, ticket) in [(1u8, 1u64), (2, 2), (3, 3)] {
            reconciler
                .apply_observed(purchased(id, buyer, ticket, &format!("0x{ticket}")))
                .await
                .unwrap();
        }
        let ended = ObservedEvent {
            event: LotteryEvent::LotteryEnded(LotteryOutcome {
                lottery_id: id,
                winning_ticket_ids: vec![2],
                second_place_ticket_ids: vec![1, 3],
                prize_pool: Usdc::from_units(3),
                platform_cut: Usdc::from_micros(150_000),
                distributed_pool: Usdc::from_micros(2_850_000),
                total_tickets_sold: 3,
                first_place_prize_per_ticket: Usdc::from_units(2),
                second_place_prize_per_ticket: Usdc::from_micros(425_000),
            }),
            meta: meta("0xend", 20),
        };
        assert!(reconciler.apply_observed(ended.clone()).await.unwrap());
        assert!(!reconciler.apply_observed(ended).await.unwrap());

        let (raffle, winner, second, winner_txs) = store
            .run(move |db| {
                Ok::<_, StoreError>((
                    db.raffle(raffle)?,
                    db.user_by_wallet(&wallet(2))?,
                    db.ticket_by_number(raffle, 3)?,
                    db.wallet_transactions(&wallet(2))?,
                ))
            })
            .await
            .unwrap();
        let raffle = raffle.unwrap();
        let winner = winner.unwrap();
        assert_eq!(raffle.status, RaffleStatus::Completed);
        assert!(raffle.is_distributed);
        assert_eq!(raffle.winner_id, Some(winner.id));
        assert_eq!(raffle.platform_fee, Usdc::from_micros(150_000));
        assert_eq!(raffle.transaction_hash.as_deref(), Some("0xend"));
        assert_eq!(winner.total_raffles_won, 1);
        assert_eq!(winner.total_prize_won, Usdc::from_units(2));

        let second = second.unwrap();
        assert_eq!(second.group, Some(TicketGroup::Group2));
        assert_eq!(second.prize_amount, Usdc::from_micros(425_000));

        let payouts = winner_txs
            .iter()
            .filter(|tx| tx.kind == TransactionKind::PrizeDistribution)
            .count();
        assert_eq!(payouts, 1);
    }

    #[tokio::test]
    async fn listener_updates_advance_the_cursor() {
        let (reconciler, store, _, raffle) = setup().await;
        assert_eq!(reconciler.cursor().await.unwrap(), None);

        let created = ObservedEvent {
            event: LotteryEvent::LotteryCreated {
                lottery_id: raffle as u64,
                max_tickets: 1000,
            },
            meta: meta("0xcreate", 5),
        };
        let cursor = Cursor {
            block: 5,
            log_index: Some(0),
        };
        reconciler
            .apply_update(ListenerUpdate::Event {
                event: created,
                cursor,
            })
            .await
            .unwrap();
        assert_eq!(reconciler.cursor().await.unwrap(), Some(cursor));
        let stored = store.run(move |db| db.raffle(raffle)).await.unwrap().unwrap();
        assert!(stored.is_created);
        assert_eq!(stored.transaction_hash.as_deref(), Some("0xcreate"));

        reconciler
            .apply_update(ListenerUpdate::Checkpoint(Cursor::at_block(9)))
            .await
            .unwrap();
        assert_eq!(reconciler.cursor().await.unwrap(), Some(Cursor::at_block(9)));
    }

    #[tokio::test]
    async fn run_drains_the_channel() {
        let (reconciler, _, metrics, raffle) = setup().await;
        let (tx, rx) = mpsc::channel(4);
        tx.send(ListenerUpdate::Event {
            event: purchased(raffle as u64, 1, 1, "0xrun"),
            cursor: Cursor::at_block(1),
        })
        .await
        .unwrap();
        drop(tx);
        reconciler.run(rx).await;
        assert_eq!(metrics.snapshot().events_applied, 1);
    }
}
