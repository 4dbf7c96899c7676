//! Raffle reads, ticket purchase, and wallet activity.
//!
//! A purchase is planned against a snapshot, the unsigned contract calls are built
//! (which proves every target lottery exists on-chain), and then the reservation
//! is committed in one transaction that re-checks the plan under row locks. The
//! buyer signs and submits the calls; the reconciler later matches the on-chain
//! purchase to the reservation.

use crate::error::ApiError;
use crate::services::auth::AuthUser;
use crate::services::referral::{ensure_user_code, record_use, ReferralUse};
use crate::services::Page;
use crate::store::{Db, Store, StoreError, TicketFilter, NO_LIMIT};
use chrono::{DateTime, Utc};
use odds_contract::{LotteryChain, PurchaseCalls};
use odds_types::{
    NewTicket, NewTransaction, Raffle, RaffleStatus, RaffleTemplate, SortOrder, Ticket,
    TransactionKind, TransactionStatus, Usdc, WalletAddress,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

pub const MAX_AUTO_ENTRY: u64 = 10;

/// Stablecoin the buyer pays with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentToken {
    #[default]
    Usdc,
    Usdt,
}

impl PaymentToken {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentToken::Usdc => "USDC",
            PaymentToken::Usdt => "USDT",
        }
    }
}

impl fmt::Display for PaymentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentToken {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USDC" => Ok(PaymentToken::Usdc),
            "USDT" => Ok(PaymentToken::Usdt),
            _ => Err(ApiError::bad_request(format!("Unsupported token {s}"))),
        }
    }
}

fn default_auto_entry() -> u64 {
    1
}

fn default_token() -> String {
    PaymentToken::Usdc.as_str().to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub ticket_count: u64,
    pub referral_code: String,
    #[serde(default = "default_auto_entry")]
    pub auto_entry: u64,
    #[serde(default = "default_token")]
    pub token: String,
    pub wallet_address: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub tickets: Vec<Ticket>,
    pub user_referral_code: Option<String>,
    pub contract_tx: PurchaseCalls,
    pub raffle_ids: Vec<i64>,
    pub ticket_count: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoEnrollRequest {
    pub wallet_address: String,
    pub end_date: DateTime<Utc>,
    pub ticket_count: u64,
    #[serde(default = "default_token")]
    pub token: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AutoEnrollTransaction {
    pub id: i64,
    pub amount: Usdc,
}

#[derive(Clone, Debug, Serialize)]
pub struct AutoEnrollReceipt {
    pub success: bool,
    pub transaction: AutoEnrollTransaction,
}

/// Public view of a raffle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaffleSummary {
    pub id: i64,
    pub title: String,
    pub tickets_sold: u64,
    pub max_tickets: u64,
    pub target_amount: Usdc,
    pub prize_pool: Usdc,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<i64>,
    pub winning_ticket: Option<i64>,
    pub ticket_price: Usdc,
    pub status: RaffleStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl From<Raffle> for RaffleSummary {
    fn from(raffle: Raffle) -> Self {
        Self {
            progress: raffle.progress(),
            id: raffle.id,
            title: raffle.title,
            tickets_sold: raffle.total_tickets,
            max_tickets: raffle.max_tickets,
            target_amount: raffle.total_prize_amount,
            prize_pool: raffle.distributed_amount,
            winner: raffle.winner_id,
            winning_ticket: raffle.winning_ticket_id,
            ticket_price: raffle.ticket_price,
            status: raffle.status,
            start_date: raffle.start_date,
            end_date: raffle.end_date,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PastRaffles {
    pub raffles: Vec<RaffleSummary>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaffleTicket {
    pub id: i64,
    pub ticket_number: u64,
    pub owner: WalletAddress,
    pub is_winning: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaffleTickets {
    pub tickets: Vec<RaffleTicket>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaffleWinner {
    pub raffle_id: i64,
    pub winning_ticket_id: i64,
    pub ticket_number: u64,
    pub winner_address: WalletAddress,
    pub prize_amount: Usdc,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount: Usdc,
    pub timestamp: DateTime<Utc>,
    pub raffle_id: Option<i64>,
    pub ticket_id: Option<i64>,
    pub status: TransactionStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total_transactions: u64,
    pub total_spent: Usdc,
    pub tickets_purchased: u64,
    pub raffles_won: u64,
    pub total_prize_won: Usdc,
    pub referral_earnings: Usdc,
    pub by_type: BTreeMap<TransactionKind, u64>,
}

/// Validated purchase arguments.
struct PurchasePlan {
    raffle_id: i64,
    ticket_count: u64,
    auto_entry: u64,
    token: PaymentToken,
    code: String,
    wallet: WalletAddress,
}

fn parse_wallet(raw: &str) -> Result<WalletAddress, ApiError> {
    WalletAddress::parse(raw).map_err(|_| ApiError::bad_request("Invalid wallet address"))
}

/// Target set for a purchase: the raffle plus the next `auto_entry - 1` active ones.
fn target_raffles(
    db: &mut Db<'_>,
    raffle_id: i64,
    auto_entry: u64,
    ticket_count: u64,
) -> Result<Vec<Raffle>, ApiError> {
    let raffle = db
        .lock_raffle(raffle_id)?
        .ok_or_else(|| ApiError::not_found(format!("Raffle with ID {raffle_id} not found")))?;
    if raffle.status != RaffleStatus::Active {
        return Err(ApiError::bad_request("Raffle is not active"));
    }
    let mut raffles = vec![raffle];
    raffles.extend(db.active_raffles_after(raffle_id, auto_entry - 1)?);
    if (raffles.len() as u64) < auto_entry {
        return Err(ApiError::bad_request(format!(
            "Not enough future raffles available for {auto_entry} auto-entries"
        )));
    }
    for raffle in &raffles {
        let remaining = raffle.remaining();
        if remaining < ticket_count {
            return Err(ApiError::bad_request(format!(
                "Only {remaining} tickets available for raffle {}",
                raffle.id
            )));
        }
    }
    Ok(raffles)
}

#[derive(Clone)]
pub struct RaffleService<C: LotteryChain> {
    store: Store,
    chain: C,
    template: RaffleTemplate,
}

impl<C: LotteryChain> RaffleService<C> {
    pub fn new(store: Store, chain: C, template: RaffleTemplate) -> Self {
        Self {
            store,
            chain,
            template,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn current(&self) -> Result<RaffleSummary, ApiError> {
        self.store
            .run(|db| db.raffles_by_status(RaffleStatus::Active, SortOrder::Asc, 0, 1))
            .await?
            .into_iter()
            .next()
            .map(RaffleSummary::from)
            .ok_or_else(|| ApiError::not_found("No active raffle found"))
    }

    pub async fn active(&self) -> Result<Vec<RaffleSummary>, ApiError> {
        let raffles = self
            .store
            .run(|db| db.raffles_by_status(RaffleStatus::Active, SortOrder::Asc, 0, NO_LIMIT))
            .await?;
        Ok(raffles.into_iter().map(RaffleSummary::from).collect())
    }

    pub async fn past(&self, page: Page) -> Result<PastRaffles, ApiError> {
        let (raffles, total) = self
            .store
            .run(move |db| {
                Ok::<_, StoreError>((
                    db.raffles_by_status(
                        RaffleStatus::Completed,
                        SortOrder::Desc,
                        page.offset(),
                        page.limit,
                    )?,
                    db.count_raffles(RaffleStatus::Completed)?,
                ))
            })
            .await?;
        Ok(PastRaffles {
            raffles: raffles.into_iter().map(RaffleSummary::from).collect(),
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    pub async fn by_id(&self, id: i64) -> Result<RaffleSummary, ApiError> {
        self.store
            .run(move |db| db.raffle(id))
            .await?
            .map(RaffleSummary::from)
            .ok_or_else(|| ApiError::not_found(format!("Raffle with ID {id} not found")))
    }

    fn validate_purchase(
        &self,
        user: &AuthUser,
        raffle_id: i64,
        request: &PurchaseRequest,
    ) -> Result<PurchasePlan, ApiError> {
        if request.ticket_count < 1 {
            return Err(ApiError::bad_request("ticketCount must be at least 1"));
        }
        if !(1..=MAX_AUTO_ENTRY).contains(&request.auto_entry) {
            return Err(ApiError::bad_request(format!(
                "autoEntry must be between 1 and {MAX_AUTO_ENTRY}"
            )));
        }
        let token = request.token.parse::<PaymentToken>()?;
        let wallet = parse_wallet(&request.wallet_address)?;
        if wallet != user.wallet_address {
            return Err(ApiError::Unauthorized(
                "walletAddress does not match the signed-in wallet".to_string(),
            ));
        }
        Ok(PurchasePlan {
            raffle_id,
            ticket_count: request.ticket_count,
            auto_entry: request.auto_entry,
            token,
            code: request.referral_code.trim().to_ascii_lowercase(),
            wallet,
        })
    }

    /// Reserve tickets and return the unsigned calls the buyer must submit.
    pub async fn purchase(
        &self,
        user: &AuthUser,
        raffle_id: i64,
        request: PurchaseRequest,
    ) -> Result<PurchaseReceipt, ApiError> {
        let plan = self.validate_purchase(user, raffle_id, &request)?;

        let planned = {
            let code = plan.code.clone();
            let (raffle_id, auto_entry, ticket_count) =
                (plan.raffle_id, plan.auto_entry, plan.ticket_count);
            self.store
                .run(move |db| {
                    if db.referral_code(&code)?.is_none() {
                        return Err(ApiError::bad_request("Invalid referral code"));
                    }
                    let raffles = target_raffles(db, raffle_id, auto_entry, ticket_count)?;
                    Ok(raffles.iter().map(|raffle| raffle.id).collect::<Vec<_>>())
                })
                .await?
        };

        let lottery_ids = planned
            .iter()
            .map(|id| {
                u64::try_from(*id).map_err(|_| ApiError::bad_request(format!("Invalid raffle id {id}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let contract_tx = self
            .chain
            .build_purchase(plan.wallet.clone(), lottery_ids, plan.ticket_count)
            .await?;

        let contract = self.chain.contract_address();
        let user_id = user.id;
        let now = Utc::now();
        let (tickets, user_code) = self
            .store
            .run(move |db| commit_purchase(db, &plan, &planned, user_id, &contract, now))
            .await?;

        let raffle_ids = tickets
            .iter()
            .map(|ticket| ticket.raffle_id)
            .fold(Vec::new(), |mut ids, id| {
                if ids.last() != Some(&id) {
                    ids.push(id);
                }
                ids
            });
        info!(
            user_id,
            raffle_id,
            raffles = raffle_ids.len(),
            tickets = tickets.len(),
            "tickets reserved"
        );
        Ok(PurchaseReceipt {
            tickets,
            user_referral_code: Some(user_code),
            contract_tx,
            raffle_ids,
            ticket_count: request.ticket_count,
        })
    }

    /// Record a standing order to enter future raffles.
    pub async fn auto_enroll(
        &self,
        request: AutoEnrollRequest,
    ) -> Result<AutoEnrollReceipt, ApiError> {
        let wallet = parse_wallet(&request.wallet_address)?;
        let token = request.token.parse::<PaymentToken>()?;
        if request.ticket_count < 1 {
            return Err(ApiError::bad_request("ticketCount must be at least 1"));
        }
        let amount = self
            .template
            .ticket_price
            .checked_mul(request.ticket_count)
            .ok_or_else(|| ApiError::bad_request("ticketCount is too large"))?;

        let now = Utc::now();
        let transaction = self
            .store
            .run(move |db| {
                db.get_or_create_user(&wallet, now)?;
                let mut tx = NewTransaction::new(
                    TransactionKind::AutoEnroll,
                    TransactionStatus::Pending,
                    amount,
                );
                tx.from_address = Some(wallet);
                tx.description = Some(format!(
                    "Auto-enroll {} tickets per raffle until {}",
                    request.ticket_count,
                    request.end_date.to_rfc3339()
                ));
                tx.metadata = Some(json!({
                    "endDate": request.end_date,
                    "ticketCount": request.ticket_count,
                    "token": token.as_str(),
                }));
                db.insert_transaction(&tx, now)
            })
            .await?;
        info!(transaction_id = transaction.id, "auto-enroll recorded");
        Ok(AutoEnrollReceipt {
            success: true,
            transaction: AutoEnrollTransaction {
                id: transaction.id,
                amount: transaction.amount,
            },
        })
    }

    pub async fn user_activity(&self, wallet: &str) -> Result<Vec<ActivityItem>, ApiError> {
        let wallet = parse_wallet(wallet)?;
        let transactions = self
            .store
            .run(move |db| db.wallet_transactions(&wallet))
            .await?;
        Ok(transactions
            .into_iter()
            .map(|tx| ActivityItem {
                id: tx.id,
                kind: tx.kind,
                amount: tx.amount,
                timestamp: tx.created_at,
                raffle_id: tx.raffle_id,
                ticket_id: tx.ticket_id,
                status: tx.status,
            })
            .collect())
    }

    pub async fn user_activity_stats(&self, wallet: &str) -> Result<ActivityStats, ApiError> {
        let wallet = parse_wallet(wallet)?;
        let (transactions, user) = self
            .store
            .run(move |db| {
                Ok::<_, StoreError>((db.wallet_transactions(&wallet)?, db.user_by_wallet(&wallet)?))
            })
            .await?;

        let mut by_type = BTreeMap::new();
        for tx in &transactions {
            *by_type.entry(tx.kind).or_insert(0u64) += 1;
        }
        let total_spent = transactions
            .iter()
            .filter(|tx| {
                tx.kind == TransactionKind::TicketPurchase
                    && tx.status == TransactionStatus::Completed
            })
            .map(|tx| tx.amount)
            .sum();
        Ok(ActivityStats {
            total_transactions: transactions.len() as u64,
            total_spent,
            tickets_purchased: user.as_ref().map_or(0, |u| u.total_tickets_purchased),
            raffles_won: user.as_ref().map_or(0, |u| u.total_raffles_won),
            total_prize_won: user.as_ref().map_or(Usdc::ZERO, |u| u.total_prize_won),
            referral_earnings: user.as_ref().map_or(Usdc::ZERO, |u| u.total_referral_earnings),
            by_type,
        })
    }

    pub async fn raffle_tickets(&self, id: i64, page: Page) -> Result<RaffleTickets, ApiError> {
        let (views, total) = self
            .store
            .run(move |db| {
                if db.raffle(id)?.is_none() {
                    return Err(ApiError::not_found(format!("Raffle with ID {id} not found")));
                }
                let views = db.tickets(TicketFilter::Raffle(id), page.offset(), page.limit)?;
                let total = db.count_tickets(TicketFilter::Raffle(id))?;
                Ok((views, total))
            })
            .await?;
        Ok(RaffleTickets {
            tickets: views
                .into_iter()
                .map(|view| RaffleTicket {
                    id: view.ticket.id,
                    ticket_number: view.ticket.ticket_number,
                    is_winning: view.ticket.is_winning(),
                    owner: view.owner,
                })
                .collect(),
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    pub async fn raffle_winner(&self, id: i64) -> Result<RaffleWinner, ApiError> {
        self.store
            .run(move |db| {
                let completed = db
                    .raffle(id)?
                    .filter(|raffle| raffle.status == RaffleStatus::Completed);
                if completed.is_none() {
                    return Err(ApiError::not_found(format!(
                        "Completed raffle with ID {id} not found"
                    )));
                }
                let view = db.winning_ticket(id)?.ok_or_else(|| {
                    ApiError::not_found(format!("No winning ticket found for raffle {id}"))
                })?;
                Ok(RaffleWinner {
                    raffle_id: id,
                    winning_ticket_id: view.ticket.id,
                    ticket_number: view.ticket.ticket_number,
                    winner_address: view.owner,
                    prize_amount: view.ticket.prize_amount,
                })
            })
            .await
    }

    /// Move a raffle along its lifecycle.
    pub async fn update_raffle(
        &self,
        id: i64,
        status: RaffleStatus,
        is_distributed: Option<bool>,
    ) -> Result<RaffleSummary, ApiError> {
        let now = Utc::now();
        self.store
            .run(move |db| {
                let raffle = db
                    .lock_raffle(id)?
                    .ok_or_else(|| ApiError::not_found(format!("Raffle with ID {id} not found")))?;
                if raffle.status != status && !raffle.status.can_transition_to(status) {
                    return Err(ApiError::Conflict(format!(
                        "Raffle {id} cannot move from {} to {status}",
                        raffle.status
                    )));
                }
                db.set_raffle_status(id, status, is_distributed, now)?;
                db.raffle(id)?
                    .map(RaffleSummary::from)
                    .ok_or_else(|| ApiError::not_found(format!("Raffle with ID {id} not found")))
            })
            .await
    }
}

/// Commit a planned purchase. Returns the new tickets and the buyer's referral code.
fn commit_purchase(
    db: &mut Db<'_>,
    plan: &PurchasePlan,
    planned: &[i64],
    user_id: i64,
    contract: &WalletAddress,
    now: DateTime<Utc>,
) -> Result<(Vec<Ticket>, String), ApiError> {
    let buyer = db
        .user(user_id)?
        .ok_or_else(|| ApiError::Unauthorized("Unknown user".to_string()))?;
    let code = db
        .referral_code(&plan.code)?
        .ok_or_else(|| ApiError::bad_request("Invalid referral code"))?;

    let raffles = target_raffles(db, plan.raffle_id, plan.auto_entry, plan.ticket_count)?;
    if raffles.iter().map(|raffle| raffle.id).ne(planned.iter().copied()) {
        return Err(ApiError::Conflict(
            "Active raffles changed during purchase, please retry".to_string(),
        ));
    }

    let count = plan.ticket_count;
    let mut tickets = Vec::new();
    let mut reward = Usdc::ZERO;
    for (position, raffle) in raffles.iter().enumerate() {
        for offset in 1..=count {
            tickets.push(db.insert_ticket(
                &NewTicket {
                    ticket_number: raffle.total_tickets + offset,
                    raffle_id: raffle.id,
                    owner_id: buyer.id,
                    referral_code_id: Some(code.id),
                    purchase_transaction_hash: None,
                    is_auto_enrolled: position > 0,
                    group: None,
                },
                now,
            )?);
        }
        db.add_raffle_tickets(raffle.id, count, now)?;

        let spent = raffle
            .ticket_price
            .checked_mul(count)
            .ok_or_else(|| ApiError::bad_request("ticketCount is too large"))?;
        reward = reward.saturating_add(raffle.referral_reward(spent));

        let mut reservation =
            NewTransaction::new(TransactionKind::TicketPurchase, TransactionStatus::Pending, spent);
        reservation.description = Some(format!("Reserved {count} tickets in raffle {}", raffle.id));
        reservation.from_address = Some(plan.wallet.clone());
        reservation.to_address = Some(contract.clone());
        reservation.raffle_id = Some(raffle.id);
        reservation.metadata = Some(json!({
            "ticketCount": count,
            "token": plan.token.as_str(),
            "referralCode": code.code,
            "autoEnrolled": position > 0,
        }));
        db.insert_transaction(&reservation, now)?;
    }

    let total = count.saturating_mul(raffles.len() as u64);
    db.add_user_tickets(buyer.id, total, now)?;

    record_use(
        db,
        &code,
        &ReferralUse {
            buyer_id: buyer.id,
            buyer_wallet: &plan.wallet,
            raffle_id: plan.raffle_id,
            tickets: total,
            reward,
            contract,
        },
        now,
    )?;

    let own_code = ensure_user_code(db, buyer.id, now)?;
    Ok((tickets, own_code.code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use odds_contract::mocks::MockChain;
    use crate::reconciler::{apply_ticket_purchase, PurchaseApplied, TicketPurchase};
    use odds_contract::{LotteryInfo, LotteryOutcome};

    fn wallet(byte: u8) -> WalletAddress {
        WalletAddress::from_bytes([byte; 20])
    }

    struct Fixture {
        service: RaffleService<MockChain>,
        store: Store,
        chain: MockChain,
        buyer: AuthUser,
        raffles: Vec<i64>,
    }

    /// `active` raffles registered on-chain, one platform code, and a signed-in buyer.
    async fn fixture(active: usize, max_tickets: u64) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let chain = MockChain::new();
        let now = Utc::now();
        let template = RaffleTemplate {
            max_tickets,
            ..RaffleTemplate::default()
        };
        let (buyer, raffles) = store
            .run(move |db| {
                let buyer = db.insert_user(&wallet(1), now)?;
                db.insert_referral_code("platform", None, true, now)?;
                let mut ids = Vec::new();
                for _ in 0..active {
                    let raffle = db.insert_raffle(&template.pooled(now), now)?;
                    db.activate_raffle(raffle.id, now)?;
                    ids.push(raffle.id);
                }
                Ok::<_, StoreError>((buyer, ids))
            })
            .await
            .unwrap();
        for id in &raffles {
            chain.insert(LotteryInfo {
                id: *id as u64,
                max_tickets,
                tickets_sold: 0,
                is_active: true,
                is_drawn: false,
                created_at: 0,
            });
        }
        Fixture {
            service: RaffleService::new(store.clone(), chain.clone(), template),
            store,
            chain,
            buyer: AuthUser {
                id: buyer.id,
                wallet_address: buyer.wallet_address,
            },
            raffles,
        }
    }

    fn request(count: u64, auto_entry: u64, code: &str) -> PurchaseRequest {
        PurchaseRequest {
            ticket_count: count,
            referral_code: code.to_string(),
            auto_entry,
            token: "USDC".to_string(),
            wallet_address: wallet(1).to_string(),
        }
    }

    #[tokio::test]
    async fn current_is_lowest_active_id() {
        let fx = fixture(3, 100).await;
        assert_eq!(fx.service.current().await.unwrap().id, fx.raffles[0]);
        assert_eq!(fx.service.active().await.unwrap().len(), 3);

        let empty = fixture(0, 100).await;
        assert!(matches!(
            empty.service.current().await,
            Err(ApiError::NotFound(message)) if message == "No active raffle found"
        ));
        assert!(matches!(
            empty.service.by_id(5).await,
            Err(ApiError::NotFound(message)) if message == "Raffle with ID 5 not found"
        ));
    }

    #[tokio::test]
    async fn purchase_reserves_across_auto_entries() {
        let fx = fixture(3, 100).await;
        let receipt = fx
            .service
            .purchase(&fx.buyer, fx.raffles[0], request(2, 3, "PLATFORM"))
            .await
            .unwrap();
        assert_eq!(receipt.raffle_ids, fx.raffles);
        assert_eq!(receipt.tickets.len(), 6);
        assert_eq!(receipt.ticket_count, 2);
        assert!(receipt.user_referral_code.is_some());
        assert!(receipt.tickets[..2].iter().all(|t| !t.is_auto_enrolled));
        assert!(receipt.tickets[2..].iter().all(|t| t.is_auto_enrolled));
        assert_eq!(
            receipt.tickets.iter().map(|t| t.ticket_number).collect::<Vec<_>>(),
            vec![1, 2, 1, 2, 1, 2]
        );
        assert!(receipt.contract_tx.buy_tx.data.contains("[1,2,3]:2"));

        // Next purchase continues the numbering.
        let again = fx
            .service
            .purchase(&fx.buyer, fx.raffles[1], request(1, 1, "platform"))
            .await
            .unwrap();
        assert_eq!(again.tickets[0].ticket_number, 3);
        assert_eq!(again.user_referral_code, receipt.user_referral_code);

        let (user, code, activity) = fx
            .store
            .run(|db| {
                Ok::<_, StoreError>((
                    db.user_by_wallet(&wallet(1))?,
                    db.referral_code("platform")?,
                    db.wallet_transactions(&wallet(1))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(user.unwrap().total_tickets_purchased, 7);
        assert_eq!(code.unwrap().total_uses, 7);
        assert_eq!(activity.len(), 4);
        assert!(activity
            .iter()
            .all(|tx| tx.kind == TransactionKind::TicketPurchase
                && tx.status == TransactionStatus::Pending));
    }

    #[tokio::test]
    async fn purchase_rejects_bad_requests() {
        let fx = fixture(2, 3).await;
        let raffle = fx.raffles[0];

        let err = fx
            .service
            .purchase(&fx.buyer, raffle, request(1, 1, "missing1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(m) if m == "Invalid referral code"));

        let err = fx
            .service
            .purchase(&fx.buyer, raffle, request(1, 3, "platform"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::BadRequest(m) if m == "Not enough future raffles available for 3 auto-entries"
        ));

        let err = fx
            .service
            .purchase(&fx.buyer, raffle, request(4, 1, "platform"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::BadRequest(m) if m == format!("Only 3 tickets available for raffle {raffle}")
        ));

        let err = fx
            .service
            .purchase(&fx.buyer, raffle, request(0, 1, "platform"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let mut foreign = request(1, 1, "platform");
        foreign.wallet_address = wallet(2).to_string();
        let err = fx.service.purchase(&fx.buyer, raffle, foreign).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let mut token = request(1, 1, "platform");
        token.token = "DAI".into();
        let err = fx.service.purchase(&fx.buyer, raffle, token).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = fx
            .service
            .purchase(&fx.buyer, 99, request(1, 1, "platform"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let now = Utc::now();
        fx.store
            .run(move |db| db.complete_raffle(raffle, false, now))
            .await
            .unwrap();
        let err = fx
            .service
            .purchase(&fx.buyer, raffle, request(1, 1, "platform"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(m) if m == "Raffle is not active"));
    }

    #[tokio::test]
    async fn purchase_requires_lotteries_on_chain() {
        let fx = fixture(1, 10).await;
        let now = Utc::now();
        let template = RaffleTemplate::default();
        let orphan = fx
            .store
            .run(move |db| {
                let raffle = db.insert_raffle(&template.pooled(now), now)?;
                db.activate_raffle(raffle.id, now)?;
                Ok::<_, StoreError>(raffle.id)
            })
            .await
            .unwrap();
        let err = fx
            .service
            .purchase(&fx.buyer, orphan, request(1, 1, "platform"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Chain(odds_contract::Error::LotteryMissing(_))));
        let sold = fx
            .store
            .run(move |db| db.raffle(orphan))
            .await
            .unwrap()
            .unwrap()
            .total_tickets;
        assert_eq!(sold, 0);
        assert!(fx.chain.lottery(orphan as u64).is_none());
    }

    #[tokio::test]
    async fn referral_owner_is_credited() {
        let fx = fixture(1, 100).await;
        let now = Utc::now();
        let referrer = fx
            .store
            .run(move |db| {
                let referrer = db.insert_user(&wallet(7), now)?;
                db.insert_referral_code("friend01", Some(referrer.id), false, now)?;
                Ok::<_, StoreError>(referrer.id)
            })
            .await
            .unwrap();

        fx.service
            .purchase(&fx.buyer, fx.raffles[0], request(20, 1, "friend01"))
            .await
            .unwrap();

        let (referrer, code, referrals, payouts) = fx
            .store
            .run(move |db| {
                Ok::<_, StoreError>((
                    db.user(referrer)?,
                    db.referral_code("friend01")?,
                    db.count_referrals(referrer)?,
                    db.wallet_transactions(&wallet(7))?,
                ))
            })
            .await
            .unwrap();
        // 20 USDC spent at 50/1000 pays 1 USDC.
        let referrer = referrer.unwrap();
        assert_eq!(referrer.total_referral_earnings, Usdc::from_units(1));
        assert_eq!(referrer.referral_points, 20);
        assert_eq!(code.unwrap().total_rewards, Usdc::from_units(1));
        assert_eq!(referrals, 1);
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].kind, TransactionKind::ReferralReward);
    }

    #[tokio::test]
    async fn auto_enroll_records_pending_order() {
        let fx = fixture(0, 10).await;
        let receipt = fx
            .service
            .auto_enroll(AutoEnrollRequest {
                wallet_address: wallet(9).to_string(),
                end_date: Utc::now(),
                ticket_count: 3,
                token: "usdt".into(),
            })
            .await
            .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.transaction.amount, Usdc::from_units(3));

        let activity = fx.service.user_activity(wallet(9).as_str()).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].kind, TransactionKind::AutoEnroll);
        assert_eq!(activity[0].status, TransactionStatus::Pending);

        let stats = fx.service.user_activity_stats(wallet(9).as_str()).await.unwrap();
        assert_eq!(stats.total_transactions, 1);
        assert_eq!(stats.total_spent, Usdc::ZERO);
        assert_eq!(stats.by_type.get(&TransactionKind::AutoEnroll), Some(&1));
        assert!(fx.service.user_activity("not-a-wallet").await.is_err());
    }

    #[tokio::test]
    async fn winner_requires_settled_raffle() {
        let fx = fixture(1, 10).await;
        let raffle = fx.raffles[0];
        fx.service
            .purchase(&fx.buyer, raffle, request(2, 1, "platform"))
            .await
            .unwrap();

        assert!(matches!(
            fx.service.raffle_winner(raffle).await,
            Err(ApiError::NotFound(m)) if m == format!("Completed raffle with ID {raffle} not found")
        ));

        let now = Utc::now();
        fx.store
            .run(move |db| {
                crate::reconciler::apply_lottery_ended(
                    db,
                    &LotteryOutcome {
                        lottery_id: raffle as u64,
                        winning_ticket_ids: vec![2],
                        second_place_ticket_ids: vec![1],
                        prize_pool: Usdc::from_units(2),
                        platform_cut: Usdc::from_micros(100_000),
                        distributed_pool: Usdc::from_micros(1_900_000),
                        total_tickets_sold: 2,
                        first_place_prize_per_ticket: Usdc::from_units(1),
                        second_place_prize_per_ticket: Usdc::from_micros(900_000),
                    },
                    "0xended",
                    now,
                )
            })
            .await
            .unwrap();

        let winner = fx.service.raffle_winner(raffle).await.unwrap();
        assert_eq!(winner.ticket_number, 2);
        assert_eq!(winner.winner_address, wallet(1));
        assert_eq!(winner.prize_amount, Usdc::from_units(1));

        let tickets = fx.service.raffle_tickets(raffle, Page::default()).await.unwrap();
        assert_eq!(tickets.total, 2);
        assert!(tickets.tickets.iter().all(|ticket| ticket.is_winning));
        let past = fx.service.past(Page::default()).await.unwrap();
        assert_eq!(past.total, 1);
        assert_eq!(past.raffles[0].winning_ticket, Some(winner.winning_ticket_id));
    }

    #[tokio::test]
    async fn chain_purchases_complete_reservations() {
        let fx = fixture(1, 10).await;
        let raffle = fx.raffles[0];
        fx.service
            .purchase(&fx.buyer, raffle, request(1, 1, "platform"))
            .await
            .unwrap();
        let purchase = TicketPurchase {
            lottery_id: raffle as u64,
            buyer: wallet(1),
            first_ticket: 1,
            count: 1,
            transaction_hash: "0xbuy".into(),
            nonce: Some(3),
            to: Some(fx.chain.contract_address()),
        };
        let now = Utc::now();
        let applied = fx
            .store
            .run({
                let purchase = purchase.clone();
                move |db| {
                    Ok::<_, StoreError>((
                        apply_ticket_purchase(db, &purchase, now)?,
                        apply_ticket_purchase(db, &purchase, now)?,
                    ))
                }
            })
            .await
            .unwrap();
        assert_eq!(applied, (PurchaseApplied::Recorded, PurchaseApplied::Duplicate));

        let stats = fx.service.user_activity_stats(wallet(1).as_str()).await.unwrap();
        assert_eq!(stats.by_type.get(&TransactionKind::TicketPurchase), Some(&1));
        assert_eq!(stats.total_spent, Usdc::from_units(1));
        assert_eq!(stats.tickets_purchased, 1);
    }

    #[tokio::test]
    async fn purchase_conflicts_when_targets_change() {
        let fx = fixture(3, 10).await;
        let gate = fx.chain.hold_purchases();
        let pending = tokio::spawn({
            let (service, buyer, first) = (fx.service.clone(), fx.buyer.clone(), fx.raffles[0]);
            async move { service.purchase(&buyer, first, request(1, 2, "platform")).await }
        });

        // Close the second target while the contract calls are being built.
        gate.entered().await;
        let closed = fx.raffles[1];
        let now = Utc::now();
        fx.store
            .run(move |db| db.complete_raffle(closed, false, now))
            .await
            .unwrap();
        gate.release();

        assert!(matches!(
            pending.await.unwrap(),
            Err(ApiError::Conflict(_))
        ));
        let (tickets, txs) = fx
            .store
            .run(|db| {
                Ok::<_, StoreError>((
                    db.count_tickets(TicketFilter::All)?,
                    db.wallet_transactions(&wallet(1))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(tickets, 0);
        assert!(txs.is_empty());
    }

    #[tokio::test]
    async fn concurrent_purchases_share_last_ticket() {
        let fx = fixture(1, 1).await;
        let now = Utc::now();
        let rival = fx
            .store
            .run(move |db| db.insert_user(&wallet(2), now))
            .await
            .unwrap();
        let rival = AuthUser {
            id: rival.id,
            wallet_address: rival.wallet_address,
        };
        let rival_request = PurchaseRequest {
            wallet_address: wallet(2).to_string(),
            ..request(1, 1, "platform")
        };

        let raffle = fx.raffles[0];
        let (first, second) = tokio::join!(
            fx.service.purchase(&fx.buyer, raffle, request(1, 1, "platform")),
            fx.service.purchase(&rival, raffle, rival_request),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results.iter().any(|result| matches!(
            result,
            Err(ApiError::BadRequest(_)) | Err(ApiError::Conflict(_))
        )));

        let (stored, tickets) = fx
            .store
            .run(move |db| {
                Ok::<_, StoreError>((db.raffle(raffle)?, db.count_tickets(TicketFilter::Raffle(raffle))?))
            })
            .await
            .unwrap();
        assert_eq!(stored.unwrap().total_tickets, 1);
        assert_eq!(tickets, 1);
    }

    #[tokio::test]
    async fn status_updates_follow_lifecycle() {
        let fx = fixture(1, 10).await;
        let raffle = fx.raffles[0];
        let summary = fx
            .service
            .update_raffle(raffle, RaffleStatus::Completed, Some(false))
            .await
            .unwrap();
        assert_eq!(summary.status, RaffleStatus::Completed);
        assert!(matches!(
            fx.service.update_raffle(raffle, RaffleStatus::Active, None).await,
            Err(ApiError::Conflict(_))
        ));
    }
}
