use crate::error::ApiError;
use crate::store::{Db, Store, StoreError};
use chrono::{DateTime, Utc};
use odds_types::{
    generate_referral_code, is_valid_referral_code, LeaderboardEntry, LeaderboardSort,
    NewTransaction, ReferralCode, SortOrder, TransactionKind, TransactionStatus, Usdc,
    WalletAddress,
};
use serde_json::json;
use tracing::info;

/// Attempts at drawing an unused code before giving up.
const CODE_ATTEMPTS: usize = 16;

/// Return `user_id`'s referral code, minting one on first use.
pub(crate) fn ensure_user_code(
    db: &mut Db<'_>,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<ReferralCode, ApiError> {
    if let Some(code) = db.referral_code_by_owner(user_id)? {
        return Ok(code);
    }
    let mut rng = rand::thread_rng();
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_referral_code(&mut rng);
        if db.referral_code(&code)?.is_none() {
            return Ok(db.insert_referral_code(&code, Some(user_id), false, now)?);
        }
    }
    Err(ApiError::Conflict(
        "Could not allocate a unique referral code".to_string(),
    ))
}

/// Tickets bought with a referral code in one purchase.
pub(crate) struct ReferralUse<'a> {
    pub buyer_id: i64,
    pub buyer_wallet: &'a WalletAddress,
    pub raffle_id: i64,
    pub tickets: u64,
    pub reward: Usdc,
    pub contract: &'a WalletAddress,
}

/// Count a purchase against `code`. When another user owns the code they earn
/// `reward`, the referral link is upserted and a pending payout is recorded.
pub(crate) fn record_use(
    db: &mut Db<'_>,
    code: &ReferralCode,
    usage: &ReferralUse<'_>,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let referrer = match code.owner_id {
        Some(owner) if owner != usage.buyer_id => db.user(owner)?,
        _ => None,
    };
    let Some(referrer) = referrer else {
        db.record_referral_use(code.id, usage.tickets, Usdc::ZERO, now)?;
        return Ok(());
    };
    db.record_referral_use(code.id, usage.tickets, usage.reward, now)?;
    db.add_referral_earnings(referrer.id, usage.reward, usage.tickets, now)?;
    db.upsert_referral(referrer.id, usage.buyer_wallet, usage.tickets, now)?;

    let mut payout =
        NewTransaction::new(TransactionKind::ReferralReward, TransactionStatus::Pending, usage.reward);
    payout.description = Some(format!("Referral reward for code {}", code.code));
    payout.from_address = Some(usage.contract.clone());
    payout.to_address = Some(referrer.wallet_address.clone());
    payout.raffle_id = Some(usage.raffle_id);
    payout.metadata = Some(json!({
        "referralCode": code.code,
        "buyer": usage.buyer_wallet,
        "tickets": usage.tickets,
    }));
    db.insert_transaction(&payout, now)?;
    Ok(())
}

/// Generate `count` fresh platform codes.
pub fn generate_platform_codes(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| generate_referral_code(&mut rng)).collect()
}

#[derive(Clone)]
pub struct ReferralService {
    store: Store,
    leaderboard_size: u64,
}

impl ReferralService {
    pub fn new(store: Store, leaderboard_size: u64) -> Self {
        Self {
            store,
            leaderboard_size,
        }
    }

    /// Insert platform codes that do not exist yet. Returns every requested code.
    pub async fn create_platform_codes(
        &self,
        codes: Vec<String>,
    ) -> Result<Vec<ReferralCode>, ApiError> {
        let codes = codes
            .into_iter()
            .map(|code| code.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        if let Some(bad) = codes.iter().find(|code| !is_valid_referral_code(code)) {
            return Err(ApiError::bad_request(format!(
                "Invalid referral code format: {bad}"
            )));
        }

        let now = Utc::now();
        let (codes, created) = self
            .store
            .run(move |db| {
                let mut out = Vec::with_capacity(codes.len());
                let mut created = 0usize;
                for code in codes {
                    match db.referral_code(&code)? {
                        Some(existing) => out.push(existing),
                        None => {
                            out.push(db.insert_referral_code(&code, None, true, now)?);
                            created += 1;
                        }
                    }
                }
                Ok::<_, ApiError>((out, created))
            })
            .await?;
        info!(created, total = codes.len(), "platform referral codes ensured");
        Ok(codes)
    }

    pub async fn generate_user_code(&self, user_id: i64) -> Result<ReferralCode, ApiError> {
        let now = Utc::now();
        self.store
            .run(move |db| {
                if db.user(user_id)?.is_none() {
                    return Err(ApiError::not_found(format!(
                        "User with ID {user_id} not found"
                    )));
                }
                ensure_user_code(db, user_id, now)
            })
            .await
    }

    pub async fn validate(&self, code: &str) -> Result<ReferralCode, ApiError> {
        let code = code.trim().to_ascii_lowercase();
        self.store
            .run(move |db| db.referral_code(&code))
            .await?
            .ok_or_else(|| ApiError::bad_request("Invalid referral code"))
    }

    pub async fn user_code(&self, user_id: i64) -> Result<Option<ReferralCode>, ApiError> {
        Ok(self
            .store
            .run(move |db| db.referral_code_by_owner(user_id))
            .await?)
    }

    pub async fn platform_codes(&self) -> Result<Vec<ReferralCode>, ApiError> {
        Ok(self.store.run(|db| db.platform_codes()).await?)
    }

    pub async fn leaderboard(
        &self,
        sort: LeaderboardSort,
        order: SortOrder,
    ) -> Result<Vec<LeaderboardEntry>, ApiError> {
        let limit = self.leaderboard_size;
        Ok(self
            .store
            .run(move |db| db.referral_leaderboard(sort, order, limit))
            .await?)
    }

    /// `None` when the wallet is unknown or owns no code.
    pub async fn user_stats(&self, wallet: &str) -> Result<Option<LeaderboardEntry>, ApiError> {
        let Ok(wallet) = WalletAddress::parse(wallet) else {
            return Ok(None);
        };
        Ok(self
            .store
            .run(move |db| -> Result<_, StoreError> {
                let Some(user) = db.user_by_wallet(&wallet)? else {
                    return Ok(None);
                };
                Ok(db.referral_code_by_owner(user.id)?.map(|code| LeaderboardEntry {
                    wallet: user.wallet_address,
                    referees: code.total_uses,
                    earnings: code.total_rewards,
                    referral_code: code.code,
                }))
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(byte: u8) -> WalletAddress {
        WalletAddress::from_bytes([byte; 20])
    }

    #[tokio::test]
    async fn platform_codes_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let service = ReferralService::new(store, 10);
        let first = service
            .create_platform_codes(vec!["PLATFORM".into(), "odds0001".into()])
            .await
            .unwrap();
        let second = service
            .create_platform_codes(vec!["platform".into()])
            .await
            .unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert!(first.iter().all(|code| code.is_platform_code));
        assert_eq!(service.platform_codes().await.unwrap().len(), 2);

        let err = service
            .create_platform_codes(vec!["bad-code".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn user_codes_are_stable() {
        let store = Store::open_in_memory().unwrap();
        let user = store
            .run(|db| db.insert_user(&wallet(1), Utc::now()))
            .await
            .unwrap();
        let service = ReferralService::new(store, 10);
        let first = service.generate_user_code(user.id).await.unwrap();
        let second = service.generate_user_code(user.id).await.unwrap();
        assert_eq!(first, second);
        assert!(is_valid_referral_code(&first.code));
        assert_eq!(service.user_code(user.id).await.unwrap(), Some(first));
        assert!(matches!(
            service.generate_user_code(999).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn validation_is_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        let service = ReferralService::new(store, 10);
        service
            .create_platform_codes(vec!["abcd1234".into()])
            .await
            .unwrap();
        assert!(service.validate("ABCD1234").await.is_ok());
        assert!(matches!(
            service.validate("zzzz9999").await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn uses_credit_other_owners_only() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let contract = wallet(0xc0);
        let (code, owner, referrer_txs) = store
            .run(move |db| {
                let owner = db.insert_user(&wallet(1), now)?;
                let buyer = db.insert_user(&wallet(2), now)?;
                let code = db.insert_referral_code("owner001", Some(owner.id), false, now)?;
                let usage = ReferralUse {
                    buyer_id: buyer.id,
                    buyer_wallet: &buyer.wallet_address,
                    raffle_id: 7,
                    tickets: 3,
                    reward: Usdc::from_micros(150_000),
                    contract: &contract,
                };
                record_use(db, &code, &usage, now)?;
                let own = ReferralUse {
                    buyer_id: owner.id,
                    buyer_wallet: &owner.wallet_address,
                    ..usage
                };
                record_use(db, &code, &own, now)?;
                Ok::<_, ApiError>((
                    db.referral_code_by_id(code.id)?,
                    db.user(owner.id)?,
                    db.wallet_transactions(&wallet(1))?,
                ))
            })
            .await
            .unwrap();
        let code = code.unwrap();
        assert_eq!(code.total_uses, 6);
        assert_eq!(code.total_rewards, Usdc::from_micros(150_000));
        assert_eq!(owner.unwrap().total_referral_earnings, Usdc::from_micros(150_000));
        assert_eq!(referrer_txs.len(), 1);
        assert_eq!(referrer_txs[0].kind, TransactionKind::ReferralReward);
        assert_eq!(referrer_txs[0].status, TransactionStatus::Pending);
        assert_eq!(referrer_txs[0].raffle_id, Some(7));
    }

    #[tokio::test]
    async fn leaderboard_skips_platform_codes() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .run(move |db| {
                db.insert_referral_code("platform", None, true, now)?;
                for (byte, uses, reward) in [(1u8, 5u64, 3u64), (2, 9, 1), (3, 1, 7)] {
                    let user = db.insert_user(&wallet(byte), now)?;
                    let code = db.insert_referral_code(
                        &format!("user000{byte}"),
                        Some(user.id),
                        false,
                        now,
                    )?;
                    db.record_referral_use(code.id, uses, Usdc::from_units(reward), now)?;
                }
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        let service = ReferralService::new(store, 2);

        let by_earnings = service
            .leaderboard(LeaderboardSort::Earnings, SortOrder::Desc)
            .await
            .unwrap();
        assert_eq!(
            by_earnings
                .iter()
                .map(|entry| entry.referral_code.as_str())
                .collect::<Vec<_>>(),
            vec!["user0003", "user0001"]
        );

        let by_referees = service
            .leaderboard(LeaderboardSort::Referees, SortOrder::Asc)
            .await
            .unwrap();
        assert_eq!(by_referees[0].referees, 1);

        let stats = service
            .user_stats(wallet(2).as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.referees, 9);
        assert_eq!(service.user_stats("nobody").await.unwrap(), None);
        assert_eq!(service.user_stats(wallet(9).as_str()).await.unwrap(), None);
    }
}
