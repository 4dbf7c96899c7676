use crate::{Usdc, WalletAddress};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A participant, keyed by wallet address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub wallet_address: WalletAddress,
    pub username: Option<String>,
    pub email: Option<String>,
    pub total_tickets_purchased: u64,
    pub total_raffles_won: u64,
    pub total_prize_won: Usdc,
    pub total_referral_earnings: Usdc,
    pub referral_points: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
