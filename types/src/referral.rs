//! Referral codes and attribution.

use crate::{ParseError, Usdc, WalletAddress};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const REFERRAL_CODE_LENGTH: usize = 8;
pub const REFERRAL_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Draw a fresh referral code. Uniqueness is the caller's concern.
pub fn generate_referral_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..REFERRAL_CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..REFERRAL_CODE_ALPHABET.len());
            REFERRAL_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Matches `^[a-z0-9]{8}$`.
pub fn is_valid_referral_code(code: &str) -> bool {
    code.len() == REFERRAL_CODE_LENGTH
        && code
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCode {
    pub id: i64,
    pub code: String,
    pub is_platform_code: bool,
    pub owner_id: Option<i64>,
    pub total_uses: u64,
    pub total_rewards: Usdc,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A referrer's relationship with one referred wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_wallet_address: WalletAddress,
    pub points_earned: u64,
    pub is_active: bool,
    pub last_activity_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardSort {
    Referees,
    #[default]
    Earnings,
}

impl FromStr for LeaderboardSort {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "referees" => Ok(LeaderboardSort::Referees),
            "earnings" => Ok(LeaderboardSort::Earnings),
            other => Err(ParseError::UnknownVariant {
                kind: "leaderboard sort",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(ParseError::UnknownVariant {
                kind: "sort order",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub wallet: WalletAddress,
    pub referees: u64,
    pub earnings: Usdc,
    pub referral_code: String,
}
