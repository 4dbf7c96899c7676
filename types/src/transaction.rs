use crate::{ParseError, Usdc, WalletAddress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    TicketPurchase,
    PrizeDistribution,
    ReferralReward,
    PlatformFee,
    AutoEnroll,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 5] = [
        TransactionKind::TicketPurchase,
        TransactionKind::PrizeDistribution,
        TransactionKind::ReferralReward,
        TransactionKind::PlatformFee,
        TransactionKind::AutoEnroll,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::TicketPurchase => "TICKET_PURCHASE",
            TransactionKind::PrizeDistribution => "PRIZE_DISTRIBUTION",
            TransactionKind::ReferralReward => "REFERRAL_REWARD",
            TransactionKind::PlatformFee => "PLATFORM_FEE",
            TransactionKind::AutoEnroll => "AUTO_ENROLL",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseError::UnknownVariant {
                kind: "transaction type",
                value: s.to_string(),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(ParseError::UnknownVariant {
                kind: "transaction status",
                value: other.to_string(),
            }),
        }
    }
}

/// Ledger entry mirroring a money movement, on-chain or pending.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: Usdc,
    /// Empty until the movement is observed on-chain.
    pub transaction_hash: String,
    pub description: Option<String>,
    pub from_address: Option<WalletAddress>,
    pub to_address: Option<WalletAddress>,
    pub raffle_id: Option<i64>,
    pub ticket_id: Option<i64>,
    pub nonce: Option<u64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: Usdc,
    pub transaction_hash: String,
    pub description: Option<String>,
    pub from_address: Option<WalletAddress>,
    pub to_address: Option<WalletAddress>,
    pub raffle_id: Option<i64>,
    pub ticket_id: Option<i64>,
    pub nonce: Option<u64>,
    pub metadata: Option<serde_json::Value>,
}

impl NewTransaction {
    pub fn new(kind: TransactionKind, status: TransactionStatus, amount: Usdc) -> Self {
        Self {
            kind,
            status,
            amount,
            transaction_hash: String::new(),
            description: None,
            from_address: None,
            to_address: None,
            raffle_id: None,
            ticket_id: None,
            nonce: None,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_wire_names() {
        for kind in TransactionKind::ALL {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
        assert!("REFUND".parse::<TransactionKind>().is_err());
    }
}
