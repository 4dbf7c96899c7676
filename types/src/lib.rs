//! Domain types for the odds raffle backend.
//!
//! Everything here is storage- and transport-agnostic: the server maps these
//! records to SQL rows and JSON, and the contract crate maps them to chain calls.

pub mod amount;
pub mod raffle;
pub mod referral;
pub mod ticket;
pub mod transaction;
pub mod user;
pub mod wallet;

pub use amount::Usdc;
pub use raffle::{daily_window, NewRaffle, Raffle, RaffleStatus, RaffleTemplate};
pub use referral::{
    generate_referral_code, is_valid_referral_code, LeaderboardEntry, LeaderboardSort,
    Referral, ReferralCode, SortOrder, REFERRAL_CODE_ALPHABET, REFERRAL_CODE_LENGTH,
};
pub use ticket::{NewTicket, Ticket, TicketGroup};
pub use transaction::{NewTransaction, Transaction, TransactionKind, TransactionStatus};
pub use user::User;
pub use wallet::WalletAddress;

use thiserror::Error;

/// Errors raised while parsing domain values from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid wallet address: {0}")]
    WalletAddress(String),
    #[error("invalid amount: {0}")]
    Amount(String),
    #[error("amount overflow")]
    AmountOverflow,
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Convert epoch milliseconds into a UTC timestamp.
pub fn from_millis(ms: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(ms)
}
