//! Integration with the `OddsLottery` contract.
//!
//! The [LotteryChain] trait is the seam the server programs against. [LotteryClient]
//! implements it over JSON-RPC with the contract owner's key, and `mocks::MockChain`
//! (feature `mocks`) implements it in memory. [listener::EventListener] turns confirmed
//! contract logs into [LotteryEvent]s for reconciliation.

use ethers::types::Address;
use odds_types::WalletAddress;
use serde::Serialize;
use std::future::Future;
use thiserror::Error;

mod bindings;
pub mod calls;
pub mod client;
pub mod events;
pub mod listener;
pub mod revert;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use bindings::{Erc20, OddsLottery, OddsLotteryEvents};
pub use calls::{PurchaseCalls, UnsignedTx};
pub use client::{ChainConfig, LotteryClient};
pub use events::{
    decode_log, ticket_purchased_topic, EventMeta, LotteryEvent, LotteryOutcome, ObservedEvent,
};
pub use listener::{Backoff, Cursor, EventListener, ListenerConfig, ListenerUpdate};
pub use revert::LotteryRevert;

/// Largest lottery the contract accepts.
pub const MAX_TICKETS: u64 = 10_000;

#[derive(Error, Debug)]
pub enum Error {
    #[error("provider error: {0}")]
    Provider(#[from] ethers::providers::ProviderError),
    #[error("contract reverted: {0}")]
    Reverted(LotteryRevert),
    #[error("contract reverted with unknown data: 0x{0}")]
    UnknownRevert(String),
    #[error("contract call failed: {0}")]
    Contract(String),
    #[error("wallet {wallet:#x} is not the contract owner ({owner:#x})")]
    NotOwner { wallet: Address, owner: Address },
    #[error("invalid max tickets {0}: must be between 1 and {MAX_TICKETS}")]
    InvalidMaxTickets(u64),
    #[error("invalid lottery id: must be greater than 0")]
    InvalidLotteryId,
    #[error("lottery {0} already exists")]
    LotteryExists(u64),
    #[error("lottery {0} does not exist")]
    LotteryMissing(u64),
    #[error("lottery {0} is not active")]
    LotteryInactive(u64),
    #[error("lottery {0} has already been drawn")]
    LotteryDrawn(u64),
    #[error("transaction {0} was dropped before a receipt was available")]
    MissingReceipt(String),
    #[error("transaction {0} failed on-chain")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the contract rejected the call with `revert`.
    pub fn revert(&self) -> Option<LotteryRevert> {
        match self {
            Error::Reverted(revert) => Some(*revert),
            _ => None,
        }
    }
}

/// On-chain view of one lottery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotteryInfo {
    pub id: u64,
    pub max_tickets: u64,
    pub tickets_sold: u64,
    pub is_active: bool,
    pub is_drawn: bool,
    pub created_at: u64,
}

/// Operations the raffle backend needs from the lottery contract.
pub trait LotteryChain: Clone + Send + Sync + 'static {
    /// Create lottery `lottery_id` with `max_tickets` capacity. Returns the tx hash.
    fn create_lottery(
        &self,
        lottery_id: u64,
        max_tickets: u64,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Close sales and draw winners. Returns the tx hash.
    fn end_lottery(&self, lottery_id: u64) -> impl Future<Output = Result<String>> + Send;

    /// `None` when the lottery does not exist.
    fn get_lottery(
        &self,
        lottery_id: u64,
    ) -> impl Future<Output = Result<Option<LotteryInfo>>> + Send;

    /// Build the unsigned `approve` + `buyTickets` calls the buyer signs.
    fn build_purchase(
        &self,
        buyer: WalletAddress,
        lottery_ids: Vec<u64>,
        ticket_count: u64,
    ) -> impl Future<Output = Result<PurchaseCalls>> + Send;

    fn contract_address(&self) -> WalletAddress;
}

/// Validate arguments shared by every `createLottery` implementation.
pub fn validate_new_lottery(lottery_id: u64, max_tickets: u64) -> Result<()> {
    if lottery_id == 0 {
        return Err(Error::InvalidLotteryId);
    }
    if max_tickets == 0 || max_tickets > MAX_TICKETS {
        return Err(Error::InvalidMaxTickets(max_tickets));
    }
    Ok(())
}

/// Validate arguments shared by every purchase builder.
pub fn validate_purchase(lottery_ids: &[u64], ticket_count: u64) -> Result<()> {
    if lottery_ids.is_empty() {
        return Err(Error::InvalidInput("lottery ids must not be empty".into()));
    }
    if ticket_count == 0 {
        return Err(Error::InvalidInput("ticket count must be greater than 0".into()));
    }
    if lottery_ids.contains(&0) {
        return Err(Error::InvalidLotteryId);
    }
    Ok(())
}

pub(crate) fn to_wallet(address: Address) -> WalletAddress {
    WalletAddress::from_bytes(address.0)
}

pub(crate) fn to_address(wallet: &WalletAddress) -> Result<Address> {
    wallet
        .as_str()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid address {wallet}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lottery_bounds() {
        assert!(validate_new_lottery(1, 1).is_ok());
        assert!(validate_new_lottery(1, MAX_TICKETS).is_ok());
        assert!(matches!(validate_new_lottery(0, 10), Err(Error::InvalidLotteryId)));
        assert!(matches!(
            validate_new_lottery(1, MAX_TICKETS + 1),
            Err(Error::InvalidMaxTickets(_))
        ));
        assert!(matches!(validate_new_lottery(1, 0), Err(Error::InvalidMaxTickets(0))));
    }

    #[test]
    fn purchase_arguments() {
        assert!(validate_purchase(&[1, 2], 3).is_ok());
        assert!(validate_purchase(&[], 3).is_err());
        assert!(validate_purchase(&[1], 0).is_err());
        assert!(matches!(validate_purchase(&[0], 1), Err(Error::InvalidLotteryId)));
    }

    #[test]
    fn address_round_trip_is_lowercase() {
        let address: Address = "0x00000000000000000000000000000000000000aB".parse().unwrap();
        assert_eq!(
            to_wallet(address).as_str(),
            "0x00000000000000000000000000000000000000ab"
        );
    }
}
