//! Lottery events decoded from contract logs.

use crate::bindings::{
    LotteryCreatedFilter, LotteryEndedFilter, OddsLotteryEvents, TicketPurchasedFilter,
};
use crate::{to_wallet, Error, Result};
use ethers::contract::{EthEvent, EthLogDecode};
use ethers::types::{Log, H256, U256};
use odds_types::{Usdc, WalletAddress};
use serde::Serialize;

/// `topic0` of `TicketPurchased(uint256,address,uint256)`.
pub fn ticket_purchased_topic() -> H256 {
    TicketPurchasedFilter::signature()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotteryOutcome {
    pub lottery_id: u64,
    pub winning_ticket_ids: Vec<u64>,
    pub second_place_ticket_ids: Vec<u64>,
    pub prize_pool: Usdc,
    pub platform_cut: Usdc,
    pub distributed_pool: Usdc,
    pub total_tickets_sold: u64,
    pub first_place_prize_per_ticket: Usdc,
    pub second_place_prize_per_ticket: Usdc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LotteryEvent {
    LotteryCreated {
        lottery_id: u64,
        max_tickets: u64,
    },
    TicketPurchased {
        lottery_id: u64,
        buyer: WalletAddress,
        ticket_id: u64,
    },
    LotteryEnded(LotteryOutcome),
}

impl LotteryEvent {
    pub fn lottery_id(&self) -> u64 {
        match self {
            LotteryEvent::LotteryCreated { lottery_id, .. }
            | LotteryEvent::TicketPurchased { lottery_id, .. } => *lottery_id,
            LotteryEvent::LotteryEnded(outcome) => outcome.lottery_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LotteryEvent::LotteryCreated { .. } => "LotteryCreated",
            LotteryEvent::TicketPurchased { .. } => "TicketPurchased",
            LotteryEvent::LotteryEnded(_) => "LotteryEnded",
        }
    }
}

/// Where an event was observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: String,
    /// Sender of the enclosing transaction, when the source reports it.
    pub from: Option<WalletAddress>,
    pub to: Option<WalletAddress>,
    pub nonce: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObservedEvent {
    pub event: LotteryEvent,
    pub meta: EventMeta,
}

/// Decode a raw contract log. Returns `Ok(None)` for logs from other events.
pub fn decode_log(log: &Log) -> Result<Option<ObservedEvent>> {
    let Ok(decoded) = OddsLotteryEvents::decode_log(&log.clone().into()) else {
        return Ok(None);
    };
    let event = match decoded {
        OddsLotteryEvents::LotteryCreatedFilter(LotteryCreatedFilter {
            lottery_id,
            max_tickets,
        }) => LotteryEvent::LotteryCreated {
            lottery_id: to_u64(lottery_id, "lotteryId")?,
            max_tickets: to_u64(max_tickets, "maxTickets")?,
        },
        OddsLotteryEvents::TicketPurchasedFilter(TicketPurchasedFilter {
            lottery_id,
            buyer,
            ticket_id,
        }) => LotteryEvent::TicketPurchased {
            lottery_id: to_u64(lottery_id, "lotteryId")?,
            buyer: to_wallet(buyer),
            ticket_id: to_u64(ticket_id, "ticketId")?,
        },
        OddsLotteryEvents::LotteryEndedFilter(ended) => {
            LotteryEvent::LotteryEnded(outcome_from_filter(ended)?)
        }
    };
    let meta = EventMeta {
        block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
        log_index: log.log_index.map(|n| n.low_u64()).unwrap_or_default(),
        transaction_hash: log
            .transaction_hash
            .map(|hash| format!("{hash:#x}"))
            .unwrap_or_default(),
        from: None,
        to: None,
        nonce: None,
    };
    Ok(Some(ObservedEvent { event, meta }))
}

pub(crate) fn outcome_from_filter(ended: LotteryEndedFilter) -> Result<LotteryOutcome> {
    Ok(LotteryOutcome {
        lottery_id: to_u64(ended.lottery_id, "lotteryId")?,
        winning_ticket_ids: to_u64_vec(ended.winning_ticket_ids, "winningTicketIds")?,
        second_place_ticket_ids: to_u64_vec(
            ended.second_place_ticket_ids,
            "secondPlaceTicketIds",
        )?,
        prize_pool: to_usdc(ended.prize_pool, "prizePool")?,
        platform_cut: to_usdc(ended.platform_cut, "platformCut")?,
        distributed_pool: to_usdc(ended.distributed_pool, "distributedPool")?,
        total_tickets_sold: to_u64(ended.total_tickets_sold, "totalTicketsSold")?,
        first_place_prize_per_ticket: to_usdc(
            ended.first_place_prize_per_ticket,
            "firstPlacePrizePerTicket",
        )?,
        second_place_prize_per_ticket: to_usdc(
            ended.second_place_prize_per_ticket,
            "secondPlacePrizePerTicket",
        )?,
    })
}

pub(crate) fn to_u64(value: U256, field: &str) -> Result<u64> {
    if value.bits() > 64 {
        return Err(Error::InvalidInput(format!("{field} does not fit in u64: {value}")));
    }
    Ok(value.low_u64())
}

fn to_u64_vec(values: Vec<U256>, field: &str) -> Result<Vec<u64>> {
    values.into_iter().map(|value| to_u64(value, field)).collect()
}

/// Token amounts are already 6-decimal integers on-chain.
fn to_usdc(value: U256, field: &str) -> Result<Usdc> {
    to_u64(value, field).map(Usdc::from_micros)
}
